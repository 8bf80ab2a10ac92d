//! Error types for complect.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Misconfigured target: unknown name, missing container, bad credentials path.
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("{operation} is not supported by the {backend} backend")]
    Unsupported {
        backend: &'static str,
        operation: &'static str,
    },

    /// A helper command that must succeed (mktemp, archive creation) did not.
    #[error("command failed: {0}")]
    CommandFailed(String),

    #[error("remote transport error: {0}")]
    Remote(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Configuration errors are fatal to a task and are never retried.
    pub fn is_configuration(&self) -> bool {
        matches!(self, Error::Configuration(_) | Error::Unsupported { .. })
    }
}

pub type Result<T> = std::result::Result<T, Error>;
