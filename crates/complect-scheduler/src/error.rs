//! Scheduler error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("unknown script: {0}")]
    UnknownScript(String),

    #[error("invalid arguments for {script}: {message}")]
    InvalidArguments { script: String, message: String },

    #[error(transparent)]
    Db(#[from] complect_db::DbError),

    #[error(transparent)]
    Core(#[from] complect_core::Error),

    #[error(transparent)]
    Config(#[from] complect_config::ConfigError),
}

pub type SchedulerResult<T> = std::result::Result<T, SchedulerError>;
