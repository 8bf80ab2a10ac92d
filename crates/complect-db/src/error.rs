//! Database error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("duplicate: {0}")]
    Duplicate(String),

    #[error("invalid row: {0}")]
    InvalidRow(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
}

impl DbError {
    /// Lost or unusable store connection, as opposed to a bad query or row.
    ///
    /// The poll loop recreates its pool on these and keeps going.
    pub fn is_connection_error(&self) -> bool {
        match self {
            DbError::Database(e) => matches!(
                e,
                sqlx::Error::Io(_)
                    | sqlx::Error::Tls(_)
                    | sqlx::Error::Protocol(_)
                    | sqlx::Error::PoolTimedOut
                    | sqlx::Error::PoolClosed
                    | sqlx::Error::WorkerCrashed
            ),
            _ => false,
        }
    }
}

pub type DbResult<T> = std::result::Result<T, DbError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_error_classification() {
        assert!(DbError::Database(sqlx::Error::PoolTimedOut).is_connection_error());
        assert!(DbError::Database(sqlx::Error::PoolClosed).is_connection_error());
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");
        assert!(DbError::Database(sqlx::Error::Io(io)).is_connection_error());

        assert!(!DbError::Database(sqlx::Error::RowNotFound).is_connection_error());
        assert!(!DbError::NotFound("task".to_string()).is_connection_error());
    }
}
