use thiserror::Error;

/// Catalog / command-store failures.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    /// Transient errors are worth a bounded retry; everything else fails the
    /// current operation immediately.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            StoreError::Database(sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut)
                | StoreError::Unavailable(_)
        )
    }
}

/// Realtime-bus failures.  The bus is best-effort: publishers log and move
/// on, the subscriber task resubscribes with backoff.
#[derive(Debug, Error)]
pub enum BusError {
    #[error("bus connection error: {0}")]
    Connection(String),
    #[error("bus encoding error: {0}")]
    Encoding(#[from] serde_json::Error),
    #[error("bus closed")]
    Closed,
}

impl From<redis::RedisError> for BusError {
    fn from(e: redis::RedisError) -> Self {
        BusError::Connection(e.to_string())
    }
}
