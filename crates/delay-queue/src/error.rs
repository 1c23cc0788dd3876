#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    /// The store could not be reached. Retried with backoff.
    #[error("store connection error: {0}")]
    Connection(String),

    #[error("store error: {0}")]
    Store(String),

    #[error("message codec error: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl QueueError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Connection(_))
    }
}

impl From<redis::RedisError> for QueueError {
    fn from(e: redis::RedisError) -> Self {
        if e.is_io_error() || e.is_connection_dropped() || e.is_connection_refusal() || e.is_timeout()
        {
            Self::Connection(e.to_string())
        } else {
            Self::Store(e.to_string())
        }
    }
}

pub type Result<T> = std::result::Result<T, QueueError>;
