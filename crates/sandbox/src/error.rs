/// Uniform error taxonomy for every provider adapter.
///
/// Adapters translate their SDK or transport errors into one of these
/// variants so callers never depend on a specific provider's error types.
#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    #[error("sandbox not found: {0}")]
    NotFound(String),

    #[error("sandbox not initialized: {0}")]
    NotInitialized(String),

    #[error("authentication failed: {0}")]
    Authentication(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("provider error: {0}")]
    General(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl SandboxError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    /// Credential failures are fatal and never worth retrying.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Authentication(_) | Self::InvalidConfig(_))
    }
}

pub type Result<T> = std::result::Result<T, SandboxError>;
