use uuid::Uuid;

use crate::record::SandboxStatus;

#[derive(Debug, thiserror::Error)]
pub enum LifecycleError {
    #[error("sandbox {0} not found")]
    NotFound(Uuid),

    #[error("sandbox {id} is {status}, not running or paused")]
    NotInitialized { id: Uuid, status: SandboxStatus },

    #[error("sandbox error: {0}")]
    Sandbox(#[from] sandbox::SandboxError),

    #[error("scheduler error: {0}")]
    Queue(#[from] delay_queue::QueueError),

    #[error("record store error: {0}")]
    Store(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl LifecycleError {
    /// Unknown at the controller or at the provider.
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::NotFound(_) => true,
            Self::Sandbox(e) => e.is_not_found(),
            _ => false,
        }
    }

    /// Provider rejected the credentials or configuration; retrying cannot help.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Sandbox(e) if e.is_fatal())
    }
}

pub type Result<T> = std::result::Result<T, LifecycleError>;
