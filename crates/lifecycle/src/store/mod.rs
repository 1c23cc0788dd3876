mod file;
mod memory;

pub use file::FileRecordStore;
pub use memory::MemoryRecordStore;

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::Result;
use crate::record::SandboxRecord;

/// Durable storage for [`SandboxRecord`]s.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Insert a new record. Fails if the id is already taken.
    async fn create(&self, record: &SandboxRecord) -> Result<()>;

    async fn get(&self, id: Uuid) -> Result<Option<SandboxRecord>>;

    /// Replace an existing record. Fails with `NotFound` if it is gone.
    async fn update(&self, record: &SandboxRecord) -> Result<()>;

    /// Remove a record. Returns whether it existed.
    async fn delete(&self, id: Uuid) -> Result<bool>;

    /// Records of one owner, oldest first.
    async fn list_by_owner(&self, owner_id: &str) -> Result<Vec<SandboxRecord>>;
}
