use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::RecordStore;
use crate::error::{LifecycleError, Result};
use crate::record::SandboxRecord;

#[derive(Default)]
pub struct MemoryRecordStore {
    records: Mutex<HashMap<Uuid, SandboxRecord>>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn create(&self, record: &SandboxRecord) -> Result<()> {
        let mut records = self.records.lock().await;
        if records.contains_key(&record.id) {
            return Err(LifecycleError::Store(format!(
                "record {} already exists",
                record.id
            )));
        }
        records.insert(record.id, record.clone());
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<SandboxRecord>> {
        Ok(self.records.lock().await.get(&id).cloned())
    }

    async fn update(&self, record: &SandboxRecord) -> Result<()> {
        let mut records = self.records.lock().await;
        let slot = records
            .get_mut(&record.id)
            .ok_or(LifecycleError::NotFound(record.id))?;
        *slot = record.clone();
        Ok(())
    }

    async fn delete(&self, id: Uuid) -> Result<bool> {
        Ok(self.records.lock().await.remove(&id).is_some())
    }

    async fn list_by_owner(&self, owner_id: &str) -> Result<Vec<SandboxRecord>> {
        let records = self.records.lock().await;
        let mut owned: Vec<SandboxRecord> = records
            .values()
            .filter(|r| r.owner_id == owner_id)
            .cloned()
            .collect();
        owned.sort_by_key(|r| r.created_at);
        Ok(owned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::SandboxStatus;

    #[tokio::test]
    async fn crud_and_list_by_owner() {
        let store = MemoryRecordStore::new();
        let a = SandboxRecord::initializing(Uuid::new_v4(), "memory", "u1", None);
        let b = SandboxRecord::initializing(Uuid::new_v4(), "memory", "u2", None);
        store.create(&a).await.unwrap();
        store.create(&b).await.unwrap();
        assert!(store.create(&a).await.is_err());

        let mut updated = a.clone();
        updated.mark_running(chrono::Utc::now());
        store.update(&updated).await.unwrap();
        assert_eq!(updated.status, SandboxStatus::Running);
        assert!(updated.started_at.is_some());
        assert_eq!(store.get(a.id).await.unwrap(), Some(updated));

        let owned = store.list_by_owner("u1").await.unwrap();
        assert_eq!(owned.len(), 1);
        assert_eq!(owned[0].id, a.id);

        assert!(store.delete(a.id).await.unwrap());
        assert!(!store.delete(a.id).await.unwrap());
        let err = store.update(&a).await.unwrap_err();
        assert!(err.is_not_found());
    }
}
