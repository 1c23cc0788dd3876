use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::warn;
use uuid::Uuid;

use super::RecordStore;
use crate::error::{LifecycleError, Result};
use crate::record::SandboxRecord;

/// One JSON file per record under a directory. Writes go to a temp file in
/// the same directory and are renamed into place, so readers never see a
/// partial record.
pub struct FileRecordStore {
    dir: PathBuf,
}

impl FileRecordStore {
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path(&self, id: Uuid) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }

    async fn read(path: &Path) -> Result<Option<SandboxRecord>> {
        let content = match tokio::fs::read_to_string(path).await {
            Ok(c) => c,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        serde_json::from_str(&content)
            .map(Some)
            .map_err(|e| LifecycleError::Store(format!("parse {}: {e}", path.display())))
    }

    async fn write(&self, record: &SandboxRecord) -> Result<()> {
        let json = serde_json::to_string_pretty(record)
            .map_err(|e| LifecycleError::Store(format!("serialize {}: {e}", record.id)))?;
        let path = self.path(record.id);
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, json.as_bytes()).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }
}

#[async_trait]
impl RecordStore for FileRecordStore {
    async fn create(&self, record: &SandboxRecord) -> Result<()> {
        if tokio::fs::try_exists(self.path(record.id)).await? {
            return Err(LifecycleError::Store(format!(
                "record {} already exists",
                record.id
            )));
        }
        self.write(record).await
    }

    async fn get(&self, id: Uuid) -> Result<Option<SandboxRecord>> {
        Self::read(&self.path(id)).await
    }

    async fn update(&self, record: &SandboxRecord) -> Result<()> {
        if !tokio::fs::try_exists(self.path(record.id)).await? {
            return Err(LifecycleError::NotFound(record.id));
        }
        self.write(record).await
    }

    async fn delete(&self, id: Uuid) -> Result<bool> {
        match tokio::fs::remove_file(self.path(id)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn list_by_owner(&self, owner_id: &str) -> Result<Vec<SandboxRecord>> {
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        let mut owned = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().is_none_or(|ext| ext != "json") {
                continue;
            }
            match Self::read(&path).await {
                Ok(Some(record)) if record.owner_id == owner_id => owned.push(record),
                Ok(_) => {}
                Err(e) => warn!(path = %path.display(), error = %e, "skipping unreadable record"),
            }
        }
        owned.sort_by_key(|r| r.created_at);
        Ok(owned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::SandboxStatus;

    #[tokio::test]
    async fn records_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let record = SandboxRecord::initializing(Uuid::new_v4(), "memory", "u1", Some("base"));
        {
            let store = FileRecordStore::open(dir.path()).await.unwrap();
            store.create(&record).await.unwrap();
            let mut running = record.clone();
            running.mark_running(chrono::Utc::now());
            store.update(&running).await.unwrap();
        }

        let store = FileRecordStore::open(dir.path()).await.unwrap();
        let loaded = store.get(record.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, SandboxStatus::Running);
        assert_eq!(loaded.template_id.as_deref(), Some("base"));
        assert!(!dir.path().join(format!("{}.tmp", record.id)).exists());
    }

    #[tokio::test]
    async fn create_refuses_existing_and_update_requires_existing() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileRecordStore::open(dir.path()).await.unwrap();
        let record = SandboxRecord::initializing(Uuid::new_v4(), "memory", "u1", None);

        assert!(store.update(&record).await.unwrap_err().is_not_found());
        store.create(&record).await.unwrap();
        assert!(store.create(&record).await.is_err());
        assert!(store.delete(record.id).await.unwrap());
        assert!(store.get(record.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn list_skips_foreign_and_corrupt_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileRecordStore::open(dir.path().join("records")).await.unwrap();
        let mine = SandboxRecord::initializing(Uuid::new_v4(), "memory", "u1", None);
        let theirs = SandboxRecord::initializing(Uuid::new_v4(), "memory", "u2", None);
        store.create(&mine).await.unwrap();
        store.create(&theirs).await.unwrap();
        std::fs::write(store.dir().join("broken.json"), "{").unwrap();
        std::fs::write(store.dir().join("notes.txt"), "hello").unwrap();

        let owned = store.list_by_owner("u1").await.unwrap();
        assert_eq!(owned.len(), 1);
        assert_eq!(owned[0].id, mine.id);
    }

    #[tokio::test]
    async fn corrupt_record_is_a_store_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileRecordStore::open(dir.path()).await.unwrap();
        let id = Uuid::new_v4();
        std::fs::write(dir.path().join(format!("{id}.json")), "not json").unwrap();
        assert!(matches!(
            store.get(id).await,
            Err(LifecycleError::Store(_))
        ));
    }
}
