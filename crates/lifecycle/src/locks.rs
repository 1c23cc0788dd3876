use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use nix::fcntl::{Flock, FlockArg};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::warn;
use uuid::Uuid;

use crate::error::{LifecycleError, Result};

/// Per-sandbox advisory locks.
///
/// Always serializes callers in this process. With a lock directory it also
/// takes an exclusive flock on `<dir>/<id>.lock`, which serializes controller
/// processes sharing that directory.
pub(crate) struct SandboxLocks {
    slots: Mutex<HashMap<Uuid, Arc<Mutex<()>>>>,
    dir: Option<PathBuf>,
}

/// Held for the duration of one state-changing operation.
pub(crate) struct SandboxGuard {
    // Dropped in declaration order: the flock is released before the local slot.
    _file: Option<Flock<std::fs::File>>,
    _local: OwnedMutexGuard<()>,
}

impl SandboxLocks {
    pub(crate) fn new(dir: Option<PathBuf>) -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            dir,
        }
    }

    pub(crate) async fn lock(&self, id: Uuid) -> Result<SandboxGuard> {
        let slot = {
            let mut slots = self.slots.lock().await;
            // Slots only referenced by the map are idle.
            slots.retain(|_, slot| Arc::strong_count(slot) > 1);
            slots.entry(id).or_default().clone()
        };
        let local = slot.lock_owned().await;
        let file = match &self.dir {
            Some(dir) => Some(acquire(dir.join(format!("{id}.lock"))).await?),
            None => None,
        };
        Ok(SandboxGuard {
            _file: file,
            _local: local,
        })
    }

    /// Remove the lock file of a sandbox that no longer exists.
    pub(crate) async fn forget(&self, id: Uuid) {
        let Some(dir) = &self.dir else {
            return;
        };
        let path = dir.join(format!("{id}.lock"));
        if let Err(e) = tokio::fs::remove_file(&path).await
            && e.kind() != std::io::ErrorKind::NotFound
        {
            warn!(path = %path.display(), error = %e, "failed to remove lock file");
        }
    }

    #[cfg(test)]
    async fn slot_count(&self) -> usize {
        self.slots.lock().await.len()
    }
}

/// Acquire an exclusive flock on `path`, blocking until available.
async fn acquire(path: PathBuf) -> Result<Flock<std::fs::File>> {
    tokio::task::spawn_blocking(move || {
        let file = std::fs::File::options()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|e| LifecycleError::Store(format!("open lock {}: {e}", path.display())))?;
        Flock::lock(file, FlockArg::LockExclusive)
            .map_err(|(_file, e)| LifecycleError::Store(format!("flock {}: {e}", path.display())))
    })
    .await
    .map_err(|e| LifecycleError::Store(format!("lock task: {e}")))?
}
