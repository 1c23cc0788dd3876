mod ops;
mod serve;

use std::path::PathBuf;
use std::sync::Arc;

use clap::Args;
use delay_queue::{DelayStore, MemoryDelayStore, RedisDelayStore, Scheduler};
use lifecycle::{Controller, FileRecordStore, MemoryRecordStore, RecordStore, build_provider};
use serde::Serialize;
use tracing::info;

use crate::config::{self, DaemonConfig, QueueKind, RecordsKind};
use crate::error::{DaemonError, DaemonResult};

pub use ops::{OpCommand, run_op};
pub use serve::{ServeArgs, run_serve};

/// Options shared by every subcommand.
#[derive(Args)]
pub struct GlobalArgs {
    /// Path to lifecycled.yaml. Without one, everything runs in memory.
    #[arg(long, short, global = true, env = "LIFECYCLED_CONFIG")]
    pub config: Option<PathBuf>,

    /// Daytona API key, used when the config leaves `provider.api_key` empty
    #[arg(long, global = true, env = "DAYTONA_API_KEY", hide_env_values = true)]
    pub daytona_api_key: Option<String>,

    /// Redis URL, used when the config leaves `queue.url` unset
    #[arg(long, global = true, env = "REDIS_URL", hide_env_values = true)]
    pub redis_url: Option<String>,
}

impl GlobalArgs {
    pub async fn load_config(&self) -> DaemonResult<DaemonConfig> {
        let mut config = match &self.config {
            Some(path) => config::load(path).await?,
            None => DaemonConfig::default(),
        };
        config.apply_overrides(self.daytona_api_key.clone(), self.redis_url.clone());
        Ok(config)
    }
}

/// Wire provider, scheduler store and record store into a controller.
pub async fn build_controller(config: &DaemonConfig) -> DaemonResult<Controller> {
    let provider = build_provider(config.provider_config()?)?;

    let store: Arc<dyn DelayStore> = match config.queue.kind {
        QueueKind::Memory => Arc::new(MemoryDelayStore::new()),
        QueueKind::Redis => {
            Arc::new(RedisDelayStore::connect(config.redis_url()?, &config.queue.name).await?)
        }
    };
    let scheduler = Arc::new(Scheduler::new(store, config.scheduler_config()));

    let records: Arc<dyn RecordStore> = match config.records.kind {
        RecordsKind::Memory => Arc::new(MemoryRecordStore::new()),
        RecordsKind::File => {
            let dir = config.records.dir.clone().ok_or_else(|| {
                DaemonError::Config("records.dir is required for the file store".into())
            })?;
            Arc::new(FileRecordStore::open(dir).await?)
        }
    };

    let controller_config = config.controller_config();
    if let Some(dir) = &controller_config.lock_dir {
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|e| DaemonError::Config(format!("create {}: {e}", dir.display())))?;
    }
    info!(
        provider = ?config.provider.kind,
        queue = ?config.queue.kind,
        records = ?config.records.kind,
        "controller configured"
    );
    Ok(Controller::new(provider, scheduler, records, controller_config))
}

/// Print `value` as pretty JSON on stdout.
pub(crate) fn print_json<T: Serialize + ?Sized>(value: &T) -> DaemonResult<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use lifecycle::SandboxStatus;

    use super::*;

    #[tokio::test]
    async fn default_config_builds_in_memory_controller() {
        let controller = build_controller(&DaemonConfig::default()).await.unwrap();
        assert_eq!(controller.provider().name(), "memory");
        assert!(controller.scheduler().health_check().await);

        let handle = controller.create_sandbox("u1", None).await.unwrap();
        let status = controller
            .get_sandbox_status(handle.sandbox_id)
            .await
            .unwrap();
        assert_eq!(status, SandboxStatus::Running);
        let pending = controller
            .scheduler()
            .pending(&handle.sandbox_id.to_string())
            .await
            .unwrap();
        assert!(pending.is_some());
        controller.shutdown().await;
    }

    #[tokio::test]
    async fn file_records_persist_across_controllers() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lifecycled.yaml");
        tokio::fs::write(&path, "records:\n  kind: file\nlifecycle:\n  idle_timeout_secs: 60\n")
            .await
            .unwrap();
        let config = config::load(&path).await.unwrap();
        let controller_config = config.controller_config();
        assert_eq!(controller_config.idle_timeout, Duration::from_secs(60));

        let controller = build_controller(&config).await.unwrap();
        let handle = controller.create_sandbox("u1", Some("base")).await.unwrap();
        controller.shutdown().await;
        assert!(controller_config.lock_dir.unwrap().is_dir());

        let reopened = build_controller(&config).await.unwrap();
        let record = reopened.get_sandbox_info(handle.sandbox_id).await.unwrap();
        assert_eq!(record.owner_id, "u1");
        assert_eq!(record.template_id.as_deref(), Some("base"));
        assert_eq!(reopened.list_sandboxes("u1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn redis_queue_without_url_is_a_config_error() {
        let mut config = DaemonConfig::default();
        config.queue.kind = QueueKind::Redis;
        let err = build_controller(&config).await.err().unwrap();
        assert!(matches!(err, DaemonError::Config(_)), "got: {err}");
    }
}
