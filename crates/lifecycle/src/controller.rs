use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use delay_queue::{Action, HandlerError, MessageHandler, ScheduledMessage, Scheduler};
use sandbox::{
    ByteStream, CreateRequest, ExecRequest, ExecResult, Sandbox, SandboxError, SandboxProvider,
};
use serde::Serialize;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::ControllerConfig;
use crate::error::{LifecycleError, Result};
use crate::locks::{SandboxGuard, SandboxLocks};
use crate::record::{SandboxRecord, SandboxStatus};
use crate::store::RecordStore;

/// Label carrying the owner on the remote sandbox.
const OWNER_LABEL: &str = "owner_id";

/// A connected sandbox. Derefs to the provider instance for file, command
/// and network operations.
pub struct SandboxHandle {
    pub sandbox_id: Uuid,
    instance: Box<dyn Sandbox>,
}

impl SandboxHandle {
    pub fn provider_sandbox_id(&self) -> &str {
        self.instance.id()
    }
}

impl std::ops::Deref for SandboxHandle {
    type Target = dyn Sandbox;

    fn deref(&self) -> &Self::Target {
        self.instance.as_ref()
    }
}

/// Outcome of [`Controller::reconcile_owner`].
#[derive(Debug, Default, Serialize)]
pub struct ReconcileReport {
    pub checked: usize,
    /// Recorded as running, found paused at the provider.
    pub paused: Vec<Uuid>,
    /// Recorded as paused, found running at the provider.
    pub resumed: Vec<Uuid>,
    /// Gone at the provider; record removed.
    pub removed: Vec<Uuid>,
    pub failed: Vec<(Uuid, String)>,
}

struct Inner {
    provider: Arc<dyn SandboxProvider>,
    scheduler: Arc<Scheduler>,
    records: Arc<dyn RecordStore>,
    config: ControllerConfig,
    locks: SandboxLocks,
    consumer_started: AtomicBool,
}

/// Orchestrates sandboxes across the provider, the durable record store and
/// the delayed scheduler.
///
/// Cheap to clone. The scheduled pause/terminate messages are delivered back
/// through [`LifecycleHandler`], which holds only a weak reference so a
/// running consumer does not keep the controller alive.
#[derive(Clone)]
pub struct Controller {
    inner: Arc<Inner>,
}

impl Controller {
    pub fn new(
        provider: Arc<dyn SandboxProvider>,
        scheduler: Arc<Scheduler>,
        records: Arc<dyn RecordStore>,
        config: ControllerConfig,
    ) -> Self {
        let locks = SandboxLocks::new(config.lock_dir.clone());
        Self {
            inner: Arc::new(Inner {
                provider,
                scheduler,
                records,
                config,
                locks,
                consumer_started: AtomicBool::new(false),
            }),
        }
    }

    pub fn provider(&self) -> &Arc<dyn SandboxProvider> {
        &self.inner.provider
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.inner.scheduler
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.inner.config
    }

    /// Handler that applies scheduled messages to this controller.
    pub fn handler(&self) -> Arc<LifecycleHandler> {
        Arc::new(LifecycleHandler {
            inner: Arc::downgrade(&self.inner),
        })
    }

    // -----------------------------------------------------------------------
    // Consumer lifecycle
    // -----------------------------------------------------------------------

    /// Start delivering scheduled messages. Returns `false` if the consumer
    /// was already running.
    pub async fn start(&self) -> bool {
        self.inner.consumer_started.store(true, Ordering::SeqCst);
        self.inner.scheduler.start_consuming(self.handler()).await
    }

    /// Stop the consumer and wait for the batch in flight.
    pub async fn shutdown(&self) {
        self.inner.scheduler.stop_consuming().await;
    }

    /// Start the consumer on first use. Concurrent first callers start it once.
    async fn ensure_consuming(&self) {
        if !self.inner.consumer_started.swap(true, Ordering::SeqCst) {
            self.inner.scheduler.start_consuming(self.handler()).await;
        }
    }

    // -----------------------------------------------------------------------
    // Lifecycle operations
    // -----------------------------------------------------------------------

    pub async fn create_sandbox(
        &self,
        owner_id: &str,
        template_id: Option<&str>,
    ) -> Result<SandboxHandle> {
        let inner = &self.inner;
        let id = Uuid::new_v4();
        let _guard = inner.locks.lock(id).await?;

        let mut record =
            SandboxRecord::initializing(id, inner.provider.name(), owner_id, template_id);
        inner.records.create(&record).await?;

        let request = CreateRequest::new(id)
            .with_template(template_id)
            .with_label(OWNER_LABEL, owner_id)
            .with_timeout(self.native_timeout(inner.config.idle_timeout));
        let instance = match inner.provider.create(request).await {
            Ok(instance) => instance,
            Err(e) => {
                error!(sandbox_id = %id, error = %e, "provider create failed");
                if let Err(e) = inner.records.delete(id).await {
                    warn!(sandbox_id = %id, error = %e, "failed to drop initializing record");
                }
                inner.locks.forget(id).await;
                return Err(e.into());
            }
        };

        record.provider_sandbox_id = Some(instance.id().to_string());
        record.mark_running(Utc::now());
        if let Err(e) = inner.records.update(&record).await {
            error!(sandbox_id = %id, error = %e, "failed to persist sandbox, rolling back");
            if let Err(e) = inner.provider.delete(instance.id()).await {
                warn!(sandbox_id = %id, error = %e, "rollback delete failed");
            }
            if let Err(e) = inner.records.delete(id).await {
                warn!(sandbox_id = %id, error = %e, "failed to drop initializing record");
            }
            inner.locks.forget(id).await;
            return Err(e);
        }
        info!(
            sandbox_id = %id,
            owner_id,
            provider = inner.provider.name(),
            provider_sandbox_id = instance.id(),
            "sandbox created"
        );

        self.ensure_consuming().await;
        // The native timeout set at create still backs this up.
        if let Err(e) = self
            .arm_timeout(id, instance.id(), inner.config.idle_timeout)
            .await
        {
            error!(sandbox_id = %id, error = %e, "failed to arm idle timeout");
        }

        Ok(SandboxHandle {
            sandbox_id: id,
            instance,
        })
    }

    /// Connect to a sandbox, resuming it if it is paused.
    pub async fn connect(&self, sandbox_id: Uuid) -> Result<SandboxHandle> {
        let inner = &self.inner;
        let (_guard, mut record) = self.lock_record(sandbox_id).await?;
        let provider_id = provider_id(&record)?.to_string();
        let now = Utc::now();

        let (instance, resumed) = match record.status {
            SandboxStatus::Paused => {
                let instance = self.resume(&provider_id).await?;
                record.mark_running(now);
                info!(sandbox_id = %sandbox_id, "sandbox resumed");
                (instance, true)
            }
            SandboxStatus::Running => match inner.provider.connect(&provider_id).await {
                Ok(instance) => {
                    record.touch(now);
                    (instance, false)
                }
                Err(SandboxError::NotInitialized(reason)) => {
                    // The provider's native timer may have paused it.
                    if !inner.provider.is_paused(&provider_id).await? {
                        return Err(SandboxError::NotInitialized(reason).into());
                    }
                    let instance = self.resume(&provider_id).await?;
                    record.mark_running(now);
                    info!(sandbox_id = %sandbox_id, "sandbox was paused by provider, resumed");
                    (instance, true)
                }
                Err(e) => return Err(e.into()),
            },
            status => {
                return Err(LifecycleError::NotInitialized {
                    id: sandbox_id,
                    status,
                });
            }
        };
        inner.records.update(&record).await?;

        if (resumed || inner.config.rearm_on_activity)
            && let Err(e) = self
                .arm_timeout(sandbox_id, &provider_id, inner.config.idle_timeout)
                .await
        {
            warn!(sandbox_id = %sandbox_id, error = %e, "failed to re-arm idle timeout");
        }

        Ok(SandboxHandle {
            sandbox_id,
            instance,
        })
    }

    /// Pause a running sandbox. Pausing a paused sandbox is a no-op at the
    /// provider and keeps the original `stopped_at`.
    pub async fn pause_sandbox(&self, sandbox_id: Uuid, reason: &str) -> Result<()> {
        let inner = &self.inner;
        let (_guard, mut record) = self.lock_record(sandbox_id).await?;
        if !record.is_live() {
            return Err(LifecycleError::NotInitialized {
                id: sandbox_id,
                status: record.status,
            });
        }
        inner.provider.stop(provider_id(&record)?).await?;

        if record.status != SandboxStatus::Paused {
            record.mark_paused(Utc::now());
            inner.records.update(&record).await?;
        }
        info!(sandbox_id = %sandbox_id, reason, "sandbox paused");
        Ok(())
    }

    /// Delete a sandbox at the provider, drop its record and any pending
    /// scheduled message. The id is never reused.
    pub async fn delete_sandbox(&self, sandbox_id: Uuid) -> Result<()> {
        let inner = &self.inner;
        let (_guard, record) = self.lock_record(sandbox_id).await?;

        if let Some(provider_id) = &record.provider_sandbox_id {
            match inner.provider.delete(provider_id).await {
                Ok(()) => {}
                Err(e) if e.is_not_found() => {
                    warn!(sandbox_id = %sandbox_id, "sandbox already gone at provider");
                }
                Err(e) => return Err(e.into()),
            }
        }
        inner.records.delete(sandbox_id).await?;
        if let Err(e) = inner.scheduler.cancel(&sandbox_id.to_string()).await {
            // A stale message is dropped by the handler once the record is gone.
            warn!(sandbox_id = %sandbox_id, error = %e, "failed to cancel scheduled message");
        }
        inner.locks.forget(sandbox_id).await;
        info!(sandbox_id = %sandbox_id, "sandbox deleted");
        Ok(())
    }

    /// Pause the sandbox after `timeout` of inactivity, through both the
    /// scheduler and the provider's own timer. Returns the scheduled time.
    pub async fn schedule_timeout(
        &self,
        sandbox_id: Uuid,
        timeout: Duration,
    ) -> Result<DateTime<Utc>> {
        let (_guard, record) = self.lock_record(sandbox_id).await?;
        if !record.is_live() {
            return Err(LifecycleError::NotInitialized {
                id: sandbox_id,
                status: record.status,
            });
        }
        self.arm_timeout(sandbox_id, provider_id(&record)?, timeout)
            .await
    }

    /// Set the provider timer to `timeout + pause_buffer` and schedule the
    /// graceful pause at `timeout`.
    async fn arm_timeout(
        &self,
        sandbox_id: Uuid,
        provider_sandbox_id: &str,
        timeout: Duration,
    ) -> Result<DateTime<Utc>> {
        let inner = &self.inner;
        inner
            .provider
            .set_timeout(provider_sandbox_id, self.native_timeout(timeout))
            .await?;

        let mut metadata = serde_json::Map::new();
        metadata.insert("reason".into(), "idle timeout".into());
        let at = inner
            .scheduler
            .schedule(&sandbox_id.to_string(), Action::Pause, timeout, metadata)
            .await?;
        debug!(sandbox_id = %sandbox_id, pause_at = %at, "idle timeout armed");
        Ok(at)
    }

    fn native_timeout(&self, timeout: Duration) -> Duration {
        timeout.saturating_add(self.inner.config.pause_buffer)
    }

    async fn resume(&self, provider_sandbox_id: &str) -> Result<Box<dyn Sandbox>> {
        let timeout = self.native_timeout(self.inner.config.idle_timeout);
        Ok(self
            .inner
            .provider
            .resume(provider_sandbox_id, Some(timeout))
            .await?)
    }

    // -----------------------------------------------------------------------
    // Record reads
    // -----------------------------------------------------------------------

    /// Lock `sandbox_id` and load its record. The lock file of an unknown
    /// id is removed again.
    async fn lock_record(&self, sandbox_id: Uuid) -> Result<(SandboxGuard, SandboxRecord)> {
        let inner = &self.inner;
        let guard = inner.locks.lock(sandbox_id).await?;
        match inner.records.get(sandbox_id).await {
            Ok(Some(record)) => Ok((guard, record)),
            Ok(None) => {
                drop(guard);
                inner.locks.forget(sandbox_id).await;
                Err(LifecycleError::NotFound(sandbox_id))
            }
            Err(e) => Err(e),
        }
    }

    async fn record(&self, sandbox_id: Uuid) -> Result<SandboxRecord> {
        self.inner
            .records
            .get(sandbox_id)
            .await?
            .ok_or(LifecycleError::NotFound(sandbox_id))
    }

    /// Recorded status. Does not ask the provider.
    pub async fn get_sandbox_status(&self, sandbox_id: Uuid) -> Result<SandboxStatus> {
        Ok(self.record(sandbox_id).await?.status)
    }

    /// Full durable record. Does not ask the provider.
    pub async fn get_sandbox_info(&self, sandbox_id: Uuid) -> Result<SandboxRecord> {
        self.record(sandbox_id).await
    }

    pub async fn list_sandboxes(&self, owner_id: &str) -> Result<Vec<SandboxRecord>> {
        self.inner.records.list_by_owner(owner_id).await
    }

    /// Compare every record of `owner_id` with the provider and correct
    /// records that drifted (native timer fired, sandbox removed remotely).
    pub async fn reconcile_owner(&self, owner_id: &str) -> Result<ReconcileReport> {
        let inner = &self.inner;
        let mut report = ReconcileReport::default();

        for listed in inner.records.list_by_owner(owner_id).await? {
            let id = listed.id;
            // Re-read under the lock; it may have changed since listing.
            let (_guard, mut record) = match self.lock_record(id).await {
                Ok(locked) => locked,
                Err(LifecycleError::NotFound(_)) => continue,
                Err(e) => return Err(e),
            };
            let Some(provider_id) = record.provider_sandbox_id.clone() else {
                continue;
            };
            if !record.is_live() {
                continue;
            }
            report.checked += 1;

            match inner.provider.is_paused(&provider_id).await {
                Ok(true) if record.status == SandboxStatus::Running => {
                    record.mark_paused(Utc::now());
                    inner.records.update(&record).await?;
                    info!(sandbox_id = %id, "reconciled running -> paused");
                    report.paused.push(id);
                }
                Ok(false) if record.status == SandboxStatus::Paused => {
                    record.mark_running(Utc::now());
                    inner.records.update(&record).await?;
                    if let Err(e) = self
                        .arm_timeout(id, &provider_id, inner.config.idle_timeout)
                        .await
                    {
                        warn!(sandbox_id = %id, error = %e, "failed to arm idle timeout");
                    }
                    info!(sandbox_id = %id, "reconciled paused -> running");
                    report.resumed.push(id);
                }
                Ok(_) => {}
                Err(e) if e.is_not_found() => {
                    inner.records.delete(id).await?;
                    if let Err(e) = inner.scheduler.cancel(&id.to_string()).await {
                        warn!(sandbox_id = %id, error = %e, "failed to cancel scheduled message");
                    }
                    inner.locks.forget(id).await;
                    info!(sandbox_id = %id, "reconciled: gone at provider, record removed");
                    report.removed.push(id);
                }
                Err(e) => {
                    warn!(sandbox_id = %id, error = %e, "reconcile probe failed");
                    report.failed.push((id, e.to_string()));
                }
            }
        }
        Ok(report)
    }

    // -----------------------------------------------------------------------
    // Instance operations. Each connects (resuming if needed) first.
    // -----------------------------------------------------------------------

    pub async fn read_file(&self, sandbox_id: Uuid, path: &str) -> Result<String> {
        Ok(self.connect(sandbox_id).await?.read_file(path).await?)
    }

    pub async fn write_file(&self, sandbox_id: Uuid, path: &str, content: &str) -> Result<()> {
        Ok(self.connect(sandbox_id).await?.write_file(path, content).await?)
    }

    pub async fn upload_file(&self, sandbox_id: Uuid, path: &str, content: Bytes) -> Result<()> {
        Ok(self.connect(sandbox_id).await?.upload_file(path, content).await?)
    }

    pub async fn download_file(&self, sandbox_id: Uuid, path: &str) -> Result<Bytes> {
        Ok(self.connect(sandbox_id).await?.download_file(path).await?)
    }

    pub async fn download_file_stream(&self, sandbox_id: Uuid, path: &str) -> Result<ByteStream> {
        Ok(self
            .connect(sandbox_id)
            .await?
            .download_file_stream(path)
            .await?)
    }

    pub async fn delete_file(&self, sandbox_id: Uuid, path: &str) -> Result<()> {
        Ok(self.connect(sandbox_id).await?.delete_file(path).await?)
    }

    pub async fn run_cmd(
        &self,
        sandbox_id: Uuid,
        cmd: &str,
        background: bool,
    ) -> Result<ExecResult> {
        let request = ExecRequest::new(cmd).background(background);
        Ok(self.connect(sandbox_id).await?.run_cmd(&request).await?)
    }

    pub async fn expose_port(&self, sandbox_id: Uuid, port: u16) -> Result<String> {
        Ok(self.connect(sandbox_id).await?.expose_port(port).await?)
    }

    pub async fn create_directory(
        &self,
        sandbox_id: Uuid,
        path: &str,
        exist_ok: bool,
    ) -> Result<()> {
        Ok(self
            .connect(sandbox_id)
            .await?
            .create_directory(path, exist_ok)
            .await?)
    }
}

fn provider_id(record: &SandboxRecord) -> Result<&str> {
    record
        .provider_sandbox_id
        .as_deref()
        .ok_or(LifecycleError::NotInitialized {
            id: record.id,
            status: record.status,
        })
}

// ---------------------------------------------------------------------------
// Scheduled message handler
// ---------------------------------------------------------------------------

/// Applies delivered `pause` / `terminate` messages.
///
/// Messages for sandboxes that no longer exist, or with an action this
/// build does not know, are dropped. Credential failures are fatal and
/// dead-lettered at once; any other failure is retried by the scheduler.
pub struct LifecycleHandler {
    inner: Weak<Inner>,
}

#[async_trait]
impl MessageHandler for LifecycleHandler {
    async fn handle(&self, message: &ScheduledMessage) -> std::result::Result<(), HandlerError> {
        let Some(inner) = self.inner.upgrade() else {
            return Err(HandlerError::retry("controller is shut down"));
        };
        let controller = Controller { inner };

        let Ok(sandbox_id) = message.sandbox_id.parse::<Uuid>() else {
            warn!(sandbox_id = %message.sandbox_id, "dropping message with malformed sandbox id");
            return Ok(());
        };

        let result = match message.action {
            Action::Pause => {
                let reason = message
                    .metadata
                    .get("reason")
                    .and_then(serde_json::Value::as_str)
                    .unwrap_or("scheduled");
                controller.pause_sandbox(sandbox_id, reason).await
            }
            Action::Terminate => controller.delete_sandbox(sandbox_id).await,
            Action::Unknown => {
                warn!(sandbox_id = %sandbox_id, "dropping message with unknown action");
                return Ok(());
            }
        };

        match result {
            Ok(()) => Ok(()),
            Err(LifecycleError::NotFound(_)) => {
                info!(sandbox_id = %sandbox_id, action = %message.action, "sandbox no longer exists, dropping message");
                Ok(())
            }
            Err(e) => {
                let fatal = e.is_fatal();
                error!(
                    sandbox_id = %sandbox_id,
                    action = %message.action,
                    attempts = message.attempts,
                    fatal,
                    error = %e,
                    "lifecycle action failed"
                );
                if fatal {
                    Err(HandlerError::fatal(e))
                } else {
                    Err(HandlerError::retry(e))
                }
            }
        }
    }
}
