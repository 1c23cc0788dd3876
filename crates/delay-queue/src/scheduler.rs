use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::SchedulerConfig;
use crate::error::Result;
use crate::message::{Action, ScheduledMessage, after};
use crate::retry::with_retry;
use crate::store::DelayStore;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Failure reported by a [`MessageHandler`].
#[derive(Debug)]
pub enum HandlerError {
    /// Counts as a failed attempt and goes through the retry policy.
    Retry(BoxError),
    /// Retrying cannot help. The message is dead-lettered at once.
    Fatal(BoxError),
}

impl HandlerError {
    pub fn retry(e: impl Into<BoxError>) -> Self {
        Self::Retry(e.into())
    }

    pub fn fatal(e: impl Into<BoxError>) -> Self {
        Self::Fatal(e.into())
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal(_))
    }
}

impl fmt::Display for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Retry(e) | Self::Fatal(e) => e.fmt(f),
        }
    }
}

// Not `std::error::Error` itself, so any error converts with `?`.
impl<E> From<E> for HandlerError
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn from(e: E) -> Self {
        Self::Retry(Box::new(e))
    }
}

/// Receives due messages from the consumer loop. A retryable `Err` counts as
/// a failed attempt and goes through the retry / dead-letter policy.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: &ScheduledMessage) -> std::result::Result<(), HandlerError>;
}

struct Core {
    store: Arc<dyn DelayStore>,
    config: SchedulerConfig,
}

struct Consumer {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Delayed job scheduler with at-least-once delivery.
///
/// At most one message is pending per sandbox id: scheduling again replaces
/// the previous message. The consumer loop is owned by this value and has to
/// be started and stopped explicitly.
pub struct Scheduler {
    core: Arc<Core>,
    consumer: Mutex<Option<Consumer>>,
}

impl Scheduler {
    pub fn new(store: Arc<dyn DelayStore>, config: SchedulerConfig) -> Self {
        Self {
            core: Arc::new(Core { store, config }),
            consumer: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.core.config
    }

    /// Schedule `action` for `sandbox_id` after `delay`, replacing any pending
    /// message for that id. Returns the delivery time.
    pub async fn schedule(
        &self,
        sandbox_id: &str,
        action: Action,
        delay: Duration,
        metadata: serde_json::Map<String, serde_json::Value>,
    ) -> Result<DateTime<Utc>> {
        let delivery_time = after(Utc::now(), delay)?;
        let message = ScheduledMessage::new(sandbox_id, action, delivery_time, metadata);
        let payload = message.encode()?;
        let score = message.score();

        let core = &self.core;
        let replaced = with_retry(&core.config.store_retry, "schedule", || {
            core.store.put(sandbox_id, &payload, score)
        })
        .await?;

        info!(
            sandbox_id,
            %action,
            %delivery_time,
            replaced = replaced.is_some(),
            "scheduled"
        );
        Ok(delivery_time)
    }

    /// Drop the pending message for `sandbox_id`. Returns whether one existed.
    pub async fn cancel(&self, sandbox_id: &str) -> Result<bool> {
        let core = &self.core;
        let removed = with_retry(&core.config.store_retry, "cancel", || {
            core.store.remove(sandbox_id)
        })
        .await?;
        if removed.is_some() {
            info!(sandbox_id, "cancelled scheduled message");
        }
        Ok(removed.is_some())
    }

    /// Move the pending message for `sandbox_id` to `now + delay`. Returns
    /// `false` when nothing was scheduled.
    pub async fn update_delay(&self, sandbox_id: &str, delay: Duration) -> Result<bool> {
        let core = &self.core;
        let Some(old) = with_retry(&core.config.store_retry, "update_delay", || {
            core.store.get(sandbox_id)
        })
        .await?
        else {
            return Ok(false);
        };

        let mut message = ScheduledMessage::decode(&old)?;
        message.delivery_time = after(Utc::now(), delay)?;
        let new = message.encode()?;
        let score = message.score();

        let updated = with_retry(&core.config.store_retry, "update_delay", || {
            core.store.requeue(sandbox_id, &old, &new, score)
        })
        .await?;
        if updated {
            info!(sandbox_id, delivery_time = %message.delivery_time, "rescheduled");
        }
        Ok(updated)
    }

    /// The message currently pending for `sandbox_id`.
    pub async fn pending(&self, sandbox_id: &str) -> Result<Option<ScheduledMessage>> {
        let core = &self.core;
        let payload = with_retry(&core.config.store_retry, "pending", || {
            core.store.get(sandbox_id)
        })
        .await?;
        payload.as_deref().map(ScheduledMessage::decode).transpose()
    }

    /// Dead-lettered messages, newest first. Entries that never decoded are
    /// skipped.
    pub async fn dead_letters(&self, limit: usize) -> Result<Vec<ScheduledMessage>> {
        let core = &self.core;
        let payloads = with_retry(&core.config.store_retry, "dead_letters", || {
            core.store.dead_letters(limit)
        })
        .await?;
        Ok(payloads
            .iter()
            .filter_map(|payload| match ScheduledMessage::decode(payload) {
                Ok(message) => Some(message),
                Err(e) => {
                    debug!(error = %e, "skipping undecodable dead letter");
                    None
                }
            })
            .collect())
    }

    /// Start the consumer loop. Returns `false` if one is already running.
    pub async fn start_consuming(&self, handler: Arc<dyn MessageHandler>) -> bool {
        let mut consumer = self.consumer.lock().await;
        if consumer.as_ref().is_some_and(|c| !c.task.is_finished()) {
            return false;
        }
        let cancel = CancellationToken::new();
        let task = tokio::spawn(consume(self.core.clone(), handler, cancel.clone()));
        *consumer = Some(Consumer { cancel, task });
        info!(queue = %self.core.config.queue_name, "consumer started");
        true
    }

    /// Stop the consumer loop and wait for it. A batch already being
    /// delivered runs to completion; no further poll starts.
    pub async fn stop_consuming(&self) {
        let Some(consumer) = self.consumer.lock().await.take() else {
            return;
        };
        consumer.cancel.cancel();
        if let Err(e) = consumer.task.await {
            error!(error = %e, "consumer task failed");
        }
        info!(queue = %self.core.config.queue_name, "consumer stopped");
    }

    pub async fn is_consuming(&self) -> bool {
        self.consumer
            .lock()
            .await
            .as_ref()
            .is_some_and(|c| !c.task.is_finished())
    }

    /// Run one poll iteration with `handler`. Returns the number of messages
    /// whose handler succeeded.
    pub async fn poll_once(&self, handler: &dyn MessageHandler) -> Result<usize> {
        self.core.poll(handler).await
    }

    /// Liveness probe of the delayed store.
    pub async fn health_check(&self) -> bool {
        match self.core.store.ping().await {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "delay store health check failed");
                false
            }
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        if let Some(consumer) = self.consumer.get_mut().take() {
            warn!("scheduler dropped while consuming, cancelling consumer");
            consumer.cancel.cancel();
        }
    }
}

async fn consume(core: Arc<Core>, handler: Arc<dyn MessageHandler>, cancel: CancellationToken) {
    while !cancel.is_cancelled() {
        let pause = match core.poll(handler.as_ref()).await {
            Ok(_) => core.config.poll_interval,
            Err(e) => {
                error!(error = %e, "poll failed");
                core.config.error_backoff
            }
        };
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(pause) => {}
        }
    }
}

impl Core {
    async fn poll(&self, handler: &dyn MessageHandler) -> Result<usize> {
        let now = Utc::now();
        let lease_until = after(now, self.config.claim_lease)?.timestamp_millis();
        let limit = self.config.batch_size;
        let due = with_retry(&self.config.store_retry, "claim_due", || {
            self.store.claim_due(now.timestamp_millis(), lease_until, limit)
        })
        .await?;

        let mut delivered = 0;
        for payload in &due {
            match self.deliver(handler, payload).await {
                Ok(true) => delivered += 1,
                Ok(false) => {}
                // The claim lease brings the message back later.
                Err(e) => error!(error = %e, "failed to settle message"),
            }
        }
        Ok(delivered)
    }

    /// Hand one claimed payload to `handler` and settle it in the store.
    async fn deliver(&self, handler: &dyn MessageHandler, payload: &str) -> Result<bool> {
        let mut message = match ScheduledMessage::decode(payload) {
            Ok(message) => message,
            Err(e) => {
                let sandbox_id = sandbox_id_of(payload);
                warn!(sandbox_id = ?sandbox_id, error = %e, "undecodable message, dead-lettering");
                let score = Utc::now().timestamp_millis();
                with_retry(&self.config.store_retry, "dead_letter", || {
                    self.store
                        .dead_letter(sandbox_id.as_deref(), payload, payload, score)
                })
                .await?;
                return Ok(false);
            }
        };
        let sandbox_id = message.sandbox_id.clone();

        let fatal = match handler.handle(&message).await {
            Ok(()) => {
                with_retry(&self.config.store_retry, "ack", || {
                    self.store.ack(&sandbox_id, payload)
                })
                .await?;
                debug!(sandbox_id = %sandbox_id, action = %message.action, "delivered");
                return Ok(true);
            }
            Err(e) => {
                message.last_error = Some(e.to_string());
                e.is_fatal()
            }
        };
        message.attempts = message.attempts.saturating_add(1);

        let (retry_at, reason) = if fatal {
            (None, "fatal handler error")
        } else if message.attempts > self.config.max_retries {
            (None, "retries exhausted")
        } else {
            match after(Utc::now(), self.config.retry_delay(message.attempts)) {
                Ok(at) => (Some(at), ""),
                Err(e) => {
                    warn!(sandbox_id = %sandbox_id, error = %e, "retry time out of range");
                    (None, "retry time out of range")
                }
            }
        };

        if let Some(at) = retry_at {
            message.delivery_time = at;
            let new = message.encode()?;
            let score = message.score();
            let requeued = with_retry(&self.config.store_retry, "requeue", || {
                self.store.requeue(&sandbox_id, payload, &new, score)
            })
            .await?;
            if requeued {
                warn!(
                    sandbox_id = %sandbox_id,
                    action = %message.action,
                    attempts = message.attempts,
                    retry_at = %at,
                    error = message.last_error.as_deref().unwrap_or_default(),
                    "handler failed, retry scheduled"
                );
            } else {
                info!(sandbox_id = %sandbox_id, "handler failed but message was replaced, dropping retry");
            }
            return Ok(false);
        }

        let dead = message.encode()?;
        let score = Utc::now().timestamp_millis();
        with_retry(&self.config.store_retry, "dead_letter", || {
            self.store.dead_letter(Some(&sandbox_id), payload, &dead, score)
        })
        .await?;
        error!(
            sandbox_id = %sandbox_id,
            action = %message.action,
            attempts = message.attempts,
            error = message.last_error.as_deref().unwrap_or_default(),
            reason,
            "message dead-lettered"
        );
        Ok(false)
    }
}

/// Best-effort sandbox id from a payload that does not decode as a message.
fn sandbox_id_of(payload: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(payload).ok()?;
    value.get("sandbox_id")?.as_str().map(str::to_string)
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;

    use tokio::sync::Notify;

    use super::*;
    use crate::retry::RetryPolicy;
    use crate::store::MemoryDelayStore;

    #[derive(Default)]
    struct Recorder {
        seen: StdMutex<Vec<ScheduledMessage>>,
        fail: bool,
        fatal: bool,
        delivered: Notify,
    }

    impl Recorder {
        fn failing() -> Self {
            Self {
                fail: true,
                ..Self::default()
            }
        }

        fn fatal() -> Self {
            Self {
                fatal: true,
                ..Self::default()
            }
        }

        fn seen(&self) -> Vec<ScheduledMessage> {
            self.seen.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl MessageHandler for Recorder {
        async fn handle(&self, message: &ScheduledMessage) -> std::result::Result<(), HandlerError> {
            self.seen.lock().unwrap().push(message.clone());
            self.delivered.notify_one();
            if self.fatal {
                return Err(HandlerError::fatal("credentials rejected"));
            }
            if self.fail {
                return Err(HandlerError::retry("sandbox provider unavailable"));
            }
            Ok(())
        }
    }

    fn fast_config() -> SchedulerConfig {
        SchedulerConfig {
            poll_interval: Duration::from_millis(10),
            error_backoff: Duration::from_millis(10),
            retry_base_delay: Duration::ZERO,
            store_retry: RetryPolicy {
                attempts: 3,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(5),
            },
            ..SchedulerConfig::default()
        }
    }

    fn setup(config: SchedulerConfig) -> (Arc<MemoryDelayStore>, Scheduler) {
        let store = Arc::new(MemoryDelayStore::new());
        let scheduler = Scheduler::new(store.clone(), config);
        (store, scheduler)
    }

    #[tokio::test]
    async fn second_schedule_replaces_first() {
        let (store, scheduler) = setup(fast_config());
        scheduler
            .schedule("s1", Action::Pause, Duration::from_secs(60), Default::default())
            .await
            .unwrap();
        scheduler
            .schedule("s1", Action::Terminate, Duration::ZERO, Default::default())
            .await
            .unwrap();

        assert_eq!(store.active_len().await, 1);
        assert_eq!(store.lookup_len().await, 1);

        let handler = Recorder::default();
        assert_eq!(scheduler.poll_once(&handler).await.unwrap(), 1);
        let seen = handler.seen();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].action, Action::Terminate);
        assert_eq!(store.active_len().await, 0);
        assert_eq!(store.lookup_len().await, 0);
    }

    #[tokio::test]
    async fn future_messages_are_not_delivered_early() {
        let (_store, scheduler) = setup(fast_config());
        scheduler
            .schedule("s1", Action::Pause, Duration::from_secs(60), Default::default())
            .await
            .unwrap();
        let handler = Recorder::default();
        assert_eq!(scheduler.poll_once(&handler).await.unwrap(), 0);
        assert!(handler.seen().is_empty());
        assert!(scheduler.pending("s1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn cancel_prevents_delivery() {
        let (store, scheduler) = setup(fast_config());
        scheduler
            .schedule("s1", Action::Pause, Duration::from_millis(500), Default::default())
            .await
            .unwrap();
        let handler = Arc::new(Recorder::default());
        assert!(scheduler.start_consuming(handler.clone()).await);

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(scheduler.cancel("s1").await.unwrap());
        tokio::time::sleep(Duration::from_millis(800)).await;
        scheduler.stop_consuming().await;

        assert!(handler.seen().is_empty());
        assert_eq!(store.active_len().await, 0);
        assert!(!scheduler.cancel("s1").await.unwrap());
    }

    #[tokio::test]
    async fn due_message_is_delivered_within_a_poll_interval() {
        let (_store, scheduler) = setup(SchedulerConfig::default());
        let handler = Arc::new(Recorder::default());
        assert!(scheduler.start_consuming(handler.clone()).await);
        scheduler
            .schedule("s1", Action::Pause, Duration::ZERO, Default::default())
            .await
            .unwrap();

        tokio::time::timeout(Duration::from_millis(1500), handler.delivered.notified())
            .await
            .expect("message not delivered in time");
        scheduler.stop_consuming().await;

        assert_eq!(handler.seen().len(), 1);
        assert!(scheduler.pending("s1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn dead_letters_after_max_retries() {
        let (store, scheduler) = setup(fast_config());
        scheduler
            .schedule("s1", Action::Pause, Duration::ZERO, Default::default())
            .await
            .unwrap();
        let handler = Recorder::failing();

        for attempt in 1..=3 {
            assert_eq!(scheduler.poll_once(&handler).await.unwrap(), 0);
            let pending = scheduler.pending("s1").await.unwrap().unwrap();
            assert_eq!(pending.attempts, attempt);
            assert_eq!(store.dead_len().await, 0);
        }

        // Fourth failure exceeds max_retries = 3.
        scheduler.poll_once(&handler).await.unwrap();
        assert_eq!(handler.seen().len(), 4);
        assert_eq!(store.active_len().await, 0);
        assert_eq!(store.lookup_len().await, 0);

        let dead = scheduler.dead_letters(10).await.unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].sandbox_id, "s1");
        assert_eq!(dead[0].attempts, 4);
        assert_eq!(
            dead[0].last_error.as_deref(),
            Some("sandbox provider unavailable")
        );

        scheduler.poll_once(&handler).await.unwrap();
        assert_eq!(handler.seen().len(), 4);
    }

    #[tokio::test]
    async fn fatal_failure_is_dead_lettered_without_retry() {
        let (store, scheduler) = setup(fast_config());
        scheduler
            .schedule("s1", Action::Pause, Duration::ZERO, Default::default())
            .await
            .unwrap();
        let handler = Recorder::fatal();

        for _ in 0..3 {
            scheduler.poll_once(&handler).await.unwrap();
        }
        assert_eq!(handler.seen().len(), 1);
        assert_eq!(store.active_len().await, 0);
        assert_eq!(store.lookup_len().await, 0);

        let dead = scheduler.dead_letters(10).await.unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].attempts, 1);
        assert_eq!(dead[0].last_error.as_deref(), Some("credentials rejected"));
    }

    #[tokio::test]
    async fn unrepresentable_retry_time_dead_letters() {
        let config = SchedulerConfig {
            retry_base_delay: Duration::MAX,
            ..fast_config()
        };
        let (store, scheduler) = setup(config);
        scheduler
            .schedule("s1", Action::Pause, Duration::ZERO, Default::default())
            .await
            .unwrap();

        scheduler.poll_once(&Recorder::failing()).await.unwrap();
        assert_eq!(store.active_len().await, 0);
        assert_eq!(store.dead_len().await, 1);
    }

    #[test]
    fn handler_errors_convert_as_retryable() {
        fn parse(input: &str) -> std::result::Result<u32, HandlerError> {
            Ok(input.parse::<u32>()?)
        }
        let err = parse("x").unwrap_err();
        assert!(!err.is_fatal());
        assert!(HandlerError::fatal("denied").is_fatal());
        assert_eq!(HandlerError::fatal("denied").to_string(), "denied");
    }

    #[tokio::test]
    async fn retry_uses_exponential_delay() {
        let config = SchedulerConfig {
            retry_base_delay: Duration::from_secs(60),
            ..fast_config()
        };
        let (_store, scheduler) = setup(config);
        scheduler
            .schedule("s1", Action::Pause, Duration::ZERO, Default::default())
            .await
            .unwrap();

        let before = Utc::now();
        scheduler.poll_once(&Recorder::failing()).await.unwrap();
        let pending = scheduler.pending("s1").await.unwrap().unwrap();
        let wait = pending.delivery_time - before;
        assert!(wait >= chrono::Duration::seconds(120), "got {wait}");
        assert!(wait < chrono::Duration::seconds(125), "got {wait}");
    }

    /// Schedules a newer message for the same sandbox while handling.
    struct Rescheduler {
        store: Arc<MemoryDelayStore>,
        fail: bool,
    }

    #[async_trait]
    impl MessageHandler for Rescheduler {
        async fn handle(&self, message: &ScheduledMessage) -> std::result::Result<(), HandlerError> {
            let newer = ScheduledMessage::new(
                &message.sandbox_id,
                Action::Terminate,
                Utc::now() + chrono::Duration::hours(1),
                Default::default(),
            );
            self.store
                .put(&message.sandbox_id, &newer.encode()?, newer.score())
                .await?;
            if self.fail {
                return Err(HandlerError::retry("failed"));
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn newer_schedule_survives_ack_and_retry() {
        for fail in [false, true] {
            let (store, scheduler) = setup(fast_config());
            scheduler
                .schedule("s1", Action::Pause, Duration::ZERO, Default::default())
                .await
                .unwrap();
            let handler = Rescheduler {
                store: store.clone(),
                fail,
            };
            scheduler.poll_once(&handler).await.unwrap();

            let pending = scheduler.pending("s1").await.unwrap().unwrap();
            assert_eq!(pending.action, Action::Terminate, "fail = {fail}");
            assert_eq!(pending.attempts, 0);
            assert_eq!(store.active_len().await, 1);
        }
    }

    #[tokio::test]
    async fn update_delay_moves_pending_message() {
        let (_store, scheduler) = setup(fast_config());
        assert!(!scheduler.update_delay("s1", Duration::ZERO).await.unwrap());

        scheduler
            .schedule("s1", Action::Pause, Duration::from_secs(600), Default::default())
            .await
            .unwrap();
        assert!(scheduler.update_delay("s1", Duration::ZERO).await.unwrap());

        let handler = Recorder::default();
        assert_eq!(scheduler.poll_once(&handler).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn undecodable_payload_is_dead_lettered() {
        let (store, scheduler) = setup(fast_config());
        store.put("s1", "not json", 0).await.unwrap();

        let handler = Recorder::default();
        assert_eq!(scheduler.poll_once(&handler).await.unwrap(), 0);
        assert!(handler.seen().is_empty());
        assert_eq!(store.active_len().await, 0);
        assert_eq!(store.dead_len().await, 1);
        // Raw entries are kept but not listed as messages.
        assert!(scheduler.dead_letters(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn transient_store_failures_are_retried() {
        let (store, scheduler) = setup(fast_config());
        store.fail_next(2).await;
        scheduler
            .schedule("s1", Action::Pause, Duration::ZERO, Default::default())
            .await
            .unwrap();

        store.fail_next(3).await;
        let err = scheduler.cancel("s1").await.unwrap_err();
        assert!(err.is_transient());
        assert!(scheduler.pending("s1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn consumer_starts_once_and_restarts_after_stop() {
        let (_store, scheduler) = setup(fast_config());
        let handler = Arc::new(Recorder::default());
        assert!(scheduler.start_consuming(handler.clone()).await);
        assert!(!scheduler.start_consuming(handler.clone()).await);
        assert!(scheduler.is_consuming().await);

        scheduler.stop_consuming().await;
        assert!(!scheduler.is_consuming().await);
        assert!(scheduler.start_consuming(handler).await);
        scheduler.stop_consuming().await;
    }

    #[tokio::test]
    async fn health_check_reflects_store() {
        let (store, scheduler) = setup(fast_config());
        assert!(scheduler.health_check().await);
        store.fail_next(1).await;
        assert!(!scheduler.health_check().await);
    }
}
