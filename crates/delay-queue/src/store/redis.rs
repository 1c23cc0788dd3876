use async_trait::async_trait;
use redis::Script;
use redis::aio::ConnectionManager;
use tracing::info;

use super::DelayStore;
use crate::error::{QueueError, Result};

// ---------------------------------------------------------------------------
// Scripts
//
// KEYS[1] = delayed ZSET, KEYS[2] = lookup HASH, KEYS[3] = dead ZSET.
// Each script is the only writer for its step, so the ZSET and the HASH
// can never be observed half-updated.
// ---------------------------------------------------------------------------

const PUT: &str = r"
local previous = redis.call('HGET', KEYS[2], ARGV[1])
if previous then
  redis.call('ZREM', KEYS[1], previous)
end
redis.call('ZADD', KEYS[1], ARGV[3], ARGV[2])
redis.call('HSET', KEYS[2], ARGV[1], ARGV[2])
return previous
";

const REMOVE: &str = r"
local previous = redis.call('HGET', KEYS[2], ARGV[1])
if not previous then
  return false
end
redis.call('ZREM', KEYS[1], previous)
redis.call('HDEL', KEYS[2], ARGV[1])
return previous
";

const CLAIM_DUE: &str = r"
local due = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1], 'LIMIT', 0, ARGV[3])
for _, payload in ipairs(due) do
  redis.call('ZADD', KEYS[1], 'XX', ARGV[2], payload)
end
return due
";

const ACK: &str = r"
redis.call('ZREM', KEYS[1], ARGV[2])
if redis.call('HGET', KEYS[2], ARGV[1]) == ARGV[2] then
  redis.call('HDEL', KEYS[2], ARGV[1])
end
return 1
";

const REQUEUE: &str = r"
redis.call('ZREM', KEYS[1], ARGV[2])
if redis.call('HGET', KEYS[2], ARGV[1]) ~= ARGV[2] then
  return 0
end
redis.call('ZADD', KEYS[1], ARGV[4], ARGV[3])
redis.call('HSET', KEYS[2], ARGV[1], ARGV[3])
return 1
";

const DEAD_LETTER: &str = r"
redis.call('ZREM', KEYS[1], ARGV[2])
if ARGV[1] ~= '' and redis.call('HGET', KEYS[2], ARGV[1]) == ARGV[2] then
  redis.call('HDEL', KEYS[2], ARGV[1])
end
redis.call('ZADD', KEYS[3], ARGV[4], ARGV[3])
return 1
";

struct Scripts {
    put: Script,
    remove: Script,
    claim_due: Script,
    ack: Script,
    requeue: Script,
    dead_letter: Script,
}

impl Scripts {
    fn new() -> Self {
        Self {
            put: Script::new(PUT),
            remove: Script::new(REMOVE),
            claim_due: Script::new(CLAIM_DUE),
            ack: Script::new(ACK),
            requeue: Script::new(REQUEUE),
            dead_letter: Script::new(DEAD_LETTER),
        }
    }
}

/// Key names for one queue, all namespaced under the queue name.
#[derive(Debug, Clone, PartialEq, Eq)]
struct QueueKeys {
    delayed: String,
    messages: String,
    dead: String,
}

impl QueueKeys {
    fn new(queue_name: &str) -> Result<Self> {
        let name = queue_name.trim();
        if name.is_empty() || name.contains(' ') {
            return Err(QueueError::InvalidConfig(format!(
                "invalid queue name: {queue_name:?}"
            )));
        }
        Ok(Self {
            delayed: format!("{name}:delayed"),
            messages: format!("{name}:messages"),
            dead: format!("{name}:dead"),
        })
    }
}

/// Redis-backed delayed store, shareable between controller processes.
#[derive(Clone)]
pub struct RedisDelayStore {
    manager: ConnectionManager,
    keys: std::sync::Arc<QueueKeys>,
    scripts: std::sync::Arc<Scripts>,
}

impl RedisDelayStore {
    pub async fn connect(url: &str, queue_name: &str) -> Result<Self> {
        let keys = QueueKeys::new(queue_name)?;
        let client = redis::Client::open(url)
            .map_err(|e| QueueError::InvalidConfig(format!("redis url: {e}")))?;
        let manager = ConnectionManager::new(client).await?;
        info!(queue = %queue_name, "redis delay store connected");
        Ok(Self {
            manager,
            keys: std::sync::Arc::new(keys),
            scripts: std::sync::Arc::new(Scripts::new()),
        })
    }

    fn conn(&self) -> ConnectionManager {
        self.manager.clone()
    }

    #[cfg(test)]
    async fn purge(&self) {
        let mut conn = self.conn();
        let _: i64 = redis::cmd("DEL")
            .arg(&self.keys.delayed)
            .arg(&self.keys.messages)
            .arg(&self.keys.dead)
            .query_async(&mut conn)
            .await
            .unwrap();
    }
}

#[async_trait]
impl DelayStore for RedisDelayStore {
    async fn put(&self, sandbox_id: &str, payload: &str, score: i64) -> Result<Option<String>> {
        let mut conn = self.conn();
        let previous: Option<String> = self
            .scripts
            .put
            .key(&self.keys.delayed)
            .key(&self.keys.messages)
            .arg(sandbox_id)
            .arg(payload)
            .arg(score)
            .invoke_async(&mut conn)
            .await?;
        Ok(previous)
    }

    async fn remove(&self, sandbox_id: &str) -> Result<Option<String>> {
        let mut conn = self.conn();
        let previous: Option<String> = self
            .scripts
            .remove
            .key(&self.keys.delayed)
            .key(&self.keys.messages)
            .arg(sandbox_id)
            .invoke_async(&mut conn)
            .await?;
        Ok(previous)
    }

    async fn get(&self, sandbox_id: &str) -> Result<Option<String>> {
        let mut conn = self.conn();
        let payload: Option<String> = redis::cmd("HGET")
            .arg(&self.keys.messages)
            .arg(sandbox_id)
            .query_async(&mut conn)
            .await?;
        Ok(payload)
    }

    async fn claim_due(&self, now: i64, lease_until: i64, limit: usize) -> Result<Vec<String>> {
        let mut conn = self.conn();
        let due: Vec<String> = self
            .scripts
            .claim_due
            .key(&self.keys.delayed)
            .arg(now)
            .arg(lease_until)
            .arg(limit)
            .invoke_async(&mut conn)
            .await?;
        Ok(due)
    }

    async fn ack(&self, sandbox_id: &str, payload: &str) -> Result<()> {
        let mut conn = self.conn();
        let _: i64 = self
            .scripts
            .ack
            .key(&self.keys.delayed)
            .key(&self.keys.messages)
            .arg(sandbox_id)
            .arg(payload)
            .invoke_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn requeue(&self, sandbox_id: &str, old: &str, new: &str, score: i64) -> Result<bool> {
        let mut conn = self.conn();
        let requeued: i64 = self
            .scripts
            .requeue
            .key(&self.keys.delayed)
            .key(&self.keys.messages)
            .arg(sandbox_id)
            .arg(old)
            .arg(new)
            .arg(score)
            .invoke_async(&mut conn)
            .await?;
        Ok(requeued == 1)
    }

    async fn dead_letter(
        &self,
        sandbox_id: Option<&str>,
        old: &str,
        dead: &str,
        score: i64,
    ) -> Result<()> {
        let mut conn = self.conn();
        let _: i64 = self
            .scripts
            .dead_letter
            .key(&self.keys.delayed)
            .key(&self.keys.messages)
            .key(&self.keys.dead)
            .arg(sandbox_id.unwrap_or(""))
            .arg(old)
            .arg(dead)
            .arg(score)
            .invoke_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn dead_letters(&self, limit: usize) -> Result<Vec<String>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let mut conn = self.conn();
        let payloads: Vec<String> = redis::cmd("ZREVRANGE")
            .arg(&self.keys.dead)
            .arg(0)
            .arg(limit - 1)
            .query_async(&mut conn)
            .await?;
        Ok(payloads)
    }

    async fn ping(&self) -> Result<()> {
        let mut conn = self.conn();
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::conformance;

    /// Store on a fresh queue, when a test Redis is available.
    ///
    /// Set `DELAY_QUEUE_TEST_REDIS_URL` (e.g. `redis://127.0.0.1:6379/`) to
    /// run these; they pass vacuously otherwise.
    async fn test_store() -> Option<RedisDelayStore> {
        let url = std::env::var("DELAY_QUEUE_TEST_REDIS_URL").ok()?;
        let queue = format!("delay-queue-test-{}", uuid::Uuid::new_v4());
        Some(RedisDelayStore::connect(&url, &queue).await.unwrap())
    }

    macro_rules! shared_behaviour {
        ($($case:ident),* $(,)?) => {$(
            #[tokio::test]
            async fn $case() {
                let Some(store) = test_store().await else {
                    return;
                };
                conformance::$case(&store).await;
                store.purge().await;
            }
        )*};
    }

    shared_behaviour!(
        put_replaces_pending_message,
        remove_clears_both_structures,
        claim_due_respects_score_limit_and_leases,
        ack_keeps_newer_lookup_entry,
        ack_clears_delivered_message,
        requeue_refuses_superseded_message,
        requeue_drops_claimed_payload_when_replaced,
        dead_letter_moves_out_of_active_structures,
    );

    #[tokio::test]
    async fn ping_reaches_server() {
        let Some(store) = test_store().await else {
            return;
        };
        store.ping().await.unwrap();
    }

    #[test]
    fn keys_are_namespaced_by_queue() {
        let keys = QueueKeys::new("sandbox-lifecycle").unwrap();
        assert_eq!(keys.delayed, "sandbox-lifecycle:delayed");
        assert_eq!(keys.messages, "sandbox-lifecycle:messages");
        assert_eq!(keys.dead, "sandbox-lifecycle:dead");
    }

    #[test]
    fn rejects_blank_or_spaced_queue_names() {
        assert!(QueueKeys::new("  ").is_err());
        assert!(QueueKeys::new("my queue").is_err());
    }

    #[tokio::test]
    async fn rejects_malformed_url() {
        let err = RedisDelayStore::connect("not a url", "q").await.err().unwrap();
        assert!(matches!(err, QueueError::InvalidConfig(_)), "got: {err}");
    }
}
