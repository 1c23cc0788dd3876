#[cfg(test)]
mod conformance;
mod memory;
mod redis;

pub use memory::MemoryDelayStore;
pub use self::redis::RedisDelayStore;

use async_trait::async_trait;

use crate::error::Result;

/// Shared delayed store: an ordered set of payloads keyed by delivery time,
/// a lookup hash from sandbox id to its pending payload, and an ordered
/// dead-letter set.
///
/// Every method is a single atomic step against the store. Scores are
/// milliseconds since the epoch. Payloads are opaque strings; a payload is
/// its own identity in the ordered sets.
#[async_trait]
pub trait DelayStore: Send + Sync {
    /// Insert `payload` for `sandbox_id`, removing any message already pending
    /// for that id. Returns the replaced payload.
    async fn put(&self, sandbox_id: &str, payload: &str, score: i64) -> Result<Option<String>>;

    /// Remove the pending message for `sandbox_id` from both structures.
    async fn remove(&self, sandbox_id: &str) -> Result<Option<String>>;

    /// Pending payload for `sandbox_id`, if any.
    async fn get(&self, sandbox_id: &str) -> Result<Option<String>>;

    /// Return up to `limit` payloads with score `<= now`, oldest first, and
    /// push their score to `lease_until` so other consumers skip them while
    /// they are being handled.
    async fn claim_due(&self, now: i64, lease_until: i64, limit: usize) -> Result<Vec<String>>;

    /// Drop a delivered payload. The lookup entry is only cleared if it still
    /// points at `payload`.
    async fn ack(&self, sandbox_id: &str, payload: &str) -> Result<()>;

    /// Swap `old` for `new` at `score`, as long as `old` is still the pending
    /// message for `sandbox_id`. Returns `false` (and drops `old`) when it was
    /// superseded or cancelled in the meantime.
    async fn requeue(&self, sandbox_id: &str, old: &str, new: &str, score: i64) -> Result<bool>;

    /// Move `old` out of the active structures and record `dead` in the
    /// dead-letter set at `score`. `sandbox_id` is `None` for payloads that
    /// could not be decoded.
    async fn dead_letter(
        &self,
        sandbox_id: Option<&str>,
        old: &str,
        dead: &str,
        score: i64,
    ) -> Result<()>;

    /// Dead-lettered payloads, newest first.
    async fn dead_letters(&self, limit: usize) -> Result<Vec<String>>;

    /// Liveness probe.
    async fn ping(&self) -> Result<()>;
}
