use std::collections::{BTreeSet, HashMap};

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::DelayStore;
use crate::error::{QueueError, Result};

/// Ordered set with O(log n) removal by member, mirroring a Redis ZSET.
#[derive(Default)]
struct SortedSet {
    entries: BTreeSet<(i64, String)>,
    scores: HashMap<String, i64>,
}

impl SortedSet {
    fn add(&mut self, member: &str, score: i64) {
        if let Some(old) = self.scores.insert(member.to_string(), score) {
            self.entries.remove(&(old, member.to_string()));
        }
        self.entries.insert((score, member.to_string()));
    }

    fn remove(&mut self, member: &str) -> bool {
        match self.scores.remove(member) {
            Some(score) => self.entries.remove(&(score, member.to_string())),
            None => false,
        }
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

#[derive(Default)]
struct State {
    delayed: SortedSet,
    messages: HashMap<String, String>,
    dead: SortedSet,
    failing_calls: usize,
}

impl State {
    /// Consume one injected failure, if any.
    fn check(&mut self) -> Result<()> {
        if self.failing_calls > 0 {
            self.failing_calls -= 1;
            return Err(QueueError::Connection("injected connection failure".into()));
        }
        Ok(())
    }

    fn clear_lookup_if(&mut self, sandbox_id: &str, payload: &str) {
        if self.messages.get(sandbox_id).is_some_and(|p| p == payload) {
            self.messages.remove(sandbox_id);
        }
    }
}

/// In-process delayed store. Each operation holds one lock, which gives the
/// same atomicity as the Redis scripts.
#[derive(Default)]
pub struct MemoryDelayStore {
    state: Mutex<State>,
}

impl MemoryDelayStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` operations fail with a transient connection error.
    pub async fn fail_next(&self, count: usize) {
        self.state.lock().await.failing_calls = count;
    }

    /// Entries in the active ordered set.
    pub async fn active_len(&self) -> usize {
        self.state.lock().await.delayed.len()
    }

    /// Entries in the sandbox-id lookup hash.
    pub async fn lookup_len(&self) -> usize {
        self.state.lock().await.messages.len()
    }

    pub async fn dead_len(&self) -> usize {
        self.state.lock().await.dead.len()
    }

    /// Current score of an active payload.
    pub async fn score_of(&self, payload: &str) -> Option<i64> {
        self.state.lock().await.delayed.scores.get(payload).copied()
    }
}

#[async_trait]
impl DelayStore for MemoryDelayStore {
    async fn put(&self, sandbox_id: &str, payload: &str, score: i64) -> Result<Option<String>> {
        let mut state = self.state.lock().await;
        state.check()?;
        let previous = state
            .messages
            .insert(sandbox_id.to_string(), payload.to_string());
        if let Some(prev) = &previous {
            state.delayed.remove(prev);
        }
        state.delayed.add(payload, score);
        Ok(previous)
    }

    async fn remove(&self, sandbox_id: &str) -> Result<Option<String>> {
        let mut state = self.state.lock().await;
        state.check()?;
        let previous = state.messages.remove(sandbox_id);
        if let Some(prev) = &previous {
            state.delayed.remove(prev);
        }
        Ok(previous)
    }

    async fn get(&self, sandbox_id: &str) -> Result<Option<String>> {
        let mut state = self.state.lock().await;
        state.check()?;
        Ok(state.messages.get(sandbox_id).cloned())
    }

    async fn claim_due(&self, now: i64, lease_until: i64, limit: usize) -> Result<Vec<String>> {
        let mut state = self.state.lock().await;
        state.check()?;
        let due: Vec<String> = state
            .delayed
            .entries
            .iter()
            .take_while(|(score, _)| *score <= now)
            .take(limit)
            .map(|(_, payload)| payload.clone())
            .collect();
        for payload in &due {
            state.delayed.add(payload, lease_until);
        }
        Ok(due)
    }

    async fn ack(&self, sandbox_id: &str, payload: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        state.check()?;
        state.delayed.remove(payload);
        state.clear_lookup_if(sandbox_id, payload);
        Ok(())
    }

    async fn requeue(&self, sandbox_id: &str, old: &str, new: &str, score: i64) -> Result<bool> {
        let mut state = self.state.lock().await;
        state.check()?;
        state.delayed.remove(old);
        if state.messages.get(sandbox_id).is_none_or(|p| p != old) {
            return Ok(false);
        }
        state.delayed.add(new, score);
        state.messages.insert(sandbox_id.to_string(), new.to_string());
        Ok(true)
    }

    async fn dead_letter(
        &self,
        sandbox_id: Option<&str>,
        old: &str,
        dead: &str,
        score: i64,
    ) -> Result<()> {
        let mut state = self.state.lock().await;
        state.check()?;
        state.delayed.remove(old);
        if let Some(id) = sandbox_id {
            state.clear_lookup_if(id, old);
        }
        state.dead.add(dead, score);
        Ok(())
    }

    async fn dead_letters(&self, limit: usize) -> Result<Vec<String>> {
        let mut state = self.state.lock().await;
        state.check()?;
        Ok(state
            .dead
            .entries
            .iter()
            .rev()
            .take(limit)
            .map(|(_, payload)| payload.clone())
            .collect())
    }

    async fn ping(&self) -> Result<()> {
        self.state.lock().await.check()
    }
}
