use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{QueueError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Pause,
    Terminate,
    /// Any action this build does not know. Handlers drop it.
    #[serde(other)]
    Unknown,
}

impl Action {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pause => "pause",
            Self::Terminate => "terminate",
            Self::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Action {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pause" => Ok(Self::Pause),
            "terminate" => Ok(Self::Terminate),
            other => Err(QueueError::InvalidConfig(format!("unknown action: {other}"))),
        }
    }
}

/// A lifecycle action waiting in the delayed store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledMessage {
    /// Unique per `schedule` call. Retries keep it, a new schedule gets a new one.
    pub id: Uuid,
    pub sandbox_id: String,
    pub action: Action,
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
    pub delivery_time: DateTime<Utc>,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl ScheduledMessage {
    pub fn new(
        sandbox_id: &str,
        action: Action,
        delivery_time: DateTime<Utc>,
        metadata: serde_json::Map<String, serde_json::Value>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            sandbox_id: sandbox_id.to_string(),
            action,
            metadata,
            delivery_time,
            attempts: 0,
            last_error: None,
        }
    }

    /// Sort key in the delayed store (milliseconds since the epoch).
    pub fn score(&self) -> i64 {
        self.delivery_time.timestamp_millis()
    }

    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(payload: &str) -> Result<Self> {
        Ok(serde_json::from_str(payload)?)
    }
}

/// `now + delay`, failing instead of overflowing.
pub(crate) fn after(now: DateTime<Utc>, delay: Duration) -> Result<DateTime<Utc>> {
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
        .ok_or_else(|| QueueError::InvalidConfig(format!("delay {delay:?} out of range")))
}
