use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SandboxStatus {
    Initializing,
    Running,
    Paused,
    Deleted,
}

impl SandboxStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Initializing => "initializing",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Deleted => "deleted",
        }
    }
}

impl std::fmt::Display for SandboxStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Durable state of one sandbox.
///
/// `status` is the last transition this controller confirmed; the provider
/// may have moved on since (for example its native timer paused the sandbox).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SandboxRecord {
    pub id: Uuid,
    pub provider_name: String,
    /// Remote identity, known once the provider confirmed the create.
    #[serde(default)]
    pub provider_sandbox_id: Option<String>,
    pub owner_id: String,
    #[serde(default)]
    pub template_id: Option<String>,
    pub status: SandboxStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub stopped_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_activity_at: Option<DateTime<Utc>>,
}

impl SandboxRecord {
    pub fn initializing(
        id: Uuid,
        provider_name: &str,
        owner_id: &str,
        template_id: Option<&str>,
    ) -> Self {
        Self {
            id,
            provider_name: provider_name.to_string(),
            provider_sandbox_id: None,
            owner_id: owner_id.to_string(),
            template_id: template_id.map(String::from),
            status: SandboxStatus::Initializing,
            created_at: Utc::now(),
            started_at: None,
            stopped_at: None,
            last_activity_at: None,
        }
    }

    /// Running and paused sandboxes have a remote counterpart to talk to.
    pub fn is_live(&self) -> bool {
        matches!(self.status, SandboxStatus::Running | SandboxStatus::Paused)
    }

    pub fn mark_running(&mut self, now: DateTime<Utc>) {
        self.status = SandboxStatus::Running;
        self.started_at = Some(now);
        self.last_activity_at = Some(now);
    }

    pub fn mark_paused(&mut self, now: DateTime<Utc>) {
        self.status = SandboxStatus::Paused;
        self.stopped_at = Some(now);
    }

    pub fn touch(&mut self, now: DateTime<Utc>) {
        self.last_activity_at = Some(now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transitions_stamp_times() {
        let mut record = SandboxRecord::initializing(Uuid::new_v4(), "memory", "u1", None);
        assert!(!record.is_live());

        let t1 = Utc::now();
        record.mark_running(t1);
        assert_eq!(record.status, SandboxStatus::Running);
        assert_eq!(record.started_at, Some(t1));
        assert_eq!(record.last_activity_at, Some(t1));

        let t2 = t1 + chrono::Duration::seconds(30);
        record.mark_paused(t2);
        assert!(record.is_live());
        assert_eq!(record.stopped_at, Some(t2));
        assert_eq!(record.started_at, Some(t1));
    }

    #[test]
    fn status_serializes_lowercase() {
        let json = serde_json::to_string(&SandboxStatus::Initializing).unwrap();
        assert_eq!(json, "\"initializing\"");
        let status: SandboxStatus = serde_json::from_str("\"paused\"").unwrap();
        assert_eq!(status, SandboxStatus::Paused);
    }
}
