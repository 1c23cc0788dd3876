//! Daytona REST API types (subset needed for the sandbox lifecycle).

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct CreateSandboxRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snapshot: Option<String>,
    pub labels: HashMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    /// Minutes of inactivity before Daytona stops the sandbox on its own.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auto_stop_interval: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct SandboxInfo {
    pub id: String,
    #[serde(default)]
    pub state: SandboxState,
    #[serde(default)]
    pub error_reason: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub(crate) enum SandboxState {
    Creating,
    Restoring,
    Starting,
    Started,
    Stopping,
    Stopped,
    Archiving,
    Archived,
    Destroying,
    Destroyed,
    Error,
    BuildFailed,
    #[default]
    #[serde(other)]
    Unknown,
}

impl SandboxState {
    /// States in which the sandbox holds no compute and must be started again.
    pub fn is_paused(self) -> bool {
        matches!(self, Self::Stopped | Self::Archiving | Self::Archived)
    }

    /// States that will reach `started` without further requests.
    pub fn is_transitioning_up(self) -> bool {
        matches!(self, Self::Creating | Self::Restoring | Self::Starting)
    }

    pub fn is_failed(self) -> bool {
        matches!(self, Self::Error | Self::BuildFailed | Self::Destroyed | Self::Destroying)
    }
}

impl std::fmt::Display for SandboxState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Creating => "creating",
            Self::Restoring => "restoring",
            Self::Starting => "starting",
            Self::Started => "started",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Archiving => "archiving",
            Self::Archived => "archived",
            Self::Destroying => "destroying",
            Self::Destroyed => "destroyed",
            Self::Error => "error",
            Self::BuildFailed => "build_failed",
            Self::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct PreviewUrl {
    pub url: String,
}

#[derive(Debug, Clone, Serialize)]
pub(crate) struct ExecuteRequest<'a> {
    pub command: &'a str,
    /// Seconds.
    pub timeout: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ExecuteResponse {
    pub exit_code: i32,
    /// Combined stdout and stderr.
    #[serde(default)]
    pub result: String,
}

/// Convert a timeout to Daytona's auto-stop interval.
///
/// Daytona counts whole minutes and treats `0` as "never", so anything
/// shorter than a minute rounds up to one.
pub(crate) fn auto_stop_minutes(timeout: Duration) -> u64 {
    timeout.as_secs().div_ceil(60).max(1)
}

/// Single-quote `s` for `sh`.
pub(crate) fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auto_stop_rounds_up_to_whole_minutes() {
        assert_eq!(auto_stop_minutes(Duration::from_secs(0)), 1);
        assert_eq!(auto_stop_minutes(Duration::from_secs(59)), 1);
        assert_eq!(auto_stop_minutes(Duration::from_secs(60)), 1);
        assert_eq!(auto_stop_minutes(Duration::from_secs(61)), 2);
        assert_eq!(auto_stop_minutes(Duration::from_secs(900)), 15);
    }

    #[test]
    fn shell_quote_escapes_single_quotes() {
        assert_eq!(shell_quote("/tmp/a b"), "'/tmp/a b'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
    }

    #[test]
    fn sandbox_info_parses_known_and_unknown_states() {
        let info: SandboxInfo =
            serde_json::from_str(r#"{"id":"sb-1","state":"stopped"}"#).unwrap();
        assert_eq!(info.state, SandboxState::Stopped);
        assert!(info.state.is_paused());

        let info: SandboxInfo =
            serde_json::from_str(r#"{"id":"sb-2","state":"pulling_snapshot"}"#).unwrap();
        assert_eq!(info.state, SandboxState::Unknown);

        let info: SandboxInfo = serde_json::from_str(r#"{"id":"sb-3"}"#).unwrap();
        assert_eq!(info.state, SandboxState::Unknown);
    }

    #[test]
    fn create_request_omits_unset_fields() {
        let body = CreateSandboxRequest {
            snapshot: None,
            labels: HashMap::new(),
            target: None,
            auto_stop_interval: Some(20),
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json, serde_json::json!({ "labels": {}, "autoStopInterval": 20 }));
    }

    #[test]
    fn execute_response_defaults_result() {
        let resp: ExecuteResponse = serde_json::from_str(r#"{"exitCode":2}"#).unwrap();
        assert_eq!(resp.exit_code, 2);
        assert!(resp.result.is_empty());
    }
}
