use std::time::Duration;

/// Public Daytona control plane.
pub const DEFAULT_API_URL: &str = "https://app.daytona.io/api";

#[derive(Debug, Clone)]
pub struct DaytonaConfig {
    /// Base URL of the Daytona REST API, without trailing slash.
    pub api_url: String,
    pub api_key: String,
    /// Region the sandboxes are scheduled in. `None` uses the account default.
    pub target: Option<String>,
    /// Snapshot booted when the caller does not name a template.
    pub default_template: Option<String>,
    /// Per-request HTTP timeout.
    pub request_timeout: Duration,
    /// How long to wait for a sandbox to reach `started` after create/start.
    pub ready_timeout: Duration,
}

impl DaytonaConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_url: DEFAULT_API_URL.to_string(),
            api_key: api_key.into(),
            target: None,
            default_template: None,
            request_timeout: Duration::from_secs(60),
            ready_timeout: Duration::from_secs(120),
        }
    }
}
