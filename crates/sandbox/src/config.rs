use std::collections::HashMap;
use std::time::Duration;

/// Parameters for provisioning a new remote sandbox.
#[derive(Debug, Clone, Default)]
pub struct CreateRequest {
    /// Internal identity assigned by the caller (not the provider's id).
    pub sandbox_id: uuid::Uuid,
    /// Provider template / snapshot to boot from. `None` uses the provider default.
    pub template_id: Option<String>,
    /// Free-form labels attached to the remote sandbox.
    pub metadata: HashMap<String, String>,
    /// Native inactivity timeout to arm at creation time.
    pub timeout: Option<Duration>,
}

impl CreateRequest {
    pub fn new(sandbox_id: uuid::Uuid) -> Self {
        Self {
            sandbox_id,
            ..Self::default()
        }
    }

    pub fn with_template(mut self, template_id: Option<&str>) -> Self {
        self.template_id = template_id.map(String::from);
        self
    }

    pub fn with_label(mut self, key: &str, value: impl Into<String>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}
