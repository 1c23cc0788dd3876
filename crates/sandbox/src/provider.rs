use std::time::Duration;

use async_trait::async_trait;

use crate::config::CreateRequest;
use crate::error::Result;
use crate::sandbox::Sandbox;

/// Provider-level lifecycle operations for one remote compute vendor.
///
/// Implementations are selected by configuration and shared behind
/// `Arc<dyn SandboxProvider>`; they hold no per-sandbox state.
#[async_trait]
pub trait SandboxProvider: Send + Sync {
    /// Human-readable name for this provider (e.g. "daytona").
    fn name(&self) -> &str;
    /// Provision a new sandbox and return a live instance.
    async fn create(&self, request: CreateRequest) -> Result<Box<dyn Sandbox>>;
    /// Attach to an existing running sandbox.
    async fn connect(&self, provider_sandbox_id: &str) -> Result<Box<dyn Sandbox>>;
    /// Start a paused sandbox and attach to it. `timeout` re-arms the native
    /// inactivity timer when set.
    async fn resume(
        &self,
        provider_sandbox_id: &str,
        timeout: Option<Duration>,
    ) -> Result<Box<dyn Sandbox>>;
    /// Pause the sandbox. Must be a no-op when it is already paused.
    async fn stop(&self, provider_sandbox_id: &str) -> Result<()>;
    /// Permanently remove the sandbox.
    async fn delete(&self, provider_sandbox_id: &str) -> Result<()>;
    /// Arm the provider's native inactivity timeout.
    async fn set_timeout(&self, provider_sandbox_id: &str, timeout: Duration) -> Result<()>;
    /// Ask the provider whether the sandbox is currently paused.
    async fn is_paused(&self, provider_sandbox_id: &str) -> Result<bool>;
}
