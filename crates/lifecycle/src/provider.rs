use std::sync::Arc;

use sandbox::{MemoryProvider, SandboxProvider};
use sandbox_daytona::{DaytonaConfig, DaytonaProvider};

use crate::error::Result;

/// Which remote provider backs the controller.
#[derive(Debug, Clone)]
pub enum ProviderConfig {
    Memory,
    Daytona(DaytonaConfig),
}

/// Build the provider adapter selected by `config`.
pub fn build_provider(config: ProviderConfig) -> Result<Arc<dyn SandboxProvider>> {
    let provider: Arc<dyn SandboxProvider> = match config {
        ProviderConfig::Memory => Arc::new(MemoryProvider::new()),
        ProviderConfig::Daytona(config) => Arc::new(DaytonaProvider::new(config)?),
    };
    tracing::info!(provider = provider.name(), "sandbox provider ready");
    Ok(provider)
}
