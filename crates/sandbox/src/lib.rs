mod config;
mod error;
mod memory;
mod provider;
mod sandbox;
mod types;

pub use config::CreateRequest;
pub use error::{Result, SandboxError};
pub use memory::{MemoryProvider, ProviderCalls};
pub use provider::SandboxProvider;
pub use sandbox::Sandbox;
pub use types::{ByteStream, ExecRequest, ExecResult};
