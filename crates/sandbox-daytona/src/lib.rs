//! Daytona adapter for the sandbox provider interface.
//!
//! Every Daytona REST failure is translated into [`sandbox::SandboxError`]
//! so callers never see `reqwest` types.

mod api;
mod client;
mod config;
mod provider;
mod sandbox;

pub use config::{DEFAULT_API_URL, DaytonaConfig};
pub use provider::DaytonaProvider;
pub use self::sandbox::DaytonaSandbox;
