//! Sandbox lifecycle controller.
//!
//! Composes a [`sandbox::SandboxProvider`], a [`delay_queue::Scheduler`] and a
//! durable [`RecordStore`]: creates and resumes sandboxes, pauses them after
//! an idle timeout and deletes them, keeping the three in step.

mod config;
mod controller;
mod error;
mod locks;
mod provider;
mod record;
mod store;

pub use config::ControllerConfig;
pub use controller::{Controller, LifecycleHandler, ReconcileReport, SandboxHandle};
pub use error::{LifecycleError, Result};
pub use provider::{ProviderConfig, build_provider};
pub use record::{SandboxRecord, SandboxStatus};
pub use store::{FileRecordStore, MemoryRecordStore, RecordStore};
