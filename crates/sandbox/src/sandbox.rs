use async_trait::async_trait;
use bytes::Bytes;

use crate::error::Result;
use crate::types::{ByteStream, ExecRequest, ExecResult};

/// A live connection to one remote sandbox instance.
///
/// Instances are cheap handles: dropping one never stops the remote sandbox.
/// Lifecycle transitions go through [`SandboxProvider`](crate::SandboxProvider).
#[async_trait]
pub trait Sandbox: Send + Sync {
    // -- identity --
    /// The provider's opaque identity for this sandbox.
    fn id(&self) -> &str;

    // -- network --
    /// Expose `port` and return a URL reachable from outside the sandbox.
    async fn expose_port(&self, port: u16) -> Result<String>;

    // -- files --
    async fn upload_file(&self, path: &str, content: Bytes) -> Result<()>;
    async fn download_file(&self, path: &str) -> Result<Bytes>;
    async fn download_file_stream(&self, path: &str) -> Result<ByteStream>;
    async fn delete_file(&self, path: &str) -> Result<()>;
    async fn write_file(&self, path: &str, content: &str) -> Result<()>;
    async fn read_file(&self, path: &str) -> Result<String>;
    async fn create_directory(&self, path: &str, exist_ok: bool) -> Result<()>;

    // -- commands --
    async fn run_cmd(&self, request: &ExecRequest<'_>) -> Result<ExecResult>;
}
