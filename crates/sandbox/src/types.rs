use std::pin::Pin;
use std::time::Duration;

use bytes::Bytes;
use futures_util::Stream;

pub struct ExecRequest<'a> {
    pub cmd: &'a str,
    /// Detach the command and return immediately without waiting for exit.
    pub background: bool,
    pub timeout: Duration,
}

impl<'a> ExecRequest<'a> {
    pub fn new(cmd: &'a str) -> Self {
        Self {
            cmd,
            background: false,
            timeout: Duration::from_secs(300),
        }
    }

    pub fn background(mut self, background: bool) -> Self {
        self.background = background;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecResult {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ExecResult {
    /// Result reported for a detached command: nothing to collect yet.
    pub fn detached() -> Self {
        Self {
            exit_code: 0,
            stdout: String::new(),
            stderr: String::new(),
        }
    }

    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Chunked file download.
pub type ByteStream = Pin<Box<dyn Stream<Item = crate::Result<Bytes>> + Send>>;
