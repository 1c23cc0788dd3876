use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::Mutex;
use tracing::info;

use crate::config::CreateRequest;
use crate::error::{Result, SandboxError};
use crate::provider::SandboxProvider;
use crate::sandbox::Sandbox;
use crate::types::{ByteStream, ExecRequest, ExecResult};

/// Chunk size used by `download_file_stream`.
const STREAM_CHUNK: usize = 64 * 1024;

/// Snapshot of how many times each provider-level operation was called.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProviderCalls {
    pub create: usize,
    pub connect: usize,
    pub resume: usize,
    pub stop: usize,
    pub delete: usize,
    pub set_timeout: usize,
}

#[derive(Default)]
struct Counters {
    create: AtomicUsize,
    connect: AtomicUsize,
    resume: AtomicUsize,
    stop: AtomicUsize,
    delete: AtomicUsize,
    set_timeout: AtomicUsize,
}

struct Instance {
    paused: bool,
    template_id: Option<String>,
    labels: HashMap<String, String>,
    timeout: Option<Duration>,
    files: HashMap<String, Bytes>,
    dirs: HashSet<String>,
    commands: Vec<String>,
}

#[derive(Default)]
struct State {
    instances: HashMap<String, Instance>,
    failing_stops: usize,
    revoked: bool,
}

/// In-process provider keeping every sandbox in memory.
///
/// Used for local development and as the test double for the controller.
/// Unlike remote adapters it is strict: `connect` on a paused sandbox fails
/// with [`SandboxError::NotInitialized`] instead of resuming it.
#[derive(Clone, Default)]
pub struct MemoryProvider {
    state: Arc<Mutex<State>>,
    counters: Arc<Counters>,
}

impl MemoryProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> ProviderCalls {
        let c = &self.counters;
        ProviderCalls {
            create: c.create.load(Ordering::Relaxed),
            connect: c.connect.load(Ordering::Relaxed),
            resume: c.resume.load(Ordering::Relaxed),
            stop: c.stop.load(Ordering::Relaxed),
            delete: c.delete.load(Ordering::Relaxed),
            set_timeout: c.set_timeout.load(Ordering::Relaxed),
        }
    }

    /// Number of sandboxes that exist (running or paused).
    pub async fn instance_count(&self) -> usize {
        self.state.lock().await.instances.len()
    }

    /// Native timeout currently armed for a sandbox.
    pub async fn timeout_of(&self, provider_sandbox_id: &str) -> Option<Duration> {
        let state = self.state.lock().await;
        state
            .instances
            .get(provider_sandbox_id)
            .and_then(|i| i.timeout)
    }

    pub async fn template_of(&self, provider_sandbox_id: &str) -> Option<String> {
        let state = self.state.lock().await;
        state
            .instances
            .get(provider_sandbox_id)
            .and_then(|i| i.template_id.clone())
    }

    pub async fn label_of(&self, provider_sandbox_id: &str, key: &str) -> Option<String> {
        let state = self.state.lock().await;
        state
            .instances
            .get(provider_sandbox_id)
            .and_then(|i| i.labels.get(key).cloned())
    }

    /// Commands run in a sandbox, oldest first.
    pub async fn commands(&self, provider_sandbox_id: &str) -> Vec<String> {
        let state = self.state.lock().await;
        state
            .instances
            .get(provider_sandbox_id)
            .map(|i| i.commands.clone())
            .unwrap_or_default()
    }

    /// Make the next `count` calls to `stop` fail with a general error.
    pub async fn fail_stops(&self, count: usize) {
        self.state.lock().await.failing_stops = count;
    }

    /// Reject every later `create` and `stop` with an authentication error,
    /// as after the API key was revoked.
    pub async fn revoke_credentials(&self) {
        self.state.lock().await.revoked = true;
    }

    /// Pause a sandbox behind the controller's back, as a native timer would.
    pub async fn force_pause(&self, provider_sandbox_id: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        let instance = lookup(&mut state, provider_sandbox_id)?;
        instance.paused = true;
        Ok(())
    }

    /// Remove a sandbox behind the controller's back.
    pub async fn force_delete(&self, provider_sandbox_id: &str) -> bool {
        let mut state = self.state.lock().await;
        state.instances.remove(provider_sandbox_id).is_some()
    }

    fn instance(&self, id: String) -> Box<dyn Sandbox> {
        Box::new(MemorySandbox {
            id,
            state: Arc::clone(&self.state),
        })
    }
}

fn lookup<'a>(state: &'a mut State, id: &str) -> Result<&'a mut Instance> {
    state
        .instances
        .get_mut(id)
        .ok_or_else(|| SandboxError::NotFound(id.to_string()))
}

fn running<'a>(state: &'a mut State, id: &str) -> Result<&'a mut Instance> {
    let instance = lookup(state, id)?;
    if instance.paused {
        return Err(SandboxError::NotInitialized(format!("{id} is paused")));
    }
    Ok(instance)
}

#[async_trait]
impl SandboxProvider for MemoryProvider {
    fn name(&self) -> &str {
        "memory"
    }

    async fn create(&self, request: CreateRequest) -> Result<Box<dyn Sandbox>> {
        self.counters.create.fetch_add(1, Ordering::Relaxed);
        if self.state.lock().await.revoked {
            return Err(SandboxError::Authentication("api key revoked".into()));
        }
        let id = format!("mem-{}", uuid::Uuid::new_v4().simple());
        let instance = Instance {
            paused: false,
            template_id: request.template_id,
            labels: request.metadata,
            timeout: request.timeout,
            files: HashMap::new(),
            dirs: HashSet::new(),
            commands: Vec::new(),
        };
        self.state.lock().await.instances.insert(id.clone(), instance);
        info!(id = %id, sandbox_id = %request.sandbox_id, "memory sandbox created");
        Ok(self.instance(id))
    }

    async fn connect(&self, provider_sandbox_id: &str) -> Result<Box<dyn Sandbox>> {
        self.counters.connect.fetch_add(1, Ordering::Relaxed);
        let mut state = self.state.lock().await;
        running(&mut state, provider_sandbox_id)?;
        Ok(self.instance(provider_sandbox_id.to_string()))
    }

    async fn resume(
        &self,
        provider_sandbox_id: &str,
        timeout: Option<Duration>,
    ) -> Result<Box<dyn Sandbox>> {
        self.counters.resume.fetch_add(1, Ordering::Relaxed);
        let mut state = self.state.lock().await;
        let instance = lookup(&mut state, provider_sandbox_id)?;
        instance.paused = false;
        if timeout.is_some() {
            instance.timeout = timeout;
        }
        Ok(self.instance(provider_sandbox_id.to_string()))
    }

    async fn stop(&self, provider_sandbox_id: &str) -> Result<()> {
        self.counters.stop.fetch_add(1, Ordering::Relaxed);
        let mut state = self.state.lock().await;
        if state.revoked {
            return Err(SandboxError::Authentication("api key revoked".into()));
        }
        if state.failing_stops > 0 {
            state.failing_stops -= 1;
            return Err(SandboxError::General("injected stop failure".into()));
        }
        lookup(&mut state, provider_sandbox_id)?.paused = true;
        Ok(())
    }

    async fn delete(&self, provider_sandbox_id: &str) -> Result<()> {
        self.counters.delete.fetch_add(1, Ordering::Relaxed);
        let mut state = self.state.lock().await;
        state
            .instances
            .remove(provider_sandbox_id)
            .map(|_| ())
            .ok_or_else(|| SandboxError::NotFound(provider_sandbox_id.to_string()))
    }

    async fn set_timeout(&self, provider_sandbox_id: &str, timeout: Duration) -> Result<()> {
        self.counters.set_timeout.fetch_add(1, Ordering::Relaxed);
        let mut state = self.state.lock().await;
        lookup(&mut state, provider_sandbox_id)?.timeout = Some(timeout);
        Ok(())
    }

    async fn is_paused(&self, provider_sandbox_id: &str) -> Result<bool> {
        let mut state = self.state.lock().await;
        Ok(lookup(&mut state, provider_sandbox_id)?.paused)
    }
}

struct MemorySandbox {
    id: String,
    state: Arc<Mutex<State>>,
}

#[async_trait]
impl Sandbox for MemorySandbox {
    fn id(&self) -> &str {
        &self.id
    }

    async fn expose_port(&self, port: u16) -> Result<String> {
        let mut state = self.state.lock().await;
        running(&mut state, &self.id)?;
        Ok(format!("https://{port}-{}.memory.local", self.id))
    }

    async fn upload_file(&self, path: &str, content: Bytes) -> Result<()> {
        let mut state = self.state.lock().await;
        running(&mut state, &self.id)?
            .files
            .insert(path.to_string(), content);
        Ok(())
    }

    async fn download_file(&self, path: &str) -> Result<Bytes> {
        let mut state = self.state.lock().await;
        running(&mut state, &self.id)?
            .files
            .get(path)
            .cloned()
            .ok_or_else(|| SandboxError::NotFound(path.to_string()))
    }

    async fn download_file_stream(&self, path: &str) -> Result<ByteStream> {
        let content = self.download_file(path).await?;
        let mut chunks = Vec::new();
        let mut offset = 0;
        while offset < content.len() {
            let end = (offset + STREAM_CHUNK).min(content.len());
            chunks.push(Ok(content.slice(offset..end)));
            offset = end;
        }
        Ok(Box::pin(futures_util::stream::iter(chunks)))
    }

    async fn delete_file(&self, path: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        running(&mut state, &self.id)?
            .files
            .remove(path)
            .map(|_| ())
            .ok_or_else(|| SandboxError::NotFound(path.to_string()))
    }

    async fn write_file(&self, path: &str, content: &str) -> Result<()> {
        self.upload_file(path, Bytes::copy_from_slice(content.as_bytes()))
            .await
    }

    async fn read_file(&self, path: &str) -> Result<String> {
        let content = self.download_file(path).await?;
        String::from_utf8(content.to_vec())
            .map_err(|e| SandboxError::General(format!("{path} is not utf-8: {e}")))
    }

    async fn create_directory(&self, path: &str, exist_ok: bool) -> Result<()> {
        let mut state = self.state.lock().await;
        let instance = running(&mut state, &self.id)?;
        if !instance.dirs.insert(path.to_string()) && !exist_ok {
            return Err(SandboxError::General(format!("{path} already exists")));
        }
        Ok(())
    }

    async fn run_cmd(&self, request: &ExecRequest<'_>) -> Result<ExecResult> {
        let mut state = self.state.lock().await;
        running(&mut state, &self.id)?
            .commands
            .push(request.cmd.to_string());
        Ok(ExecResult::detached())
    }
}
