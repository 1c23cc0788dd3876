use std::time::Duration;

use async_trait::async_trait;
use reqwest::Method;
use sandbox::{CreateRequest, Sandbox, SandboxError, SandboxProvider};
use tracing::{info, warn};

use crate::api::{CreateSandboxRequest, SandboxInfo, SandboxState, auto_stop_minutes};
use crate::client::HttpClient;
use crate::config::DaytonaConfig;
use crate::sandbox::DaytonaSandbox;

/// Interval between state polls while waiting for a sandbox to start.
const READY_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Label carrying the caller's internal sandbox id.
const SANDBOX_ID_LABEL: &str = "lifecycle.sandbox_id";

pub struct DaytonaProvider {
    config: DaytonaConfig,
    http: HttpClient,
}

impl DaytonaProvider {
    pub fn new(config: DaytonaConfig) -> sandbox::Result<Self> {
        let http = HttpClient::new(&config)?;
        Ok(Self { config, http })
    }

    async fn info(&self, id: &str) -> sandbox::Result<SandboxInfo> {
        let req = self.http.request(Method::GET, &format!("/sandbox/{id}"));
        self.http.send_json("get sandbox", req).await
    }

    async fn start(&self, id: &str) -> sandbox::Result<()> {
        let req = self.http.request(Method::POST, &format!("/sandbox/{id}/start"));
        self.http.send("start sandbox", req).await?;
        Ok(())
    }

    /// Poll until the sandbox reports `started`.
    async fn wait_started(&self, id: &str) -> sandbox::Result<()> {
        let deadline = tokio::time::Instant::now() + self.config.ready_timeout;
        loop {
            let info = self.info(id).await?;
            if info.state == SandboxState::Started {
                return Ok(());
            }
            if info.state.is_failed() {
                return Err(SandboxError::General(format!(
                    "sandbox {id} entered state {}: {}",
                    info.state,
                    info.error_reason.unwrap_or_default()
                )));
            }
            if tokio::time::Instant::now() > deadline {
                return Err(SandboxError::Timeout(format!(
                    "sandbox {id} not started after {:?} (state {})",
                    self.config.ready_timeout, info.state
                )));
            }
            tokio::time::sleep(READY_POLL_INTERVAL).await;
        }
    }

    /// Bring a sandbox to `started` from whatever state it is in.
    async fn ensure_started(&self, id: &str) -> sandbox::Result<()> {
        let info = self.info(id).await?;
        match info.state {
            SandboxState::Started => return Ok(()),
            s if s.is_transitioning_up() => {}
            SandboxState::Stopping => {
                // Daytona rejects start while stopping; let it settle first.
                self.wait_settled(id).await?;
                self.start(id).await?;
            }
            s if s.is_failed() => {
                return Err(SandboxError::General(format!(
                    "sandbox {id} is in state {s}: {}",
                    info.error_reason.unwrap_or_default()
                )));
            }
            _ => self.start(id).await?,
        }
        self.wait_started(id).await
    }

    async fn wait_settled(&self, id: &str) -> sandbox::Result<()> {
        let deadline = tokio::time::Instant::now() + self.config.ready_timeout;
        while self.info(id).await?.state == SandboxState::Stopping {
            if tokio::time::Instant::now() > deadline {
                return Err(SandboxError::Timeout(format!("sandbox {id} stuck stopping")));
            }
            tokio::time::sleep(READY_POLL_INTERVAL).await;
        }
        Ok(())
    }

    fn instance(&self, id: String) -> Box<dyn Sandbox> {
        Box::new(DaytonaSandbox::new(id, self.http.clone()))
    }
}

#[async_trait]
impl SandboxProvider for DaytonaProvider {
    fn name(&self) -> &str {
        "daytona"
    }

    #[tracing::instrument(level = "info", skip(self, request), fields(sandbox_id = %request.sandbox_id))]
    async fn create(&self, request: CreateRequest) -> sandbox::Result<Box<dyn Sandbox>> {
        let mut labels = request.metadata;
        labels.insert(SANDBOX_ID_LABEL.to_string(), request.sandbox_id.to_string());

        let body = CreateSandboxRequest {
            snapshot: request
                .template_id
                .or_else(|| self.config.default_template.clone()),
            labels,
            target: self.config.target.clone(),
            auto_stop_interval: request.timeout.map(auto_stop_minutes),
        };

        let req = self.http.request(Method::POST, "/sandbox").json(&body);
        let info: SandboxInfo = self.http.send_json("create sandbox", req).await?;
        info!(id = %info.id, state = %info.state, "daytona sandbox created");

        if info.state != SandboxState::Started
            && let Err(e) = self.wait_started(&info.id).await
        {
            warn!(id = %info.id, error = %e, "sandbox never started, deleting");
            if let Err(del) = self.delete(&info.id).await {
                warn!(id = %info.id, error = %del, "rollback delete failed");
            }
            return Err(e);
        }

        Ok(self.instance(info.id))
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn connect(&self, provider_sandbox_id: &str) -> sandbox::Result<Box<dyn Sandbox>> {
        let info = self.info(provider_sandbox_id).await?;
        if info.state != SandboxState::Started {
            // The native auto-stop may have fired without the controller knowing.
            warn!(id = %provider_sandbox_id, state = %info.state, "sandbox not started on connect, starting");
            self.ensure_started(provider_sandbox_id).await?;
        }
        Ok(self.instance(info.id))
    }

    #[tracing::instrument(level = "info", skip(self))]
    async fn resume(
        &self,
        provider_sandbox_id: &str,
        timeout: Option<Duration>,
    ) -> sandbox::Result<Box<dyn Sandbox>> {
        self.ensure_started(provider_sandbox_id).await?;
        if let Some(timeout) = timeout {
            self.set_timeout(provider_sandbox_id, timeout).await?;
        }
        info!(id = %provider_sandbox_id, "daytona sandbox resumed");
        Ok(self.instance(provider_sandbox_id.to_string()))
    }

    #[tracing::instrument(level = "info", skip(self))]
    async fn stop(&self, provider_sandbox_id: &str) -> sandbox::Result<()> {
        let info = self.info(provider_sandbox_id).await?;
        if info.state.is_paused() || info.state == SandboxState::Stopping {
            info!(id = %provider_sandbox_id, state = %info.state, "sandbox already stopped");
            return Ok(());
        }
        let req = self
            .http
            .request(Method::POST, &format!("/sandbox/{provider_sandbox_id}/stop"));
        self.http.send("stop sandbox", req).await?;
        info!(id = %provider_sandbox_id, "daytona sandbox stopped");
        Ok(())
    }

    #[tracing::instrument(level = "info", skip(self))]
    async fn delete(&self, provider_sandbox_id: &str) -> sandbox::Result<()> {
        let req = self
            .http
            .request(Method::DELETE, &format!("/sandbox/{provider_sandbox_id}"));
        self.http.send("delete sandbox", req).await?;
        info!(id = %provider_sandbox_id, "daytona sandbox deleted");
        Ok(())
    }

    async fn set_timeout(&self, provider_sandbox_id: &str, timeout: Duration) -> sandbox::Result<()> {
        let minutes = auto_stop_minutes(timeout);
        let req = self.http.request(
            Method::POST,
            &format!("/sandbox/{provider_sandbox_id}/autostop/{minutes}"),
        );
        self.http.send("set autostop", req).await?;
        Ok(())
    }

    async fn is_paused(&self, provider_sandbox_id: &str) -> sandbox::Result<bool> {
        Ok(self.info(provider_sandbox_id).await?.state.is_paused())
    }
}
