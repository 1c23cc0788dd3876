use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use reqwest::Method;
use reqwest::multipart::{Form, Part};
use sandbox::{ByteStream, ExecRequest, ExecResult, Sandbox, SandboxError};
use tracing::debug;

use crate::api::{ExecuteRequest, ExecuteResponse, PreviewUrl, shell_quote};
use crate::client::{HttpClient, translate_reqwest};

pub struct DaytonaSandbox {
    id: String,
    /// `/toolbox/{id}/toolbox`, cached.
    toolbox: String,
    http: HttpClient,
}

impl DaytonaSandbox {
    pub(crate) fn new(id: String, http: HttpClient) -> Self {
        let toolbox = format!("/toolbox/{id}/toolbox");
        Self { id, toolbox, http }
    }

    async fn execute(&self, command: &str, timeout_secs: u64) -> sandbox::Result<ExecuteResponse> {
        let req = self
            .http
            .request(Method::POST, &format!("{}/process/execute", self.toolbox))
            .json(&ExecuteRequest {
                command,
                timeout: timeout_secs,
            });
        self.http.send_json("execute", req).await
    }
}

/// Wrap `cmd` so it keeps running after the execute call returns.
fn detach(cmd: &str) -> String {
    format!("nohup sh -c {} > /dev/null 2>&1 &", shell_quote(cmd))
}

fn mkdir_command(path: &str, exist_ok: bool) -> String {
    let flag = if exist_ok { "-p " } else { "" };
    format!("mkdir {flag}-- {}", shell_quote(path))
}

#[async_trait]
impl Sandbox for DaytonaSandbox {
    fn id(&self) -> &str {
        &self.id
    }

    async fn expose_port(&self, port: u16) -> sandbox::Result<String> {
        let req = self.http.request(
            Method::GET,
            &format!("/sandbox/{}/ports/{port}/preview-url", self.id),
        );
        let preview: PreviewUrl = self.http.send_json("preview url", req).await?;
        Ok(preview.url)
    }

    async fn upload_file(&self, path: &str, content: Bytes) -> sandbox::Result<()> {
        let file_name = path.rsplit('/').next().unwrap_or(path).to_string();
        let form = Form::new().part("file", Part::stream(content).file_name(file_name));
        let req = self
            .http
            .request(Method::POST, &format!("{}/files/upload", self.toolbox))
            .query(&[("path", path)])
            .multipart(form);
        self.http.send("upload file", req).await?;
        debug!(id = %self.id, path, "file uploaded");
        Ok(())
    }

    async fn download_file(&self, path: &str) -> sandbox::Result<Bytes> {
        let req = self
            .http
            .request(Method::GET, &format!("{}/files/download", self.toolbox))
            .query(&[("path", path)]);
        self.http
            .send("download file", req)
            .await?
            .bytes()
            .await
            .map_err(|e| translate_reqwest("download file", e))
    }

    async fn download_file_stream(&self, path: &str) -> sandbox::Result<ByteStream> {
        let req = self
            .http
            .request(Method::GET, &format!("{}/files/download", self.toolbox))
            .query(&[("path", path)]);
        let resp = self.http.send("download file", req).await?;
        let stream = resp
            .bytes_stream()
            .map(|chunk| chunk.map_err(|e| translate_reqwest("download stream", e)));
        Ok(Box::pin(stream))
    }

    async fn delete_file(&self, path: &str) -> sandbox::Result<()> {
        let req = self
            .http
            .request(Method::DELETE, &format!("{}/files", self.toolbox))
            .query(&[("path", path)]);
        self.http.send("delete file", req).await?;
        Ok(())
    }

    async fn write_file(&self, path: &str, content: &str) -> sandbox::Result<()> {
        self.upload_file(path, Bytes::copy_from_slice(content.as_bytes()))
            .await
    }

    async fn read_file(&self, path: &str) -> sandbox::Result<String> {
        let content = self.download_file(path).await?;
        String::from_utf8(content.to_vec())
            .map_err(|e| SandboxError::General(format!("{path} is not utf-8: {e}")))
    }

    async fn create_directory(&self, path: &str, exist_ok: bool) -> sandbox::Result<()> {
        let resp = self.execute(&mkdir_command(path, exist_ok), 30).await?;
        if resp.exit_code != 0 {
            return Err(SandboxError::General(format!(
                "mkdir {path} exited {}: {}",
                resp.exit_code,
                resp.result.trim()
            )));
        }
        Ok(())
    }

    async fn run_cmd(&self, request: &ExecRequest<'_>) -> sandbox::Result<ExecResult> {
        if request.background {
            self.execute(&detach(request.cmd), 30).await?;
            debug!(id = %self.id, cmd = request.cmd, "background command started");
            return Ok(ExecResult::detached());
        }
        let resp = self
            .execute(request.cmd, request.timeout.as_secs().max(1))
            .await?;
        Ok(ExecResult {
            exit_code: resp.exit_code,
            stdout: resp.result,
            stderr: String::new(),
        })
    }
}
