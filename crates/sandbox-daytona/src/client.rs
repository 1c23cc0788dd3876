use std::sync::Arc;

use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use sandbox::SandboxError;
use serde::de::DeserializeOwned;
use tracing::info;

use crate::config::DaytonaConfig;

/// Shared HTTP client for the Daytona API. Owns the connection pool, base URL
/// and API key. Clone is a cheap Arc refcount bump.
#[derive(Clone)]
pub(crate) struct HttpClient {
    inner: Arc<Inner>,
}

struct Inner {
    client: Client,
    api_url: String,
    api_key: String,
}

impl HttpClient {
    pub fn new(config: &DaytonaConfig) -> sandbox::Result<Self> {
        if config.api_key.trim().is_empty() {
            return Err(SandboxError::InvalidConfig("daytona api key is empty".into()));
        }
        let client = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| SandboxError::InvalidConfig(format!("http client: {e}")))?;

        let api_url = config.api_url.trim_end_matches('/').to_string();
        info!(api_url = %api_url, "daytona client initialized");

        Ok(Self {
            inner: Arc::new(Inner {
                client,
                api_url,
                api_key: config.api_key.clone(),
            }),
        })
    }

    /// Build an authenticated request. `path` is appended to the base URL.
    pub fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let url = format!("{}{path}", self.inner.api_url);
        self.inner
            .client
            .request(method, url)
            .bearer_auth(&self.inner.api_key)
    }

    /// Send a request and fail with a translated error on non-2xx.
    pub async fn send(&self, op: &str, req: RequestBuilder) -> sandbox::Result<Response> {
        let resp = req.send().await.map_err(|e| translate_reqwest(op, e))?;
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body = resp.text().await.unwrap_or_default();
        Err(translate_status(op, status, &body))
    }

    pub async fn send_json<T: DeserializeOwned>(
        &self,
        op: &str,
        req: RequestBuilder,
    ) -> sandbox::Result<T> {
        self.send(op, req)
            .await?
            .json()
            .await
            .map_err(|e| SandboxError::General(format!("{op} decode: {e}")))
    }
}

/// Map a Daytona HTTP status onto the uniform taxonomy.
pub(crate) fn translate_status(op: &str, status: StatusCode, body: &str) -> SandboxError {
    let msg = if body.is_empty() {
        format!("{op}: {status}")
    } else {
        format!("{op}: {status}: {body}")
    };
    match status {
        StatusCode::NOT_FOUND => SandboxError::NotFound(msg),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => SandboxError::Authentication(msg),
        StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => SandboxError::Timeout(msg),
        _ => SandboxError::General(msg),
    }
}

pub(crate) fn translate_reqwest(op: &str, e: reqwest::Error) -> SandboxError {
    if e.is_timeout() {
        return SandboxError::Timeout(format!("{op}: {e}"));
    }
    match e.status() {
        Some(status) => translate_status(op, status, &e.to_string()),
        None => SandboxError::General(format!("{op}: {e}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_translation() {
        let err = translate_status("get", StatusCode::NOT_FOUND, "no such sandbox");
        assert!(matches!(err, SandboxError::NotFound(_)));
        assert!(err.to_string().contains("no such sandbox"));

        for status in [StatusCode::UNAUTHORIZED, StatusCode::FORBIDDEN] {
            let err = translate_status("create", status, "");
            assert!(matches!(err, SandboxError::Authentication(_)), "{status}");
            assert!(err.is_fatal());
        }

        for status in [StatusCode::REQUEST_TIMEOUT, StatusCode::GATEWAY_TIMEOUT] {
            let err = translate_status("start", status, "");
            assert!(matches!(err, SandboxError::Timeout(_)), "{status}");
        }

        let err = translate_status("stop", StatusCode::INTERNAL_SERVER_ERROR, "boom");
        assert!(matches!(err, SandboxError::General(_)));
    }

    #[test]
    fn empty_api_key_is_rejected() {
        let config = DaytonaConfig::new("  ");
        let err = HttpClient::new(&config).err().unwrap();
        assert!(matches!(err, SandboxError::InvalidConfig(_)));
    }

    #[test]
    fn request_joins_base_url_without_double_slash() {
        let mut config = DaytonaConfig::new("key");
        config.api_url = "https://daytona.example.com/api/".into();
        let client = HttpClient::new(&config).unwrap();
        let req = client
            .request(Method::GET, "/sandbox/sb-1")
            .build()
            .unwrap();
        assert_eq!(req.url().as_str(), "https://daytona.example.com/api/sandbox/sb-1");
        assert_eq!(
            req.headers().get("authorization").unwrap(),
            "Bearer key"
        );
    }
}
