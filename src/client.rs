//! HTTP client for the mothership conduits API.
//!
//! All calls are JSON POSTs. Non-2xx responses become a typed [`HttpError`]
//! carrying the status code, the body (capped at 4 MiB), and any parsed
//! `Retry-After` seconds so the retry layer can classify them.

use std::time::Duration;

use anyhow::{Context, Result};
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::config::Config;
use crate::protocol;

/// Per-request timeout for non-poll requests. Poll requests use the
/// configured long-poll timeout instead.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

const MAX_ERROR_BODY_BYTES: usize = 4 << 20;

#[derive(Debug)]
pub struct HttpError {
    pub status: u16,
    pub body: String,
    pub retry_after: Option<Duration>,
}

impl std::fmt::Display for HttpError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.retry_after {
            Some(ra) => write!(
                f,
                "HTTP {} (retry after {}s): {}",
                self.status,
                ra.as_secs(),
                self.body
            ),
            None => write!(f, "HTTP {}: {}", self.status, self.body),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("{0}")]
    Http(HttpError),
    #[error("transport: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("encode request: {0}")]
    Encode(serde_json::Error),
    #[error("decode response: {0}")]
    Decode(serde_json::Error),
    #[error("canceled")]
    Canceled,
}

pub struct Client {
    base_url: String,
    hc: reqwest::Client,
    territory_id: String,
}

impl Client {
    pub fn new(cfg: &Config) -> Result<Self> {
        let mut builder = reqwest::Client::builder()
            .use_rustls_tls()
            .timeout(cfg.long_poll_timeout());

        if cfg.tls.insecure_skip_verify {
            builder = builder.danger_accept_invalid_certs(true);
        }
        if !cfg.tls.ca_file.is_empty() {
            let pem = std::fs::read(&cfg.tls.ca_file)
                .with_context(|| format!("read CA file: {}", cfg.tls.ca_file))?;
            let cert =
                reqwest::Certificate::from_pem(&pem).context("failed to parse CA bundle")?;
            builder = builder.add_root_certificate(cert);
        }
        if !cfg.tls.client_cert_file.is_empty() && !cfg.tls.client_key_file.is_empty() {
            let mut pem = std::fs::read(&cfg.tls.client_cert_file)
                .with_context(|| format!("read client cert: {}", cfg.tls.client_cert_file))?;
            let key = std::fs::read(&cfg.tls.client_key_file)
                .with_context(|| format!("read client key: {}", cfg.tls.client_key_file))?;
            pem.extend_from_slice(&key);
            let identity =
                reqwest::Identity::from_pem(&pem).context("load client cert/key")?;
            builder = builder.identity(identity);
        }

        Ok(Self {
            base_url: cfg.server_url.trim_end_matches('/').to_string(),
            hc: builder.build().context("build HTTP client")?,
            territory_id: cfg.territory_id.clone(),
        })
    }

    pub async fn poll(
        &self,
        req: &protocol::PollRequest,
    ) -> Result<protocol::PollResponse, ClientError> {
        // Long-poll: rely on the client-level timeout.
        self.post_json("/conduits/v1/polls", "", req, None).await
    }

    pub async fn enroll(
        &self,
        req: &protocol::EnrollRequest,
    ) -> Result<protocol::EnrollResponse, ClientError> {
        self.post_json(
            "/conduits/v1/territories/enroll",
            "",
            req,
            Some(REQUEST_TIMEOUT),
        )
        .await
    }

    pub async fn territory_heartbeat(
        &self,
        req: &protocol::TerritoryHeartbeatRequest,
    ) -> Result<protocol::TerritoryHeartbeatResponse, ClientError> {
        self.post_json(
            "/conduits/v1/territories/heartbeat",
            "",
            req,
            Some(REQUEST_TIMEOUT),
        )
        .await
    }

    pub async fn started(
        &self,
        directive_id: &str,
        token: &str,
        req: &protocol::StartedRequest,
    ) -> Result<(), ClientError> {
        let path = format!("/conduits/v1/directives/{directive_id}/started");
        self.post_no_response(&path, token, req).await
    }

    pub async fn heartbeat(
        &self,
        directive_id: &str,
        token: &str,
        req: &protocol::HeartbeatRequest,
    ) -> Result<protocol::HeartbeatResponse, ClientError> {
        let path = format!("/conduits/v1/directives/{directive_id}/heartbeat");
        self.post_json(&path, token, req, Some(REQUEST_TIMEOUT)).await
    }

    pub async fn log_chunk(
        &self,
        directive_id: &str,
        token: &str,
        req: &protocol::LogChunkRequest,
    ) -> Result<(), ClientError> {
        let path = format!("/conduits/v1/directives/{directive_id}/log_chunks");
        self.post_no_response(&path, token, req).await
    }

    pub async fn finished(
        &self,
        directive_id: &str,
        token: &str,
        req: &protocol::FinishedRequest,
    ) -> Result<(), ClientError> {
        let path = format!("/conduits/v1/directives/{directive_id}/finished");
        self.post_no_response(&path, token, req).await
    }

    async fn post_json<In: Serialize, Out: DeserializeOwned + Default>(
        &self,
        path: &str,
        token: &str,
        body: &In,
        timeout: Option<Duration>,
    ) -> Result<Out, ClientError> {
        let bytes = self.do_post(path, token, body, timeout).await?;
        // A 2xx with an empty body is valid when no payload is defined.
        if bytes.is_empty() {
            return Ok(Out::default());
        }
        serde_json::from_slice(&bytes).map_err(ClientError::Decode)
    }

    async fn post_no_response<In: Serialize>(
        &self,
        path: &str,
        token: &str,
        body: &In,
    ) -> Result<(), ClientError> {
        self.do_post(path, token, body, Some(REQUEST_TIMEOUT))
            .await
            .map(|_| ())
    }

    async fn do_post<In: Serialize>(
        &self,
        path: &str,
        token: &str,
        body: &In,
        timeout: Option<Duration>,
    ) -> Result<Vec<u8>, ClientError> {
        let payload = serde_json::to_vec(body).map_err(ClientError::Encode)?;

        let mut req = self
            .hc
            .post(format!("{}{}", self.base_url, path))
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(payload);
        if !self.territory_id.is_empty() {
            req = req.header("X-Nexus-Territory-Id", &self.territory_id);
        }
        if !token.is_empty() {
            req = req.bearer_auth(token);
        }
        if let Some(t) = timeout {
            req = req.timeout(t);
        }

        let resp = req.send().await?;
        let status = resp.status();
        let retry_after = parse_retry_after(resp.headers());
        let bytes = resp.bytes().await?;

        if !status.is_success() {
            let capped = &bytes[..bytes.len().min(MAX_ERROR_BODY_BYTES)];
            return Err(ClientError::Http(HttpError {
                status: status.as_u16(),
                body: String::from_utf8_lossy(capped).into_owned(),
                retry_after,
            }));
        }
        Ok(bytes.to_vec())
    }
}

fn parse_retry_after(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
    let raw = headers.get(reqwest::header::RETRY_AFTER)?.to_str().ok()?;
    let seconds: u64 = raw.trim().parse().ok()?;
    if seconds == 0 {
        return None;
    }
    Some(Duration::from_secs(seconds))
}
