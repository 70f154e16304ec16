//! Client for the proxy engine's Clash-compatible management API.
//!
//! The gateway drives a separate, already-running proxy engine through three
//! endpoints:
//!
//! - `GET /proxies` — enumerate proxies (nodes, selectors, groups)
//! - `GET /proxies/{selector}` — current node of a selector
//! - `PUT /proxies/{selector}` with `{"name": "<node>"}` — switch a selector
//!
//! All requests carry a bounded timeout; timeout, non-2xx and malformed
//! responses are reported as distinct [`ControlApiError`] variants.

mod prober;

pub use prober::NodeProber;

use async_trait::async_trait;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::time::Duration;

use gateway_types::ControlApiError;

/// Proxy kinds that are routing groups rather than leaf egress nodes.
const NON_NODE_KINDS: &[&str] = &["Selector", "Direct", "Fallback"];

/// One entry from `GET /proxies`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyEntry {
    pub name: String,
    /// Engine-reported proxy type (e.g. "Shadowsocks", "Selector").
    pub kind: String,
}

impl ProxyEntry {
    /// Whether this entry is a leaf egress node (not a selector/group).
    pub fn is_leaf_node(&self) -> bool {
        !NON_NODE_KINDS.iter().any(|k| k.eq_ignore_ascii_case(&self.kind))
    }
}

/// Management-API operations the gateway needs. Implemented by
/// [`ClashApiClient`] in production and by scripted mocks in tests.
#[async_trait]
pub trait ControlApi: Send + Sync {
    async fn list_proxies(&self) -> Result<Vec<ProxyEntry>, ControlApiError>;
    async fn get_selection(&self, selector: &str) -> Result<String, ControlApiError>;
    async fn set_selection(&self, selector: &str, node: &str) -> Result<(), ControlApiError>;
}

#[derive(Debug, Deserialize)]
struct ProxiesResponse {
    // BTreeMap keeps enumeration order stable across refreshes.
    proxies: BTreeMap<String, ProxyDetail>,
}

#[derive(Debug, Deserialize)]
struct ProxyDetail {
    #[serde(rename = "type")]
    kind: String,
}

#[derive(Debug, Deserialize)]
struct SelectionResponse {
    now: String,
}

/// Production control-API client.
pub struct ClashApiClient {
    base_url: String,
    secret: Option<String>,
    timeout: Duration,
    client: reqwest::Client,
}

impl ClashApiClient {
    pub fn new(
        base_url: impl Into<String>,
        secret: Option<String>,
        timeout_ms: u64,
    ) -> Result<Self, ControlApiError> {
        let base_url = base_url.into();
        url::Url::parse(&base_url).map_err(|e| ControlApiError::Transport {
            message: format!("invalid control API URL '{base_url}': {e}"),
        })?;

        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(timeout_ms))
            .build()
            .map_err(|e| ControlApiError::Transport { message: e.to_string() })?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            secret,
            timeout: Duration::from_millis(timeout_ms),
            client,
        })
    }

    fn map_send_error(&self, e: reqwest::Error) -> ControlApiError {
        if e.is_timeout() {
            ControlApiError::Timeout { timeout_ms: self.timeout.as_millis() as u64 }
        } else {
            ControlApiError::Transport { message: e.to_string() }
        }
    }

    fn with_auth(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.secret {
            Some(secret) => builder.bearer_auth(secret),
            None => builder,
        }
    }

    async fn check_status(
        &self,
        response: reqwest::Response,
    ) -> Result<reqwest::Response, ControlApiError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let message = response.text().await.unwrap_or_default();
        Err(ControlApiError::Status {
            status: status.as_u16(),
            message: message.chars().take(200).collect(),
        })
    }
}

#[async_trait]
impl ControlApi for ClashApiClient {
    async fn list_proxies(&self) -> Result<Vec<ProxyEntry>, ControlApiError> {
        let url = format!("{}/proxies", self.base_url);
        let response = self
            .with_auth(self.client.get(&url))
            .send()
            .await
            .map_err(|e| self.map_send_error(e))?;
        let response = self.check_status(response).await?;

        let parsed: ProxiesResponse = response
            .json()
            .await
            .map_err(|e| ControlApiError::Malformed { message: e.to_string() })?;

        Ok(parsed
            .proxies
            .into_iter()
            .map(|(name, detail)| ProxyEntry { name, kind: detail.kind })
            .collect())
    }

    async fn get_selection(&self, selector: &str) -> Result<String, ControlApiError> {
        let url = format!("{}/proxies/{}", self.base_url, selector);
        let response = self
            .with_auth(self.client.get(&url))
            .send()
            .await
            .map_err(|e| self.map_send_error(e))?;
        let response = self.check_status(response).await?;

        let parsed: SelectionResponse = response
            .json()
            .await
            .map_err(|e| ControlApiError::Malformed { message: e.to_string() })?;
        Ok(parsed.now)
    }

    async fn set_selection(&self, selector: &str, node: &str) -> Result<(), ControlApiError> {
        let url = format!("{}/proxies/{}", self.base_url, selector);
        let response = self
            .with_auth(self.client.put(&url))
            .json(&serde_json::json!({ "name": node }))
            .send()
            .await
            .map_err(|e| self.map_send_error(e))?;
        self.check_status(response).await?;

        tracing::debug!(selector = %selector, node = %node, "Selector switched");
        Ok(())
    }
}
