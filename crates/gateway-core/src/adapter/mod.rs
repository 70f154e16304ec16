//! Network adapter — executes outbound requests for one of four modes.
//!
//! The mode is a live setting, not compiled in:
//!
//! - **Direct**: no proxy; transport errors surface as-is.
//! - **StaticProxyList**: sequentially try configured external proxies.
//! - **Gateway**: lease a worker slot, route through its SOCKS5 port,
//!   classify failures, quarantine + retry on a fresh node.
//! - **Fallback**: direct first, then gateway (or the static list when no
//!   nodes are known).
//!
//! The actual wire send goes through the [`UpstreamChannel`] seam so mode
//! logic stays testable without sockets; the production channel caches one
//! `reqwest::Client` per proxy for connection reuse.

pub mod classify;

pub use classify::{classify_response, ResponseClass};

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::sync::RwLock;

use gateway_types::{GatewayConfig, GatewayError, GatewayResult, GatewayStats, NetworkMode};

use crate::pool::WorkerPool;
use crate::registry::NodeRegistry;

/// One outbound request.
#[derive(Debug, Clone)]
pub struct RequestOptions {
    pub method: reqwest::Method,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<Bytes>,
    /// Per-request timeout override; the adapter's default applies otherwise.
    pub timeout: Option<Duration>,
}

impl RequestOptions {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: reqwest::Method::GET,
            url: url.into(),
            headers: Vec::new(),
            body: None,
            timeout: None,
        }
    }

    pub fn post(url: impl Into<String>, body: Bytes) -> Self {
        Self {
            method: reqwest::Method::POST,
            url: url.into(),
            headers: Vec::new(),
            body: Some(body),
            timeout: None,
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// A fully-read upstream response. Non-2xx statuses are data, not errors —
/// classification decides what they mean.
#[derive(Debug, Clone)]
pub struct UpstreamResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl UpstreamResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Which egress path a single send takes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    Direct,
    /// Proxy URL, e.g. `socks5://127.0.0.1:24003`.
    Proxy(String),
}

/// Wire-level send. Transport failures are `Err`; any HTTP response at all
/// is `Ok`.
#[async_trait]
pub trait UpstreamChannel: Send + Sync {
    async fn execute(
        &self,
        route: &Route,
        options: &RequestOptions,
    ) -> GatewayResult<UpstreamResponse>;
}

/// Production channel backed by reqwest, one cached client per route.
pub struct ReqwestChannel {
    clients: DashMap<String, reqwest::Client>,
    default_timeout: Duration,
}

impl ReqwestChannel {
    pub fn new(default_timeout: Duration) -> Self {
        Self { clients: DashMap::new(), default_timeout }
    }

    fn client_for(&self, route: &Route) -> GatewayResult<reqwest::Client> {
        let key = match route {
            Route::Direct => "direct".to_string(),
            Route::Proxy(url) => url.clone(),
        };

        if let Some(client) = self.clients.get(&key) {
            return Ok(client.clone());
        }

        let mut builder = reqwest::Client::builder()
            .timeout(self.default_timeout)
            .connect_timeout(Duration::from_secs(20))
            .pool_idle_timeout(Duration::from_secs(90))
            .tcp_keepalive(Duration::from_secs(60));

        if let Route::Proxy(url) = route {
            let proxy = reqwest::Proxy::all(url)
                .map_err(|e| GatewayError::Transport(format!("invalid proxy URL '{url}': {e}")))?;
            builder = builder.proxy(proxy);
        }

        let client = builder
            .build()
            .map_err(|e| GatewayError::Transport(format!("failed to build client: {e}")))?;

        tracing::debug!(route = %key, "Created upstream client");
        self.clients.insert(key, client.clone());
        Ok(client)
    }
}

#[async_trait]
impl UpstreamChannel for ReqwestChannel {
    async fn execute(
        &self,
        route: &Route,
        options: &RequestOptions,
    ) -> GatewayResult<UpstreamResponse> {
        let client = self.client_for(route)?;
        let timeout = options.timeout.unwrap_or(self.default_timeout);

        let mut request = client
            .request(options.method.clone(), &options.url)
            .timeout(timeout);
        for (name, value) in &options.headers {
            request = request.header(name, value);
        }
        if let Some(body) = &options.body {
            request = request.body(body.clone());
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                GatewayError::Timeout { timeout_ms: timeout.as_millis() as u64 }
            } else {
                GatewayError::Transport(e.to_string())
            }
        })?;

        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .map(|(name, value)| {
                (name.to_string(), String::from_utf8_lossy(value.as_bytes()).to_string())
            })
            .collect();
        let body = response
            .bytes()
            .await
            .map_err(|e| GatewayError::Transport(format!("failed to read body: {e}")))?;

        Ok(UpstreamResponse { status, headers, body })
    }
}

#[derive(Debug, Default)]
struct AdapterCounters {
    total_requests: u64,
    success_count: u64,
    failure_count: u64,
    total_latency_ms: u64,
}

/// The network adapter.
pub struct NetworkAdapter {
    config: GatewayConfig,
    mode: RwLock<NetworkMode>,
    pool: Arc<WorkerPool>,
    registry: Arc<NodeRegistry>,
    channel: Arc<dyn UpstreamChannel>,
    counters: RwLock<AdapterCounters>,
    /// Node bound by the most recent gateway-mode attempt; quarantined as a
    /// precaution when the liveness check fails.
    current_node: RwLock<Option<String>>,
}

impl NetworkAdapter {
    pub fn new(
        config: GatewayConfig,
        pool: Arc<WorkerPool>,
        registry: Arc<NodeRegistry>,
        channel: Arc<dyn UpstreamChannel>,
    ) -> Self {
        let mode = config.mode;
        Self {
            config,
            mode: RwLock::new(mode),
            pool,
            registry,
            channel,
            counters: RwLock::new(AdapterCounters::default()),
            current_node: RwLock::new(None),
        }
    }

    pub async fn mode(&self) -> NetworkMode {
        *self.mode.read().await
    }

    pub async fn set_mode(&self, mode: NetworkMode) {
        let mut current = self.mode.write().await;
        if *current != mode {
            tracing::info!(from = %*current, to = %mode, "Network mode switched");
            *current = mode;
        }
    }

    pub async fn current_node(&self) -> Option<String> {
        self.current_node.read().await.clone()
    }

    /// Execute one outbound request under the current mode.
    pub async fn request(&self, options: RequestOptions) -> GatewayResult<UpstreamResponse> {
        let mode = *self.mode.read().await;
        let started = Instant::now();

        let result = match mode {
            NetworkMode::Direct => self.request_direct(&options).await,
            NetworkMode::StaticProxyList => self.request_static(&options).await,
            NetworkMode::Gateway => self.request_gateway(&options).await,
            NetworkMode::Fallback => self.request_fallback(&options).await,
        };

        self.record(&result, started.elapsed()).await;
        result
    }

    async fn request_direct(&self, options: &RequestOptions) -> GatewayResult<UpstreamResponse> {
        self.channel.execute(&Route::Direct, options).await
    }

    async fn request_static(&self, options: &RequestOptions) -> GatewayResult<UpstreamResponse> {
        if self.config.static_proxies.is_empty() {
            return Err(GatewayError::Config(
                "static proxy list is empty — refusing to send without proxy".into(),
            ));
        }

        let mut last_err = None;
        for proxy_url in &self.config.static_proxies {
            match self.channel.execute(&Route::Proxy(proxy_url.clone()), options).await {
                Ok(response) => return Ok(response),
                Err(e) => {
                    tracing::warn!(proxy = %proxy_url, error = %e, "Static proxy failed, trying next");
                    last_err = Some(e);
                },
            }
        }
        // Non-empty list, so at least one error was recorded.
        Err(last_err.unwrap_or(GatewayError::NoHealthyNode))
    }

    async fn request_gateway(&self, options: &RequestOptions) -> GatewayResult<UpstreamResponse> {
        let attempts = self.config.max_retries + 1;
        let mut last_err: Option<GatewayError> = None;

        for attempt in 0..attempts {
            let lease = self.pool.acquire().await?;
            let node = lease.node().to_string();
            *self.current_node.write().await = Some(node.clone());

            let outcome =
                self.channel.execute(&Route::Proxy(lease.proxy_url()), options).await;

            match outcome {
                Ok(response) => match classify_response(&response) {
                    ResponseClass::Pass => {
                        self.pool.record_outcome(lease.slot_id(), true);
                        return Ok(response);
                    },
                    ResponseClass::Terminal(err) => {
                        // Caller-input problem: no quarantine, no more attempts.
                        self.pool.record_outcome(lease.slot_id(), true);
                        return Err(err);
                    },
                    ResponseClass::NodeFailure(err) => {
                        self.pool.record_outcome(lease.slot_id(), false);
                        self.registry.quarantine(&node, &err.to_string()).await;
                        tracing::warn!(
                            node = %node,
                            attempt = attempt + 1,
                            error = %err,
                            "Gateway attempt failed, node quarantined"
                        );
                        last_err = Some(err);
                    },
                },
                Err(err) if err.triggers_quarantine() => {
                    self.pool.record_outcome(lease.slot_id(), false);
                    self.registry.quarantine(&node, &err.to_string()).await;
                    tracing::warn!(
                        node = %node,
                        attempt = attempt + 1,
                        error = %err,
                        "Gateway attempt failed, node quarantined"
                    );
                    last_err = Some(err);
                },
                Err(err) => {
                    self.pool.record_outcome(lease.slot_id(), false);
                    return Err(err);
                },
            }
            // Lease drops here, returning the slot before the next attempt.
        }

        Err(last_err.unwrap_or(GatewayError::NoHealthyNode))
    }

    async fn request_fallback(&self, options: &RequestOptions) -> GatewayResult<UpstreamResponse> {
        let direct_err = match self.request_direct(options).await {
            Ok(response) => return Ok(response),
            Err(e) => e,
        };

        tracing::warn!(error = %direct_err, "Direct path failed, falling back");

        let secondary = if self.registry.known_count().await > 0 {
            self.request_gateway(options).await
        } else {
            self.request_static(options).await
        };

        secondary.map_err(|fallback_err| GatewayError::FallbackFailed {
            direct: direct_err.to_string(),
            fallback: fallback_err.to_string(),
        })
    }

    /// End-to-end liveness: route the probe request through the current mode
    /// and require the expected no-content status.
    pub async fn health_check(&self) -> GatewayResult<()> {
        let options = RequestOptions::get(&self.config.probe_url)
            .with_timeout(Duration::from_millis(self.config.probe_timeout_ms));
        let response = self.request(options).await?;

        if response.status == self.config.probe_expect_status {
            Ok(())
        } else {
            Err(GatewayError::UpstreamHttp {
                status: response.status,
                message: "unexpected health-check status".into(),
            })
        }
    }

    async fn record(&self, result: &GatewayResult<UpstreamResponse>, elapsed: Duration) {
        let mut counters = self.counters.write().await;
        counters.total_requests += 1;
        counters.total_latency_ms += elapsed.as_millis() as u64;
        match result {
            Ok(response) if response.status < 400 => counters.success_count += 1,
            _ => counters.failure_count += 1,
        }
    }

    /// Process-lifetime statistics, merged with the pool's switch counters.
    pub async fn stats(&self) -> GatewayStats {
        let counters = self.counters.read().await;
        let (node_switches, last_switch_unix) = self.pool.switch_stats();
        GatewayStats {
            total_requests: counters.total_requests,
            success_count: counters.success_count,
            failure_count: counters.failure_count,
            total_latency_ms: counters.total_latency_ms,
            node_switches,
            last_switch_unix,
        }
    }
}

/// Current unix timestamp in seconds. Shared by the pool's switch tracking.
pub(crate) fn unix_now() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0)
}
