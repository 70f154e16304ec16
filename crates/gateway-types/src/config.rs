//! Gateway configuration surface.
//!
//! Loaded from a JSON file and/or environment overrides; validated once at
//! initialization. Invalid combinations fail fast — the gateway never starts
//! with a pool that cannot be provisioned.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::error::{GatewayError, GatewayResult};
use crate::models::NetworkMode;

/// Hard bounds on the worker pool size.
pub const MIN_POOL_SIZE: usize = 1;
pub const MAX_POOL_SIZE: usize = 50;

/// Gateway configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Active network mode. Swappable at runtime through the orchestrator.
    #[serde(default = "default_mode")]
    pub mode: NetworkMode,

    /// Base URL of the proxy engine's Clash-compatible management API.
    #[serde(default = "default_control_api_url")]
    pub control_api_url: String,

    /// Optional bearer secret for the management API.
    #[serde(default)]
    pub control_api_secret: Option<String>,

    /// Per-call timeout for management API requests, in milliseconds.
    #[serde(default = "default_control_timeout_ms")]
    pub control_timeout_ms: u64,

    /// Number of pre-provisioned worker slots (1–50).
    #[serde(default = "default_pool_size")]
    pub worker_pool_size: usize,

    /// First local SOCKS5 port; slot `i` listens on `worker_port_start + i`.
    #[serde(default = "default_worker_port_start")]
    pub worker_port_start: u16,

    /// Per-slot selector names are `{prefix}-{index}`.
    #[serde(default = "default_worker_selector_prefix")]
    pub worker_selector_prefix: String,

    /// The engine's primary (non-worker) selector, used for sweep probes.
    #[serde(default = "default_primary_selector")]
    pub primary_selector: String,

    /// The engine's default SOCKS egress port (traffic routed by the
    /// primary selector exits here).
    #[serde(default = "default_engine_socks_port")]
    pub engine_socks_port: u16,

    /// Health-probe target; must answer with `probe_expect_status`.
    #[serde(default = "default_probe_url")]
    pub probe_url: String,

    #[serde(default = "default_probe_expect_status")]
    pub probe_expect_status: u16,

    /// Probe timeout in milliseconds.
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,

    /// Default timeout for upstream requests, in seconds.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// Extra attempts after the first in gateway mode.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Liveness loop interval in seconds; 0 disables the loop.
    #[serde(default = "default_health_check_interval_secs")]
    pub health_check_interval_secs: u64,

    /// Quarantine-recovery sweep interval in seconds; 0 disables the loop.
    #[serde(default = "default_sweep_interval_secs")]
    pub quarantine_sweep_interval_secs: u64,

    /// Delay before the first sweep run, letting the system stabilize.
    #[serde(default = "default_sweep_startup_delay_secs")]
    pub sweep_startup_delay_secs: u64,

    /// Consecutive passing probes for a temporary quarantine to clear.
    #[serde(default = "default_temporary_recovery_threshold")]
    pub temporary_recovery_threshold: u32,

    /// Consecutive passing probes for a permanent quarantine to clear.
    #[serde(default = "default_permanent_recovery_threshold")]
    pub permanent_recovery_threshold: u32,

    /// Whether the sweep may recover permanently quarantined nodes.
    #[serde(default)]
    pub enable_permanent_recovery: bool,

    /// External proxy endpoints for `NetworkMode::StaticProxyList`.
    #[serde(default)]
    pub static_proxies: Vec<String>,

    /// Static node list used when the control API cannot be enumerated.
    #[serde(default)]
    pub fallback_nodes: Vec<String>,

    /// Quarantine persistence file.
    #[serde(default = "default_quarantine_file")]
    pub quarantine_file: PathBuf,
}

fn default_mode() -> NetworkMode {
    NetworkMode::Gateway
}
fn default_control_api_url() -> String {
    "http://127.0.0.1:9090".to_string()
}
fn default_control_timeout_ms() -> u64 {
    15_000
}
fn default_pool_size() -> usize {
    5
}
fn default_worker_port_start() -> u16 {
    24_000
}
fn default_worker_selector_prefix() -> String {
    "worker".to_string()
}
fn default_primary_selector() -> String {
    "proxy".to_string()
}
fn default_engine_socks_port() -> u16 {
    7890
}
fn default_probe_url() -> String {
    "http://www.gstatic.com/generate_204".to_string()
}
fn default_probe_expect_status() -> u16 {
    204
}
fn default_probe_timeout_ms() -> u64 {
    5_000
}
fn default_request_timeout_secs() -> u64 {
    120
}
fn default_max_retries() -> u32 {
    2
}
fn default_health_check_interval_secs() -> u64 {
    30
}
fn default_sweep_interval_secs() -> u64 {
    600
}
fn default_sweep_startup_delay_secs() -> u64 {
    5
}
fn default_temporary_recovery_threshold() -> u32 {
    2
}
fn default_permanent_recovery_threshold() -> u32 {
    3
}
fn default_quarantine_file() -> PathBuf {
    PathBuf::from("quarantine.json")
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            mode: default_mode(),
            control_api_url: default_control_api_url(),
            control_api_secret: None,
            control_timeout_ms: default_control_timeout_ms(),
            worker_pool_size: default_pool_size(),
            worker_port_start: default_worker_port_start(),
            worker_selector_prefix: default_worker_selector_prefix(),
            primary_selector: default_primary_selector(),
            engine_socks_port: default_engine_socks_port(),
            probe_url: default_probe_url(),
            probe_expect_status: default_probe_expect_status(),
            probe_timeout_ms: default_probe_timeout_ms(),
            request_timeout_secs: default_request_timeout_secs(),
            max_retries: default_max_retries(),
            health_check_interval_secs: default_health_check_interval_secs(),
            quarantine_sweep_interval_secs: default_sweep_interval_secs(),
            sweep_startup_delay_secs: default_sweep_startup_delay_secs(),
            temporary_recovery_threshold: default_temporary_recovery_threshold(),
            permanent_recovery_threshold: default_permanent_recovery_threshold(),
            enable_permanent_recovery: false,
            static_proxies: Vec::new(),
            fallback_nodes: Vec::new(),
            quarantine_file: default_quarantine_file(),
        }
    }
}

impl GatewayConfig {
    /// Apply environment-variable overrides on top of the current values.
    ///
    /// Recognized: `SINGBOX_WORKER_POOL_SIZE`, `SINGBOX_WORKER_PORT_START`,
    /// `GATEWAY_NETWORK_MODE`, `GATEWAY_CONTROL_API_URL`,
    /// `GATEWAY_CONTROL_API_SECRET`.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(raw) = std::env::var("SINGBOX_WORKER_POOL_SIZE") {
            match raw.parse::<usize>() {
                Ok(size) => self.worker_pool_size = size,
                Err(_) => {
                    tracing::warn!("Ignoring non-numeric SINGBOX_WORKER_POOL_SIZE='{}'", raw);
                },
            }
        }
        if let Ok(raw) = std::env::var("SINGBOX_WORKER_PORT_START") {
            match raw.parse::<u16>() {
                Ok(port) => self.worker_port_start = port,
                Err(_) => {
                    tracing::warn!("Ignoring non-numeric SINGBOX_WORKER_PORT_START='{}'", raw);
                },
            }
        }
        if let Ok(raw) = std::env::var("GATEWAY_NETWORK_MODE") {
            match raw.parse::<NetworkMode>() {
                Ok(mode) => self.mode = mode,
                Err(e) => tracing::warn!("Ignoring GATEWAY_NETWORK_MODE: {}", e),
            }
        }
        if let Ok(url) = std::env::var("GATEWAY_CONTROL_API_URL") {
            self.control_api_url = url;
        }
        if let Ok(secret) = std::env::var("GATEWAY_CONTROL_API_SECRET") {
            self.control_api_secret = Some(secret);
        }
    }

    /// Validate the configuration. Called once at initialization; any error
    /// here prevents startup entirely.
    pub fn validate(&self) -> GatewayResult<()> {
        if !(MIN_POOL_SIZE..=MAX_POOL_SIZE).contains(&self.worker_pool_size) {
            return Err(GatewayError::Config(format!(
                "worker_pool_size {} outside {}..={}",
                self.worker_pool_size, MIN_POOL_SIZE, MAX_POOL_SIZE
            )));
        }

        let last_port = u32::from(self.worker_port_start) + self.worker_pool_size as u32 - 1;
        if last_port > u32::from(u16::MAX) {
            return Err(GatewayError::Config(format!(
                "worker port range {}..={} overflows 65535",
                self.worker_port_start, last_port
            )));
        }

        if self.worker_selector_prefix.trim().is_empty() {
            return Err(GatewayError::Config("worker_selector_prefix is empty".into()));
        }
        if self.primary_selector.trim().is_empty() {
            return Err(GatewayError::Config("primary_selector is empty".into()));
        }
        if self.control_api_url.trim().is_empty() {
            return Err(GatewayError::Config("control_api_url is empty".into()));
        }

        Ok(())
    }

    /// Selector name for slot `index`.
    pub fn worker_selector(&self, index: usize) -> String {
        format!("{}-{}", self.worker_selector_prefix, index)
    }

    /// Local SOCKS5 port for slot `index`.
    pub fn worker_port(&self, index: usize) -> u16 {
        // validate() guarantees this cannot overflow.
        self.worker_port_start + index as u16
    }
}
