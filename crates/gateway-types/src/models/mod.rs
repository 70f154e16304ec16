//! Domain models for the gateway.

pub mod node;
pub mod stats;

pub use node::{NodeEntry, NodeStatus, QuarantineRecord, QuarantineType};
pub use stats::{GatewayStats, GatewayStatus, PoolStatus, WorkerSnapshot};

use serde::{Deserialize, Serialize};

/// How outbound requests reach the upstream endpoint.
///
/// A live, swappable setting — not compiled in. `Gateway` is the worker-pool
/// path; `Fallback` tries `Direct` first and falls back to the gateway (or
/// the static list when the gateway is disabled).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkMode {
    Direct,
    StaticProxyList,
    Gateway,
    Fallback,
}

impl std::fmt::Display for NetworkMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NetworkMode::Direct => write!(f, "direct"),
            NetworkMode::StaticProxyList => write!(f, "static_proxy_list"),
            NetworkMode::Gateway => write!(f, "gateway"),
            NetworkMode::Fallback => write!(f, "fallback"),
        }
    }
}

impl std::str::FromStr for NetworkMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "direct" => Ok(NetworkMode::Direct),
            "static_proxy_list" | "static" => Ok(NetworkMode::StaticProxyList),
            "gateway" => Ok(NetworkMode::Gateway),
            "fallback" => Ok(NetworkMode::Fallback),
            other => Err(format!("unknown network mode '{other}'")),
        }
    }
}
