//! Observability snapshots — no correctness dependency.

use serde::{Deserialize, Serialize};

/// Point-in-time state of one worker slot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerSnapshot {
    pub id: usize,
    /// Dedicated local SOCKS5 port for this slot.
    pub port: u16,
    /// Dedicated routing selector for this slot.
    pub selector: String,
    pub busy: bool,
    /// Node this slot is (or was last) bound to. Only meaningful as
    /// "currently bound" while `busy` is true.
    pub assigned_node: Option<String>,
    pub request_count: u64,
    pub success_count: u64,
    pub failure_count: u64,
}

/// Pool-level snapshot for the management surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolStatus {
    pub pool_size: usize,
    pub busy: usize,
    pub idle: usize,
    pub workers: Vec<WorkerSnapshot>,
}

/// Process-lifetime request counters.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct GatewayStats {
    pub total_requests: u64,
    pub success_count: u64,
    pub failure_count: u64,
    /// Cumulative request latency, for average-latency dashboards.
    pub total_latency_ms: u64,
    /// Times a slot was bound to a different node than its previous lease.
    pub node_switches: u64,
    /// Unix timestamp of the most recent node switch.
    pub last_switch_unix: Option<u64>,
}

/// Full gateway state for the host service's status endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayStatus {
    pub mode: super::NetworkMode,
    pub running: bool,
    pub healthy_nodes: usize,
    pub quarantined_nodes: usize,
    pub pool: PoolStatus,
}
