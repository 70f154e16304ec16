//! # Gateway Core
//!
//! The egress-routing core: decides, per outbound call, which network path to
//! use among a pool of rotating proxy nodes, and keeps that decision correct
//! as nodes go up and down.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │  GatewayOrchestrator (process-wide singleton)            │
//! │  ├── NetworkAdapter   — mode dispatch + classification   │
//! │  ├── WorkerPool       — leased (port, selector) slots    │
//! │  ├── NodeRegistry     — healthy / quarantined partition  │
//! │  ├── ClashApiClient   — engine management API            │
//! │  └── liveness + quarantine-sweep background loops        │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! The gateway never accepts connections; it only originates them. The proxy
//! engine itself is a separate, already-running process driven through its
//! Clash-compatible control API; its per-port SOCKS5 listeners are treated as
//! opaque egress sockets.

pub mod adapter;
pub mod control;
pub mod logging;
pub mod orchestrator;
pub mod pool;
pub mod provider;
pub mod registry;

// Re-export commonly used types
pub use adapter::{NetworkAdapter, RequestOptions, UpstreamChannel, UpstreamResponse};
pub use control::{ClashApiClient, ControlApi, NodeProber, ProxyEntry};
pub use gateway_types::{
    ControlApiError, GatewayConfig, GatewayError, GatewayResult, GatewayStats, GatewayStatus,
    NetworkMode, NodeEntry, NodeStatus, PoolStatus, QuarantineRecord, QuarantineType,
    WorkerSnapshot,
};
pub use orchestrator::GatewayOrchestrator;
pub use pool::{WorkerLease, WorkerPool};
pub use provider::ProxyProvider;
pub use registry::NodeRegistry;
