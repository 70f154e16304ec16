//! # Gateway Types
//!
//! Foundational types for the proxy gateway:
//!
//! - **`error`** - Typed error hierarchy for gateway, control-API and configuration failures
//! - **`config`** - The gateway configuration surface with validation
//! - **`models`** - Domain models (nodes, quarantine records, pool/worker snapshots, stats)
//!
//! This crate sits at the bottom of the dependency graph and performs no I/O.
//! All types are serde-serializable so the host service can expose them over
//! its own management surface unchanged.

pub mod config;
pub mod error;
pub mod models;

pub use config::GatewayConfig;
pub use error::{ControlApiError, GatewayError, GatewayResult};
pub use models::{
    GatewayStats, GatewayStatus, NetworkMode, NodeEntry, NodeStatus, PoolStatus, QuarantineRecord,
    QuarantineType, WorkerSnapshot,
};
