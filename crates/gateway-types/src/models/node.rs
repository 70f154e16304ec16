//! Node health and quarantine models.
//!
//! A node is an opaque tag enumerated from the proxy engine. At any time it
//! is either healthy or quarantined — never both, never neither once known.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Health status of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Healthy,
    QuarantinedTemporary,
    QuarantinedPermanent,
}

/// Whether a quarantine is expected to clear on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuarantineType {
    /// Transient failures (connection errors, 5xx). Recovers after 2
    /// consecutive passing probes.
    Temporary,
    /// Quota/credential/suspension failures. Excluded from the recovery
    /// sweep unless permanent recovery is enabled; threshold is 3 passes.
    Permanent,
}

/// Reason substrings that mark a quarantine as permanent. Matching is
/// case-insensitive on the reason text reported at quarantine time.
const PERMANENT_PATTERNS: &[&str] = &[
    "quota",
    "http 403",
    "status 403",
    "http 429",
    "status 429",
    "too many requests",
    "forbidden",
    "suspend",
    "invalid credential",
    "invalid token",
    "invalid api key",
    "unauthorized",
];

impl QuarantineType {
    /// Classify a failure reason into temporary or permanent quarantine.
    pub fn classify(reason: &str) -> Self {
        let lowered = reason.to_ascii_lowercase();
        if PERMANENT_PATTERNS.iter().any(|p| lowered.contains(p)) {
            QuarantineType::Permanent
        } else {
            QuarantineType::Temporary
        }
    }

    /// Consecutive passing probes required before the node returns to healthy.
    pub fn recovery_threshold(self, permanent_threshold: u32, temporary_threshold: u32) -> u32 {
        match self {
            QuarantineType::Temporary => temporary_threshold,
            QuarantineType::Permanent => permanent_threshold,
        }
    }
}

impl std::fmt::Display for QuarantineType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QuarantineType::Temporary => write!(f, "temporary"),
            QuarantineType::Permanent => write!(f, "permanent"),
        }
    }
}

/// One quarantined node's state. Persisted to the quarantine file keyed by
/// node id so restarts do not immediately re-trust failing nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuarantineRecord {
    /// Failure reason reported at quarantine time.
    pub reason: String,
    /// When the node (last) entered quarantine.
    pub timestamp: DateTime<Utc>,
    /// How many times the node has entered quarantine.
    pub retry_count: u32,
    pub quarantine_type: QuarantineType,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    /// Last probe time, if the recovery sweep has visited this node.
    pub last_health_check: Option<DateTime<Utc>>,
}

impl QuarantineRecord {
    pub fn new(reason: impl Into<String>) -> Self {
        let reason = reason.into();
        let quarantine_type = QuarantineType::classify(&reason);
        Self {
            reason,
            timestamp: Utc::now(),
            retry_count: 1,
            quarantine_type,
            consecutive_failures: 1,
            consecutive_successes: 0,
            last_health_check: None,
        }
    }
}

/// A node as reported by `list_nodes()` on the management surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeEntry {
    pub name: String,
    pub status: NodeStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quarantine: Option<QuarantineRecord>,
}
