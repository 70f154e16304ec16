//! Gateway error taxonomy.
//!
//! Node-level failures are absorbed by the retry loop; everything that can
//! reach a caller of `request()` is a variant here so callers can still tell
//! transport failure from policy violation from exhaustion.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors from the proxy engine's management API.
#[derive(Debug, Clone, Error, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", content = "details")]
pub enum ControlApiError {
    /// The control API did not answer within the configured timeout.
    #[error("control API timeout after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    /// The control API answered with a non-2xx status.
    #[error("control API returned HTTP {status}: {message}")]
    Status { status: u16, message: String },

    /// The control API answered 2xx but the body did not parse.
    #[error("malformed control API response: {message}")]
    Malformed { message: String },

    /// Connection-level failure talking to the control API.
    #[error("control API unreachable: {message}")]
    Transport { message: String },
}

/// Errors surfaced by gateway operations.
#[derive(Debug, Clone, Error, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", content = "details")]
pub enum GatewayError {
    /// Invalid configuration (fatal, startup-only).
    #[error("configuration error: {0}")]
    Config(String),

    /// No node passed lazy probing, or none remain healthy.
    #[error("no healthy egress node available")]
    NoHealthyNode,

    /// All worker slots are leased. Fails fast; queueing would create
    /// unbounded latency tails.
    #[error("worker pool exhausted: all {pool_size} slots busy")]
    PoolExhausted { pool_size: usize },

    /// Upstream answered with a status that classifies as a node failure.
    #[error("upstream HTTP {status}: {message}")]
    UpstreamHttp { status: u16, message: String },

    /// Connection refused/reset, DNS failure — always retryable.
    #[error("transport error: {0}")]
    Transport(String),

    /// The outbound call exceeded its timeout. Treated as a transport error
    /// for classification purposes.
    #[error("request timeout after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    /// Upstream rejected the request content itself. Never retried, never
    /// quarantines a node.
    #[error("content policy violation: {0}")]
    ContentPolicy(String),

    /// Communication failure with the proxy engine's management API.
    #[error("{0}")]
    ControlApi(#[from] ControlApiError),

    /// Fallback mode: both the direct path and the secondary path failed.
    #[error("direct path failed ({direct}); fallback path failed ({fallback})")]
    FallbackFailed { direct: String, fallback: String },

    /// Filesystem failure (quarantine persistence).
    #[error("io error: {0}")]
    Io(String),

    /// Serialization failure.
    #[error("json error: {0}")]
    Json(String),
}

impl GatewayError {
    /// Whether the gateway retry loop may try another node after this error.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::UpstreamHttp { status, .. } => matches!(status, 403 | 429 | 502 | 503),
            Self::Transport(_) | Self::Timeout { .. } => true,
            _ => false,
        }
    }

    /// Whether the node bound at the time of this error should be quarantined.
    /// Retryable failures are node failures; everything else is not.
    pub fn triggers_quarantine(&self) -> bool {
        self.is_retryable()
    }

    /// Whether this error must abort all further retry attempts immediately.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::ContentPolicy(_))
    }
}

impl From<std::io::Error> for GatewayError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}

impl From<serde_json::Error> for GatewayError {
    fn from(e: serde_json::Error) -> Self {
        Self::Json(e.to_string())
    }
}

/// Result type alias for gateway operations.
pub type GatewayResult<T> = Result<T, GatewayError>;
