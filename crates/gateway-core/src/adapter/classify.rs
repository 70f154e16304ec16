//! Failure classification for gateway-mode responses.
//!
//! Only a small set of statuses is treated as a node failure; everything
//! else belongs to the caller and must pass through unchanged.

use gateway_types::GatewayError;

use super::UpstreamResponse;

/// Statuses that indicate the bound node (not the request) is at fault.
const NODE_FAILURE_STATUSES: &[u16] = &[403, 429, 502, 503];

/// Body fragments marking an upstream content-moderation rejection.
const CONTENT_POLICY_PATTERNS: &[&str] = &["content_policy", "policy_violation", "flagged"];

/// How a gateway-mode attempt should proceed after a response.
#[derive(Debug)]
pub enum ResponseClass {
    /// Not a node failure; hand the response to the caller unchanged.
    Pass,
    /// Node failure: quarantine the bound node and retry on a fresh one.
    NodeFailure(GatewayError),
    /// Caller-input problem: propagate immediately, no quarantine, no retry.
    Terminal(GatewayError),
}

/// Classify an upstream response per the gateway failure model.
pub fn classify_response(response: &UpstreamResponse) -> ResponseClass {
    let status = response.status;

    if status == 400 && is_content_policy_body(&response.body) {
        return ResponseClass::Terminal(GatewayError::ContentPolicy(body_excerpt(&response.body)));
    }

    if NODE_FAILURE_STATUSES.contains(&status) {
        return ResponseClass::NodeFailure(GatewayError::UpstreamHttp {
            status,
            message: body_excerpt(&response.body),
        });
    }

    ResponseClass::Pass
}

fn is_content_policy_body(body: &[u8]) -> bool {
    let text = String::from_utf8_lossy(body).to_ascii_lowercase();
    CONTENT_POLICY_PATTERNS.iter().any(|p| text.contains(p))
}

fn body_excerpt(body: &[u8]) -> String {
    String::from_utf8_lossy(body).chars().take(200).collect()
}
