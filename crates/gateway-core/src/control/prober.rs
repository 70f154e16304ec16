//! Node liveness probing.
//!
//! A probe is a short-timeout GET of a well-known endpoint that must answer
//! with an exact no-content status. Two bindings exist:
//!
//! - `probe_via_primary` switches the engine's primary selector and probes
//!   through the engine's default SOCKS egress — used by the quarantine
//!   sweep, where no worker slot is involved.
//! - `probe_through` probes an explicit proxy URL — the worker pool uses it
//!   against the slot's own port after binding the slot selector, so the
//!   probed path is exactly the path real traffic will take.

use std::sync::Arc;
use std::time::Duration;

use gateway_types::{ControlApiError, GatewayConfig};

use super::ControlApi;
use crate::adapter::{RequestOptions, Route, UpstreamChannel};

pub struct NodeProber {
    control: Arc<dyn ControlApi>,
    channel: Arc<dyn UpstreamChannel>,
    primary_selector: String,
    engine_socks_url: String,
    probe_url: String,
    expect_status: u16,
    timeout: Duration,
}

impl NodeProber {
    pub fn new(
        control: Arc<dyn ControlApi>,
        channel: Arc<dyn UpstreamChannel>,
        config: &GatewayConfig,
    ) -> Self {
        Self {
            control,
            channel,
            primary_selector: config.primary_selector.clone(),
            engine_socks_url: format!("socks5://127.0.0.1:{}", config.engine_socks_port),
            probe_url: config.probe_url.clone(),
            expect_status: config.probe_expect_status,
            timeout: Duration::from_millis(config.probe_timeout_ms),
        }
    }

    /// Bind the primary selector to `node`, then probe through the engine's
    /// default egress. `Err` means the control API itself failed; `Ok(false)`
    /// means the node failed the probe.
    pub async fn probe_via_primary(&self, node: &str) -> Result<bool, ControlApiError> {
        self.control.set_selection(&self.primary_selector, node).await?;
        Ok(self.probe_through(&self.engine_socks_url).await)
    }

    /// Probe through an explicit proxy URL. Any transport error, timeout, or
    /// unexpected status is a failed probe, not an error.
    pub async fn probe_through(&self, proxy_url: &str) -> bool {
        let options = RequestOptions::get(&self.probe_url).with_timeout(self.timeout);
        match self.channel.execute(&Route::Proxy(proxy_url.to_string()), &options).await {
            Ok(response) => response.status == self.expect_status,
            Err(e) => {
                tracing::debug!(proxy = %proxy_url, error = %e, "Probe failed");
                false
            },
        }
    }
}
