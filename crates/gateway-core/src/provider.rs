//! Host-facing provider abstraction.
//!
//! Services that sit on top of the gateway (request schedulers, session
//! routers) only need node availability and failure feedback, not the whole
//! orchestrator surface. They take a `dyn ProxyProvider` and stay testable
//! against trivial fakes.

use async_trait::async_trait;

use gateway_types::GatewayStats;

use crate::orchestrator::GatewayOrchestrator;

#[async_trait]
pub trait ProxyProvider: Send + Sync {
    /// Nodes currently eligible for traffic.
    async fn available_nodes(&self) -> Vec<String>;

    /// Report an upstream failure attributed to `node`.
    async fn mark_node_failed(&self, node: &str, reason: &str);

    /// Force `node` back into rotation.
    async fn mark_node_healthy(&self, node: &str);

    async fn stats(&self) -> GatewayStats;
}

#[async_trait]
impl ProxyProvider for GatewayOrchestrator {
    async fn available_nodes(&self) -> Vec<String> {
        self.healthy_nodes().await
    }

    async fn mark_node_failed(&self, node: &str, reason: &str) {
        GatewayOrchestrator::mark_node_failed(self, node, reason).await;
    }

    async fn mark_node_healthy(&self, node: &str) {
        GatewayOrchestrator::mark_node_healthy(self, node).await;
    }

    async fn stats(&self) -> GatewayStats {
        GatewayOrchestrator::stats(self).await
    }
}
