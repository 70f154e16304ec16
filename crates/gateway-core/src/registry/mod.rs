//! Node registry — the healthy/quarantined partition.
//!
//! Every known node is in exactly one of the healthy set or the quarantine
//! map at any time. Mutations come from many concurrent request tasks and
//! from the two background loops; a single lock over the whole state is
//! sufficient at gateway call volumes.

pub mod store;

pub use store::QuarantineStore;

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use chrono::Utc;
use gateway_types::{
    GatewayConfig, GatewayResult, NodeEntry, NodeStatus, QuarantineRecord, QuarantineType,
};

use crate::control::ControlApi;

#[derive(Debug, Default)]
struct RegistryState {
    healthy: Vec<String>,
    quarantined: HashMap<String, QuarantineRecord>,
    /// Index of the next rotation candidate. Shifted down when a node ahead
    /// of it is removed, so a removal never skips the following survivor.
    rotation: usize,
}

impl RegistryState {
    /// Remove `healthy[pos]`, keeping the rotation pointed at the same
    /// upcoming node.
    fn remove_healthy(&mut self, pos: usize) -> String {
        if pos < self.rotation {
            self.rotation -= 1;
        }
        self.healthy.remove(pos)
    }
}

pub struct NodeRegistry {
    control: Arc<dyn ControlApi>,
    state: RwLock<RegistryState>,
    store: Option<QuarantineStore>,
    primary_selector: String,
    worker_selector_prefix: String,
    fallback_nodes: Vec<String>,
    temporary_recovery_threshold: u32,
    permanent_recovery_threshold: u32,
    enable_permanent_recovery: bool,
}

impl NodeRegistry {
    pub fn new(
        config: &GatewayConfig,
        control: Arc<dyn ControlApi>,
        store: Option<QuarantineStore>,
    ) -> Self {
        Self {
            control,
            state: RwLock::new(RegistryState::default()),
            store,
            primary_selector: config.primary_selector.clone(),
            worker_selector_prefix: config.worker_selector_prefix.clone(),
            fallback_nodes: config.fallback_nodes.clone(),
            temporary_recovery_threshold: config.temporary_recovery_threshold,
            permanent_recovery_threshold: config.permanent_recovery_threshold,
            enable_permanent_recovery: config.enable_permanent_recovery,
        }
    }

    /// Whether `name` is one of our own selectors rather than an engine node.
    fn is_own_selector(&self, name: &str) -> bool {
        name == self.primary_selector
            || name == self.worker_selector_prefix
            || name.starts_with(&format!("{}-", self.worker_selector_prefix))
    }

    /// Enumerate nodes from the control API and replace the known set.
    /// Nodes that vanished upstream are dropped, including their quarantine
    /// records; quarantine state of surviving nodes is preserved.
    ///
    /// On control-API failure the configured static fallback list is used
    /// instead — enumeration failure never fails startup.
    pub async fn refresh(&self) -> GatewayResult<usize> {
        let nodes: Vec<String> = match self.control.list_proxies().await {
            Ok(entries) => entries
                .into_iter()
                .filter(|e| e.is_leaf_node() && !self.is_own_selector(&e.name))
                .map(|e| e.name)
                .collect(),
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    fallback_nodes = self.fallback_nodes.len(),
                    "Control API enumeration failed, using static fallback node list"
                );
                self.fallback_nodes
                    .iter()
                    .filter(|name| !self.is_own_selector(name))
                    .cloned()
                    .collect()
            },
        };

        let mut state = self.state.write().await;
        let before = state.quarantined.len();
        state.quarantined.retain(|name, _| nodes.contains(name));
        let pruned = before - state.quarantined.len();
        state.healthy =
            nodes.iter().filter(|n| !state.quarantined.contains_key(*n)).cloned().collect();

        tracing::info!(
            total = nodes.len(),
            healthy = state.healthy.len(),
            quarantined = state.quarantined.len(),
            "Node registry refreshed"
        );
        if pruned > 0 {
            self.persist(state.quarantined.clone());
        }

        Ok(nodes.len())
    }

    /// Apply records persisted by a previous run. Records for nodes no
    /// longer known are dropped; matching healthy nodes move to quarantine.
    pub async fn load_persisted(&self) {
        let Some(store) = &self.store else { return };

        let records = match store.load().await {
            Ok(records) => records,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to load persisted quarantine state, starting clean");
                return;
            },
        };
        if records.is_empty() {
            return;
        }

        let mut state = self.state.write().await;
        let mut applied = 0usize;
        for (node, record) in records {
            if let Some(pos) = state.healthy.iter().position(|n| n == &node) {
                state.remove_healthy(pos);
                state.quarantined.insert(node, record);
                applied += 1;
            }
        }
        tracing::info!(applied, "Restored quarantine records from previous run");
    }

    /// Move a node out of the healthy set, classifying the reason.
    pub async fn quarantine(&self, node: &str, reason: &str) {
        let mut state = self.state.write().await;

        if let Some(pos) = state.healthy.iter().position(|n| n == node) {
            state.remove_healthy(pos);
        } else if !state.quarantined.contains_key(node) {
            tracing::warn!(node = %node, "Quarantine requested for unknown node, ignoring");
            return;
        }

        let new_type = QuarantineType::classify(reason);
        match state.quarantined.get_mut(node) {
            Some(record) => {
                record.retry_count += 1;
                record.consecutive_failures += 1;
                record.consecutive_successes = 0;
                record.reason = reason.to_string();
                record.timestamp = Utc::now();
                // Permanent never downgrades back to temporary.
                if new_type == QuarantineType::Permanent {
                    record.quarantine_type = QuarantineType::Permanent;
                }
            },
            None => {
                state.quarantined.insert(node.to_string(), QuarantineRecord::new(reason));
            },
        }

        let record = &state.quarantined[node];
        tracing::warn!(
            node = %node,
            reason = %reason,
            quarantine_type = %record.quarantine_type,
            retry_count = record.retry_count,
            "⛔ Node quarantined"
        );
        self.persist(state.quarantined.clone());
    }

    /// Record a passing probe for a quarantined node. Returns whether the
    /// node is healthy afterwards.
    ///
    /// A permanently quarantined node is refused unless `force` is set or
    /// permanent recovery is enabled by configuration.
    pub async fn recover(&self, node: &str, force: bool) -> GatewayResult<bool> {
        let mut state = self.state.write().await;

        if state.healthy.iter().any(|n| n == node) {
            return Ok(true);
        }

        let Some(record) = state.quarantined.get_mut(node) else {
            tracing::debug!(node = %node, "Recovery requested for unknown node");
            return Ok(false);
        };

        if record.quarantine_type == QuarantineType::Permanent
            && !force
            && !self.enable_permanent_recovery
        {
            tracing::debug!(node = %node, "Permanent quarantine, recovery disabled by config");
            return Ok(false);
        }

        record.consecutive_successes += 1;
        record.consecutive_failures = 0;
        record.last_health_check = Some(Utc::now());

        let threshold = record.quarantine_type.recovery_threshold(
            self.permanent_recovery_threshold,
            self.temporary_recovery_threshold,
        );

        let now_healthy = if force || record.consecutive_successes >= threshold {
            state.quarantined.remove(node);
            state.healthy.push(node.to_string());
            tracing::info!(node = %node, forced = force, "✅ Node recovered to healthy");
            true
        } else {
            let successes = record.consecutive_successes;
            tracing::debug!(
                node = %node,
                successes,
                threshold,
                "Node passed probe, not yet recovered"
            );
            false
        };
        self.persist(state.quarantined.clone());
        Ok(now_healthy)
    }

    /// Record a failing probe for a quarantined node: the success streak
    /// resets to zero.
    pub async fn record_probe_failure(&self, node: &str) {
        let mut state = self.state.write().await;
        let Some(record) = state.quarantined.get_mut(node) else { return };
        record.consecutive_successes = 0;
        record.consecutive_failures += 1;
        record.last_health_check = Some(Utc::now());
        self.persist(state.quarantined.clone());
    }

    /// Next healthy node by round robin. `None` when the healthy set is empty.
    pub async fn next_healthy(&self) -> Option<String> {
        let mut state = self.state.write().await;
        if state.healthy.is_empty() {
            return None;
        }
        // The set may have shrunk since the index was advanced.
        let idx = if state.rotation >= state.healthy.len() { 0 } else { state.rotation };
        state.rotation = (idx + 1) % state.healthy.len();
        Some(state.healthy[idx].clone())
    }

    /// Read-only snapshot for the recovery sweep.
    pub async fn quarantined_nodes(
        &self,
        filter: Option<QuarantineType>,
    ) -> Vec<(String, QuarantineRecord)> {
        let state = self.state.read().await;
        state
            .quarantined
            .iter()
            .filter(|(_, r)| filter.is_none_or(|t| r.quarantine_type == t))
            .map(|(n, r)| (n.clone(), r.clone()))
            .collect()
    }

    pub async fn healthy_count(&self) -> usize {
        self.state.read().await.healthy.len()
    }

    pub async fn quarantined_count(&self) -> usize {
        self.state.read().await.quarantined.len()
    }

    pub async fn known_count(&self) -> usize {
        let state = self.state.read().await;
        state.healthy.len() + state.quarantined.len()
    }

    pub async fn healthy_nodes(&self) -> Vec<String> {
        self.state.read().await.healthy.clone()
    }

    /// All known nodes with their status, for the management surface.
    pub async fn snapshot(&self) -> Vec<NodeEntry> {
        let state = self.state.read().await;
        let mut entries: Vec<NodeEntry> = state
            .healthy
            .iter()
            .map(|n| NodeEntry { name: n.clone(), status: NodeStatus::Healthy, quarantine: None })
            .collect();
        entries.extend(state.quarantined.iter().map(|(n, r)| NodeEntry {
            name: n.clone(),
            status: match r.quarantine_type {
                QuarantineType::Temporary => NodeStatus::QuarantinedTemporary,
                QuarantineType::Permanent => NodeStatus::QuarantinedPermanent,
            },
            quarantine: Some(r.clone()),
        }));
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        entries
    }

    fn persist(&self, snapshot: HashMap<String, QuarantineRecord>) {
        if let Some(store) = &self.store {
            store.save_detached(snapshot);
        }
    }
}
