//! Worker pool — a fixed set of pre-provisioned egress slots.
//!
//! Each slot pairs one dedicated local SOCKS5 port with one dedicated
//! routing selector; both are derived from the slot index at construction
//! and never change. A slot is leased to exactly one in-flight request at a
//! time and is bound, for the duration of the lease, to one egress node.
//!
//! Slot selection-and-busy-marking is a compare-exchange on the slot's
//! `busy` flag, so concurrent acquirers can never claim the same slot.
//! Leases are RAII guards: release happens on drop no matter how the
//! request ends.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use gateway_types::{GatewayConfig, GatewayError, GatewayResult, PoolStatus, WorkerSnapshot};

use crate::adapter::{unix_now, UpstreamChannel};
use crate::control::{ControlApi, NodeProber};
use crate::registry::NodeRegistry;

/// One pool slot. Identity fields are fixed for the process lifetime; only
/// the lease state mutates.
pub struct WorkerSlot {
    id: usize,
    port: u16,
    selector: String,
    busy: AtomicBool,
    /// Node this slot is (or was last) bound to. While idle this is only
    /// "last used" — rebinding happens on the next acquisition.
    assigned_node: std::sync::RwLock<Option<String>>,
    leased_at: std::sync::RwLock<Option<Instant>>,
    request_count: AtomicU64,
    success_count: AtomicU64,
    failure_count: AtomicU64,
}

impl WorkerSlot {
    fn new(id: usize, port: u16, selector: String) -> Self {
        Self {
            id,
            port,
            selector,
            busy: AtomicBool::new(false),
            assigned_node: std::sync::RwLock::new(None),
            leased_at: std::sync::RwLock::new(None),
            request_count: AtomicU64::new(0),
            success_count: AtomicU64::new(0),
            failure_count: AtomicU64::new(0),
        }
    }

    fn socks_url(&self) -> String {
        format!("socks5://127.0.0.1:{}", self.port)
    }

    fn snapshot(&self) -> WorkerSnapshot {
        let assigned_node =
            self.assigned_node.read().ok().and_then(|guard| guard.clone());
        WorkerSnapshot {
            id: self.id,
            port: self.port,
            selector: self.selector.clone(),
            busy: self.busy.load(Ordering::SeqCst),
            assigned_node,
            request_count: self.request_count.load(Ordering::Relaxed),
            success_count: self.success_count.load(Ordering::Relaxed),
            failure_count: self.failure_count.load(Ordering::Relaxed),
        }
    }
}

/// The pool. Constructed once per process by the orchestrator.
pub struct WorkerPool {
    slots: Vec<WorkerSlot>,
    registry: Arc<NodeRegistry>,
    control: Arc<dyn ControlApi>,
    prober: NodeProber,
    /// Rotation start for idle-slot selection.
    rotation: AtomicUsize,
    node_switches: AtomicU64,
    /// Unix seconds of the last switch; 0 means never.
    last_switch_unix: AtomicU64,
}

impl WorkerPool {
    pub fn new(
        config: &GatewayConfig,
        registry: Arc<NodeRegistry>,
        control: Arc<dyn ControlApi>,
        channel: Arc<dyn UpstreamChannel>,
    ) -> Arc<Self> {
        let slots = (0..config.worker_pool_size)
            .map(|i| WorkerSlot::new(i, config.worker_port(i), config.worker_selector(i)))
            .collect();

        tracing::info!(
            pool_size = config.worker_pool_size,
            port_start = config.worker_port_start,
            selector_prefix = %config.worker_selector_prefix,
            "Worker pool initialized"
        );

        Arc::new(Self {
            slots,
            registry,
            control: control.clone(),
            prober: NodeProber::new(control, channel, config),
            rotation: AtomicUsize::new(0),
            node_switches: AtomicU64::new(0),
            last_switch_unix: AtomicU64::new(0),
        })
    }

    pub fn size(&self) -> usize {
        self.slots.len()
    }

    /// Claim the next idle slot, rotating over idle slots only. The claim
    /// itself is the compare-exchange on `busy`.
    fn claim_idle_slot(&self) -> Option<usize> {
        let n = self.slots.len();
        let start = self.rotation.fetch_add(1, Ordering::Relaxed);
        for offset in 0..n {
            let idx = (start + offset) % n;
            if self.slots[idx]
                .busy
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                return Some(idx);
            }
        }
        None
    }

    /// Lease a slot and lazily bind it to a healthy node.
    ///
    /// Candidates come from the registry's rotation; each is probed through
    /// the slot's own SOCKS5 port *after* the slot selector is switched to
    /// it, so the probed path is exactly the path the real request will
    /// take. Candidates that fail the probe are quarantined and the next
    /// one is tried, bounded by the healthy-set size at entry.
    pub async fn acquire(self: &Arc<Self>) -> GatewayResult<WorkerLease> {
        let healthy = self.registry.healthy_count().await;
        if healthy == 0 {
            return Err(GatewayError::NoHealthyNode);
        }

        let slot_id = self
            .claim_idle_slot()
            .ok_or(GatewayError::PoolExhausted { pool_size: self.slots.len() })?;
        let slot = &self.slots[slot_id];

        for _ in 0..healthy {
            let Some(candidate) = self.registry.next_healthy().await else {
                break;
            };

            if let Err(e) = self.control.set_selection(&slot.selector, &candidate).await {
                tracing::warn!(
                    selector = %slot.selector,
                    node = %candidate,
                    error = %e,
                    "Failed to bind slot selector"
                );
                // The control failure happened while binding this specific
                // node, so it counts against the node.
                self.registry
                    .quarantine(&candidate, &format!("selector bind failed: {e}"))
                    .await;
                continue;
            }

            if !self.prober.probe_through(&slot.socks_url()).await {
                self.registry.quarantine(&candidate, "lazy health check failed").await;
                continue;
            }

            self.commit_binding(slot, &candidate);
            tracing::debug!(
                worker = slot.id,
                port = slot.port,
                node = %candidate,
                "Worker leased"
            );
            return Ok(WorkerLease {
                pool: Arc::clone(self),
                slot_id,
                port: slot.port,
                node: candidate,
            });
        }

        // Every candidate failed; hand the slot back before reporting.
        self.release_slot(slot_id);
        Err(GatewayError::NoHealthyNode)
    }

    fn commit_binding(&self, slot: &WorkerSlot, node: &str) {
        let mut previous = None;
        if let Ok(mut assigned) = slot.assigned_node.write() {
            previous = assigned.replace(node.to_string());
        }
        if previous.as_deref() != Some(node) {
            self.node_switches.fetch_add(1, Ordering::Relaxed);
            self.last_switch_unix.store(unix_now(), Ordering::Relaxed);
        }
        if let Ok(mut leased_at) = slot.leased_at.write() {
            *leased_at = Some(Instant::now());
        }
        slot.request_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Return a slot to idle. Releasing an already-idle slot is a no-op.
    pub(crate) fn release_slot(&self, slot_id: usize) {
        let Some(slot) = self.slots.get(slot_id) else { return };
        if slot.busy.swap(false, Ordering::SeqCst) {
            if let Ok(mut leased_at) = slot.leased_at.write() {
                *leased_at = None;
            }
            tracing::trace!(worker = slot_id, "Worker released");
        }
    }

    /// Release every slot. Used on shutdown.
    pub fn release_all(&self) {
        for slot in &self.slots {
            self.release_slot(slot.id);
        }
    }

    /// Record the outcome of the request that held `slot_id`.
    pub fn record_outcome(&self, slot_id: usize, success: bool) {
        let Some(slot) = self.slots.get(slot_id) else { return };
        if success {
            slot.success_count.fetch_add(1, Ordering::Relaxed);
        } else {
            slot.failure_count.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn busy_count(&self) -> usize {
        self.slots.iter().filter(|s| s.busy.load(Ordering::SeqCst)).count()
    }

    /// Observability snapshot.
    pub fn status(&self) -> PoolStatus {
        let workers: Vec<WorkerSnapshot> = self.slots.iter().map(WorkerSlot::snapshot).collect();
        let busy = workers.iter().filter(|w| w.busy).count();
        PoolStatus { pool_size: self.slots.len(), busy, idle: self.slots.len() - busy, workers }
    }

    /// (total node switches, unix seconds of the last one).
    pub fn switch_stats(&self) -> (u64, Option<u64>) {
        let switches = self.node_switches.load(Ordering::Relaxed);
        let last = self.last_switch_unix.load(Ordering::Relaxed);
        (switches, (last > 0).then_some(last))
    }
}

/// A leased slot. Dropping the lease releases the slot unconditionally, so
/// pool bookkeeping survives any failure in the request that held it.
pub struct WorkerLease {
    pool: Arc<WorkerPool>,
    slot_id: usize,
    port: u16,
    node: String,
}

impl std::fmt::Debug for WorkerLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerLease")
            .field("slot_id", &self.slot_id)
            .field("port", &self.port)
            .field("node", &self.node)
            .finish()
    }
}

impl WorkerLease {
    pub fn slot_id(&self) -> usize {
        self.slot_id
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// The node this lease is bound to.
    pub fn node(&self) -> &str {
        &self.node
    }

    /// Proxy URL of the slot's dedicated SOCKS5 listener.
    pub fn proxy_url(&self) -> String {
        format!("socks5://127.0.0.1:{}", self.port)
    }
}

impl Drop for WorkerLease {
    fn drop(&mut self) {
        self.pool.release_slot(self.slot_id);
    }
}
