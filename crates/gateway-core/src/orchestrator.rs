//! Gateway orchestrator — wires registry, pool and adapter together and owns
//! the background loops.
//!
//! A process runs at most one orchestrator. [`GatewayOrchestrator::initialize`]
//! guards construction with a `OnceCell`, so concurrent initializers all wait
//! for the same in-flight build and receive the same instance.
//!
//! Two loops run while the orchestrator is up:
//!
//! - **liveness** (default 30s): probes end-to-end through the current mode;
//!   a failure quarantines the node bound by the most recent gateway attempt.
//! - **quarantine sweep** (default 10min, first run delayed): probes
//!   quarantined nodes via the primary selector and feeds passing ones into
//!   the hysteresis-gated recovery.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, OnceCell};
use tokio::task::JoinHandle;

use gateway_types::{
    GatewayConfig, GatewayResult, GatewayStats, GatewayStatus, NetworkMode, NodeEntry,
    QuarantineType,
};

use crate::adapter::{NetworkAdapter, ReqwestChannel, RequestOptions, UpstreamChannel, UpstreamResponse};
use crate::control::{ClashApiClient, ControlApi, NodeProber};
use crate::pool::WorkerPool;
use crate::registry::{NodeRegistry, QuarantineStore};

static INSTANCE: OnceCell<Arc<GatewayOrchestrator>> = OnceCell::const_new();

pub struct GatewayOrchestrator {
    config: GatewayConfig,
    registry: Arc<NodeRegistry>,
    pool: Arc<WorkerPool>,
    adapter: Arc<NetworkAdapter>,
    prober: NodeProber,
    shutdown: watch::Sender<bool>,
    running: AtomicBool,
    tasks: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl GatewayOrchestrator {
    /// Initialize (or return) the process-wide orchestrator.
    pub async fn initialize(config: GatewayConfig) -> GatewayResult<Arc<Self>> {
        let instance = INSTANCE
            .get_or_try_init(|| async {
                let mut config = config;
                config.apply_env_overrides();
                config.validate()?;

                let control: Arc<dyn ControlApi> = Arc::new(ClashApiClient::new(
                    &config.control_api_url,
                    config.control_api_secret.clone(),
                    config.control_timeout_ms,
                )?);
                let channel: Arc<dyn UpstreamChannel> = Arc::new(ReqwestChannel::new(
                    Duration::from_secs(config.request_timeout_secs),
                ));
                Self::with_components(config, control, channel).await
            })
            .await?;
        Ok(instance.clone())
    }

    pub fn instance() -> Option<Arc<Self>> {
        INSTANCE.get().cloned()
    }

    /// Build an orchestrator from explicit components. This is the seam the
    /// tests use; `initialize` goes through it with production components.
    pub async fn with_components(
        config: GatewayConfig,
        control: Arc<dyn ControlApi>,
        channel: Arc<dyn UpstreamChannel>,
    ) -> GatewayResult<Arc<Self>> {
        config.validate()?;

        let store = QuarantineStore::new(config.quarantine_file.clone());
        let registry = Arc::new(NodeRegistry::new(&config, control.clone(), Some(store)));
        registry.refresh().await?;
        registry.load_persisted().await;

        let pool = WorkerPool::new(&config, registry.clone(), control.clone(), channel.clone());
        let adapter = Arc::new(NetworkAdapter::new(
            config.clone(),
            pool.clone(),
            registry.clone(),
            channel.clone(),
        ));
        let prober = NodeProber::new(control, channel, &config);

        let (shutdown, _) = watch::channel(false);
        let orchestrator = Arc::new(Self {
            config,
            registry,
            pool,
            adapter,
            prober,
            shutdown,
            running: AtomicBool::new(true),
            tasks: std::sync::Mutex::new(Vec::new()),
        });
        orchestrator.start_loops();

        let nodes = orchestrator.registry.known_count().await;
        tracing::info!(
            mode = %orchestrator.config.mode,
            pool_size = orchestrator.pool.size(),
            nodes,
            "Gateway orchestrator started"
        );
        Ok(orchestrator)
    }

    fn start_loops(self: &Arc<Self>) {
        let mut handles = Vec::new();

        if self.config.health_check_interval_secs > 0 {
            let orch = Arc::clone(self);
            let mut rx = self.shutdown.subscribe();
            let interval = Duration::from_secs(self.config.health_check_interval_secs);
            handles.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = tokio::time::sleep(interval) => orch.run_liveness_check().await,
                        _ = rx.changed() => {
                            tracing::debug!("Liveness loop stopped");
                            break;
                        },
                    }
                }
            }));
        }

        if self.config.quarantine_sweep_interval_secs > 0 {
            let orch = Arc::clone(self);
            let mut rx = self.shutdown.subscribe();
            let delay = Duration::from_secs(self.config.sweep_startup_delay_secs);
            let interval = Duration::from_secs(self.config.quarantine_sweep_interval_secs);
            handles.push(tokio::spawn(async move {
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {},
                    _ = rx.changed() => return,
                }
                loop {
                    orch.sweep_quarantined().await;
                    tokio::select! {
                        _ = tokio::time::sleep(interval) => {},
                        _ = rx.changed() => {
                            tracing::debug!("Quarantine sweep loop stopped");
                            break;
                        },
                    }
                }
            }));
        }

        if let Ok(mut tasks) = self.tasks.lock() {
            *tasks = handles;
        }
    }

    async fn run_liveness_check(&self) {
        if let Err(e) = self.adapter.health_check().await {
            tracing::warn!(error = %e, "Liveness check failed");
            // The probe went through whatever node the adapter last bound;
            // treat that node as the suspect.
            if let Some(node) = self.adapter.current_node().await {
                self.registry.quarantine(&node, &format!("liveness check failed: {e}")).await;
            }
        }
    }

    /// One pass of the quarantine-recovery sweep: probe each quarantined node
    /// through the primary selector and feed the result into recovery.
    pub async fn sweep_quarantined(&self) {
        let candidates = self.registry.quarantined_nodes(None).await;
        if candidates.is_empty() {
            return;
        }
        tracing::debug!(candidates = candidates.len(), "Running quarantine sweep");

        for (node, record) in candidates {
            if record.quarantine_type == QuarantineType::Permanent
                && !self.config.enable_permanent_recovery
            {
                continue;
            }

            match self.prober.probe_via_primary(&node).await {
                Ok(true) => {
                    if let Err(e) = self.registry.recover(&node, false).await {
                        tracing::warn!(node = %node, error = %e, "Recovery bookkeeping failed");
                    }
                },
                Ok(false) => self.registry.record_probe_failure(&node).await,
                Err(e) => {
                    // Control API trouble says nothing about the node itself.
                    tracing::warn!(node = %node, error = %e, "Sweep probe skipped, control API error");
                },
            }
        }
    }

    /// Execute one outbound request under the current network mode.
    pub async fn request(&self, options: RequestOptions) -> GatewayResult<UpstreamResponse> {
        self.adapter.request(options).await
    }

    pub async fn health_check(&self) -> GatewayResult<()> {
        self.adapter.health_check().await
    }

    pub async fn mode(&self) -> NetworkMode {
        self.adapter.mode().await
    }

    /// Switch the network mode at runtime. In-flight requests finish under
    /// the mode they started with.
    pub async fn switch_mode(&self, mode: NetworkMode) {
        self.adapter.set_mode(mode).await;
    }

    /// Re-enumerate nodes without tearing down worker slots. A busy slot
    /// bound to a vanished node simply finishes its request; the next lease
    /// rebinds it.
    pub async fn reload(&self) -> GatewayResult<usize> {
        self.registry.refresh().await
    }

    pub async fn list_nodes(&self) -> Vec<NodeEntry> {
        self.registry.snapshot().await
    }

    pub async fn healthy_nodes(&self) -> Vec<String> {
        self.registry.healthy_nodes().await
    }

    /// Quarantine a node on behalf of the host service.
    pub async fn mark_node_failed(&self, node: &str, reason: &str) {
        self.registry.quarantine(node, reason).await;
    }

    /// Force a node back to healthy, bypassing hysteresis.
    pub async fn mark_node_healthy(&self, node: &str) {
        if let Err(e) = self.registry.recover(node, true).await {
            tracing::warn!(node = %node, error = %e, "Forced recovery failed");
        }
    }

    pub async fn stats(&self) -> GatewayStats {
        self.adapter.stats().await
    }

    pub async fn status(&self) -> GatewayStatus {
        GatewayStatus {
            mode: self.adapter.mode().await,
            running: self.running.load(Ordering::SeqCst),
            healthy_nodes: self.registry.healthy_count().await,
            quarantined_nodes: self.registry.quarantined_count().await,
            pool: self.pool.status(),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Stop the background loops and release all slots. Configuration and
    /// persisted quarantine state survive; a later `reload` resumes serving.
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        let _ = self.shutdown.send(true);
        if let Ok(mut tasks) = self.tasks.lock() {
            for handle in tasks.drain(..) {
                handle.abort();
            }
        }
        self.pool.release_all();
        tracing::info!("Gateway orchestrator stopped");
    }
}

impl Drop for GatewayOrchestrator {
    fn drop(&mut self) {
        self.stop();
    }
}
