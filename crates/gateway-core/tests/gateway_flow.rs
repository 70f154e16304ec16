//! End-to-end gateway flows against a scripted proxy engine.
//!
//! The engine is simulated at the two seams the gateway actually touches:
//! the control API (selector state) and the wire (per-node scripted
//! replies). Ports are resolved back to nodes through the simulated
//! selector table, exactly as the real engine would route them.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;

use gateway_core::adapter::{RequestOptions, Route, UpstreamChannel, UpstreamResponse};
use gateway_core::control::{ControlApi, ProxyEntry};
use gateway_core::{
    ControlApiError, GatewayConfig, GatewayError, GatewayOrchestrator, GatewayResult, NetworkMode,
    NodeStatus, ProxyProvider,
};

const UPSTREAM_URL: &str = "https://api.example.com/v1/speech";

#[derive(Clone)]
enum Reply {
    Status(u16, &'static str),
    Refused,
}

impl Reply {
    fn into_result(self) -> GatewayResult<UpstreamResponse> {
        match self {
            Reply::Status(status, body) => Ok(UpstreamResponse {
                status,
                headers: Vec::new(),
                body: Bytes::from_static(body.as_bytes()),
            }),
            Reply::Refused => Err(GatewayError::Transport("connection refused".into())),
        }
    }
}

/// Selector state of the simulated engine.
struct EngineControl {
    nodes: Mutex<Vec<String>>,
    selections: Mutex<HashMap<String, String>>,
    bind_log: Mutex<Vec<(String, String)>>,
}

impl EngineControl {
    fn new(nodes: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            nodes: Mutex::new(nodes.iter().map(|s| s.to_string()).collect()),
            selections: Mutex::new(HashMap::new()),
            bind_log: Mutex::new(Vec::new()),
        })
    }

    fn worker_binds(&self) -> Vec<(String, String)> {
        self.bind_log
            .lock()
            .unwrap()
            .iter()
            .filter(|(selector, _)| selector.starts_with("worker-"))
            .cloned()
            .collect()
    }
}

#[async_trait]
impl ControlApi for EngineControl {
    async fn list_proxies(&self) -> Result<Vec<ProxyEntry>, ControlApiError> {
        Ok(self
            .nodes
            .lock()
            .unwrap()
            .iter()
            .map(|n| ProxyEntry { name: n.clone(), kind: "Shadowsocks".into() })
            .collect())
    }

    async fn get_selection(&self, selector: &str) -> Result<String, ControlApiError> {
        self.selections
            .lock()
            .unwrap()
            .get(selector)
            .cloned()
            .ok_or(ControlApiError::Status { status: 404, message: "unknown selector".into() })
    }

    async fn set_selection(&self, selector: &str, node: &str) -> Result<(), ControlApiError> {
        self.bind_log.lock().unwrap().push((selector.to_string(), node.to_string()));
        self.selections.lock().unwrap().insert(selector.to_string(), node.to_string());
        Ok(())
    }
}

/// Wire side of the simulated engine. A proxied send is resolved back to the
/// node currently selected for the port's selector.
struct EngineWire {
    control: Arc<EngineControl>,
    config: GatewayConfig,
    probe_fail: Mutex<HashSet<String>>,
    node_replies: Mutex<HashMap<String, VecDeque<Reply>>>,
    static_replies: Mutex<HashMap<u16, VecDeque<Reply>>>,
    direct_replies: Mutex<VecDeque<Reply>>,
}

impl EngineWire {
    fn new(control: Arc<EngineControl>, config: &GatewayConfig) -> Arc<Self> {
        Arc::new(Self {
            control,
            config: config.clone(),
            probe_fail: Mutex::new(HashSet::new()),
            node_replies: Mutex::new(HashMap::new()),
            static_replies: Mutex::new(HashMap::new()),
            direct_replies: Mutex::new(VecDeque::new()),
        })
    }

    fn fail_probes_for(&self, nodes: &[&str]) {
        let mut set = self.probe_fail.lock().unwrap();
        for node in nodes {
            set.insert(node.to_string());
        }
    }

    fn script_node(&self, node: &str, replies: &[Reply]) {
        self.node_replies
            .lock()
            .unwrap()
            .entry(node.to_string())
            .or_default()
            .extend(replies.iter().cloned());
    }

    fn script_static(&self, port: u16, replies: &[Reply]) {
        self.static_replies.lock().unwrap().entry(port).or_default().extend(replies.iter().cloned());
    }

    fn script_direct(&self, replies: &[Reply]) {
        self.direct_replies.lock().unwrap().extend(replies.iter().cloned());
    }

    fn selector_for_port(&self, port: u16) -> Option<String> {
        if port == self.config.engine_socks_port {
            return Some(self.config.primary_selector.clone());
        }
        let index = port.checked_sub(self.config.worker_port_start)?;
        ((index as usize) < self.config.worker_pool_size)
            .then(|| self.config.worker_selector(index as usize))
    }
}

#[async_trait]
impl UpstreamChannel for EngineWire {
    async fn execute(
        &self,
        route: &Route,
        options: &RequestOptions,
    ) -> GatewayResult<UpstreamResponse> {
        let url = match route {
            Route::Direct => {
                let reply = self
                    .direct_replies
                    .lock()
                    .unwrap()
                    .pop_front()
                    .unwrap_or(Reply::Status(200, "ok"));
                return reply.into_result();
            },
            Route::Proxy(url) => url,
        };

        let port: u16 = url.rsplit(':').next().unwrap().parse().unwrap();

        if let Some(queue) = self.static_replies.lock().unwrap().get_mut(&port) {
            return queue.pop_front().unwrap_or(Reply::Status(200, "ok")).into_result();
        }

        let selector = self
            .selector_for_port(port)
            .unwrap_or_else(|| panic!("send to unmapped port {port}"));
        let node = self
            .control
            .selections
            .lock()
            .unwrap()
            .get(&selector)
            .cloned()
            .ok_or(GatewayError::Transport(format!("selector {selector} has no node")))?;

        if options.url == self.config.probe_url {
            return if self.probe_fail.lock().unwrap().contains(&node) {
                Err(GatewayError::Transport("connection refused".into()))
            } else {
                Ok(UpstreamResponse { status: 204, headers: Vec::new(), body: Bytes::new() })
            };
        }

        let reply = self
            .node_replies
            .lock()
            .unwrap()
            .get_mut(&node)
            .and_then(|queue| queue.pop_front())
            .unwrap_or(Reply::Status(200, "ok"));
        reply.into_result()
    }
}

struct Fixture {
    orchestrator: Arc<GatewayOrchestrator>,
    control: Arc<EngineControl>,
    wire: Arc<EngineWire>,
    _dir: tempfile::TempDir,
}

fn test_config(dir: &tempfile::TempDir, pool_size: usize) -> GatewayConfig {
    let mut config = GatewayConfig::default();
    config.worker_pool_size = pool_size;
    config.quarantine_file = dir.path().join("quarantine.json");
    // Background loops are driven manually in these tests.
    config.health_check_interval_secs = 0;
    config.quarantine_sweep_interval_secs = 0;
    config
}

async fn fixture(nodes: &[&str], pool_size: usize) -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(&dir, pool_size);
    fixture_from(config, nodes, dir).await
}

async fn fixture_from(config: GatewayConfig, nodes: &[&str], dir: tempfile::TempDir) -> Fixture {
    let control = EngineControl::new(nodes);
    let wire = EngineWire::new(control.clone(), &config);
    let orchestrator =
        GatewayOrchestrator::with_components(config, control.clone(), wire.clone())
            .await
            .unwrap();
    Fixture { orchestrator, control, wire, _dir: dir }
}

fn speech_request() -> RequestOptions {
    RequestOptions::post(UPSTREAM_URL, Bytes::from_static(b"{\"text\":\"hello\"}"))
}

#[tokio::test]
async fn test_rate_limited_node_is_permanently_quarantined_and_skipped() {
    let fx = fixture(&["a", "b", "c"], 2).await;
    fx.wire.script_node("a", &[Reply::Status(429, "Too Many Requests")]);

    let response = fx.orchestrator.request(speech_request()).await.unwrap();
    assert_eq!(response.status, 200);

    let nodes = fx.orchestrator.list_nodes().await;
    let entry = nodes.iter().find(|n| n.name == "a").unwrap();
    assert_eq!(entry.status, NodeStatus::QuarantinedPermanent);

    // Subsequent traffic rotates over the survivors only.
    for _ in 0..4 {
        fx.orchestrator.request(speech_request()).await.unwrap();
    }
    let later_binds: Vec<String> =
        fx.control.worker_binds().iter().skip(1).map(|(_, node)| node.clone()).collect();
    assert!(!later_binds.is_empty());
    assert!(later_binds.iter().all(|n| n != "a"));
    assert!(later_binds.iter().any(|n| n == "b"));
    assert!(later_binds.iter().any(|n| n == "c"));
}

#[tokio::test]
async fn test_retry_rebinds_fresh_node_and_releases_slot() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(&dir, 1);
    config.max_retries = 1;
    let fx = fixture_from(config, &["a", "b"], dir).await;
    fx.wire.script_node("a", &[Reply::Status(503, "upstream down")]);

    let response = fx.orchestrator.request(speech_request()).await.unwrap();
    assert_eq!(response.status, 200);

    // Exactly two lease cycles: the failed attempt and the retry.
    let binds = fx.control.worker_binds();
    assert_eq!(binds.len(), 2);
    assert_eq!(binds[0].1, "a");
    assert_ne!(binds[1].1, "a");

    let status = fx.orchestrator.status().await;
    assert_eq!(status.pool.busy, 0);

    let stats = fx.orchestrator.stats().await;
    assert_eq!(stats.total_requests, 1);
    assert_eq!(stats.success_count, 1);
    assert_eq!(stats.node_switches, 2);
}

#[tokio::test]
async fn test_all_nodes_failing_probes_yields_no_healthy_node() {
    let fx = fixture(&["a", "b"], 2).await;
    fx.wire.fail_probes_for(&["a", "b"]);

    match fx.orchestrator.request(speech_request()).await {
        Err(GatewayError::NoHealthyNode) => {},
        other => panic!("expected NoHealthyNode, got {other:?}"),
    }

    let status = fx.orchestrator.status().await;
    assert_eq!(status.pool.busy, 0);
    assert_eq!(status.healthy_nodes, 0);
    assert_eq!(status.quarantined_nodes, 2);
}

#[tokio::test]
async fn test_content_policy_rejection_aborts_without_quarantine() {
    let fx = fixture(&["a", "b"], 2).await;
    fx.wire.script_node(
        "a",
        &[Reply::Status(400, r#"{"error":{"code":"content_policy_violation"}}"#)],
    );

    match fx.orchestrator.request(speech_request()).await {
        Err(GatewayError::ContentPolicy(_)) => {},
        other => panic!("expected ContentPolicy, got {other:?}"),
    }

    // One attempt only, and the node is still in rotation.
    assert_eq!(fx.control.worker_binds().len(), 1);
    let status = fx.orchestrator.status().await;
    assert_eq!(status.healthy_nodes, 2);
    assert_eq!(status.quarantined_nodes, 0);
}

#[tokio::test]
async fn test_plain_client_error_passes_through_unchanged() {
    let fx = fixture(&["a"], 1).await;
    fx.wire.script_node("a", &[Reply::Status(404, "no such voice")]);

    let response = fx.orchestrator.request(speech_request()).await.unwrap();
    assert_eq!(response.status, 404);
    assert_eq!(fx.orchestrator.status().await.quarantined_nodes, 0);
}

#[tokio::test]
async fn test_direct_mode_bypasses_pool() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(&dir, 2);
    config.mode = NetworkMode::Direct;
    let fx = fixture_from(config, &["a"], dir).await;
    fx.wire.script_direct(&[Reply::Status(200, "ok")]);

    let response = fx.orchestrator.request(speech_request()).await.unwrap();
    assert_eq!(response.status, 200);
    assert!(fx.control.worker_binds().is_empty());
}

#[tokio::test]
async fn test_static_mode_tries_proxies_in_order() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(&dir, 1);
    config.mode = NetworkMode::StaticProxyList;
    config.static_proxies =
        vec!["socks5://10.0.0.1:31001".into(), "socks5://10.0.0.2:31002".into()];
    let fx = fixture_from(config, &["a"], dir).await;
    fx.wire.script_static(31001, &[Reply::Refused]);
    fx.wire.script_static(31002, &[Reply::Status(200, "ok")]);

    let response = fx.orchestrator.request(speech_request()).await.unwrap();
    assert_eq!(response.status, 200);
}

#[tokio::test]
async fn test_static_mode_with_empty_list_refuses_to_send() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(&dir, 1);
    config.mode = NetworkMode::StaticProxyList;
    let fx = fixture_from(config, &["a"], dir).await;

    match fx.orchestrator.request(speech_request()).await {
        Err(GatewayError::Config(_)) => {},
        other => panic!("expected Config error, got {other:?}"),
    }
}

#[tokio::test]
async fn test_fallback_reports_both_failures() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(&dir, 2);
    config.mode = NetworkMode::Fallback;
    let fx = fixture_from(config, &["a", "b"], dir).await;
    fx.wire.script_direct(&[Reply::Refused]);
    fx.wire.fail_probes_for(&["a", "b"]);

    match fx.orchestrator.request(speech_request()).await {
        Err(GatewayError::FallbackFailed { direct, fallback }) => {
            assert!(direct.contains("connection refused"), "direct: {direct}");
            assert!(fallback.contains("no healthy"), "fallback: {fallback}");
        },
        other => panic!("expected FallbackFailed, got {other:?}"),
    }
}

#[tokio::test]
async fn test_fallback_prefers_direct_when_it_works() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(&dir, 2);
    config.mode = NetworkMode::Fallback;
    let fx = fixture_from(config, &["a"], dir).await;

    let response = fx.orchestrator.request(speech_request()).await.unwrap();
    assert_eq!(response.status, 200);
    assert!(fx.control.worker_binds().is_empty());
}

#[tokio::test]
async fn test_sweep_recovers_temporary_node_with_hysteresis() {
    let fx = fixture(&["a", "b"], 2).await;
    fx.orchestrator.mark_node_failed("a", "connection reset").await;
    assert_eq!(fx.orchestrator.status().await.quarantined_nodes, 1);

    // Default temporary threshold is two consecutive passes.
    fx.orchestrator.sweep_quarantined().await;
    assert_eq!(fx.orchestrator.status().await.quarantined_nodes, 1);

    fx.orchestrator.sweep_quarantined().await;
    assert_eq!(fx.orchestrator.status().await.quarantined_nodes, 0);
    assert!(fx.orchestrator.healthy_nodes().await.contains(&"a".to_string()));

    // The sweep probed through the primary selector, not a worker slot.
    let primary_binds: Vec<_> = fx
        .control
        .bind_log
        .lock()
        .unwrap()
        .iter()
        .filter(|(selector, _)| selector == "proxy")
        .cloned()
        .collect();
    assert_eq!(primary_binds.len(), 2);
}

#[tokio::test]
async fn test_sweep_skips_permanent_nodes_by_default() {
    let fx = fixture(&["a", "b"], 2).await;
    fx.orchestrator.mark_node_failed("a", "quota exhausted").await;

    for _ in 0..4 {
        fx.orchestrator.sweep_quarantined().await;
    }
    assert_eq!(fx.orchestrator.status().await.quarantined_nodes, 1);
}

#[tokio::test]
async fn test_failing_sweep_probe_resets_recovery_streak() {
    let fx = fixture(&["a", "b"], 2).await;
    fx.orchestrator.mark_node_failed("a", "connection reset").await;

    fx.orchestrator.sweep_quarantined().await;
    fx.wire.fail_probes_for(&["a"]);
    fx.orchestrator.sweep_quarantined().await;
    fx.wire.probe_fail.lock().unwrap().clear();

    // Streak restarted: one more pass is not enough.
    fx.orchestrator.sweep_quarantined().await;
    assert_eq!(fx.orchestrator.status().await.quarantined_nodes, 1);
    fx.orchestrator.sweep_quarantined().await;
    assert_eq!(fx.orchestrator.status().await.quarantined_nodes, 0);
}

#[tokio::test]
async fn test_mode_switch_at_runtime() {
    let fx = fixture(&["a"], 1).await;
    assert_eq!(fx.orchestrator.mode().await, NetworkMode::Gateway);

    fx.orchestrator.switch_mode(NetworkMode::Direct).await;
    assert_eq!(fx.orchestrator.mode().await, NetworkMode::Direct);

    fx.wire.script_direct(&[Reply::Status(200, "ok")]);
    fx.orchestrator.request(speech_request()).await.unwrap();
    assert!(fx.control.worker_binds().is_empty());
}

#[tokio::test]
async fn test_reload_tracks_upstream_node_changes() {
    let fx = fixture(&["a", "b"], 2).await;

    *fx.control.nodes.lock().unwrap() = vec!["b".into(), "c".into()];
    assert_eq!(fx.orchestrator.reload().await.unwrap(), 2);

    let names: Vec<String> =
        fx.orchestrator.list_nodes().await.into_iter().map(|n| n.name).collect();
    assert_eq!(names, vec!["b", "c"]);
}

#[tokio::test]
async fn test_provider_trait_surface() {
    let fx = fixture(&["a", "b"], 2).await;
    let provider: Arc<dyn ProxyProvider> = fx.orchestrator.clone();

    let mut nodes = provider.available_nodes().await;
    nodes.sort();
    assert_eq!(nodes, vec!["a", "b"]);

    provider.mark_node_failed("a", "HTTP 403 Forbidden").await;
    assert_eq!(provider.available_nodes().await, vec!["b"]);

    provider.mark_node_healthy("a").await;
    assert_eq!(provider.available_nodes().await.len(), 2);

    assert_eq!(provider.stats().await.total_requests, 0);
}

#[tokio::test]
async fn test_stop_halts_loops_and_releases_slots() {
    let fx = fixture(&["a"], 1).await;
    assert!(fx.orchestrator.is_running());

    fx.orchestrator.stop();
    assert!(!fx.orchestrator.is_running());

    let status = fx.orchestrator.status().await;
    assert!(!status.running);
    assert_eq!(status.pool.busy, 0);

    // Stopping twice is harmless.
    fx.orchestrator.stop();
}

#[tokio::test]
async fn test_invalid_config_refuses_to_start() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(&dir, 1);
    config.worker_pool_size = 0;

    let control = EngineControl::new(&["a"]);
    let wire = EngineWire::new(control.clone(), &config);
    let result = GatewayOrchestrator::with_components(config, control, wire).await;
    assert!(matches!(result, Err(GatewayError::Config(_))));
}

#[tokio::test]
async fn test_quarantine_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(&dir, 2);

    // First run quarantines "a" and persists it.
    let control = EngineControl::new(&["a", "b"]);
    let wire = EngineWire::new(control.clone(), &config);
    let first = GatewayOrchestrator::with_components(config.clone(), control, wire).await.unwrap();
    first.mark_node_failed("a", "quota exhausted").await;
    // Persistence is detached; give the write a moment to land.
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    first.stop();

    // Second run restores the record.
    let control = EngineControl::new(&["a", "b"]);
    let wire = EngineWire::new(control.clone(), &config);
    let second = GatewayOrchestrator::with_components(config, control, wire).await.unwrap();
    let status = second.status().await;
    assert_eq!(status.quarantined_nodes, 1);
    assert_eq!(second.healthy_nodes().await, vec!["b"]);
}
