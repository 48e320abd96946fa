//! Heavy per-node tests on a pool of proxy-core instances
//!
//! Only one proxy can be active per core instance, so parallelism comes from
//! running several instances. The top `heavy_budget` delay survivors are cut
//! into contiguous shards, each shard gets its own core on a disjoint port
//! triple, and nodes inside a shard are tested strictly one after another:
//! switch the selector group, settle, probe through the local entry port.
//!
//! Every failure inside a shard degrades to a zero score for the affected
//! nodes. Nodes beyond the budget are left untouched.

use crate::config::{HeavyMode, PipelineConfig};
use crate::core::emitter::{ConfigEmitter, Listen, TEST_GROUP};
use crate::core::ports::{PortAllocator, PortTriple};
use crate::core::supervisor::{CoreLauncher, ProxyCore};
use crate::proxy::models::{CandidateKey, Node};
use crate::stage::speed::{SpeedResult, SpeedTester};
use crate::stage::unlock::{UnlockResult, UnlockTester};
use crate::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::redirect::Policy;
use reqwest::{Client, Proxy};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

/// What one heavy probe round observed
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HeavyMeasurement {
    pub unlock: Option<UnlockResult>,
    pub speed: Option<SpeedResult>,
}

/// Runs unlock and speed checks through a local proxy entry point
#[async_trait]
pub trait HeavyProbe: Send + Sync {
    async fn run(&self, proxy_url: &str) -> Result<HeavyMeasurement>;
}

/// [`HeavyProbe`] that issues real HTTP requests via reqwest
pub struct HttpHeavyProbe {
    mode: HeavyMode,
    unlock: UnlockTester,
    speed: SpeedTester,
}

impl HttpHeavyProbe {
    pub fn new(mode: HeavyMode, unlock: UnlockTester, speed: SpeedTester) -> Self {
        Self { mode, unlock, speed }
    }

    pub fn from_config(config: &PipelineConfig) -> Self {
        Self::new(
            config.heavy_mode,
            UnlockTester::default(),
            SpeedTester::new(config.speed.clone()),
        )
    }
}

#[async_trait]
impl HeavyProbe for HttpHeavyProbe {
    async fn run(&self, proxy_url: &str) -> Result<HeavyMeasurement> {
        let proxy = Proxy::all(proxy_url)?;
        let mut measurement = HeavyMeasurement::default();

        if self.mode.runs_unlock() {
            // Redirects are scored, never followed
            let client = Client::builder()
                .proxy(proxy.clone())
                .redirect(Policy::none())
                .build()?;
            measurement.unlock = Some(self.unlock.test_all(&client).await);
        }
        if self.mode.runs_speed() {
            let client = Client::builder().proxy(proxy).build()?;
            measurement.speed = self.speed.measure(&client).await;
        }
        Ok(measurement)
    }
}

/// Per-node result of the heavy stage
#[derive(Debug, Clone, PartialEq)]
pub enum HeavyOutcome {
    Tested(HeavyMeasurement),
    /// The node did not survive rendering into the worker config
    Unsupported,
    SwitchRejected(String),
    ProbeFailed(String),
    ProbeTimeout,
    WorkerStartFailed(String),
    WorkerCrashed(String),
}

impl HeavyOutcome {
    pub fn is_tested(&self) -> bool {
        matches!(self, HeavyOutcome::Tested(_))
    }

    pub fn reason(&self) -> &'static str {
        match self {
            HeavyOutcome::Tested(_) => "tested",
            HeavyOutcome::Unsupported => "unsupported",
            HeavyOutcome::SwitchRejected(_) => "switch_rejected",
            HeavyOutcome::ProbeFailed(_) => "probe_failed",
            HeavyOutcome::ProbeTimeout => "probe_timeout",
            HeavyOutcome::WorkerStartFailed(_) => "worker_start_failed",
            HeavyOutcome::WorkerCrashed(_) => "worker_crashed",
        }
    }
}

/// Summary of one pool run
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HeavyReport {
    /// Nodes inside the budget; every one of them carries a score afterwards
    pub attempted: usize,
    /// Nodes whose probe completed
    pub measured: usize,
    /// Failure reason histogram
    pub failures: BTreeMap<String, usize>,
    pub workers: usize,
    pub config_filtered: usize,
}

type Outcomes = Arc<Mutex<HashMap<CandidateKey, HeavyOutcome>>>;

/// Shards heavy tests across independent proxy-core instances
#[derive(Clone)]
pub struct WorkerPool {
    config: Arc<PipelineConfig>,
    launcher: Arc<dyn CoreLauncher>,
    probe: Arc<dyn HeavyProbe>,
}

impl WorkerPool {
    pub fn new(
        config: Arc<PipelineConfig>,
        launcher: Arc<dyn CoreLauncher>,
        probe: Arc<dyn HeavyProbe>,
    ) -> Self {
        Self {
            config,
            launcher,
            probe,
        }
    }

    /// Test the first `heavy_budget` nodes in place; order is preserved
    pub async fn run(&self, nodes: &mut [Node]) -> HeavyReport {
        let mode = self.config.heavy_mode;
        let budget = self.config.heavy_budget.min(nodes.len());
        if !mode.is_enabled() || budget == 0 {
            info!("Heavy tests skipped (mode {}, {} candidates)", mode, nodes.len());
            return HeavyReport::default();
        }

        let workers = self.config.worker_count.clamp(1, budget);
        let shard_size = (budget + workers - 1) / workers;
        let shards: Vec<Vec<Node>> = nodes[..budget]
            .chunks(shard_size)
            .map(<[Node]>::to_vec)
            .collect();
        let allocator = PortAllocator::new(
            self.config.worker_base_port,
            self.config.worker_port_stride,
            shards.len(),
        );
        info!(
            "Heavy testing {} of {} nodes on {} workers (mode {})",
            budget,
            nodes.len(),
            shards.len(),
            mode
        );

        let outcomes: Outcomes = Arc::new(Mutex::new(HashMap::with_capacity(budget)));
        let mut handles: Vec<(Vec<CandidateKey>, JoinHandle<usize>)> = Vec::with_capacity(shards.len());
        for (index, shard) in shards.into_iter().enumerate() {
            let keys = shard.iter().map(Node::key).collect();
            let worker = ShardWorker {
                index,
                ports: allocator.triple(index),
                pool: self.clone(),
                outcomes: Arc::clone(&outcomes),
            };
            handles.push((keys, tokio::spawn(worker.run(shard))));
        }

        let mut report = HeavyReport {
            attempted: budget,
            workers: handles.len(),
            ..Default::default()
        };
        for (keys, handle) in handles {
            match handle.await {
                Ok(filtered) => report.config_filtered += filtered,
                Err(e) => {
                    warn!("Heavy worker crashed: {}", e);
                    let mut outcomes = outcomes.lock();
                    for key in keys {
                        outcomes
                            .entry(key)
                            .or_insert_with(|| HeavyOutcome::WorkerCrashed(e.to_string()));
                    }
                }
            }
        }

        let outcomes = std::mem::take(&mut *outcomes.lock());
        for node in nodes[..budget].iter_mut() {
            let outcome = outcomes
                .get(&node.key())
                .cloned()
                .unwrap_or_else(|| HeavyOutcome::WorkerCrashed("no result recorded".to_string()));
            if outcome.is_tested() {
                report.measured += 1;
            } else {
                *report.failures.entry(outcome.reason().to_string()).or_insert(0) += 1;
            }
            apply_outcome(node, &outcome, mode);
        }

        info!(
            "Heavy tests done: {}/{} measured, failures {:?}",
            report.measured, report.attempted, report.failures
        );
        report
    }
}

/// Write the outcome into the node's stage result
fn apply_outcome(node: &mut Node, outcome: &HeavyOutcome, mode: HeavyMode) {
    let measurement = match outcome {
        HeavyOutcome::Tested(m) => Some(m),
        _ => None,
    };
    if mode.runs_unlock() {
        let unlock = measurement.and_then(|m| m.unlock.as_ref());
        node.result.unlock_score = Some(unlock.map_or(0, |u| u.score));
        node.result.unlock_detail = unlock.map(UnlockResult::detail);
    }
    if mode.runs_speed() {
        let speed = measurement.and_then(|m| m.speed.as_ref());
        node.result.speed_bps = Some(speed.map_or(0.0, |s| s.bytes_per_sec));
    }
}

/// One shard's sequential test loop on its own core instance
struct ShardWorker {
    index: usize,
    ports: Option<PortTriple>,
    pool: WorkerPool,
    outcomes: Outcomes,
}

impl ShardWorker {
    fn record(&self, node: &Node, outcome: HeavyOutcome) {
        debug!("worker {}: {} -> {}", self.index, node.core_name, outcome.reason());
        self.outcomes.lock().insert(node.key(), outcome);
    }

    fn fail_all(&self, nodes: &[Node], reason: &str) {
        warn!("Heavy worker {} failed to start: {}", self.index, reason);
        for node in nodes {
            self.record(node, HeavyOutcome::WorkerStartFailed(reason.to_string()));
        }
    }

    fn config_path(&self, ports: PortTriple) -> PathBuf {
        self.pool.config.work_dir.join(format!(
            "worker-{}-{}-{}.yaml",
            std::process::id(),
            self.index,
            ports.api
        ))
    }

    /// Returns how many nodes the worker config could not carry
    async fn run(self, nodes: Vec<Node>) -> usize {
        let Some(ports) = self.ports else {
            self.fail_all(&nodes, "no free port triple");
            return 0;
        };
        let config = &self.pool.config;

        let rendered = ConfigEmitter::new(config.core_flavor).render(
            &nodes,
            &Listen {
                ports,
                api_host: &config.api_host,
                secret: config.api_secret.as_deref(),
            },
        );
        let (loadable, unsupported): (Vec<Node>, Vec<Node>) = nodes
            .into_iter()
            .partition(|n| rendered.entries.contains(&n.core_name));
        for node in &unsupported {
            self.record(node, HeavyOutcome::Unsupported);
        }
        if loadable.is_empty() {
            return rendered.filtered;
        }

        let path = self.config_path(ports);
        if let Err(e) = rendered.write_to(&path) {
            self.fail_all(&loadable, &format!("writing {:?}: {}", path, e));
            return rendered.filtered;
        }

        let mut core = match self.pool.launcher.launch(ports) {
            Ok(core) => core,
            Err(e) => {
                self.fail_all(&loadable, &e.to_string());
                let _ = std::fs::remove_file(&path);
                return rendered.filtered;
            }
        };

        self.test_shard(core.as_mut(), &path, &loadable).await;
        core.stop().await;
        let _ = std::fs::remove_file(&path);
        rendered.filtered
    }

    async fn test_shard(&self, core: &mut dyn ProxyCore, path: &std::path::Path, nodes: &[Node]) {
        let config = &self.pool.config;
        if let Err(e) = core.start(path).await {
            self.fail_all(nodes, &e.to_string());
            return;
        }
        if !core.wait_for_api(config.api_ready_timeout).await {
            self.fail_all(nodes, "control API not ready");
            return;
        }

        let proxy_url = format!("http://127.0.0.1:{}", core.ports().mixed);
        let probe_timeout = config.heavy_probe_timeout();
        for node in nodes {
            if let Err(e) = core.switch_active(TEST_GROUP, &node.core_name).await {
                self.record(node, HeavyOutcome::SwitchRejected(e.to_string()));
                continue;
            }
            sleep(config.switch_settle).await;

            let outcome = match timeout(probe_timeout, self.pool.probe.run(&proxy_url)).await {
                Ok(Ok(measurement)) => HeavyOutcome::Tested(measurement),
                Ok(Err(e)) => HeavyOutcome::ProbeFailed(e.to_string()),
                Err(_) => HeavyOutcome::ProbeTimeout,
            };
            self.record(node, outcome);
        }
    }
}
