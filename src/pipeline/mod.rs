//! Validation pipeline coordinator
//!
//! Drives candidates through `Parsed -> TcpFiltered -> DelayFiltered ->
//! Finalized`. Each stage fully drains before the next starts. Zero TCP
//! survivors or a delay-stage failure end the run early with an empty
//! result; the stats file is written either way.

pub mod stats;

pub use stats::{PipelineState, PipelineStats, SourceStats, StageTimings};

use crate::config::PipelineConfig;
use crate::core::registry::ProcessRegistry;
use crate::core::supervisor::{CoreLauncher, ProcessLauncher};
use crate::proxy::geo::{CachedGeoLookup, GeoCache, GeoLocator, GeoLookup, IpApiLookup};
use crate::proxy::models::{dedup_candidates, Candidate, Node};
use crate::proxy::naming::NodeRenamer;
use crate::stage::delay::DelayStage;
use crate::stage::heavy::{HeavyProbe, HttpHeavyProbe, WorkerPool};
use crate::stage::tcp::{Connector, ProbeOutcome, TcpProbe, TokioConnector};
use crate::Result;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, warn};

/// File name of the ranked node list
pub const NODES_FILE: &str = "valid_nodes.json";

/// File name of the run statistics
pub const STATS_FILE: &str = "validation_stats.json";

/// What a finished run produced
#[derive(Debug, Clone)]
pub struct PipelineReport {
    /// Ranked survivors, renamed when renaming is on
    pub nodes: Vec<Node>,
    pub stats: PipelineStats,
}

/// Coordinates the stages over one candidate list
pub struct ValidationPipeline<C: Connector = TokioConnector> {
    config: Arc<PipelineConfig>,
    connector: C,
    launcher: Arc<dyn CoreLauncher>,
    heavy_probe: Arc<dyn HeavyProbe>,
    geo: Option<Arc<dyn GeoLookup>>,
    geo_cache: Option<Arc<GeoCache>>,
}

impl ValidationPipeline<TokioConnector> {
    /// Pipeline with real sockets, real proxy-core processes and HTTP probes
    pub fn new(config: PipelineConfig, registry: ProcessRegistry) -> Result<Self> {
        let config = Arc::new(config);
        let launcher = Arc::new(ProcessLauncher::new(Arc::clone(&config), registry));
        let heavy_probe = Arc::new(HttpHeavyProbe::from_config(&config));

        let (geo, geo_cache) = if config.rename {
            let cache = Arc::new(GeoCache::load(&config.geo_cache_path));
            let inner: Box<dyn GeoLookup> = match &config.mmdb_path {
                Some(path) => Box::new(GeoLocator::from_path(path)?),
                None => Box::new(IpApiLookup::new()?),
            };
            let lookup: Arc<dyn GeoLookup> =
                Arc::new(CachedGeoLookup::new(Arc::clone(&cache), inner));
            (Some(lookup), Some(cache))
        } else {
            (None, None)
        };

        Ok(Self {
            config,
            connector: TokioConnector,
            launcher,
            heavy_probe,
            geo,
            geo_cache,
        })
    }
}

impl<C: Connector + Clone> ValidationPipeline<C> {
    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn with_connector<D: Connector + Clone>(self, connector: D) -> ValidationPipeline<D> {
        ValidationPipeline {
            config: self.config,
            connector,
            launcher: self.launcher,
            heavy_probe: self.heavy_probe,
            geo: self.geo,
            geo_cache: self.geo_cache,
        }
    }

    pub fn with_launcher(mut self, launcher: Arc<dyn CoreLauncher>) -> Self {
        self.launcher = launcher;
        self
    }

    pub fn with_heavy_probe(mut self, probe: Arc<dyn HeavyProbe>) -> Self {
        self.heavy_probe = probe;
        self
    }

    /// Use `geo` for renaming; the on-disk cache is not touched
    pub fn with_geo(mut self, geo: Arc<dyn GeoLookup>) -> Self {
        self.geo = Some(geo);
        self.geo_cache = None;
        self
    }

    pub fn output_paths(&self) -> (PathBuf, PathBuf) {
        (
            self.config.output_dir.join(NODES_FILE),
            self.config.output_dir.join(STATS_FILE),
        )
    }

    /// Run every stage and write the output files
    ///
    /// Network failures never surface here; an `Err` means the outputs could
    /// not be written.
    pub async fn run(&self, candidates: Vec<Candidate>) -> Result<PipelineReport> {
        let started = Instant::now();
        let mut stats = PipelineStats::new();
        stats.input_total = candidates.len();

        let candidates = dedup_candidates(candidates);
        stats.total = candidates.len();
        info!(
            "Run {}: {} candidates ({} duplicates removed)",
            stats.run_id,
            stats.total,
            stats.input_total - stats.total
        );

        // TCP
        let stage_start = Instant::now();
        let tcp_survivors = self.tcp_stage(&candidates, &mut stats).await;
        stats.elapsed.tcp = stage_start.elapsed().as_secs_f64();
        stats.tcp_passed = tcp_survivors.len();
        stats.state = PipelineState::TcpFiltered;
        if tcp_survivors.is_empty() {
            return self.finish(stats, &candidates, Vec::new(), Some("no_tcp_survivors"), started);
        }

        // Delay
        let stage_start = Instant::now();
        let delay = DelayStage::new(Arc::clone(&self.config), Arc::clone(&self.launcher))
            .run(tcp_survivors)
            .await;
        stats.elapsed.delay = stage_start.elapsed().as_secs_f64();
        stats.delay_failures = delay.failures;
        stats.config_filtered = delay.config_filtered;
        stats.delay_passed = delay.survivors.len();
        stats.state = PipelineState::DelayFiltered;
        if let Some(failure) = delay.failure {
            error!("Delay stage failed, ending run early: {}", failure);
            return self.finish(stats, &candidates, Vec::new(), Some(failure.reason()), started);
        }
        let mut nodes = delay.survivors;
        if nodes.is_empty() {
            return self.finish(stats, &candidates, nodes, Some("no_delay_survivors"), started);
        }

        // Heavy
        let stage_start = Instant::now();
        let heavy = WorkerPool::new(
            Arc::clone(&self.config),
            Arc::clone(&self.launcher),
            Arc::clone(&self.heavy_probe),
        )
        .run(&mut nodes)
        .await;
        stats.elapsed.heavy = stage_start.elapsed().as_secs_f64();
        stats.unlock_tested = heavy.attempted;
        stats.heavy_failures = heavy.failures;
        stats.config_filtered += heavy.config_filtered;

        // Finalize
        let stage_start = Instant::now();
        if let Some(geo) = self.geo.as_ref().filter(|_| self.config.rename) {
            NodeRenamer::new(
                Arc::clone(geo),
                self.config.dns_timeout,
                self.config.name_max_length,
            )
            .rename(&mut nodes)
            .await;
        }
        stats.elapsed.finalize = stage_start.elapsed().as_secs_f64();
        stats.state = PipelineState::Finalized;

        self.finish(stats, &candidates, nodes, None, started)
    }

    async fn tcp_stage(&self, candidates: &[Candidate], stats: &mut PipelineStats) -> Vec<Node> {
        let probe = TcpProbe::with_connector(self.connector.clone(), &self.config);
        let outcomes = probe.probe(candidates).await;

        let mut failures: BTreeMap<String, usize> = BTreeMap::new();
        let survivors = candidates
            .iter()
            .filter_map(|candidate| match outcomes.get(&candidate.key()) {
                Some(ProbeOutcome::Reachable { latency_ms }) => {
                    let mut node = Node::new(candidate.clone());
                    node.result.tcp_latency_ms = Some(*latency_ms);
                    Some(node)
                }
                Some(outcome) => {
                    *failures.entry(outcome.reason().to_string()).or_insert(0) += 1;
                    None
                }
                None => {
                    *failures.entry("crashed".to_string()).or_insert(0) += 1;
                    None
                }
            })
            .collect();
        stats.tcp_failures = failures;
        survivors
    }

    fn finish(
        &self,
        mut stats: PipelineStats,
        candidates: &[Candidate],
        nodes: Vec<Node>,
        early_exit: Option<&str>,
        started: Instant,
    ) -> Result<PipelineReport> {
        if let Some(reason) = early_exit {
            warn!("Run ended early at {:?}: {}", stats.state, reason);
            stats.early_exit = Some(reason.to_string());
        }
        stats.valid = nodes.len();
        stats.record_sources(candidates, &nodes);
        stats.elapsed.total = started.elapsed().as_secs_f64();

        let (nodes_path, stats_path) = self.output_paths();
        std::fs::create_dir_all(&self.config.output_dir)?;
        std::fs::write(&nodes_path, serde_json::to_string_pretty(&nodes)?)?;
        stats.write_to(&stats_path)?;

        if let Some(cache) = &self.geo_cache {
            if let Err(e) = cache.flush() {
                warn!("Failed to save geo cache: {}", e);
            }
        }

        info!(
            "Run {} done in {:.1}s: {} -> tcp {} -> delay {} -> valid {}",
            stats.run_id,
            stats.elapsed.total,
            stats.total,
            stats.tcp_passed,
            stats.delay_passed,
            stats.valid
        );
        Ok(PipelineReport { nodes, stats })
    }
}
