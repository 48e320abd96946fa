//! Delay stage
//!
//! Loads every TCP survivor into one proxy-core instance and asks the core to
//! measure each entry's delay concurrently. A core that fails to start or
//! whose control API never answers fails the whole stage; the caller gets an
//! empty survivor set plus the classified [`StageFailure`].

use crate::config::PipelineConfig;
use crate::core::api::DelayOutcome;
use crate::core::emitter::{ConfigEmitter, Listen, RenderedConfig};
use crate::core::ports::PortTriple;
use crate::core::supervisor::{CoreLauncher, ProxyCore};
use crate::error::StageFailure;
use crate::proxy::models::Node;
use crate::proxy::naming::assign_core_names;
use futures::stream::{self, StreamExt};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Result of one delay stage run
#[derive(Debug, Default)]
pub struct DelayReport {
    /// Ranked by protocol priority, then delay
    pub survivors: Vec<Node>,
    /// Per-node failure histogram
    pub failures: BTreeMap<String, usize>,
    /// Nodes the core config could not carry
    pub config_filtered: usize,
    /// Set when the stage as a whole failed
    pub failure: Option<StageFailure>,
}

impl DelayReport {
    fn failed(failure: StageFailure, config_filtered: usize) -> Self {
        warn!("Delay stage failed: {}", failure);
        Self {
            failure: Some(failure),
            config_filtered,
            ..Default::default()
        }
    }
}

pub struct DelayStage {
    config: Arc<PipelineConfig>,
    launcher: Arc<dyn CoreLauncher>,
}

impl DelayStage {
    pub fn new(config: Arc<PipelineConfig>, launcher: Arc<dyn CoreLauncher>) -> Self {
        Self { config, launcher }
    }

    fn ports(&self) -> PortTriple {
        PortTriple::new(self.config.api_port, self.config.mixed_port, self.config.socks_port)
    }

    fn config_path(&self) -> PathBuf {
        self.config
            .work_dir
            .join(format!("delay-{}.yaml", std::process::id()))
    }

    pub async fn run(&self, mut nodes: Vec<Node>) -> DelayReport {
        if nodes.is_empty() {
            return DelayReport::default();
        }
        assign_core_names(&mut nodes);

        let ports = self.ports();
        let rendered = ConfigEmitter::new(self.config.core_flavor).render(
            &nodes,
            &Listen {
                ports,
                api_host: &self.config.api_host,
                secret: self.config.api_secret.as_deref(),
            },
        );
        info!(
            "Delay stage: {} entries rendered, {} filtered",
            rendered.entries.len(),
            rendered.filtered
        );
        if rendered.is_empty() {
            return DelayReport::failed(StageFailure::EmptyConfig, rendered.filtered);
        }

        let path = self.config_path();
        if let Err(e) = write_config(&rendered, &path) {
            return DelayReport::failed(e, rendered.filtered);
        }

        let mut core = match self.launcher.launch(ports) {
            Ok(core) => core,
            Err(e) => {
                remove_config(&path);
                return DelayReport::failed(StageFailure::StartFailed(e.to_string()), rendered.filtered);
            }
        };

        let measured = self.measure(core.as_mut(), &path, &nodes, &rendered).await;
        core.stop().await;
        remove_config(&path);

        match measured {
            Ok(outcomes) => self.collect(nodes, outcomes, &rendered),
            Err(failure) => DelayReport::failed(failure, rendered.filtered),
        }
    }

    async fn measure(
        &self,
        core: &mut dyn ProxyCore,
        path: &Path,
        nodes: &[Node],
        rendered: &RenderedConfig,
    ) -> Result<HashMap<String, DelayOutcome>, StageFailure> {
        core.start(path).await?;
        if !core.wait_for_api(self.config.api_ready_timeout).await {
            return Err(StageFailure::ApiNotReady);
        }

        let listed: HashSet<String> = match core.list_active_proxies().await {
            Ok(names) => names.into_iter().collect(),
            Err(e) => {
                warn!("Listing proxies failed: {}", e);
                return Err(StageFailure::NoProxies);
            }
        };
        if listed.is_empty() {
            return Err(StageFailure::NoProxies);
        }

        let core: &dyn ProxyCore = &*core;
        let names: Vec<&str> = nodes
            .iter()
            .map(|n| n.core_name.as_str())
            .filter(|name| rendered.entries.iter().any(|e| e.as_str() == *name) && listed.contains(*name))
            .collect();
        info!(
            "Measuring delay for {} proxies (concurrency {})",
            names.len(),
            self.config.delay_concurrency
        );

        let outcomes = stream::iter(names)
            .map(|name| async move {
                let outcome = core
                    .measure_delay(
                        name,
                        &self.config.delay_test_url,
                        self.config.delay_timeout_ms,
                        self.config.max_latency_ms,
                    )
                    .await;
                debug!("{} -> {:?}", name, outcome);
                (name.to_string(), outcome)
            })
            .buffer_unordered(self.config.delay_concurrency.max(1))
            .collect::<HashMap<_, _>>()
            .await;
        Ok(outcomes)
    }

    fn collect(
        &self,
        nodes: Vec<Node>,
        mut outcomes: HashMap<String, DelayOutcome>,
        rendered: &RenderedConfig,
    ) -> DelayReport {
        let rendered_names: HashSet<&str> = rendered.entries.iter().map(String::as_str).collect();
        let mut report = DelayReport {
            config_filtered: rendered.filtered,
            ..Default::default()
        };

        for mut node in nodes {
            if !rendered_names.contains(node.core_name.as_str()) {
                continue;
            }
            match outcomes.remove(&node.core_name) {
                Some(DelayOutcome::Measured(ms)) => {
                    node.result.core_delay_ms = Some(ms);
                    report.survivors.push(node);
                }
                Some(outcome) => {
                    *report.failures.entry(outcome.reason().to_string()).or_insert(0) += 1;
                }
                None => {
                    *report.failures.entry("not_listed".to_string()).or_insert(0) += 1;
                }
            }
        }

        report.survivors.sort_by(|a, b| a.rank_cmp(b));
        info!(
            "Delay stage done: {} survivors, failures {:?}",
            report.survivors.len(),
            report.failures
        );
        report
    }
}

fn write_config(rendered: &RenderedConfig, path: &Path) -> Result<(), StageFailure> {
    let yaml = rendered
        .to_yaml()
        .map_err(|e| StageFailure::StartFailed(format!("rendering config: {}", e)))?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, yaml)?;
    Ok(())
}

fn remove_config(path: &Path) {
    if let Err(e) = std::fs::remove_file(path) {
        debug!("could not remove {:?}: {}", path, e);
    }
}
