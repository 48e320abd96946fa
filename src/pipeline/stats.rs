//! Run statistics
//!
//! [`PipelineStats`] is written on every run, early exits included. The
//! per-source breakdown is what subscription scoring reads.

use crate::proxy::models::{Candidate, Node, UNKNOWN_LATENCY_MS};
use crate::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use uuid::Uuid;

/// Stable points of a pipeline run, in order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    Parsed,
    TcpFiltered,
    DelayFiltered,
    Finalized,
}

/// Totals for one subscription source
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SourceStats {
    pub total: usize,
    pub valid: usize,
    /// Mean latency of the valid nodes, 9999 when there are none
    pub avg_latency_ms: f64,
}

/// Wall-clock seconds spent per stage
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StageTimings {
    pub tcp: f64,
    pub delay: f64,
    pub heavy: f64,
    pub finalize: f64,
    pub total: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineStats {
    pub run_id: Uuid,
    pub timestamp: DateTime<Utc>,
    /// Last state reached
    pub state: PipelineState,
    /// Why the run stopped before the heavy stage, if it did
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub early_exit: Option<String>,

    /// Candidates as loaded, duplicates included
    pub input_total: usize,
    /// Candidates after deduplication
    pub total: usize,
    pub tcp_passed: usize,
    pub delay_passed: usize,
    pub unlock_tested: usize,
    pub valid: usize,

    pub tcp_failures: BTreeMap<String, usize>,
    pub delay_failures: BTreeMap<String, usize>,
    pub heavy_failures: BTreeMap<String, usize>,
    /// Nodes the proxy core config could not carry
    pub config_filtered: usize,

    pub elapsed: StageTimings,
    pub per_source: BTreeMap<String, SourceStats>,
}

impl Default for PipelineStats {
    fn default() -> Self {
        Self::new()
    }
}

impl PipelineStats {
    pub fn new() -> Self {
        Self {
            run_id: Uuid::new_v4(),
            timestamp: Utc::now(),
            state: PipelineState::Parsed,
            early_exit: None,
            input_total: 0,
            total: 0,
            tcp_passed: 0,
            delay_passed: 0,
            unlock_tested: 0,
            valid: 0,
            tcp_failures: BTreeMap::new(),
            delay_failures: BTreeMap::new(),
            heavy_failures: BTreeMap::new(),
            config_filtered: 0,
            elapsed: StageTimings::default(),
            per_source: BTreeMap::new(),
        }
    }

    /// Fill `per_source` from the deduplicated input and the final survivors
    pub fn record_sources(&mut self, candidates: &[Candidate], survivors: &[Node]) {
        let mut per_source: BTreeMap<String, SourceStats> = BTreeMap::new();
        for candidate in candidates {
            per_source.entry(candidate.source.clone()).or_default().total += 1;
        }

        let mut latency_sums: BTreeMap<&str, u64> = BTreeMap::new();
        for node in survivors {
            per_source
                .entry(node.candidate.source.clone())
                .or_default()
                .valid += 1;
            *latency_sums.entry(node.candidate.source.as_str()).or_insert(0) +=
                u64::from(node.latency_ms());
        }

        for (source, stats) in per_source.iter_mut() {
            stats.avg_latency_ms = match latency_sums.get(source.as_str()) {
                Some(sum) if stats.valid > 0 => *sum as f64 / stats.valid as f64,
                _ => f64::from(UNKNOWN_LATENCY_MS),
            };
        }
        self.per_source = per_source;
    }

    pub fn write_to<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }
}
