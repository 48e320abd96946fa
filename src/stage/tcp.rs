//! TCP reachability stage
//!
//! Resolves each candidate's host and dials it under a semaphore bound. Every
//! candidate produces exactly one [`ProbeOutcome`]; a probe task that panics
//! is reported as [`ProbeOutcome::Crashed`] instead of taking the batch down.

use crate::config::PipelineConfig;
use crate::proxy::models::{Candidate, CandidateKey};
use async_trait::async_trait;
use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tracing::{debug, info};

/// Result of probing one candidate
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    Reachable { latency_ms: u32 },
    /// Connected, but slower than the latency ceiling
    TooSlow { latency_ms: u32 },
    Timeout,
    DnsFailure(String),
    ConnectFailed(String),
    /// The probe task itself failed
    Crashed(String),
}

impl ProbeOutcome {
    pub fn is_reachable(&self) -> bool {
        matches!(self, ProbeOutcome::Reachable { .. })
    }

    pub fn latency_ms(&self) -> Option<u32> {
        match self {
            ProbeOutcome::Reachable { latency_ms } | ProbeOutcome::TooSlow { latency_ms } => {
                Some(*latency_ms)
            }
            _ => None,
        }
    }

    pub fn reason(&self) -> &'static str {
        match self {
            ProbeOutcome::Reachable { .. } => "reachable",
            ProbeOutcome::TooSlow { .. } => "too_slow",
            ProbeOutcome::Timeout => "timeout",
            ProbeOutcome::DnsFailure(_) => "dns_failure",
            ProbeOutcome::ConnectFailed(_) => "connect_failed",
            ProbeOutcome::Crashed(_) => "crashed",
        }
    }
}

/// DNS resolution plus TCP connect, swappable in tests
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn resolve(&self, host: &str, port: u16) -> io::Result<SocketAddr>;

    async fn connect(&self, addr: SocketAddr) -> io::Result<()>;
}

/// Connector backed by the tokio resolver and `TcpStream`
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioConnector;

#[async_trait]
impl Connector for TokioConnector {
    async fn resolve(&self, host: &str, port: u16) -> io::Result<SocketAddr> {
        tokio::net::lookup_host((host, port))
            .await?
            .next()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no addresses"))
    }

    async fn connect(&self, addr: SocketAddr) -> io::Result<()> {
        TcpStream::connect(addr).await.map(drop)
    }
}

/// Bounded-concurrency TCP prober
pub struct TcpProbe<C: Connector = TokioConnector> {
    connector: Arc<C>,
    concurrency: usize,
    connect_timeout: Duration,
    dns_timeout: Duration,
    max_latency_ms: u32,
}

impl TcpProbe<TokioConnector> {
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self::with_connector(TokioConnector, config)
    }
}

impl<C: Connector> TcpProbe<C> {
    pub fn with_connector(connector: C, config: &PipelineConfig) -> Self {
        Self {
            connector: Arc::new(connector),
            concurrency: config.tcp_concurrency.max(1),
            connect_timeout: config.tcp_timeout,
            dns_timeout: config.dns_timeout,
            max_latency_ms: config.max_latency_ms,
        }
    }

    /// Probe every candidate; at most `concurrency` probes are in flight
    pub async fn probe(&self, candidates: &[Candidate]) -> HashMap<CandidateKey, ProbeOutcome> {
        info!(
            "TCP probing {} candidates (concurrency {}, timeout {:?})",
            candidates.len(),
            self.concurrency,
            self.connect_timeout
        );

        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut handles: Vec<(CandidateKey, JoinHandle<ProbeOutcome>)> =
            Vec::with_capacity(candidates.len());
        let mut outcomes = HashMap::with_capacity(candidates.len());

        for candidate in candidates {
            let key = candidate.key();
            let permit = match Arc::clone(&semaphore).acquire_owned().await {
                Ok(permit) => permit,
                Err(e) => {
                    outcomes.insert(key, ProbeOutcome::Crashed(e.to_string()));
                    continue;
                }
            };

            let connector = Arc::clone(&self.connector);
            let (dns_timeout, connect_timeout, ceiling) =
                (self.dns_timeout, self.connect_timeout, self.max_latency_ms);
            let probe_key = key.clone();

            let handle = tokio::spawn(async move {
                let _permit = permit;
                probe_one(&*connector, &probe_key, dns_timeout, connect_timeout, ceiling).await
            });
            handles.push((key, handle));
        }

        for (key, handle) in handles {
            let outcome = handle
                .await
                .unwrap_or_else(|e| ProbeOutcome::Crashed(e.to_string()));
            debug!("{} -> {:?}", key, outcome);
            outcomes.insert(key, outcome);
        }

        let reachable = outcomes.values().filter(|o| o.is_reachable()).count();
        info!("TCP probe done: {}/{} reachable", reachable, outcomes.len());
        outcomes
    }
}

async fn probe_one<C: Connector + ?Sized>(
    connector: &C,
    key: &CandidateKey,
    dns_timeout: Duration,
    connect_timeout: Duration,
    ceiling_ms: u32,
) -> ProbeOutcome {
    let addr = match time::timeout(dns_timeout, connector.resolve(&key.host, key.port)).await {
        Ok(Ok(addr)) => addr,
        Ok(Err(e)) => return ProbeOutcome::DnsFailure(e.to_string()),
        Err(_) => return ProbeOutcome::DnsFailure("resolution timed out".to_string()),
    };

    let start = Instant::now();
    match time::timeout(connect_timeout, connector.connect(addr)).await {
        Ok(Ok(())) => {
            let latency_ms = u32::try_from(start.elapsed().as_millis()).unwrap_or(u32::MAX);
            if latency_ms >= ceiling_ms {
                ProbeOutcome::TooSlow { latency_ms }
            } else {
                ProbeOutcome::Reachable { latency_ms }
            }
        }
        Ok(Err(e)) => ProbeOutcome::ConnectFailed(e.to_string()),
        Err(_) => ProbeOutcome::Timeout,
    }
}
