//! Port allocation for proxy-core instances
//!
//! Each worker gets a contiguous triple `(mixed, api, socks) = (p, p + 1, p + 2)`
//! where `p = base + process_offset + index * stride + jitter`. The jitter is
//! drawn once per allocator so every triple shifts together and stays
//! disjoint; the process offset separates concurrent runs on one host.

use rand::Rng;
use std::fmt;

/// Ports occupied by one proxy-core instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PortTriple {
    /// Control API port
    pub api: u16,
    /// Mixed HTTP/SOCKS entry port the heavy tests route through
    pub mixed: u16,
    pub socks: u16,
}

impl PortTriple {
    pub fn new(api: u16, mixed: u16, socks: u16) -> Self {
        Self { api, mixed, socks }
    }

    pub fn ports(&self) -> [u16; 3] {
        [self.mixed, self.api, self.socks]
    }

    pub fn overlaps(&self, other: &PortTriple) -> bool {
        self.ports().iter().any(|p| other.ports().contains(p))
    }
}

impl fmt::Display for PortTriple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "api={} mixed={} socks={}", self.api, self.mixed, self.socks)
    }
}

/// Deterministic allocator of disjoint port triples for worker instances
#[derive(Debug, Clone)]
pub struct PortAllocator {
    base: u16,
    stride: u16,
    jitter: u16,
    process_offset: u16,
}

const MIN_STRIDE: u16 = 3;
const MAX_JITTER: u16 = 50;
const MAX_PROCESS_SLOTS: u32 = 100;

impl PortAllocator {
    /// Allocator with random jitter and an offset derived from the current pid
    pub fn new(base: u16, stride: u16, worker_count: usize) -> Self {
        let stride = stride.max(MIN_STRIDE);
        let jitter = rand::thread_rng().gen_range(1..=MAX_JITTER.min(stride - MIN_STRIDE).max(1));
        let span = u32::from(stride) * worker_count.max(1) as u32;
        let free = 65535u32.saturating_sub(u32::from(base) + span + u32::from(MAX_JITTER) + 2);
        let slots = (free / span.max(1)).clamp(1, MAX_PROCESS_SLOTS);
        let process_offset = (std::process::id() % slots) * span;
        Self::with_offsets(base, stride, jitter, u16::try_from(process_offset).unwrap_or(0))
    }

    /// Fully deterministic allocator
    pub fn with_offsets(base: u16, stride: u16, jitter: u16, process_offset: u16) -> Self {
        let stride = stride.max(MIN_STRIDE);
        Self {
            base,
            stride,
            jitter: jitter.min(stride - MIN_STRIDE),
            process_offset,
        }
    }

    /// Ports for worker `index`, or `None` if they would not fit below 65535
    pub fn triple(&self, index: usize) -> Option<PortTriple> {
        let index = u16::try_from(index).ok()?;
        let first = self
            .base
            .checked_add(self.process_offset)?
            .checked_add(index.checked_mul(self.stride)?)?
            .checked_add(self.jitter)?;
        let last = first.checked_add(2)?;
        Some(PortTriple::new(first + 1, first, last))
    }
}
