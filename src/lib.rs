//! Node Validator - multi-stage proxy node validation
//!
//! Filters a list of proxy candidates down to a ranked set of working nodes:
//! TCP reachability, delay measurement through an external proxy core, and
//! optional unlock/speed tests sharded across a pool of core instances.

pub mod config;
pub mod core;
pub mod error;
pub mod pipeline;
pub mod proxy;
pub mod stage;

pub use config::{CoreFlavor, HeavyMode, PipelineConfig, SpeedConfig};
pub use error::{ApiError, StageFailure, SupervisorError};
pub use pipeline::{PipelineReport, PipelineState, PipelineStats, ValidationPipeline};
pub use proxy::models::{Candidate, Node, Protocol, ProtocolKind};

/// Application result type
pub type Result<T> = anyhow::Result<T>;
