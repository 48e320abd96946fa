//! Validation stages
//!
//! - TCP reachability probing with bounded concurrency
//! - Delay measurement through a single proxy-core instance
//! - Heavy unlock/speed tests sharded across a pool of core instances

pub mod delay;
pub mod heavy;
pub mod speed;
pub mod tcp;
pub mod unlock;

pub use delay::{DelayReport, DelayStage};
pub use heavy::{HeavyMeasurement, HeavyOutcome, HeavyProbe, HeavyReport, HttpHeavyProbe, WorkerPool};
pub use speed::{format_speed, SpeedResult, SpeedTester};
pub use tcp::{Connector, ProbeOutcome, TcpProbe, TokioConnector};
pub use unlock::{default_services, UnlockResult, UnlockService, UnlockTester};
