//! Driving the external proxy core
//!
//! - Rendering node sets into core configs
//! - Allocating disjoint port triples per instance
//! - Supervising core processes and their process groups
//! - Talking to the core's control API

pub mod api;
pub mod emitter;
pub mod ports;
pub mod registry;
pub mod supervisor;

pub use api::{ControlApi, DelayOutcome};
pub use emitter::{ConfigEmitter, Listen, RenderedConfig, TEST_GROUP};
pub use ports::{PortAllocator, PortTriple};
pub use registry::ProcessRegistry;
pub use supervisor::{CoreLauncher, ProcessLauncher, ProcessSupervisor, ProxyCore};
