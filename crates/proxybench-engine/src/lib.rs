//! The proxy-node testing engine: router supervision, control-plane
//! latency probing, throughput benchmarking, geolocation attribution and
//! metrics aggregation.

pub mod aggregate;
pub mod control_api;
pub mod geo;
pub mod latency;
pub mod orchestrator;
pub mod router;
pub mod speed;

pub use orchestrator::{run, Progress};
pub use router::{RouterHandle, RouterSupervisor};
