pub mod config;
pub mod error;
pub mod metrics;
pub mod node;

pub use config::TestConfig;
pub use error::EngineError;
pub use metrics::{AirportMetrics, NodeMetrics};
pub use node::Node;
