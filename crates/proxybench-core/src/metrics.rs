use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::node::Node;

/// Per-node result record, mutated in place across phases.
///
/// Invariants (enforced by the engine, not by this type):
/// `is_alive <=> !latency_samples.is_empty()`; when `!is_alive` every
/// derived latency field is `None` and `latency_loss_rate == 1.0`;
/// `speed_blocked` can only be `true` when `speed_mbps` is `None`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeMetrics {
    pub name: String,
    pub node_type: String,
    pub server: String,
    pub port: u16,
    pub source_name: String,

    pub is_alive: bool,

    pub latency_samples: Vec<f64>,
    pub latency_median: Option<f64>,
    pub latency_p95: Option<f64>,
    pub latency_jitter: Option<f64>,
    pub latency_loss_rate: f64,

    pub speed_mbps: Option<f64>,
    pub speed_blocked: bool,

    pub exit_ip: Option<String>,
    pub exit_country: Option<String>,
    pub exit_city: Option<String>,
    pub exit_isp: Option<String>,

    pub tested_at: DateTime<Utc>,
}

impl NodeMetrics {
    /// One `NodeMetrics` per input node, created once at batch start with
    /// no phase having run yet: dead by default, full loss, untested speed.
    pub fn new(node: &Node, tested_at: DateTime<Utc>) -> Self {
        Self {
            name: node.name.clone(),
            node_type: node.node_type.clone(),
            server: node.server.clone(),
            port: node.port,
            source_name: node.source_name.clone(),
            is_alive: false,
            latency_samples: Vec::new(),
            latency_median: None,
            latency_p95: None,
            latency_jitter: None,
            latency_loss_rate: 1.0,
            speed_mbps: None,
            speed_blocked: false,
            exit_ip: None,
            exit_country: None,
            exit_city: None,
            exit_isp: None,
            tested_at,
        }
    }
}

/// Per-source roll-up. All aggregate fields are `None`/zero when the
/// contributing set (alive nodes, non-null samples) is empty.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AirportMetrics {
    pub name: String,
    pub total_nodes: usize,
    pub alive_nodes: usize,
    pub alive_rate: f64,
    pub median_latency: Option<f64>,
    pub p95_latency: Option<f64>,
    pub avg_jitter: Option<f64>,
    pub avg_speed: Option<f64>,
    pub nodes: Vec<NodeMetrics>,
}

impl AirportMetrics {
    pub fn empty(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            total_nodes: 0,
            alive_nodes: 0,
            alive_rate: 0.0,
            median_latency: None,
            p95_latency: None,
            avg_jitter: None,
            avg_speed: None,
            nodes: Vec::new(),
        }
    }
}
