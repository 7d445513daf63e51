//! Ties the three phases together: Latency, then Speed (optional), then
//! Geolocation (optional), followed by a single aggregation pass.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use proxybench_core::{node::validate_unique_names, AirportMetrics, EngineError, Node, NodeMetrics, TestConfig};
use tracing::info;

use crate::{aggregate, geo, latency, speed};

/// Name of the router binary resolved via `PATH` when
/// [`TestConfig::router_binary`] is unset.
const DEFAULT_ROUTER_BINARY: &str = "mihomo";

/// One update emitted as the engine works through a batch. Carries enough
/// to drive a progress bar per phase without the caller needing to know
/// batch size or node ordering up front.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Progress {
    PhaseStarted { phase: &'static str, total: usize },
    NodeDone { phase: &'static str, name: String },
    PhaseFinished { phase: &'static str },
}

fn resolve_router_binary(config: &TestConfig) -> Result<String, EngineError> {
    if let Some(path) = &config.router_binary {
        return Ok(path.clone());
    }
    which::which(DEFAULT_ROUTER_BINARY)
        .map(|p| p.to_string_lossy().into_owned())
        .map_err(|_| EngineError::RouterBinaryNotFound(DEFAULT_ROUTER_BINARY.to_string()))
}

/// Group nodes by `source_name`, preserving first-seen order so output
/// airport ordering is stable and deterministic across runs.
fn group_by_source(nodes: &[Node]) -> Vec<(String, Vec<usize>)> {
    let mut order: Vec<String> = Vec::new();
    let mut groups: HashMap<String, Vec<usize>> = HashMap::new();
    for (idx, node) in nodes.iter().enumerate() {
        groups
            .entry(node.source_name.clone())
            .or_insert_with(|| {
                order.push(node.source_name.clone());
                Vec::new()
            })
            .push(idx);
    }
    order
        .into_iter()
        .map(|name| {
            let idxs = groups.remove(&name).unwrap_or_default();
            (name, idxs)
        })
        .collect()
}

/// Run the whole testing engine over one batch of nodes, returning one
/// [`AirportMetrics`] per distinct `source_name`.
pub async fn run(
    nodes: Vec<Node>,
    config: &TestConfig,
    on_progress: impl Fn(Progress) + Send + Sync + 'static,
) -> Result<Vec<AirportMetrics>, EngineError> {
    validate_unique_names(&nodes)?;
    if nodes.is_empty() {
        info!("empty batch, nothing to test");
        return Ok(Vec::new());
    }

    let router_binary = resolve_router_binary(config)?;
    let on_progress = Arc::new(on_progress);
    let tested_at = Utc::now();

    let mut metrics: HashMap<String, NodeMetrics> = nodes
        .iter()
        .map(|n| (n.name.clone(), NodeMetrics::new(n, tested_at)))
        .collect();

    on_progress(Progress::PhaseStarted {
        phase: "latency",
        total: nodes.len(),
    });
    let latency_progress = on_progress.clone();
    let latency_outcomes = latency::run(&nodes, config, &router_binary, move |name| {
        latency_progress(Progress::NodeDone {
            phase: "latency",
            name: name.to_string(),
        });
    })
    .await?;
    for outcome in latency_outcomes {
        if let Some(m) = metrics.get_mut(&outcome.name) {
            m.is_alive = outcome.is_alive;
            m.latency_samples = outcome.samples;
            m.latency_median = outcome.median;
            m.latency_p95 = outcome.p95;
            m.latency_jitter = outcome.jitter;
            m.latency_loss_rate = outcome.loss_rate;
        }
    }
    on_progress(Progress::PhaseFinished { phase: "latency" });

    let alive_nodes: Vec<Node> = nodes
        .iter()
        .filter(|n| metrics.get(&n.name).is_some_and(|m| m.is_alive))
        .cloned()
        .collect();

    if config.enable_speed {
        on_progress(Progress::PhaseStarted {
            phase: "speed",
            total: alive_nodes.len(),
        });
        let speed_progress = on_progress.clone();
        let speed_outcomes = speed::run(alive_nodes.clone(), config, &router_binary, move |name| {
            speed_progress(Progress::NodeDone {
                phase: "speed",
                name: name.to_string(),
            });
        })
        .await;
        for outcome in speed_outcomes {
            if let Some(m) = metrics.get_mut(&outcome.name) {
                m.speed_mbps = outcome.speed_mbps;
                m.speed_blocked = outcome.blocked;
            }
        }
        on_progress(Progress::PhaseFinished { phase: "speed" });
    }

    if config.enable_geo {
        on_progress(Progress::PhaseStarted {
            phase: "geo",
            total: alive_nodes.len(),
        });
        let geo_progress = on_progress.clone();
        match geo::run(&alive_nodes, config, &router_binary, move |name| {
            geo_progress(Progress::NodeDone {
                phase: "geo",
                name: name.to_string(),
            });
        })
        .await
        {
            Ok(geo_outcomes) => {
                for outcome in geo_outcomes {
                    if let Some(m) = metrics.get_mut(&outcome.name) {
                        m.exit_ip = outcome.exit_ip;
                        m.exit_country = outcome.exit_country;
                        m.exit_city = outcome.exit_city;
                        m.exit_isp = outcome.exit_isp;
                    }
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "geo phase aborted, preserving already-collected data");
            }
        }
        on_progress(Progress::PhaseFinished { phase: "geo" });
    }

    let groups = group_by_source(&nodes);
    let airports = groups
        .into_iter()
        .map(|(source_name, idxs)| {
            let node_metrics: Vec<NodeMetrics> = idxs
                .into_iter()
                .filter_map(|idx| metrics.remove(&nodes[idx].name))
                .collect();
            aggregate::aggregate_airport(&source_name, node_metrics)
        })
        .collect();

    Ok(airports)
}
