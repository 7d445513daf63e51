//! Per-source roll-ups computed once after all phases have run.

use proxybench_core::{AirportMetrics, NodeMetrics};

fn median(mut values: Vec<f64>) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    values.sort_by(|a, b| a.partial_cmp(b).expect("aggregated values are never NaN"));
    let n = values.len();
    Some(if n % 2 == 1 {
        values[n / 2]
    } else {
        (values[n / 2 - 1] + values[n / 2]) / 2.0
    })
}

fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        None
    } else {
        Some(values.iter().sum::<f64>() / values.len() as f64)
    }
}

/// Roll up one airport's already-populated `NodeMetrics` into the summary
/// fields. Pure and idempotent: running it twice on the same input yields
/// identical output.
pub fn aggregate_airport(name: &str, nodes: Vec<NodeMetrics>) -> AirportMetrics {
    let total_nodes = nodes.len();
    let alive: Vec<&NodeMetrics> = nodes.iter().filter(|n| n.is_alive).collect();
    let alive_nodes = alive.len();
    let alive_rate = if total_nodes == 0 {
        0.0
    } else {
        alive_nodes as f64 / total_nodes as f64
    };

    let medians: Vec<f64> = alive.iter().filter_map(|n| n.latency_median).collect();
    let p95s: Vec<f64> = alive.iter().filter_map(|n| n.latency_p95).collect();
    let jitters: Vec<f64> = alive.iter().filter_map(|n| n.latency_jitter).collect();
    let speeds: Vec<f64> = alive
        .iter()
        .filter(|n| !n.speed_blocked)
        .filter_map(|n| n.speed_mbps)
        .collect();

    AirportMetrics {
        name: name.to_string(),
        total_nodes,
        alive_nodes,
        alive_rate,
        median_latency: median(medians),
        p95_latency: median(p95s),
        avg_jitter: mean(&jitters),
        avg_speed: mean(&speeds),
        nodes,
    }
}
