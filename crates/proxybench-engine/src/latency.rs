//! Control-plane latency probing: fan out `rounds x nodes` probes against a
//! single router instance under a concurrency bound, then reduce each
//! node's samples to median/P95/jitter/loss-rate.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use proxybench_core::{EngineError, Node, TestConfig};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{info, warn};

use crate::control_api;
use crate::router::{RouterHandle, RouterSupervisor};

/// Per-node result of the latency phase, prior to being folded into a
/// [`proxybench_core::NodeMetrics`] by the orchestrator.
#[derive(Debug, Clone, PartialEq)]
pub struct LatencyOutcome {
    pub name: String,
    pub samples: Vec<f64>,
    pub is_alive: bool,
    pub median: Option<f64>,
    pub p95: Option<f64>,
    pub jitter: Option<f64>,
    pub loss_rate: f64,
}

/// Reduce one node's round slots (`None` = timeout) to the published
/// statistics. `latency_samples` keeps round order; the percentile math
/// below sorts a private copy.
///
/// Jitter is the *sample* standard deviation (n-1 denominator) — the only
/// reading of "jitter" consistent with the worked example in the
/// testable-properties scenarios, even though some of the surrounding
/// prose calls it a population statistic. See DESIGN.md.
fn aggregate(name: &str, slots: &[Option<f64>]) -> LatencyOutcome {
    let rounds = slots.len() as f64;
    let samples: Vec<f64> = slots.iter().filter_map(|s| *s).collect();
    let loss_rate = if rounds > 0.0 {
        (rounds - samples.len() as f64) / rounds
    } else {
        1.0
    };

    if samples.is_empty() {
        return LatencyOutcome {
            name: name.to_string(),
            samples,
            is_alive: false,
            median: None,
            p95: None,
            jitter: None,
            loss_rate: 1.0,
        };
    }

    let mut sorted = samples.clone();
    sorted.sort_by(|a, b| a.partial_cmp(b).expect("latency samples are never NaN"));
    let n = sorted.len();

    let median = if n % 2 == 1 {
        sorted[n / 2]
    } else {
        (sorted[n / 2 - 1] + sorted[n / 2]) / 2.0
    };

    let p95_index = ((0.95 * n as f64).ceil() as usize).saturating_sub(1).min(n - 1);
    let p95 = sorted[p95_index];

    let jitter = if n > 1 {
        let mean = sorted.iter().sum::<f64>() / n as f64;
        let variance = sorted.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n as f64 - 1.0);
        variance.sqrt()
    } else {
        0.0
    };

    LatencyOutcome {
        name: name.to_string(),
        samples,
        is_alive: true,
        median: Some(median),
        p95: Some(p95),
        jitter: Some(jitter),
        loss_rate,
    }
}

/// Fan out the probes against an already-running router and reduce the
/// results. Split out from [`run`] so it can be exercised against a
/// `wiremock` stand-in for the router's REST API without a real binary.
pub async fn run_against(
    handle: &RouterHandle,
    nodes: &[Node],
    config: &TestConfig,
    on_node_complete: impl Fn(&str) + Send + Sync + 'static,
) -> Vec<LatencyOutcome> {
    let client = reqwest::Client::new();
    let semaphore = Arc::new(Semaphore::new(config.latency_concurrency.max(1)));
    let rounds = config.latency_rounds as usize;
    let on_node_complete = Arc::new(on_node_complete);

    let slots: Arc<Vec<Mutex<Vec<Option<f64>>>>> = Arc::new(
        nodes
            .iter()
            .map(|_| Mutex::new(vec![None; rounds]))
            .collect(),
    );
    let countdowns: Arc<Vec<AtomicU32>> = Arc::new(
        nodes
            .iter()
            .map(|_| AtomicU32::new(rounds as u32))
            .collect(),
    );

    let mut tasks = JoinSet::new();
    for (node_idx, node) in nodes.iter().enumerate() {
        for round in 0..rounds {
            let client = client.clone();
            let api_base = handle.api_base.clone();
            let name = node.name.clone();
            let probe_url = config.latency_url.clone();
            let timeout_ms = config.latency_timeout_ms;
            let semaphore = semaphore.clone();
            let slots = slots.clone();
            let countdowns = countdowns.clone();
            let on_node_complete = on_node_complete.clone();

            tasks.spawn(async move {
                let _permit = semaphore.acquire_owned().await.ok();
                let delay =
                    control_api::test_latency(&client, &api_base, &name, &probe_url, timeout_ms)
                        .await;
                drop(_permit);

                slots[node_idx].lock().unwrap_or_else(|e| e.into_inner())[round] = delay;
                let remaining = countdowns[node_idx].fetch_sub(1, Ordering::SeqCst) - 1;
                if remaining == 0 {
                    on_node_complete(&name);
                }
            });
        }
    }

    while let Some(res) = tasks.join_next().await {
        if let Err(e) = res {
            warn!(error = %e, "latency probe task panicked, slot left as timeout");
        }
    }

    nodes
        .iter()
        .enumerate()
        .map(|(idx, node)| {
            let slot = slots[idx].lock().unwrap_or_else(|e| e.into_inner());
            aggregate(&node.name, &slot)
        })
        .collect()
}

/// Launch a dedicated router for the whole batch, run the phase, and tear
/// the router down. A router that never becomes ready aborts the whole
/// phase — no partial latency results are ever returned.
pub async fn run(
    nodes: &[Node],
    config: &TestConfig,
    router_binary: &str,
    on_node_complete: impl Fn(&str) + Send + Sync + 'static,
) -> Result<Vec<LatencyOutcome>, EngineError> {
    info!(nodes = nodes.len(), "starting latency phase");
    let outcomes = RouterSupervisor::scoped(
        nodes,
        router_binary,
        Duration::from_secs(config.ready_timeout_s),
        |handle| async move { run_against(&handle, nodes, config, on_node_complete).await },
    )
    .await?;
    info!("latency phase complete");
    Ok(outcomes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn scenario_one_all_rounds_succeed_at_fixed_latency() {
        let slots: Vec<Option<f64>> = vec![Some(50.0); 10];
        let outcome = aggregate("A", &slots);
        assert!(outcome.is_alive);
        assert_eq!(outcome.median, Some(50.0));
        assert_eq!(outcome.p95, Some(50.0));
        assert_eq!(outcome.jitter, Some(0.0));
        assert_eq!(outcome.loss_rate, 0.0);
    }

    #[test]
    fn scenario_two_mixed_timeouts() {
        let slots = vec![Some(100.0), None, Some(200.0), None];
        let outcome = aggregate("A", &slots);
        assert_eq!(outcome.loss_rate, 0.5);
        assert_eq!(outcome.samples, vec![100.0, 200.0]);
        assert_eq!(outcome.median, Some(150.0));
        assert_eq!(outcome.p95, Some(200.0));
        let jitter = outcome.jitter.unwrap();
        assert!((jitter - 70.710678).abs() < 1e-4, "jitter was {jitter}");
    }

    #[test]
    fn p95_on_twenty_sample_input_is_nineteen() {
        let slots: Vec<Option<f64>> = (1..=20).map(|v| Some(v as f64)).collect();
        let outcome = aggregate("A", &slots);
        assert_eq!(outcome.p95, Some(19.0));
    }

    #[test]
    fn single_sample_has_zero_jitter() {
        let outcome = aggregate("A", &[Some(42.0)]);
        assert_eq!(outcome.jitter, Some(0.0));
    }

    #[test]
    fn all_timeouts_means_dead_with_full_loss() {
        let outcome = aggregate("A", &[None, None, None]);
        assert!(!outcome.is_alive);
        assert_eq!(outcome.loss_rate, 1.0);
        assert_eq!(outcome.median, None);
    }

    #[tokio::test]
    async fn run_against_bounds_concurrency_and_reports_progress() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"delay": 33.0})))
            .mount(&server)
            .await;

        let handle = RouterHandle {
            socks5_url: "socks5://127.0.0.1:1".to_string(),
            api_base: server.uri(),
        };
        let nodes = vec![
            Node::new("a", "airport-1", "trojan", "1.2.3.4", 443),
            Node::new("b", "airport-1", "trojan", "1.2.3.5", 443),
        ];
        let mut config = TestConfig::default();
        config.latency_rounds = 3;
        config.latency_concurrency = 2;

        let completed = Arc::new(AtomicUsize::new(0));
        let completed_clone = completed.clone();
        let outcomes = run_against(&handle, &nodes, &config, move |_name| {
            completed_clone.fetch_add(1, Ordering::SeqCst);
        })
        .await;

        assert_eq!(outcomes.len(), 2);
        assert_eq!(completed.load(Ordering::SeqCst), 2);
        for outcome in outcomes {
            assert!(outcome.is_alive);
            assert_eq!(outcome.samples.len(), 3);
            assert_eq!(outcome.median, Some(33.0));
        }
    }
}
