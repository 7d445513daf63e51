//! Throughput benchmarking: a fixed pool of workers, each owning its own
//! router, pulls alive nodes from a queue and measures sustained
//! multi-connection download speed through the worker's SOCKS5 port.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use proxybench_core::{EngineError, Node, TestConfig};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::router::{RouterHandle, RouterSupervisor};
use crate::control_api;

/// Tried in order; the first to answer 200/206 with >= 1 KiB of body
/// wins. Short bodies are treated as captive-portal/captcha interstitials.
const CANDIDATE_URLS: &[&str] = &[
    "https://speed.cloudflare.com/__down?bytes=100000000",
    "http://cachefly.cachefly.net/100mb.test",
    "http://download.thinkbroadband.com/100MB.zip",
];

const MIN_BODY_PROBE_BYTES: usize = 1024;

#[derive(Debug, Clone, PartialEq)]
pub struct SpeedOutcome {
    pub name: String,
    pub speed_mbps: Option<f64>,
    pub blocked: bool,
}

/// Build a `reqwest::Client` whose every connection is tunnelled through
/// `socks5_url`, with the connection pool capped at `speed_connections`.
fn build_client(socks5_url: &str, max_connections: usize) -> Result<reqwest::Client, EngineError> {
    let proxy = reqwest::Proxy::all(socks5_url)
        .map_err(|e| EngineError::RouterProcess(format!("invalid socks url: {e}")))?;
    reqwest::Client::builder()
        .proxy(proxy)
        .pool_max_idle_per_host(max_connections)
        .build()
        .map_err(|e| EngineError::RouterProcess(format!("failed to build speed client: {e}")))
}

/// Issue one `GET` and read only the first chunk, to cheaply confirm the
/// response both succeeds and clears the captive-portal body-size gate.
async fn probe_url(client: &reqwest::Client, url: &str) -> bool {
    let resp = match client.get(url).send().await {
        Ok(resp) => resp,
        Err(_) => return false,
    };
    if !matches!(resp.status().as_u16(), 200 | 206) {
        return false;
    }
    let mut stream = resp.bytes_stream();
    let mut seen = 0usize;
    use futures_util::StreamExt;
    while seen < MIN_BODY_PROBE_BYTES {
        match stream.next().await {
            Some(Ok(chunk)) => seen += chunk.len(),
            _ => break,
        }
    }
    seen >= MIN_BODY_PROBE_BYTES
}

/// Resolve a usable candidate URL, trying `cached` first (per-worker
/// sticky choice) and falling back through the fixed probe order.
async fn resolve_url(client: &reqwest::Client, cached: Option<&str>) -> Option<String> {
    if let Some(url) = cached {
        if probe_url(client, url).await {
            return Some(url.to_string());
        }
    }
    for &url in CANDIDATE_URLS {
        if Some(url) == cached {
            continue;
        }
        if probe_url(client, url).await {
            return Some(url.to_string());
        }
    }
    None
}

/// Run `connections` parallel download loops against `url` until
/// `deadline`, each owning one entry of a byte-counter array that outlives
/// every task so cancellation never loses an in-flight total.
async fn measure_throughput(
    client: &reqwest::Client,
    url: &str,
    connections: usize,
    window: Duration,
) -> Option<f64> {
    let counters: Arc<Vec<AtomicU64>> = Arc::new((0..connections).map(|_| AtomicU64::new(0)).collect());
    let deadline = Instant::now() + window;
    let start = Instant::now();

    let mut tasks = tokio::task::JoinSet::new();
    for i in 0..connections {
        let client = client.clone();
        let url = url.to_string();
        let counters = counters.clone();
        tasks.spawn(async move {
            use futures_util::StreamExt;
            loop {
                if Instant::now() >= deadline {
                    return;
                }
                let resp = match client.get(&url).send().await {
                    Ok(r) => r,
                    Err(_) => return,
                };
                let mut stream = resp.bytes_stream();
                loop {
                    if Instant::now() >= deadline {
                        return;
                    }
                    match tokio::time::timeout(Duration::from_secs(5), stream.next()).await {
                        Ok(Some(Ok(chunk))) => {
                            counters[i].fetch_add(chunk.len() as u64, Ordering::Relaxed);
                        }
                        _ => break,
                    }
                }
            }
        });
    }

    let drain = tokio::time::timeout(Duration::from_secs(15), async {
        while tasks.join_next().await.is_some() {}
    })
    .await;
    if drain.is_err() {
        warn!("speed measurement tasks did not finish draining, aborting stragglers");
        tasks.abort_all();
        let _ = tokio::time::timeout(Duration::from_secs(5), async {
            while tasks.join_next().await.is_some() {}
        })
        .await;
    }

    let elapsed = start.elapsed();
    let total_bytes: u64 = counters.iter().map(|c| c.load(Ordering::Relaxed)).sum();
    if total_bytes == 0 || elapsed < Duration::from_millis(500) {
        return None;
    }
    Some((total_bytes as f64 * 8.0) / elapsed.as_secs_f64() / 1_000_000.0)
}

/// Pop the next node off the shared queue. The mutex is held only for the
/// instant it takes to pull one item, never across the node's own test.
async fn next_from_queue(queue: &tokio::sync::Mutex<mpsc::Receiver<Node>>) -> Option<Node> {
    queue.lock().await.recv().await
}

/// One worker: owns a router for its whole lifetime (via [`RouterSupervisor::scoped`],
/// so the router is torn down on every exit path out of `run_body`) and pulls
/// nodes off the shared queue until it is drained, so a node is tested by
/// exactly whichever worker happens to be free, never more than one.
async fn worker_loop(
    worker_id: usize,
    nodes: Arc<Vec<Node>>,
    queue: Arc<tokio::sync::Mutex<mpsc::Receiver<Node>>>,
    router_binary: String,
    config: TestConfig,
    results_tx: mpsc::Sender<SpeedOutcome>,
    on_node_complete: Arc<dyn Fn(&str) + Send + Sync>,
) {
    let body_queue = queue.clone();
    let body_results_tx = results_tx.clone();
    let body_on_node_complete = on_node_complete.clone();
    let body_config = config.clone();

    let result = RouterSupervisor::scoped(
        &nodes,
        &router_binary,
        Duration::from_secs(config.ready_timeout_s),
        move |handle| async move {
            run_body(
                worker_id,
                handle,
                body_queue,
                body_config,
                body_results_tx,
                body_on_node_complete,
            )
            .await
        },
    )
    .await;

    if let Err(e) = result {
        warn!(worker_id, error = %e, "speed worker failed to start its router");
        while let Some(node) = next_from_queue(&queue).await {
            let _ = results_tx
                .send(SpeedOutcome {
                    name: node.name.clone(),
                    speed_mbps: None,
                    blocked: true,
                })
                .await;
            on_node_complete(&node.name);
        }
    }
}

/// Runs once the worker's router is up: builds the proxied client, then
/// drains the queue until exhausted. Lives inside [`RouterSupervisor::scoped`]'s
/// body, so returning early on any path still tears the router down.
async fn run_body(
    worker_id: usize,
    handle: RouterHandle,
    queue: Arc<tokio::sync::Mutex<mpsc::Receiver<Node>>>,
    config: TestConfig,
    results_tx: mpsc::Sender<SpeedOutcome>,
    on_node_complete: Arc<dyn Fn(&str) + Send + Sync>,
) {
    let client = match build_client(&handle.socks5_url, config.speed_connections.max(1)) {
        Ok(c) => c,
        Err(e) => {
            warn!(worker_id, error = %e, "speed worker failed to build proxied client");
            return;
        }
    };

    let control_client = reqwest::Client::new();
    let mut cached_url: Option<String> = None;
    let node_watchdog = Duration::from_secs(10 + config.speed_timeout_s + 20);

    while let Some(node) = next_from_queue(&queue).await {
        let outcome = tokio::time::timeout(
            node_watchdog,
            test_one_node(&control_client, &client, &handle, &node, &config, &mut cached_url),
        )
        .await
        .unwrap_or_else(|_| {
            warn!(node = %node.name, "speed watchdog expired");
            SpeedOutcome {
                name: node.name.clone(),
                speed_mbps: None,
                blocked: true,
            }
        });

        debug!(node = %outcome.name, speed = ?outcome.speed_mbps, blocked = outcome.blocked, "speed test done");
        let _ = results_tx.send(outcome).await;
        on_node_complete(&node.name);
    }
}

async fn test_one_node(
    control_client: &reqwest::Client,
    client: &reqwest::Client,
    handle: &RouterHandle,
    node: &Node,
    config: &TestConfig,
    cached_url: &mut Option<String>,
) -> SpeedOutcome {
    if !control_api::select_node(control_client, &handle.api_base, &node.name).await {
        return SpeedOutcome {
            name: node.name.clone(),
            speed_mbps: None,
            blocked: true,
        };
    }
    tokio::time::sleep(Duration::from_millis(300)).await;

    let url = match resolve_url(client, cached_url.as_deref()).await {
        Some(url) => url,
        None => {
            *cached_url = None;
            return SpeedOutcome {
                name: node.name.clone(),
                speed_mbps: None,
                blocked: true,
            };
        }
    };
    *cached_url = Some(url.clone());

    let speed_mbps = measure_throughput(
        client,
        &url,
        config.speed_connections.max(1),
        Duration::from_secs(config.speed_timeout_s),
    )
    .await;

    SpeedOutcome {
        name: node.name.clone(),
        blocked: speed_mbps.is_none(),
        speed_mbps,
    }
}

/// Run the whole throughput phase: spin up `speed_workers` workers (each
/// owning a router for its whole lifetime), hand every alive node to
/// exactly one of them, and collect one outcome per node.
pub async fn run(
    alive_nodes: Vec<Node>,
    config: &TestConfig,
    router_binary: &str,
    on_node_complete: impl Fn(&str) + Send + Sync + 'static,
) -> Vec<SpeedOutcome> {
    if alive_nodes.is_empty() {
        debug!("no alive nodes, skipping speed phase without starting any worker routers");
        return Vec::new();
    }

    let worker_count = config.speed_workers.max(1);
    let on_node_complete: Arc<dyn Fn(&str) + Send + Sync> = Arc::new(on_node_complete);
    let nodes = Arc::new(alive_nodes.clone());
    let total = alive_nodes.len();

    let (queue_tx, queue_rx) = mpsc::channel::<Node>(total.max(1));
    for node in alive_nodes {
        let _ = queue_tx.send(node).await;
    }
    drop(queue_tx);
    let queue = Arc::new(tokio::sync::Mutex::new(queue_rx));

    let (results_tx, mut results_rx) = mpsc::channel::<SpeedOutcome>(total.max(1));
    let mut handles = Vec::with_capacity(worker_count);

    for worker_id in 0..worker_count {
        let router_binary = router_binary.to_string();
        let config = config.clone();
        let results_tx = results_tx.clone();
        let on_node_complete = on_node_complete.clone();
        let nodes = nodes.clone();
        let queue = queue.clone();
        handles.push(tokio::spawn(worker_loop(
            worker_id,
            nodes,
            queue,
            router_binary,
            config,
            results_tx,
            on_node_complete,
        )));
    }
    drop(results_tx);

    let mut outcomes = Vec::with_capacity(total);
    while let Some(outcome) = results_rx.recv().await {
        outcomes.push(outcome);
    }
    for h in handles {
        let _ = h.await;
    }
    outcomes
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn probe_url_rejects_sub_kilobyte_body() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![0u8; 500]))
            .mount(&server)
            .await;
        let client = reqwest::Client::new();
        assert!(!probe_url(&client, &server.uri()).await);
    }

    #[tokio::test]
    async fn probe_url_accepts_body_over_gate() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![0u8; 4096]))
            .mount(&server)
            .await;
        let client = reqwest::Client::new();
        assert!(probe_url(&client, &server.uri()).await);
    }

    #[tokio::test]
    async fn resolve_url_prefers_cached_when_still_good() {
        let good = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![0u8; 4096]))
            .mount(&good)
            .await;
        let client = reqwest::Client::new();
        let chosen = resolve_url(&client, Some(&good.uri())).await;
        assert_eq!(chosen, Some(good.uri()));
    }

    #[test]
    fn zero_bytes_or_subsecond_window_yields_null_speed() {
        // measure_throughput's null-result rule is exercised indirectly via
        // its two short-circuit conditions; this asserts the arithmetic
        // that would back them.
        let total_bytes: u64 = 0;
        let elapsed = Duration::from_secs(2);
        let result = if total_bytes == 0 || elapsed < Duration::from_millis(500) {
            None
        } else {
            Some((total_bytes as f64 * 8.0) / elapsed.as_secs_f64() / 1_000_000.0)
        };
        assert_eq!(result, None);
    }

    #[tokio::test]
    async fn all_dead_batch_skips_speed_phase_without_starting_a_router() {
        let config = TestConfig::default();
        let outcomes = run(Vec::new(), &config, "nonexistent-router-binary", |_| {}).await;
        assert!(outcomes.is_empty());
    }
}
