//! Exit-IP geolocation attribution through a shared router, under a strict
//! per-request rate cap enforced against a monotonic clock.

use std::sync::Arc;
use std::time::Duration;

use proxybench_core::{EngineError, Node, TestConfig};
use serde::Deserialize;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::control_api;
use crate::router::{RouterHandle, RouterSupervisor};

const MIN_REQUEST_INTERVAL: Duration = Duration::from_millis(1400);
const GEO_ENDPOINT: &str = "http://ip-api.com/json";
const GEO_FIELDS: &str = "status,country,countryCode,city,isp,query";

#[derive(Debug, Clone, Default, PartialEq)]
pub struct GeoOutcome {
    pub name: String,
    pub exit_ip: Option<String>,
    pub exit_country: Option<String>,
    pub exit_city: Option<String>,
    pub exit_isp: Option<String>,
}

#[derive(Deserialize)]
struct GeoResponse {
    status: String,
    #[serde(default)]
    #[serde(rename = "countryCode")]
    country_code: Option<String>,
    #[serde(default)]
    city: Option<String>,
    #[serde(default)]
    isp: Option<String>,
    #[serde(default)]
    query: Option<String>,
}

/// Serialises issuance of geo requests so the gap between any two
/// consecutive requests is never below [`MIN_REQUEST_INTERVAL`], measured
/// against a monotonic clock so wall-clock steps can't shrink it.
struct RateLimiter {
    last_issued: Mutex<Option<Instant>>,
}

impl RateLimiter {
    fn new() -> Self {
        Self {
            last_issued: Mutex::new(None),
        }
    }

    /// Hold the single permit for exactly as long as it takes to wait out
    /// the remaining interval, then return it; the caller's own request
    /// happens after this returns, outside the lock.
    async fn wait_turn(&self) {
        let mut last = self.last_issued.lock().await;
        if let Some(prev) = *last {
            let elapsed = prev.elapsed();
            if elapsed < MIN_REQUEST_INTERVAL {
                tokio::time::sleep(MIN_REQUEST_INTERVAL - elapsed).await;
            }
        }
        *last = Some(Instant::now());
    }
}

async fn fetch_geo(client: &reqwest::Client, geo_url: &str) -> Option<GeoResponse> {
    let resp = client
        .get(geo_url)
        .timeout(Duration::from_secs(15))
        .send()
        .await
        .ok()?;
    if resp.status() != reqwest::StatusCode::OK {
        return None;
    }
    let body = resp.json::<GeoResponse>().await.ok()?;
    if body.status != "success" {
        return None;
    }
    Some(body)
}

/// Run the geo phase against an already-running router. Split from
/// [`run`] so the rate limiter and parsing can be tested with `wiremock`
/// standing in for `ip-api.com`.
pub async fn run_against(
    handle: &RouterHandle,
    alive_nodes: &[Node],
    geo_base_url: &str,
    on_node_complete: impl Fn(&str) + Send + Sync + 'static,
) -> Vec<GeoOutcome> {
    let client = reqwest::Client::new();
    let control_client = reqwest::Client::new();
    let limiter = Arc::new(RateLimiter::new());
    let geo_url = format!("{geo_base_url}?fields={GEO_FIELDS}");
    let mut outcomes = Vec::with_capacity(alive_nodes.len());

    for node in alive_nodes {
        limiter.wait_turn().await;

        if !control_api::select_node(&control_client, &handle.api_base, &node.name).await {
            outcomes.push(GeoOutcome {
                name: node.name.clone(),
                ..Default::default()
            });
            on_node_complete(&node.name);
            continue;
        }

        let outcome = match fetch_geo(&client, &geo_url).await {
            Some(body) => {
                debug!(node = %node.name, "geo lookup succeeded");
                GeoOutcome {
                    name: node.name.clone(),
                    exit_ip: body.query,
                    exit_country: body.country_code,
                    exit_city: body.city,
                    exit_isp: body.isp,
                }
            }
            None => {
                debug!(node = %node.name, "geo lookup failed, leaving fields null");
                GeoOutcome {
                    name: node.name.clone(),
                    ..Default::default()
                }
            }
        };
        outcomes.push(outcome);
        on_node_complete(&node.name);
    }

    outcomes
}

/// Launch one shared router loaded with every alive node and attribute
/// exit geolocation to each in turn. A router that fails to start aborts
/// the phase but never touches already-collected latency/speed data.
pub async fn run(
    alive_nodes: &[Node],
    config: &TestConfig,
    router_binary: &str,
    on_node_complete: impl Fn(&str) + Send + Sync + 'static,
) -> Result<Vec<GeoOutcome>, EngineError> {
    if alive_nodes.is_empty() {
        info!("no alive nodes, skipping geo phase without starting a router");
        return Ok(Vec::new());
    }

    info!(nodes = alive_nodes.len(), "starting geo phase");
    let outcomes = RouterSupervisor::scoped(
        alive_nodes,
        router_binary,
        Duration::from_secs(config.ready_timeout_s),
        |handle| async move {
            run_against(&handle, alive_nodes, GEO_ENDPOINT, on_node_complete).await
        },
    )
    .await?;
    info!("geo phase complete");
    Ok(outcomes)
}
