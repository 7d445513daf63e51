use serde::{Deserialize, Serialize};

/// Tunables for the three testing phases. Every field has the default
/// named in the component design so a config file only needs to override
/// what differs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
#[cfg_attr(feature = "schema", derive(schemars::JsonSchema))]
pub struct TestConfig {
    /// Path to the router binary, or `None` to resolve it via `PATH`.
    pub router_binary: Option<String>,
    /// How long to wait for a freshly spawned router's REST API to answer.
    pub ready_timeout_s: u64,

    /// Control-plane probe target used for every latency round.
    pub latency_url: String,
    /// Rounds of probing per node.
    pub latency_rounds: u32,
    /// Per-round timeout handed to the router's delay endpoint.
    pub latency_timeout_ms: u64,
    /// Max outstanding probes against the single latency-phase router.
    pub latency_concurrency: usize,

    /// Whether to run the throughput phase at all.
    pub enable_speed: bool,
    /// Number of concurrent speed workers, each owning one router.
    pub speed_workers: usize,
    /// Length of the throughput measurement window, per node.
    pub speed_timeout_s: u64,
    /// Parallel download connections per worker during the window.
    pub speed_connections: usize,

    /// Whether to run the geolocation phase at all.
    pub enable_geo: bool,
}

impl Default for TestConfig {
    fn default() -> Self {
        Self {
            router_binary: None,
            ready_timeout_s: 10,
            latency_url: "http://www.gstatic.com/generate_204".to_string(),
            latency_rounds: 10,
            latency_timeout_ms: 5000,
            latency_concurrency: 30,
            enable_speed: true,
            speed_workers: 5,
            speed_timeout_s: 10,
            speed_connections: 16,
            enable_geo: true,
        }
    }
}
