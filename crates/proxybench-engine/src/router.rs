//! Subprocess lifecycle for the external proxy-router: port allocation,
//! config generation, readiness polling, and scoped teardown.

use std::future::Future;
use std::process::Stdio;
use std::sync::Mutex;
use std::time::Duration;

use once_cell::sync::Lazy;
use proxybench_core::{EngineError, Node};
use serde::Serialize;
use tokio::process::{Child, Command};
use tokio::time::Instant;
use tracing::{info, warn};

const BASE_SOCKS_PORT: u16 = 17890;
const BASE_API_PORT: u16 = 19090;
const PORT_STRIDE: u16 = 2;

static PORT_COUNTER: Lazy<Mutex<u32>> = Lazy::new(|| Mutex::new(0));

/// Reserve the next disjoint `(socks, api)` port pair. Serialised across
/// instances by a process-wide mutex; the allocator itself never awaits,
/// so the lock is never held across a suspension point.
fn next_port_pair() -> (u16, u16) {
    let mut counter = PORT_COUNTER.lock().unwrap_or_else(|e| e.into_inner());
    let n = *counter;
    *counter += 1;
    let offset = (n as u16).wrapping_mul(PORT_STRIDE);
    (BASE_SOCKS_PORT + offset, BASE_API_PORT + offset)
}

/// Cheap, cloneable pointer to a running router instance's endpoints.
/// The Control API Client and throughput/geo phases only ever need this,
/// never the owning [`RouterSupervisor`] itself.
#[derive(Debug, Clone)]
pub struct RouterHandle {
    pub socks5_url: String,
    pub api_base: String,
}

#[derive(Serialize)]
struct DnsConfig {
    enable: bool,
}

#[derive(Serialize)]
struct ProxyGroup {
    name: String,
    #[serde(rename = "type")]
    group_type: String,
    proxies: Vec<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "kebab-case")]
struct RouterConfigDoc {
    mixed_port: u16,
    allow_lan: bool,
    mode: String,
    log_level: String,
    external_controller: String,
    dns: DnsConfig,
    proxies: Vec<serde_json::Value>,
    proxy_groups: Vec<ProxyGroup>,
    rules: Vec<String>,
}

/// Build the verbatim-forwarding proxy entry for one node: every `extra`
/// field is copied except keys starting with `_`, and `name` is coerced
/// to a string.
fn node_to_proxy_value(node: &Node) -> serde_json::Value {
    let mut map = serde_json::Map::new();
    for (k, v) in &node.extra {
        if !k.starts_with('_') {
            map.insert(k.clone(), v.clone());
        }
    }
    map.insert("name".to_string(), serde_json::Value::String(node.name.clone()));
    map.insert("type".to_string(), serde_json::Value::String(node.node_type.clone()));
    map.insert("server".to_string(), serde_json::Value::String(node.server.clone()));
    map.insert("port".to_string(), serde_json::Value::from(node.port));
    serde_json::Value::Object(map)
}

/// Generate the router config document: every node under one `select`
/// group named `test-group` with a catch-all rule routing through it.
pub fn build_config_yaml(nodes: &[Node], socks_port: u16, api_port: u16) -> String {
    let names: Vec<String> = nodes.iter().map(|n| n.name.clone()).collect();
    let doc = RouterConfigDoc {
        mixed_port: socks_port,
        allow_lan: false,
        mode: "rule".to_string(),
        log_level: "error".to_string(),
        external_controller: format!("127.0.0.1:{api_port}"),
        dns: DnsConfig { enable: false },
        proxies: nodes.iter().map(node_to_proxy_value).collect(),
        proxy_groups: vec![ProxyGroup {
            name: "test-group".to_string(),
            group_type: "select".to_string(),
            proxies: names,
        }],
        rules: vec!["MATCH,test-group".to_string()],
    };
    serde_yaml::to_string(&doc).expect("router config document is always serialisable")
}

/// Poll `GET {api_base}/version` at 200ms intervals until it answers
/// successfully or `timeout` elapses.
async fn wait_until_ready(
    client: &reqwest::Client,
    api_base: &str,
    socks_port: u16,
    api_port: u16,
    timeout: Duration,
) -> Result<(), EngineError> {
    let deadline = Instant::now() + timeout;
    let url = format!("{api_base}/version");
    loop {
        if Instant::now() >= deadline {
            return Err(EngineError::StartTimeout {
                socks_port,
                api_port,
                timeout_s: timeout.as_secs(),
            });
        }
        if let Ok(resp) = client
            .get(&url)
            .timeout(Duration::from_secs(1))
            .send()
            .await
        {
            if resp.status().is_success() {
                return Ok(());
            }
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
}

#[cfg(unix)]
fn send_sigterm(pid: u32) {
    // SAFETY: `kill` with a valid pid and SIGTERM is always safe to call;
    // ESRCH (process already gone) is reported in the return value, which
    // we deliberately ignore below.
    unsafe {
        libc::kill(pid as i32, libc::SIGTERM);
    }
}

/// Owns one external proxy-router process, its temp config directory, and
/// the port pair it was started on.
pub struct RouterSupervisor {
    child: Child,
    #[allow(dead_code)] // kept alive so the directory isn't removed early
    work_dir: tempfile::TempDir,
    handle: RouterHandle,
    socks_port: u16,
    api_port: u16,
}

impl RouterSupervisor {
    /// Materialise a temp working directory with a generated config,
    /// launch the router against it, and block until its REST API
    /// answers or `ready_timeout` expires.
    pub async fn start(
        nodes: &[Node],
        router_binary: &str,
        ready_timeout: Duration,
    ) -> Result<Self, EngineError> {
        let (socks_port, api_port) = next_port_pair();
        let span = tracing::info_span!("router", socks_port, api_port);
        let _enter = span.enter();

        let work_dir = tempfile::Builder::new()
            .prefix(&format!("proxybench-{}-", uuid::Uuid::new_v4().simple()))
            .tempdir()
            .map_err(EngineError::TempDir)?;

        let config_path = work_dir.path().join("config.yaml");
        let config_yaml = build_config_yaml(nodes, socks_port, api_port);
        fs_err::tokio::write(&config_path, config_yaml)
            .await
            .map_err(|e| EngineError::ConfigWrite(e.into()))?;

        info!("starting router");
        let mut child = Command::new(router_binary)
            .arg("-f")
            .arg(&config_path)
            .arg("-d")
            .arg(work_dir.path())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| EngineError::RouterProcess(e.to_string()))?;

        let handle = RouterHandle {
            socks5_url: format!("socks5://127.0.0.1:{socks_port}"),
            api_base: format!("http://127.0.0.1:{api_port}"),
        };

        let client = reqwest::Client::new();
        if let Err(e) =
            wait_until_ready(&client, &handle.api_base, socks_port, api_port, ready_timeout).await
        {
            warn!("router did not become ready, tearing down");
            let _ = child.start_kill();
            let _ = child.wait().await;
            return Err(e);
        }

        info!("router ready");
        Ok(Self {
            child,
            work_dir,
            handle,
            socks_port,
            api_port,
        })
    }

    /// Run `body` with this supervisor's handle, then tear the router
    /// down regardless of how `body` completes. Mirrors an async
    /// context-manager: enter runs `start`, every exit path runs `stop`.
    pub async fn scoped<F, Fut, T>(
        nodes: &[Node],
        router_binary: &str,
        ready_timeout: Duration,
        body: F,
    ) -> Result<T, EngineError>
    where
        F: FnOnce(RouterHandle) -> Fut,
        Fut: Future<Output = T>,
    {
        let supervisor = Self::start(nodes, router_binary, ready_timeout).await?;
        let handle = supervisor.handle();
        let result = body(handle).await;
        supervisor.stop().await;
        Ok(result)
    }

    pub fn handle(&self) -> RouterHandle {
        self.handle.clone()
    }

    pub fn api_base(&self) -> &str {
        &self.handle.api_base
    }

    /// Request graceful termination; force-kill after 5s. Temp directory
    /// removal happens best-effort when `work_dir` drops at the end of
    /// this call (or, if we never get here because of a panic or task
    /// cancellation, `kill_on_drop` + `TempDir`'s own `Drop` still clean
    /// up the process and the directory).
    pub async fn stop(mut self) {
        info!(socks_port = self.socks_port, api_port = self.api_port, "stopping router");
        #[cfg(unix)]
        {
            if let Some(pid) = self.child.id() {
                send_sigterm(pid);
            }
        }
        #[cfg(not(unix))]
        {
            let _ = self.child.start_kill();
        }

        match tokio::time::timeout(Duration::from_secs(5), self.child.wait()).await {
            Ok(_) => {}
            Err(_) => {
                warn!("router did not exit within 5s, killing");
                let _ = self.child.start_kill();
                let _ = self.child.wait().await;
            }
        }
        // `self.work_dir` drops here, removing the temp directory best-effort.
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proxybench_core::Node;

    #[test]
    fn port_allocator_serialises_disjoint_pairs() {
        // Reset isn't possible (global, shared with other tests in this
        // binary), so we only assert the *shape* of the invariant: each
        // call advances by the fixed stride and never collides with the
        // reserved common proxy port.
        // Other tests in this binary also draw from the same global
        // counter concurrently, so we can only assert the invariants
        // that hold regardless of interleaving: strictly increasing,
        // stride-aligned, and never colliding with the reserved common
        // proxy port.
        let (s1, a1) = next_port_pair();
        let (s2, a2) = next_port_pair();
        assert!(s2 > s1 && (s2 - s1) % PORT_STRIDE == 0);
        assert!(a2 > a1 && (a2 - a1) % PORT_STRIDE == 0);
        assert_ne!(s1, 7890);
        assert_ne!(s2, 7890);
    }

    #[test]
    fn config_yaml_strips_underscore_keys_and_coerces_name() {
        let mut node = Node::new("node-a", "airport-1", "trojan", "example.com", 443);
        node.extra.insert(
            "password".to_string(),
            serde_json::Value::String("secret".to_string()),
        );
        node.extra.insert(
            "_internal_id".to_string(),
            serde_json::Value::String("hidden".to_string()),
        );
        let yaml = build_config_yaml(std::slice::from_ref(&node), 17890, 19090);
        assert!(yaml.contains("password: secret"));
        assert!(!yaml.contains("_internal_id"));
        assert!(!yaml.contains("hidden"));
        assert!(yaml.contains("mixed-port: 17890"));
        assert!(yaml.contains("external-controller: 127.0.0.1:19090"));
        assert!(yaml.contains("name: test-group"));
        assert!(yaml.contains("MATCH,test-group"));
    }

    #[test]
    fn config_yaml_never_forwards_source_name() {
        let node = Node::new("node-a", "airport-1", "trojan", "example.com", 443);
        let yaml = build_config_yaml(std::slice::from_ref(&node), 17890, 19090);
        assert!(!yaml.contains("airport-1"));
    }

    #[tokio::test]
    async fn wait_until_ready_times_out_with_no_server() {
        let client = reqwest::Client::new();
        let err = wait_until_ready(
            &client,
            "http://127.0.0.1:1", // nothing listens here
            17890,
            19090,
            Duration::from_millis(500),
        )
        .await
        .unwrap_err();
        assert_matches::assert_matches!(err, EngineError::StartTimeout { .. });
    }

    #[tokio::test]
    async fn wait_until_ready_succeeds_against_mock_server() {
        let server = wiremock::MockServer::start().await;
        wiremock::Mock::given(wiremock::matchers::method("GET"))
            .and(wiremock::matchers::path("/version"))
            .respond_with(wiremock::ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "version": "test"
            })))
            .mount(&server)
            .await;

        let client = reqwest::Client::new();
        wait_until_ready(&client, &server.uri(), 17890, 19090, Duration::from_secs(2))
            .await
            .unwrap();
    }
}
