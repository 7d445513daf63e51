//! End-to-end check against a real router binary. Ignored by default:
//! run explicitly with `cargo test -- --ignored` on a machine that has a
//! router binary on `PATH`.

use std::time::Duration;

use proxybench_core::Node;
use proxybench_engine::RouterSupervisor;

#[tokio::test]
#[ignore]
async fn real_router_becomes_ready_and_answers_control_api() {
    let binary = which::which("mihomo").expect("mihomo must be on PATH for this test");
    let nodes = vec![Node::new(
        "node-a",
        "airport-1",
        "trojan",
        "example.com",
        443,
    )];

    let supervisor = RouterSupervisor::start(&nodes, binary.to_str().unwrap(), Duration::from_secs(10))
        .await
        .expect("router should become ready");

    let client = reqwest::Client::new();
    let resp = client
        .get(format!("{}/version", supervisor.api_base()))
        .send()
        .await
        .expect("version endpoint should answer");
    assert!(resp.status().is_success());

    supervisor.stop().await;
}
