//! Stateless REST helpers against a running router's control API.

use std::time::Duration;

use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};
use serde::Deserialize;
use tracing::debug;

#[derive(Deserialize)]
struct DelayResponse {
    #[serde(default)]
    delay: Option<f64>,
}

/// `GET /proxies/{name}/delay?url=&timeout=`. Returns `None` on any
/// non-200 status, a missing/zero `delay` field, or transport failure —
/// all of which are equivalent to a timed-out round from the caller's
/// perspective.
pub async fn test_latency(
    client: &reqwest::Client,
    api_base: &str,
    name: &str,
    probe_url: &str,
    timeout_ms: u64,
) -> Option<f64> {
    let encoded_name = utf8_percent_encode(name, NON_ALPHANUMERIC).to_string();
    let url = format!("{api_base}/proxies/{encoded_name}/delay");
    let watchdog = Duration::from_millis(timeout_ms) + Duration::from_secs(5);

    let result = client
        .get(&url)
        .query(&[("url", probe_url), ("timeout", &timeout_ms.to_string())])
        .timeout(watchdog)
        .send()
        .await;

    let resp = match result {
        Ok(resp) if resp.status() == reqwest::StatusCode::OK => resp,
        Ok(resp) => {
            debug!(node = name, status = %resp.status(), "latency probe non-200");
            return None;
        }
        Err(e) => {
            debug!(node = name, error = %e, "latency probe transport error");
            return None;
        }
    };

    match resp.json::<DelayResponse>().await {
        Ok(body) => match body.delay {
            Some(ms) if ms > 0.0 => Some(ms),
            _ => None,
        },
        Err(e) => {
            debug!(node = name, error = %e, "latency probe malformed body");
            None
        }
    }
}

/// `PUT /proxies/test-group` with `{"name": name}`. Swallows all
/// failures into `false` rather than raising.
pub async fn select_node(client: &reqwest::Client, api_base: &str, name: &str) -> bool {
    let url = format!("{api_base}/proxies/test-group");
    let result = client
        .put(&url)
        .json(&serde_json::json!({ "name": name }))
        .timeout(Duration::from_secs(5))
        .send()
        .await;

    match result {
        Ok(resp) => {
            let ok = matches!(
                resp.status(),
                reqwest::StatusCode::OK | reqwest::StatusCode::NO_CONTENT
            );
            if !ok {
                debug!(node = name, status = %resp.status(), "select_node rejected");
            }
            ok
        }
        Err(e) => {
            debug!(node = name, error = %e, "select_node transport error");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_json, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_latency_returns_delay_on_success() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/proxies/node-a/delay"))
            .and(query_param("url", "http://probe"))
            .and(query_param("timeout", "5000"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"delay": 42.5})))
            .mount(&server)
            .await;

        let client = reqwest::Client::new();
        let delay = test_latency(&client, &server.uri(), "node-a", "http://probe", 5000).await;
        assert_eq!(delay, Some(42.5));
    }

    #[tokio::test]
    async fn test_latency_percent_encodes_name() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/proxies/node a/b/delay"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/proxies/node%20a%2Fb/delay"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"delay": 10.0})))
            .mount(&server)
            .await;

        let client = reqwest::Client::new();
        let delay = test_latency(&client, &server.uri(), "node a/b", "http://probe", 1000).await;
        assert_eq!(delay, Some(10.0));
    }

    #[tokio::test]
    async fn test_latency_returns_none_on_zero_delay() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"delay": 0})))
            .mount(&server)
            .await;

        let client = reqwest::Client::new();
        let delay = test_latency(&client, &server.uri(), "node-a", "http://probe", 1000).await;
        assert_eq!(delay, None);
    }

    #[tokio::test]
    async fn test_latency_returns_none_on_non_200() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let client = reqwest::Client::new();
        let delay = test_latency(&client, &server.uri(), "node-a", "http://probe", 1000).await;
        assert_eq!(delay, None);
    }

    #[tokio::test]
    async fn select_node_true_on_200_and_204() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/proxies/test-group"))
            .and(body_json(serde_json::json!({"name": "node-a"})))
            .respond_with(ResponseTemplate::new(204))
            .mount(&server)
            .await;

        let client = reqwest::Client::new();
        assert!(select_node(&client, &server.uri(), "node-a").await);
    }

    #[tokio::test]
    async fn select_node_false_on_error_status() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .respond_with(ResponseTemplate::new(400))
            .mount(&server)
            .await;

        let client = reqwest::Client::new();
        assert!(!select_node(&client, &server.uri(), "node-a").await);
    }
}
