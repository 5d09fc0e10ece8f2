//! End-to-end HTTP dispatch through a live listener.

use std::collections::HashMap;
use std::time::Duration;

mod common;
use common::TestProxy;

fn http_config(route_extra: &str, cluster_extra: &str, destinations: &[std::net::SocketAddr]) -> String {
    let mut config = format!(
        r#"
[[listeners]]
name = "web"
protocol = "http"
bind_address = "127.0.0.1:0"

[[routes]]
name = "api"
listener = "web"
cluster = "backends"
path_prefix = "/api"
{route_extra}

[[clusters]]
name = "backends"
{cluster_extra}
"#
    );
    for destination in destinations {
        config.push_str(&format!("\n[[clusters.destinations]]\naddress = \"{}\"\n", destination));
    }
    config
}

#[tokio::test]
async fn round_robin_spreads_requests() {
    let alpha = common::start_mock_backend("alpha").await;
    let beta = common::start_mock_backend("beta").await;
    let proxy = TestProxy::start(&http_config("", "", &[alpha, beta])).await;
    let client = common::client();

    let mut seen: HashMap<String, usize> = HashMap::new();
    for _ in 0..4 {
        let res = client.get(proxy.url("web", "/api/items")).send().await.unwrap();
        assert_eq!(res.status(), 200);
        *seen.entry(res.text().await.unwrap()).or_default() += 1;
    }

    assert_eq!(seen.get("alpha"), Some(&2));
    assert_eq!(seen.get("beta"), Some(&2));
}

#[tokio::test]
async fn unmatched_path_is_not_found() {
    let alpha = common::start_mock_backend("alpha").await;
    let proxy = TestProxy::start(&http_config("", "", &[alpha])).await;

    let res = common::client().get(proxy.url("web", "/other")).send().await.unwrap();
    assert_eq!(res.status(), 404);
}

#[tokio::test]
async fn responses_carry_request_id() {
    let alpha = common::start_mock_backend("alpha").await;
    let proxy = TestProxy::start(&http_config("", "", &[alpha])).await;
    let client = common::client();

    let res = client.get(proxy.url("web", "/api")).send().await.unwrap();
    assert!(res.headers().contains_key("x-request-id"));

    let res = client
        .get(proxy.url("web", "/api"))
        .header("x-request-id", "caller-chosen")
        .send()
        .await
        .unwrap();
    assert_eq!(res.headers()["x-request-id"], "caller-chosen");
}

#[tokio::test]
async fn exhausted_token_bucket_rejects_with_retry_after() {
    let alpha = common::start_mock_backend("alpha").await;
    let limit = r#"
[routes.rate_limit]
policy = "total"
algorithm = "token_bucket"
permit_limit = 1
tokens_per_period = 1
replenishment_period_ms = 60000
"#;
    let proxy = TestProxy::start(&http_config(limit, "", &[alpha])).await;
    let client = common::client();

    let first = client.get(proxy.url("web", "/api")).send().await.unwrap();
    assert_eq!(first.status(), 200);

    let second = client.get(proxy.url("web", "/api")).send().await.unwrap();
    assert_eq!(second.status(), 429);
    assert!(second.headers().contains_key("retry-after"));
}

#[tokio::test]
async fn failing_destination_is_deactivated() {
    let dead = common::closed_port().await;
    let passive = r#"
[clusters.health_check.passive]
minimal_total_count_threshold = 1
failure_rate_limit = 0.5
reactivation_period_ms = 60000
"#;
    let proxy = TestProxy::start(&http_config("", passive, &[dead])).await;
    let client = common::client();

    let first = client.get(proxy.url("web", "/api")).send().await.unwrap();
    assert_eq!(first.status(), 502);

    // Availability is recomputed on a background task.
    tokio::time::sleep(Duration::from_millis(100)).await;

    let second = client.get(proxy.url("web", "/api")).send().await.unwrap();
    assert_eq!(second.status(), 503);
}

#[tokio::test]
async fn affinity_header_pins_destination() {
    let alpha = common::start_mock_backend("alpha").await;
    let beta = common::start_mock_backend("beta").await;
    let affinity = r#"
[clusters.session_affinity]
name = "x-affinity"
transport = "header"
encoding = "address"
"#;
    let proxy = TestProxy::start(&http_config("", affinity, &[alpha, beta])).await;
    let client = common::client();

    let first = client.get(proxy.url("web", "/api")).send().await.unwrap();
    let token = first.headers()["x-affinity"].to_str().unwrap().to_string();
    let expected = first.text().await.unwrap();
    let pinned = if expected == "alpha" { alpha } else { beta };
    assert_eq!(token, pinned.to_string());

    for _ in 0..4 {
        let res = client
            .get(proxy.url("web", "/api"))
            .header("x-affinity", &token)
            .send()
            .await
            .unwrap();
        assert_eq!(res.text().await.unwrap(), expected);
    }
}

#[tokio::test]
async fn reload_redirects_traffic() {
    let alpha = common::start_mock_backend("alpha").await;
    let beta = common::start_mock_backend("beta").await;
    let proxy = TestProxy::start(&http_config("", "", &[alpha])).await;
    let client = common::client();

    let res = client.get(proxy.url("web", "/api")).send().await.unwrap();
    assert_eq!(res.text().await.unwrap(), "alpha");

    let next = dispatch_proxy::config::loader::parse_config(&http_config("", "", &[beta])).unwrap();
    proxy.runtime.apply_config(next).await.unwrap();

    let res = client.get(proxy.url("web", "/api")).send().await.unwrap();
    assert_eq!(res.text().await.unwrap(), "beta");
}
