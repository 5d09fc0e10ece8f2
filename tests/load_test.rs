//! Load testing for the dispatch proxy.

use std::time::{Duration, Instant};

mod common;
use common::TestProxy;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_load_performance() {
    let alpha = common::start_mock_backend("Hello from alpha").await;
    let beta = common::start_mock_backend("Hello from beta").await;

    let proxy = TestProxy::start(&format!(
        r#"
[[listeners]]
name = "web"
protocol = "http"
bind_address = "127.0.0.1:0"
max_connections = 1000

[[routes]]
name = "all"
listener = "web"
cluster = "web"

[[clusters]]
name = "web"
load_balancing_policy = "LeastRequests"

[[clusters.destinations]]
address = "{alpha}"

[[clusters.destinations]]
address = "{beta}"
"#
    ))
    .await;

    let client = reqwest::Client::builder()
        .no_proxy()
        .timeout(Duration::from_secs(10))
        .build()
        .unwrap();
    let url = proxy.url("web", "/");

    let num_requests = 500;
    let concurrency = 50;
    let start = Instant::now();

    let mut handles = Vec::with_capacity(concurrency);
    for _ in 0..concurrency {
        let client = client.clone();
        let url = url.clone();
        handles.push(tokio::spawn(async move {
            let mut ok = 0;
            for _ in 0..num_requests / concurrency {
                if let Ok(res) = client.get(&url).send().await {
                    if res.status().is_success() && res.text().await.is_ok() {
                        ok += 1;
                    }
                }
            }
            ok
        }));
    }

    let mut succeeded = 0;
    for handle in handles {
        succeeded += handle.await.unwrap();
    }
    let elapsed = start.elapsed();

    println!(
        "{} requests in {:?} ({:.0} req/s)",
        num_requests,
        elapsed,
        num_requests as f64 / elapsed.as_secs_f64()
    );
    assert_eq!(succeeded, num_requests);

    // Nothing is left in flight once every response body was read.
    tokio::time::sleep(Duration::from_millis(200)).await;
    let cluster = proxy.runtime.cluster("web").unwrap();
    for destination in cluster.destinations().iter() {
        assert_eq!(destination.concurrency(), 0);
    }
}
