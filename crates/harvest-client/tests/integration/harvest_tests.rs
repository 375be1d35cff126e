use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use harvest_client::HttpPortal;
use harvest_core::{
    EgressPool, HarvestConfig, KeyAlphabet, Orchestrator, RetryConfig, SystemClock,
    ThrottleConfig, TracingRunReporter,
};

async fn mount_portal(server: &MockServer) {
    Mock::given(method("POST"))
        .and(path("/auth"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"token": "tok"})))
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path("/regions"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!([{"id": "Travis", "categories": ["OSSF"]}])),
        )
        .mount(server)
        .await;

    // Prefix "1" holds three records split over two pages of two.
    Mock::given(method("GET"))
        .and(path("/search"))
        .and(query_param("prefix", "1"))
        .and(query_param("offset", "0"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "records": [
                {"id": "1001", "address": "1001 Ranch Rd"},
                {"id": "1002", "address": "1002 Ranch Rd"}
            ],
            "total": 3
        })))
        .with_priority(1)
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path("/search"))
        .and(query_param("prefix", "1"))
        .and(query_param("offset", "2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "records": [{"id": "1003", "address": "1003 Ranch Rd"}],
            "total": 3
        })))
        .with_priority(1)
        .mount(server)
        .await;

    // Anything else is empty.
    Mock::given(method("GET"))
        .and(path("/search"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({"records": [], "total": 0})),
        )
        .mount(server)
        .await;
}

fn fast_config(dir: &std::path::Path) -> HarvestConfig {
    HarvestConfig::new(dir)
        .with_workers(2)
        .with_page_size(2)
        .with_throttle(ThrottleConfig::new(Duration::ZERO))
        .with_alphabet(KeyAlphabet::from_chars("12").unwrap())
        .with_retry(RetryConfig {
            jitter: Duration::ZERO,
            ..RetryConfig::default()
        })
}

#[tokio::test]
async fn test_full_run_over_http() -> anyhow::Result<()> {
    let server = MockServer::start().await;
    mount_portal(&server).await;
    let dir = tempfile::tempdir()?;

    let portal = HttpPortal::new(&server.uri(), "inspector", "hunter2")?;
    let orchestrator = Orchestrator::new(
        portal,
        fast_config(dir.path()),
        EgressPool::direct(),
        SystemClock,
    );
    let summary = orchestrator
        .run(CancellationToken::new(), Arc::new(TracingRunReporter))
        .await?;

    assert_eq!(summary.planned, 2);
    assert_eq!(summary.completed, 2);
    assert_eq!(summary.records_emitted, 3);

    let content = std::fs::read_to_string(dir.path().join("travis_ossf_1.ndjson"))?;
    let ids: Vec<String> = content
        .lines()
        .map(|line| {
            let value: serde_json::Value = serde_json::from_str(line).unwrap();
            value["id"].as_str().unwrap().to_string()
        })
        .collect();
    assert_eq!(ids, vec!["1001", "1002", "1003"]);
    assert!(dir.path().join("travis_ossf_2.ndjson").exists());
    Ok(())
}

#[tokio::test]
async fn test_rerun_makes_no_search_requests() -> anyhow::Result<()> {
    let server = MockServer::start().await;
    mount_portal(&server).await;
    let dir = tempfile::tempdir()?;
    let config = fast_config(dir.path());

    for _ in 0..2 {
        let portal = HttpPortal::new(&server.uri(), "inspector", "hunter2")?;
        Orchestrator::new(portal, config.clone(), EgressPool::direct(), SystemClock)
            .run(CancellationToken::new(), Arc::new(TracingRunReporter))
            .await?;
    }

    let searches = server
        .received_requests()
        .await
        .unwrap_or_default()
        .into_iter()
        .filter(|r| r.url.path() == "/search")
        .count();
    // First run: two pages for "1", one empty page for "2".
    assert_eq!(searches, 3);
    Ok(())
}
