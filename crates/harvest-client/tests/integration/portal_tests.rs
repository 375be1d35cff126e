use std::time::Duration;

use serde_json::json;
use wiremock::matchers::{body_json, header, method, path, query_param, query_param_is_missing};
use wiremock::{Mock, MockServer, ResponseTemplate};

use harvest_client::HttpPortal;
use harvest_core::{EgressIdentity, HarvestError, PageRequest, Partition, PortalAdapter, Session};

fn session() -> Session {
    Session {
        token: "tok-123".into(),
    }
}

fn request(prefix: Option<&str>, offset: u64) -> PageRequest {
    PageRequest {
        partition: Partition::new("Travis", "OSSF", prefix.map(String::from)),
        offset,
        page_size: 100,
    }
}

async fn portal_for(server: &MockServer) -> HttpPortal {
    HttpPortal::new(&format!("{}/api", server.uri()), "inspector", "hunter2").unwrap()
}

#[tokio::test]
async fn test_authenticate_returns_token() -> anyhow::Result<()> {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/auth"))
        .and(body_json(json!({"username": "inspector", "password": "hunter2"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"token": "tok-123"})))
        .expect(1)
        .mount(&server)
        .await;

    let portal = portal_for(&server).await;
    let session = portal.authenticate(&EgressIdentity::direct()).await?;
    assert_eq!(session.token, "tok-123");
    Ok(())
}

#[tokio::test]
async fn test_rejected_credentials_are_fatal() {
    let server = MockServer::start().await;
    for status in [401, 403] {
        server.reset().await;
        Mock::given(method("POST"))
            .and(path("/api/auth"))
            .respond_with(ResponseTemplate::new(status).set_body_string("bad credentials"))
            .mount(&server)
            .await;

        let err = portal_for(&server)
            .await
            .authenticate(&EgressIdentity::direct())
            .await
            .unwrap_err();
        assert!(matches!(err, HarvestError::AuthFailed(_)), "{status}: {err:?}");
        assert!(err.is_fatal());
    }
}

#[tokio::test]
async fn test_enumerate_regions_sends_bearer_token() -> anyhow::Result<()> {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/regions"))
        .and(header("authorization", "Bearer tok-123"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            {"id": "Travis", "categories": ["OSSF", "Commercial"]},
            {"id": "Hays", "categories": ["OSSF"]}
        ])))
        .mount(&server)
        .await;

    let regions = portal_for(&server)
        .await
        .enumerate_regions(&session(), &EgressIdentity::direct())
        .await?;
    assert_eq!(regions.len(), 2);
    assert_eq!(regions[0].id, "Travis");
    assert_eq!(regions[0].categories, vec!["OSSF", "Commercial"]);
    Ok(())
}

#[tokio::test]
async fn test_fetch_page_query_and_parsing() -> anyhow::Result<()> {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/search"))
        .and(header("authorization", "Bearer tok-123"))
        .and(query_param("region", "Travis"))
        .and(query_param("category", "OSSF"))
        .and(query_param("prefix", "1"))
        .and(query_param("offset", "200"))
        .and(query_param("limit", "100"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "records": [
                {"id": 1204, "address": "1204 Ranch Rd", "status": "Issued"},
                {"id": "1205", "address": "1205 Ranch Rd"}
            ],
            "total": 237
        })))
        .mount(&server)
        .await;

    let page = portal_for(&server)
        .await
        .fetch_page(&session(), &EgressIdentity::direct(), &request(Some("1"), 200))
        .await?;

    assert_eq!(page.total, Some(237));
    assert_eq!(page.records.len(), 2);
    assert_eq!(page.records[0].id, "1204");
    assert_eq!(page.records[0].fields["status"], "Issued");
    assert_eq!(page.records[1].id, "1205");
    Ok(())
}

#[tokio::test]
async fn test_catch_all_partition_omits_prefix() -> anyhow::Result<()> {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/search"))
        .and(query_param_is_missing("prefix"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"records": []})))
        .mount(&server)
        .await;

    let page = portal_for(&server)
        .await
        .fetch_page(&session(), &EgressIdentity::direct(), &request(None, 0))
        .await?;
    assert!(page.records.is_empty());
    assert_eq!(page.total, None);
    Ok(())
}

#[tokio::test]
async fn test_status_mapping() {
    let server = MockServer::start().await;
    let portal = portal_for(&server).await;

    let cases: [(u16, fn(&HarvestError) -> bool); 5] = [
        (429, |e| matches!(e, HarvestError::RateLimited)),
        (403, |e| matches!(e, HarvestError::Forbidden)),
        (503, |e| matches!(e, HarvestError::Server { status: 503 })),
        (401, |e| matches!(e, HarvestError::AuthFailed(_))),
        (404, |e| matches!(e, HarvestError::Http { status: 404, .. })),
    ];

    for (status, expected) in cases {
        server.reset().await;
        Mock::given(method("GET"))
            .and(path("/api/search"))
            .respond_with(ResponseTemplate::new(status).set_body_string("nope"))
            .mount(&server)
            .await;

        let err = portal
            .fetch_page(&session(), &EgressIdentity::direct(), &request(Some("1"), 0))
            .await
            .unwrap_err();
        assert!(expected(&err), "HTTP {status} mapped to {err:?}");
    }
}

#[tokio::test]
async fn test_malformed_body_is_rejected_not_retried() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/search"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html>maintenance</html>"))
        .mount(&server)
        .await;

    let err = portal_for(&server)
        .await
        .fetch_page(&session(), &EgressIdentity::direct(), &request(Some("1"), 0))
        .await
        .unwrap_err();
    assert!(matches!(err, HarvestError::Http { status: 200, .. }));
    assert!(!err.is_retryable());
}

#[tokio::test]
async fn test_slow_response_times_out() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/search"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"records": []}))
                .set_delay(Duration::from_secs(5)),
        )
        .mount(&server)
        .await;

    let portal = portal_for(&server)
        .await
        .with_timeout(Duration::from_millis(200));
    let err = portal
        .fetch_page(&session(), &EgressIdentity::direct(), &request(Some("1"), 0))
        .await
        .unwrap_err();
    assert!(matches!(err, HarvestError::Timeout(_)), "{err:?}");
    assert!(err.is_retryable());
}

#[tokio::test]
async fn test_connection_refused_is_transport_error() {
    // Bind then drop a listener to get a port with nothing behind it.
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let portal = HttpPortal::new(&format!("http://{addr}"), "u", "p").unwrap();
    let err = portal
        .fetch_page(&session(), &EgressIdentity::direct(), &request(Some("1"), 0))
        .await
        .unwrap_err();
    assert!(matches!(err, HarvestError::Transport(_)), "{err:?}");
}
