//! End-to-end: logged traffic -> detection run -> auto-block -> rejected request.

use axum::body::Body;
use axum::http::{Request, StatusCode};
use chrono::{Duration, Utc};
use tempfile::TempDir;
use tower::ServiceExt;

use ipwatch::config::IpWatchConfig;
use ipwatch::detect::Severity;
use ipwatch::geo::Location;
use ipwatch::storage::record_request;

fn get(uri: &str, client: &str) -> Request<Body> {
    Request::builder()
        .uri(uri)
        .header("x-real-ip", client)
        .body(Body::empty())
        .unwrap()
}

#[tokio::test]
async fn test_critical_volume_is_auto_blocked() {
    let dir = TempDir::new().unwrap();
    let mut config = IpWatchConfig::default();
    config.storage.db_path = dir.path().join("e2e.db").display().to_string();
    config.geolocation.enabled = false;
    config.detection.volume.critical_threshold = Some(550);

    let state = ipwatch::build_state(&config).unwrap();
    let app = ipwatch::api::router(state.clone());

    let attacker = "198.51.100.200";
    let start = Utc::now() - Duration::minutes(2);
    for i in 0..600 {
        let path = if i % 20 == 0 { "/admin/login" } else { "/" };
        let ts = start + Duration::milliseconds(i * 100);
        record_request(&state.pool, attacker, path, ts, &Location::default()).unwrap();
    }

    // before detection the attacker is served
    let resp = app.clone().oneshot(get("/api/v1/health", attacker)).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let summary = state.engine.run().await.unwrap();
    assert_eq!(summary.events_analyzed, 601);
    assert_eq!(summary.flags_created, 3);

    let records = state.ledger.list_recent(10).unwrap();
    let volume = records
        .iter()
        .find(|r| r.reason.starts_with("excessive requests"))
        .unwrap();
    assert_eq!(volume.severity, Severity::Critical);
    assert_eq!(volume.reason, "excessive requests: 601 requests/hour");

    let blocks = state.denylist.list_active().unwrap();
    assert_eq!(blocks.len(), 1);
    assert_eq!(blocks[0].address, attacker);
    assert!(blocks[0].reason.starts_with("auto-blocked: excessive requests"));

    let resp = app.clone().oneshot(get("/api/v1/health", attacker)).await.unwrap();
    assert_eq!(resp.status(), StatusCode::FORBIDDEN);

    let resp = app.oneshot(get("/api/v1/health", "192.0.2.10")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    // a second run inside the suppression window adds nothing
    let again = state.engine.run().await.unwrap();
    assert_eq!(again.flags_created, 0);
}
