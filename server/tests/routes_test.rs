use std::time::Duration;

use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use tower::ServiceExt;

use powerwatch_core::{dispatch_queue, BrokerLiveness, RelayHandle, StreamFanout};
use powerwatch_server::{router, AppState, VERSION};

fn state(connected: bool) -> (AppState, StreamFanout) {
    let fanout = StreamFanout::new();
    let (queue, _consumer) = dispatch_queue();
    let relay = RelayHandle {
        fanout: fanout.clone(),
        liveness: BrokerLiveness::new(connected),
        queue_depth: queue.depth_gauge(),
    };
    (AppState::new(relay, Duration::from_secs(15)), fanout)
}

async fn body_string(resp: axum::response::Response) -> String {
    let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

fn post_event(body: &'static str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/power-events")
        .header("content-type", "application/json")
        .body(Body::from(body))
        .unwrap()
}

#[tokio::test]
async fn version_returns_static_string() {
    let (state, _) = state(true);
    let resp = router(state)
        .oneshot(Request::builder().uri("/version").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(body_string(resp).await, VERSION);
}

#[tokio::test]
async fn health_reports_broker_liveness() {
    let (up, fanout) = state(true);
    let _client = fanout.subscribe();
    let resp = router(up)
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let json: serde_json::Value = serde_json::from_str(&body_string(resp).await).unwrap();
    assert_eq!(json["broker_connected"], true);
    assert_eq!(json["subscribers"], 1);
    assert_eq!(json["queue_depth"], 0);

    let (down, _) = state(false);
    let resp = router(down)
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn ingest_accepts_valid_event_without_relaying_it() {
    let (state, fanout) = state(true);
    let mut client = fanout.subscribe();
    let resp = router(state)
        .oneshot(post_event(
            r#"{"state":"Standby","timeGenerated":"2025-12-20T12:30:00"}"#,
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::ACCEPTED);
    assert!(client.try_recv().is_none());
}

#[tokio::test]
async fn ingest_rejects_malformed_event() {
    let (state, _) = state(true);
    let resp = router(state)
        .oneshot(post_event(r#"{"state":"Awake"}"#))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    assert!(body_string(resp).await.contains("timeGenerated"));
}

#[tokio::test]
async fn cors_allows_any_origin() {
    let (state, _) = state(true);
    let resp = router(state)
        .oneshot(
            Request::builder()
                .uri("/version")
                .header("origin", "http://localhost:5173")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.headers()["access-control-allow-origin"], "*");
}
