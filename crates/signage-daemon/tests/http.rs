mod common;

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use common::harness::Harness;
use signage_daemon::http::router;
use signage_proto::protocol::{Channel, ChannelStatus, ContentType, LiveState, PlaylistEntry};
use std::time::Duration;
use tower::ServiceExt;

async fn call(
    app: axum::Router,
    method: &str,
    uri: &str,
) -> (StatusCode, axum::http::HeaderMap, Vec<u8>) {
    let response = app
        .oneshot(
            Request::builder()
                .method(method)
                .uri(uri)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let status = response.status();
    let headers = response.headers().clone();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, headers, body.to_vec())
}

fn lobby() -> Channel {
    Channel::new(1, "Lobby", ContentType::Video).with_contents(["loop.mp4"])
}

#[tokio::test]
async fn start_status_and_playlist_over_http() {
    let h = Harness::start(vec![lobby()]).await;
    let app = router(h.handle.clone(), h.playlist.clone());

    let (status, _, body) = call(app.clone(), "POST", "/api/channels/1/start").await;
    assert_eq!(status, StatusCode::OK);
    let started: ChannelStatus = serde_json::from_slice(&body).unwrap();
    assert_eq!(started.state, LiveState::Starting);

    h.wait_for(1, Duration::from_secs(3), |s| s.is_live()).await;

    let (status, _, body) = call(app.clone(), "GET", "/api/live").await;
    assert_eq!(status, StatusCode::OK);
    let live: Vec<PlaylistEntry> = serde_json::from_slice(&body).unwrap();
    assert_eq!(live.len(), 1);
    assert_eq!(live[0].name, "Lobby");

    let deadline = std::time::Instant::now() + Duration::from_secs(3);
    while h.playlist.get().await.entries.is_empty() {
        assert!(std::time::Instant::now() < deadline, "playlist never published");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let (status, headers, body) = call(app.clone(), "GET", "/playlist.m3u").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(headers[header::CONTENT_TYPE], "audio/x-mpegurl");
    let text = String::from_utf8(body).unwrap();
    assert!(text.starts_with("#EXTM3U"));
    assert!(text.contains("http://test.local/hls/lobby-1.m3u8"));

    let (status, _, body) = call(app, "POST", "/api/channels/1/stop").await;
    assert_eq!(status, StatusCode::OK);
    let stopped: ChannelStatus = serde_json::from_slice(&body).unwrap();
    assert_eq!(stopped.state, LiveState::Stopped);

    h.shutdown().await;
}

#[tokio::test]
async fn errors_map_to_status_codes() {
    let empty = Channel::new(2, "Empty", ContentType::Image);
    let h = Harness::start(vec![lobby(), empty]).await;
    let app = router(h.handle.clone(), h.playlist.clone());

    let (status, _, body) = call(app.clone(), "POST", "/api/channels/99/start").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let err: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(err["retryable"], false);

    let (status, _, _) = call(app.clone(), "POST", "/api/channels/2/start").await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);

    h.catalog.set_available(false);
    let (status, headers, body) = call(app.clone(), "POST", "/api/channels/1/start").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(headers[header::RETRY_AFTER], "5");
    let err: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(err["retryable"], true);
    h.catalog.set_available(true);

    assert!(h.launcher.launches().is_empty());
    h.shutdown().await;
}
