mod support;

use std::time::Duration;

use axum::http::{HeaderValue, StatusCode, header};
use marquee_core::CacheKey;
use serde_json::{Value, json};
use support::{BASE, payload, spawn_app};

async fn wait_for_downloads(app: &support::TestApp) {
    for _ in 0..200 {
        if app.state.router.fetcher().stats().downloads_in_flight == 0 {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn health_reports_generation_and_registry_size() {
    let app = spawn_app().await;

    let response = app.server.get("/_marquee/health").await;
    response.assert_status_ok();
    let body: Value = response.json();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["generation"], "v1");
    assert_eq!(body["required_files"], 0);
}

#[tokio::test]
async fn registered_files_are_prefetched_and_served_with_ranges() {
    let app = spawn_app().await;
    let video = payload(4000);
    app.origin.serve("media/5.mp4", "video/mp4", video.clone());

    let response = app
        .server
        .put("/_marquee/sync/required")
        .json(&json!({
            "files": [{
                "key": "media/5",
                "url": format!("{BASE}media/5.mp4"),
                "size_bytes": 4000,
                "file_name": "5.mp4"
            }]
        }))
        .await;
    response.assert_status_ok();
    let report: Value = response.json();
    assert_eq!(report["registered"], 1);
    assert_eq!(report["downloads_started"], 1);

    wait_for_downloads(&app).await;
    let hits_after_prefetch = app.origin.hits().len();

    let full = app.server.get("/cache/media/5.mp4").await;
    full.assert_status_ok();
    assert_eq!(full.as_bytes().as_ref(), video.as_slice());
    assert_eq!(full.header(header::CONTENT_TYPE), "video/mp4");

    let partial = app
        .server
        .get("/cache/media/5.mp4")
        .add_header(header::RANGE, HeaderValue::from_static("bytes=100-199"))
        .await;
    partial.assert_status(StatusCode::PARTIAL_CONTENT);
    assert_eq!(partial.header(header::CONTENT_RANGE), "bytes 100-199/4000");
    assert_eq!(partial.as_bytes().as_ref(), &video[100..200]);

    let unsatisfiable = app
        .server
        .get("/cache/media/5.mp4")
        .add_header(header::RANGE, HeaderValue::from_static("bytes=5000-"))
        .await;
    unsatisfiable.assert_status(StatusCode::RANGE_NOT_SATISFIABLE);
    assert_eq!(unsatisfiable.header(header::CONTENT_RANGE), "bytes */4000");

    assert_eq!(app.origin.hits().len(), hits_after_prefetch);
}

#[tokio::test]
async fn pushed_blob_is_served_from_the_cache_namespace() {
    let app = spawn_app().await;

    let response = app
        .server
        .put("/_marquee/sync/blobs/layout/12")
        .add_header(header::CONTENT_TYPE, HeaderValue::from_static("text/xml"))
        .bytes("<layout id=\"12\"/>".into())
        .await;
    response.assert_status_ok();
    let summary: Value = response.json();
    assert_eq!(summary["key"], "layout/12");
    assert_eq!(summary["size_bytes"], 17);

    let served = app.server.get("/cache/layout/12.xlf").await;
    served.assert_status_ok();
    assert_eq!(served.text(), "<layout id=\"12\"/>");
    assert!(app.origin.hits().is_empty());
}

#[tokio::test]
async fn unknown_blob_kind_is_rejected() {
    let app = spawn_app().await;

    let response = app
        .server
        .put("/_marquee/sync/blobs/poster/1")
        .bytes("x".into())
        .await;
    response.assert_status(StatusCode::BAD_REQUEST);
    let body: Value = response.json();
    assert_eq!(body["error"]["status"], 400);
}

#[tokio::test]
async fn widget_markup_falls_back_to_a_placeholder() {
    let app = spawn_app().await;

    let response = app.server.get("/_marquee/widgets/404").await;
    response.assert_status_ok();
    assert_eq!(response.header("x-marquee-markup"), "placeholder");
    assert!(!response.text().trim().is_empty());
    assert_eq!(app.origin.hits().len(), 3);
}

#[tokio::test]
async fn widget_markup_is_fresh_then_stale() {
    let app = spawn_app().await;
    app.origin
        .serve("widgets/8", "text/html", "<div>weather</div>");

    let fresh = app.server.get("/_marquee/widgets/8").await;
    fresh.assert_status_ok();
    assert_eq!(fresh.header("x-marquee-markup"), "fresh");
    assert_eq!(fresh.text(), "<div>weather</div>");

    app.origin.serve("widgets/8", "text/html", "");
    let stale = app.server.get("/_marquee/widgets/8").await;
    assert_eq!(stale.header("x-marquee-markup"), "stale");
    assert_eq!(stale.text(), "<div>weather</div>");
}

#[tokio::test]
async fn unknown_media_is_accepted_with_retry_after() {
    let app = spawn_app().await;

    let response = app.server.get("/cache/media/77.mp4").await;
    response.assert_status(StatusCode::ACCEPTED);
    assert_eq!(response.header(header::RETRY_AFTER), "2");
}

#[tokio::test]
async fn unknown_layout_is_not_found() {
    let app = spawn_app().await;

    let response = app.server.get("/cache/layout/404.xlf").await;
    response.assert_status(StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn passthrough_requests_are_relayed_and_cached() {
    let app = spawn_app().await;
    app.origin
        .serve("fonts/display.woff2?v=3", "font/woff2", payload(64));

    let first = app.server.get("/fonts/display.woff2?v=3").await;
    first.assert_status_ok();
    assert_eq!(first.as_bytes().len(), 64);

    let second = app.server.get("/fonts/display.woff2?v=3").await;
    second.assert_status_ok();
    assert_eq!(app.origin.hits().len(), 1);
}

#[tokio::test]
async fn rollover_switches_generation_and_rejects_bad_names() {
    let app = spawn_app().await;
    app.state
        .cache
        .store()
        .await
        .put_complete(&CacheKey::layout("1"), "text/xml", b"<layout/>")
        .await
        .unwrap();

    let response = app
        .server
        .post("/_marquee/sync/rollover")
        .json(&json!({ "generation": "v2" }))
        .await;
    response.assert_status_ok();
    let body: Value = response.json();
    assert_eq!(body["switched"], true);
    assert_eq!(app.state.cache.generation().await, "v2");

    let gone = app.server.get("/cache/layout/1.xlf").await;
    gone.assert_status(StatusCode::NOT_FOUND);

    let bad = app
        .server
        .post("/_marquee/sync/rollover")
        .json(&json!({ "generation": "../etc" }))
        .await;
    bad.assert_status(StatusCode::BAD_REQUEST);
    let body: Value = bad.json();
    assert!(body["error"]["message"].is_string());
}
