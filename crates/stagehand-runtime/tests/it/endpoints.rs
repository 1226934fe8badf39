use std::sync::Arc;

use axum::body::Body;
use axum::http::Request;
use http_body_util::BodyExt;
use stagehand_runtime::store::{MemoryStore, Store};
use tower::ServiceExt;

use crate::{build_worker, field};

async fn seed_endpoint(store: &MemoryStore, path: &str, source: &str) -> anyhow::Result<()> {
    let key = format!("c:Endpoints:{path}");
    store.hset(&key, "Source", source).await?;
    store.hset(&key, "Status", "enabled").await?;
    Ok(())
}

async fn get(router: axum::Router, uri: &str) -> anyhow::Result<(u16, String)> {
    let response = router
        .oneshot(Request::builder().uri(uri).body(Body::empty())?)
        .await?;
    let status = response.status().as_u16();
    let body = response.into_body().collect().await?.to_bytes();
    Ok((status, String::from_utf8_lossy(&body).into_owned()))
}

#[tokio::test(flavor = "multi_thread")]
async fn templates_interleave_text_and_script_output() -> anyhow::Result<()> {
    let store = Arc::new(MemoryStore::new());
    let worker = build_worker(&store, "c", "w1").await?;
    seed_endpoint(&store, "/t", r#"hello <? response.Write("world") ?>!"#).await?;

    let (status, body) = get(worker.endpoint_router(), "/t").await?;
    assert_eq!(status, 200);
    assert_eq!(body, "hello world!");
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn response_error_short_circuits() -> anyhow::Result<()> {
    let store = Arc::new(MemoryStore::new());
    let worker = build_worker(&store, "c", "w1").await?;
    seed_endpoint(
        &store,
        "/t",
        r#"<? response.Error("bad", 400) ?>never <? response.Write("reached") ?>"#,
    )
    .await?;

    let (status, body) = get(worker.endpoint_router(), "/t").await?;
    assert_eq!(status, 400);
    assert_eq!(body, "bad\n");
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn unknown_endpoints_are_not_found() -> anyhow::Result<()> {
    let store = Arc::new(MemoryStore::new());
    let worker = build_worker(&store, "c", "w1").await?;

    let (status, _) = get(worker.endpoint_router(), "/nope").await?;
    assert_eq!(status, 404);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn disabled_endpoints_are_unavailable() -> anyhow::Result<()> {
    let store = Arc::new(MemoryStore::new());
    let worker = build_worker(&store, "c", "w1").await?;
    seed_endpoint(&store, "/t", "hello").await?;
    store.hset("c:Endpoints:/t", "Status", "disabled").await?;

    let (status, _) = get(worker.endpoint_router(), "/t").await?;
    assert_eq!(status, 503);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn scope_persists_across_blocks() -> anyhow::Result<()> {
    let store = Arc::new(MemoryStore::new());
    let worker = build_worker(&store, "c", "w1").await?;
    seed_endpoint(
        &store,
        "/t",
        r#"<? let x = 21; ?>x=<? response.Write(x * 2) ?>"#,
    )
    .await?;

    let (status, body) = get(worker.endpoint_router(), "/t").await?;
    assert_eq!(status, 200);
    assert_eq!(body, "x=42");
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn unterminated_blocks_are_plain_text() -> anyhow::Result<()> {
    let store = Arc::new(MemoryStore::new());
    let worker = build_worker(&store, "c", "w1").await?;
    seed_endpoint(&store, "/t", "before <? response.Write(1)").await?;

    let (status, body) = get(worker.endpoint_router(), "/t").await?;
    assert_eq!(status, 200);
    assert_eq!(body, "before  response.Write(1)");
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn request_bindings_expose_the_request() -> anyhow::Result<()> {
    let store = Arc::new(MemoryStore::new());
    let worker = build_worker(&store, "c", "w1").await?;
    seed_endpoint(
        &store,
        "/t",
        r#"<? response.Write(request.Method); response.Write(" "); response.Write(request.Query["name"]); response.Write(" "); response.Write(request.GetHeader("x-test")) ?>"#,
    )
    .await?;

    let response = worker
        .endpoint_router()
        .oneshot(
            Request::builder()
                .uri("/t?name=ada")
                .header("x-test", "yes")
                .body(Body::empty())?,
        )
        .await?;
    assert_eq!(response.status(), 200);
    let body = response.into_body().collect().await?.to_bytes();
    assert_eq!(&body[..], b"GET ada yes");
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn script_errors_return_500_and_are_recorded() -> anyhow::Result<()> {
    let store = Arc::new(MemoryStore::new());
    let worker = build_worker(&store, "c", "w1").await?;
    seed_endpoint(&store, "/t", "a<? missing_function() ?>b").await?;

    let (status, _) = get(worker.endpoint_router(), "/t").await?;
    assert_eq!(status, 500);
    assert!(!field(&store, "c:Endpoints:/t", "Error").await.is_empty());
    assert!(!field(&store, "c:Endpoints:/t", "ErrorTime").await.is_empty());
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn response_headers_and_content_type_are_applied() -> anyhow::Result<()> {
    let store = Arc::new(MemoryStore::new());
    let worker = build_worker(&store, "c", "w1").await?;
    seed_endpoint(
        &store,
        "/t",
        r#"<? response.SetContentType("application/json"); response.SetHeader("x-served-by", worker.Name); response.Write("{}") ?>"#,
    )
    .await?;

    let response = worker
        .endpoint_router()
        .oneshot(Request::builder().uri("/t").body(Body::empty())?)
        .await?;
    assert_eq!(response.status(), 200);
    assert_eq!(
        response.headers().get("content-type").unwrap(),
        "application/json"
    );
    assert_eq!(response.headers().get("x-served-by").unwrap(), "w1");
    Ok(())
}
