use std::sync::Arc;
use std::time::Duration;

use stagehand_runtime::store::{MemoryStore, Store};
use stagehand_runtime::WorkerBuilder;

use crate::{build_worker, field, test_config};

#[tokio::test(flavor = "multi_thread")]
async fn missing_store_address_fails_startup() {
    let error = WorkerBuilder::new(test_config("c", "w"))
        .build()
        .await
        .expect_err("startup should fail without a store address");
    assert_eq!(error.to_string(), "no redis address provided");
}

#[tokio::test(flavor = "multi_thread")]
async fn unreachable_store_fails_ping() {
    let config = test_config("c", "w").redis_address("bad");
    let error = WorkerBuilder::new(config)
        .build()
        .await
        .expect_err("startup should fail against an unreachable store");
    assert_eq!(error.to_string(), "redis failed ping");
}

#[tokio::test(flavor = "multi_thread")]
async fn startup_registers_the_worker() -> anyhow::Result<()> {
    let store = Arc::new(MemoryStore::new());
    let worker = build_worker(&store, "c", "w1").await?;

    assert_eq!(worker.worker_name(), "w1");
    assert_eq!(field(&store, "c:workers:w1", "State").await, "online");
    assert_eq!(field(&store, "c:workers:w1", "Status").await, "enabled");
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn empty_worker_name_gets_a_random_one() -> anyhow::Result<()> {
    let store = Arc::new(MemoryStore::new());
    let worker = build_worker(&store, "c", "").await?;

    assert_eq!(worker.worker_name().len(), 10);
    assert!(worker
        .worker_name()
        .chars()
        .all(|c| c.is_ascii_alphanumeric()));
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn seeding_is_idempotent() -> anyhow::Result<()> {
    let dir = std::env::temp_dir();
    let path = dir.join(format!("stagehand-seed-{}.rhai", std::process::id()));
    std::fs::write(&path, "fn main() { }")?;
    let path_str = path.to_string_lossy().into_owned();

    let store = Arc::new(MemoryStore::new());
    for name in ["w1", "w2"] {
        let config = test_config("c", name).scripts(path_str.clone());
        WorkerBuilder::new(config)
            .store(store.clone() as Arc<dyn Store>)
            .build()
            .await?;
    }
    std::fs::remove_file(&path).ok();

    let key = format!("c:Threads:{path_str}");
    assert_eq!(field(&store, &key, "Source").await, "fn main() { }");
    assert_eq!(field(&store, &key, "Status").await, "enabled");
    assert_eq!(field(&store, &key, "State").await, "stopped");
    assert_eq!(field(&store, &key, "Heartbeat").await, "0");
    assert_eq!(field(&store, &key, "Hang").await, "1");
    assert_eq!(field(&store, &key, "DeadSeconds").await, "2");
    assert_eq!(field(&store, &key, "Owner").await, "");
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn missing_seed_script_fails_startup() {
    let store = Arc::new(MemoryStore::new());
    let config = test_config("c", "w").scripts("/definitely/not/a/script.rhai");
    let result = WorkerBuilder::new(config)
        .store(store as Arc<dyn Store>)
        .build()
        .await;
    assert!(result.is_err());
}

#[tokio::test(flavor = "multi_thread")]
async fn disabled_worker_shuts_itself_down() -> anyhow::Result<()> {
    let store = Arc::new(MemoryStore::new());
    let mut worker = build_worker(&store, "c", "w1").await?;

    store.hset("c:workers:w1", "Status", "disabled").await?;

    tokio::time::timeout(Duration::from_secs(10), worker.run()).await??;
    assert_eq!(field(&store, "c:workers:w1", "State").await, "offline");
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn health_probe_answers_for_a_reachable_store() -> anyhow::Result<()> {
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    let store = Arc::new(MemoryStore::new());
    let worker = build_worker(&store, "c", "w1").await?;

    let response = worker
        .health_router()
        .oneshot(Request::builder().uri("/anything").body(Body::empty())?)
        .await?;
    assert_eq!(response.status(), 200);

    let body = response.into_body().collect().await?.to_bytes();
    assert_eq!(&body[..], b"{}");
    Ok(())
}
