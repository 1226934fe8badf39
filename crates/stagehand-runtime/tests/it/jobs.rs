use std::sync::Arc;
use std::time::Duration;

use stagehand_runtime::store::{CommandReply, MemoryStore, Store};

use crate::{build_worker, field, wait_for};

async fn seed_job(store: &MemoryStore, key: &str, source: &str, cron: &str) -> anyhow::Result<()> {
    let fields: Vec<(&str, &str)> = vec![
        ("Source", source),
        ("Status", "enabled"),
        ("State", "stopped"),
        ("Heartbeat", "0"),
        ("Cron", cron),
        ("Owner", ""),
        ("Error", ""),
        ("ErrorTime", ""),
    ];
    for (field, value) in fields {
        store.hset(key, field, value).await?;
    }
    Ok(())
}

async fn counter(store: &MemoryStore, key: &str) -> i64 {
    match store
        .command(&["GET".to_owned(), key.to_owned()])
        .await
        .expect("store read failed")
    {
        CommandReply::Text(value) => value.parse().unwrap_or(0),
        CommandReply::Int(value) => value,
        _ => 0,
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn cron_jobs_tick_and_release() -> anyhow::Result<()> {
    let store = Arc::new(MemoryStore::new());
    let mut worker = build_worker(&store, "c", "w1").await?;

    seed_job(
        &store,
        "c:Jobs:counter",
        r#"redis.Do("INCR", "test:hits");"#,
        "*/1 * * * * *",
    )
    .await?;

    worker.check_jobs().await?;
    tokio::time::sleep(Duration::from_millis(3200)).await;

    let hits = counter(&store, "test:hits").await;
    assert!(
        (2..=4).contains(&hits),
        "expected 2 to 4 cron ticks, saw {hits}"
    );

    // Between ticks the job is released for any worker to claim.
    assert_eq!(field(&store, "c:Jobs:counter", "State").await, "stopped");
    assert_eq!(field(&store, "c:Jobs:counter", "Owner").await, "");
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn disabled_jobs_are_not_scheduled() -> anyhow::Result<()> {
    let store = Arc::new(MemoryStore::new());
    let mut worker = build_worker(&store, "c", "w1").await?;

    seed_job(
        &store,
        "c:Jobs:counter",
        r#"redis.Do("INCR", "test:disabled-hits");"#,
        "*/1 * * * * *",
    )
    .await?;
    store.hset("c:Jobs:counter", "Status", "disabled").await?;

    worker.check_jobs().await?;
    tokio::time::sleep(Duration::from_millis(1500)).await;

    assert_eq!(counter(&store, "test:disabled-hits").await, 0);
    assert_eq!(field(&store, "c:Jobs:counter", "State").await, "stopped");
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn malformed_cron_expressions_are_skipped() -> anyhow::Result<()> {
    let store = Arc::new(MemoryStore::new());
    let mut worker = build_worker(&store, "c", "w1").await?;

    seed_job(&store, "c:Jobs:bad", "1 + 1;", "not a schedule").await?;

    // The malformed expression is logged and skipped; the job stays stopped.
    worker.check_jobs().await?;
    tokio::time::sleep(Duration::from_millis(1200)).await;

    assert_eq!(field(&store, "c:Jobs:bad", "State").await, "stopped");
    assert_eq!(field(&store, "c:Jobs:bad", "Owner").await, "");
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn job_crashes_disable_the_job() -> anyhow::Result<()> {
    let store = Arc::new(MemoryStore::new());
    let mut worker = build_worker(&store, "c", "w1").await?;

    seed_job(&store, "c:Jobs:bad", "this is ] not a script", "*/1 * * * * *").await?;
    worker.check_jobs().await?;

    let crashed = wait_for(Duration::from_secs(3), || async {
        field(&store, "c:Jobs:bad", "State").await == "crashed"
    })
    .await;
    assert!(crashed, "job never reached the crashed state");
    assert_eq!(field(&store, "c:Jobs:bad", "Status").await, "disabled");
    // The crash leaves the claim in place; an operator resets it on
    // re-enable.
    assert_eq!(field(&store, "c:Jobs:bad", "Owner").await, "w1");
    assert!(!field(&store, "c:Jobs:bad", "Error").await.is_empty());
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn rescheduling_follows_the_stored_expression() -> anyhow::Result<()> {
    let store = Arc::new(MemoryStore::new());
    let mut worker = build_worker(&store, "c", "w1").await?;

    seed_job(
        &store,
        "c:Jobs:counter",
        r#"redis.Do("INCR", "test:resched-hits");"#,
        "*/1 * * * * *",
    )
    .await?;

    worker.check_jobs().await?;

    // Far-future schedule: the local cron is rebuilt and stops ticking.
    store
        .hset("c:Jobs:counter", "Cron", "0 0 0 1 1 * 2099")
        .await?;
    worker.check_jobs().await?;

    tokio::time::sleep(Duration::from_millis(1500)).await;
    let hits = counter(&store, "test:resched-hits").await;

    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert_eq!(counter(&store, "test:resched-hits").await, hits);
    Ok(())
}
