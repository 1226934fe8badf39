use std::sync::Arc;
use std::time::Duration;

use stagehand_runtime::store::{MemoryStore, Store};

use crate::{build_worker, field, seed_thread, wait_for};

const MILLISECOND: u64 = 1_000_000;

#[tokio::test(flavor = "multi_thread")]
async fn stopped_threads_are_taken() -> anyhow::Result<()> {
    let store = Arc::new(MemoryStore::new());
    let mut worker = build_worker(&store, "c", "w1").await?;
    seed_thread(&store, "c:Threads:t1", "fn main() { }", MILLISECOND).await?;

    worker.check_threads().await?;

    assert_eq!(field(&store, "c:Threads:t1", "Owner").await, "w1");
    assert_eq!(field(&store, "c:Threads:t1", "State").await, "running");
    assert_ne!(field(&store, "c:Threads:t1", "Heartbeat").await, "0");
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn stale_threads_are_taken_over() -> anyhow::Result<()> {
    let store = Arc::new(MemoryStore::new());
    let mut worker = build_worker(&store, "c", "w2").await?;

    let stale = chrono::Utc::now().timestamp_nanos_opt().unwrap() - 10_000_000_000;
    seed_thread(&store, "c:Threads:t1", "fn main() { }", MILLISECOND).await?;
    store.hset("c:Threads:t1", "State", "running").await?;
    store.hset("c:Threads:t1", "Owner", "X").await?;
    store
        .hset("c:Threads:t1", "Heartbeat", &stale.to_string())
        .await?;
    store.hset("c:Threads:t1", "DeadSeconds", "1").await?;

    worker.check_threads().await?;

    assert_eq!(field(&store, "c:Threads:t1", "Owner").await, "w2");
    assert_eq!(field(&store, "c:Threads:t1", "State").await, "running");
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn fresh_heartbeats_are_left_alone() -> anyhow::Result<()> {
    let store = Arc::new(MemoryStore::new());
    let mut worker = build_worker(&store, "c", "w2").await?;

    let fresh = chrono::Utc::now().timestamp_nanos_opt().unwrap();
    seed_thread(&store, "c:Threads:t1", "fn main() { }", MILLISECOND).await?;
    store.hset("c:Threads:t1", "State", "running").await?;
    store.hset("c:Threads:t1", "Owner", "X").await?;
    store
        .hset("c:Threads:t1", "Heartbeat", &fresh.to_string())
        .await?;
    store.hset("c:Threads:t1", "DeadSeconds", "5").await?;

    worker.check_threads().await?;

    assert_eq!(field(&store, "c:Threads:t1", "Owner").await, "X");
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn disabled_threads_never_run() -> anyhow::Result<()> {
    let store = Arc::new(MemoryStore::new());
    let mut worker = build_worker(&store, "c", "w1").await?;

    seed_thread(&store, "c:Threads:t1", "fn main() { }", MILLISECOND).await?;
    store.hset("c:Threads:t1", "Status", "disabled").await?;

    for _ in 0..5 {
        worker.check_threads().await?;
    }

    assert_eq!(field(&store, "c:Threads:t1", "State").await, "stopped");
    assert_eq!(field(&store, "c:Threads:t1", "Owner").await, "");
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn load_errors_crash_and_disable() -> anyhow::Result<()> {
    let store = Arc::new(MemoryStore::new());
    let mut worker = build_worker(&store, "c", "w1").await?;

    seed_thread(&store, "c:Threads:bad", "this is ] not a script", MILLISECOND).await?;
    worker.check_threads().await?;

    let crashed = wait_for(Duration::from_secs(2), || async {
        field(&store, "c:Threads:bad", "State").await == "crashed"
    })
    .await;
    assert!(crashed, "thread never reached the crashed state");
    assert_eq!(field(&store, "c:Threads:bad", "Status").await, "disabled");
    assert!(!field(&store, "c:Threads:bad", "Error").await.is_empty());
    assert!(!field(&store, "c:Threads:bad", "ErrorTime").await.is_empty());
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn failing_main_crashes_and_disables() -> anyhow::Result<()> {
    let store = Arc::new(MemoryStore::new());
    let mut worker = build_worker(&store, "c", "w1").await?;

    seed_thread(
        &store,
        "c:Threads:t1",
        "fn main() { missing_function() }",
        MILLISECOND,
    )
    .await?;
    worker.check_threads().await?;

    let crashed = wait_for(Duration::from_secs(2), || async {
        field(&store, "c:Threads:t1", "State").await == "crashed"
    })
    .await;
    assert!(crashed, "thread never reached the crashed state");
    assert_eq!(field(&store, "c:Threads:t1", "Status").await, "disabled");
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn owner_change_releases_silently() -> anyhow::Result<()> {
    let store = Arc::new(MemoryStore::new());
    let mut worker = build_worker(&store, "c", "w1").await?;

    seed_thread(&store, "c:Threads:t1", "fn main() { }", MILLISECOND).await?;
    worker.check_threads().await?;
    assert_eq!(worker.thread_is_stopped("c:Threads:t1"), Some(false));

    // Another worker wins the takeover race.
    store.hset("c:Threads:t1", "Owner", "w2").await?;

    let released = wait_for(Duration::from_secs(2), || async {
        worker.thread_is_stopped("c:Threads:t1") == Some(true)
    })
    .await;
    assert!(released, "thread never observed the ownership change");

    // The release is silent: the state write is left to the new owner, and
    // this worker stops heartbeating.
    assert_eq!(field(&store, "c:Threads:t1", "State").await, "running");
    tokio::time::sleep(Duration::from_millis(50)).await;
    let heartbeat = field(&store, "c:Threads:t1", "Heartbeat").await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(field(&store, "c:Threads:t1", "Heartbeat").await, heartbeat);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn disable_stops_the_runner() -> anyhow::Result<()> {
    let store = Arc::new(MemoryStore::new());
    let mut worker = build_worker(&store, "c", "w1").await?;

    seed_thread(&store, "c:Threads:t1", "fn main() { }", MILLISECOND).await?;
    worker.check_threads().await?;

    store.hset("c:Threads:t1", "Status", "disabled").await?;

    let stopped = wait_for(Duration::from_secs(2), || async {
        field(&store, "c:Threads:t1", "State").await == "stopped"
    })
    .await;
    assert!(stopped, "thread never stopped after being disabled");
    assert_eq!(worker.thread_is_stopped("c:Threads:t1"), Some(true));

    // Disabled is terminal: further checks must not restart it.
    worker.check_threads().await?;
    assert_eq!(field(&store, "c:Threads:t1", "State").await, "stopped");
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn shutdown_stops_threads_then_goes_offline() -> anyhow::Result<()> {
    let store = Arc::new(MemoryStore::new());
    let mut worker = build_worker(&store, "c", "w1").await?;
    seed_thread(&store, "c:Threads:t1", "fn main() { }", MILLISECOND).await?;
    seed_thread(&store, "c:Threads:t2", "fn main() { }", MILLISECOND).await?;

    let handle = worker.handle();
    let running = tokio::spawn(async move { worker.run().await });

    // Let the control loop claim both threads.
    let claimed = wait_for(Duration::from_secs(5), || async {
        field(&store, "c:Threads:t1", "Owner").await == "w1"
            && field(&store, "c:Threads:t2", "Owner").await == "w1"
    })
    .await;
    assert!(claimed, "worker never claimed its threads");

    handle.shutdown();
    tokio::time::timeout(Duration::from_secs(10), running).await???;

    assert_eq!(field(&store, "c:Threads:t1", "State").await, "stopped");
    assert_eq!(field(&store, "c:Threads:t2", "State").await, "stopped");
    assert_eq!(field(&store, "c:workers:w1", "State").await, "offline");
    Ok(())
}
