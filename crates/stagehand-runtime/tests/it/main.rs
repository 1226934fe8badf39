use std::sync::Arc;

use stagehand_runtime::store::{MemoryStore, Store};
use stagehand_runtime::{Config, Worker, WorkerBuilder};

mod endpoints;
mod jobs;
mod startup;
mod threads;

/// A config suitable for tests: ephemeral probe port, short shutdown grace.
pub fn test_config(cluster: &str, name: &str) -> Config {
    Config::new()
        .cluster(cluster)
        .worker_name(name)
        .health_port(0)
        .shutdown_grace(std::time::Duration::from_secs(2))
        // Keep host health out of the picture: these tests exercise task
        // coordination, not load shedding.
        .cpu_threshold(10_000.0)
        .mem_threshold(100.0)
}

pub async fn build_worker(
    store: &Arc<MemoryStore>,
    cluster: &str,
    name: &str,
) -> anyhow::Result<Worker> {
    WorkerBuilder::new(test_config(cluster, name))
        .store(store.clone() as Arc<dyn Store>)
        .build()
        .await
}

/// Write a thread task record directly, the way an operator would seed one
/// out-of-band.
pub async fn seed_thread(
    store: &MemoryStore,
    key: &str,
    source: &str,
    hang_nanos: u64,
) -> anyhow::Result<()> {
    let hang = hang_nanos.to_string();
    let fields: Vec<(&str, &str)> = vec![
        ("Source", source),
        ("Status", "enabled"),
        ("State", "stopped"),
        ("Heartbeat", "0"),
        ("Hang", &hang),
        ("DeadSeconds", "2"),
        ("Owner", ""),
        ("Error", ""),
        ("ErrorTime", ""),
    ];
    for (field, value) in fields {
        store.hset(key, field, value).await?;
    }
    Ok(())
}

pub async fn field(store: &MemoryStore, key: &str, field: &str) -> String {
    store
        .hget(key, field)
        .await
        .expect("store read failed")
        .unwrap_or_default()
}

/// Poll until `predicate` holds or the timeout elapses.
pub async fn wait_for<F, Fut>(timeout: std::time::Duration, mut predicate: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if predicate().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }
}

#[ctor::ctor]
fn setup_tracing() {
    use tracing_subscriber::prelude::*;

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .init();
}
