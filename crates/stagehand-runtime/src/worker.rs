//! The per-worker coordinator.
//!
//! One [`Worker`] joins a cluster, discovers task records by prefix scan,
//! claims threads whose owners have stopped heartbeating, reconciles job
//! schedules, publishes its own liveness, and winds everything down cleanly
//! on shutdown. The shared store is the only cross-worker channel; inside the
//! process the coordinator alone mutates the handle maps, while runners touch
//! only their own control blocks.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use futures_concurrency::future::Join;
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tracing::Instrument;

use crate::config::Config;
use crate::flag::{ShutdownFlag, ShutdownGuard};
use crate::job::{self, JobHandle};
use crate::record::{
    Status, TaskRecord, TaskState, WorkerRecord, WorkerState, FIELD_DEAD_SECONDS, FIELD_ERROR,
    FIELD_ERROR_TIME, FIELD_HANG, FIELD_HEARTBEAT, FIELD_OWNER, FIELD_SOURCE, FIELD_STATE,
    FIELD_STATUS,
};
use crate::script::{self, Capability};
use crate::store::{Keys, RedisStore, Store};
use crate::thread::{self, ThreadControl};
use crate::{endpoint, health, util};

pub(crate) struct SharedState {
    pub shutdown: ShutdownFlag,
    pub store: Arc<dyn Store>,
    pub client: reqwest::Client,
    pub config: Config,
    pub keys: Keys,
    pub healthy: AtomicBool,
    pub capabilities: Vec<Box<dyn Capability>>,
}

impl SharedState {
    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Acquire)
    }

    pub fn worker_record(&self) -> WorkerRecord {
        WorkerRecord::new(
            self.store.clone(),
            self.keys.worker(&self.config.worker_name),
        )
    }
}

pub struct WorkerBuilder {
    config: Config,
    store: Option<Arc<dyn Store>>,
    client: Option<reqwest::Client>,
    capabilities: Vec<Box<dyn Capability>>,
}

impl WorkerBuilder {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            store: None,
            client: None,
            capabilities: script::default_capabilities(),
        }
    }

    /// Use an existing store instead of connecting to the configured redis
    /// address. Tests and embedders inject a [`MemoryStore`] here.
    ///
    /// [`MemoryStore`]: crate::store::MemoryStore
    pub fn store(mut self, store: Arc<dyn Store>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn client(mut self, client: reqwest::Client) -> Self {
        self.client = Some(client);
        self
    }

    /// Append a capability to the bundle installed into every interpreter.
    pub fn capability(mut self, capability: Box<dyn Capability>) -> Self {
        self.capabilities.push(capability);
        self
    }

    pub async fn build(self) -> anyhow::Result<Worker> {
        let mut config = self.config;
        if config.worker_name.is_empty() {
            config.worker_name = util::random_name(10);
        }

        let store = match self.store {
            Some(store) => store,
            None => {
                if config.redis_address.is_empty() {
                    anyhow::bail!("no redis address provided");
                }

                let connect = RedisStore::connect(&config.redis_address, &config.redis_password);
                let store = tokio::time::timeout(Duration::from_secs(5), connect)
                    .await
                    .map_err(|_| anyhow::anyhow!("timed out connecting to the store"))
                    .and_then(|result| result)
                    .context("redis failed ping")?;
                Arc::new(store) as Arc<dyn Store>
            }
        };
        store.ping().await.context("redis failed ping")?;

        let keys = Keys::new(config.cluster.clone());
        let shared = Arc::new(SharedState {
            shutdown: ShutdownFlag::new(),
            store,
            client: self.client.unwrap_or_default(),
            config,
            keys,
            healthy: AtomicBool::new(true),
            capabilities: self.capabilities,
        });

        let record = shared.worker_record();
        record.set_state(WorkerState::Online).await?;
        record.set_status(Status::Enabled).await?;

        if !shared.config.scripts.is_empty() {
            seed_scripts(&shared).await?;
        }

        Ok(Worker {
            shared,
            threads: HashMap::new(),
            jobs: HashMap::new(),
            runners: JoinSet::new(),
        })
    }
}

#[derive(Clone)]
pub struct WorkerHandle {
    shared: Arc<SharedState>,
}

impl WorkerHandle {
    pub fn shutdown(&self) {
        self.shared.shutdown.raise();
    }
}

pub struct Worker {
    shared: Arc<SharedState>,
    threads: HashMap<String, Arc<ThreadControl>>,
    jobs: HashMap<String, JobHandle>,
    runners: JoinSet<()>,
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker").finish_non_exhaustive()
    }
}

impl Worker {
    pub fn handle(&self) -> WorkerHandle {
        WorkerHandle {
            shared: self.shared.clone(),
        }
    }

    /// The resolved worker name (generated when none was configured).
    pub fn worker_name(&self) -> &str {
        &self.shared.config.worker_name
    }

    /// In-memory stop flag of an observed thread. `None` when the task has
    /// not been observed by this worker yet.
    pub fn thread_is_stopped(&self, key: &str) -> Option<bool> {
        self.threads.get(key).map(|ctl| ctl.is_stopped())
    }

    /// The endpoint host routes, for embedding or testing without binding a
    /// listener.
    pub fn endpoint_router(&self) -> axum::Router {
        endpoint::router(self.shared.clone())
    }

    /// The health probe routes.
    pub fn health_router(&self) -> axum::Router {
        health::probe_router(self.shared.clone())
    }

    /// Run the worker until shutdown.
    pub async fn run(&mut self) -> anyhow::Result<()> {
        let shared = self.shared.clone();
        let mut servers: JoinSet<std::io::Result<()>> = JoinSet::new();

        {
            let listener = TcpListener::bind(("0.0.0.0", shared.config.health_port))
                .await
                .with_context(|| {
                    format!("failed to bind health port {}", shared.config.health_port)
                })?;
            tracing::info!("health probe listening on {}", listener.local_addr()?);

            let app = health::probe_router(shared.clone());
            let flag = shared.shutdown.clone();
            servers.spawn(async move {
                axum::serve(listener, app)
                    .with_graceful_shutdown(async move { flag.wait().await })
                    .await
            });
        }

        if shared.config.host {
            let listener = TcpListener::bind(("0.0.0.0", shared.config.host_port))
                .await
                .with_context(|| {
                    format!("failed to bind host port {}", shared.config.host_port)
                })?;
            tracing::info!("endpoint host listening on {}", listener.local_addr()?);

            let app = endpoint::router(shared.clone());
            let flag = shared.shutdown.clone();
            servers.spawn(async move {
                axum::serve(listener, app)
                    .with_graceful_shutdown(async move { flag.wait().await })
                    .await
            });
        }

        // The control loop and the health monitor run in this task so a
        // failure of either takes the whole worker down via the guard.
        let name = shared.config.worker_name.clone();
        let control = self.control_loop();
        let monitor = health::monitor(shared.clone());
        let (control, monitor) = (control, monitor)
            .join()
            .instrument(tracing::info_span!("worker", name = %name))
            .await;

        self.stop_all().await;

        // Only after every runner has stopped heartbeating may the worker go
        // offline, otherwise a peer could re-take tasks this process is still
        // touching.
        let offline = shared
            .worker_record()
            .set_state(WorkerState::Offline)
            .await
            .context("failed to write offline state");
        tracing::info!("worker is offline");

        let drain = async {
            while let Some(result) = servers.join_next().await {
                match result {
                    Ok(Err(e)) => tracing::warn!("http server error: {e}"),
                    Err(e) if !e.is_cancelled() => tracing::warn!("http server failed: {e}"),
                    _ => {}
                }
            }
        };
        if tokio::time::timeout(shared.config.shutdown_grace, drain)
            .await
            .is_err()
        {
            servers.abort_all();
        }

        control?;
        monitor?;
        offline?;
        Ok(())
    }

    async fn control_loop(&mut self) -> anyhow::Result<()> {
        let shutdown = self.shared.shutdown.clone();
        let _guard = ShutdownGuard::new(&shutdown);
        let record = self.shared.worker_record();

        loop {
            if shutdown.is_raised() {
                break;
            }
            if !self.is_enabled().await {
                tracing::info!("worker has been disabled, shutting down");
                shutdown.raise();
                break;
            }

            if self.shared.is_healthy() {
                if let Err(e) = self.check_threads().await {
                    tracing::warn!("thread check failed: {e:#}");
                }
                if let Err(e) = self.check_jobs().await {
                    tracing::warn!("job check failed: {e:#}");
                }
            }

            if let Err(e) = record.set_heartbeat(util::now_nanos()).await {
                tracing::warn!("failed to write worker heartbeat: {e:#}");
            }

            tokio::select! {
                biased;

                _ = shutdown.wait() => break,
                _ = tokio::time::sleep(Duration::from_secs(1)) => {}
            }
        }

        Ok(())
    }

    async fn is_enabled(&self) -> bool {
        if self.shared.shutdown.is_raised() {
            return false;
        }
        match self.shared.worker_record().status().await {
            Ok(status) => status != Status::Disabled,
            Err(e) => {
                tracing::warn!("failed to read worker status: {e:#}");
                true
            }
        }
    }

    /// One discovery pass over the cluster's thread records: take everything
    /// that is enabled and stopped, plus everything whose owner has stopped
    /// heartbeating.
    pub async fn check_threads(&mut self) -> anyhow::Result<()> {
        while self.runners.try_join_next().is_some() {}

        let found = self
            .shared
            .store
            .keys(&self.shared.keys.threads_pattern())
            .await?;
        for key in found {
            self.threads
                .entry(key.clone())
                .or_insert_with(|| ThreadControl::new(key));
        }

        let handles: Vec<Arc<ThreadControl>> = self.threads.values().cloned().collect();
        for ctl in handles {
            let record = TaskRecord::new(self.shared.store.clone(), ctl.key().to_owned());

            let status = match record.status().await {
                Ok(status) => status,
                Err(e) => {
                    tracing::warn!(key = %ctl.key(), "failed to read thread status: {e:#}");
                    continue;
                }
            };
            if status == Status::Disabled {
                continue;
            }

            let state = match record.state().await {
                Ok(state) => state,
                Err(e) => {
                    tracing::warn!(key = %ctl.key(), "failed to read thread state: {e:#}");
                    continue;
                }
            };
            if state == Some(TaskState::Stopped) {
                self.take_thread(&ctl).await;
                continue;
            }

            // The thread claims to be running; see whether its owner hung or
            // fell over before the state was updated.
            let heartbeat = match record.heartbeat().await {
                Ok(heartbeat) => heartbeat,
                Err(e) => {
                    tracing::warn!(key = %ctl.key(), "error checking thread heartbeat: {e:#}");
                    continue;
                }
            };
            let dead_seconds = match record.dead_seconds().await {
                Ok(0) => self.shared.config.seconds_till_dead,
                Ok(dead_seconds) => dead_seconds,
                Err(e) => {
                    tracing::warn!(key = %ctl.key(), "error getting dead seconds: {e:#}");
                    continue;
                }
            };

            let elapsed = (util::now_nanos() - heartbeat).max(0) as u64 / 1_000_000_000;
            if heartbeat != 0 && elapsed > dead_seconds {
                self.take_thread(&ctl).await;
            }
        }

        Ok(())
    }

    async fn take_thread(&mut self, ctl: &Arc<ThreadControl>) {
        tracing::info!(key = %ctl.key(), "taking thread");

        let record = TaskRecord::new(self.shared.store.clone(), ctl.key().to_owned());
        let claim = async {
            record.set_state(TaskState::Running).await?;
            record.set_heartbeat(util::now_nanos()).await?;
            record.set_owner(&self.shared.config.worker_name).await
        };
        if let Err(e) = claim.await {
            tracing::warn!(key = %ctl.key(), "failed to claim thread: {e:#}");
            return;
        }

        ctl.reset();
        let span = tracing::info_span!("thread", key = %ctl.key());
        self.runners
            .spawn(thread::run(self.shared.clone(), ctl.clone()).instrument(span));
    }

    /// One discovery pass over the cluster's job records: reconcile the local
    /// cron schedule of every enabled, stopped job.
    pub async fn check_jobs(&mut self) -> anyhow::Result<()> {
        let found = self
            .shared
            .store
            .keys(&self.shared.keys.jobs_pattern())
            .await?;
        for key in found {
            self.jobs
                .entry(key.clone())
                .or_insert_with(|| JobHandle::new(key));
        }

        let keys: Vec<String> = self.jobs.keys().cloned().collect();
        for key in keys {
            let record = TaskRecord::new(self.shared.store.clone(), key.clone());

            let status = match record.status().await {
                Ok(status) => status,
                Err(e) => {
                    tracing::warn!(key = %key, "failed to read job status: {e:#}");
                    continue;
                }
            };
            if status == Status::Disabled {
                continue;
            }

            let state = match record.state().await {
                Ok(state) => state,
                Err(e) => {
                    tracing::warn!(key = %key, "failed to read job state: {e:#}");
                    continue;
                }
            };
            if state == Some(TaskState::Stopped) {
                let shared = self.shared.clone();
                if let Some(handle) = self.jobs.get_mut(&key) {
                    job::schedule(&shared, handle).await;
                }
            }
        }

        Ok(())
    }

    /// Stop every thread runner and job cron, then wait for the runners to
    /// drain.
    async fn stop_all(&mut self) {
        for ctl in self.threads.values() {
            ctl.stop(&self.shared).await;
        }
        for handle in self.jobs.values_mut() {
            handle.stop_local();
        }

        let grace = self.shared.config.shutdown_grace;
        let drain = async {
            while self.runners.join_next().await.is_some() {}
        };
        if tokio::time::timeout(grace, drain).await.is_err() {
            tracing::warn!("runners did not stop within {grace:?}, aborting them");
            self.runners.abort_all();
            while self.runners.join_next().await.is_some() {}
        }
    }
}

/// Seed a thread task from each file in the comma-separated list. An
/// unreadable file fails startup.
async fn seed_scripts(shared: &Arc<SharedState>) -> anyhow::Result<()> {
    for path in shared.config.scripts.split(',') {
        tracing::info!("seeding thread script {path}");
        let source = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("failed to read seed script {path}"))?;

        let key = shared.keys.thread(path);
        let store = &shared.store;
        store.hset(&key, FIELD_SOURCE, &source).await?;
        store
            .hset(&key, FIELD_STATUS, Status::Enabled.as_str())
            .await?;
        store
            .hset(&key, FIELD_STATE, TaskState::Stopped.as_str())
            .await?;
        store.hset(&key, FIELD_HEARTBEAT, "0").await?;
        store.hset(&key, FIELD_HANG, "1").await?;
        store.hset(&key, FIELD_DEAD_SECONDS, "2").await?;
        store.hset(&key, FIELD_OWNER, "").await?;
        store.hset(&key, FIELD_ERROR, "").await?;
        store.hset(&key, FIELD_ERROR_TIME, "").await?;
    }

    Ok(())
}
