//! The long-lived thread task runner.
//!
//! A thread task loads its source once, then loops `main()` at its `Hang`
//! cadence, heartbeating every iteration until it observes a disable, an
//! ownership change, worker ill-health, or a stop. A script fault anywhere in
//! load, `init` or `main` crashes the task: the error is recorded and the
//! task is disabled until an operator re-enables it.

use std::sync::Arc;
use std::time::Duration;

use rhai::Engine;
use tokio::runtime::Handle;

use crate::error::is_interrupted;
use crate::flag::ShutdownFlag;
use crate::record::{Status, TaskRecord, TaskState, FIELD_STATE, FIELD_STATUS};
use crate::script::{Interrupt, ScriptHost};
use crate::worker::SharedState;

/// Shared control block for one thread task.
///
/// The coordinator owns the handle map; the runner and the script binding
/// touch only the stop flag and the interrupt.
pub(crate) struct ThreadControl {
    key: String,
    stopped: ShutdownFlag,
    interrupt: Interrupt,
}

impl ThreadControl {
    /// A freshly discovered task is stopped until its first take.
    pub fn new(key: String) -> Arc<Self> {
        let stopped = ShutdownFlag::new();
        stopped.raise();

        Arc::new(Self {
            key,
            stopped,
            interrupt: Interrupt::new(),
        })
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.is_raised()
    }

    pub fn mark_stopped(&self) {
        self.stopped.raise();
    }

    /// Re-arm the control block for a new take.
    pub fn reset(&self) {
        self.stopped.reset();
        self.interrupt.clear();
    }

    pub fn interrupt(&self) -> &Interrupt {
        &self.interrupt
    }

    /// Stop the runner if this worker still owns the task.
    pub async fn stop(&self, shared: &SharedState) {
        let record = self.record(shared);
        let owner = record.owner().await.unwrap_or_default();
        if owner != shared.config.worker_name || self.is_stopped() {
            return;
        }

        tracing::info!(key = %self.key, "stopping thread");
        self.mark_stopped();
        if let Err(e) = record.set_state(TaskState::Stopped).await {
            tracing::warn!(key = %self.key, "failed to write stopped state: {e:#}");
        }
        self.interrupt.raise();
    }

    /// Stop the runner and disable the task persistently.
    pub async fn disable(&self, shared: &SharedState) {
        let record = self.record(shared);
        let owner = record.owner().await.unwrap_or_default();
        if owner != shared.config.worker_name || self.is_stopped() {
            return;
        }

        tracing::info!(key = %self.key, "disabling thread");
        self.mark_stopped();
        if let Err(e) = record.set_state(TaskState::Stopped).await {
            tracing::warn!(key = %self.key, "failed to write stopped state: {e:#}");
        }
        if let Err(e) = record.set_status(Status::Disabled).await {
            tracing::warn!(key = %self.key, "failed to write disabled status: {e:#}");
        }
        self.interrupt.raise();
    }

    fn record(&self, shared: &SharedState) -> TaskRecord {
        TaskRecord::new(shared.store.clone(), self.key.clone())
    }
}

enum Exit {
    Stopped,
    /// Another worker took the task over; release silently and leave the
    /// state writes to the new owner.
    OwnerChanged,
}

/// Run one claimed thread task to completion.
pub(crate) async fn run(shared: Arc<SharedState>, ctl: Arc<ThreadControl>) {
    let key = ctl.key().to_owned();
    let record = TaskRecord::new(shared.store.clone(), key.clone());
    tracing::info!(key = %key, "starting thread");

    let mut host = match ScriptHost::new(&shared, ctl.interrupt().clone()) {
        Ok(host) => host,
        Err(e) => {
            tracing::error!(key = %key, "failed to create script host: {e:#}");
            return;
        }
    };
    install_binding(&mut host, &shared, &ctl);

    let source = match record.source().await {
        Ok(source) => source,
        Err(e) => {
            tracing::error!(key = %key, "failed to read thread source: {e:#}");
            return;
        }
    };
    if source.is_empty() {
        tracing::error!(key = %key, "source empty for thread");
        return;
    }

    if let Err(e) = host.load(source).await {
        if !is_interrupted(&e) {
            crash(&record, &e, "script failed to load").await;
        }
        return;
    }

    let hang = match record.hang().await {
        Ok(nanos) => Duration::from_nanos(nanos),
        Err(e) => {
            tracing::error!(key = %key, "invalid hang interval: {e:#}");
            return;
        }
    };

    if !ctl.is_stopped() {
        if let Err(e) = host.call("init").await {
            if !is_interrupted(&e) {
                crash(&record, &e, "init() failed").await;
            }
            return;
        }
        tokio::time::sleep(hang).await;
    }

    let mut exit = Exit::Stopped;
    while shared.is_healthy() && !ctl.is_stopped() {
        if let Err(e) = record.set_heartbeat(crate::util::now_nanos()).await {
            tracing::warn!(key = %key, "failed to write heartbeat: {e:#}");
            tokio::time::sleep(hang).await;
            continue;
        }

        let status = match record.status().await {
            Ok(status) => status,
            Err(e) => {
                tracing::warn!(key = %key, "failed to read status: {e:#}");
                tokio::time::sleep(hang).await;
                continue;
            }
        };
        if status == Status::Disabled {
            tracing::warn!(key = %key, "thread was disabled, stopping");
            if let Err(e) = record.set_state(TaskState::Stopped).await {
                tracing::warn!(key = %key, "failed to write stopped state: {e:#}");
            }
            ctl.mark_stopped();
            continue;
        }

        let owner = match record.owner().await {
            Ok(owner) => owner,
            Err(e) => {
                tracing::warn!(key = %key, "failed to read owner: {e:#}");
                tokio::time::sleep(hang).await;
                continue;
            }
        };
        if owner != shared.config.worker_name {
            ctl.mark_stopped();
            exit = Exit::OwnerChanged;
            continue;
        }

        if !ctl.is_stopped() {
            if let Err(e) = host.call("main").await {
                if is_interrupted(&e) {
                    break;
                }
                crash(&record, &e, "main() failed").await;
                return;
            }
            tokio::time::sleep(hang).await;
        }
    }

    // The loop is done; give the script a chance to clean up. The interrupt
    // only had to cancel the evaluation in flight, so it is consumed here.
    // Cleanup failures are logged but never change task state.
    ctl.interrupt().clear();
    if let Err(e) = host.call("cleanup").await {
        tracing::warn!(key = %key, "cleanup() failed: {e:#}");
    }

    if !matches!(exit, Exit::OwnerChanged) {
        if let Err(e) = record.set_state(TaskState::Stopped).await {
            tracing::warn!(key = %key, "failed to write stopped state: {e:#}");
        }
    }
}

async fn crash(record: &TaskRecord, error: &anyhow::Error, what: &str) {
    tracing::error!(key = %record.key(), "{what}: {error:#}");
    if let Err(e) = record.record_crash(error).await {
        tracing::error!(key = %record.key(), "failed to record crash: {e:#}");
    }
}

#[derive(Clone)]
struct ThreadApi {
    ctl: Arc<ThreadControl>,
    shared: Arc<SharedState>,
    rt: Handle,
}

/// Install the `thread` binding for a claimed thread task.
fn install_binding(host: &mut ScriptHost, shared: &Arc<SharedState>, ctl: &Arc<ThreadControl>) {
    let engine: &mut Engine = host.engine_mut();
    engine.register_type_with_name::<ThreadApi>("Thread");
    engine.register_get("Key", |api: &mut ThreadApi| api.ctl.key().to_owned());
    engine.register_fn("State", |api: &mut ThreadApi| api.field(FIELD_STATE));
    engine.register_fn("Status", |api: &mut ThreadApi| api.field(FIELD_STATUS));
    engine.register_fn("Stop", |api: &mut ThreadApi| {
        api.rt.clone().block_on(api.ctl.stop(&api.shared));
    });
    engine.register_fn("Disable", |api: &mut ThreadApi| {
        api.rt.clone().block_on(api.ctl.disable(&api.shared));
    });

    host.push_binding(
        "thread",
        ThreadApi {
            ctl: ctl.clone(),
            shared: shared.clone(),
            rt: Handle::current(),
        },
    );
}

impl ThreadApi {
    fn field(&self, field: &'static str) -> String {
        self.rt
            .block_on(self.shared.store.hget(self.ctl.key(), field))
            .ok()
            .flatten()
            .unwrap_or_default()
    }
}
