//! The cron-scheduled job task runner.
//!
//! A job maps a second-granularity cron expression to a script that runs to
//! completion on each tick. The schedule itself is local to whichever workers
//! have observed the job; the store only carries the `Cron` field, so after a
//! crash the next observer reinstates scheduling. Each tick races all workers
//! for the empty `Owner` field, which makes execution at-least-once per tick;
//! jobs must be written idempotently.

use std::sync::Arc;
use std::time::Duration;

use cron::Schedule;
use rhai::Engine;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

use crate::error::is_interrupted;
use crate::flag::ShutdownFlag;
use crate::record::{Status, TaskRecord, TaskState, FIELD_STATE, FIELD_STATUS};
use crate::script::{Interrupt, ScriptHost};
use crate::worker::SharedState;

/// Shared control block for one job task.
pub(crate) struct JobControl {
    key: String,
    /// Raised when the local cron loop should wind down.
    stopped: ShutdownFlag,
    interrupt: Interrupt,
}

impl JobControl {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.is_raised()
    }

    pub fn mark_stopped(&self) {
        self.stopped.raise();
    }

    fn reset(&self) {
        self.stopped.reset();
        self.interrupt.clear();
    }

    async fn wait_stopped(&self) {
        self.stopped.wait().await
    }

    /// Stop the local cron and disable the job persistently, interrupting a
    /// run in flight. Only the current owner may do this.
    pub async fn disable(&self, shared: &SharedState) {
        let record = TaskRecord::new(shared.store.clone(), self.key.clone());
        let owner = record.owner().await.unwrap_or_default();
        if owner != shared.config.worker_name || self.is_stopped() {
            return;
        }

        tracing::info!(key = %self.key, "disabling job");
        self.mark_stopped();
        if let Err(e) = record.set_state(TaskState::Stopped).await {
            tracing::warn!(key = %self.key, "failed to write stopped state: {e:#}");
        }
        if let Err(e) = record.set_status(Status::Disabled).await {
            tracing::warn!(key = %self.key, "failed to write disabled status: {e:#}");
        }
        self.interrupt.raise();
    }
}

struct CronSlot {
    expr: String,
    task: JoinHandle<()>,
}

/// Coordinator-side handle for one observed job.
pub(crate) struct JobHandle {
    ctl: Arc<JobControl>,
    cron: Option<CronSlot>,
}

impl JobHandle {
    pub fn new(key: String) -> Self {
        let stopped = ShutdownFlag::new();
        stopped.raise();

        Self {
            ctl: Arc::new(JobControl {
                key,
                stopped,
                interrupt: Interrupt::new(),
            }),
            cron: None,
        }
    }

    /// Tear down the local cron loop, leaving the store untouched.
    pub fn stop_local(&mut self) {
        self.ctl.mark_stopped();
        if let Some(slot) = self.cron.take() {
            slot.task.abort();
        }
    }
}

/// Reconcile the local cron loop with the stored `Cron` expression.
///
/// Called by the coordinator whenever it observes the job enabled and
/// stopped. A missing or malformed expression is logged and skipped for this
/// iteration.
pub(crate) async fn schedule(shared: &Arc<SharedState>, handle: &mut JobHandle) {
    let key = handle.ctl.key().to_owned();
    let record = TaskRecord::new(shared.store.clone(), key.clone());

    let expr = match record.cron().await {
        Ok(expr) => expr,
        Err(e) => {
            tracing::warn!(key = %key, "failed to read cron expression: {e:#}");
            return;
        }
    };
    if expr.is_empty() {
        tracing::warn!(key = %key, "job has no cron expression");
        return;
    }

    let fresh = match &handle.cron {
        None => true,
        Some(slot) => slot.expr != expr || slot.task.is_finished(),
    };
    if !fresh {
        return;
    }

    let schedule: Schedule = match expr.parse() {
        Ok(schedule) => schedule,
        Err(e) => {
            tracing::warn!(key = %key, "invalid cron expression {expr:?}: {e}");
            return;
        }
    };

    if let Some(slot) = handle.cron.take() {
        slot.task.abort();
    }

    tracing::info!(key = %key, cron = %expr, "scheduling job");
    handle.ctl.reset();
    let task = tokio::spawn(cron_loop(shared.clone(), handle.ctl.clone(), schedule));
    handle.cron = Some(CronSlot { expr, task });
}

async fn cron_loop(shared: Arc<SharedState>, ctl: Arc<JobControl>, schedule: Schedule) {
    let shutdown = shared.shutdown.clone();

    loop {
        let Some(next) = schedule.upcoming(chrono::Utc).next() else {
            break;
        };
        let delay = (next - chrono::Utc::now()).to_std().unwrap_or(Duration::ZERO);

        tokio::select! {
            biased;

            _ = shutdown.wait() => break,
            _ = ctl.wait_stopped() => break,
            _ = tokio::time::sleep(delay) => {}
        }

        // Each tick gets its own task so a slow run never delays the
        // schedule.
        tokio::spawn(run_tick(shared.clone(), ctl.clone()));
    }
}

/// One cron tick: observe disable, race for the claim, run the source once,
/// release.
async fn run_tick(shared: Arc<SharedState>, ctl: Arc<JobControl>) {
    let key = ctl.key().to_owned();
    let record = TaskRecord::new(shared.store.clone(), key.clone());

    match record.status().await {
        Ok(Status::Disabled) => {
            tracing::info!(key = %key, "job disabled, stopping local cron");
            ctl.mark_stopped();
            return;
        }
        Ok(Status::Enabled) => {}
        Err(e) => {
            tracing::warn!(key = %key, "failed to read job status: {e:#}");
            return;
        }
    }

    let owner = match record.owner().await {
        Ok(owner) => owner,
        Err(e) => {
            tracing::warn!(key = %key, "failed to read job owner: {e:#}");
            return;
        }
    };
    if !owner.is_empty() {
        return;
    }

    tracing::info!(key = %key, "starting job");
    ctl.interrupt.clear();

    let claim = async {
        record.set_state(TaskState::Running).await?;
        record.set_heartbeat(crate::util::now_nanos()).await?;
        record.set_owner(&shared.config.worker_name).await
    };
    if let Err(e) = claim.await {
        tracing::warn!(key = %key, "failed to claim job: {e:#}");
        return;
    }

    let mut host = match ScriptHost::new(&shared, ctl.interrupt.clone()) {
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
            tracing::warn!(key = %key, "failed to read job source: {e:#}");
            return;
        }
    };
    if source.is_empty() {
        tracing::error!(key = %key, "source empty for job");
        return;
    }

    // Check one last time that nobody beat us to the claim.
    match record.owner().await {
        Ok(owner) if owner == shared.config.worker_name => {}
        _ => return,
    }

    if let Err(e) = host.load(source).await {
        if !is_interrupted(&e) {
            tracing::error!(key = %key, "job failed: {e:#}");
            if let Err(e) = record.record_crash(&e).await {
                tracing::error!(key = %key, "failed to record crash: {e:#}");
            }
        }
        return;
    }

    let release = async {
        record.set_state(TaskState::Stopped).await?;
        record.set_owner("").await
    };
    if let Err(e) = release.await {
        tracing::warn!(key = %key, "failed to release job: {e:#}");
    }
}

#[derive(Clone)]
struct JobApi {
    ctl: Arc<JobControl>,
    shared: Arc<SharedState>,
    rt: Handle,
}

/// Install the `job` binding for a running job tick.
fn install_binding(host: &mut ScriptHost, shared: &Arc<SharedState>, ctl: &Arc<JobControl>) {
    let engine: &mut Engine = host.engine_mut();
    engine.register_type_with_name::<JobApi>("Job");
    engine.register_get("Key", |api: &mut JobApi| api.ctl.key().to_owned());
    engine.register_fn("State", |api: &mut JobApi| api.field(FIELD_STATE));
    engine.register_fn("Status", |api: &mut JobApi| api.field(FIELD_STATUS));
    engine.register_fn("Disable", |api: &mut JobApi| {
        api.rt.clone().block_on(api.ctl.disable(&api.shared));
    });

    host.push_binding(
        "job",
        JobApi {
            ctl: ctl.clone(),
            shared: shared.clone(),
            rt: Handle::current(),
        },
    );
}

impl JobApi {
    fn field(&self, field: &'static str) -> String {
        self.rt
            .block_on(self.shared.store.hget(self.ctl.key(), field))
            .ok()
            .flatten()
            .unwrap_or_default()
    }
}
