//! Typed views over the hash records tasks and workers are stored as.

use std::sync::Arc;

use anyhow::Context;

use crate::store::Store;

pub(crate) const FIELD_SOURCE: &str = "Source";
pub(crate) const FIELD_STATUS: &str = "Status";
pub(crate) const FIELD_STATE: &str = "State";
pub(crate) const FIELD_HEARTBEAT: &str = "Heartbeat";
pub(crate) const FIELD_OWNER: &str = "Owner";
pub(crate) const FIELD_HANG: &str = "Hang";
pub(crate) const FIELD_DEAD_SECONDS: &str = "DeadSeconds";
pub(crate) const FIELD_CRON: &str = "Cron";
pub(crate) const FIELD_ERROR: &str = "Error";
pub(crate) const FIELD_ERROR_TIME: &str = "ErrorTime";

/// Whether a task or worker may run at all. Anything that is not explicitly
/// disabled counts as enabled.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Status {
    Enabled,
    Disabled,
}

impl Status {
    pub fn as_str(self) -> &'static str {
        match self {
            Status::Enabled => "enabled",
            Status::Disabled => "disabled",
        }
    }

    pub fn from_raw(raw: &str) -> Status {
        if raw == "disabled" {
            Status::Disabled
        } else {
            Status::Enabled
        }
    }
}

/// Execution state of a task record.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TaskState {
    Stopped,
    Running,
    Crashed,
}

impl TaskState {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskState::Stopped => "stopped",
            TaskState::Running => "running",
            TaskState::Crashed => "crashed",
        }
    }

    pub fn from_raw(raw: &str) -> Option<TaskState> {
        match raw {
            "stopped" => Some(TaskState::Stopped),
            "running" => Some(TaskState::Running),
            "crashed" => Some(TaskState::Crashed),
            _ => None,
        }
    }
}

/// Liveness state of a worker record.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum WorkerState {
    Online,
    Normal,
    Critical,
    Offline,
}

impl WorkerState {
    pub fn as_str(self) -> &'static str {
        match self {
            WorkerState::Online => "online",
            WorkerState::Normal => "normal",
            WorkerState::Critical => "critical",
            WorkerState::Offline => "offline",
        }
    }
}

/// Typed accessors over one task's hash record.
#[derive(Clone)]
pub struct TaskRecord {
    store: Arc<dyn Store>,
    key: String,
}

impl TaskRecord {
    pub fn new(store: Arc<dyn Store>, key: impl Into<String>) -> Self {
        Self {
            store,
            key: key.into(),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    async fn field(&self, field: &str) -> anyhow::Result<String> {
        Ok(self
            .store
            .hget(&self.key, field)
            .await?
            .unwrap_or_default())
    }

    pub async fn source(&self) -> anyhow::Result<String> {
        self.field(FIELD_SOURCE).await
    }

    pub async fn status(&self) -> anyhow::Result<Status> {
        Ok(Status::from_raw(&self.field(FIELD_STATUS).await?))
    }

    pub async fn state(&self) -> anyhow::Result<Option<TaskState>> {
        Ok(TaskState::from_raw(&self.field(FIELD_STATE).await?))
    }

    pub async fn owner(&self) -> anyhow::Result<String> {
        self.field(FIELD_OWNER).await
    }

    pub async fn cron(&self) -> anyhow::Result<String> {
        self.field(FIELD_CRON).await
    }

    /// Last heartbeat in unix nanoseconds. A missing field reads as 0,
    /// meaning the task has never run; a malformed value is an error.
    pub async fn heartbeat(&self) -> anyhow::Result<i64> {
        match self.store.hget(&self.key, FIELD_HEARTBEAT).await? {
            None => Ok(0),
            Some(raw) => raw
                .parse()
                .with_context(|| format!("heartbeat is not an integer: {raw:?}")),
        }
    }

    /// Per-iteration sleep in nanoseconds. Threads without a valid interval
    /// never enter their loop, so a missing field is an error here.
    pub async fn hang(&self) -> anyhow::Result<u64> {
        let raw = self
            .store
            .hget(&self.key, FIELD_HANG)
            .await?
            .context("hang interval is not set")?;
        raw.parse()
            .with_context(|| format!("hang interval is not an integer: {raw:?}"))
    }

    /// Stale-heartbeat threshold in seconds. Missing reads as 0, which means
    /// "use the worker default"; a malformed value is an error.
    pub async fn dead_seconds(&self) -> anyhow::Result<u64> {
        match self.store.hget(&self.key, FIELD_DEAD_SECONDS).await? {
            None => Ok(0),
            Some(raw) => raw
                .parse()
                .with_context(|| format!("dead seconds is not an integer: {raw:?}")),
        }
    }

    pub async fn set_status(&self, status: Status) -> anyhow::Result<()> {
        self.store
            .hset(&self.key, FIELD_STATUS, status.as_str())
            .await
    }

    pub async fn set_state(&self, state: TaskState) -> anyhow::Result<()> {
        self.store
            .hset(&self.key, FIELD_STATE, state.as_str())
            .await
    }

    pub async fn set_owner(&self, owner: &str) -> anyhow::Result<()> {
        self.store.hset(&self.key, FIELD_OWNER, owner).await
    }

    pub async fn set_heartbeat(&self, nanos: i64) -> anyhow::Result<()> {
        self.store
            .hset(&self.key, FIELD_HEARTBEAT, &nanos.to_string())
            .await
    }

    /// Record a script fault without changing the task lifecycle. Endpoints
    /// use this; their "state" is the HTTP response.
    pub async fn record_error(&self, error: &anyhow::Error) -> anyhow::Result<()> {
        self.store
            .hset(&self.key, FIELD_ERROR, &format!("{error:#}"))
            .await?;
        self.store
            .hset(&self.key, FIELD_ERROR_TIME, &chrono::Utc::now().to_rfc3339())
            .await
    }

    /// Record a crash: the error plus `State=crashed`, `Status=disabled`.
    /// The task stays out of rotation until an operator re-enables it.
    pub async fn record_crash(&self, error: &anyhow::Error) -> anyhow::Result<()> {
        self.record_error(error).await?;
        self.set_state(TaskState::Crashed).await?;
        self.set_status(Status::Disabled).await
    }
}

/// Typed accessors over one worker's hash record.
#[derive(Clone)]
pub struct WorkerRecord {
    store: Arc<dyn Store>,
    key: String,
}

impl WorkerRecord {
    pub fn new(store: Arc<dyn Store>, key: impl Into<String>) -> Self {
        Self {
            store,
            key: key.into(),
        }
    }

    pub async fn status(&self) -> anyhow::Result<Status> {
        let raw = self
            .store
            .hget(&self.key, FIELD_STATUS)
            .await?
            .unwrap_or_default();
        Ok(Status::from_raw(&raw))
    }

    pub async fn set_status(&self, status: Status) -> anyhow::Result<()> {
        self.store
            .hset(&self.key, FIELD_STATUS, status.as_str())
            .await
    }

    pub async fn set_state(&self, state: WorkerState) -> anyhow::Result<()> {
        self.store
            .hset(&self.key, FIELD_STATE, state.as_str())
            .await
    }

    pub async fn set_heartbeat(&self, nanos: i64) -> anyhow::Result<()> {
        self.store
            .hset(&self.key, FIELD_HEARTBEAT, &nanos.to_string())
            .await
    }
}
