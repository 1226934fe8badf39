//! The shared store every worker in a cluster coordinates through.
//!
//! Workers only need a narrow slice of the store's surface: hash records for
//! task and worker state, prefix enumeration for discovery, a blocking list
//! pop for queue-style scripts, and a raw command channel for everything
//! else. [`Store`] captures exactly that slice so the runtime can run against
//! a real redis deployment ([`RedisStore`]) or an in-process double
//! ([`MemoryStore`]) in tests and embedded setups.

use std::time::Duration;

use async_trait::async_trait;

mod memory;
mod redis;

pub use self::memory::MemoryStore;
pub use self::redis::RedisStore;

#[async_trait]
pub trait Store: Send + Sync + 'static {
    /// Liveness check. The health probe surfaces this directly.
    async fn ping(&self) -> anyhow::Result<()>;

    /// Read one field of a hash record. `None` when the key or field is
    /// missing.
    async fn hget(&self, key: &str, field: &str) -> anyhow::Result<Option<String>>;

    /// Write one field of a hash record, creating the record if needed.
    async fn hset(&self, key: &str, field: &str, value: &str) -> anyhow::Result<()>;

    /// Enumerate keys matching a glob pattern (discovery uses `prefix:*`).
    async fn keys(&self, pattern: &str) -> anyhow::Result<Vec<String>>;

    /// Blocking left-pop from a list. A zero timeout blocks indefinitely.
    async fn blpop(&self, key: &str, timeout: Duration) -> anyhow::Result<Option<String>>;

    /// Raw command passthrough for user scripts.
    async fn command(&self, args: &[String]) -> anyhow::Result<CommandReply>;
}

/// Reply of a raw store command, reduced to the shapes scripts can consume.
#[derive(Clone, Debug, PartialEq)]
pub enum CommandReply {
    Nil,
    Int(i64),
    Text(String),
    List(Vec<CommandReply>),
}

/// Key layout for a cluster namespace.
///
/// Everything a cluster owns lives under `<cluster>:<kind>:<id>`.
#[derive(Clone, Debug)]
pub struct Keys {
    cluster: String,
}

impl Keys {
    pub fn new(cluster: impl Into<String>) -> Self {
        Self {
            cluster: cluster.into(),
        }
    }

    pub fn cluster(&self) -> &str {
        &self.cluster
    }

    pub fn worker(&self, name: &str) -> String {
        format!("{}:workers:{}", self.cluster, name)
    }

    pub fn worker_health(&self, name: &str) -> String {
        format!("{}:workers:{}:Health", self.cluster, name)
    }

    pub fn thread(&self, id: &str) -> String {
        format!("{}:Threads:{}", self.cluster, id)
    }

    pub fn job(&self, id: &str) -> String {
        format!("{}:Jobs:{}", self.cluster, id)
    }

    /// Endpoint ids are HTML-escaped request paths.
    pub fn endpoint(&self, escaped_path: &str) -> String {
        format!("{}:Endpoints:{}", self.cluster, escaped_path)
    }

    pub fn threads_pattern(&self) -> String {
        format!("{}:Threads:*", self.cluster)
    }

    pub fn jobs_pattern(&self) -> String {
        format!("{}:Jobs:*", self.cluster)
    }
}
