use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use derive_setters::Setters;

/// Runtime configuration for one worker.
///
/// Construct with [`Config::new`] and chain the generated setters; the
/// defaults match the CLI defaults.
#[derive(Clone, Debug, Setters)]
#[setters(into)]
pub struct Config {
    /// Address of the shared redis store (`host:port`). Required unless a
    /// store instance is injected into the builder.
    pub redis_address: String,

    /// Password for the store, empty for none.
    pub redis_password: String,

    /// Cluster namespace this worker joins. Every store key the worker reads
    /// or writes is prefixed with it.
    pub cluster: String,

    /// Worker identity within the cluster. Empty means a random ten character
    /// name is generated at startup.
    pub worker_name: String,

    /// Comma-separated script paths seeded as thread tasks at startup.
    pub scripts: String,

    /// One-minute load average above which the worker declares itself
    /// critical and stops claiming work.
    #[setters(skip)]
    pub cpu_threshold: f64,

    /// Memory-used percentage above which the worker declares itself
    /// critical.
    #[setters(skip)]
    pub mem_threshold: f64,

    /// Delay between host health samples.
    pub health_interval: Duration,

    /// Serve endpoint tasks over HTTP.
    #[setters(skip)]
    pub host: bool,

    /// Listen port for the endpoint host.
    #[setters(skip)]
    pub host_port: u16,

    /// Listen port for the health probe.
    #[setters(skip)]
    pub health_port: u16,

    /// Default stale-heartbeat threshold, used when a thread record carries
    /// `DeadSeconds=0`.
    #[setters(skip)]
    pub seconds_till_dead: u64,

    /// How long shutdown waits for runners to drain before aborting them.
    pub shutdown_grace: Duration,
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cpu_threshold(mut self, value: f64) -> Self {
        self.cpu_threshold = value;
        self
    }

    pub fn mem_threshold(mut self, value: f64) -> Self {
        self.mem_threshold = value;
        self
    }

    pub fn host(mut self, value: bool) -> Self {
        self.host = value;
        self
    }

    pub fn host_port(mut self, value: u16) -> Self {
        self.host_port = value;
        self
    }

    pub fn health_port(mut self, value: u16) -> Self {
        self.health_port = value;
        self
    }

    pub fn seconds_till_dead(mut self, value: u64) -> Self {
        self.seconds_till_dead = value;
        self
    }

    /// Apply overrides from a JSON config file.
    ///
    /// Only the keys present in the file are applied; everything else keeps
    /// its current value.
    pub fn apply_file(mut self, path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let overrides: Overrides = serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;

        if let Some(value) = overrides.redis_address {
            self.redis_address = value;
        }
        if let Some(value) = overrides.redis_password {
            self.redis_password = value;
        }
        if let Some(value) = overrides.cluster {
            self.cluster = value;
        }
        if let Some(value) = overrides.name {
            self.worker_name = value;
        }
        if let Some(value) = overrides.host {
            self.host = value;
        }

        Ok(self)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            redis_address: String::new(),
            redis_password: String::new(),
            cluster: "default".to_owned(),
            worker_name: String::new(),
            scripts: String::new(),
            cpu_threshold: 1.0,
            mem_threshold: 90.0,
            health_interval: Duration::from_secs(5),
            host: false,
            host_port: 9999,
            health_port: 8787,
            seconds_till_dead: 1,
            shutdown_grace: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, serde::Deserialize)]
struct Overrides {
    #[serde(rename = "redis-address")]
    redis_address: Option<String>,
    #[serde(rename = "redis-password")]
    redis_password: Option<String>,
    cluster: Option<String>,
    name: Option<String>,
    host: Option<bool>,
}
