//! A self-coordinating worker fleet that executes user-authored scripts.
//!
//! Workers join a named cluster and coordinate solely through a shared
//! key-value store: task records are discovered by prefix scan, claimed by
//! writing an `Owner` field, kept alive through heartbeats, and re-claimed by
//! peers when their owner dies or stalls. Three task kinds exist: long-lived
//! threads, cron-scheduled jobs, and request-driven HTTP endpoints, all
//! interpreted by an embedded scripting engine with a capability bundle for
//! store access, outbound HTTP, SQL and the process environment.

mod config;
mod endpoint;
mod error;
pub mod flag;
mod health;
mod job;
mod record;
mod script;
pub mod store;
mod thread;
mod util;
mod worker;

pub use self::config::Config;
pub use self::error::Interrupted;
pub use self::record::{Status, TaskRecord, TaskState, WorkerRecord, WorkerState};
pub use self::script::{Capability, CapabilityContext, Interrupt, ScriptHost};
pub use self::worker::{Worker, WorkerBuilder, WorkerHandle};
