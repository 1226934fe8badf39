//! Host health sampling and the health probe.
//!
//! The monitor samples load average and memory pressure on an interval and
//! publishes the result both in process (the `healthy` flag that gates
//! claiming and serving) and in the store (worker `State` plus the raw
//! samples on the worker's health record). The probe is a tiny HTTP server
//! that reports whether the store is reachable.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::Router;
use sysinfo::{System, SystemExt};

use crate::flag::ShutdownGuard;
use crate::record::WorkerState;
use crate::worker::SharedState;

pub(crate) async fn monitor(shared: Arc<SharedState>) -> anyhow::Result<()> {
    let _guard = ShutdownGuard::new(&shared.shutdown);
    let shutdown = shared.shutdown.clone();

    let record = shared.worker_record();
    let health_key = shared
        .keys
        .worker_health(&shared.config.worker_name);

    let mut sys = System::new();

    loop {
        if shutdown.is_raised() {
            break;
        }

        let load = sys.load_average().one;
        sys.refresh_memory();
        let memory = memory_used_percent(&sys);

        for (field, value) in [("cpu", load), ("memory", memory)] {
            if let Err(e) = shared
                .store
                .hset(&health_key, field, &value.to_string())
                .await
            {
                tracing::warn!("failed to write {field} sample: {e:#}");
            }
        }

        let critical =
            load > shared.config.cpu_threshold || memory > shared.config.mem_threshold;
        if critical {
            shared.healthy.store(false, Ordering::Release);
            tracing::error!(load, memory, "worker is unhealthy");
            if let Err(e) = record.set_state(WorkerState::Critical).await {
                tracing::warn!("failed to write critical state: {e:#}");
            }
        } else {
            if !shared.healthy.swap(true, Ordering::AcqRel) {
                tracing::info!("worker health restored");
            }
            if let Err(e) = record.set_state(WorkerState::Normal).await {
                tracing::warn!("failed to write normal state: {e:#}");
            }
        }

        tokio::select! {
            biased;

            _ = shutdown.wait() => break,
            _ = tokio::time::sleep(shared.config.health_interval) => {}
        }
    }

    Ok(())
}

fn memory_used_percent(sys: &System) -> f64 {
    let total = sys.total_memory();
    if total == 0 {
        return 0.0;
    }
    sys.used_memory() as f64 * 100.0 / total as f64
}

/// The health probe: any path answers `{}` when the store ping succeeds and
/// 500 `Unhealthy` otherwise.
pub(crate) fn probe_router(shared: Arc<SharedState>) -> Router {
    Router::new().fallback(probe).with_state(shared)
}

async fn probe(State(shared): State<Arc<SharedState>>) -> (StatusCode, &'static str) {
    match shared.store.ping().await {
        Ok(()) => (StatusCode::OK, "{}"),
        Err(e) => {
            tracing::warn!("store ping failed: {e:#}");
            (StatusCode::INTERNAL_SERVER_ERROR, "Unhealthy")
        }
    }
}
