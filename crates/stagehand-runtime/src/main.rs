use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use stagehand_runtime::{Config, WorkerBuilder};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Debug, clap::Parser)]
#[command(name = "stagehand", about = "Clustered worker that runs user scripts from a shared redis store")]
struct Args {
    /// Address of the shared redis store (host:port).
    #[arg(long, env = "STAGEHAND_REDIS_ADDRESS", default_value = "")]
    redis_address: String,

    /// Password for the store.
    #[arg(long, env = "STAGEHAND_REDIS_PASSWORD", default_value = "")]
    redis_password: String,

    /// Cluster namespace to join.
    #[arg(long = "cluster-name", env = "STAGEHAND_CLUSTER", default_value = "default")]
    cluster_name: String,

    /// Unique name of this worker; a random one is generated when empty.
    #[arg(long, env = "STAGEHAND_WORKER_NAME", default_value = "")]
    worker_name: String,

    /// Comma-separated list of scripts to seed as thread tasks.
    #[arg(long, default_value = "")]
    scripts: String,

    /// One-minute load average above which the worker is unhealthy.
    #[arg(long, default_value_t = 1.0)]
    cpu_threshold: f64,

    /// Memory-used percent above which the worker is unhealthy.
    #[arg(long, default_value_t = 90.0)]
    mem_threshold: f64,

    /// Seconds between host health samples.
    #[arg(long, default_value_t = 5)]
    health_interval: u64,

    /// Serve endpoint tasks over http.
    #[arg(long)]
    host: bool,

    /// Listen port for the endpoint host.
    #[arg(long, default_value_t = 9999)]
    host_port: u16,

    /// Listen port for the health probe.
    #[arg(long, default_value_t = 8787)]
    health_port: u16,

    /// Optional json file overriding store and identity settings.
    #[arg(long, default_value = "")]
    config: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();

    let mut config = Config::new()
        .redis_address(args.redis_address)
        .redis_password(args.redis_password)
        .cluster(args.cluster_name)
        .worker_name(args.worker_name)
        .scripts(args.scripts)
        .cpu_threshold(args.cpu_threshold)
        .mem_threshold(args.mem_threshold)
        .health_interval(Duration::from_secs(args.health_interval))
        .host(args.host)
        .host_port(args.host_port)
        .health_port(args.health_port);
    if !args.config.is_empty() {
        config = config.apply_file(&args.config)?;
    }

    let mut worker = WorkerBuilder::new(config)
        .build()
        .await
        .context("failed to start worker")?;

    let handle = worker.handle();
    tokio::spawn(async move {
        shutdown_signal().await;
        tracing::info!("shutdown signal received");
        handle.shutdown();
    });

    tracing::info!("stagehand worker starting up");
    worker.run().await?;

    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut terminate = match signal(SignalKind::terminate()) {
            Ok(terminate) => terminate,
            Err(e) => {
                tracing::warn!("failed to install SIGTERM handler: {e}");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = terminate.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
