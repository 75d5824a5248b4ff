use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use quartz_lite::config::SchedulerConfig;
use quartz_lite::notify::TracingSink;
use quartz_lite::registry::{JobDefinition, JobRegistry, Priority, RetryPolicy};
use quartz_lite::scheduler::SchedulerHost;
use quartz_lite::shutdown::install_shutdown_handler;
use quartz_lite::store::MemoryStore;

#[derive(Parser, Debug)]
#[command(name = "quartz-lite")]
#[command(version)]
#[command(about = "Recurring-job execution engine with at-most-once leasing")]
struct Args {
    /// Lock-holder identity for this node
    #[arg(long, default_value = "node-1")]
    node_id: String,

    /// Maximum concurrently executing pooled workers
    #[arg(long, default_value = "8")]
    max_concurrency: usize,

    /// Orphan-sweep period in seconds
    #[arg(long, default_value = "30")]
    sweep_interval_secs: u64,

    /// Cron expression for the demo heartbeat job
    #[arg(long, default_value = "*/10 * * * * *")]
    heartbeat_cron: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let mut registry = JobRegistry::new();
    registry.register(
        JobDefinition::recurring(
            "heartbeat",
            &args.heartbeat_cron,
            Priority::Normal,
            Arc::new(|ctx, _token| {
                Box::pin(async move {
                    tracing::info!(
                        id = %ctx.occurrence_id,
                        scheduled_for = %ctx.scheduled_for,
                        "Heartbeat fired"
                    );
                    Ok(())
                })
            }),
        )?
        .with_retry(RetryPolicy::new(2, vec![Duration::from_secs(5)])),
    )?;
    registry.register(JobDefinition::one_shot(
        "greet",
        Priority::High,
        Arc::new(|ctx, _token| {
            Box::pin(async move {
                tracing::info!(id = %ctx.occurrence_id, "Hello from a one-shot occurrence");
                Ok(())
            })
        }),
    ))?;

    let config = SchedulerConfig::new(args.node_id)
        .with_max_concurrency(args.max_concurrency)
        .with_sweep_interval(Duration::from_secs(args.sweep_interval_secs));

    let host = SchedulerHost::new(
        config,
        Arc::new(registry),
        Arc::new(MemoryStore::new()),
        Arc::new(TracingSink),
    );
    host.start()?;
    host.schedule_once("greet", Utc::now() + chrono::Duration::seconds(2), None)
        .await?;

    let shutdown = install_shutdown_handler();
    shutdown.cancelled().await;

    if host.shutdown().await {
        tracing::info!("Drained cleanly");
    } else {
        tracing::warn!("Drain timed out; exiting with work in flight");
    }
    Ok(())
}
