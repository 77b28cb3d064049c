//! Long-running worker process.
//!
//! Reads its configuration from the environment (and the TOML file named by
//! `BELLWORK_CONFIG`, if any), binds the task dispatcher to the `default`
//! queue, and runs until SIGINT or SIGTERM, then drains in-flight jobs before
//! exiting.
//!
//! Usage:
//!   BELLWORK_REDIS_URL=redis://localhost:6379 BELLWORK_ENV=production bellwork-worker

use anyhow::{Context, Result};
use bellwork::{
    BellworkConfig, BrokerQueueService, QueueService, RedisBroker, TaskRunner,
    logging::init_logging, notify::SimulatedNotifier, shutdown,
};
use std::sync::Arc;
use tracing::info;

const DEFAULT_QUEUE: &str = "default";

#[tokio::main]
async fn main() -> Result<()> {
    let config = BellworkConfig::load().context("failed to load configuration")?;
    init_logging(&config.logging);

    let connection = config.connection();
    info!("Starting bellwork worker");
    info!("Environment: {}", config.environment);
    info!("Broker: {}", connection.redacted());
    info!("Concurrency: {}", config.worker.concurrency);

    let broker = RedisBroker::new(&connection).context("failed to create broker client")?;
    let service = BrokerQueueService::from_config(Arc::new(broker), &config);

    let notifier = SimulatedNotifier::new(config.notifier.latency);
    let runner = TaskRunner::new(Arc::new(notifier));
    service
        .process_job(DEFAULT_QUEUE, runner.into_handler(), config.worker.concurrency)
        .await
        .context("failed to register the task handler")?;

    info!(
        queue = %service.qualified_name(DEFAULT_QUEUE),
        "Worker ready, waiting for jobs"
    );

    shutdown::run_until(&service, shutdown::signal())
        .await
        .context("shutdown did not complete cleanly")?;

    Ok(())
}
