//! Outreach Worker - async RabbitMQ consumer for bulk outreach campaigns.
//!
//! This worker processes jobs from the outreach_jobs queue: campaign jobs
//! are sent through the provider failover chain in rate-limited batches,
//! unsubscribe jobs update the contact store.

mod consumer;

use anyhow::Result;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use outreach::Config;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize structured JSON logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().json().flatten_event(true))
        .init();

    tracing::info!("worker_starting");

    // Load configuration from environment
    let config = Config::from_env();
    tracing::info!(
        cloudamqp_url_set = !config.cloudamqp_url.is_empty(),
        concurrency = config.worker_concurrency,
        default_rate_limit = config.default_rate_limit,
        default_batch_size = config.default_batch_size,
        sms_provider_order = ?config.sms_provider_order,
        email_provider_order = ?config.email_provider_order,
        database_configured = config.database_url.is_some(),
        "config_loaded"
    );

    // Start the consumer
    consumer::run(config).await?;

    Ok(())
}
