//! RabbitMQ consumer module using lapin.
//!
//! This module handles connecting to RabbitMQ, consuming messages from the
//! outreach_jobs queue, and spawning async tasks to process each job
//! concurrently. On shutdown, running campaigns finish their current batch,
//! publish a (cancelled) summary and are acked before the process exits.

use std::sync::Arc;

use anyhow::{Context, Result};
use futures::StreamExt;
use lapin::{
    options::{BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicQosOptions, QueueDeclareOptions},
    types::FieldTable,
    Channel, Connection, ConnectionProperties,
};
use reqwest::Client;
use std::time::Duration;
use tokio::signal;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use outreach::{
    Config, ContactStore, InMemoryContactStore, JobOutcome, JobProcessor, OutreachJob,
    PgContactStore, Publisher, JOBS_QUEUE,
};

/// Run the RabbitMQ consumer.
///
/// This function:
/// 1. Opens the contact store and builds the provider chains and job processor
/// 2. Connects to RabbitMQ and sets QoS to the worker concurrency
/// 3. Declares the jobs queue (idempotent operation)
/// 4. Starts consuming jobs, spawning a task for each
/// 5. On SIGINT/SIGTERM, signals running campaigns and waits for them
pub async fn run(config: Config) -> Result<()> {
    let config = Arc::new(config);

    // Shared HTTP client for all provider calls
    let client = Client::builder()
        .timeout(Duration::from_millis(config.request_timeout_ms))
        .pool_max_idle_per_host(32)
        .build()
        .context("Failed to create HTTP client")?;

    let store: Arc<dyn ContactStore> = match config.database_url.as_deref() {
        Some(url) => Arc::new(
            PgContactStore::connect(url, config.database_max_connections)
                .await
                .context("Failed to open contact store")?,
        ),
        None => {
            // Unsubscribes are lost on restart and not shared between workers
            warn!("contact_store_in_memory");
            Arc::new(InMemoryContactStore::new())
        }
    };
    let processor = JobProcessor::from_config(&config, &client, store)
        .context("Invalid provider configuration")?;
    let processor = Arc::new(processor);

    info!(url_length = config.cloudamqp_url.len(), "rabbitmq_connecting");

    let conn = Connection::connect(&config.cloudamqp_url, ConnectionProperties::default())
        .await
        .context("Failed to connect to RabbitMQ")?;

    info!("rabbitmq_connected");

    let channel = conn.create_channel().await.context("Failed to create channel")?;

    info!("rabbitmq_channel_created");

    // Prefetch bounds how many jobs run at once
    let prefetch_count = config.worker_concurrency.clamp(1, u16::MAX as usize) as u16;
    channel
        .basic_qos(prefetch_count, BasicQosOptions::default())
        .await
        .context("Failed to set QoS")?;

    info!(prefetch_count = prefetch_count, "rabbitmq_qos_set");

    channel
        .queue_declare(
            JOBS_QUEUE,
            QueueDeclareOptions {
                durable: true,
                ..Default::default()
            },
            FieldTable::default(),
        )
        .await
        .context("Failed to declare queue")?;

    info!(queue = JOBS_QUEUE, "rabbitmq_queue_declared");

    let publisher = Publisher::new(config.cloudamqp_url.clone());

    let mut consumer = channel
        .basic_consume(
            JOBS_QUEUE,
            "outreach-worker",
            BasicConsumeOptions::default(),
            FieldTable::default(),
        )
        .await
        .context("Failed to start consumer")?;

    info!(queue = JOBS_QUEUE, "rabbitmq_consumer_started");
    info!("worker_ready");

    let channel = Arc::new(channel);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut tasks = JoinSet::new();

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("worker_stopping");
                break;
            }
            // Reap finished tasks so the set does not grow unbounded
            Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                if let Err(e) = joined {
                    error!(error = %e, "worker_task_failed");
                }
            }
            delivery = consumer.next() => {
                match delivery {
                    Some(Ok(delivery)) => {
                        let delivery_tag = delivery.delivery_tag;
                        let message_id = delivery
                            .properties
                            .message_id()
                            .as_ref()
                            .map(|s| s.to_string())
                            .unwrap_or_else(|| "unknown".to_string());

                        info!(
                            queue = JOBS_QUEUE,
                            message_id = %message_id,
                            delivery_tag = delivery_tag,
                            body_length = delivery.data.len(),
                            "rabbitmq_job_received"
                        );

                        let processor = Arc::clone(&processor);
                        let publisher = publisher.clone();
                        let channel = Arc::clone(&channel);
                        let shutdown_rx = shutdown_rx.clone();

                        tasks.spawn(async move {
                            handle_delivery(
                                &processor,
                                &publisher,
                                &channel,
                                delivery_tag,
                                &message_id,
                                &delivery.data,
                                shutdown_rx,
                            )
                            .await;
                        });
                    }
                    Some(Err(e)) => {
                        error!(error = %e, "rabbitmq_delivery_error");
                    }
                    None => {
                        warn!("rabbitmq_consumer_closed");
                        break;
                    }
                }
            }
        }
    }

    // Let running campaigns stop at their next batch boundary
    let _ = shutdown_tx.send(true);
    info!(in_flight = tasks.len(), "worker_draining");

    while let Some(joined) = tasks.join_next().await {
        if let Err(e) = joined {
            error!(error = %e, "worker_task_failed");
        }
    }

    publisher.close().await;

    info!("worker_shutdown_complete");
    Ok(())
}

/// Parse, process, report and acknowledge one delivery.
async fn handle_delivery(
    processor: &JobProcessor,
    publisher: &Publisher,
    channel: &Channel,
    delivery_tag: u64,
    message_id: &str,
    data: &[u8],
    shutdown: watch::Receiver<bool>,
) {
    let job: OutreachJob = match serde_json::from_slice(data) {
        Ok(job) => job,
        Err(e) => {
            error!(message_id = %message_id, error = %e, "rabbitmq_job_parse_failed");
            // Malformed jobs would fail again; drop instead of requeueing
            nack(channel, delivery_tag).await;
            return;
        }
    };

    match processor.process_job(job, shutdown).await {
        Ok(JobOutcome::Campaign(summary)) => {
            if let Err(e) = publisher.publish_summary(&summary).await {
                error!(
                    campaign_id = %summary.campaign_id,
                    error = %e,
                    "campaign_summary_publish_failed"
                );
            }
        }
        Ok(JobOutcome::Unsubscribed { .. }) => {}
        Err(e) => {
            error!(message_id = %message_id, error = %e, "rabbitmq_job_failed");
            nack(channel, delivery_tag).await;
            return;
        }
    }

    // Acked even when cancelled: requeueing would contact recipients twice
    if let Err(e) = channel
        .basic_ack(delivery_tag, BasicAckOptions::default())
        .await
    {
        error!(delivery_tag = delivery_tag, error = %e, "rabbitmq_ack_failed");
    } else {
        info!(queue = JOBS_QUEUE, message_id = %message_id, "rabbitmq_job_completed");
    }
}

async fn nack(channel: &Channel, delivery_tag: u64) {
    if let Err(e) = channel
        .basic_nack(
            delivery_tag,
            BasicNackOptions {
                requeue: false,
                ..Default::default()
            },
        )
        .await
    {
        error!(delivery_tag = delivery_tag, error = %e, "rabbitmq_nack_failed");
    }
}

/// Create a future that completes when a shutdown signal is received.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "ctrl_c_handler_failed");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!(error = %e, "sigterm_handler_failed");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT"),
        _ = terminate => info!("Received SIGTERM"),
    }
}
