//! Async RabbitMQ publisher for enqueueing jobs and results.
//!
//! One connection and channel are opened on first use, shared by every clone,
//! and reopened when the broker drops them. Both queues are declared durable
//! on every (re)connect.

use std::sync::Arc;

use anyhow::{Context, Result};
use lapin::{
    options::{BasicPublishOptions, QueueDeclareOptions},
    types::FieldTable,
    BasicProperties, Channel, Connection, ConnectionProperties,
};
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{info, warn};

use super::types::{OutreachJob, JOBS_QUEUE, RESULTS_QUEUE};
use crate::types::CampaignSummary;

/// Open connection plus the channel publishes go through.
struct Link {
    connection: Connection,
    channel: Channel,
}

/// Cloneable handle; all clones share one lazily opened link.
#[derive(Clone)]
pub struct Publisher {
    url: Arc<str>,
    link: Arc<Mutex<Option<Link>>>,
}

impl Publisher {
    pub fn new(url: String) -> Self {
        Self {
            url: url.into(),
            link: Arc::new(Mutex::new(None)),
        }
    }

    /// Return a live channel, reconnecting if the previous one dropped.
    async fn channel(&self) -> Result<Channel> {
        let mut link = self.link.lock().await;

        if let Some(existing) = link.as_ref() {
            if existing.channel.status().connected() {
                return Ok(existing.channel.clone());
            }
            warn!("rabbitmq_publisher_link_lost");
        }

        info!("rabbitmq_publisher_connecting");

        let connection = Connection::connect(&self.url, ConnectionProperties::default())
            .await
            .context("Failed to connect to RabbitMQ")?;
        let channel = connection
            .create_channel()
            .await
            .context("Failed to create channel")?;

        for queue in [JOBS_QUEUE, RESULTS_QUEUE] {
            channel
                .queue_declare(
                    queue,
                    QueueDeclareOptions {
                        durable: true,
                        ..Default::default()
                    },
                    FieldTable::default(),
                )
                .await
                .with_context(|| format!("Failed to declare queue {}", queue))?;
        }

        info!(
            jobs_queue = JOBS_QUEUE,
            results_queue = RESULTS_QUEUE,
            "rabbitmq_publisher_connected"
        );

        *link = Some(Link {
            connection,
            channel: channel.clone(),
        });

        Ok(channel)
    }

    /// Serialize `body` and publish it persistently to `queue`.
    async fn publish_json<T: Serialize>(&self, queue: &str, message_id: &str, body: &T) -> Result<usize> {
        let channel = self.channel().await?;

        let body = serde_json::to_vec(body).context("Failed to serialize message")?;

        channel
            .basic_publish(
                "",
                queue,
                BasicPublishOptions::default(),
                &body,
                BasicProperties::default()
                    .with_delivery_mode(2) // Persistent
                    .with_content_type("application/json".into())
                    .with_message_id(message_id.to_string().into()),
            )
            .await
            .with_context(|| format!("Failed to publish to {}", queue))?
            .await
            .context("Failed to confirm publish")?;

        Ok(body.len())
    }

    /// Publish a job to the outreach_jobs queue.
    pub async fn publish_job(&self, job: &OutreachJob) -> Result<()> {
        let message_id = job.message_id();
        let body_length = self.publish_json(JOBS_QUEUE, &message_id, job).await?;

        info!(
            queue = JOBS_QUEUE,
            message_id = %message_id,
            body_length = body_length,
            "rabbitmq_job_published"
        );

        Ok(())
    }

    /// Publish a finished campaign summary to the campaign_results queue.
    pub async fn publish_summary(&self, summary: &CampaignSummary) -> Result<()> {
        let message_id = format!("summary-{}", summary.campaign_id);
        let body_length = self.publish_json(RESULTS_QUEUE, &message_id, summary).await?;

        info!(
            queue = RESULTS_QUEUE,
            campaign_id = %summary.campaign_id,
            body_length = body_length,
            "rabbitmq_summary_published"
        );

        Ok(())
    }

    /// Close the channel and connection if one is open.
    pub async fn close(&self) {
        let Some(link) = self.link.lock().await.take() else {
            return;
        };

        if let Err(e) = link.channel.close(200, "Normal shutdown").await {
            warn!(error = %e, "rabbitmq_channel_close_error");
        }
        if let Err(e) = link.connection.close(200, "Normal shutdown").await {
            warn!(error = %e, "rabbitmq_connection_close_error");
        }

        info!("rabbitmq_publisher_closed");
    }
}
