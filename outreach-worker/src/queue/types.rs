//! Queue message types.
//!
//! This module defines the message formats for:
//! - `outreach_jobs` queue: campaign and unsubscribe jobs from the web intake
//! - `campaign_results` queue: summaries published by the worker

use serde::{Deserialize, Serialize};

use crate::types::{Channel, MessageTemplate, Recipient};

/// Queue name for inbound outreach jobs.
pub const JOBS_QUEUE: &str = "outreach_jobs";

/// Queue name for finished campaign summaries.
pub const RESULTS_QUEUE: &str = "campaign_results";

/// A unit of work for the worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum OutreachJob {
    /// Send a campaign
    #[serde(rename = "campaign")]
    Campaign(CampaignJob),
    /// Stop contacting an address
    #[serde(rename = "unsubscribe")]
    Unsubscribe(UnsubscribeJob),
}

impl OutreachJob {
    /// Identifier used as the AMQP message id.
    pub fn message_id(&self) -> String {
        match self {
            OutreachJob::Campaign(job) => format!("campaign-{}", job.campaign_id),
            OutreachJob::Unsubscribe(job) => format!("unsubscribe-{}", job.address),
        }
    }
}

/// Campaign definition plus the recipients it targets.
///
/// Recipients are imported into the contact store before sending, so
/// previously unsubscribed recipients are excluded even if the caller
/// did not filter them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CampaignJob {
    pub campaign_id: String,
    pub channel: Channel,
    pub template: MessageTemplate,
    pub recipients: Vec<Recipient>,
    /// Messages per minute; worker default when absent
    #[serde(default)]
    pub rate_limit: Option<u32>,
    /// Recipients per batch; worker default when absent
    #[serde(default)]
    pub batch_size: Option<usize>,
}

/// Unsubscribe request for an email address or phone number.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnsubscribeJob {
    pub address: String,
    /// Where the request came from, e.g. "mailgun"
    #[serde(default)]
    pub source: Option<String>,
}
