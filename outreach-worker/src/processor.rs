//! Job processing module - turns queue jobs into bulk sends.
//!
//! A campaign job imports its recipients into the contact store, drops
//! anyone who has unsubscribed, and runs the remainder through the bulk
//! sender for the job's channel.

use std::sync::Arc;

use anyhow::{Context, Result};
use reqwest::Client;
use tokio::sync::watch;
use tracing::info;

use crate::bulk::{BulkRequest, BulkSender};
use crate::config::Config;
use crate::dispatch::FailoverDispatcher;
use crate::error::DispatchError;
use crate::providers::build_providers;
use crate::queue::{CampaignJob, OutreachJob, UnsubscribeJob};
use crate::store::{ContactStore, RecipientFilter};
use crate::types::{CampaignSummary, Channel};

/// Result of processing one job.
#[derive(Debug)]
pub enum JobOutcome {
    Campaign(CampaignSummary),
    Unsubscribed { address: String, matched: bool },
}

pub struct JobProcessor {
    store: Arc<dyn ContactStore>,
    sms: BulkSender,
    email: BulkSender,
    default_rate_limit: u32,
    default_batch_size: usize,
}

impl JobProcessor {
    pub fn new(
        store: Arc<dyn ContactStore>,
        sms: BulkSender,
        email: BulkSender,
        default_rate_limit: u32,
        default_batch_size: usize,
    ) -> Self {
        Self {
            store,
            sms,
            email,
            default_rate_limit,
            default_batch_size,
        }
    }

    /// Wire providers, dispatchers and senders for both channels from config.
    pub fn from_config(
        config: &Config,
        client: &Client,
        store: Arc<dyn ContactStore>,
    ) -> Result<Self, DispatchError> {
        let sender_for = |channel: Channel| -> Result<BulkSender, DispatchError> {
            let providers = build_providers(config, channel, client);
            let dispatcher = FailoverDispatcher::new(providers)?;
            Ok(BulkSender::new(
                channel,
                Arc::new(dispatcher),
                Arc::clone(&store),
                config.default_country_code.clone(),
            ))
        };

        let sms = sender_for(Channel::Sms)?;
        let email = sender_for(Channel::Email)?;

        Ok(Self::new(
            Arc::clone(&store),
            sms,
            email,
            config.default_rate_limit,
            config.default_batch_size,
        ))
    }

    fn sender(&self, channel: Channel) -> &BulkSender {
        match channel {
            Channel::Sms => &self.sms,
            Channel::Email => &self.email,
        }
    }

    /// Process a single job.
    pub async fn process_job(
        &self,
        job: OutreachJob,
        shutdown: watch::Receiver<bool>,
    ) -> Result<JobOutcome> {
        match job {
            OutreachJob::Campaign(job) => {
                let summary = self.run_campaign(job, shutdown).await?;
                Ok(JobOutcome::Campaign(summary))
            }
            OutreachJob::Unsubscribe(job) => self.unsubscribe(job).await,
        }
    }

    async fn run_campaign(
        &self,
        job: CampaignJob,
        shutdown: watch::Receiver<bool>,
    ) -> Result<CampaignSummary> {
        info!(
            campaign_id = %job.campaign_id,
            channel = %job.channel,
            recipients = job.recipients.len(),
            "campaign_job_received"
        );

        self.store
            .upsert_recipients(&job.recipients)
            .await
            .context("Failed to import recipients")?;

        let ids = job.recipients.iter().map(|r| r.id.clone());
        let eligible = self
            .store
            .fetch_recipients(&RecipientFilter::ids(ids))
            .await
            .context("Failed to load recipients")?;

        let unsubscribed = job.recipients.len().saturating_sub(eligible.len());
        if unsubscribed > 0 {
            info!(
                campaign_id = %job.campaign_id,
                excluded = unsubscribed,
                "campaign_unsubscribed_excluded"
            );
        }

        let request = BulkRequest {
            campaign_id: job.campaign_id,
            channel: job.channel,
            template: job.template,
            recipients: eligible,
            rate_limit: job.rate_limit.unwrap_or(self.default_rate_limit),
            batch_size: job.batch_size.unwrap_or(self.default_batch_size),
        };

        let summary = self
            .sender(request.channel)
            .send_bulk_until(request, shutdown)
            .await?;

        Ok(summary)
    }

    async fn unsubscribe(&self, job: UnsubscribeJob) -> Result<JobOutcome> {
        let matched = self
            .store
            .mark_unsubscribed(&job.address)
            .await
            .context("Failed to mark unsubscribed")?;

        info!(
            address = %job.address,
            source = ?job.source,
            matched = matched,
            "unsubscribe_job_processed"
        );

        Ok(JobOutcome::Unsubscribed {
            address: job.address,
            matched,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    use crate::providers::{Provider, ProviderProfile};
    use crate::store::InMemoryContactStore;
    use crate::types::{Cost, MessageTemplate, OutboundMessage, Recipient, SendOutcome};

    struct AlwaysSends(ProviderProfile);

    #[async_trait]
    impl Provider for AlwaysSends {
        fn profile(&self) -> &ProviderProfile {
            &self.0
        }

        async fn send(&self, address: &str, _message: &OutboundMessage) -> SendOutcome {
            SendOutcome::sent(&self.0.name, address, Cost::ZERO)
        }
    }

    fn processor_with(store: Arc<InMemoryContactStore>) -> JobProcessor {
        let sender_for = |channel: Channel| {
            let provider = AlwaysSends(ProviderProfile::new("fake", channel, 0));
            let dispatcher =
                FailoverDispatcher::new(vec![Arc::new(provider) as Arc<dyn Provider>]).unwrap();
            BulkSender::new(
                channel,
                Arc::new(dispatcher),
                store.clone() as Arc<dyn ContactStore>,
                "1",
            )
        };

        JobProcessor::new(
            store.clone(),
            sender_for(Channel::Sms),
            sender_for(Channel::Email),
            600,
            10,
        )
    }

    fn campaign(recipients: Vec<Recipient>) -> OutreachJob {
        OutreachJob::Campaign(CampaignJob {
            campaign_id: "summer".to_string(),
            channel: Channel::Email,
            template: MessageTemplate::new("Hi {name}").with_subject("Camp"),
            recipients,
            rate_limit: None,
            batch_size: Some(2),
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_unsubscribed_recipient_excluded_from_campaign() {
        let store = Arc::new(InMemoryContactStore::new());
        let processor = processor_with(store.clone());
        let (_tx, rx) = watch::channel(false);

        let roster = vec![
            Recipient::new("a", "Ana").with_email("ana@example.com"),
            Recipient::new("b", "Bo").with_email("Bo@Example.com"),
            Recipient::new("c", "Cy").with_email("cy@example.com"),
        ];

        processor
            .process_job(campaign(roster.clone()), rx.clone())
            .await
            .unwrap();

        let outcome = processor
            .process_job(
                OutreachJob::Unsubscribe(UnsubscribeJob {
                    address: "bo@example.com".to_string(),
                    source: Some("mailgun".to_string()),
                }),
                rx.clone(),
            )
            .await
            .unwrap();
        assert!(matches!(outcome, JobOutcome::Unsubscribed { matched: true, .. }));

        // Re-importing the roster must not resurrect the unsubscribed contact
        let summary = match processor.process_job(campaign(roster), rx).await.unwrap() {
            JobOutcome::Campaign(summary) => summary,
            other => panic!("unexpected outcome: {:?}", other),
        };

        assert_eq!(summary.total_targeted, 2);
        assert!(summary.result_for("b").is_none());

        let bo = store.fetch_recipient("b").await.unwrap().unwrap();
        assert!(bo.contact.unsubscribed);
        assert_eq!(bo.contact.contact_attempts, 1);

        let ana = store.fetch_recipient("a").await.unwrap().unwrap();
        assert_eq!(ana.contact.contact_attempts, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_twelve_imported_two_opted_out_ten_sent() {
        let store = Arc::new(InMemoryContactStore::new());
        let processor = processor_with(store.clone());
        let (_tx, rx) = watch::channel(false);

        let recipients: Vec<Recipient> = (0..12)
            .map(|i| {
                let mut r = Recipient::new(format!("r{}", i), "Sam Reyes")
                    .with_phone(format!("555-300-{:04}", i));
                r.contact.unsubscribed = i >= 10;
                r
            })
            .collect();
        let job = OutreachJob::Campaign(CampaignJob {
            campaign_id: "regional".to_string(),
            channel: Channel::Sms,
            template: MessageTemplate::new("Hi {name}"),
            recipients,
            rate_limit: Some(60),
            batch_size: Some(4),
        });

        let summary = match processor.process_job(job, rx).await.unwrap() {
            JobOutcome::Campaign(summary) => summary,
            other => panic!("unexpected outcome: {:?}", other),
        };

        assert_eq!(summary.batches, vec![4, 4, 2]);
        assert_eq!(summary.total_targeted, 10);
        assert_eq!(summary.successful_count, 10);
        assert_eq!(summary.failed_count, 0);
        assert!(summary.result_for("r10").is_none());
        assert!(summary.result_for("r11").is_none());

        for i in 0..12 {
            let stored = store.fetch_recipient(&format!("r{}", i)).await.unwrap().unwrap();
            let expected = if i < 10 { 1 } else { 0 };
            assert_eq!(stored.contact.contact_attempts, expected, "recipient r{}", i);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_campaign_defaults_applied() {
        let store = Arc::new(InMemoryContactStore::new());
        let processor = processor_with(store);
        let (_tx, rx) = watch::channel(false);

        let recipients = (0..12)
            .map(|i| Recipient::new(format!("r{}", i), "Sam").with_phone(format!("555-200-{:04}", i)))
            .collect();
        let job = OutreachJob::Campaign(CampaignJob {
            campaign_id: "defaults".to_string(),
            channel: Channel::Sms,
            template: MessageTemplate::new("Hi {name}"),
            recipients,
            rate_limit: None,
            batch_size: None,
        });

        let summary = match processor.process_job(job, rx).await.unwrap() {
            JobOutcome::Campaign(summary) => summary,
            other => panic!("unexpected outcome: {:?}", other),
        };

        assert_eq!(summary.channel, Channel::Sms);
        assert_eq!(summary.batches, vec![10, 2]);
        assert_eq!(summary.successful_count, 12);
    }

    #[tokio::test]
    async fn test_from_config_without_backends() {
        let store = Arc::new(InMemoryContactStore::new());
        let processor = JobProcessor::from_config(&Config::default(), &Client::new(), store);

        assert!(processor.is_ok());
    }

    #[tokio::test]
    async fn test_unsubscribe_unknown_address() {
        let store = Arc::new(InMemoryContactStore::new());
        let processor =
            JobProcessor::from_config(&Config::default(), &Client::new(), store).unwrap();
        let (_tx, rx) = watch::channel(false);

        let outcome = processor
            .process_job(
                OutreachJob::Unsubscribe(UnsubscribeJob {
                    address: "nobody@example.com".to_string(),
                    source: None,
                }),
                rx,
            )
            .await
            .unwrap();

        match outcome {
            JobOutcome::Unsubscribed { matched, .. } => assert!(!matched),
            other => panic!("unexpected outcome: {:?}", other),
        }
    }
}
