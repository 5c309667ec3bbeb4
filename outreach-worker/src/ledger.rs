//! Delivery ledger: per-recipient bookkeeping and campaign totals.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{error, info};

use crate::store::{ContactStore, ContactUpdate};
use crate::types::{CampaignSummary, Channel, Cost, DeliveryResult, SkippedRecipient};

/// Accumulates the outcome of one dispatch run.
///
/// Each dispatched recipient must be recorded exactly once; the batching
/// layer guarantees that, the ledger does not deduplicate.
pub struct DeliveryLedger {
    store: Arc<dyn ContactStore>,
    campaign_id: String,
    channel: Channel,
    /// Stamp `campaign_id` onto recipients' contact state
    tag_recipients: bool,
    results: Vec<DeliveryResult>,
    skipped: Vec<SkippedRecipient>,
    batches: Vec<usize>,
    successful: usize,
    failed: usize,
    total_cost: Cost,
    ledger_errors: usize,
    cancelled: bool,
    started_at: DateTime<Utc>,
}

impl DeliveryLedger {
    pub fn new(store: Arc<dyn ContactStore>, campaign_id: impl Into<String>, channel: Channel) -> Self {
        Self {
            store,
            campaign_id: campaign_id.into(),
            channel,
            tag_recipients: true,
            results: Vec::new(),
            skipped: Vec::new(),
            batches: Vec::new(),
            successful: 0,
            failed: 0,
            total_cost: Cost::ZERO,
            ledger_errors: 0,
            cancelled: false,
            started_at: Utc::now(),
        }
    }

    /// Leave recipients' `campaign_id` untouched when recording.
    pub fn without_campaign_tag(mut self) -> Self {
        self.tag_recipients = false;
        self
    }

    /// Persist the attempt and fold the result into the running totals.
    ///
    /// A store failure is logged and counted; the result still counts.
    pub async fn record(&mut self, result: DeliveryResult) {
        let update = ContactUpdate {
            campaign_id: self.tag_recipients.then(|| self.campaign_id.clone()),
            contacted_at: Utc::now(),
        };

        match self.store.record_contact(&result.recipient_id, &update).await {
            Ok(state) => {
                info!(
                    campaign_id = %self.campaign_id,
                    recipient_id = %result.recipient_id,
                    status = ?result.status,
                    contact_attempts = state.contact_attempts,
                    "ledger_recorded"
                );
            }
            Err(e) => {
                self.ledger_errors += 1;
                error!(
                    campaign_id = %self.campaign_id,
                    recipient_id = %result.recipient_id,
                    error = %e,
                    "ledger_store_update_failed"
                );
            }
        }

        if result.is_sent() {
            self.successful += 1;
            self.total_cost += result.cost;
        } else {
            self.failed += 1;
        }

        self.results.push(result);
    }

    pub fn record_skip(&mut self, recipient_id: impl Into<String>, reason: impl Into<String>) {
        self.skipped.push(SkippedRecipient {
            recipient_id: recipient_id.into(),
            reason: reason.into(),
        });
    }

    pub fn record_batch(&mut self, size: usize) {
        self.batches.push(size);
    }

    pub fn mark_cancelled(&mut self) {
        self.cancelled = true;
    }

    /// Results recorded so far.
    pub fn recorded(&self) -> usize {
        self.results.len()
    }

    pub fn finalize(self) -> CampaignSummary {
        let summary = CampaignSummary {
            campaign_id: self.campaign_id,
            channel: self.channel,
            total_targeted: self.results.len(),
            successful_count: self.successful,
            failed_count: self.failed,
            total_cost: self.total_cost,
            results: self.results,
            skipped: self.skipped,
            batches: self.batches,
            cancelled: self.cancelled,
            ledger_errors: self.ledger_errors,
            started_at: self.started_at,
            finished_at: Utc::now(),
        };

        debug_assert_eq!(
            summary.successful_count + summary.failed_count,
            summary.total_targeted
        );

        summary
    }
}
