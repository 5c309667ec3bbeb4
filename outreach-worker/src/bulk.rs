//! Batched, rate-limited bulk sending.
//!
//! Recipients are split into consecutive batches. Sends inside a batch run
//! concurrently; batches run strictly one after another with a fixed pause
//! between them so the average throughput stays at the requested rate:
//!
//! ```text
//! delay = (60_000ms / rate_limit) * batch_size
//!
//! [batch 0: r0..r4 concurrently] → delay → [batch 1: r5..r9] → delay → ... → summary
//! ```
//!
//! A batch is the unit of forward progress: cancellation is only observed
//! between batches, and every started batch is fully recorded.

use std::collections::HashSet;
use std::ops::Range;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{info, warn};

use crate::address::parse_address;
use crate::dispatch::FailoverDispatcher;
use crate::error::DispatchError;
use crate::ledger::DeliveryLedger;
use crate::store::ContactStore;
use crate::template::TemplateRenderer;
use crate::types::{CampaignSummary, Channel, DeliveryResult, MessageTemplate, Recipient};

/// One bulk-send invocation.
#[derive(Debug, Clone)]
pub struct BulkRequest {
    pub campaign_id: String,
    pub channel: Channel,
    pub template: MessageTemplate,
    pub recipients: Vec<Recipient>,
    /// Target throughput in messages per minute
    pub rate_limit: u32,
    pub batch_size: usize,
}

/// Split `len` items into consecutive ranges of at most `batch_size`.
pub fn partition(len: usize, batch_size: usize) -> Vec<Range<usize>> {
    if batch_size == 0 {
        return Vec::new();
    }

    (0..len)
        .step_by(batch_size)
        .map(|start| start..(start + batch_size).min(len))
        .collect()
}

/// Pause between batches: `(60s / rate_limit) * batch_size`.
pub fn inter_batch_delay(rate_limit: u32, batch_size: usize) -> Duration {
    if rate_limit == 0 {
        return Duration::ZERO;
    }

    let micros = 60_000_000u64.saturating_mul(batch_size as u64) / u64::from(rate_limit);
    Duration::from_micros(micros)
}

/// Resolve once the shutdown flag is raised; never if the sender is gone.
async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow_and_update() {
            return;
        }
        if shutdown.changed().await.is_err() {
            futures::future::pending::<()>().await;
        }
    }
}

/// Sends campaigns on one channel through a failover dispatcher.
pub struct BulkSender {
    channel: Channel,
    dispatcher: Arc<FailoverDispatcher>,
    store: Arc<dyn ContactStore>,
    country_code: String,
}

impl BulkSender {
    pub fn new(
        channel: Channel,
        dispatcher: Arc<FailoverDispatcher>,
        store: Arc<dyn ContactStore>,
        country_code: impl Into<String>,
    ) -> Self {
        Self {
            channel,
            dispatcher,
            store,
            country_code: country_code.into(),
        }
    }

    pub fn channel(&self) -> Channel {
        self.channel
    }

    /// Run a bulk send to completion.
    pub async fn send_bulk(&self, request: BulkRequest) -> Result<CampaignSummary, DispatchError> {
        let (_keep_open, shutdown) = watch::channel(false);
        self.send_bulk_until(request, shutdown).await
    }

    /// Run a bulk send, stopping at the next batch boundary once `shutdown`
    /// turns true.
    ///
    /// Only invalid arguments, including a request for another channel,
    /// produce an error; delivery failures are reported in the returned
    /// summary.
    pub async fn send_bulk_until(
        &self,
        request: BulkRequest,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<CampaignSummary, DispatchError> {
        if request.rate_limit == 0 {
            return Err(DispatchError::InvalidRateLimit);
        }
        if request.batch_size == 0 {
            return Err(DispatchError::InvalidBatchSize);
        }
        if request.channel != self.channel {
            warn!(
                campaign_id = %request.campaign_id,
                requested = %request.channel,
                sender = %self.channel,
                "bulk_channel_mismatch"
            );
            return Err(DispatchError::ChannelMismatch {
                requested: request.channel,
                sender: self.channel,
            });
        }

        let BulkRequest {
            campaign_id,
            channel,
            template,
            recipients,
            rate_limit,
            batch_size,
        } = request;

        let renderer = TemplateRenderer::for_channel(channel);
        let mut ledger = DeliveryLedger::new(Arc::clone(&self.store), campaign_id.clone(), channel);

        let eligible = self.select_eligible(channel, recipients, &mut ledger);
        let batches = partition(eligible.len(), batch_size);
        let delay = inter_batch_delay(rate_limit, batch_size);
        let batch_count = batches.len();

        info!(
            campaign_id = %campaign_id,
            channel = %channel,
            eligible = eligible.len(),
            batch_count = batch_count,
            batch_size = batch_size,
            rate_limit = rate_limit,
            delay_ms = delay.as_millis() as u64,
            providers = ?self.dispatcher.provider_names(),
            "bulk_send_started"
        );

        for (index, range) in batches.into_iter().enumerate() {
            if *shutdown.borrow() {
                info!(campaign_id = %campaign_id, batch_index = index, "bulk_send_cancelled");
                ledger.mark_cancelled();
                break;
            }

            let batch = &eligible[range];
            info!(
                campaign_id = %campaign_id,
                batch_index = index,
                batch_len = batch.len(),
                "bulk_batch_started"
            );

            let sends = batch.iter().map(|(recipient, address)| {
                let message = renderer.render_for(&template, recipient);
                let dispatcher = &self.dispatcher;
                async move {
                    let outcome = dispatcher.dispatch(address, &message).await;
                    DeliveryResult::from_outcome(recipient.id.clone(), outcome)
                }
            });

            let results = join_all(sends).await;
            let sent = results.iter().filter(|r| r.is_sent()).count();

            for result in results {
                ledger.record(result).await;
            }
            ledger.record_batch(batch.len());

            info!(
                campaign_id = %campaign_id,
                batch_index = index,
                sent = sent,
                failed = batch.len() - sent,
                "bulk_batch_completed"
            );

            if index + 1 < batch_count {
                tokio::select! {
                    _ = sleep(delay) => {}
                    _ = shutdown_requested(&mut shutdown) => {
                        info!(
                            campaign_id = %campaign_id,
                            batches_completed = index + 1,
                            "bulk_send_cancelled"
                        );
                        ledger.mark_cancelled();
                        break;
                    }
                }
            }
        }

        let summary = ledger.finalize();

        info!(
            campaign_id = %summary.campaign_id,
            total_targeted = summary.total_targeted,
            successful = summary.successful_count,
            failed = summary.failed_count,
            skipped = summary.skipped.len(),
            total_cost = %summary.total_cost,
            cancelled = summary.cancelled,
            "bulk_send_complete"
        );

        Ok(summary)
    }

    /// Keep recipients with a valid, normalized address for `channel`.
    ///
    /// Everyone else is recorded as skipped; no attempt is charged to them.
    fn select_eligible(
        &self,
        channel: Channel,
        recipients: Vec<Recipient>,
        ledger: &mut DeliveryLedger,
    ) -> Vec<(Recipient, String)> {
        let mut seen = HashSet::new();
        let mut eligible = Vec::with_capacity(recipients.len());

        for recipient in recipients {
            if !seen.insert(recipient.id.clone()) {
                ledger.record_skip(recipient.id, "duplicate recipient in run");
                continue;
            }

            let Some(raw) = recipient.address_for(channel) else {
                ledger.record_skip(recipient.id, format!("no {} address", channel));
                continue;
            };

            match parse_address(channel, raw, &self.country_code) {
                Ok(address) => eligible.push((recipient, address)),
                Err(e) => {
                    warn!(recipient_id = %recipient.id, error = %e, "bulk_recipient_invalid_address");
                    ledger.record_skip(recipient.id, e.to_string());
                }
            }
        }

        eligible
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use async_trait::async_trait;

    use crate::dispatch::{ALL_PROVIDERS_FAILED, NO_PROVIDERS_CONFIGURED};
    use crate::providers::{Provider, ProviderProfile};
    use crate::store::InMemoryContactStore;
    use crate::types::{Cost, OutboundMessage, SendOutcome};

    /// Records every send; fails for addresses in `reject`.
    struct Recording {
        profile: ProviderProfile,
        reject: Vec<String>,
        sent: Mutex<Vec<(String, String)>>,
        on_send: Option<watch::Sender<bool>>,
    }

    impl Recording {
        fn new(name: &str, priority: u32) -> Self {
            Self {
                profile: ProviderProfile::new(name, Channel::Sms, priority).with_cost(Cost(7_500)),
                reject: Vec::new(),
                sent: Mutex::new(Vec::new()),
                on_send: None,
            }
        }

        fn rejecting(mut self, address: &str) -> Self {
            self.reject.push(address.to_string());
            self
        }

        /// Raise the shutdown flag as soon as anything is sent.
        fn signalling(mut self, tx: watch::Sender<bool>) -> Self {
            self.on_send = Some(tx);
            self
        }

        fn sent(&self) -> Vec<(String, String)> {
            self.sent.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Provider for Recording {
        fn profile(&self) -> &ProviderProfile {
            &self.profile
        }

        async fn send(&self, address: &str, message: &OutboundMessage) -> SendOutcome {
            if let Some(tx) = &self.on_send {
                let _ = tx.send(true);
            }
            if self.reject.iter().any(|a| a == address) {
                return SendOutcome::failed(&self.profile.name, "rejected");
            }
            self.sent
                .lock()
                .unwrap()
                .push((address.to_string(), message.body.clone()));
            SendOutcome::sent(&self.profile.name, format!("msg-{}", address), self.profile.cost_per_message)
        }
    }

    fn roster(count: usize) -> Vec<Recipient> {
        (0..count)
            .map(|i| {
                Recipient::new(format!("p{}", i), format!("Player{} Last", i))
                    .with_phone(format!("555-010-{:04}", i))
                    .with_field("sport", "Soccer")
            })
            .collect()
    }

    fn request(recipients: Vec<Recipient>, batch_size: usize) -> BulkRequest {
        BulkRequest {
            campaign_id: "spring".to_string(),
            channel: Channel::Sms,
            template: MessageTemplate::new("Hi {name}, {sport} camp is open"),
            recipients,
            rate_limit: 6_000,
            batch_size,
        }
    }

    async fn sender_with(
        providers: Vec<Arc<dyn Provider>>,
        recipients: &[Recipient],
    ) -> (BulkSender, InMemoryContactStore) {
        let store = InMemoryContactStore::new();
        store.upsert_recipients(recipients).await.unwrap();
        let dispatcher = FailoverDispatcher::new(providers).unwrap();
        let sender = BulkSender::new(
            Channel::Sms,
            Arc::new(dispatcher),
            Arc::new(store.clone()),
            "1",
        );
        (sender, store)
    }

    async fn attempts(store: &InMemoryContactStore, id: &str) -> u32 {
        store
            .fetch_recipient(id)
            .await
            .unwrap()
            .map(|r| r.contact.contact_attempts)
            .unwrap_or_default()
    }

    fn sizes(ranges: &[Range<usize>]) -> Vec<usize> {
        ranges.iter().map(|r| r.len()).collect()
    }

    #[test]
    fn test_partition_uneven() {
        let ranges = partition(23, 5);
        assert_eq!(sizes(&ranges), vec![5, 5, 5, 5, 3]);
        assert_eq!(ranges[0], 0..5);
        assert_eq!(ranges[4], 20..23);
    }

    #[test]
    fn test_partition_edges() {
        assert!(partition(0, 5).is_empty());
        assert!(partition(5, 0).is_empty());
        assert_eq!(sizes(&partition(5, 5)), vec![5]);
        assert_eq!(sizes(&partition(3, 10)), vec![3]);
        assert_eq!(sizes(&partition(10, 4)), vec![4, 4, 2]);
    }

    #[test]
    fn test_inter_batch_delay() {
        assert_eq!(inter_batch_delay(60, 10), Duration::from_secs(10));
        assert_eq!(inter_batch_delay(300, 5), Duration::from_secs(1));
        assert_eq!(inter_batch_delay(7, 1), Duration::from_micros(8_571_428));
        assert_eq!(inter_batch_delay(0, 5), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ten_recipients_in_batches_of_four() {
        let recipients = roster(10);
        let provider = Arc::new(Recording::new("primary", 0));
        let (sender, store) =
            sender_with(vec![provider.clone() as Arc<dyn Provider>], &recipients).await;

        let summary = sender.send_bulk(request(recipients, 4)).await.unwrap();

        assert_eq!(summary.batches, vec![4, 4, 2]);
        assert_eq!(summary.total_targeted, 10);
        assert_eq!(summary.successful_count, 10);
        assert_eq!(summary.failed_count, 0);
        assert_eq!(summary.total_cost, Cost(75_000));
        assert_eq!(summary.ledger_errors, 0);
        assert!(!summary.cancelled);

        for i in 0..10 {
            let id = format!("p{}", i);
            assert_eq!(attempts(&store, &id).await, 1);
            assert_eq!(
                summary.result_for(&id).and_then(|r| r.provider_used.as_deref()),
                Some("primary")
            );
        }

        let stored = store.fetch_recipient("p3").await.unwrap().unwrap();
        assert_eq!(stored.contact.campaign_id.as_deref(), Some("spring"));
        assert!(stored.contact.last_contact_date.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_batches_follow_partition() {
        let recipients = roster(23);
        let provider = Arc::new(Recording::new("primary", 0)) as Arc<dyn Provider>;
        let (sender, _store) = sender_with(vec![provider], &recipients).await;

        let summary = sender.send_bulk(request(recipients, 5)).await.unwrap();

        assert_eq!(summary.batches, vec![5, 5, 5, 5, 3]);
        assert_eq!(summary.total_targeted, 23);
    }

    #[tokio::test(start_paused = true)]
    async fn test_addresses_normalized_and_sms_uses_first_name() {
        let recipients = vec![Recipient::new("p1", "Jo Smith")
            .with_phone("555-123-4567")
            .with_field("sport", "Lacrosse")];
        let provider = Arc::new(Recording::new("primary", 0));
        let (sender, _store) =
            sender_with(vec![provider.clone() as Arc<dyn Provider>], &recipients).await;

        sender.send_bulk(request(recipients, 5)).await.unwrap();

        assert_eq!(
            provider.sent(),
            vec![(
                "+15551234567".to_string(),
                "Hi Jo, Lacrosse camp is open".to_string()
            )]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_and_invalid_phones_are_skipped() {
        let recipients = vec![
            Recipient::new("ok", "Ana").with_phone("5551234567"),
            Recipient::new("none", "Bo"),
            Recipient::new("blank", "Cy").with_phone("  "),
            Recipient::new("short", "Di").with_phone("12-34"),
        ];
        let provider = Arc::new(Recording::new("primary", 0));
        let (sender, store) =
            sender_with(vec![provider.clone() as Arc<dyn Provider>], &recipients).await;

        let summary = sender.send_bulk(request(recipients, 5)).await.unwrap();

        assert_eq!(summary.total_targeted, 1);
        assert_eq!(summary.successful_count, 1);
        assert_eq!(summary.skipped.len(), 3);
        assert_eq!(provider.sent().len(), 1);
        assert_eq!(attempts(&store, "ok").await, 1);
        assert_eq!(attempts(&store, "none").await, 0);
        assert_eq!(attempts(&store, "short").await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_recipient_sent_once() {
        let mut recipients = roster(2);
        recipients.push(recipients[0].clone());
        let provider = Arc::new(Recording::new("primary", 0));
        let (sender, store) =
            sender_with(vec![provider.clone() as Arc<dyn Provider>], &recipients).await;

        let summary = sender.send_bulk(request(recipients, 5)).await.unwrap();

        assert_eq!(summary.total_targeted, 2);
        assert_eq!(summary.skipped.len(), 1);
        assert_eq!(attempts(&store, "p0").await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failover_and_failures_are_counted() {
        let recipients = roster(4);
        let primary = Recording::new("primary", 0)
            .rejecting("+15550100001")
            .rejecting("+15550100002");
        let backup = Recording::new("backup", 1).rejecting("+15550100002");
        let (sender, store) = sender_with(
            vec![
                Arc::new(backup) as Arc<dyn Provider>,
                Arc::new(primary) as Arc<dyn Provider>,
            ],
            &recipients,
        )
        .await;

        let summary = sender.send_bulk(request(recipients, 2)).await.unwrap();

        assert_eq!(summary.total_targeted, 4);
        assert_eq!(summary.successful_count, 3);
        assert_eq!(summary.failed_count, 1);

        let rescued = summary.result_for("p1").unwrap();
        assert_eq!(rescued.provider_used.as_deref(), Some("backup"));

        let lost = summary.result_for("p2").unwrap();
        assert!(!lost.is_sent());
        assert_eq!(lost.error.as_deref(), Some(ALL_PROVIDERS_FAILED));
        assert_eq!(lost.provider_used, None);

        // Failed attempts still count as contact attempts
        assert_eq!(attempts(&store, "p2").await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_providers_fails_every_recipient() {
        let recipients = roster(3);
        let (sender, store) = sender_with(Vec::new(), &recipients).await;

        let summary = sender.send_bulk(request(recipients, 2)).await.unwrap();

        assert_eq!(summary.total_targeted, 3);
        assert_eq!(summary.failed_count, 3);
        assert_eq!(summary.total_cost, Cost::ZERO);
        assert!(summary
            .results
            .iter()
            .all(|r| r.error.as_deref() == Some(NO_PROVIDERS_CONFIGURED)));
        assert_eq!(attempts(&store, "p0").await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempts_accumulate_across_campaigns() {
        let recipients = roster(2);
        let provider = Arc::new(Recording::new("primary", 0)) as Arc<dyn Provider>;
        let (sender, store) = sender_with(vec![provider], &recipients).await;

        sender.send_bulk(request(recipients.clone(), 5)).await.unwrap();
        sender.send_bulk(request(recipients, 5)).await.unwrap();

        assert_eq!(attempts(&store, "p0").await, 2);
        assert_eq!(attempts(&store, "p1").await, 2);
    }

    #[tokio::test]
    async fn test_invalid_arguments_rejected() {
        let (sender, _store) = sender_with(Vec::new(), &[]).await;

        let mut zero_rate = request(roster(1), 5);
        zero_rate.rate_limit = 0;
        assert_eq!(
            sender.send_bulk(zero_rate).await.unwrap_err(),
            DispatchError::InvalidRateLimit
        );

        assert_eq!(
            sender.send_bulk(request(roster(1), 0)).await.unwrap_err(),
            DispatchError::InvalidBatchSize
        );
    }

    #[tokio::test]
    async fn test_other_channel_rejected_before_recording() {
        let recipients = vec![Recipient::new("r1", "Ana")
            .with_email("ana@example.com")
            .with_phone("555-123-4567")];
        let provider = Arc::new(Recording::new("primary", 0));
        let (sender, store) =
            sender_with(vec![provider.clone() as Arc<dyn Provider>], &recipients).await;

        let mut email = request(recipients, 5);
        email.channel = Channel::Email;

        assert_eq!(
            sender.send_bulk(email).await.unwrap_err(),
            DispatchError::ChannelMismatch {
                requested: Channel::Email,
                sender: Channel::Sms,
            }
        );
        assert!(provider.sent().is_empty());
        assert_eq!(attempts(&store, "r1").await, 0);
    }

    #[tokio::test]
    async fn test_empty_recipient_list() {
        let (sender, _store) = sender_with(Vec::new(), &[]).await;

        let summary = sender.send_bulk(request(Vec::new(), 5)).await.unwrap();

        assert_eq!(summary.total_targeted, 0);
        assert!(summary.batches.is_empty());
        assert!(summary.results.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_pause_between_batches_only() {
        let recipients = roster(23);
        let provider = Arc::new(Recording::new("primary", 0)) as Arc<dyn Provider>;
        let (sender, _store) = sender_with(vec![provider], &recipients).await;

        let mut req = request(recipients, 5);
        req.rate_limit = 300;

        let started = tokio::time::Instant::now();
        sender.send_bulk(req).await.unwrap();
        let elapsed = started.elapsed();

        // Five batches, four one-second gaps, no trailing pause
        assert!(elapsed >= Duration::from_secs(4), "elapsed {:?}", elapsed);
        assert!(elapsed < Duration::from_secs(5), "elapsed {:?}", elapsed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_stops_at_batch_boundary() {
        let recipients = roster(10);
        let (tx, rx) = watch::channel(false);
        let provider = Arc::new(Recording::new("primary", 0).signalling(tx));
        let (sender, store) =
            sender_with(vec![provider.clone() as Arc<dyn Provider>], &recipients).await;

        let summary = sender
            .send_bulk_until(request(recipients, 4), rx)
            .await
            .unwrap();

        // The batch in flight when shutdown arrived is finished and recorded
        assert!(summary.cancelled);
        assert_eq!(summary.batches, vec![4]);
        assert_eq!(summary.total_targeted, 4);
        assert_eq!(summary.successful_count + summary.failed_count, 4);
        assert_eq!(provider.sent().len(), 4);
        assert_eq!(attempts(&store, "p3").await, 1);
        assert_eq!(attempts(&store, "p4").await, 0);
    }

    #[tokio::test]
    async fn test_shutdown_before_start_sends_nothing() {
        let recipients = roster(3);
        let provider = Arc::new(Recording::new("primary", 0));
        let (sender, _store) =
            sender_with(vec![provider.clone() as Arc<dyn Provider>], &recipients).await;
        let (tx, rx) = watch::channel(false);
        tx.send(true).unwrap();

        let summary = sender
            .send_bulk_until(request(recipients, 2), rx)
            .await
            .unwrap();

        assert!(summary.cancelled);
        assert_eq!(summary.total_targeted, 0);
        assert!(provider.sent().is_empty());
    }
}
