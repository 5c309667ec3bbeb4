//! Core domain types shared by the dispatch pipeline.
//!
//! Recipients, delivery outcomes and campaign summaries. Everything here is
//! serializable so it can travel over the queues unchanged.

use std::collections::BTreeMap;
use std::fmt;
use std::iter::Sum;
use std::ops::{Add, AddAssign};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// =============================================================================
// Channel
// =============================================================================

/// Delivery channel for a campaign.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    Email,
    Sms,
}

impl Channel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Email => "email",
            Channel::Sms => "sms",
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Cost
// =============================================================================

/// Monetary cost in integer micro-dollars (1 = 0.000001 USD).
///
/// Provider adapters convert whatever their backend reports into this unit.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Cost(pub u64);

impl Cost {
    pub const ZERO: Cost = Cost(0);

    pub fn from_micros(micros: u64) -> Self {
        Cost(micros)
    }

    pub fn micros(&self) -> u64 {
        self.0
    }

    /// Parse a decimal dollar amount such as `"-0.00750"` or `"0.0079"`.
    ///
    /// The sign is ignored (Twilio reports charges as negative prices) and
    /// digits beyond the sixth decimal place are truncated.
    pub fn parse_dollars(raw: &str) -> Option<Self> {
        let trimmed = raw.trim().trim_start_matches(['-', '+']);
        if trimmed.is_empty() {
            return None;
        }

        let (whole, frac) = match trimmed.split_once('.') {
            Some((w, f)) => (w, f),
            None => (trimmed, ""),
        };

        if !whole.chars().all(|c| c.is_ascii_digit()) || !frac.chars().all(|c| c.is_ascii_digit())
        {
            return None;
        }

        let whole: u64 = if whole.is_empty() { 0 } else { whole.parse().ok()? };
        let mut frac_digits: String = frac.chars().take(6).collect();
        while frac_digits.len() < 6 {
            frac_digits.push('0');
        }
        let frac: u64 = frac_digits.parse().ok()?;

        Some(Cost(whole.checked_mul(1_000_000)?.checked_add(frac)?))
    }
}

impl Add for Cost {
    type Output = Cost;

    fn add(self, rhs: Cost) -> Cost {
        Cost(self.0.saturating_add(rhs.0))
    }
}

impl AddAssign for Cost {
    fn add_assign(&mut self, rhs: Cost) {
        self.0 = self.0.saturating_add(rhs.0);
    }
}

impl Sum for Cost {
    fn sum<I: Iterator<Item = Cost>>(iter: I) -> Cost {
        iter.fold(Cost::ZERO, |acc, c| acc + c)
    }
}

impl fmt::Display for Cost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "${}.{:06}", self.0 / 1_000_000, self.0 % 1_000_000)
    }
}

// =============================================================================
// Recipients
// =============================================================================

/// Persisted outreach history for a recipient.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContactState {
    /// Last campaign that touched this recipient
    #[serde(default)]
    pub campaign_id: Option<String>,
    /// Number of dispatch attempts, sent or failed
    #[serde(default)]
    pub contact_attempts: u32,
    #[serde(default)]
    pub last_contact_date: Option<DateTime<Utc>>,
    /// Once set, never cleared by this subsystem
    #[serde(default)]
    pub unsubscribed: bool,
}

/// A campaign target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recipient {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
    /// Template-fill fields (sport, position, school, state, ...)
    #[serde(default)]
    pub fields: BTreeMap<String, String>,
    #[serde(default)]
    pub contact: ContactState,
}

impl Recipient {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            email: None,
            phone: None,
            fields: BTreeMap::new(),
            contact: ContactState::default(),
        }
    }

    pub fn with_email(mut self, email: impl Into<String>) -> Self {
        self.email = Some(email.into());
        self
    }

    pub fn with_phone(mut self, phone: impl Into<String>) -> Self {
        self.phone = Some(phone.into());
        self
    }

    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    /// The raw address used on the given channel, if any.
    ///
    /// Blank strings count as missing.
    pub fn address_for(&self, channel: Channel) -> Option<&str> {
        let raw = match channel {
            Channel::Email => self.email.as_deref(),
            Channel::Sms => self.phone.as_deref(),
        };
        raw.filter(|s| !s.trim().is_empty())
    }

    /// Fields available to the template renderer, `name` included.
    pub fn template_fields(&self) -> BTreeMap<String, String> {
        let mut fields = self.fields.clone();
        if !self.name.trim().is_empty() {
            fields
                .entry("name".to_string())
                .or_insert_with(|| self.name.clone());
        }
        fields
    }
}

// =============================================================================
// Messages
// =============================================================================

/// Caller-owned message template. Either part may contain `{field}` tokens.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageTemplate {
    #[serde(default)]
    pub subject: Option<String>,
    pub body: String,
}

impl MessageTemplate {
    pub fn new(body: impl Into<String>) -> Self {
        Self {
            subject: None,
            body: body.into(),
        }
    }

    pub fn with_subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }
}

/// A rendered, per-recipient message ready for a provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub subject: Option<String>,
    pub body: String,
}

impl OutboundMessage {
    pub fn text(body: impl Into<String>) -> Self {
        Self {
            subject: None,
            body: body.into(),
        }
    }
}

// =============================================================================
// Outcomes
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    Sent,
    Failed,
}

/// Outcome of handing one message to one provider (or to the failover chain).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendOutcome {
    /// Provider that produced this outcome; `None` when no provider ran
    pub provider: Option<String>,
    pub status: DeliveryStatus,
    pub message_id: Option<String>,
    pub error: Option<String>,
    pub cost: Cost,
}

impl SendOutcome {
    pub fn sent(provider: &str, message_id: impl Into<String>, cost: Cost) -> Self {
        Self {
            provider: Some(provider.to_string()),
            status: DeliveryStatus::Sent,
            message_id: Some(message_id.into()),
            error: None,
            cost,
        }
    }

    pub fn failed(provider: &str, error: impl Into<String>) -> Self {
        Self {
            provider: Some(provider.to_string()),
            status: DeliveryStatus::Failed,
            message_id: None,
            error: Some(error.into()),
            cost: Cost::ZERO,
        }
    }

    /// A failure not attributable to any single provider.
    pub fn aggregate_failure(error: impl Into<String>) -> Self {
        Self {
            provider: None,
            status: DeliveryStatus::Failed,
            message_id: None,
            error: Some(error.into()),
            cost: Cost::ZERO,
        }
    }

    pub fn is_sent(&self) -> bool {
        self.status == DeliveryStatus::Sent
    }
}

/// Per-recipient outcome of a dispatch run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryResult {
    pub recipient_id: String,
    pub provider_used: Option<String>,
    pub status: DeliveryStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub cost: Cost,
}

impl DeliveryResult {
    pub fn from_outcome(recipient_id: impl Into<String>, outcome: SendOutcome) -> Self {
        Self {
            recipient_id: recipient_id.into(),
            provider_used: outcome.provider,
            status: outcome.status,
            message_id: outcome.message_id,
            error: outcome.error,
            cost: outcome.cost,
        }
    }

    pub fn is_sent(&self) -> bool {
        self.status == DeliveryStatus::Sent
    }
}

/// A recipient left out of a run before any dispatch attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkippedRecipient {
    pub recipient_id: String,
    pub reason: String,
}

/// Aggregate over one dispatch run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CampaignSummary {
    pub campaign_id: String,
    pub channel: Channel,
    pub total_targeted: usize,
    pub successful_count: usize,
    pub failed_count: usize,
    pub total_cost: Cost,
    pub results: Vec<DeliveryResult>,
    pub skipped: Vec<SkippedRecipient>,
    /// Batch sizes in execution order
    pub batches: Vec<usize>,
    pub cancelled: bool,
    /// Contact-state writes the store rejected
    pub ledger_errors: usize,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl CampaignSummary {
    pub fn result_for(&self, recipient_id: &str) -> Option<&DeliveryResult> {
        self.results.iter().find(|r| r.recipient_id == recipient_id)
    }
}
