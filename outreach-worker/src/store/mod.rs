//! Persistence collaborator for recipient contact state.
//!
//! The dispatch pipeline only needs per-recipient atomic reads and writes;
//! [`ContactStore`] captures that contract. [`PgContactStore`] keeps it in
//! Postgres; [`InMemoryContactStore`] serves single-process runs and tests.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::address::normalize_email;
use crate::error::{StoreError, StoreResult};
use crate::types::{ContactState, Recipient};

pub mod postgres;

pub use postgres::PgContactStore;

/// Attempt bookkeeping applied after one dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContactUpdate {
    pub campaign_id: Option<String>,
    pub contacted_at: DateTime<Utc>,
}

/// Selection criteria for recipients.
#[derive(Debug, Clone, Default)]
pub struct RecipientFilter {
    /// Restrict to these ids; `None` selects everyone
    pub ids: Option<Vec<String>>,
    pub include_unsubscribed: bool,
    /// Every listed field must match exactly
    pub fields: BTreeMap<String, String>,
}

impl RecipientFilter {
    pub fn ids(ids: impl IntoIterator<Item = String>) -> Self {
        Self {
            ids: Some(ids.into_iter().collect()),
            ..Default::default()
        }
    }

    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    fn matches(&self, recipient: &Recipient) -> bool {
        if !self.include_unsubscribed && recipient.contact.unsubscribed {
            return false;
        }

        if let Some(ids) = &self.ids {
            if !ids.iter().any(|id| id == &recipient.id) {
                return false;
            }
        }

        self.fields
            .iter()
            .all(|(k, v)| recipient.fields.get(k) == Some(v))
    }
}

/// Recipient persistence. Each call is atomic per recipient.
#[async_trait]
pub trait ContactStore: Send + Sync {
    async fn fetch_recipient(&self, id: &str) -> StoreResult<Option<Recipient>>;

    async fn fetch_recipients(&self, filter: &RecipientFilter) -> StoreResult<Vec<Recipient>>;

    /// Insert new recipients and refresh identity fields of existing ones.
    ///
    /// Existing contact state is never overwritten by an import.
    async fn upsert_recipients(&self, recipients: &[Recipient]) -> StoreResult<usize>;

    /// Increment attempts and stamp the contact date; returns the new state.
    async fn record_contact(&self, id: &str, update: &ContactUpdate) -> StoreResult<ContactState>;

    /// Flag every recipient reachable at `address`. Returns whether any matched.
    async fn mark_unsubscribed(&self, address: &str) -> StoreResult<bool>;
}

/// Process-local store backed by a `RwLock<HashMap>`.
#[derive(Clone, Default)]
pub struct InMemoryContactStore {
    inner: Arc<RwLock<HashMap<String, Recipient>>>,
}

impl InMemoryContactStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.is_empty()
    }
}

const NATIONAL_DIGITS: usize = 10;

fn national_number(digits: &str) -> Option<&str> {
    (digits.len() >= NATIONAL_DIGITS).then(|| &digits[digits.len() - NATIONAL_DIGITS..])
}

/// Whether `recipient` is reachable at the (already normalized) address.
fn reachable_at(recipient: &Recipient, email: &str, phone_digits: &str) -> bool {
    let email_match = recipient
        .email
        .as_deref()
        .map(|e| normalize_email(e) == email)
        .unwrap_or(false);

    // Compare the trailing national number so "+1555..." matches "555...".
    let phone_match = recipient
        .phone
        .as_deref()
        .map(|p| {
            let digits: String = p.chars().filter(|c| c.is_ascii_digit()).collect();
            match (national_number(&digits), national_number(phone_digits)) {
                (Some(a), Some(b)) => a == b,
                _ => false,
            }
        })
        .unwrap_or(false);

    email_match || phone_match
}

#[async_trait]
impl ContactStore for InMemoryContactStore {
    async fn fetch_recipient(&self, id: &str) -> StoreResult<Option<Recipient>> {
        Ok(self.inner.read().await.get(id).cloned())
    }

    async fn fetch_recipients(&self, filter: &RecipientFilter) -> StoreResult<Vec<Recipient>> {
        let guard = self.inner.read().await;

        let mut selected: Vec<Recipient> = match &filter.ids {
            // Preserve the caller's ordering when ids are given.
            Some(ids) => ids
                .iter()
                .filter_map(|id| guard.get(id))
                .filter(|r| filter.matches(r))
                .cloned()
                .collect(),
            None => guard.values().filter(|r| filter.matches(r)).cloned().collect(),
        };

        if filter.ids.is_none() {
            selected.sort_by(|a, b| a.id.cmp(&b.id));
        }

        Ok(selected)
    }

    async fn upsert_recipients(&self, recipients: &[Recipient]) -> StoreResult<usize> {
        let mut guard = self.inner.write().await;
        let mut inserted = 0;

        for incoming in recipients {
            match guard.get_mut(&incoming.id) {
                Some(existing) => {
                    existing.name = incoming.name.clone();
                    existing.email = incoming.email.clone();
                    existing.phone = incoming.phone.clone();
                    existing.fields = incoming.fields.clone();
                    // An import may carry an unsubscribe, never a resubscribe.
                    existing.contact.unsubscribed |= incoming.contact.unsubscribed;
                }
                None => {
                    guard.insert(incoming.id.clone(), incoming.clone());
                    inserted += 1;
                }
            }
        }

        debug!(received = recipients.len(), inserted = inserted, "store_upsert_complete");
        Ok(inserted)
    }

    async fn record_contact(&self, id: &str, update: &ContactUpdate) -> StoreResult<ContactState> {
        let mut guard = self.inner.write().await;
        let recipient = guard
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;

        let contact = &mut recipient.contact;
        contact.contact_attempts = contact.contact_attempts.saturating_add(1);
        contact.last_contact_date = Some(update.contacted_at);
        if let Some(campaign_id) = &update.campaign_id {
            contact.campaign_id = Some(campaign_id.clone());
        }

        Ok(contact.clone())
    }

    async fn mark_unsubscribed(&self, address: &str) -> StoreResult<bool> {
        let email = normalize_email(address);
        let phone_digits: String = if address.contains('@') {
            String::new()
        } else {
            address.chars().filter(|c| c.is_ascii_digit()).collect()
        };

        let mut guard = self.inner.write().await;
        let mut matched = false;

        for recipient in guard.values_mut() {
            if reachable_at(recipient, &email, &phone_digits) {
                recipient.contact.unsubscribed = true;
                matched = true;
                info!(recipient_id = %recipient.id, "store_recipient_unsubscribed");
            }
        }

        Ok(matched)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recipients() -> Vec<Recipient> {
        vec![
            Recipient::new("r1", "Jo")
                .with_email("jo@example.com")
                .with_field("sport", "Soccer"),
            Recipient::new("r2", "Sam")
                .with_phone("555-123-4567")
                .with_field("sport", "Track"),
            Recipient::new("r3", "Alex")
                .with_email("alex@example.com")
                .with_field("sport", "Soccer"),
        ]
    }

    #[tokio::test]
    async fn test_upsert_and_fetch() {
        let store = InMemoryContactStore::new();
        assert_eq!(store.upsert_recipients(&recipients()).await.unwrap(), 3);
        assert_eq!(store.upsert_recipients(&recipients()).await.unwrap(), 0);
        assert_eq!(store.len().await, 3);

        let soccer = store
            .fetch_recipients(&RecipientFilter::default().with_field("sport", "Soccer"))
            .await
            .unwrap();
        let ids: Vec<_> = soccer.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["r1", "r3"]);
    }

    #[tokio::test]
    async fn test_fetch_by_ids_preserves_order() {
        let store = InMemoryContactStore::new();
        store.upsert_recipients(&recipients()).await.unwrap();

        let picked = store
            .fetch_recipients(&RecipientFilter::ids(vec![
                "r3".to_string(),
                "missing".to_string(),
                "r1".to_string(),
            ]))
            .await
            .unwrap();
        let ids: Vec<_> = picked.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["r3", "r1"]);
    }

    #[tokio::test]
    async fn test_record_contact_increments_once() {
        let store = InMemoryContactStore::new();
        store.upsert_recipients(&recipients()).await.unwrap();

        let now = Utc::now();
        let state = store
            .record_contact(
                "r1",
                &ContactUpdate {
                    campaign_id: Some("spring".to_string()),
                    contacted_at: now,
                },
            )
            .await
            .unwrap();

        assert_eq!(state.contact_attempts, 1);
        assert_eq!(state.last_contact_date, Some(now));
        assert_eq!(state.campaign_id.as_deref(), Some("spring"));

        let missing = store
            .record_contact(
                "nobody",
                &ContactUpdate {
                    campaign_id: None,
                    contacted_at: now,
                },
            )
            .await;
        assert_eq!(missing, Err(StoreError::NotFound("nobody".to_string())));
    }

    #[tokio::test]
    async fn test_unsubscribe_survives_reimport() {
        let store = InMemoryContactStore::new();
        store.upsert_recipients(&recipients()).await.unwrap();

        assert!(store.mark_unsubscribed("JO@example.com ").await.unwrap());
        store.upsert_recipients(&recipients()).await.unwrap();

        let r1 = store.fetch_recipient("r1").await.unwrap().unwrap();
        assert!(r1.contact.unsubscribed);

        let eligible = store
            .fetch_recipients(&RecipientFilter::default())
            .await
            .unwrap();
        assert!(eligible.iter().all(|r| r.id != "r1"));
    }

    #[tokio::test]
    async fn test_unsubscribe_by_phone_ignores_formatting() {
        let store = InMemoryContactStore::new();
        store.upsert_recipients(&recipients()).await.unwrap();

        assert!(store.mark_unsubscribed("+1 (555) 123-4567").await.unwrap());
        assert!(!store.mark_unsubscribed("nobody@example.com").await.unwrap());

        let r2 = store.fetch_recipient("r2").await.unwrap().unwrap();
        assert!(r2.contact.unsubscribed);
    }
}
