//! Failover dispatch across priority-ordered providers.
//!
//! ```text
//! dispatch(address, message)
//!   → provider[0].send()  failed  → provider[1].send()  sent → return
//!                                                      failed → ... → "All providers failed"
//! ```
//!
//! A provider that panics, or whose daily quota is used up, counts as a
//! failure of that provider only; the remaining providers are still tried.

use std::any::Any;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};

use chrono::{NaiveDate, Utc};
use futures::FutureExt;
use tracing::{error, info, warn};

use crate::error::DispatchError;
use crate::providers::{Provider, ProviderProfile};
use crate::types::{OutboundMessage, SendOutcome};

/// Error reported when every provider failed for a message.
pub const ALL_PROVIDERS_FAILED: &str = "All providers failed";

/// Error reported when the dispatcher has nothing to try.
pub const NO_PROVIDERS_CONFIGURED: &str = "No providers configured";

/// Sends counted against a provider's quota on a given UTC day.
#[derive(Debug, Clone, Copy)]
struct DailyUsage {
    day: NaiveDate,
    used: u32,
}

pub struct FailoverDispatcher {
    providers: Vec<Arc<dyn Provider>>,
    usage: Mutex<HashMap<String, DailyUsage>>,
}

impl FailoverDispatcher {
    /// Order providers by priority. Ties are rejected so failover order is total.
    pub fn new(mut providers: Vec<Arc<dyn Provider>>) -> Result<Self, DispatchError> {
        providers.sort_by_key(|p| p.profile().priority);

        for pair in providers.windows(2) {
            let (a, b) = (pair[0].profile(), pair[1].profile());
            if a.priority == b.priority {
                return Err(DispatchError::DuplicatePriority {
                    first: a.name.clone(),
                    second: b.name.clone(),
                    priority: a.priority,
                });
            }
        }

        Ok(Self {
            providers,
            usage: Mutex::new(HashMap::new()),
        })
    }

    /// Provider names in the order they are tried.
    pub fn provider_names(&self) -> Vec<&str> {
        self.providers.iter().map(|p| p.name()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    /// Sends left today for `provider`, or `None` if it has no quota.
    pub fn remaining_quota(&self, provider: &str) -> Option<u32> {
        let profile = self
            .providers
            .iter()
            .map(|p| p.profile())
            .find(|p| p.name == provider)?;
        let quota = profile.daily_quota?;

        let today = Utc::now().date_naive();
        let usage = self.usage.lock().unwrap_or_else(|e| e.into_inner());
        let used = usage
            .get(provider)
            .filter(|u| u.day == today)
            .map(|u| u.used)
            .unwrap_or(0);

        Some(quota.saturating_sub(used))
    }

    /// Try each provider in priority order until one reports `sent`.
    pub async fn dispatch(&self, address: &str, message: &OutboundMessage) -> SendOutcome {
        if self.providers.is_empty() {
            warn!("dispatch_no_providers");
            return SendOutcome::aggregate_failure(NO_PROVIDERS_CONFIGURED);
        }

        for provider in &self.providers {
            let profile = provider.profile();
            let today = Utc::now().date_naive();

            if !self.try_reserve(profile, today) {
                warn!(
                    provider = %profile.name,
                    daily_quota = ?profile.daily_quota,
                    "dispatch_provider_quota_exhausted"
                );
                continue;
            }

            let attempt = AssertUnwindSafe(provider.send(address, message))
                .catch_unwind()
                .await;

            match attempt {
                Ok(outcome) if outcome.is_sent() => {
                    info!(
                        provider = %profile.name,
                        message_id = ?outcome.message_id,
                        "dispatch_provider_sent"
                    );
                    return outcome;
                }
                Ok(outcome) => {
                    self.release(profile, today);
                    warn!(
                        provider = %profile.name,
                        error = ?outcome.error,
                        "dispatch_provider_failed"
                    );
                }
                Err(panic) => {
                    self.release(profile, today);
                    error!(
                        provider = %profile.name,
                        panic = %panic_message(panic.as_ref()),
                        "dispatch_provider_panicked"
                    );
                }
            }
        }

        warn!(
            providers_tried = self.providers.len(),
            "dispatch_all_providers_failed"
        );
        SendOutcome::aggregate_failure(ALL_PROVIDERS_FAILED)
    }

    /// Claim one send from the provider's daily quota for `today`.
    fn try_reserve(&self, profile: &ProviderProfile, today: NaiveDate) -> bool {
        let Some(quota) = profile.daily_quota else {
            return true;
        };

        let mut usage = self.usage.lock().unwrap_or_else(|e| e.into_inner());
        let entry = usage
            .entry(profile.name.clone())
            .or_insert(DailyUsage { day: today, used: 0 });

        if entry.day != today {
            *entry = DailyUsage { day: today, used: 0 };
        }

        if entry.used >= quota {
            return false;
        }

        entry.used += 1;
        true
    }

    /// Return a send claimed on `day` after the provider failed to deliver.
    ///
    /// Claims from a day that has since rolled over are already void.
    fn release(&self, profile: &ProviderProfile, day: NaiveDate) {
        if profile.daily_quota.is_none() {
            return;
        }

        let mut usage = self.usage.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(entry) = usage.get_mut(&profile.name).filter(|u| u.day == day) {
            entry.used = entry.used.saturating_sub(1);
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
