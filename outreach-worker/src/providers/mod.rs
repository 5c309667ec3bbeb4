//! Delivery provider adapters.
//!
//! Every backend implements [`Provider`]. Adapters normalize the address,
//! translate the backend's native response into a [`SendOutcome`] and never
//! return an error: every failure is data the failover dispatcher can act on.
//!
//! ```text
//! FailoverDispatcher → Provider::send() → Twilio | Textbelt | SendGrid | Mailgun
//! ```

pub mod mailgun;
pub mod sendgrid;
pub mod textbelt;
pub mod twilio;

use std::sync::Arc;

use async_trait::async_trait;
use reqwest::Client;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::types::{Channel, Cost, OutboundMessage, SendOutcome};

pub use mailgun::MailgunEmail;
pub use sendgrid::SendGridEmail;
pub use textbelt::TextbeltSms;
pub use twilio::TwilioSms;

/// Static description of a provider, set from configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderProfile {
    pub name: String,
    /// Lower values are tried first
    pub priority: u32,
    pub cost_per_message: Cost,
    /// Maximum sends per UTC day; `None` means unlimited
    pub daily_quota: Option<u32>,
    pub channel: Channel,
}

impl ProviderProfile {
    pub fn new(name: impl Into<String>, channel: Channel, priority: u32) -> Self {
        Self {
            name: name.into(),
            priority,
            cost_per_message: Cost::ZERO,
            daily_quota: None,
            channel,
        }
    }

    pub fn with_cost(mut self, cost: Cost) -> Self {
        self.cost_per_message = cost;
        self
    }

    pub fn with_daily_quota(mut self, quota: u32) -> Self {
        self.daily_quota = Some(quota);
        self
    }
}

/// Uniform interface over delivery backends.
#[async_trait]
pub trait Provider: Send + Sync {
    fn profile(&self) -> &ProviderProfile;

    fn name(&self) -> &str {
        &self.profile().name
    }

    /// Deliver `message` to `address`.
    ///
    /// Malformed addresses fail before any network call.
    async fn send(&self, address: &str, message: &OutboundMessage) -> SendOutcome;
}

/// Build a failed outcome from a transport-level reqwest error.
pub(crate) fn transport_failure(provider: &str, e: reqwest::Error) -> SendOutcome {
    if e.is_timeout() {
        error!(provider = provider, error = %e, "provider_request_timeout");
        SendOutcome::failed(provider, format!("request timed out: {}", e))
    } else if e.is_connect() {
        error!(provider = provider, error = %e, "provider_connect_error");
        SendOutcome::failed(provider, format!("connection failed: {}", e))
    } else {
        error!(provider = provider, error = %e, "provider_request_error");
        SendOutcome::failed(provider, format!("request failed: {}", e))
    }
}

/// Truncate a response body for error messages and logs.
pub(crate) fn preview(body: &str) -> &str {
    let mut end = body.len().min(200);
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    &body[..end]
}

/// Instantiate every configured backend for `channel`.
///
/// Priorities follow the position of each name in the channel's configured
/// provider order. Names without credentials, unknown names and names that
/// belong to the other channel are skipped with a warning.
pub fn build_providers(config: &Config, channel: Channel, client: &Client) -> Vec<Arc<dyn Provider>> {
    let order = match channel {
        Channel::Sms => &config.sms_provider_order,
        Channel::Email => &config.email_provider_order,
    };

    let mut providers: Vec<Arc<dyn Provider>> = Vec::new();

    for (index, name) in order.iter().enumerate() {
        let priority = index as u32;
        let name = name.to_lowercase();

        let provider: Option<Arc<dyn Provider>> = match (channel, name.as_str()) {
            (Channel::Sms, "twilio") => config.twilio.as_ref().map(|c| {
                Arc::new(TwilioSms::new(
                    c.clone(),
                    priority,
                    client.clone(),
                    &config.default_country_code,
                )) as Arc<dyn Provider>
            }),
            (Channel::Sms, "textbelt") => config.textbelt.as_ref().map(|c| {
                Arc::new(TextbeltSms::new(
                    c.clone(),
                    priority,
                    client.clone(),
                    &config.default_country_code,
                )) as Arc<dyn Provider>
            }),
            (Channel::Email, "sendgrid") => config.sendgrid.as_ref().map(|c| {
                Arc::new(SendGridEmail::new(c.clone(), priority, client.clone())) as Arc<dyn Provider>
            }),
            (Channel::Email, "mailgun") => config.mailgun.as_ref().map(|c| {
                Arc::new(MailgunEmail::new(c.clone(), priority, client.clone())) as Arc<dyn Provider>
            }),
            _ => {
                warn!(
                    channel = %channel,
                    provider = %name,
                    "provider_unknown_for_channel"
                );
                continue;
            }
        };

        match provider {
            Some(p) => {
                info!(
                    channel = %channel,
                    provider = %name,
                    priority = priority,
                    cost_micros = p.profile().cost_per_message.micros(),
                    daily_quota = ?p.profile().daily_quota,
                    "provider_registered"
                );
                providers.push(p);
            }
            None => {
                warn!(channel = %channel, provider = %name, "provider_not_configured");
            }
        }
    }

    providers
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{MailgunConfig, SendGridConfig, TextbeltConfig, TwilioConfig};

    fn config_with_all_backends() -> Config {
        let mut config = Config::default();
        config.twilio = Some(TwilioConfig {
            account_sid: "AC123".to_string(),
            auth_token: "secret".to_string(),
            from_number: "+15550000000".to_string(),
            base_url: "https://api.twilio.com".to_string(),
            cost: Cost(7_900),
            daily_quota: None,
        });
        config.textbelt = Some(TextbeltConfig {
            api_key: "textbelt".to_string(),
            base_url: "https://textbelt.com".to_string(),
            cost: Cost::ZERO,
            daily_quota: Some(1),
        });
        config.sendgrid = Some(SendGridConfig {
            api_key: "SG.key".to_string(),
            from_email: "team@example.com".to_string(),
            base_url: "https://api.sendgrid.com".to_string(),
            cost: Cost(1_000),
            daily_quota: None,
        });
        config.mailgun = Some(MailgunConfig {
            api_key: "key".to_string(),
            domain: "mg.example.com".to_string(),
            from: "team@mg.example.com".to_string(),
            base_url: "https://api.mailgun.net".to_string(),
            cost: Cost(800),
            daily_quota: None,
        });
        config
    }

    #[test]
    fn test_build_providers_follows_configured_order() {
        let mut config = config_with_all_backends();
        config.sms_provider_order = vec!["textbelt".to_string(), "twilio".to_string()];

        let providers = build_providers(&config, Channel::Sms, &Client::new());

        let names: Vec<_> = providers.iter().map(|p| p.name().to_string()).collect();
        assert_eq!(names, vec!["textbelt", "twilio"]);
        assert_eq!(providers[0].profile().priority, 0);
        assert_eq!(providers[1].profile().priority, 1);
        assert_eq!(providers[0].profile().daily_quota, Some(1));
    }

    #[test]
    fn test_build_providers_skips_unconfigured_and_foreign() {
        let mut config = config_with_all_backends();
        config.sendgrid = None;
        config.email_provider_order = vec![
            "sendgrid".to_string(),
            "twilio".to_string(),
            "MAILGUN".to_string(),
        ];

        let providers = build_providers(&config, Channel::Email, &Client::new());

        assert_eq!(providers.len(), 1);
        assert_eq!(providers[0].name(), "mailgun");
        assert_eq!(providers[0].profile().priority, 2);
        assert_eq!(providers[0].profile().channel, Channel::Email);
    }

    #[test]
    fn test_preview_respects_char_boundaries() {
        let body = "é".repeat(150);
        let p = preview(&body);
        assert!(p.len() <= 200);
        assert!(body.starts_with(p));
    }
}
