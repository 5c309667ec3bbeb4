//! Mailgun Messages API.
//!
//! Mailgun takes form-encoded messages and authenticates with HTTP basic
//! auth using the literal username `api`.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use tracing::{info, warn};

use super::{preview, transport_failure, Provider, ProviderProfile};
use crate::address::parse_email;
use crate::config::MailgunConfig;
use crate::types::{Channel, Cost, OutboundMessage, SendOutcome};

const PROVIDER_NAME: &str = "mailgun";

#[derive(Debug, Deserialize)]
struct MailgunResponse {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

pub struct MailgunEmail {
    profile: ProviderProfile,
    config: MailgunConfig,
    client: Client,
}

impl MailgunEmail {
    pub fn new(config: MailgunConfig, priority: u32, client: Client) -> Self {
        let mut profile =
            ProviderProfile::new(PROVIDER_NAME, Channel::Email, priority).with_cost(config.cost);
        profile.daily_quota = config.daily_quota;

        Self {
            profile,
            config,
            client,
        }
    }
}

fn interpret_response(status: StatusCode, body: &str, cost: Cost) -> SendOutcome {
    let parsed = serde_json::from_str::<MailgunResponse>(body).ok();

    if !status.is_success() {
        let detail = parsed
            .and_then(|p| p.message)
            .unwrap_or_else(|| format!("HTTP {}: {}", status.as_u16(), preview(body)));
        return SendOutcome::failed(PROVIDER_NAME, detail);
    }

    match parsed.and_then(|p| p.id) {
        Some(id) => {
            let id = id.trim_matches(|c| c == '<' || c == '>').to_string();
            SendOutcome::sent(PROVIDER_NAME, id, cost)
        }
        None => SendOutcome::failed(PROVIDER_NAME, "accepted without message id"),
    }
}

#[async_trait]
impl Provider for MailgunEmail {
    fn profile(&self) -> &ProviderProfile {
        &self.profile
    }

    async fn send(&self, address: &str, message: &OutboundMessage) -> SendOutcome {
        let to = match parse_email(address) {
            Ok(to) => to,
            Err(e) => return SendOutcome::failed(PROVIDER_NAME, e.to_string()),
        };

        let form = [
            ("from", self.config.from.as_str()),
            ("to", to.as_str()),
            ("subject", message.subject.as_deref().unwrap_or_default()),
            ("text", message.body.as_str()),
        ];

        let url = format!(
            "{}/v3/{}/messages",
            self.config.base_url.trim_end_matches('/'),
            self.config.domain
        );

        let response = match self
            .client
            .post(url)
            .basic_auth("api", Some(&self.config.api_key))
            .form(&form)
            .send()
            .await
        {
            Ok(r) => r,
            Err(e) => return transport_failure(PROVIDER_NAME, e),
        };

        let status = response.status();
        let body = response.text().await.unwrap_or_default();

        let outcome = interpret_response(status, &body, self.profile.cost_per_message);

        if outcome.is_sent() {
            info!(
                provider = PROVIDER_NAME,
                message_id = ?outcome.message_id,
                "mailgun_message_queued"
            );
        } else {
            warn!(
                provider = PROVIDER_NAME,
                status_code = status.as_u16(),
                error = ?outcome.error,
                "mailgun_message_rejected"
            );
        }

        outcome
    }
}
