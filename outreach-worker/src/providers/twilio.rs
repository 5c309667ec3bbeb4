//! Twilio Programmable Messaging (SMS).
//!
//! Reference: https://www.twilio.com/docs/messaging/api/message-resource#create-a-message-resource

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use tracing::{info, warn};

use super::{preview, transport_failure, Provider, ProviderProfile};
use crate::address::parse_phone;
use crate::config::TwilioConfig;
use crate::types::{Channel, Cost, OutboundMessage, SendOutcome};

const PROVIDER_NAME: &str = "twilio";

/// Message resource returned on a successful create.
#[derive(Debug, Deserialize)]
struct TwilioMessage {
    sid: String,
    #[serde(default)]
    status: Option<String>,
    /// Negative decimal dollars, e.g. "-0.00790"; null until priced
    #[serde(default)]
    price: Option<String>,
    #[serde(default)]
    error_message: Option<String>,
}

/// Error body returned with 4xx/5xx responses.
#[derive(Debug, Deserialize)]
struct TwilioError {
    #[serde(default)]
    code: Option<u32>,
    #[serde(default)]
    message: Option<String>,
}

pub struct TwilioSms {
    profile: ProviderProfile,
    config: TwilioConfig,
    client: Client,
    country_code: String,
}

impl TwilioSms {
    pub fn new(config: TwilioConfig, priority: u32, client: Client, country_code: &str) -> Self {
        let mut profile =
            ProviderProfile::new(PROVIDER_NAME, Channel::Sms, priority).with_cost(config.cost);
        profile.daily_quota = config.daily_quota;

        Self {
            profile,
            config,
            client,
            country_code: country_code.to_string(),
        }
    }

    fn messages_url(&self) -> String {
        format!(
            "{}/2010-04-01/Accounts/{}/Messages.json",
            self.config.base_url.trim_end_matches('/'),
            self.config.account_sid
        )
    }
}

/// Translate a Twilio HTTP response into a [`SendOutcome`].
fn interpret_response(status: StatusCode, body: &str, default_cost: Cost) -> SendOutcome {
    if !status.is_success() {
        let detail = serde_json::from_str::<TwilioError>(body)
            .ok()
            .and_then(|e| match (e.code, e.message) {
                (Some(code), Some(msg)) => Some(format!("{} (code {})", msg, code)),
                (None, Some(msg)) => Some(msg),
                _ => None,
            })
            .unwrap_or_else(|| format!("HTTP {}: {}", status.as_u16(), preview(body)));

        return SendOutcome::failed(PROVIDER_NAME, detail);
    }

    let message: TwilioMessage = match serde_json::from_str(body) {
        Ok(m) => m,
        Err(e) => {
            return SendOutcome::failed(
                PROVIDER_NAME,
                format!("unreadable response: {}", e),
            )
        }
    };

    if let Some(state) = message.status.as_deref() {
        if state == "failed" || state == "undelivered" {
            let reason = message
                .error_message
                .unwrap_or_else(|| format!("message {}", state));
            return SendOutcome::failed(PROVIDER_NAME, reason);
        }
    }

    let cost = message
        .price
        .as_deref()
        .and_then(Cost::parse_dollars)
        .unwrap_or(default_cost);

    SendOutcome::sent(PROVIDER_NAME, message.sid, cost)
}

#[async_trait]
impl Provider for TwilioSms {
    fn profile(&self) -> &ProviderProfile {
        &self.profile
    }

    async fn send(&self, address: &str, message: &OutboundMessage) -> SendOutcome {
        let to = match parse_phone(address, &self.country_code) {
            Ok(to) => to,
            Err(e) => return SendOutcome::failed(PROVIDER_NAME, e.to_string()),
        };

        let form = [
            ("To", to.as_str()),
            ("From", self.config.from_number.as_str()),
            ("Body", message.body.as_str()),
        ];

        let response = self
            .client
            .post(self.messages_url())
            .basic_auth(&self.config.account_sid, Some(&self.config.auth_token))
            .form(&form)
            .send()
            .await;

        let response = match response {
            Ok(r) => r,
            Err(e) => return transport_failure(PROVIDER_NAME, e),
        };

        let status = response.status();
        let body = match response.text().await {
            Ok(b) => b,
            Err(e) => return transport_failure(PROVIDER_NAME, e),
        };

        let outcome = interpret_response(status, &body, self.profile.cost_per_message);

        if outcome.is_sent() {
            info!(
                provider = PROVIDER_NAME,
                message_id = ?outcome.message_id,
                cost_micros = outcome.cost.micros(),
                "twilio_message_created"
            );
        } else {
            warn!(
                provider = PROVIDER_NAME,
                status_code = status.as_u16(),
                error = ?outcome.error,
                "twilio_message_rejected"
            );
        }

        outcome
    }
}
