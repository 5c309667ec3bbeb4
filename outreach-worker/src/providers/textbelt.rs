//! Textbelt SMS API.
//!
//! Textbelt answers every request with a JSON body carrying a `success`
//! flag, so the HTTP status alone is not trusted.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use tracing::{info, warn};

use super::{preview, transport_failure, Provider, ProviderProfile};
use crate::address::parse_phone;
use crate::config::TextbeltConfig;
use crate::types::{Channel, Cost, OutboundMessage, SendOutcome};

const PROVIDER_NAME: &str = "textbelt";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TextbeltResponse {
    success: bool,
    #[serde(default)]
    text_id: Option<serde_json::Value>,
    #[serde(default)]
    quota_remaining: Option<i64>,
    #[serde(default)]
    error: Option<String>,
}

pub struct TextbeltSms {
    profile: ProviderProfile,
    config: TextbeltConfig,
    client: Client,
    country_code: String,
}

impl TextbeltSms {
    pub fn new(config: TextbeltConfig, priority: u32, client: Client, country_code: &str) -> Self {
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
}

fn interpret_response(status: StatusCode, body: &str, cost: Cost) -> SendOutcome {
    let parsed: TextbeltResponse = match serde_json::from_str(body) {
        Ok(p) => p,
        Err(_) => {
            return SendOutcome::failed(
                PROVIDER_NAME,
                format!("HTTP {}: {}", status.as_u16(), preview(body)),
            )
        }
    };

    if !parsed.success {
        return SendOutcome::failed(
            PROVIDER_NAME,
            parsed
                .error
                .unwrap_or_else(|| "send rejected without reason".to_string()),
        );
    }

    // textId arrives as a number or a string depending on the account type
    let message_id = match parsed.text_id {
        Some(serde_json::Value::String(s)) => s,
        Some(serde_json::Value::Number(n)) => n.to_string(),
        _ => return SendOutcome::failed(PROVIDER_NAME, "success reported without textId"),
    };

    if let Some(remaining) = parsed.quota_remaining {
        info!(provider = PROVIDER_NAME, quota_remaining = remaining, "textbelt_quota");
    }

    SendOutcome::sent(PROVIDER_NAME, message_id, cost)
}

#[async_trait]
impl Provider for TextbeltSms {
    fn profile(&self) -> &ProviderProfile {
        &self.profile
    }

    async fn send(&self, address: &str, message: &OutboundMessage) -> SendOutcome {
        let phone = match parse_phone(address, &self.country_code) {
            Ok(p) => p,
            Err(e) => return SendOutcome::failed(PROVIDER_NAME, e.to_string()),
        };

        let form = [
            ("phone", phone.as_str()),
            ("message", message.body.as_str()),
            ("key", self.config.api_key.as_str()),
        ];

        let url = format!("{}/text", self.config.base_url.trim_end_matches('/'));
        let response = match self.client.post(url).form(&form).send().await {
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
                "textbelt_message_sent"
            );
        } else {
            warn!(
                provider = PROVIDER_NAME,
                status_code = status.as_u16(),
                error = ?outcome.error,
                "textbelt_message_rejected"
            );
        }

        outcome
    }
}
