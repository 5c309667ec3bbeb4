//! SendGrid v3 Mail Send API.

use async_trait::async_trait;
use reqwest::{header::HeaderMap, Client, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::{preview, transport_failure, Provider, ProviderProfile};
use crate::address::parse_email;
use crate::config::SendGridConfig;
use crate::types::{Channel, Cost, OutboundMessage, SendOutcome};

const PROVIDER_NAME: &str = "sendgrid";

#[derive(Debug, Serialize)]
struct MailSendRequest<'a> {
    personalizations: Vec<Personalization<'a>>,
    from: EmailAddress<'a>,
    subject: &'a str,
    content: Vec<Content<'a>>,
}

#[derive(Debug, Serialize)]
struct Personalization<'a> {
    to: Vec<EmailAddress<'a>>,
}

#[derive(Debug, Serialize)]
struct EmailAddress<'a> {
    email: &'a str,
}

#[derive(Debug, Serialize)]
struct Content<'a> {
    #[serde(rename = "type")]
    content_type: &'a str,
    value: &'a str,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    errors: Vec<ErrorItem>,
}

#[derive(Debug, Deserialize)]
struct ErrorItem {
    #[serde(default)]
    message: Option<String>,
}

pub struct SendGridEmail {
    profile: ProviderProfile,
    config: SendGridConfig,
    client: Client,
}

impl SendGridEmail {
    pub fn new(config: SendGridConfig, priority: u32, client: Client) -> Self {
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

fn build_request<'a>(from: &'a str, to: &'a str, message: &'a OutboundMessage) -> MailSendRequest<'a> {
    MailSendRequest {
        personalizations: vec![Personalization {
            to: vec![EmailAddress { email: to }],
        }],
        from: EmailAddress { email: from },
        subject: message.subject.as_deref().unwrap_or_default(),
        content: vec![Content {
            content_type: "text/plain",
            value: &message.body,
        }],
    }
}

/// SendGrid accepts with `202` and an empty body; the id is in a header.
fn interpret_response(status: StatusCode, headers: &HeaderMap, body: &str, cost: Cost) -> SendOutcome {
    if status.is_success() {
        let message_id = headers
            .get("X-Message-Id")
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string())
            .unwrap_or_else(|| format!("sendgrid-{}", status.as_u16()));

        return SendOutcome::sent(PROVIDER_NAME, message_id, cost);
    }

    let detail = serde_json::from_str::<ErrorBody>(body)
        .ok()
        .map(|b| {
            b.errors
                .into_iter()
                .filter_map(|e| e.message)
                .collect::<Vec<_>>()
                .join("; ")
        })
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| format!("HTTP {}: {}", status.as_u16(), preview(body)));

    SendOutcome::failed(PROVIDER_NAME, detail)
}

#[async_trait]
impl Provider for SendGridEmail {
    fn profile(&self) -> &ProviderProfile {
        &self.profile
    }

    async fn send(&self, address: &str, message: &OutboundMessage) -> SendOutcome {
        let to = match parse_email(address) {
            Ok(to) => to,
            Err(e) => return SendOutcome::failed(PROVIDER_NAME, e.to_string()),
        };

        let request = build_request(&self.config.from_email, &to, message);
        let url = format!("{}/v3/mail/send", self.config.base_url.trim_end_matches('/'));

        let response = match self
            .client
            .post(url)
            .bearer_auth(&self.config.api_key)
            .json(&request)
            .send()
            .await
        {
            Ok(r) => r,
            Err(e) => return transport_failure(PROVIDER_NAME, e),
        };

        let status = response.status();
        let headers = response.headers().clone();
        let body = response.text().await.unwrap_or_default();

        let outcome = interpret_response(status, &headers, &body, self.profile.cost_per_message);

        if outcome.is_sent() {
            info!(
                provider = PROVIDER_NAME,
                message_id = ?outcome.message_id,
                "sendgrid_mail_accepted"
            );
        } else {
            warn!(
                provider = PROVIDER_NAME,
                status_code = status.as_u16(),
                error = ?outcome.error,
                "sendgrid_mail_rejected"
            );
        }

        outcome
    }
}
