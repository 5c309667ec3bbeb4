//! Intake endpoint handlers.
//!
//! These handlers only authenticate, validate the envelope and enqueue.
//! Campaigns run in the worker.

use std::sync::Arc;

use axum::{
    extract::{Form, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    Json,
};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::queue::{CampaignJob, OutreachJob, Publisher, UnsubscribeJob};
use crate::types::Channel;
use crate::web::signature::{signing_key, verify_bearer_token, MailgunSignature};
use crate::Config;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub publisher: Publisher,
}

impl AppState {
    pub fn new(config: Config, publisher: Publisher) -> Self {
        Self {
            config: Arc::new(config),
            publisher,
        }
    }
}

// =============================================================================
// Health Check
// =============================================================================

/// Health check response.
#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
}

/// Health check endpoint.
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

/// Response body shared by the intake endpoints.
#[derive(Debug, Serialize)]
pub struct IntakeResponse {
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub campaign_id: Option<String>,
}

impl IntakeResponse {
    fn status(status: &'static str) -> Json<Self> {
        Json(Self {
            status,
            campaign_id: None,
        })
    }
}

// =============================================================================
// Campaign Submission
// =============================================================================

/// Reasons a submitted campaign is rejected before it is enqueued.
pub fn validate_campaign(job: &CampaignJob) -> Result<(), &'static str> {
    if job.campaign_id.trim().is_empty() {
        return Err("missing_campaign_id");
    }
    if job.template.body.trim().is_empty() {
        return Err("empty_template");
    }
    let has_subject = job
        .template
        .subject
        .as_deref()
        .is_some_and(|s| !s.trim().is_empty());
    if job.channel == Channel::Email && !has_subject {
        return Err("missing_subject");
    }
    if job.rate_limit == Some(0) {
        return Err("invalid_rate_limit");
    }
    if job.batch_size == Some(0) {
        return Err("invalid_batch_size");
    }
    Ok(())
}

/// Campaign submission endpoint.
///
/// Requires `Authorization: Bearer <token>` when an API token is configured.
/// Returns 202 once the job is on the queue.
pub async fn create_campaign(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(job): Json<CampaignJob>,
) -> impl IntoResponse {
    info!(
        campaign_id = %job.campaign_id,
        channel = %job.channel,
        recipients = job.recipients.len(),
        "campaign_submission_received"
    );

    match state.config.api_token.as_deref() {
        Some(expected) => {
            let provided = headers
                .get(axum::http::header::AUTHORIZATION)
                .and_then(|v| v.to_str().ok());
            if !verify_bearer_token(provided, expected) {
                warn!(
                    campaign_id = %job.campaign_id,
                    has_header = provided.is_some(),
                    "campaign_auth_invalid"
                );
                return (StatusCode::UNAUTHORIZED, IntakeResponse::status("unauthorized"));
            }
        }
        None => warn!("campaign_auth_not_configured"),
    }

    if let Err(reason) = validate_campaign(&job) {
        warn!(campaign_id = %job.campaign_id, reason = reason, "campaign_rejected");
        return (StatusCode::BAD_REQUEST, IntakeResponse::status(reason));
    }

    let campaign_id = job.campaign_id.clone();
    if let Err(e) = state.publisher.publish_job(&OutreachJob::Campaign(job)).await {
        error!(campaign_id = %campaign_id, error = %e, "campaign_publish_failed");
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            IntakeResponse::status("error"),
        );
    }

    info!(campaign_id = %campaign_id, "campaign_enqueued");

    (
        StatusCode::ACCEPTED,
        Json(IntakeResponse {
            status: "enqueued",
            campaign_id: Some(campaign_id),
        }),
    )
}

// =============================================================================
// Mailgun Webhook
// =============================================================================

/// Mailgun event form payload.
///
/// Mailgun sends form-encoded data, not JSON.
#[derive(Debug, Deserialize)]
pub struct MailgunEventForm {
    #[serde(default)]
    pub event: String,
    #[serde(default)]
    pub recipient: String,
    #[serde(default)]
    pub timestamp: String,
    #[serde(default)]
    pub token: String,
    #[serde(default)]
    pub signature: String,
}

/// Mailgun event webhook.
///
/// `unsubscribed` events become unsubscribe jobs; anything else is
/// acknowledged and dropped so Mailgun stops retrying.
pub async fn mailgun_webhook(
    State(state): State<AppState>,
    Form(form): Form<MailgunEventForm>,
) -> impl IntoResponse {
    info!(
        event = %form.event,
        recipient = %form.recipient,
        has_signature = !form.signature.is_empty(),
        "mailgun_webhook_received"
    );

    if let Some(key) = signing_key(&state.config.mailgun_signing_key) {
        let fields = MailgunSignature {
            timestamp: &form.timestamp,
            token: &form.token,
            signature: &form.signature,
        };
        if let Err(e) = fields.verify(key, state.config.mailgun_signature_max_age) {
            warn!(recipient = %form.recipient, reason = %e, "mailgun_signature_invalid");
            return (StatusCode::UNAUTHORIZED, IntakeResponse::status("unauthorized"));
        }
    }

    if form.event != "unsubscribed" {
        info!(event = %form.event, "mailgun_event_ignored");
        return (StatusCode::OK, IntakeResponse::status("ignored"));
    }

    if form.recipient.trim().is_empty() {
        warn!("mailgun_unsubscribe_missing_recipient");
        return (
            StatusCode::BAD_REQUEST,
            IntakeResponse::status("missing_recipient"),
        );
    }

    let job = OutreachJob::Unsubscribe(UnsubscribeJob {
        address: form.recipient.clone(),
        source: Some("mailgun".to_string()),
    });

    if let Err(e) = state.publisher.publish_job(&job).await {
        error!(error = %e, "mailgun_publish_failed");
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            IntakeResponse::status("error"),
        );
    }

    info!(recipient = %form.recipient, "mailgun_unsubscribe_enqueued");

    (StatusCode::OK, IntakeResponse::status("enqueued"))
}
