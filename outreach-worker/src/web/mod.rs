//! Web intake for campaign submissions and provider webhooks.
//!
//! Handlers authenticate, enqueue to RabbitMQ and return. Sending happens
//! in the worker.

pub mod handlers;
pub mod signature;

pub use handlers::{
    create_campaign, health, mailgun_webhook, validate_campaign, AppState, HealthResponse,
    IntakeResponse, MailgunEventForm,
};
pub use signature::{signing_key, verify_bearer_token, MailgunSignature, SignatureError};
