//! Outreach - bulk outbound messaging for recruiting campaigns.
//!
//! This library provides shared modules for the two binaries:
//! - `outreach-web`: Thin web server that authenticates and enqueues jobs
//! - `outreach-worker`: Runs campaigns and applies unsubscribes
//!
//! ## Architecture
//!
//! ```text
//! POST /campaigns ──┐
//!                   ├→ outreach_jobs → Worker → BulkSender → FailoverDispatcher → Provider
//! Mailgun webhook ──┘                    │            │
//!                                        │            └→ DeliveryLedger → ContactStore
//!                                        └→ campaign_results
//! ```

pub mod address;
pub mod bulk;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod ledger;
pub mod processor;
pub mod providers;
pub mod queue;
pub mod store;
pub mod template;
pub mod types;
pub mod web;

// Re-export commonly used types
pub use bulk::{BulkRequest, BulkSender};
pub use config::Config;
pub use dispatch::{FailoverDispatcher, ALL_PROVIDERS_FAILED, NO_PROVIDERS_CONFIGURED};
pub use error::{AddressError, DispatchError, StoreError};
pub use ledger::DeliveryLedger;
pub use processor::{JobOutcome, JobProcessor};
pub use providers::{Provider, ProviderProfile};
pub use queue::{CampaignJob, OutreachJob, Publisher, UnsubscribeJob, JOBS_QUEUE, RESULTS_QUEUE};
pub use store::{ContactStore, InMemoryContactStore, PgContactStore};
pub use template::TemplateRenderer;
pub use types::{
    CampaignSummary, Channel, ContactState, Cost, DeliveryResult, DeliveryStatus,
    MessageTemplate, OutboundMessage, Recipient, SendOutcome,
};
pub use web::AppState;
