//! RabbitMQ queue module.
//!
//! This module provides:
//! - Message types for the job and result queues
//! - Async publisher for enqueueing messages

pub mod publisher;
pub mod types;

pub use publisher::Publisher;
pub use types::{CampaignJob, OutreachJob, UnsubscribeJob, JOBS_QUEUE, RESULTS_QUEUE};
