//! Error types for the dispatch pipeline.
//!
//! Provider and network failures are never errors here; they are recorded as
//! failed outcomes. These enums cover invalid input, configuration and
//! persistence problems only.

use thiserror::Error;

use crate::types::Channel;

/// Address validation failure. The recipient is skipped, not attempted.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AddressError {
    #[error("invalid phone number {raw:?}: {digits} digits after normalization")]
    InvalidPhone { raw: String, digits: usize },

    #[error("invalid email address {0:?}")]
    InvalidEmail(String),
}

/// Errors raised when setting up or starting a dispatch run.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DispatchError {
    #[error("providers {first} and {second} share priority {priority}")]
    DuplicatePriority {
        first: String,
        second: String,
        priority: u32,
    },

    #[error("rate limit must be at least 1 message per minute")]
    InvalidRateLimit,

    #[error("batch size must be at least 1")]
    InvalidBatchSize,

    #[error("{requested} campaign sent to the {sender} sender")]
    ChannelMismatch { requested: Channel, sender: Channel },
}

/// Persistence collaborator errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("recipient not found: {0}")]
    NotFound(String),

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

pub type StoreResult<T> = Result<T, StoreError>;
