//! Error types for deskrelay.

use crate::models::MessageStatus;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Inbox error: {0}")]
    Inbox(#[from] InboxError),

    #[error("Template error: {0}")]
    Template(#[from] TemplateError),

    #[error("Pipeline error: {0}")]
    Pipeline(#[from] PipelineError),

    #[error("Automation error: {0}")]
    Automation(#[from] AutomationError),
}

/// Persistence errors. `NotFound` is a normal negative result and is
/// matched explicitly by callers; everything else signals a dependency
/// failure.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Constraint violation: {0}")]
    Constraint(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }
}

/// Bounded-queue capacity errors. `Full` is transient — the producer is
/// expected to retry delivery; `Closed` means shutdown has begun.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum QueueError {
    #[error("{0} queue is closed")]
    Closed(&'static str),

    #[error("{0} queue is full")]
    Full(&'static str),
}

impl QueueError {
    /// Whether the caller may safely retry the enqueue later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, QueueError::Full(_))
    }
}

/// Outbound channel errors.
#[derive(Debug, thiserror::Error)]
pub enum InboxError {
    #[error("Inbox {id} not found")]
    NotFound { id: i64 },

    #[error("Invalid address {address}: {reason}")]
    InvalidAddress { address: String, reason: String },

    #[error("Failed to build message for channel {channel}: {reason}")]
    BuildFailed { channel: String, reason: String },

    #[error("Send failed on channel {channel}: {reason}")]
    SendFailed { channel: String, reason: String },
}

/// Outbound content rendering errors.
#[derive(Debug, thiserror::Error)]
pub enum TemplateError {
    #[error("No template for channel {0}")]
    UnknownChannel(String),

    #[error("Render failed: {0}")]
    Render(String),
}

/// Message pipeline errors.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    #[error("Invalid status transition: {from} -> {to}")]
    InvalidStatusTransition {
        from: MessageStatus,
        to: MessageStatus,
    },
}

/// Automation engine errors.
#[derive(Debug, thiserror::Error)]
pub enum AutomationError {
    #[error("Rule {id} not found")]
    RuleNotFound { id: i64 },

    #[error("Invalid rule definition: {0}")]
    InvalidDefinition(String),
}

/// Result type alias for the crate.
pub type Result<T> = std::result::Result<T, Error>;
