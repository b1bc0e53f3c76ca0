//! Inbox abstraction — a configured transport capable of sending outgoing
//! messages. One variant per supported channel; the dispatch worker is
//! written against the trait only.

pub mod email;

pub use email::{EmailInbox, EmailInboxConfig, parse_incoming_email};

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;

use crate::error::InboxError;
use crate::models::Attachment;

/// Supported transports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelKind {
    Email,
}

impl ChannelKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ChannelKind::Email => "email",
        }
    }
}

impl std::fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A fully-resolved outgoing message, ready for a channel to send.
#[derive(Debug, Clone)]
pub struct OutgoingEnvelope {
    pub from: String,
    pub to: String,
    pub subject: String,
    /// Rendered (templated) body.
    pub content: String,
    pub in_reply_to: Option<String>,
    pub references: Vec<String>,
    pub attachments: Vec<Attachment>,
}

/// Send capability of one configured inbox.
#[async_trait]
pub trait Inbox: Send + Sync {
    fn id(&self) -> i64;
    fn channel(&self) -> ChannelKind;
    fn from_address(&self) -> &str;
    async fn send(&self, envelope: &OutgoingEnvelope) -> Result<(), InboxError>;
}

/// Registry of configured inboxes, keyed by inbox id.
#[derive(Default)]
pub struct InboxRegistry {
    inboxes: DashMap<i64, Arc<dyn Inbox>>,
}

impl InboxRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, inbox: Arc<dyn Inbox>) {
        self.inboxes.insert(inbox.id(), inbox);
    }

    pub fn get(&self, id: i64) -> Result<Arc<dyn Inbox>, InboxError> {
        self.inboxes
            .get(&id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or(InboxError::NotFound { id })
    }

    pub fn len(&self) -> usize {
        self.inboxes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inboxes.is_empty()
    }
}
