//! Typed events fanned out to hub subscribers.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::hub::Hub;
use crate::models::{Conversation, ConversationStatus, Message};
use crate::textutil::sanitize_and_truncate;

/// Events delivered to connected sessions. Serialized as
/// `{"type": "...", "data": {...}}`.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum Event {
    /// A message was appended to a conversation.
    NewMessage {
        conversation_uuid: Uuid,
        uuid: Uuid,
        last_message: String,
        private: bool,
        created_at: DateTime<Utc>,
    },
    /// A property of a message changed (e.g. delivery status).
    MessagePropUpdate {
        conversation_uuid: Uuid,
        uuid: Uuid,
        prop: String,
        value: String,
    },
    /// A conversation entered a user's purview (creation or assignment).
    NewConversation {
        uuid: Uuid,
        inbox_id: i64,
        subject: Option<String>,
        last_message: Option<String>,
        status: ConversationStatus,
        assigned_user_id: Option<i64>,
    },
    /// A property of a conversation changed.
    ConversationPropUpdate {
        uuid: Uuid,
        prop: String,
        value: String,
    },
}

/// Publishes pipeline events through a [`Hub`]. All methods are
/// best-effort: a failed or unsubscribed delivery never propagates.
#[derive(Clone)]
pub struct Broadcaster {
    hub: Arc<dyn Hub>,
}

impl Broadcaster {
    pub fn new(hub: Arc<dyn Hub>) -> Self {
        Self { hub }
    }

    /// Notify conversation subscribers of a newly inserted message.
    pub fn new_message(&self, message: &Message, summary_max: usize) {
        self.to_conversation(
            message.conversation_uuid,
            &Event::NewMessage {
                conversation_uuid: message.conversation_uuid,
                uuid: message.uuid,
                last_message: sanitize_and_truncate(&message.content, summary_max),
                private: message.private,
                created_at: message.created_at,
            },
        );
    }

    /// Notify conversation subscribers of a message property change.
    pub fn message_prop_update(
        &self,
        conversation_uuid: Uuid,
        message_uuid: Uuid,
        prop: &str,
        value: &str,
    ) {
        self.to_conversation(
            conversation_uuid,
            &Event::MessagePropUpdate {
                conversation_uuid,
                uuid: message_uuid,
                prop: prop.to_string(),
                value: value.to_string(),
            },
        );
    }

    /// Notify a single user that a conversation is now theirs to see.
    pub fn new_conversation(&self, conversation: &Conversation, user_id: i64) {
        self.to_users(
            &[user_id],
            &Event::NewConversation {
                uuid: conversation.uuid,
                inbox_id: conversation.inbox_id,
                subject: conversation.subject.clone(),
                last_message: conversation.last_message.clone(),
                status: conversation.status,
                assigned_user_id: conversation.assigned_user_id,
            },
        );
    }

    /// Notify conversation subscribers of a conversation property change.
    pub fn conversation_prop_update(&self, conversation_uuid: Uuid, prop: &str, value: &str) {
        self.to_conversation(
            conversation_uuid,
            &Event::ConversationPropUpdate {
                uuid: conversation_uuid,
                prop: prop.to_string(),
                value: value.to_string(),
            },
        );
    }

    fn to_conversation(&self, conversation_uuid: Uuid, event: &Event) {
        let subscribers = self.hub.conversation_subscribers(conversation_uuid);
        if subscribers.is_empty() {
            return;
        }
        self.to_users(&subscribers, event);
    }

    fn to_users(&self, user_ids: &[i64], event: &Event) {
        match serde_json::to_string(event) {
            Ok(payload) => self.hub.broadcast(&payload, user_ids),
            Err(e) => tracing::error!(error = %e, "Failed to serialize hub event"),
        }
    }
}
