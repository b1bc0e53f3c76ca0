//! Domain models: messages, conversations, contacts, activity records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Max length of the denormalized conversation summary.
pub const MAX_LAST_MESSAGE_LEN: usize = 45;

/// Direction of a message within a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageDirection {
    Incoming,
    Outgoing,
    /// System-generated record of a conversation change (assignment,
    /// status, priority). Never dispatched.
    Activity,
}

impl MessageDirection {
    pub fn as_str(self) -> &'static str {
        match self {
            MessageDirection::Incoming => "incoming",
            MessageDirection::Outgoing => "outgoing",
            MessageDirection::Activity => "activity",
        }
    }
}

impl std::fmt::Display for MessageDirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Who authored a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SenderType {
    User,
    Contact,
}

/// Message delivery status state machine.
///
/// `pending → sent → delivered → read`, `pending → failed`. Any state may
/// be administratively reset to `pending` (retry). `received` is terminal
/// and reserved for incoming messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Pending,
    Sent,
    Delivered,
    Read,
    Failed,
    Received,
}

impl MessageStatus {
    /// Whether a forward transition to `next` is legal. The reset to
    /// `pending` is an explicit recovery operation and is not covered here.
    pub fn can_transition_to(self, next: MessageStatus) -> bool {
        use MessageStatus::*;
        matches!(
            (self, next),
            (Pending, Sent) | (Pending, Failed) | (Sent, Delivered) | (Sent, Read) | (Delivered, Read)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            MessageStatus::Pending => "pending",
            MessageStatus::Sent => "sent",
            MessageStatus::Delivered => "delivered",
            MessageStatus::Read => "read",
            MessageStatus::Failed => "failed",
            MessageStatus::Received => "received",
        }
    }
}

impl std::fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Content type of a message body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentType {
    Text,
    Html,
}

/// Conversation lifecycle status. Conversations are never deleted, only
/// closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationStatus {
    Open,
    Snoozed,
    Resolved,
    Closed,
}

impl ConversationStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ConversationStatus::Open => "open",
            ConversationStatus::Snoozed => "snoozed",
            ConversationStatus::Resolved => "resolved",
            ConversationStatus::Closed => "closed",
        }
    }
}

impl std::fmt::Display for ConversationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Conversation priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    Medium,
    High,
    Urgent,
}

impl Priority {
    pub fn as_str(self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::Medium => "medium",
            Priority::High => "high",
            Priority::Urgent => "urgent",
        }
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How an attachment should be presented.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Disposition {
    Attachment,
    Inline,
}

/// A file attached to a message.
#[derive(Debug, Clone)]
pub struct Attachment {
    pub name: String,
    pub content_type: String,
    pub content: Vec<u8>,
    /// MIME content id for inline references.
    pub content_id: Option<String>,
    pub disposition: Disposition,
}

/// A message within a conversation. Immutable identity; mutated only via
/// status transitions and meta updates, never deleted.
#[derive(Debug, Clone)]
pub struct Message {
    pub id: i64,
    pub uuid: Uuid,
    pub conversation_id: i64,
    pub conversation_uuid: Uuid,
    pub direction: MessageDirection,
    pub sender_id: i64,
    pub sender_type: SenderType,
    pub status: MessageStatus,
    pub content: String,
    pub content_type: ContentType,
    /// Channel-native id (email Message-ID) used for deduplication and
    /// threading.
    pub source_id: Option<String>,
    pub in_reply_to: Option<String>,
    pub references: Vec<String>,
    pub attachments: Vec<Attachment>,
    /// Internal note vs customer-visible.
    pub private: bool,
    pub inbox_id: i64,
    pub subject: Option<String>,
    pub meta: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl Message {
    /// Source ids this message threads on: its own references plus the
    /// in-reply-to id, if any.
    pub fn thread_source_ids(&self) -> Vec<String> {
        let mut ids = self.references.clone();
        if let Some(ref irt) = self.in_reply_to {
            ids.push(irt.clone());
        }
        ids
    }
}

/// A threaded exchange between a contact and the support organization.
#[derive(Debug, Clone)]
pub struct Conversation {
    pub id: i64,
    pub uuid: Uuid,
    pub contact_id: i64,
    pub inbox_id: i64,
    pub assigned_user_id: Option<i64>,
    pub assigned_team_id: Option<i64>,
    pub status: ConversationStatus,
    pub priority: Option<Priority>,
    pub tags: Vec<String>,
    pub subject: Option<String>,
    /// Truncated summary of the most recently inserted message.
    pub last_message: Option<String>,
    pub last_message_at: Option<DateTime<Utc>>,
    /// Stamped once, on the first successful outgoing send.
    pub first_reply_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Fields for creating a conversation.
#[derive(Debug, Clone)]
pub struct NewConversation {
    pub contact_id: i64,
    pub inbox_id: i64,
    pub subject: Option<String>,
    pub last_message: Option<String>,
    pub last_message_at: Option<DateTime<Utc>>,
}

/// A contact, identified per inbox by email address.
#[derive(Debug, Clone)]
pub struct Contact {
    pub id: i64,
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    pub inbox_id: i64,
}

/// A fully-formed inbound message bundled with its sender's contact info,
/// as handed to the pipeline by a channel receiver.
#[derive(Debug, Clone)]
pub struct IncomingMessage {
    pub message: Message,
    pub contact: Contact,
    pub inbox_id: i64,
}

/// The identity performing a mutation, recorded on activity messages.
#[derive(Debug, Clone)]
pub struct Actor {
    pub id: i64,
    pub name: String,
}

/// Kinds of conversation activity records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivityKind {
    StatusChange,
    PriorityChange,
    AssignedUserChange,
    AssignedTeamChange,
    SelfAssign,
    TagChange,
}

/// Human-readable activity content for an activity message.
pub fn activity_content(kind: ActivityKind, new_value: &str, actor_name: &str) -> String {
    match kind {
        ActivityKind::AssignedUserChange => format!("Assigned to {new_value} by {actor_name}"),
        ActivityKind::AssignedTeamChange => format!("Assigned to {new_value} team by {actor_name}"),
        ActivityKind::SelfAssign => format!("{actor_name} self-assigned this conversation"),
        ActivityKind::PriorityChange => format!("{actor_name} changed priority to {new_value}"),
        ActivityKind::StatusChange => format!("{actor_name} marked the conversation as {new_value}"),
        ActivityKind::TagChange => format!("{actor_name} added tags {new_value}"),
    }
}
