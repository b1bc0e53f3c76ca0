//! Persistence seam for conversations, messages and contacts.
//!
//! The real system of record is a transactional relational store; this
//! crate only depends on the `ConversationStore` trait. The in-memory
//! implementation in [`memory`] backs tests and the demo binary.

mod memory;

pub use memory::MemoryStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::StoreError;
use crate::models::{
    Attachment, Contact, Conversation, ConversationStatus, Message, NewConversation, Priority,
};

/// Backend-agnostic persistence for the messaging pipeline.
///
/// The store is the system of record: conflicting writes to the same
/// conversation serialize here, not in the pipeline.
#[async_trait]
pub trait ConversationStore: Send + Sync {
    // ── Contacts ────────────────────────────────────────────────────

    /// Find-or-create a contact by its channel identity (inbox + email).
    /// Returns the contact id.
    async fn upsert_contact(&self, contact: &Contact) -> Result<i64, StoreError>;

    /// Email address of the contact owning a conversation (the "To"
    /// address for outgoing email).
    async fn contact_email(&self, conversation_id: i64) -> Result<String, StoreError>;

    // ── Conversations ───────────────────────────────────────────────

    /// Look up the conversation owning any of the given message source
    /// ids. `Ok(None)` when no conversation matches.
    async fn find_conversation_by_source_ids(
        &self,
        source_ids: &[String],
    ) -> Result<Option<(i64, Uuid)>, StoreError>;

    async fn create_conversation(&self, new: NewConversation) -> Result<Conversation, StoreError>;

    async fn get_conversation(&self, uuid: Uuid) -> Result<Conversation, StoreError>;

    async fn get_conversations_created_after(
        &self,
        after: DateTime<Utc>,
    ) -> Result<Vec<Conversation>, StoreError>;

    async fn update_user_assignee(&self, uuid: Uuid, user_id: i64) -> Result<(), StoreError>;

    async fn update_team_assignee(&self, uuid: Uuid, team_id: i64) -> Result<(), StoreError>;

    async fn update_status(&self, uuid: Uuid, status: ConversationStatus)
    -> Result<(), StoreError>;

    async fn update_priority(&self, uuid: Uuid, priority: Priority) -> Result<(), StoreError>;

    /// Update the denormalized last-message summary used by list views.
    async fn update_last_message(
        &self,
        uuid: Uuid,
        summary: &str,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Stamp the first-reply timestamp. Set-once: returns `true` only if
    /// this call actually stamped it.
    async fn update_first_reply_at(
        &self,
        uuid: Uuid,
        at: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    // ── Messages ────────────────────────────────────────────────────

    /// Insert a message, assigning `id`, `uuid` and `created_at` on the
    /// passed value. Attachments are stored separately via
    /// [`attach_file`](Self::attach_file).
    async fn insert_message(&self, message: &mut Message) -> Result<(), StoreError>;

    async fn get_message(&self, uuid: Uuid) -> Result<Message, StoreError>;

    async fn update_message_status(
        &self,
        uuid: Uuid,
        status: crate::models::MessageStatus,
    ) -> Result<(), StoreError>;

    /// Pending outgoing messages, excluding the given in-flight ids.
    async fn get_pending_outgoing(&self, excluding: &[i64]) -> Result<Vec<Message>, StoreError>;

    /// Source id of the latest received message in a conversation (email
    /// `In-Reply-To` for replies).
    async fn latest_received_source_id(
        &self,
        conversation_id: i64,
    ) -> Result<Option<String>, StoreError>;

    // ── Attachments ─────────────────────────────────────────────────

    async fn attach_file(&self, message_id: i64, attachment: Attachment)
    -> Result<(), StoreError>;

    async fn get_message_attachments(&self, message_id: i64)
    -> Result<Vec<Attachment>, StoreError>;
}
