//! Ingress processing: deduplication, contact upsert, conversation
//! threading and message insertion.

use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::models::{IncomingMessage, MAX_LAST_MESSAGE_LEN, NewConversation};
use crate::textutil::sanitize_and_truncate;
use uuid::Uuid;

use super::Pipeline;

impl Pipeline {
    /// Process one inbound message end to end.
    ///
    /// Order matters: the duplicate check runs before any write so a
    /// redelivered message leaves no trace, and the new-conversation
    /// trigger fires only after the message is durable.
    pub(crate) async fn process_incoming(&self, incoming: IncomingMessage) -> Result<()> {
        let IncomingMessage {
            mut message,
            mut contact,
            inbox_id,
        } = incoming;

        if let Some(ref source_id) = message.source_id {
            let existing = self
                .store
                .find_conversation_by_source_ids(std::slice::from_ref(source_id))
                .await
                .map_err(Error::Store)?;
            if existing.is_some() {
                debug!(source_id, "Skipping duplicate incoming message");
                return Ok(());
            }
        }

        contact.inbox_id = inbox_id;
        let contact_id = self.store.upsert_contact(&contact).await.map_err(Error::Store)?;

        let (conversation_id, conversation_uuid, is_new) = self
            .find_or_create_conversation(&message, contact_id, inbox_id)
            .await?;

        message.conversation_id = conversation_id;
        message.conversation_uuid = conversation_uuid;
        message.sender_id = contact_id;
        message.inbox_id = inbox_id;
        self.insert_message_record(&mut message).await?;

        if is_new {
            info!(%conversation_uuid, contact_id, "Conversation created");
            self.automation.trigger_new_conversation(conversation_uuid);
        }
        Ok(())
    }

    /// Resolve the owning conversation by the message's threading ids, or
    /// create one seeded with the message subject and summary.
    async fn find_or_create_conversation(
        &self,
        message: &crate::models::Message,
        contact_id: i64,
        inbox_id: i64,
    ) -> Result<(i64, Uuid, bool)> {
        let thread_ids = message.thread_source_ids();
        if !thread_ids.is_empty() {
            if let Some((id, uuid)) = self
                .store
                .find_conversation_by_source_ids(&thread_ids)
                .await
                .map_err(Error::Store)?
            {
                return Ok((id, uuid, false));
            }
        }

        let summary = sanitize_and_truncate(&message.content, MAX_LAST_MESSAGE_LEN);
        let conversation = self
            .store
            .create_conversation(NewConversation {
                contact_id,
                inbox_id,
                subject: message.subject.clone(),
                last_message: Some(summary),
                last_message_at: Some(message.created_at),
            })
            .await
            .map_err(Error::Store)?;
        Ok((conversation.id, conversation.uuid, true))
    }
}
