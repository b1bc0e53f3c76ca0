//! In-memory `ConversationStore` used by tests and the demo binary.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::StoreError;
use crate::models::{
    Attachment, Contact, Conversation, ConversationStatus, Message, MessageDirection,
    MessageStatus, NewConversation, Priority,
};
use crate::store::ConversationStore;

#[derive(Default)]
struct Inner {
    next_conversation_id: i64,
    next_message_id: i64,
    next_contact_id: i64,
    conversations: HashMap<Uuid, Conversation>,
    conversation_uuid_by_id: HashMap<i64, Uuid>,
    messages: HashMap<Uuid, Message>,
    /// message source-id -> owning conversation id
    source_index: HashMap<String, i64>,
    contacts: HashMap<i64, Contact>,
    /// (inbox id, lowercased email) -> contact id
    contact_identity: HashMap<(i64, String), i64>,
    attachments: HashMap<i64, Vec<Attachment>>,
}

/// HashMap-backed store. Serializes all access behind a single RwLock,
/// which stands in for the relational store's own locking.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of stored messages (test helper).
    pub async fn message_count(&self) -> usize {
        self.inner.read().await.messages.len()
    }

    /// Total number of conversations (test helper).
    pub async fn conversation_count(&self) -> usize {
        self.inner.read().await.conversations.len()
    }
}

#[async_trait]
impl ConversationStore for MemoryStore {
    async fn upsert_contact(&self, contact: &Contact) -> Result<i64, StoreError> {
        let mut inner = self.inner.write().await;
        let key = (contact.inbox_id, contact.email.to_lowercase());
        if let Some(&id) = inner.contact_identity.get(&key) {
            if let Some(existing) = inner.contacts.get_mut(&id) {
                existing.first_name = contact.first_name.clone();
                existing.last_name = contact.last_name.clone();
            }
            return Ok(id);
        }
        inner.next_contact_id += 1;
        let id = inner.next_contact_id;
        let mut stored = contact.clone();
        stored.id = id;
        inner.contacts.insert(id, stored);
        inner.contact_identity.insert(key, id);
        Ok(id)
    }

    async fn contact_email(&self, conversation_id: i64) -> Result<String, StoreError> {
        let inner = self.inner.read().await;
        let uuid = inner
            .conversation_uuid_by_id
            .get(&conversation_id)
            .ok_or(StoreError::NotFound {
                entity: "conversation",
                id: conversation_id.to_string(),
            })?;
        let conversation = &inner.conversations[uuid];
        inner
            .contacts
            .get(&conversation.contact_id)
            .map(|c| c.email.clone())
            .ok_or(StoreError::NotFound {
                entity: "contact",
                id: conversation.contact_id.to_string(),
            })
    }

    async fn find_conversation_by_source_ids(
        &self,
        source_ids: &[String],
    ) -> Result<Option<(i64, Uuid)>, StoreError> {
        if source_ids.is_empty() {
            return Ok(None);
        }
        let inner = self.inner.read().await;
        for source_id in source_ids {
            if let Some(&conversation_id) = inner.source_index.get(source_id) {
                let uuid = inner.conversation_uuid_by_id[&conversation_id];
                return Ok(Some((conversation_id, uuid)));
            }
        }
        Ok(None)
    }

    async fn create_conversation(&self, new: NewConversation) -> Result<Conversation, StoreError> {
        let mut inner = self.inner.write().await;
        inner.next_conversation_id += 1;
        let conversation = Conversation {
            id: inner.next_conversation_id,
            uuid: Uuid::new_v4(),
            contact_id: new.contact_id,
            inbox_id: new.inbox_id,
            assigned_user_id: None,
            assigned_team_id: None,
            status: ConversationStatus::Open,
            priority: None,
            tags: Vec::new(),
            subject: new.subject,
            last_message: new.last_message,
            last_message_at: new.last_message_at,
            first_reply_at: None,
            created_at: Utc::now(),
        };
        inner
            .conversation_uuid_by_id
            .insert(conversation.id, conversation.uuid);
        inner
            .conversations
            .insert(conversation.uuid, conversation.clone());
        Ok(conversation)
    }

    async fn get_conversation(&self, uuid: Uuid) -> Result<Conversation, StoreError> {
        self.inner
            .read()
            .await
            .conversations
            .get(&uuid)
            .cloned()
            .ok_or(StoreError::NotFound {
                entity: "conversation",
                id: uuid.to_string(),
            })
    }

    async fn get_conversations_created_after(
        &self,
        after: DateTime<Utc>,
    ) -> Result<Vec<Conversation>, StoreError> {
        Ok(self
            .inner
            .read()
            .await
            .conversations
            .values()
            .filter(|c| c.created_at > after)
            .cloned()
            .collect())
    }

    async fn update_user_assignee(&self, uuid: Uuid, user_id: i64) -> Result<(), StoreError> {
        self.mutate_conversation(uuid, |c| c.assigned_user_id = Some(user_id))
            .await
    }

    async fn update_team_assignee(&self, uuid: Uuid, team_id: i64) -> Result<(), StoreError> {
        self.mutate_conversation(uuid, |c| c.assigned_team_id = Some(team_id))
            .await
    }

    async fn update_status(
        &self,
        uuid: Uuid,
        status: ConversationStatus,
    ) -> Result<(), StoreError> {
        self.mutate_conversation(uuid, |c| c.status = status).await
    }

    async fn update_priority(&self, uuid: Uuid, priority: Priority) -> Result<(), StoreError> {
        self.mutate_conversation(uuid, |c| c.priority = Some(priority))
            .await
    }

    async fn update_last_message(
        &self,
        uuid: Uuid,
        summary: &str,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let summary = summary.to_string();
        self.mutate_conversation(uuid, move |c| {
            c.last_message = Some(summary);
            c.last_message_at = Some(at);
        })
        .await
    }

    async fn update_first_reply_at(
        &self,
        uuid: Uuid,
        at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut inner = self.inner.write().await;
        let conversation = inner
            .conversations
            .get_mut(&uuid)
            .ok_or(StoreError::NotFound {
                entity: "conversation",
                id: uuid.to_string(),
            })?;
        if conversation.first_reply_at.is_some() {
            return Ok(false);
        }
        conversation.first_reply_at = Some(at);
        Ok(true)
    }

    async fn insert_message(&self, message: &mut Message) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        if !inner
            .conversation_uuid_by_id
            .contains_key(&message.conversation_id)
        {
            return Err(StoreError::Constraint(format!(
                "message references unknown conversation {}",
                message.conversation_id
            )));
        }
        inner.next_message_id += 1;
        message.id = inner.next_message_id;
        message.uuid = Uuid::new_v4();
        message.created_at = Utc::now();
        if let Some(ref source_id) = message.source_id {
            inner
                .source_index
                .insert(source_id.clone(), message.conversation_id);
        }
        let mut stored = message.clone();
        stored.attachments = Vec::new(); // attachment blobs live in their own table
        inner.messages.insert(stored.uuid, stored);
        Ok(())
    }

    async fn get_message(&self, uuid: Uuid) -> Result<Message, StoreError> {
        let inner = self.inner.read().await;
        let mut message = inner
            .messages
            .get(&uuid)
            .cloned()
            .ok_or(StoreError::NotFound {
                entity: "message",
                id: uuid.to_string(),
            })?;
        if let Some(files) = inner.attachments.get(&message.id) {
            message.attachments = files.clone();
        }
        Ok(message)
    }

    async fn update_message_status(
        &self,
        uuid: Uuid,
        status: MessageStatus,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        let message = inner.messages.get_mut(&uuid).ok_or(StoreError::NotFound {
            entity: "message",
            id: uuid.to_string(),
        })?;
        message.status = status;
        Ok(())
    }

    async fn get_pending_outgoing(&self, excluding: &[i64]) -> Result<Vec<Message>, StoreError> {
        Ok(self
            .inner
            .read()
            .await
            .messages
            .values()
            .filter(|m| {
                m.direction == MessageDirection::Outgoing
                    && m.status == MessageStatus::Pending
                    && !excluding.contains(&m.id)
            })
            .cloned()
            .collect())
    }

    async fn latest_received_source_id(
        &self,
        conversation_id: i64,
    ) -> Result<Option<String>, StoreError> {
        Ok(self
            .inner
            .read()
            .await
            .messages
            .values()
            .filter(|m| {
                m.conversation_id == conversation_id
                    && m.direction == MessageDirection::Incoming
                    && m.source_id.is_some()
            })
            .max_by_key(|m| m.created_at)
            .and_then(|m| m.source_id.clone()))
    }

    async fn attach_file(
        &self,
        message_id: i64,
        attachment: Attachment,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        if message_id <= 0 || message_id > inner.next_message_id {
            return Err(StoreError::NotFound {
                entity: "message",
                id: message_id.to_string(),
            });
        }
        inner.attachments.entry(message_id).or_default().push(attachment);
        Ok(())
    }

    async fn get_message_attachments(
        &self,
        message_id: i64,
    ) -> Result<Vec<Attachment>, StoreError> {
        Ok(self
            .inner
            .read()
            .await
            .attachments
            .get(&message_id)
            .cloned()
            .unwrap_or_default())
    }
}

impl MemoryStore {
    async fn mutate_conversation<F>(&self, uuid: Uuid, mutate: F) -> Result<(), StoreError>
    where
        F: FnOnce(&mut Conversation),
    {
        let mut inner = self.inner.write().await;
        let conversation = inner
            .conversations
            .get_mut(&uuid)
            .ok_or(StoreError::NotFound {
                entity: "conversation",
                id: uuid.to_string(),
            })?;
        mutate(conversation);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ContentType, SenderType};

    fn contact(email: &str) -> Contact {
        Contact {
            id: 0,
            first_name: "Test".into(),
            last_name: "Contact".into(),
            email: email.into(),
            inbox_id: 1,
        }
    }

    async fn seed_conversation(store: &MemoryStore) -> Conversation {
        let contact_id = store.upsert_contact(&contact("a@x.com")).await.unwrap();
        store
            .create_conversation(NewConversation {
                contact_id,
                inbox_id: 1,
                subject: Some("Help".into()),
                last_message: None,
                last_message_at: None,
            })
            .await
            .unwrap()
    }

    fn outgoing(conversation: &Conversation) -> Message {
        Message {
            id: 0,
            uuid: Uuid::nil(),
            conversation_id: conversation.id,
            conversation_uuid: conversation.uuid,
            direction: MessageDirection::Outgoing,
            sender_id: 7,
            sender_type: SenderType::User,
            status: MessageStatus::Pending,
            content: "reply".into(),
            content_type: ContentType::Html,
            source_id: None,
            in_reply_to: None,
            references: vec![],
            attachments: vec![],
            private: false,
            inbox_id: 1,
            subject: None,
            meta: serde_json::json!({}),
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn contact_upsert_is_idempotent() {
        let store = MemoryStore::new();
        let a = store.upsert_contact(&contact("a@x.com")).await.unwrap();
        let b = store.upsert_contact(&contact("A@X.COM")).await.unwrap();
        assert_eq!(a, b);
        let c = store.upsert_contact(&contact("other@x.com")).await.unwrap();
        assert_ne!(a, c);
    }

    #[tokio::test]
    async fn source_index_resolves_conversation() {
        let store = MemoryStore::new();
        let conversation = seed_conversation(&store).await;
        let mut msg = outgoing(&conversation);
        msg.direction = MessageDirection::Incoming;
        msg.status = MessageStatus::Received;
        msg.source_id = Some("<m1@x>".into());
        store.insert_message(&mut msg).await.unwrap();

        let found = store
            .find_conversation_by_source_ids(&["<m1@x>".into()])
            .await
            .unwrap();
        assert_eq!(found, Some((conversation.id, conversation.uuid)));
        let missing = store
            .find_conversation_by_source_ids(&["<none@x>".into()])
            .await
            .unwrap();
        assert!(missing.is_none());
    }

    #[tokio::test]
    async fn first_reply_is_set_once() {
        let store = MemoryStore::new();
        let conversation = seed_conversation(&store).await;
        let t1 = Utc::now();
        assert!(store.update_first_reply_at(conversation.uuid, t1).await.unwrap());
        assert!(!store.update_first_reply_at(conversation.uuid, Utc::now()).await.unwrap());
        let fetched = store.get_conversation(conversation.uuid).await.unwrap();
        assert_eq!(fetched.first_reply_at, Some(t1));
    }

    #[tokio::test]
    async fn pending_scan_excludes_in_flight_ids() {
        let store = MemoryStore::new();
        let conversation = seed_conversation(&store).await;
        let mut a = outgoing(&conversation);
        store.insert_message(&mut a).await.unwrap();
        let mut b = outgoing(&conversation);
        store.insert_message(&mut b).await.unwrap();

        let all = store.get_pending_outgoing(&[]).await.unwrap();
        assert_eq!(all.len(), 2);
        let filtered = store.get_pending_outgoing(&[a.id]).await.unwrap();
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].id, b.id);
    }

    #[tokio::test]
    async fn not_found_is_distinguished() {
        let store = MemoryStore::new();
        let err = store.get_conversation(Uuid::new_v4()).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn latest_received_source_id_picks_newest() {
        let store = MemoryStore::new();
        let conversation = seed_conversation(&store).await;
        for source in ["<first@x>", "<second@x>"] {
            let mut msg = outgoing(&conversation);
            msg.direction = MessageDirection::Incoming;
            msg.status = MessageStatus::Received;
            msg.source_id = Some(source.into());
            store.insert_message(&mut msg).await.unwrap();
            tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        }
        let latest = store
            .latest_received_source_id(conversation.id)
            .await
            .unwrap();
        assert_eq!(latest.as_deref(), Some("<second@x>"));
    }
}
