//! Egress: the pending-outgoing scanner and the dispatch workers.

use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use crate::error::{Error, Result};
use crate::inbox::OutgoingEnvelope;
use crate::models::{Message, MessageStatus};

use super::Pipeline;

impl Pipeline {
    /// One scanner tick: load pending outgoing messages not already in
    /// flight, mark them in flight and queue them for dispatch.
    ///
    /// The send is non-blocking: when the dispatch queue fills, the
    /// just-claimed message is released again and the remainder of the
    /// batch waits for the next tick.
    pub(crate) async fn scan_pending(&self, dispatch_tx: &mpsc::Sender<Message>) {
        let excluding: Vec<i64> = self.in_flight.iter().map(|e| *e.key()).collect();
        let pending = match self.store.get_pending_outgoing(&excluding).await {
            Ok(pending) => pending,
            Err(e) => {
                error!(error = %e, "Pending scan failed");
                return;
            }
        };
        if pending.is_empty() {
            return;
        }
        debug!(count = pending.len(), "Queueing pending outgoing messages");
        for message in pending {
            let id = message.id;
            self.in_flight.insert(id, ());
            if let Err(e) = dispatch_tx.try_send(message) {
                self.in_flight.remove(&id);
                warn!(message_id = id, error = %e, "Dispatch queue full, deferring to next scan");
                break;
            }
        }
    }

    /// Deliver one message and record the outcome. The in-flight claim is
    /// released only after the terminal status is durable, so a message
    /// is never dispatched twice concurrently.
    pub(crate) async fn dispatch_message(&self, message: Message) {
        let outcome = self.deliver(&message).await;
        match outcome {
            Ok(()) => {
                if let Err(e) = self
                    .store
                    .update_message_status(message.uuid, MessageStatus::Sent)
                    .await
                {
                    error!(message_uuid = %message.uuid, error = %e, "Failed to record sent status");
                } else {
                    self.broadcaster.message_prop_update(
                        message.conversation_uuid,
                        message.uuid,
                        "status",
                        MessageStatus::Sent.as_str(),
                    );
                    self.stamp_first_reply(&message).await;
                }
            }
            Err(e) => {
                error!(message_uuid = %message.uuid, error = %e, "Dispatch failed");
                if let Err(e) = self
                    .store
                    .update_message_status(message.uuid, MessageStatus::Failed)
                    .await
                {
                    error!(message_uuid = %message.uuid, error = %e, "Failed to record failed status");
                } else {
                    self.broadcaster.message_prop_update(
                        message.conversation_uuid,
                        message.uuid,
                        "status",
                        MessageStatus::Failed.as_str(),
                    );
                }
            }
        }
        self.in_flight.remove(&message.id);
    }

    /// Resolve transport, render content and send.
    async fn deliver(&self, message: &Message) -> Result<()> {
        let inbox = self.inboxes.get(message.inbox_id).map_err(Error::Inbox)?;
        let rendered = self
            .templates
            .render(inbox.channel(), &message.content)
            .map_err(Error::Template)?;
        let attachments = self
            .store
            .get_message_attachments(message.id)
            .await
            .map_err(Error::Store)?;
        let to = self
            .store
            .contact_email(message.conversation_id)
            .await
            .map_err(Error::Store)?;
        // Thread the reply onto the contact's latest message.
        let in_reply_to = self
            .store
            .latest_received_source_id(message.conversation_id)
            .await
            .map_err(Error::Store)?;
        let references = if message.references.is_empty() {
            in_reply_to.iter().cloned().collect()
        } else {
            message.references.clone()
        };

        let envelope = OutgoingEnvelope {
            from: inbox.from_address().to_string(),
            to,
            subject: message.subject.clone().unwrap_or_default(),
            content: rendered,
            in_reply_to,
            references,
            attachments,
        };
        inbox.send(&envelope).await.map_err(Error::Inbox)
    }

    /// Stamp the conversation's first-reply time on the first successful
    /// outgoing send. Set-once in the store; only the stamping call
    /// broadcasts.
    async fn stamp_first_reply(&self, message: &Message) {
        if message.private {
            return;
        }
        match self
            .store
            .update_first_reply_at(message.conversation_uuid, message.created_at)
            .await
        {
            Ok(true) => {
                self.broadcaster.conversation_prop_update(
                    message.conversation_uuid,
                    "first_reply_at",
                    &message.created_at.to_rfc3339(),
                );
            }
            Ok(false) => {}
            Err(e) => {
                warn!(conversation_uuid = %message.conversation_uuid, error = %e, "Failed to stamp first reply")
            }
        }
    }
}
