//! Message pipeline.
//!
//! Owns the bounded ingress queue and its workers, the pending-outgoing
//! scanner and dispatch pool, message status transitions, and
//! conversation mutations with their activity records. Every persisted
//! change is broadcast to hub subscribers after the store write, and
//! conversation changes feed the automation trigger channels.

mod incoming;
mod outgoing;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::automation::{AutomationHandle, ConversationApi};
use crate::config::PipelineConfig;
use crate::error::{Error, PipelineError, QueueError, Result};
use crate::hub::Broadcaster;
use crate::inbox::InboxRegistry;
use crate::models::{
    Actor, ActivityKind, Attachment, ContentType, Conversation, ConversationStatus,
    IncomingMessage, MAX_LAST_MESSAGE_LEN, Message, MessageDirection, MessageStatus, Priority,
    SenderType, activity_content,
};
use crate::store::ConversationStore;
use crate::template::TemplateRenderer;
use crate::textutil::sanitize_and_truncate;

pub struct Pipeline {
    cfg: PipelineConfig,
    store: Arc<dyn ConversationStore>,
    inboxes: Arc<InboxRegistry>,
    templates: Arc<dyn TemplateRenderer>,
    broadcaster: Broadcaster,
    automation: AutomationHandle,
    /// Outgoing message ids currently queued for or undergoing dispatch.
    in_flight: DashMap<i64, ()>,
    incoming_tx: mpsc::Sender<IncomingMessage>,
    incoming_rx: Mutex<Option<mpsc::Receiver<IncomingMessage>>>,
    closed: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    shutdown: CancellationToken,
}

impl Pipeline {
    pub fn new(
        cfg: PipelineConfig,
        store: Arc<dyn ConversationStore>,
        inboxes: Arc<InboxRegistry>,
        templates: Arc<dyn TemplateRenderer>,
        broadcaster: Broadcaster,
        automation: AutomationHandle,
    ) -> Arc<Self> {
        let (incoming_tx, incoming_rx) = mpsc::channel(cfg.incoming_queue_size);
        Arc::new(Self {
            cfg,
            store,
            inboxes,
            templates,
            broadcaster,
            automation,
            in_flight: DashMap::new(),
            incoming_tx,
            incoming_rx: Mutex::new(Some(incoming_rx)),
            closed: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
            shutdown: CancellationToken::new(),
        })
    }

    // ── Ingress ─────────────────────────────────────────────────────

    /// Hand an inbound message to the pipeline. Non-blocking: a full
    /// queue is the caller's signal to apply backpressure upstream.
    pub fn enqueue_incoming(&self, incoming: IncomingMessage) -> Result<()> {
        if incoming.message.direction != MessageDirection::Incoming {
            return Err(Error::Pipeline(PipelineError::InvalidMessage(format!(
                "expected incoming direction, got {}",
                incoming.message.direction
            ))));
        }
        if incoming.contact.email.trim().is_empty() {
            return Err(Error::Pipeline(PipelineError::InvalidMessage(
                "contact email is required".into(),
            )));
        }
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Queue(QueueError::Closed("incoming")));
        }
        self.incoming_tx
            .try_send(incoming)
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => Error::Queue(QueueError::Full("incoming")),
                mpsc::error::TrySendError::Closed(_) => {
                    Error::Queue(QueueError::Closed("incoming"))
                }
            })
    }

    // ── Run loop ────────────────────────────────────────────────────

    /// Spawn the ingress workers, the pending scanner and the dispatch
    /// pool.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let incoming_rx = self.incoming_rx.lock().await.take();
        let Some(incoming_rx) = incoming_rx else {
            warn!("Pipeline already started");
            return Ok(());
        };
        let incoming_rx = Arc::new(Mutex::new(incoming_rx));

        let mut tasks = self.tasks.lock().await;

        for worker_id in 0..self.cfg.incoming_workers.max(1) {
            let pipeline = Arc::clone(self);
            let incoming_rx = Arc::clone(&incoming_rx);
            tasks.push(tokio::spawn(async move {
                loop {
                    let next = {
                        let mut rx = incoming_rx.lock().await;
                        tokio::select! {
                            _ = pipeline.shutdown.cancelled() => None,
                            next = rx.recv() => next,
                        }
                    };
                    let Some(incoming) = next else { break };
                    if let Err(e) = pipeline.process_incoming(incoming).await {
                        error!(error = %e, "Failed to process incoming message");
                    }
                }
                debug!(worker_id, "Incoming worker stopped");
            }));
        }

        let (dispatch_tx, dispatch_rx) = mpsc::channel::<Message>(self.cfg.dispatch_queue_size);
        let dispatch_rx = Arc::new(Mutex::new(dispatch_rx));

        let pipeline = Arc::clone(self);
        tasks.push(tokio::spawn(async move {
            let mut tick = tokio::time::interval(pipeline.cfg.scan_interval);
            loop {
                tokio::select! {
                    _ = pipeline.shutdown.cancelled() => break,
                    _ = tick.tick() => pipeline.scan_pending(&dispatch_tx).await,
                }
            }
            debug!("Pending scanner stopped");
        }));

        for worker_id in 0..self.cfg.dispatch_workers.max(1) {
            let pipeline = Arc::clone(self);
            let dispatch_rx = Arc::clone(&dispatch_rx);
            tasks.push(tokio::spawn(async move {
                loop {
                    let next = {
                        let mut rx = dispatch_rx.lock().await;
                        tokio::select! {
                            _ = pipeline.shutdown.cancelled() => None,
                            next = rx.recv() => next,
                        }
                    };
                    let Some(message) = next else { break };
                    pipeline.dispatch_message(message).await;
                }
                debug!(worker_id, "Dispatch worker stopped");
            }));
        }

        info!(
            incoming_workers = self.cfg.incoming_workers.max(1),
            dispatch_workers = self.cfg.dispatch_workers.max(1),
            "Pipeline started"
        );
        Ok(())
    }

    /// Refuse new work, cancel the run loop and wait for workers.
    pub async fn shutdown(&self) {
        self.closed.store(true, Ordering::Release);
        self.shutdown.cancel();
        let mut tasks = self.tasks.lock().await;
        for task in tasks.drain(..) {
            if let Err(e) = task.await {
                error!(error = %e, "Pipeline task panicked");
            }
        }
        info!("Pipeline stopped");
    }

    // ── Replies ─────────────────────────────────────────────────────

    /// Record an agent reply. Public replies start `pending` and are
    /// picked up by the scanner; private notes are never dispatched and
    /// insert as `sent`.
    pub async fn insert_reply(
        &self,
        conversation_uuid: Uuid,
        content: String,
        content_type: ContentType,
        sender: &Actor,
        private: bool,
        attachments: Vec<Attachment>,
    ) -> Result<Message> {
        let conversation = self
            .store
            .get_conversation(conversation_uuid)
            .await
            .map_err(Error::Store)?;
        let mut message = Message {
            id: 0,
            uuid: Uuid::nil(),
            conversation_id: conversation.id,
            conversation_uuid: conversation.uuid,
            direction: MessageDirection::Outgoing,
            sender_id: sender.id,
            sender_type: SenderType::User,
            status: if private {
                MessageStatus::Sent
            } else {
                MessageStatus::Pending
            },
            content,
            content_type,
            source_id: None,
            in_reply_to: None,
            references: Vec::new(),
            attachments,
            private,
            inbox_id: conversation.inbox_id,
            subject: conversation.subject.clone(),
            meta: serde_json::json!({}),
            created_at: Utc::now(),
        };
        self.insert_message_record(&mut message).await?;
        Ok(message)
    }

    /// Shared insert path: persist the message and its attachments,
    /// refresh the conversation summary, then broadcast. Broadcast always
    /// follows persistence.
    pub(crate) async fn insert_message_record(&self, message: &mut Message) -> Result<()> {
        self.store.insert_message(message).await.map_err(Error::Store)?;
        for attachment in message.attachments.clone() {
            if let Err(e) = self.store.attach_file(message.id, attachment).await {
                // The message itself is durable; a lost attachment is
                // logged, not fatal.
                warn!(message_id = message.id, error = %e, "Failed to store attachment");
            }
        }
        let summary = sanitize_and_truncate(&message.content, MAX_LAST_MESSAGE_LEN);
        self.store
            .update_last_message(message.conversation_uuid, &summary, message.created_at)
            .await
            .map_err(Error::Store)?;
        self.broadcaster.new_message(message, MAX_LAST_MESSAGE_LEN);
        Ok(())
    }

    // ── Message status ──────────────────────────────────────────────

    /// Apply a forward status transition, enforcing the state machine.
    pub async fn transition_message(&self, uuid: Uuid, next: MessageStatus) -> Result<()> {
        let message = self.store.get_message(uuid).await.map_err(Error::Store)?;
        if !message.status.can_transition_to(next) {
            return Err(Error::Pipeline(PipelineError::InvalidStatusTransition {
                from: message.status,
                to: next,
            }));
        }
        self.store
            .update_message_status(uuid, next)
            .await
            .map_err(Error::Store)?;
        self.broadcaster.message_prop_update(
            message.conversation_uuid,
            uuid,
            "status",
            next.as_str(),
        );
        Ok(())
    }

    /// Reset an outgoing message to `pending` so the scanner retries it.
    /// The one deliberate exception to the forward-only state machine.
    pub async fn mark_pending(&self, uuid: Uuid) -> Result<()> {
        let message = self.store.get_message(uuid).await.map_err(Error::Store)?;
        if message.direction != MessageDirection::Outgoing {
            return Err(Error::Pipeline(PipelineError::InvalidMessage(format!(
                "only outgoing messages can be re-queued, got {}",
                message.direction
            ))));
        }
        self.store
            .update_message_status(uuid, MessageStatus::Pending)
            .await
            .map_err(Error::Store)?;
        self.broadcaster.message_prop_update(
            message.conversation_uuid,
            uuid,
            "status",
            MessageStatus::Pending.as_str(),
        );
        Ok(())
    }

    // ── Conversation mutations ──────────────────────────────────────

    /// Change conversation status: persist, record activity, broadcast,
    /// trigger update automation.
    pub async fn update_conversation_status(
        &self,
        uuid: Uuid,
        status: ConversationStatus,
        actor: &Actor,
    ) -> Result<()> {
        self.store
            .update_status(uuid, status)
            .await
            .map_err(Error::Store)?;
        self.record_activity(uuid, ActivityKind::StatusChange, status.as_str(), actor)
            .await?;
        self.broadcaster
            .conversation_prop_update(uuid, "status", status.as_str());
        self.automation.trigger_conversation_update(uuid, actor);
        Ok(())
    }

    pub async fn update_conversation_priority(
        &self,
        uuid: Uuid,
        priority: Priority,
        actor: &Actor,
    ) -> Result<()> {
        self.store
            .update_priority(uuid, priority)
            .await
            .map_err(Error::Store)?;
        self.record_activity(uuid, ActivityKind::PriorityChange, priority.as_str(), actor)
            .await?;
        self.broadcaster
            .conversation_prop_update(uuid, "priority", priority.as_str());
        self.automation.trigger_conversation_update(uuid, actor);
        Ok(())
    }

    /// Assign a conversation to a user. The assignee is additionally sent
    /// a `new_conversation` event so the conversation appears for them
    /// without a subscription.
    pub async fn assign_user(&self, uuid: Uuid, user_id: i64, actor: &Actor) -> Result<()> {
        self.store
            .update_user_assignee(uuid, user_id)
            .await
            .map_err(Error::Store)?;
        if actor.id == user_id {
            self.record_activity(uuid, ActivityKind::SelfAssign, "", actor).await?;
        } else {
            self.record_activity(
                uuid,
                ActivityKind::AssignedUserChange,
                &format!("user {user_id}"),
                actor,
            )
            .await?;
        }
        self.broadcaster
            .conversation_prop_update(uuid, "assigned_user_id", &user_id.to_string());
        let conversation = self
            .store
            .get_conversation(uuid)
            .await
            .map_err(Error::Store)?;
        self.broadcaster.new_conversation(&conversation, user_id);
        self.automation.trigger_conversation_update(uuid, actor);
        Ok(())
    }

    pub async fn assign_team(&self, uuid: Uuid, team_id: i64, actor: &Actor) -> Result<()> {
        self.store
            .update_team_assignee(uuid, team_id)
            .await
            .map_err(Error::Store)?;
        self.record_activity(
            uuid,
            ActivityKind::AssignedTeamChange,
            &format!("team {team_id}"),
            actor,
        )
        .await?;
        self.broadcaster
            .conversation_prop_update(uuid, "assigned_team_id", &team_id.to_string());
        self.automation.trigger_conversation_update(uuid, actor);
        Ok(())
    }

    /// Insert an activity record for a conversation change. Activity
    /// messages flow through the shared insert path so they update the
    /// summary and reach subscribers like any other message.
    async fn record_activity(
        &self,
        conversation_uuid: Uuid,
        kind: ActivityKind,
        new_value: &str,
        actor: &Actor,
    ) -> Result<()> {
        let conversation = self
            .store
            .get_conversation(conversation_uuid)
            .await
            .map_err(Error::Store)?;
        let mut message = Message {
            id: 0,
            uuid: Uuid::nil(),
            conversation_id: conversation.id,
            conversation_uuid,
            direction: MessageDirection::Activity,
            sender_id: actor.id,
            sender_type: SenderType::User,
            status: MessageStatus::Sent,
            content: activity_content(kind, new_value, &actor.name),
            content_type: ContentType::Text,
            source_id: None,
            in_reply_to: None,
            references: Vec::new(),
            attachments: Vec::new(),
            private: false,
            inbox_id: conversation.inbox_id,
            subject: None,
            meta: serde_json::json!({}),
            created_at: Utc::now(),
        };
        self.insert_message_record(&mut message).await
    }

    // ── Reads ───────────────────────────────────────────────────────

    pub async fn get_conversation(&self, uuid: Uuid) -> Result<Conversation> {
        self.store.get_conversation(uuid).await.map_err(Error::Store)
    }

    pub async fn get_message(&self, uuid: Uuid) -> Result<Message> {
        self.store.get_message(uuid).await.map_err(Error::Store)
    }

    /// Number of outgoing messages currently in flight (test hook).
    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }
}

/// The automation engine mutates conversations through the pipeline so
/// rule actions produce the same activity records and broadcasts as
/// manual changes. The engine's own mutations are filtered out of the
/// update trigger channel by [`AutomationHandle`].
#[async_trait::async_trait]
impl ConversationApi for Pipeline {
    async fn get_conversation(&self, uuid: Uuid) -> Result<Conversation> {
        Pipeline::get_conversation(self, uuid).await
    }

    async fn conversations_created_after(
        &self,
        after: chrono::DateTime<Utc>,
    ) -> Result<Vec<Conversation>> {
        self.store
            .get_conversations_created_after(after)
            .await
            .map_err(Error::Store)
    }

    async fn update_user_assignee(&self, uuid: Uuid, user_id: i64, actor: &Actor) -> Result<()> {
        self.assign_user(uuid, user_id, actor).await
    }

    async fn update_team_assignee(&self, uuid: Uuid, team_id: i64, actor: &Actor) -> Result<()> {
        self.assign_team(uuid, team_id, actor).await
    }

    async fn update_status(
        &self,
        uuid: Uuid,
        status: ConversationStatus,
        actor: &Actor,
    ) -> Result<()> {
        self.update_conversation_status(uuid, status, actor).await
    }

    async fn update_priority(&self, uuid: Uuid, priority: Priority, actor: &Actor) -> Result<()> {
        self.update_conversation_priority(uuid, priority, actor).await
    }
}
