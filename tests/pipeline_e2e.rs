//! End-to-end pipeline tests: ingress through dedup, threading and
//! conversation creation, then dispatch through the scanner and workers.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use deskrelay::automation::{
    Action, Condition, ConditionField, Engine, MemoryRuleStore, Operator, RuleDefinition,
    RuleRecord, RuleType, TriggerReceivers, trigger_channel,
};
use deskrelay::config::{AutomationConfig, PipelineConfig};
use deskrelay::error::{Error, InboxError, PipelineError, QueueError};
use deskrelay::hub::{Broadcaster, SessionHub};
use deskrelay::inbox::{ChannelKind, Inbox, InboxRegistry, OutgoingEnvelope};
use deskrelay::models::{
    Actor, Contact, ContentType, IncomingMessage, Message, MessageDirection, MessageStatus,
    Priority, SenderType,
};
use deskrelay::pipeline::Pipeline;
use deskrelay::store::{ConversationStore, MemoryStore};
use deskrelay::template::DefaultTemplates;

/// Test transport that records envelopes and can be made slow or failing.
struct RecordingInbox {
    sent: std::sync::Mutex<Vec<OutgoingEnvelope>>,
    fail: AtomicBool,
    delay: Duration,
    concurrent: AtomicUsize,
    max_concurrent: AtomicUsize,
}

impl RecordingInbox {
    fn new() -> Arc<Self> {
        Self::with_delay(Duration::ZERO)
    }

    fn with_delay(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            sent: std::sync::Mutex::new(Vec::new()),
            fail: AtomicBool::new(false),
            delay,
            concurrent: AtomicUsize::new(0),
            max_concurrent: AtomicUsize::new(0),
        })
    }

    fn sent_count(&self) -> usize {
        self.sent.lock().unwrap().len()
    }

    fn max_concurrency(&self) -> usize {
        self.max_concurrent.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Inbox for RecordingInbox {
    fn id(&self) -> i64 {
        1
    }

    fn channel(&self) -> ChannelKind {
        ChannelKind::Email
    }

    fn from_address(&self) -> &str {
        "support@helpdesk.test"
    }

    async fn send(&self, envelope: &OutgoingEnvelope) -> Result<(), InboxError> {
        let now = self.concurrent.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_concurrent.fetch_max(now, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.concurrent.fetch_sub(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            return Err(InboxError::SendFailed {
                channel: "email".into(),
                reason: "synthetic failure".into(),
            });
        }
        self.sent.lock().unwrap().push(envelope.clone());
        Ok(())
    }
}

struct Harness {
    pipeline: Arc<Pipeline>,
    store: Arc<MemoryStore>,
    triggers: TriggerReceivers,
    inbox: Arc<RecordingInbox>,
}

fn harness(cfg: PipelineConfig, inbox: Arc<RecordingInbox>) -> Harness {
    let store = Arc::new(MemoryStore::new());
    let registry = Arc::new(InboxRegistry::new());
    registry.register(inbox.clone());
    let (handle, triggers) = trigger_channel(64, 0);
    let pipeline = Pipeline::new(
        cfg,
        store.clone(),
        registry,
        Arc::new(DefaultTemplates::new()),
        Broadcaster::new(Arc::new(SessionHub::new())),
        handle,
    );
    Harness {
        pipeline,
        store,
        triggers,
        inbox,
    }
}

fn fast_config() -> PipelineConfig {
    PipelineConfig {
        incoming_workers: 1,
        dispatch_workers: 4,
        incoming_queue_size: 64,
        dispatch_queue_size: 64,
        scan_interval: Duration::from_millis(25),
    }
}

fn incoming(source_id: &str, subject: &str, content: &str) -> IncomingMessage {
    IncomingMessage {
        message: Message {
            id: 0,
            uuid: Uuid::nil(),
            conversation_id: 0,
            conversation_uuid: Uuid::nil(),
            direction: MessageDirection::Incoming,
            sender_id: 0,
            sender_type: SenderType::Contact,
            status: MessageStatus::Received,
            content: content.to_string(),
            content_type: ContentType::Text,
            source_id: Some(source_id.to_string()),
            in_reply_to: None,
            references: Vec::new(),
            attachments: Vec::new(),
            private: false,
            inbox_id: 1,
            subject: Some(subject.to_string()),
            meta: serde_json::json!({}),
            created_at: Utc::now(),
        },
        contact: Contact {
            id: 0,
            first_name: "Alice".into(),
            last_name: "Doe".into(),
            email: "alice@example.com".into(),
            inbox_id: 1,
        },
        inbox_id: 1,
    }
}

fn agent() -> Actor {
    Actor {
        id: 7,
        name: "Ana".into(),
    }
}

async fn wait_until<F, Fut>(mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    tokio::time::timeout(Duration::from_secs(3), async {
        loop {
            if condition().await {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[tokio::test]
async fn duplicate_source_id_is_processed_once() {
    let h = harness(fast_config(), RecordingInbox::new());
    h.pipeline.start().await.unwrap();

    h.pipeline
        .enqueue_incoming(incoming("<m1@x>", "Help", "first copy"))
        .unwrap();
    h.pipeline
        .enqueue_incoming(incoming("<m1@x>", "Help", "second copy"))
        .unwrap();

    wait_until(|| async { h.store.message_count().await == 1 }).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(h.store.message_count().await, 1);
    assert_eq!(h.store.conversation_count().await, 1);
    h.pipeline.shutdown().await;
}

#[tokio::test]
async fn reply_threads_onto_existing_conversation() {
    let mut h = harness(fast_config(), RecordingInbox::new());
    h.pipeline.start().await.unwrap();

    h.pipeline
        .enqueue_incoming(incoming("<m1@x>", "Broken login", "it is broken"))
        .unwrap();
    wait_until(|| async { h.store.conversation_count().await == 1 }).await;

    let mut reply = incoming("<m2@x>", "Re: Broken login", "still broken");
    reply.message.in_reply_to = Some("<m1@x>".into());
    h.pipeline.enqueue_incoming(reply).unwrap();

    wait_until(|| async { h.store.message_count().await == 2 }).await;
    assert_eq!(h.store.conversation_count().await, 1);

    // Exactly one new-conversation trigger for the whole thread.
    let first = h.triggers.new_rx.try_recv();
    assert!(first.is_ok());
    assert!(h.triggers.new_rx.try_recv().is_err());
    h.pipeline.shutdown().await;
}

#[tokio::test]
async fn new_conversation_seeds_subject_and_truncated_summary() {
    let mut h = harness(fast_config(), RecordingInbox::new());
    h.pipeline.start().await.unwrap();

    let long_body = "please help me, ".repeat(20);
    h.pipeline
        .enqueue_incoming(incoming("<m1@x>", "Help", &long_body))
        .unwrap();

    let conversation_uuid = tokio::time::timeout(Duration::from_secs(3), h.triggers.new_rx.recv())
        .await
        .expect("no new-conversation trigger")
        .expect("trigger channel closed");

    let conversation = h.store.get_conversation(conversation_uuid).await.unwrap();
    assert_eq!(conversation.subject.as_deref(), Some("Help"));
    let summary = conversation.last_message.expect("summary missing");
    assert!(summary.chars().count() <= 45);
    assert!(long_body.starts_with(&summary));
    assert!(conversation.last_message_at.is_some());
    h.pipeline.shutdown().await;
}

#[tokio::test]
async fn status_state_machine_is_enforced() {
    let h = harness(fast_config(), RecordingInbox::new());
    // Not started: messages stay where we put them.

    let contact_id = h
        .store
        .upsert_contact(&incoming("<x>", "s", "c").contact)
        .await
        .unwrap();
    let conversation = h
        .store
        .create_conversation(deskrelay::models::NewConversation {
            contact_id,
            inbox_id: 1,
            subject: Some("s".into()),
            last_message: None,
            last_message_at: None,
        })
        .await
        .unwrap();

    let message = h
        .pipeline
        .insert_reply(
            conversation.uuid,
            "hello".into(),
            ContentType::Html,
            &agent(),
            false,
            Vec::new(),
        )
        .await
        .unwrap();
    assert_eq!(message.status, MessageStatus::Pending);

    // Skipping states is rejected.
    let err = h
        .pipeline
        .transition_message(message.uuid, MessageStatus::Read)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        Error::Pipeline(PipelineError::InvalidStatusTransition {
            from: MessageStatus::Pending,
            to: MessageStatus::Read,
        })
    ));

    h.pipeline
        .transition_message(message.uuid, MessageStatus::Sent)
        .await
        .unwrap();
    h.pipeline
        .transition_message(message.uuid, MessageStatus::Delivered)
        .await
        .unwrap();
    h.pipeline
        .transition_message(message.uuid, MessageStatus::Read)
        .await
        .unwrap();

    // Backward transitions only through the explicit pending reset.
    assert!(
        h.pipeline
            .transition_message(message.uuid, MessageStatus::Pending)
            .await
            .is_err()
    );
    h.pipeline.mark_pending(message.uuid).await.unwrap();
    assert_eq!(
        h.pipeline.get_message(message.uuid).await.unwrap().status,
        MessageStatus::Pending
    );
}

#[tokio::test]
async fn pending_message_is_dispatched_at_most_once() {
    let inbox = RecordingInbox::with_delay(Duration::from_millis(150));
    let h = harness(fast_config(), inbox);

    let contact_id = h
        .store
        .upsert_contact(&incoming("<x>", "s", "c").contact)
        .await
        .unwrap();
    let conversation = h
        .store
        .create_conversation(deskrelay::models::NewConversation {
            contact_id,
            inbox_id: 1,
            subject: Some("s".into()),
            last_message: None,
            last_message_at: None,
        })
        .await
        .unwrap();
    let message = h
        .pipeline
        .insert_reply(
            conversation.uuid,
            "reply".into(),
            ContentType::Html,
            &agent(),
            false,
            Vec::new(),
        )
        .await
        .unwrap();

    // Several scan ticks elapse while the send is in flight.
    h.pipeline.start().await.unwrap();
    wait_until(|| async {
        h.pipeline.get_message(message.uuid).await.unwrap().status == MessageStatus::Sent
    })
    .await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(h.inbox.sent_count(), 1);
    assert_eq!(h.inbox.max_concurrency(), 1);
    assert_eq!(h.pipeline.in_flight_count(), 0);
    h.pipeline.shutdown().await;
}

#[tokio::test]
async fn failed_send_recovers_via_pending_reset() {
    let inbox = RecordingInbox::new();
    inbox.fail.store(true, Ordering::SeqCst);
    let h = harness(fast_config(), inbox);

    let contact_id = h
        .store
        .upsert_contact(&incoming("<x>", "s", "c").contact)
        .await
        .unwrap();
    let conversation = h
        .store
        .create_conversation(deskrelay::models::NewConversation {
            contact_id,
            inbox_id: 1,
            subject: Some("s".into()),
            last_message: None,
            last_message_at: None,
        })
        .await
        .unwrap();
    let message = h
        .pipeline
        .insert_reply(
            conversation.uuid,
            "reply".into(),
            ContentType::Html,
            &agent(),
            false,
            Vec::new(),
        )
        .await
        .unwrap();

    h.pipeline.start().await.unwrap();
    wait_until(|| async {
        h.pipeline.get_message(message.uuid).await.unwrap().status == MessageStatus::Failed
    })
    .await;
    assert_eq!(h.pipeline.in_flight_count(), 0);
    let conversation = h.store.get_conversation(conversation.uuid).await.unwrap();
    assert!(conversation.first_reply_at.is_none());

    // Operator retry: reset to pending, next scan picks it up.
    h.inbox.fail.store(false, Ordering::SeqCst);
    h.pipeline.mark_pending(message.uuid).await.unwrap();
    wait_until(|| async {
        h.pipeline.get_message(message.uuid).await.unwrap().status == MessageStatus::Sent
    })
    .await;

    assert_eq!(h.inbox.sent_count(), 1);
    let conversation = h.store.get_conversation(conversation.uuid).await.unwrap();
    // The stamp carries the reply's own timestamp, not the send time.
    let sent = h.pipeline.get_message(message.uuid).await.unwrap();
    assert_eq!(conversation.first_reply_at, Some(sent.created_at));
    h.pipeline.shutdown().await;
}

#[tokio::test]
async fn private_note_is_never_dispatched() {
    let h = harness(fast_config(), RecordingInbox::new());

    let contact_id = h
        .store
        .upsert_contact(&incoming("<x>", "s", "c").contact)
        .await
        .unwrap();
    let conversation = h
        .store
        .create_conversation(deskrelay::models::NewConversation {
            contact_id,
            inbox_id: 1,
            subject: Some("s".into()),
            last_message: None,
            last_message_at: None,
        })
        .await
        .unwrap();
    let note = h
        .pipeline
        .insert_reply(
            conversation.uuid,
            "internal note".into(),
            ContentType::Text,
            &agent(),
            true,
            Vec::new(),
        )
        .await
        .unwrap();
    assert_eq!(note.status, MessageStatus::Sent);

    h.pipeline.start().await.unwrap();
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(h.inbox.sent_count(), 0);
    h.pipeline.shutdown().await;
}

#[tokio::test]
async fn full_incoming_queue_applies_backpressure() {
    let cfg = PipelineConfig {
        incoming_queue_size: 1,
        ..fast_config()
    };
    let h = harness(cfg, RecordingInbox::new());
    // Workers not started: the first message occupies the only slot.

    h.pipeline
        .enqueue_incoming(incoming("<m1@x>", "a", "a"))
        .unwrap();
    let err = h
        .pipeline
        .enqueue_incoming(incoming("<m2@x>", "b", "b"))
        .unwrap_err();
    match err {
        Error::Queue(queue_err) => {
            assert_eq!(queue_err, QueueError::Full("incoming"));
            assert!(queue_err.is_retryable());
        }
        other => panic!("expected queue error, got {other}"),
    }
}

#[tokio::test]
async fn enqueue_rejects_malformed_messages() {
    let h = harness(fast_config(), RecordingInbox::new());

    let mut wrong_direction = incoming("<m1@x>", "a", "a");
    wrong_direction.message.direction = MessageDirection::Outgoing;
    assert!(matches!(
        h.pipeline.enqueue_incoming(wrong_direction),
        Err(Error::Pipeline(PipelineError::InvalidMessage(_)))
    ));

    let mut no_contact = incoming("<m2@x>", "a", "a");
    no_contact.contact.email = "  ".into();
    assert!(matches!(
        h.pipeline.enqueue_incoming(no_contact),
        Err(Error::Pipeline(PipelineError::InvalidMessage(_)))
    ));
}

#[tokio::test]
async fn enqueue_after_shutdown_is_rejected() {
    let h = harness(fast_config(), RecordingInbox::new());
    h.pipeline.start().await.unwrap();
    h.pipeline.shutdown().await;
    assert!(matches!(
        h.pipeline.enqueue_incoming(incoming("<m@x>", "a", "a")),
        Err(Error::Queue(QueueError::Closed("incoming")))
    ));
}

#[tokio::test]
async fn conversation_mutations_record_activity_and_trigger_updates() {
    let mut h = harness(fast_config(), RecordingInbox::new());
    h.pipeline.start().await.unwrap();

    h.pipeline
        .enqueue_incoming(incoming("<m1@x>", "Help", "body"))
        .unwrap();
    let conversation_uuid = tokio::time::timeout(Duration::from_secs(3), h.triggers.new_rx.recv())
        .await
        .expect("no trigger")
        .expect("closed");

    h.pipeline
        .update_conversation_status(
            conversation_uuid,
            deskrelay::models::ConversationStatus::Resolved,
            &agent(),
        )
        .await
        .unwrap();

    // Activity record lands next to the original message.
    assert_eq!(h.store.message_count().await, 2);
    let conversation = h.store.get_conversation(conversation_uuid).await.unwrap();
    assert_eq!(
        conversation.status,
        deskrelay::models::ConversationStatus::Resolved
    );
    assert_eq!(
        conversation.last_message.as_deref(),
        Some("Ana marked the conversation as resolved")
    );

    let updated = tokio::time::timeout(Duration::from_secs(1), h.triggers.update_rx.recv())
        .await
        .expect("no update trigger")
        .expect("closed");
    assert_eq!(updated, conversation_uuid);

    // Self-assignment gets its own wording.
    h.pipeline
        .assign_user(conversation_uuid, agent().id, &agent())
        .await
        .unwrap();
    let conversation = h.store.get_conversation(conversation_uuid).await.unwrap();
    assert_eq!(conversation.assigned_user_id, Some(agent().id));
    assert_eq!(
        conversation.last_message.as_deref(),
        Some("Ana self-assigned this conversation")
    );
    h.pipeline.shutdown().await;
}

/// Rules whose actions keep their own conditions true must settle after a
/// single rule-driven mutation instead of re-evaluating their own output
/// forever.
#[tokio::test]
async fn rule_driven_updates_do_not_feed_back_into_rules() {
    let store = Arc::new(MemoryStore::new());
    let registry = Arc::new(InboxRegistry::new());
    registry.register(RecordingInbox::new());

    let system = Actor {
        id: 0,
        name: "System".into(),
    };
    let engine = Engine::new(
        AutomationConfig {
            workers: 1,
            queue_size: 64,
            sweep_interval: Duration::from_secs(3600),
            lookback: Duration::from_secs(3600),
        },
        Arc::new(MemoryRuleStore::new()),
        system,
    );
    let pipeline = Pipeline::new(
        fast_config(),
        store.clone(),
        registry,
        Arc::new(DefaultTemplates::new()),
        Broadcaster::new(Arc::new(SessionHub::new())),
        engine.handle(),
    );
    engine.set_conversation_store(pipeline.clone()).await;

    // Matches every conversation with a subject, and its action leaves
    // the condition true.
    engine
        .create_rule(RuleRecord {
            id: 0,
            name: "escalate on update".into(),
            description: String::new(),
            rule_type: RuleType::ConversationUpdate,
            definitions: vec![RuleDefinition {
                conditions: vec![Condition {
                    field: ConditionField::Subject,
                    op: Operator::Set,
                    value: None,
                }],
                actions: vec![Action::SetPriority {
                    priority: Priority::Urgent,
                }],
            }],
            enabled: true,
        })
        .await
        .unwrap();
    engine.start().await.unwrap();
    pipeline.start().await.unwrap();

    pipeline
        .enqueue_incoming(incoming("<m1@x>", "Help", "body"))
        .unwrap();
    wait_until(|| async { store.conversation_count().await == 1 }).await;
    let conversation = store
        .get_conversations_created_after(Utc::now() - chrono::Duration::hours(1))
        .await
        .unwrap()
        .remove(0);

    pipeline
        .update_conversation_status(
            conversation.uuid,
            deskrelay::models::ConversationStatus::Resolved,
            &agent(),
        )
        .await
        .unwrap();

    // Incoming message, the agent's activity, the rule's activity. Then
    // the system settles: the rule's own update never re-fires it.
    wait_until(|| async { store.message_count().await >= 3 }).await;
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(store.message_count().await, 3);
    let conversation = store.get_conversation(conversation.uuid).await.unwrap();
    assert_eq!(conversation.priority, Some(Priority::Urgent));

    pipeline.shutdown().await;
    engine.shutdown().await;
}
