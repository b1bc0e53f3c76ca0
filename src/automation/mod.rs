//! Automation rule engine.
//!
//! Evaluates stored rules against conversations on three trigger classes:
//! conversation creation, conversation update, and a periodic time sweep.
//! Triggers arrive over bounded channels and are fanned out to a small
//! worker pool; rules are held as a compiled snapshot that is rebuilt
//! whole on every rule change.

pub mod models;
pub mod store;

pub use models::{
    Action, CompiledRule, Condition, ConditionField, Operator, RuleDefinition, RuleRecord,
    RuleType,
};
pub use store::{MemoryRuleStore, RuleStore};

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use tokio::sync::{RwLock, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::AutomationConfig;
use crate::error::{AutomationError, Error, Result};
use crate::models::{Actor, Conversation, ConversationStatus, Priority};

/// Conversation read/mutate surface the engine drives. Implemented by the
/// message pipeline so rule actions flow through the same paths as manual
/// changes (activity records, broadcasts).
#[async_trait::async_trait]
pub trait ConversationApi: Send + Sync {
    async fn get_conversation(&self, uuid: Uuid) -> Result<Conversation>;

    async fn conversations_created_after(
        &self,
        after: DateTime<Utc>,
    ) -> Result<Vec<Conversation>>;

    async fn update_user_assignee(&self, uuid: Uuid, user_id: i64, actor: &Actor) -> Result<()>;

    async fn update_team_assignee(&self, uuid: Uuid, team_id: i64, actor: &Actor) -> Result<()>;

    async fn update_status(
        &self,
        uuid: Uuid,
        status: ConversationStatus,
        actor: &Actor,
    ) -> Result<()>;

    async fn update_priority(&self, uuid: Uuid, priority: Priority, actor: &Actor) -> Result<()>;
}

// ── Trigger channel ─────────────────────────────────────────────────

/// Producer side of the engine's trigger channels. Cheap to clone; held
/// by the pipeline. Sends never block: a full queue drops the trigger
/// with a warning.
#[derive(Clone)]
pub struct AutomationHandle {
    new_tx: mpsc::Sender<Uuid>,
    update_tx: mpsc::Sender<Uuid>,
    closed: Arc<AtomicBool>,
    /// Actor id the engine mutates conversations as. Updates made by this
    /// actor never re-enter the trigger queue: a rule whose actions keep
    /// its own conditions true would otherwise evaluate forever.
    engine_actor_id: i64,
}

impl AutomationHandle {
    pub fn trigger_new_conversation(&self, conversation_uuid: Uuid) {
        self.send(&self.new_tx, conversation_uuid, "new-conversation");
    }

    pub fn trigger_conversation_update(&self, conversation_uuid: Uuid, actor: &Actor) {
        if actor.id == self.engine_actor_id {
            debug!(%conversation_uuid, "Skipping update trigger for rule-driven change");
            return;
        }
        self.send(&self.update_tx, conversation_uuid, "conversation-update");
    }

    fn send(&self, tx: &mpsc::Sender<Uuid>, conversation_uuid: Uuid, kind: &'static str) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        if let Err(e) = tx.try_send(conversation_uuid) {
            warn!(%conversation_uuid, kind, error = %e, "Dropping automation trigger");
        }
    }
}

/// Consumer side of the trigger channels, drained by the engine's router.
pub struct TriggerReceivers {
    pub new_rx: mpsc::Receiver<Uuid>,
    pub update_rx: mpsc::Receiver<Uuid>,
}

/// Build a trigger channel pair of the given capacity. `engine_actor_id`
/// identifies the engine's own mutations so they are not re-triggered.
pub fn trigger_channel(capacity: usize, engine_actor_id: i64) -> (AutomationHandle, TriggerReceivers) {
    let (new_tx, new_rx) = mpsc::channel(capacity);
    let (update_tx, update_rx) = mpsc::channel(capacity);
    (
        AutomationHandle {
            new_tx,
            update_tx,
            closed: Arc::new(AtomicBool::new(false)),
            engine_actor_id,
        },
        TriggerReceivers { new_rx, update_rx },
    )
}

// ── Engine ──────────────────────────────────────────────────────────

/// A unit of work for the evaluation workers.
#[derive(Debug, Clone, Copy)]
struct Task {
    conversation_uuid: Uuid,
    rule_type: RuleType,
}

pub struct Engine {
    cfg: AutomationConfig,
    rule_store: Arc<dyn RuleStore>,
    /// Compiled snapshot of enabled rules; replaced whole on reload.
    rules: RwLock<Vec<CompiledRule>>,
    /// Set after pipeline construction via
    /// [`set_conversation_store`](Self::set_conversation_store).
    conversations: RwLock<Option<Arc<dyn ConversationApi>>>,
    /// Identity recorded on rule-driven mutations.
    actor: Actor,
    handle: AutomationHandle,
    receivers: std::sync::Mutex<Option<TriggerReceivers>>,
    tasks: tokio::sync::Mutex<Vec<JoinHandle<()>>>,
    shutdown: CancellationToken,
}

impl Engine {
    pub fn new(cfg: AutomationConfig, rule_store: Arc<dyn RuleStore>, actor: Actor) -> Arc<Self> {
        let (handle, receivers) = trigger_channel(cfg.queue_size, actor.id);
        Arc::new(Self {
            cfg,
            rule_store,
            rules: RwLock::new(Vec::new()),
            conversations: RwLock::new(None),
            actor,
            handle,
            receivers: std::sync::Mutex::new(Some(receivers)),
            tasks: tokio::sync::Mutex::new(Vec::new()),
            shutdown: CancellationToken::new(),
        })
    }

    /// Trigger producer for the pipeline.
    pub fn handle(&self) -> AutomationHandle {
        self.handle.clone()
    }

    /// Wire in the conversation surface. Must be called before
    /// [`start`](Self::start); split from construction because the
    /// pipeline holding the surface is built after the engine.
    pub async fn set_conversation_store(&self, api: Arc<dyn ConversationApi>) {
        *self.conversations.write().await = Some(api);
    }

    // ── Rule management ─────────────────────────────────────────────

    /// Rebuild the compiled snapshot from enabled rules. Rules that fail
    /// to compile are skipped with a warning rather than poisoning the
    /// snapshot.
    pub async fn reload(&self) -> Result<()> {
        let records = self.rule_store.get_enabled_rules().await.map_err(Error::Store)?;
        let mut compiled = Vec::with_capacity(records.len());
        for record in &records {
            match CompiledRule::compile(record) {
                Ok(rule) => compiled.push(rule),
                Err(e) => {
                    warn!(rule_id = record.id, rule = %record.name, error = %e, "Skipping rule that failed to compile")
                }
            }
        }
        info!(count = compiled.len(), "Automation rules loaded");
        *self.rules.write().await = compiled;
        Ok(())
    }

    pub async fn create_rule(&self, rule: RuleRecord) -> Result<RuleRecord> {
        // Validate before persisting.
        CompiledRule::compile(&rule).map_err(Error::Automation)?;
        let stored = self.rule_store.create_rule(rule).await.map_err(Error::Store)?;
        self.reload().await?;
        Ok(stored)
    }

    pub async fn update_rule(&self, rule: RuleRecord) -> Result<()> {
        CompiledRule::compile(&rule).map_err(Error::Automation)?;
        self.rule_store.update_rule(rule).await.map_err(Error::Store)?;
        self.reload().await
    }

    pub async fn delete_rule(&self, id: i64) -> Result<()> {
        self.rule_store.delete_rule(id).await.map_err(Error::Store)?;
        self.reload().await
    }

    pub async fn set_rule_enabled(&self, id: i64, enabled: bool) -> Result<()> {
        self.rule_store
            .set_rule_enabled(id, enabled)
            .await
            .map_err(Error::Store)?;
        self.reload().await
    }

    pub async fn get_rule(&self, id: i64) -> Result<RuleRecord> {
        match self.rule_store.get_rule(id).await {
            Ok(rule) => Ok(rule),
            Err(e) if e.is_not_found() => {
                Err(Error::Automation(AutomationError::RuleNotFound { id }))
            }
            Err(e) => Err(Error::Store(e)),
        }
    }

    pub async fn list_rules(&self) -> Result<Vec<RuleRecord>> {
        self.rule_store.list_rules().await.map_err(Error::Store)
    }

    pub async fn list_rules_by_type(&self, rule_type: RuleType) -> Result<Vec<RuleRecord>> {
        Ok(self
            .list_rules()
            .await?
            .into_iter()
            .filter(|r| r.rule_type == rule_type)
            .collect())
    }

    // ── Run loop ────────────────────────────────────────────────────

    /// Load rules and spawn the trigger router and evaluation workers.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        self.reload().await?;

        let receivers = {
            let mut slot = match self.receivers.lock() {
                Ok(slot) => slot,
                Err(poisoned) => poisoned.into_inner(),
            };
            slot.take()
        };
        let Some(mut receivers) = receivers else {
            warn!("Automation engine already started");
            return Ok(());
        };

        let (task_tx, task_rx) = mpsc::channel::<Task>(self.cfg.queue_size);
        let task_rx = Arc::new(tokio::sync::Mutex::new(task_rx));

        let mut tasks = self.tasks.lock().await;

        // Router: trigger channels and the sweep ticker feed one task queue.
        let engine = Arc::clone(self);
        let router_tx = task_tx.clone();
        tasks.push(tokio::spawn(async move {
            let start = tokio::time::Instant::now() + engine.cfg.sweep_interval;
            let mut sweep = tokio::time::interval_at(start, engine.cfg.sweep_interval);
            loop {
                tokio::select! {
                    _ = engine.shutdown.cancelled() => break,
                    trigger = receivers.new_rx.recv() => {
                        let Some(conversation_uuid) = trigger else { break };
                        engine.route(&router_tx, Task {
                            conversation_uuid,
                            rule_type: RuleType::NewConversation,
                        });
                    }
                    trigger = receivers.update_rx.recv() => {
                        let Some(conversation_uuid) = trigger else { break };
                        engine.route(&router_tx, Task {
                            conversation_uuid,
                            rule_type: RuleType::ConversationUpdate,
                        });
                    }
                    _ = sweep.tick() => {
                        engine.sweep(&router_tx).await;
                    }
                }
            }
            debug!("Automation router stopped");
        }));

        for worker_id in 0..self.cfg.workers.max(1) {
            let engine = Arc::clone(self);
            let task_rx = Arc::clone(&task_rx);
            tasks.push(tokio::spawn(async move {
                loop {
                    let task = {
                        let mut rx = task_rx.lock().await;
                        tokio::select! {
                            _ = engine.shutdown.cancelled() => None,
                            task = rx.recv() => task,
                        }
                    };
                    let Some(task) = task else { break };
                    engine.evaluate_conversation(task).await;
                }
                debug!(worker_id, "Automation worker stopped");
            }));
        }

        info!(workers = self.cfg.workers.max(1), "Automation engine started");
        Ok(())
    }

    /// Stop producers, cancel the run loop and wait for workers to drain.
    pub async fn shutdown(&self) {
        self.handle.closed.store(true, Ordering::Release);
        self.shutdown.cancel();
        let mut tasks = self.tasks.lock().await;
        for task in tasks.drain(..) {
            if let Err(e) = task.await {
                error!(error = %e, "Automation task panicked");
            }
        }
        info!("Automation engine stopped");
    }

    fn route(&self, task_tx: &mpsc::Sender<Task>, task: Task) {
        if let Err(e) = task_tx.try_send(task) {
            warn!(conversation_uuid = %task.conversation_uuid, error = %e, "Dropping automation task");
        }
    }

    /// Enqueue a time-trigger evaluation for every conversation in the
    /// lookback window.
    async fn sweep(&self, task_tx: &mpsc::Sender<Task>) {
        let api = self.conversations.read().await.clone();
        let Some(api) = api else {
            warn!("Sweep skipped: no conversation store wired");
            return;
        };
        let lookback = match chrono::Duration::from_std(self.cfg.lookback) {
            Ok(d) => d,
            Err(_) => chrono::Duration::days(30),
        };
        let after = Utc::now() - lookback;
        match api.conversations_created_after(after).await {
            Ok(conversations) => {
                debug!(count = conversations.len(), "Time-trigger sweep");
                for conversation in conversations {
                    self.route(
                        task_tx,
                        Task {
                            conversation_uuid: conversation.uuid,
                            rule_type: RuleType::TimeTrigger,
                        },
                    );
                }
            }
            Err(e) => error!(error = %e, "Sweep failed to list conversations"),
        }
    }

    /// Evaluate all rules of the task's type against one conversation.
    /// Failures are logged and isolated; one bad conversation never stops
    /// the worker.
    async fn evaluate_conversation(&self, task: Task) {
        let api = self.conversations.read().await.clone();
        let Some(api) = api else {
            warn!("Evaluation skipped: no conversation store wired");
            return;
        };
        let conversation = match api.get_conversation(task.conversation_uuid).await {
            Ok(conversation) => conversation,
            Err(e) => {
                warn!(conversation_uuid = %task.conversation_uuid, error = %e, "Conversation fetch failed");
                return;
            }
        };

        // Collect matches first so the snapshot lock is released before
        // any action runs; reload must never wait on a slow mutation.
        let matched: Vec<(String, Vec<Action>)> = {
            let rules = self.rules.read().await;
            rules
                .iter()
                .filter(|r| r.rule_type == task.rule_type)
                .filter_map(|r| {
                    r.evaluate(&conversation)
                        .map(|actions| (r.name.clone(), actions.to_vec()))
                })
                .collect()
        };
        for (rule_name, actions) in &matched {
            debug!(rule = %rule_name, conversation_uuid = %conversation.uuid, "Rule matched");
            for action in actions {
                if let Err(e) = self.apply_action(&*api, conversation.uuid, action).await {
                    error!(rule = %rule_name, conversation_uuid = %conversation.uuid, error = %e, "Rule action failed");
                }
            }
        }
    }

    async fn apply_action(
        &self,
        api: &dyn ConversationApi,
        conversation_uuid: Uuid,
        action: &Action,
    ) -> Result<()> {
        match action {
            Action::AssignUser { user_id } => {
                api.update_user_assignee(conversation_uuid, *user_id, &self.actor)
                    .await
            }
            Action::AssignTeam { team_id } => {
                api.update_team_assignee(conversation_uuid, *team_id, &self.actor)
                    .await
            }
            Action::SetStatus { status } => {
                api.update_status(conversation_uuid, *status, &self.actor).await
            }
            Action::SetPriority { priority } => {
                api.update_priority(conversation_uuid, *priority, &self.actor)
                    .await
            }
        }
    }
}
