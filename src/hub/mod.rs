//! Subscriber hub — tracks connected agent sessions and their
//! per-conversation subscriptions, and fans event payloads out to them.
//!
//! The pipeline and automation engine only see the [`Hub`] trait through
//! [`broadcast::Broadcaster`]; the websocket surface in [`ws`] drives the
//! concrete [`SessionHub`].

pub mod broadcast;
pub mod ws;

pub use broadcast::Broadcaster;

use std::collections::HashSet;

use dashmap::DashMap;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Per-session outbound buffer. A session that falls this far behind
/// starts losing events rather than stalling the broadcaster.
const SESSION_BUFFER: usize = 256;

/// Fan-out seam used by the broadcaster.
pub trait Hub: Send + Sync {
    /// User ids currently subscribed to a conversation.
    fn conversation_subscribers(&self, conversation_uuid: Uuid) -> Vec<i64>;

    /// Deliver a serialized event to every open session of the given
    /// users. Delivery is best-effort and never blocks.
    fn broadcast(&self, payload: &str, user_ids: &[i64]);
}

struct Session {
    user_id: i64,
    tx: mpsc::Sender<String>,
}

/// In-process hub keyed by session id. A user may hold several sessions
/// (multiple tabs); conversation subscriptions are per user and dropped
/// when the user's last session goes away.
#[derive(Default)]
pub struct SessionHub {
    sessions: DashMap<Uuid, Session>,
    user_sessions: DashMap<i64, HashSet<Uuid>>,
    conversation_subs: DashMap<Uuid, HashSet<i64>>,
    user_conversations: DashMap<i64, HashSet<Uuid>>,
}

impl SessionHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a session for a user. Returns the session id and the receiver
    /// the transport drains.
    pub fn register(&self, user_id: i64) -> (Uuid, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(SESSION_BUFFER);
        let session_id = Uuid::new_v4();
        self.sessions.insert(session_id, Session { user_id, tx });
        self.user_sessions
            .entry(user_id)
            .or_default()
            .insert(session_id);
        tracing::debug!(%session_id, user_id, "Session registered");
        (session_id, rx)
    }

    /// Close a session. When it was the user's last one, the user's
    /// conversation subscriptions are removed too.
    pub fn unregister(&self, session_id: Uuid) {
        let Some((_, session)) = self.sessions.remove(&session_id) else {
            return;
        };
        let user_id = session.user_id;
        let last_session = match self.user_sessions.get_mut(&user_id) {
            Some(mut sessions) => {
                sessions.remove(&session_id);
                sessions.is_empty()
            }
            None => true,
        };
        if last_session {
            self.user_sessions.remove(&user_id);
            if let Some((_, conversations)) = self.user_conversations.remove(&user_id) {
                for conversation in conversations {
                    if let Some(mut subs) = self.conversation_subs.get_mut(&conversation) {
                        subs.remove(&user_id);
                    }
                }
            }
        }
        tracing::debug!(%session_id, user_id, "Session unregistered");
    }

    pub fn subscribe_conversation(&self, user_id: i64, conversation_uuid: Uuid) {
        self.conversation_subs
            .entry(conversation_uuid)
            .or_default()
            .insert(user_id);
        self.user_conversations
            .entry(user_id)
            .or_default()
            .insert(conversation_uuid);
    }

    pub fn unsubscribe_conversation(&self, user_id: i64, conversation_uuid: Uuid) {
        if let Some(mut subs) = self.conversation_subs.get_mut(&conversation_uuid) {
            subs.remove(&user_id);
        }
        if let Some(mut conversations) = self.user_conversations.get_mut(&user_id) {
            conversations.remove(&conversation_uuid);
        }
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }
}

impl Hub for SessionHub {
    fn conversation_subscribers(&self, conversation_uuid: Uuid) -> Vec<i64> {
        self.conversation_subs
            .get(&conversation_uuid)
            .map(|subs| subs.iter().copied().collect())
            .unwrap_or_default()
    }

    fn broadcast(&self, payload: &str, user_ids: &[i64]) {
        for user_id in user_ids {
            let Some(sessions) = self.user_sessions.get(user_id) else {
                continue;
            };
            for session_id in sessions.iter() {
                if let Some(session) = self.sessions.get(session_id) {
                    // A slow consumer loses events; it must not stall us.
                    if session.tx.try_send(payload.to_string()).is_err() {
                        tracing::warn!(%session_id, user_id, "Session buffer full, dropping event");
                    }
                }
            }
        }
    }
}
