//! Session/Context Store — tenant-scoped short-term conversation state.
//!
//! Sessions are keyed by `(tenant_id, external_user_id)` and handed out as
//! `Arc<Mutex<_>>` so a turn holds the lock end-to-end; tokio's mutex is
//! fair, which gives strict arrival-order processing per key. The key map
//! itself is LRU-bounded, independent of the per-session inactivity TTL
//! (which is checked passively on access).

use std::collections::VecDeque;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use lru::LruCache;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::debug;

use crate::tenant::TenantId;

/// Key for all session state.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionKey {
    pub tenant_id: TenantId,
    pub user_id: String,
}

impl SessionKey {
    pub fn new(tenant_id: TenantId, user_id: impl Into<String>) -> Self {
        Self {
            tenant_id,
            user_id: user_id.into(),
        }
    }
}

/// Who produced a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnRole {
    User,
    Assistant,
}

/// One conversation turn in the bounded window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Turn {
    pub role: TurnRole,
    pub text: String,
    pub at: DateTime<Utc>,
}

/// An action class a pending confirmation refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Book,
    Cancel,
}

impl ActionKind {
    /// One-Way-Door actions require explicit re-confirmation.
    pub fn is_irreversible(&self) -> bool {
        matches!(self, Self::Cancel)
    }
}

/// An action or clarification awaiting the user's next message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PendingAction {
    /// An action awaiting a yes/no. `target` is the agent that raised the
    /// confirmation and will execute it; `reconfirmed` is set once the full
    /// details were explicitly restated to the user.
    Confirm {
        action: ActionKind,
        details: String,
        target: crate::agent::AgentTarget,
        reconfirmed: bool,
    },
    /// An open disambiguation between equally valid interpretations.
    Disambiguate {
        question: String,
        options: Vec<String>,
        target: crate::agent::AgentTarget,
    },
}

/// Per-(tenant, user) short-term conversation state.
#[derive(Debug, Clone)]
pub struct ConversationSession {
    pub recent_turns: VecDeque<Turn>,
    pub pending_action: Option<PendingAction>,
    pub handoff_active: bool,
    pub linked_member_id: Option<String>,
    pub last_active: DateTime<Utc>,
}

impl ConversationSession {
    fn new() -> Self {
        Self {
            recent_turns: VecDeque::new(),
            pending_action: None,
            handoff_active: false,
            linked_member_id: None,
            last_active: Utc::now(),
        }
    }

    /// Passive TTL: reset the session in place if it has been idle longer
    /// than `ttl`. Returns true if a reset happened.
    pub fn reset_if_expired(&mut self, ttl: Duration) -> bool {
        let idle = Utc::now().signed_duration_since(self.last_active);
        if idle.to_std().map(|d| d > ttl).unwrap_or(false) {
            *self = Self::new();
            true
        } else {
            false
        }
    }

    /// Append a turn, dropping the oldest once the window is full.
    pub fn append_turn(&mut self, role: TurnRole, text: impl Into<String>, window: usize) {
        self.recent_turns.push_back(Turn {
            role,
            text: text.into(),
            at: Utc::now(),
        });
        while self.recent_turns.len() > window {
            self.recent_turns.pop_front();
        }
        self.last_active = Utc::now();
    }

    pub fn set_pending_action(&mut self, action: PendingAction) {
        self.pending_action = Some(action);
        self.last_active = Utc::now();
    }

    pub fn clear_pending_action(&mut self) {
        self.pending_action = None;
        self.last_active = Utc::now();
    }

    pub fn mark_handoff(&mut self, active: bool) {
        self.handoff_active = active;
        self.last_active = Utc::now();
    }

    /// Immutable snapshot handed to the agent capability.
    pub fn context(&self) -> SessionContext {
        SessionContext {
            recent_turns: self.recent_turns.iter().cloned().collect(),
            linked_member_id: self.linked_member_id.clone(),
            handoff_active: self.handoff_active,
        }
    }
}

/// Read-only session snapshot for capability calls.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionContext {
    pub recent_turns: Vec<Turn>,
    pub linked_member_id: Option<String>,
    pub handoff_active: bool,
}

type SharedSession = Arc<Mutex<ConversationSession>>;

/// In-memory session store with an LRU-bounded key map.
pub struct SessionStore {
    sessions: Mutex<LruCache<SessionKey, SharedSession>>,
}

impl SessionStore {
    /// `capacity` bounds the number of live session keys, not turns.
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            sessions: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Fetch or create the session for a key.
    ///
    /// Returns the shared handle; callers lock it for the duration of a
    /// turn and run [`ConversationSession::reset_if_expired`] first.
    pub async fn get_or_create(&self, key: &SessionKey) -> SharedSession {
        let mut map = self.sessions.lock().await;
        if let Some(existing) = map.get(key) {
            return Arc::clone(existing);
        }
        debug!(tenant_id = %key.tenant_id, user_id = %key.user_id, "Creating session");
        let session = Arc::new(Mutex::new(ConversationSession::new()));
        map.put(key.clone(), Arc::clone(&session));
        session
    }

    /// Set or clear the handoff flag through the per-key serialized path.
    pub async fn mark_handoff(&self, key: &SessionKey, active: bool) {
        let session = self.get_or_create(key).await;
        let mut guard = session.lock().await;
        guard.mark_handoff(active);
    }

    /// Record a verified member identity on the session.
    pub async fn set_linked_member(&self, key: &SessionKey, member_id: impl Into<String>) {
        let session = self.get_or_create(key).await;
        let mut guard = session.lock().await;
        guard.linked_member_id = Some(member_id.into());
        guard.last_active = Utc::now();
    }

    /// Number of live session keys (for diagnostics).
    pub async fn len(&self) -> usize {
        self.sessions.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}
