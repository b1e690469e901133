//! Escalation Manager — human-handoff state per (tenant, user).
//!
//! State machine: `none → open → (linked) → resolved`, where resolving
//! removes the record so a later escalation can reopen. At most one open
//! escalation exists per key; `open` is idempotent and only refreshes the
//! reason. Escalations never expire silently — a human must resolve them.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::info;
use uuid::Uuid;

use crate::agent::{MemberDirectory, MemberRecord};
use crate::error::EscalationError;
use crate::session::{SessionKey, SessionStore};
use crate::tenant::TenantId;

/// An open human-handoff case.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Escalation {
    pub tenant_id: TenantId,
    pub user_id: String,
    pub reason: String,
    pub opened_at: DateTime<Utc>,
    pub linked_member_id: Option<String>,
    /// Token issued when identity verification succeeds.
    pub verification_token: Option<Uuid>,
}

/// Tracks open escalations and owns the resolve/link operations.
pub struct EscalationManager {
    open: RwLock<HashMap<SessionKey, Escalation>>,
    sessions: Arc<SessionStore>,
}

impl EscalationManager {
    pub fn new(sessions: Arc<SessionStore>) -> Self {
        Self {
            open: RwLock::new(HashMap::new()),
            sessions,
        }
    }

    /// Open (or refresh) the escalation for a key. Idempotent: an already
    /// open case keeps its `opened_at` and link, only the reason updates.
    pub async fn open(
        &self,
        tenant_id: TenantId,
        user_id: &str,
        reason: impl Into<String>,
    ) -> Escalation {
        let key = SessionKey::new(tenant_id, user_id);
        let reason = reason.into();
        let mut open = self.open.write().await;

        let escalation = open
            .entry(key)
            .and_modify(|e| {
                info!(tenant_id = %tenant_id, user_id, reason = %reason, "Refreshing open escalation");
                e.reason = reason.clone();
            })
            .or_insert_with(|| {
                info!(tenant_id = %tenant_id, user_id, reason = %reason, "Opening escalation");
                Escalation {
                    tenant_id,
                    user_id: user_id.to_string(),
                    reason: reason.clone(),
                    opened_at: Utc::now(),
                    linked_member_id: None,
                    verification_token: None,
                }
            });

        escalation.clone()
    }

    /// Link the escalated user to a member record resolved through the
    /// tenant's directory. The query must match exactly one member.
    pub async fn link_member(
        &self,
        directory: &dyn MemberDirectory,
        tenant_id: TenantId,
        user_id: &str,
        query: &str,
    ) -> Result<MemberRecord, EscalationError> {
        let key = SessionKey::new(tenant_id, user_id);
        {
            let open = self.open.read().await;
            if !open.contains_key(&key) {
                return Err(EscalationError::NotOpen {
                    tenant_id,
                    user_id: user_id.to_string(),
                });
            }
        }

        let mut matches = directory.search(tenant_id, query).await?;
        if matches.len() > 1 {
            return Err(EscalationError::AmbiguousMember {
                query: query.to_string(),
                count: matches.len(),
            });
        }
        let Some(member) = matches.pop() else {
            return Err(EscalationError::MemberNotFound {
                query: query.to_string(),
            });
        };

        let token = Uuid::new_v4();
        {
            let mut open = self.open.write().await;
            if let Some(escalation) = open.get_mut(&key) {
                escalation.linked_member_id = Some(member.member_id.clone());
                escalation.verification_token = Some(token);
            }
        }
        self.sessions
            .set_linked_member(&key, member.member_id.clone())
            .await;

        info!(
            tenant_id = %tenant_id,
            user_id,
            member_id = %member.member_id,
            "Linked escalation to member"
        );
        Ok(member)
    }

    /// Resolve the open escalation and clear the session's handoff flag so
    /// automated handling resumes.
    pub async fn resolve(
        &self,
        tenant_id: TenantId,
        user_id: &str,
    ) -> Result<Escalation, EscalationError> {
        let key = SessionKey::new(tenant_id, user_id);
        let escalation = {
            let mut open = self.open.write().await;
            open.remove(&key).ok_or(EscalationError::NotOpen {
                tenant_id,
                user_id: user_id.to_string(),
            })?
        };

        self.sessions.mark_handoff(&key, false).await;
        info!(tenant_id = %tenant_id, user_id, "Escalation resolved");
        Ok(escalation)
    }

    /// Whether an escalation is open for this key.
    pub async fn is_open(&self, tenant_id: TenantId, user_id: &str) -> bool {
        self.open
            .read()
            .await
            .contains_key(&SessionKey::new(tenant_id, user_id))
    }

    /// Open escalations for one tenant (operator surface).
    pub async fn open_for_tenant(&self, tenant_id: TenantId) -> Vec<Escalation> {
        self.open
            .read()
            .await
            .values()
            .filter(|e| e.tenant_id == tenant_id)
            .cloned()
            .collect()
    }

    /// Total open escalations across tenants.
    pub async fn open_count(&self) -> usize {
        self.open.read().await.len()
    }
}
