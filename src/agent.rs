//! Agent capability seam — the external reply/classification collaborator.
//!
//! Natural-language generation is out of scope; the pipeline only depends on
//! these traits. Tests inject mock implementations.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{AgentError, EscalationError};
use crate::session::SessionContext;
use crate::tenant::TenantId;

/// Closed set of reply-generating agent targets.
///
/// Dispatch is a match over this enum, never a stringly-typed lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentTarget {
    /// Safety hard-route; selected by the guardrail gate, never by the
    /// classifier alone.
    Emergency,
    /// Class/slot booking and cancellation.
    Booking,
    /// Contracts, freezes, membership questions.
    Membership,
    /// General studio Q&A (opening hours, prices, courses).
    Info,
}

impl std::fmt::Display for AgentTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Emergency => "emergency",
            Self::Booking => "booking",
            Self::Membership => "membership",
            Self::Info => "info",
        };
        write!(f, "{s}")
    }
}

/// One candidate interpretation returned by the classifier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntentCandidate {
    pub target: AgentTarget,
    /// Human-readable variant label (e.g. "Krafttraining mit Trainer").
    pub label: String,
}

/// Classifier output for one message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Classification {
    pub target: AgentTarget,
    /// Tenant-defined category the message was mapped to, if any
    /// (keys the tenant's variant catalog).
    pub category: Option<String>,
    pub confidence: f32,
    /// All candidate interpretations, including the top one.
    pub candidates: Vec<IntentCandidate>,
}

/// Result of a `respond` call.
#[derive(Debug, Clone)]
pub enum AgentOutcome {
    Reply {
        text: String,
    },
    /// The agent asks the user to confirm an action before executing it.
    /// `restated` is true when `text` spells out the full action details,
    /// which is what the One-Way-Door rule requires before a bare "yes"
    /// may execute an irreversible action.
    RequestConfirmation {
        text: String,
        action: crate::session::ActionKind,
        details: String,
        restated: bool,
    },
    /// The agent itself requests human handoff.
    Escalate {
        reason: String,
    },
}

/// External agent capability: classification and reply generation.
#[async_trait]
pub trait AgentCapability: Send + Sync {
    async fn classify(
        &self,
        tenant_id: TenantId,
        context: &SessionContext,
        text: &str,
    ) -> Result<Classification, AgentError>;

    async fn respond(
        &self,
        tenant_id: TenantId,
        target: AgentTarget,
        context: &SessionContext,
        text: &str,
    ) -> Result<AgentOutcome, AgentError>;
}

/// A member record from the tenant's directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemberRecord {
    pub member_id: String,
    pub display_name: String,
}

/// Member directory lookup, used only by the escalation link operation.
#[async_trait]
pub trait MemberDirectory: Send + Sync {
    async fn search(
        &self,
        tenant_id: TenantId,
        query: &str,
    ) -> Result<Vec<MemberRecord>, EscalationError>;
}
