//! Error types for the frontdesk pipeline.

use std::time::Duration;

use crate::agent::AgentTarget;
use crate::normalize::Channel;
use crate::tenant::{TenantId, TenantStatus};

/// Top-level error type for the pipeline.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Normalization error: {0}")]
    Normalize(#[from] NormalizeError),

    #[error("Tenant error: {0}")]
    Tenant(#[from] TenantError),

    #[error("Agent error: {0}")]
    Agent(#[from] AgentError),

    #[error("Escalation error: {0}")]
    Escalation(#[from] EscalationError),

    #[error("Pipeline error: {0}")]
    Pipeline(#[from] PipelineError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required configuration: {key}. {hint}")]
    MissingRequired { key: String, hint: String },

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Duplicate routing identity '{identity}' across tenants")]
    DuplicateRoute { identity: String },

    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Channel payload decoding errors.
///
/// A malformed payload is rejected and acknowledged to the channel so the
/// sender does not retry, but it is never silently dropped.
#[derive(Debug, thiserror::Error)]
pub enum NormalizeError {
    #[error("Malformed {channel} payload: {reason}")]
    MalformedPayload { channel: Channel, reason: String },

    #[error("Payload for {channel} is missing required field '{field}'")]
    MissingField { channel: Channel, field: String },

    #[error("Payload is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// Tenant resolution errors. Both are terminal for the turn and incur no
/// agent-capability cost.
#[derive(Debug, thiserror::Error)]
pub enum TenantError {
    #[error("No tenant bound to channel identity '{identity}'")]
    UnknownTenant { identity: String },

    #[error("Tenant {tenant_id} is {status}")]
    TenantInactive {
        tenant_id: TenantId,
        status: TenantStatus,
    },
}

/// Agent capability errors. Capability failure and deadline expiry are the
/// only kinds retried automatically.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("Capability call to {target} failed: {reason}")]
    CapabilityFailure { target: AgentTarget, reason: String },

    #[error("Capability call to {target} exceeded deadline of {deadline:?}")]
    DeadlineExceeded {
        target: AgentTarget,
        deadline: Duration,
    },

    #[error("Classification call exceeded deadline of {deadline:?}")]
    ClassificationTimeout { deadline: Duration },

    #[error("Classifier returned an unusable response: {0}")]
    InvalidClassification(String),
}

/// Escalation manager errors.
#[derive(Debug, thiserror::Error)]
pub enum EscalationError {
    #[error("No open escalation for user '{user_id}' under tenant {tenant_id}")]
    NotOpen { tenant_id: TenantId, user_id: String },

    #[error("Member directory found no match for '{query}'")]
    MemberNotFound { query: String },

    #[error("Member directory query '{query}' matched {count} members")]
    AmbiguousMember { query: String, count: usize },

    #[error("Directory lookup failed: {0}")]
    DirectoryFailed(String),
}

/// Pipeline-level errors.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Inbound queue is full (capacity {capacity}); retry later")]
    Overloaded { capacity: usize },

    #[error("Ingress is shut down")]
    ShutDown,
}

/// Result type alias for the pipeline.
pub type Result<T> = std::result::Result<T, Error>;
