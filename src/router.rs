//! Intent Router — turns an allowed message into a dispatch target or a
//! clarification.
//!
//! The guardrail verdict always comes first; the router only runs when the
//! gate allowed the message, and it never guesses: low classifier
//! confidence, multiple candidate interpretations, or an unnamed variant
//! from the tenant's catalog all open a disambiguation instead of a
//! dispatch.

use std::sync::Arc;

use tracing::{debug, info};

use crate::agent::{AgentCapability, AgentTarget, Classification};
use crate::error::AgentError;
use crate::guardrail::{clarification_reply, named_options};
use crate::session::{PendingAction, SessionContext};
use crate::tenant::{Tenant, TenantId};

/// Outcome of routing an allowed message.
#[derive(Debug, Clone)]
pub enum RouteDecision {
    /// Dispatch to exactly one agent target.
    Dispatch { target: AgentTarget, text: String },
    /// Ask a clarifying question; `pending` is stored on the session so the
    /// follow-up resolves through the guardrail gate.
    Clarify {
        reply: String,
        pending: PendingAction,
    },
}

/// Classifier-backed router with a deterministic never-guess policy.
pub struct IntentRouter {
    capability: Arc<dyn AgentCapability>,
    min_confidence: f32,
}

impl IntentRouter {
    pub fn new(capability: Arc<dyn AgentCapability>, min_confidence: f32) -> Self {
        Self {
            capability,
            min_confidence,
        }
    }

    /// Classify and route one message.
    pub async fn route(
        &self,
        tenant: &Tenant,
        tenant_id: TenantId,
        context: &SessionContext,
        text: &str,
    ) -> Result<RouteDecision, AgentError> {
        let classification = self.capability.classify(tenant_id, context, text).await?;

        debug!(
            tenant_id = %tenant_id,
            target = %classification.target,
            confidence = classification.confidence,
            candidates = classification.candidates.len(),
            "Classification result"
        );

        // Multiple candidate interpretations, or a confidence the policy
        // does not trust: never guess.
        let labels = candidate_labels(&classification);
        if labels.len() > 1 || classification.confidence < self.min_confidence {
            let reply = clarification_reply(
                "I want to make sure I get this right — which of these do you mean?",
                &labels,
            );
            return Ok(RouteDecision::Clarify {
                reply,
                pending: PendingAction::Disambiguate {
                    question: "I want to make sure I get this right — which of these do you mean?"
                        .into(),
                    options: labels,
                    target: classification.target,
                },
            });
        }

        // Tenant variant catalog: a category with two or more configured
        // variants needs the message to name exactly one.
        if let Some(category) = &classification.category
            && let Some(variants) = tenant.guardrails.variants.get(category)
            && variants.len() >= 2
        {
            let named = named_options(text, variants);
            if named.len() != 1 {
                let question = format!(
                    "There is more than one {category} option: {}. Which one do you mean?",
                    variants.join(", ")
                );
                let reply = clarification_reply(&question, variants);
                info!(
                    tenant_id = %tenant_id,
                    category = %category,
                    "Opening variant disambiguation"
                );
                return Ok(RouteDecision::Clarify {
                    reply,
                    pending: PendingAction::Disambiguate {
                        question,
                        options: variants.clone(),
                        target: classification.target,
                    },
                });
            }
            // Named exactly one variant: proceed, carrying the variant.
            return Ok(RouteDecision::Dispatch {
                target: classification.target,
                text: format!("{text} [{}]", named[0]),
            });
        }

        Ok(RouteDecision::Dispatch {
            target: classification.target,
            text: text.to_string(),
        })
    }
}

/// Deduplicated candidate labels, preserving classifier order.
fn candidate_labels(classification: &Classification) -> Vec<String> {
    let mut labels: Vec<String> = Vec::new();
    for candidate in &classification.candidates {
        if !labels.contains(&candidate.label) {
            labels.push(candidate.label.clone());
        }
    }
    if labels.is_empty() {
        labels.push(classification.target.to_string());
    }
    labels
}
