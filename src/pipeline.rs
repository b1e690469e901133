//! Turn processor — runs one inbound message end-to-end.
//!
//! Flow: normalize → resolve tenant → guardrail gate → (short-circuit reply
//! | session update → route → dispatch) → outbound publish. The guardrail
//! gate always runs before any capability call; the end user only ever sees
//! a normal reply, a clarification, or the fixed handoff message.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::timeout;
use tracing::{info, warn};

use crate::agent::{AgentCapability, AgentTarget};
use crate::config::PipelineConfig;
use crate::dispatch::{AgentDispatcher, DispatchOutcome};
use crate::error::{AgentError, ConfigError, Error, TenantError};
use crate::escalation::EscalationManager;
use crate::guardrail::{GuardrailAction, GuardrailConfig, GuardrailGate, SessionEffect};
use crate::normalize::{Channel, InboundMessage, normalize};
use crate::outbound::{OutboundBus, OutboundEvent, OutboundKind};
use crate::router::{IntentRouter, RouteDecision};
use crate::session::{
    ConversationSession, PendingAction, SessionContext, SessionKey, SessionStore, TurnRole,
};
use crate::tenant::{Tenant, TenantDirectory, TenantId};

/// Fixed reply for inactive tenants. No capability call is made.
pub const INACTIVE_TENANT_REPLY: &str =
    "This studio's messaging service is currently unavailable. Please contact the studio directly.";

/// Fixed reply when a turn ends in human handoff.
pub const HANDOFF_REPLY: &str =
    "Thanks for reaching out — a team member will follow up with you shortly.";

/// Fixed reply while a handoff is already active.
pub const HANDOFF_PENDING_REPLY: &str =
    "A team member is already looking into this and will get back to you.";

/// Fixed reply on emergency hard-routing.
pub const EMERGENCY_REPLY: &str =
    "We are treating this as an emergency and alerting studio staff right now.";

/// How a turn ended, for logging and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnOutcome {
    Replied,
    Clarified,
    Blocked,
    EmergencyRouted,
    HandedOff,
    HandoffPending,
    TenantInactive,
}

impl TurnOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Replied => "replied",
            Self::Clarified => "clarified",
            Self::Blocked => "blocked",
            Self::EmergencyRouted => "emergency_routed",
            Self::HandedOff => "handed_off",
            Self::HandoffPending => "handoff_pending",
            Self::TenantInactive => "tenant_inactive",
        }
    }
}

/// Composes normalizer, resolver, gate, store, router, dispatcher,
/// escalations and the outbound bus for single turns.
pub struct Processor {
    directory: Arc<TenantDirectory>,
    gates: HashMap<TenantId, GuardrailGate>,
    default_gate: GuardrailGate,
    sessions: Arc<SessionStore>,
    escalations: Arc<EscalationManager>,
    router: IntentRouter,
    dispatcher: AgentDispatcher,
    bus: Arc<OutboundBus>,
    config: PipelineConfig,
}

impl Processor {
    pub fn new(
        directory: Arc<TenantDirectory>,
        sessions: Arc<SessionStore>,
        escalations: Arc<EscalationManager>,
        capability: Arc<dyn AgentCapability>,
        bus: Arc<OutboundBus>,
        config: PipelineConfig,
    ) -> Result<Self, ConfigError> {
        let mut gates = HashMap::new();
        for tenant in directory.tenants() {
            gates.insert(tenant.id, GuardrailGate::compile(&tenant.guardrails)?);
        }
        let default_gate = GuardrailGate::compile(&GuardrailConfig::default())?;

        Ok(Self {
            directory,
            gates,
            default_gate,
            sessions,
            escalations,
            router: IntentRouter::new(Arc::clone(&capability), config.min_confidence),
            dispatcher: AgentDispatcher::new(capability, config.retry_backoff),
            bus,
            config,
        })
    }

    /// Normalize and process one raw channel payload.
    pub async fn handle(&self, channel: Channel, raw: &str) -> Result<TurnOutcome, Error> {
        let message = normalize(channel, raw)?;
        self.handle_message(message).await
    }

    /// Resolve the session key for a normalized message, for keyed
    /// dispatch. Publishes the fixed inactive notice itself; unroutable
    /// messages are acknowledged (logged) and yield `None`.
    pub fn actor_key(&self, message: &InboundMessage) -> Option<SessionKey> {
        match self.directory.resolve(message) {
            Ok((_, binding)) => Some(SessionKey::new(
                binding.tenant_id,
                message.external_user_id.clone(),
            )),
            Err(TenantError::TenantInactive { tenant_id, status }) => {
                info!(tenant_id = %tenant_id, %status, "Dropping turn for inactive tenant");
                self.bus.publish(OutboundEvent::new(
                    tenant_id,
                    message.channel,
                    &message.external_user_id,
                    OutboundKind::Notice,
                    INACTIVE_TENANT_REPLY,
                ));
                None
            }
            Err(TenantError::UnknownTenant { identity }) => {
                warn!(identity = %identity, channel = %message.channel, "No tenant for inbound identity");
                None
            }
        }
    }

    /// Process one normalized message end-to-end.
    pub async fn handle_message(&self, message: InboundMessage) -> Result<TurnOutcome, Error> {
        let (tenant, binding) = match self.directory.resolve(&message) {
            Ok(resolved) => resolved,
            Err(TenantError::TenantInactive { tenant_id, status }) => {
                info!(tenant_id = %tenant_id, %status, "Inactive tenant, fixed reply only");
                self.bus.publish(OutboundEvent::new(
                    tenant_id,
                    message.channel,
                    &message.external_user_id,
                    OutboundKind::Notice,
                    INACTIVE_TENANT_REPLY,
                ));
                return Ok(TurnOutcome::TenantInactive);
            }
            Err(e) => return Err(e.into()),
        };

        info!(
            tenant_id = %binding.tenant_id,
            channel = %message.channel,
            user_id = %message.external_user_id,
            "Processing turn"
        );

        let key = SessionKey::new(binding.tenant_id, message.external_user_id.clone());
        let shared = self.sessions.get_or_create(&key).await;
        // Held for the whole turn: per-key arrival-order serialization.
        let mut session = shared.lock().await;
        session.reset_if_expired(self.session_ttl(tenant));

        let gate = self.gates.get(&tenant.id).unwrap_or(&self.default_gate);
        let outcome = gate.evaluate(&message.raw_text, &session);
        let window = self.turn_window(tenant);

        match outcome.verdict.action {
            GuardrailAction::ForceRoute { target } => {
                // Emergency hard-route: the dispatcher is never invoked.
                self.escalations
                    .open(tenant.id, &key.user_id, "emergency keyword matched")
                    .await;
                session.mark_handoff(true);
                session.append_turn(TurnRole::User, &message.raw_text, window);
                session.append_turn(TurnRole::Assistant, EMERGENCY_REPLY, window);
                self.bus.publish(
                    OutboundEvent::new(
                        tenant.id,
                        message.channel,
                        &key.user_id,
                        OutboundKind::EmergencyRoute,
                        EMERGENCY_REPLY,
                    )
                    .with_target(target),
                );
                Ok(TurnOutcome::EmergencyRouted)
            }
            GuardrailAction::BlockWithReply { reply } => {
                apply_effects(&mut session, &outcome.effects, &message.raw_text);
                session.append_turn(TurnRole::User, &message.raw_text, window);
                session.append_turn(TurnRole::Assistant, &reply, window);
                self.bus.publish(OutboundEvent::new(
                    tenant.id,
                    message.channel,
                    &key.user_id,
                    OutboundKind::Clarification,
                    reply,
                ));
                Ok(TurnOutcome::Blocked)
            }
            GuardrailAction::Allow => {
                let shortcut = apply_effects(&mut session, &outcome.effects, &message.raw_text);

                let decision = if let Some(decision) = shortcut {
                    decision
                } else if session.handoff_active {
                    session.append_turn(TurnRole::User, &message.raw_text, window);
                    session.append_turn(TurnRole::Assistant, HANDOFF_PENDING_REPLY, window);
                    self.bus.publish(OutboundEvent::new(
                        tenant.id,
                        message.channel,
                        &key.user_id,
                        OutboundKind::Handoff,
                        HANDOFF_PENDING_REPLY,
                    ));
                    return Ok(TurnOutcome::HandoffPending);
                } else {
                    match self.classify_with_retry(tenant, &session, &message).await {
                        Ok(decision) => decision,
                        Err(e) => {
                            warn!(error = %e, "Classification failed twice, handing off");
                            return Ok(self
                                .hand_off(
                                    tenant,
                                    &key,
                                    &message,
                                    &mut session,
                                    "classification failed",
                                )
                                .await);
                        }
                    }
                };

                match decision {
                    RouteDecision::Clarify { reply, pending } => {
                        session.set_pending_action(pending);
                        session.append_turn(TurnRole::User, &message.raw_text, window);
                        session.append_turn(TurnRole::Assistant, &reply, window);
                        self.bus.publish(OutboundEvent::new(
                            tenant.id,
                            message.channel,
                            &key.user_id,
                            OutboundKind::Clarification,
                            reply,
                        ));
                        Ok(TurnOutcome::Clarified)
                    }
                    RouteDecision::Dispatch { target, text } => {
                        self.dispatch_turn(tenant, &key, &message, &mut session, target, &text)
                            .await
                    }
                }
            }
        }
    }

    async fn classify_with_retry(
        &self,
        tenant: &Tenant,
        session: &ConversationSession,
        message: &InboundMessage,
    ) -> Result<RouteDecision, Error> {
        let context = session.context();
        match self
            .route_with_deadline(tenant, &context, &message.raw_text)
            .await
        {
            Ok(decision) => Ok(decision),
            Err(first) => {
                warn!(error = %first, "Classification failed, retrying once");
                self.route_with_deadline(tenant, &context, &message.raw_text)
                    .await
                    .map_err(Error::from)
            }
        }
    }

    /// The classify call runs under the same per-turn deadline as dispatch;
    /// a hung classifier must not pin the session lock.
    async fn route_with_deadline(
        &self,
        tenant: &Tenant,
        context: &SessionContext,
        text: &str,
    ) -> Result<RouteDecision, AgentError> {
        let deadline = self.config.turn_deadline;
        match timeout(deadline, self.router.route(tenant, tenant.id, context, text)).await {
            Ok(result) => result,
            Err(_) => Err(AgentError::ClassificationTimeout { deadline }),
        }
    }

    async fn dispatch_turn(
        &self,
        tenant: &Tenant,
        key: &SessionKey,
        message: &InboundMessage,
        session: &mut ConversationSession,
        target: AgentTarget,
        text: &str,
    ) -> Result<TurnOutcome, Error> {
        let context = session.context();
        let window = self.turn_window(tenant);
        let outcome = self
            .dispatcher
            .dispatch(tenant.id, target, &context, text, self.config.turn_deadline)
            .await;

        match outcome {
            DispatchOutcome::Reply { text: reply } => {
                session.append_turn(TurnRole::User, &message.raw_text, window);
                session.append_turn(TurnRole::Assistant, &reply, window);
                self.bus.publish(OutboundEvent::new(
                    tenant.id,
                    message.channel,
                    &key.user_id,
                    OutboundKind::Reply,
                    reply,
                ));
                Ok(TurnOutcome::Replied)
            }
            DispatchOutcome::Confirmation { text: reply, pending } => {
                session.set_pending_action(pending);
                session.append_turn(TurnRole::User, &message.raw_text, window);
                session.append_turn(TurnRole::Assistant, &reply, window);
                self.bus.publish(OutboundEvent::new(
                    tenant.id,
                    message.channel,
                    &key.user_id,
                    OutboundKind::Clarification,
                    reply,
                ));
                Ok(TurnOutcome::Clarified)
            }
            DispatchOutcome::Escalate { reason } => {
                Ok(self.hand_off(tenant, key, message, session, &reason).await)
            }
        }
    }

    /// Open (or refresh) the escalation and publish the fixed handoff
    /// reply. Raw error detail never reaches the user.
    async fn hand_off(
        &self,
        tenant: &Tenant,
        key: &SessionKey,
        message: &InboundMessage,
        session: &mut ConversationSession,
        reason: &str,
    ) -> TurnOutcome {
        let window = self.turn_window(tenant);
        self.escalations.open(tenant.id, &key.user_id, reason).await;
        session.mark_handoff(true);
        session.append_turn(TurnRole::User, &message.raw_text, window);
        session.append_turn(TurnRole::Assistant, HANDOFF_REPLY, window);
        self.bus.publish(OutboundEvent::new(
            tenant.id,
            message.channel,
            &key.user_id,
            OutboundKind::Handoff,
            HANDOFF_REPLY,
        ));
        TurnOutcome::HandedOff
    }

    fn session_ttl(&self, tenant: &Tenant) -> Duration {
        tenant
            .session_ttl_secs
            .map(Duration::from_secs)
            .unwrap_or(self.config.session_ttl)
    }

    fn turn_window(&self, tenant: &Tenant) -> usize {
        tenant.recent_turns.unwrap_or(self.config.recent_turns)
    }
}

/// Apply guardrail session effects. A confirmed action or a resolved
/// disambiguation becomes an immediate dispatch decision.
fn apply_effects(
    session: &mut ConversationSession,
    effects: &[SessionEffect],
    raw_text: &str,
) -> Option<RouteDecision> {
    let mut decision = None;
    for effect in effects {
        match effect {
            SessionEffect::MarkReconfirmed => {
                if let Some(PendingAction::Confirm { reconfirmed, .. }) =
                    &mut session.pending_action
                {
                    *reconfirmed = true;
                }
            }
            SessionEffect::ExecuteConfirmed => {
                if let Some(PendingAction::Confirm {
                    details, target, ..
                }) = session.pending_action.take()
                {
                    decision = Some(RouteDecision::Dispatch {
                        target,
                        text: details,
                    });
                }
            }
            SessionEffect::ResolveDisambiguation { option } => {
                if let Some(PendingAction::Disambiguate { target, .. }) =
                    session.pending_action.take()
                {
                    decision = Some(RouteDecision::Dispatch {
                        target,
                        text: format!("{raw_text} [{option}]"),
                    });
                }
            }
        }
    }
    decision
}
