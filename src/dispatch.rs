//! Agent Dispatcher — exactly one capability call per turn, one retry with
//! jittered backoff, then escalation.
//!
//! The dispatcher never surfaces a raw error to the end user: terminal
//! failure (second failure or deadline expiry) becomes an `Escalate`
//! outcome, which the turn processor turns into an open escalation and the
//! fixed handoff reply.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::time::timeout;
use tracing::{info, warn};

use crate::agent::{AgentCapability, AgentOutcome, AgentTarget};
use crate::error::AgentError;
use crate::session::{PendingAction, SessionContext};
use crate::tenant::TenantId;

/// Result of dispatching one turn to an agent.
#[derive(Debug, Clone)]
pub enum DispatchOutcome {
    Reply {
        text: String,
    },
    /// The agent asks for confirmation; `pending` is stored on the session.
    Confirmation {
        text: String,
        pending: PendingAction,
    },
    /// Terminal failure or agent-requested handoff.
    Escalate {
        reason: String,
    },
}

pub struct AgentDispatcher {
    capability: Arc<dyn AgentCapability>,
    retry_backoff: Duration,
}

impl AgentDispatcher {
    pub fn new(capability: Arc<dyn AgentCapability>, retry_backoff: Duration) -> Self {
        Self {
            capability,
            retry_backoff,
        }
    }

    /// Dispatch one turn to `target` under `deadline`.
    pub async fn dispatch(
        &self,
        tenant_id: TenantId,
        target: AgentTarget,
        context: &SessionContext,
        text: &str,
        deadline: Duration,
    ) -> DispatchOutcome {
        match self.call(tenant_id, target, context, text, deadline).await {
            Ok(outcome) => map_outcome(target, outcome),
            Err(first) => {
                warn!(
                    tenant_id = %tenant_id,
                    target = %target,
                    error = %first,
                    "Agent capability failed, retrying once"
                );
                tokio::time::sleep(self.backoff_with_jitter()).await;

                match self.call(tenant_id, target, context, text, deadline).await {
                    Ok(outcome) => map_outcome(target, outcome),
                    Err(second) => {
                        warn!(
                            tenant_id = %tenant_id,
                            target = %target,
                            error = %second,
                            "Agent capability failed twice, escalating"
                        );
                        DispatchOutcome::Escalate {
                            reason: format!("agent capability failed twice: {second}"),
                        }
                    }
                }
            }
        }
    }

    async fn call(
        &self,
        tenant_id: TenantId,
        target: AgentTarget,
        context: &SessionContext,
        text: &str,
        deadline: Duration,
    ) -> Result<AgentOutcome, AgentError> {
        match timeout(deadline, self.capability.respond(tenant_id, target, context, text)).await {
            Ok(result) => result,
            Err(_) => Err(AgentError::DeadlineExceeded { target, deadline }),
        }
    }

    fn backoff_with_jitter(&self) -> Duration {
        let base = self.retry_backoff.as_millis() as u64;
        let jitter = rand::thread_rng().gen_range(0..=base.max(1) / 2);
        Duration::from_millis(base + jitter)
    }
}

fn map_outcome(target: AgentTarget, outcome: AgentOutcome) -> DispatchOutcome {
    match outcome {
        AgentOutcome::Reply { text } => DispatchOutcome::Reply { text },
        AgentOutcome::RequestConfirmation {
            text,
            action,
            details,
            restated,
        } => {
            info!(action = ?action, details = %details, "Agent requested confirmation");
            DispatchOutcome::Confirmation {
                text,
                pending: PendingAction::Confirm {
                    action,
                    details,
                    target,
                    reconfirmed: restated,
                },
            }
        }
        AgentOutcome::Escalate { reason } => DispatchOutcome::Escalate { reason },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::agent::Classification;
    use crate::session::ActionKind;

    const DEADLINE: Duration = Duration::from_millis(200);

    /// Capability that fails the first `fail_first` respond calls.
    struct FlakyAgent {
        fail_first: usize,
        calls: AtomicUsize,
        reply: String,
    }

    impl FlakyAgent {
        fn new(fail_first: usize, reply: &str) -> Self {
            Self {
                fail_first,
                calls: AtomicUsize::new(0),
                reply: reply.into(),
            }
        }
    }

    #[async_trait]
    impl AgentCapability for FlakyAgent {
        async fn classify(
            &self,
            _tenant_id: TenantId,
            _context: &SessionContext,
            _text: &str,
        ) -> Result<Classification, AgentError> {
            unimplemented!("dispatcher tests never classify")
        }

        async fn respond(
            &self,
            _tenant_id: TenantId,
            target: AgentTarget,
            _context: &SessionContext,
            _text: &str,
        ) -> Result<AgentOutcome, AgentError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_first {
                Err(AgentError::CapabilityFailure {
                    target,
                    reason: "boom".into(),
                })
            } else {
                Ok(AgentOutcome::Reply {
                    text: self.reply.clone(),
                })
            }
        }
    }

    /// Capability whose respond never completes (drives deadline expiry).
    struct HangingAgent;

    #[async_trait]
    impl AgentCapability for HangingAgent {
        async fn classify(
            &self,
            _tenant_id: TenantId,
            _context: &SessionContext,
            _text: &str,
        ) -> Result<Classification, AgentError> {
            unimplemented!()
        }

        async fn respond(
            &self,
            _tenant_id: TenantId,
            _target: AgentTarget,
            _context: &SessionContext,
            _text: &str,
        ) -> Result<AgentOutcome, AgentError> {
            futures::future::pending().await
        }
    }

    fn context() -> SessionContext {
        SessionContext {
            recent_turns: vec![],
            linked_member_id: None,
            handoff_active: false,
        }
    }

    #[tokio::test]
    async fn first_call_success_returns_reply() {
        let agent = Arc::new(FlakyAgent::new(0, "done"));
        let dispatcher = AgentDispatcher::new(agent.clone(), Duration::from_millis(1));
        let outcome = dispatcher
            .dispatch(TenantId::new(), AgentTarget::Info, &context(), "hi", DEADLINE)
            .await;
        assert!(matches!(outcome, DispatchOutcome::Reply { text } if text == "done"));
        assert_eq!(agent.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn single_failure_is_retried_once() {
        let agent = Arc::new(FlakyAgent::new(1, "recovered"));
        let dispatcher = AgentDispatcher::new(agent.clone(), Duration::from_millis(1));
        let outcome = dispatcher
            .dispatch(TenantId::new(), AgentTarget::Booking, &context(), "hi", DEADLINE)
            .await;
        assert!(matches!(outcome, DispatchOutcome::Reply { text } if text == "recovered"));
        assert_eq!(agent.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn two_failures_escalate() {
        let agent = Arc::new(FlakyAgent::new(2, "never"));
        let dispatcher = AgentDispatcher::new(agent.clone(), Duration::from_millis(1));
        let outcome = dispatcher
            .dispatch(TenantId::new(), AgentTarget::Booking, &context(), "hi", DEADLINE)
            .await;
        assert!(matches!(outcome, DispatchOutcome::Escalate { .. }));
        // Exactly one retry, never more.
        assert_eq!(agent.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn deadline_expiry_twice_escalates() {
        let dispatcher = AgentDispatcher::new(Arc::new(HangingAgent), Duration::from_millis(1));
        let outcome = dispatcher
            .dispatch(
                TenantId::new(),
                AgentTarget::Info,
                &context(),
                "hi",
                Duration::from_millis(10),
            )
            .await;
        match outcome {
            DispatchOutcome::Escalate { reason } => {
                assert!(reason.contains("deadline"), "reason was: {reason}");
            }
            other => panic!("Expected escalate, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn confirmation_request_becomes_pending_action() {
        struct ConfirmingAgent;

        #[async_trait]
        impl AgentCapability for ConfirmingAgent {
            async fn classify(
                &self,
                _tenant_id: TenantId,
                _context: &SessionContext,
                _text: &str,
            ) -> Result<Classification, AgentError> {
                unimplemented!()
            }

            async fn respond(
                &self,
                _tenant_id: TenantId,
                _target: AgentTarget,
                _context: &SessionContext,
                _text: &str,
            ) -> Result<AgentOutcome, AgentError> {
                Ok(AgentOutcome::RequestConfirmation {
                    text: "Soll ich den Termin um 16:30 loeschen?".into(),
                    action: ActionKind::Cancel,
                    details: "delete@16:30".into(),
                    restated: true,
                })
            }
        }

        let dispatcher =
            AgentDispatcher::new(Arc::new(ConfirmingAgent), Duration::from_millis(1));
        let outcome = dispatcher
            .dispatch(
                TenantId::new(),
                AgentTarget::Booking,
                &context(),
                "loeschen",
                DEADLINE,
            )
            .await;
        match outcome {
            DispatchOutcome::Confirmation { pending, .. } => match pending {
                PendingAction::Confirm {
                    action,
                    details,
                    target,
                    reconfirmed,
                } => {
                    assert_eq!(action, ActionKind::Cancel);
                    assert_eq!(details, "delete@16:30");
                    // The pending action remembers which agent raised it.
                    assert_eq!(target, AgentTarget::Booking);
                    assert!(reconfirmed);
                }
                other => panic!("Expected confirm pending, got {other:?}"),
            },
            other => panic!("Expected confirmation, got {other:?}"),
        }
    }
}
