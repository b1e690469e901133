//! Guardrail Gate — deterministic, ordered pre-AI rule list.
//!
//! Evaluated top-to-bottom, first match wins, no scoring and no model call:
//! 1. Emergency keywords → hard route to the emergency agent (unconditional).
//! 2. One-Way-Door: irreversible pending action + bare affirmative requires
//!    a prior full-detail re-confirmation.
//! 3. Pending disambiguation: either the message names a variant, or the
//!    clarifying question is re-asked with a machine-parseable options line.
//! 4. Allow.
//!
//! The gate is pure: it never mutates the session. Mutations it implies are
//! returned as [`SessionEffect`]s and applied by the caller under the
//! session lock. Rule configuration is per-tenant; rule order and semantics
//! are fixed.

use std::collections::HashMap;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::agent::AgentTarget;
use crate::error::ConfigError;
use crate::session::{ActionKind, ConversationSession, PendingAction};

/// Bare affirmatives (en/de). A message is a bare affirmative when every
/// word of it is in this list.
const AFFIRMATIVE_WORDS: &[&str] = &[
    "yes", "y", "yep", "yeah", "ok", "okay", "sure", "please", "ja", "jo", "jep", "klar", "passt",
    "gerne", "bitte", "genau",
];

/// Per-tenant guardrail configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuardrailConfig {
    /// Keywords that force emergency routing. Matched case-insensitively on
    /// word boundaries.
    #[serde(default)]
    pub emergency_keywords: Vec<String>,
    /// Action kinds treated as irreversible (One-Way-Door).
    #[serde(default = "default_irreversible")]
    pub irreversible_actions: Vec<ActionKind>,
    /// Category → variant labels. Two or more variants for a classified
    /// category require the message to name one before dispatch.
    #[serde(default)]
    pub variants: HashMap<String, Vec<String>>,
}

fn default_irreversible() -> Vec<ActionKind> {
    vec![ActionKind::Cancel]
}

impl Default for GuardrailConfig {
    fn default() -> Self {
        Self {
            emergency_keywords: Vec::new(),
            irreversible_actions: default_irreversible(),
            variants: HashMap::new(),
        }
    }
}

/// What the gate decided.
#[derive(Debug, Clone, PartialEq)]
pub enum GuardrailAction {
    Allow,
    BlockWithReply { reply: String },
    ForceRoute { target: AgentTarget },
}

/// Verdict with the matched rule label for audit. Recomputed every
/// message, never cached.
#[derive(Debug, Clone)]
pub struct GuardrailVerdict {
    pub action: GuardrailAction,
    pub matched_rule: Option<&'static str>,
}

/// Session mutation implied by a verdict, applied by the caller.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEffect {
    /// The pending irreversible action was restated in full; the next bare
    /// affirmative executes it.
    MarkReconfirmed,
    /// The user named exactly one variant; clear the disambiguation and
    /// dispatch directly.
    ResolveDisambiguation { option: String },
    /// A re-confirmed pending action was affirmed; execute it.
    ExecuteConfirmed,
}

/// Verdict plus implied session effects.
#[derive(Debug, Clone)]
pub struct GateOutcome {
    pub verdict: GuardrailVerdict,
    pub effects: Vec<SessionEffect>,
}

impl GateOutcome {
    fn allow() -> Self {
        Self {
            verdict: GuardrailVerdict {
                action: GuardrailAction::Allow,
                matched_rule: None,
            },
            effects: Vec::new(),
        }
    }
}

/// Compiled per-tenant gate. Built once at config load, not per message.
pub struct GuardrailGate {
    emergency: Option<Regex>,
    irreversible: Vec<ActionKind>,
}

impl GuardrailGate {
    /// Compile a tenant's guardrail configuration.
    pub fn compile(config: &GuardrailConfig) -> Result<Self, ConfigError> {
        let emergency = if config.emergency_keywords.is_empty() {
            None
        } else {
            let alternation = config
                .emergency_keywords
                .iter()
                .map(|k| regex::escape(k.trim()))
                .collect::<Vec<_>>()
                .join("|");
            let pattern = format!(r"(?i)\b(?:{alternation})\b");
            Some(Regex::new(&pattern).map_err(|e| ConfigError::InvalidValue {
                key: "emergency_keywords".into(),
                message: e.to_string(),
            })?)
        };

        Ok(Self {
            emergency,
            irreversible: config.irreversible_actions.clone(),
        })
    }

    /// Evaluate the ordered rule list against one message.
    pub fn evaluate(&self, text: &str, session: &ConversationSession) -> GateOutcome {
        // Rule 1: emergency hard-route. Unconditional; runs before any
        // pending state is considered.
        if let Some(ref re) = self.emergency
            && re.is_match(text)
        {
            debug!(rule = "emergency_keyword", "Guardrail force-route");
            return GateOutcome {
                verdict: GuardrailVerdict {
                    action: GuardrailAction::ForceRoute {
                        target: AgentTarget::Emergency,
                    },
                    matched_rule: Some("emergency_keyword"),
                },
                effects: Vec::new(),
            };
        }

        // Rule 2: One-Way-Door confirmation.
        if let Some(PendingAction::Confirm {
            action,
            details,
            reconfirmed,
            ..
        }) = &session.pending_action
            && self.irreversible.contains(action)
            && is_bare_affirmative(text)
        {
            if *reconfirmed {
                return GateOutcome {
                    verdict: GuardrailVerdict {
                        action: GuardrailAction::Allow,
                        matched_rule: Some("one_way_door_confirmed"),
                    },
                    effects: vec![SessionEffect::ExecuteConfirmed],
                };
            }
            debug!(rule = "one_way_door", details = %details, "Guardrail block");
            return GateOutcome {
                verdict: GuardrailVerdict {
                    action: GuardrailAction::BlockWithReply {
                        reply: format!(
                            "This cannot be undone: {details}. Please confirm once more \
                             that you want to proceed."
                        ),
                    },
                    matched_rule: Some("one_way_door"),
                },
                effects: vec![SessionEffect::MarkReconfirmed],
            };
        }

        // Rule 3: pending disambiguation.
        if let Some(PendingAction::Disambiguate {
            question, options, ..
        }) = &session.pending_action
        {
            let named = named_options(text, options);
            if named.len() == 1 {
                return GateOutcome {
                    verdict: GuardrailVerdict {
                        action: GuardrailAction::Allow,
                        matched_rule: Some("disambiguation_resolved"),
                    },
                    effects: vec![SessionEffect::ResolveDisambiguation {
                        option: named[0].clone(),
                    }],
                };
            }
            debug!(rule = "disambiguation_pending", "Guardrail re-ask");
            return GateOutcome {
                verdict: GuardrailVerdict {
                    action: GuardrailAction::BlockWithReply {
                        reply: clarification_reply(question, options),
                    },
                    matched_rule: Some("disambiguation_pending"),
                },
                effects: Vec::new(),
            };
        }

        // Rule 4: default.
        GateOutcome::allow()
    }
}

/// Render a clarifying question with the machine-parseable options line.
pub fn clarification_reply(question: &str, options: &[String]) -> String {
    format!("{question}\noptions: {}", options.join(" | "))
}

/// True if the message consists only of affirmative words
/// ("ja bitte", "yes", "ok danke" is not — "danke" is not affirmative).
pub fn is_bare_affirmative(text: &str) -> bool {
    let words: Vec<String> = text
        .split_whitespace()
        .map(|w| {
            w.trim_matches(|c: char| !c.is_alphanumeric())
                .to_lowercase()
        })
        .filter(|w| !w.is_empty())
        .collect();
    !words.is_empty() && words.iter().all(|w| AFFIRMATIVE_WORDS.contains(&w.as_str()))
}

/// Options named by the message (case-insensitive containment).
pub(crate) fn named_options(text: &str, options: &[String]) -> Vec<String> {
    let lower = text.to_lowercase();
    options
        .iter()
        .filter(|o| lower.contains(&o.to_lowercase()))
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{ActionKind, PendingAction};
    use std::collections::VecDeque;

    fn session_with(pending: Option<PendingAction>) -> ConversationSession {
        ConversationSession {
            recent_turns: VecDeque::new(),
            pending_action: pending,
            handoff_active: false,
            linked_member_id: None,
            last_active: chrono::Utc::now(),
        }
    }

    fn studio_gate() -> GuardrailGate {
        GuardrailGate::compile(&GuardrailConfig {
            emergency_keywords: vec!["notruf".into(), "herzinfarkt".into(), "chest pain".into()],
            ..Default::default()
        })
        .unwrap()
    }

    // ── Rule 1: emergency ───────────────────────────────────────────

    #[test]
    fn emergency_keyword_forces_route() {
        let gate = studio_gate();
        let outcome = gate.evaluate("Hilfe, Herzinfarkt im Kursraum!", &session_with(None));
        assert_eq!(
            outcome.verdict.action,
            GuardrailAction::ForceRoute {
                target: AgentTarget::Emergency
            }
        );
        assert_eq!(outcome.verdict.matched_rule, Some("emergency_keyword"));
    }

    #[test]
    fn emergency_overrides_pending_state() {
        let gate = studio_gate();
        let session = session_with(Some(PendingAction::Confirm {
            action: ActionKind::Cancel,
            details: "delete@16:30".into(),
            target: AgentTarget::Booking,
            reconfirmed: true,
        }));
        let outcome = gate.evaluate("ja, aber jemand hat chest pain", &session);
        assert!(matches!(
            outcome.verdict.action,
            GuardrailAction::ForceRoute { .. }
        ));
    }

    #[test]
    fn emergency_matches_word_boundary_only() {
        let gate = GuardrailGate::compile(&GuardrailConfig {
            emergency_keywords: vec!["sos".into()],
            ..Default::default()
        })
        .unwrap();
        let outcome = gate.evaluate("Gibt es Kurse fuer Auslosositzungen?", &session_with(None));
        assert_eq!(outcome.verdict.action, GuardrailAction::Allow);
    }

    #[test]
    fn no_keywords_configured_never_force_routes() {
        let gate = GuardrailGate::compile(&GuardrailConfig::default()).unwrap();
        let outcome = gate.evaluate("notruf", &session_with(None));
        assert_eq!(outcome.verdict.action, GuardrailAction::Allow);
    }

    // ── Rule 2: One-Way-Door ────────────────────────────────────────

    #[test]
    fn unreconfirmed_cancel_blocks_bare_yes() {
        let gate = studio_gate();
        let session = session_with(Some(PendingAction::Confirm {
            action: ActionKind::Cancel,
            details: "delete the 16:30 session".into(),
            target: AgentTarget::Booking,
            reconfirmed: false,
        }));
        let outcome = gate.evaluate("yes", &session);
        match outcome.verdict.action {
            GuardrailAction::BlockWithReply { reply } => {
                assert!(reply.contains("delete the 16:30 session"));
            }
            other => panic!("Expected block, got {other:?}"),
        }
        assert_eq!(outcome.effects, vec![SessionEffect::MarkReconfirmed]);
    }

    #[test]
    fn reconfirmed_cancel_executes_on_affirmative() {
        let gate = studio_gate();
        let session = session_with(Some(PendingAction::Confirm {
            action: ActionKind::Cancel,
            details: "delete@16:30".into(),
            target: AgentTarget::Booking,
            reconfirmed: true,
        }));
        let outcome = gate.evaluate("ja bitte", &session);
        assert_eq!(outcome.verdict.action, GuardrailAction::Allow);
        assert_eq!(outcome.effects, vec![SessionEffect::ExecuteConfirmed]);
    }

    #[test]
    fn reversible_pending_action_is_not_gated() {
        let gate = studio_gate();
        let session = session_with(Some(PendingAction::Confirm {
            action: ActionKind::Book,
            details: "book-slot@18:00".into(),
            target: AgentTarget::Booking,
            reconfirmed: false,
        }));
        let outcome = gate.evaluate("yes", &session);
        assert_eq!(outcome.verdict.action, GuardrailAction::Allow);
        assert!(outcome.effects.is_empty());
    }

    #[test]
    fn non_affirmative_message_falls_through() {
        let gate = studio_gate();
        let session = session_with(Some(PendingAction::Confirm {
            action: ActionKind::Cancel,
            details: "delete@16:30".into(),
            target: AgentTarget::Booking,
            reconfirmed: false,
        }));
        let outcome = gate.evaluate("Wann habt ihr morgen offen?", &session);
        assert_eq!(outcome.verdict.action, GuardrailAction::Allow);
    }

    // ── Rule 3: disambiguation ──────────────────────────────────────

    fn disambiguation() -> PendingAction {
        PendingAction::Disambiguate {
            question: "Which Krafttraining session do you mean?".into(),
            options: vec!["mit Trainer".into(), "ohne Trainer".into()],
            target: AgentTarget::Booking,
        }
    }

    #[test]
    fn unresolved_disambiguation_reasks_with_options_line() {
        let gate = studio_gate();
        let session = session_with(Some(disambiguation()));
        let outcome = gate.evaluate("den Termin heute", &session);
        match outcome.verdict.action {
            GuardrailAction::BlockWithReply { reply } => {
                assert!(reply.contains("options: mit Trainer | ohne Trainer"));
            }
            other => panic!("Expected block, got {other:?}"),
        }
        assert!(outcome.effects.is_empty());
    }

    #[test]
    fn naming_a_variant_resolves_disambiguation() {
        let gate = studio_gate();
        let session = session_with(Some(disambiguation()));
        let outcome = gate.evaluate("Den ohne Trainer bitte", &session);
        assert_eq!(outcome.verdict.action, GuardrailAction::Allow);
        assert_eq!(
            outcome.effects,
            vec![SessionEffect::ResolveDisambiguation {
                option: "ohne Trainer".into()
            }]
        );
    }

    #[test]
    fn naming_both_variants_reasks() {
        let gate = studio_gate();
        let session = session_with(Some(disambiguation()));
        let outcome = gate.evaluate("mit Trainer oder ohne Trainer, egal", &session);
        assert!(matches!(
            outcome.verdict.action,
            GuardrailAction::BlockWithReply { .. }
        ));
    }

    // ── Rule 4 & helpers ────────────────────────────────────────────

    #[test]
    fn plain_message_is_allowed() {
        let gate = studio_gate();
        let outcome = gate.evaluate("Habt ihr Sonntag offen?", &session_with(None));
        assert_eq!(outcome.verdict.action, GuardrailAction::Allow);
        assert!(outcome.verdict.matched_rule.is_none());
    }

    #[test]
    fn bare_affirmative_lexicon() {
        assert!(is_bare_affirmative("ja bitte"));
        assert!(is_bare_affirmative("Yes!"));
        assert!(is_bare_affirmative("ok"));
        assert!(!is_bare_affirmative("ja, aber erst morgen"));
        assert!(!is_bare_affirmative(""));
        assert!(!is_bare_affirmative("nein"));
    }
}
