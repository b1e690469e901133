use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, BufReader};

use frontdesk::agent::{
    AgentCapability, AgentOutcome, AgentTarget, Classification, IntentCandidate,
};
use frontdesk::config::{DeploymentConfig, PipelineConfig};
use frontdesk::error::AgentError;
use frontdesk::escalation::EscalationManager;
use frontdesk::guardrail::GuardrailConfig;
use frontdesk::ingress::Ingress;
use frontdesk::normalize::Channel;
use frontdesk::outbound::OutboundBus;
use frontdesk::pipeline::Processor;
use frontdesk::session::{ActionKind, SessionContext, SessionStore};
use frontdesk::tenant::{Tenant, TenantDirectory, TenantId, TenantRoutes, TenantStatus};

/// One line of stdin input: a channel name plus the channel's raw payload.
#[derive(Deserialize)]
struct Envelope {
    channel: Channel,
    payload: serde_json::Value,
}

/// Keyword demo capability so the pipeline runs without a model backend.
/// Production deployments plug in their own `AgentCapability`.
struct DemoCapability;

#[async_trait]
impl AgentCapability for DemoCapability {
    async fn classify(
        &self,
        _tenant_id: TenantId,
        _context: &SessionContext,
        text: &str,
    ) -> Result<Classification, AgentError> {
        let lower = text.to_lowercase();
        let (target, category, label) = if lower.contains("cancel")
            || lower.contains("storno")
            || lower.contains("loesche")
        {
            (AgentTarget::Booking, Some("cancel".to_string()), "cancel booking")
        } else if lower.contains("book") || lower.contains("termin") || lower.contains("kurs") {
            (AgentTarget::Booking, Some("book".to_string()), "book class")
        } else if lower.contains("membership") || lower.contains("vertrag") {
            (AgentTarget::Membership, None, "membership")
        } else {
            (AgentTarget::Info, None, "general info")
        };

        Ok(Classification {
            target,
            category,
            confidence: 0.9,
            candidates: vec![IntentCandidate {
                target,
                label: label.to_string(),
            }],
        })
    }

    async fn respond(
        &self,
        _tenant_id: TenantId,
        target: AgentTarget,
        _context: &SessionContext,
        text: &str,
    ) -> Result<AgentOutcome, AgentError> {
        let lower = text.to_lowercase();
        if lower.contains("cancel") || lower.contains("storno") || lower.contains("loesche") {
            return Ok(AgentOutcome::RequestConfirmation {
                text: format!("Soll ich wirklich stornieren? ({text})"),
                action: ActionKind::Cancel,
                details: text.to_string(),
                restated: true,
            });
        }
        Ok(AgentOutcome::Reply {
            text: format!("[{target}] {text}"),
        })
    }
}

fn demo_tenant() -> Tenant {
    Tenant {
        id: TenantId::new(),
        name: "Demo Studio".to_string(),
        status: TenantStatus::Active,
        routes: TenantRoutes {
            phone_numbers: vec!["+4910000".to_string()],
            bot_ids: vec!["demo-bot".to_string()],
            slugs: vec!["demo".to_string()],
        },
        guardrails: GuardrailConfig {
            emergency_keywords: vec!["emergency".to_string(), "notruf".to_string()],
            variants: [(
                "cancel".to_string(),
                vec!["mit Trainer".to_string(), "ohne Trainer".to_string()],
            )]
            .into_iter()
            .collect(),
            ..Default::default()
        },
        session_ttl_secs: None,
        recent_turns: None,
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    // Optional deployment config; falls back to a built-in demo tenant
    let (pipeline_config, tenants) = match std::env::var("FRONTDESK_CONFIG") {
        Ok(path) => {
            let deployment = DeploymentConfig::load(&path)?;
            let config = deployment.pipeline.apply(PipelineConfig::default())?;
            (config, deployment.tenants)
        }
        Err(_) => (PipelineConfig::default(), vec![demo_tenant()]),
    };

    eprintln!("📟 Frontdesk v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Tenants: {}", tenants.len());
    eprintln!(
        "   Queue: {} (max {} parallel turns)",
        pipeline_config.queue_capacity, pipeline_config.max_parallel_turns
    );
    eprintln!("   Feed envelopes on stdin: {{\"channel\": \"whatsapp\", \"payload\": {{...}}}}\n");

    let directory = Arc::new(TenantDirectory::new(tenants)?);
    let sessions = Arc::new(SessionStore::new(pipeline_config.session_capacity));
    let escalations = Arc::new(EscalationManager::new(Arc::clone(&sessions)));
    let bus = Arc::new(OutboundBus::new());
    let processor = Arc::new(Processor::new(
        directory,
        sessions,
        escalations,
        Arc::new(DemoCapability),
        Arc::clone(&bus),
        pipeline_config.clone(),
    )?);

    let (ingress, intake_handle) = Ingress::start(
        processor,
        pipeline_config.queue_capacity,
        pipeline_config.max_parallel_turns,
        pipeline_config.actor_idle_timeout,
    );

    // Print outbound events as JSON, one per line
    let mut outbound_rx = bus.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = outbound_rx.recv().await {
            match serde_json::to_string(&event) {
                Ok(json) => println!("{json}"),
                Err(e) => tracing::error!(error = %e, "Could not serialize outbound event"),
            }
        }
    });

    // Read envelopes from stdin until EOF
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let envelope: Envelope = match serde_json::from_str(line) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::warn!(error = %e, "Skipping malformed envelope");
                continue;
            }
        };
        if let Err(e) = ingress.submit(envelope.channel, envelope.payload.to_string()) {
            tracing::warn!(error = %e, "Turn rejected");
        }
    }

    drop(ingress);
    intake_handle.await?;
    Ok(())
}
