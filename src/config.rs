//! Configuration types.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;
use crate::tenant::Tenant;

/// Pipeline-wide runtime configuration. Per-tenant session TTL and
/// turn-window overrides live on the [`Tenant`] record.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Session inactivity TTL (passive eviction, checked on access).
    pub session_ttl: Duration,
    /// Bounded recent-turn window per session.
    pub recent_turns: usize,
    /// Deadline for one agent-capability call.
    pub turn_deadline: Duration,
    /// Base backoff before the single dispatch retry.
    pub retry_backoff: Duration,
    /// Minimum classifier confidence below which the router clarifies.
    pub min_confidence: f32,
    /// LRU bound on the session key map (keys, not turns).
    pub session_capacity: usize,
    /// Bounded inbound queue; overflow signals retry-later upstream.
    pub queue_capacity: usize,
    /// Cap on concurrently processing turns.
    pub max_parallel_turns: usize,
    /// Idle duration after which a per-key actor exits.
    pub actor_idle_timeout: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            session_ttl: Duration::from_secs(30 * 60),
            recent_turns: 12,
            turn_deadline: Duration::from_secs(20),
            retry_backoff: Duration::from_millis(500),
            min_confidence: 0.6,
            session_capacity: 10_000,
            queue_capacity: 256,
            max_parallel_turns: 16,
            actor_idle_timeout: Duration::from_secs(60),
        }
    }
}

/// JSON-loadable deployment configuration: tenants plus optional pipeline
/// overrides.
#[derive(Debug, Deserialize)]
pub struct DeploymentConfig {
    #[serde(default)]
    pub pipeline: PipelineOverrides,
    pub tenants: Vec<Tenant>,
}

/// Optional overrides applied on top of [`PipelineConfig::default`].
#[derive(Debug, Default, Deserialize)]
pub struct PipelineOverrides {
    pub session_ttl_secs: Option<u64>,
    pub recent_turns: Option<usize>,
    pub turn_deadline_ms: Option<u64>,
    pub retry_backoff_ms: Option<u64>,
    pub min_confidence: Option<f32>,
    pub session_capacity: Option<usize>,
    pub queue_capacity: Option<usize>,
    pub max_parallel_turns: Option<usize>,
    pub actor_idle_secs: Option<u64>,
}

impl PipelineOverrides {
    /// Merge these overrides onto a base config.
    pub fn apply(&self, mut base: PipelineConfig) -> Result<PipelineConfig, ConfigError> {
        if let Some(secs) = self.session_ttl_secs {
            base.session_ttl = Duration::from_secs(secs);
        }
        if let Some(n) = self.recent_turns {
            base.recent_turns = n;
        }
        if let Some(ms) = self.turn_deadline_ms {
            base.turn_deadline = Duration::from_millis(ms);
        }
        if let Some(ms) = self.retry_backoff_ms {
            base.retry_backoff = Duration::from_millis(ms);
        }
        if let Some(c) = self.min_confidence {
            if !(0.0..=1.0).contains(&c) {
                return Err(ConfigError::InvalidValue {
                    key: "min_confidence".into(),
                    message: format!("{c} is not in 0.0..=1.0"),
                });
            }
            base.min_confidence = c;
        }
        if let Some(n) = self.session_capacity {
            base.session_capacity = n;
        }
        if let Some(n) = self.queue_capacity {
            base.queue_capacity = n;
        }
        if let Some(n) = self.max_parallel_turns {
            base.max_parallel_turns = n;
        }
        if let Some(secs) = self.actor_idle_secs {
            base.actor_idle_timeout = Duration::from_secs(secs);
        }
        Ok(base)
    }
}

impl DeploymentConfig {
    /// Parse a deployment config from JSON.
    pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
        let config: Self =
            serde_json::from_str(raw).map_err(|e| ConfigError::ParseError(e.to_string()))?;
        if config.tenants.is_empty() {
            return Err(ConfigError::MissingRequired {
                key: "tenants".into(),
                hint: "at least one tenant must be configured".into(),
            });
        }
        Ok(config)
    }

    /// Load a deployment config from a JSON file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json(&raw)
    }
}
