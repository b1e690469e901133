//! Tenant model and resolver.
//!
//! A tenant is the isolation boundary: every downstream lookup and every
//! store key is namespaced by [`TenantId`]. Resolution is exact-match only
//! and fails closed — there is no default tenant.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{ConfigError, TenantError};
use crate::guardrail::GuardrailConfig;
use crate::normalize::{InboundMessage, TenantHint};

/// Stable tenant identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TenantId(pub Uuid);

impl TenantId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TenantId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TenantId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle status of a tenant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TenantStatus {
    Active,
    Suspended,
    TrialExpired,
}

impl std::fmt::Display for TenantStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Active => "active",
            Self::Suspended => "suspended",
            Self::TrialExpired => "trial_expired",
        };
        write!(f, "{s}")
    }
}

/// Channel identities routed to a tenant. Exact match only.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TenantRoutes {
    #[serde(default)]
    pub phone_numbers: Vec<String>,
    #[serde(default)]
    pub bot_ids: Vec<String>,
    #[serde(default)]
    pub slugs: Vec<String>,
}

/// A studio customer of the platform.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tenant {
    pub id: TenantId,
    pub name: String,
    pub status: TenantStatus,
    pub routes: TenantRoutes,
    #[serde(default)]
    pub guardrails: GuardrailConfig,
    /// Session inactivity TTL override in seconds.
    #[serde(default)]
    pub session_ttl_secs: Option<u64>,
    /// Recent-turn window override.
    #[serde(default)]
    pub recent_turns: Option<usize>,
}

/// A resolved, verified tenant binding for one message.
#[derive(Debug, Clone)]
pub struct TenantBinding {
    pub tenant_id: TenantId,
    pub verified_identity: String,
}

/// In-memory routing directory built from configuration.
pub struct TenantDirectory {
    tenants: HashMap<TenantId, Tenant>,
    by_phone: HashMap<String, TenantId>,
    by_bot: HashMap<String, TenantId>,
    by_slug: HashMap<String, TenantId>,
}

impl TenantDirectory {
    /// Build the directory; rejects duplicate routing identities.
    pub fn new(tenants: Vec<Tenant>) -> Result<Self, ConfigError> {
        let mut dir = Self {
            tenants: HashMap::new(),
            by_phone: HashMap::new(),
            by_bot: HashMap::new(),
            by_slug: HashMap::new(),
        };

        for tenant in tenants {
            for phone in &tenant.routes.phone_numbers {
                insert_unique(&mut dir.by_phone, phone, tenant.id)?;
            }
            for bot in &tenant.routes.bot_ids {
                insert_unique(&mut dir.by_bot, bot, tenant.id)?;
            }
            for slug in &tenant.routes.slugs {
                insert_unique(&mut dir.by_slug, slug, tenant.id)?;
            }
            dir.tenants.insert(tenant.id, tenant);
        }

        Ok(dir)
    }

    /// Map a normalized message to exactly one tenant.
    ///
    /// Unknown identity → [`TenantError::UnknownTenant`]; a resolved but
    /// non-active tenant → [`TenantError::TenantInactive`]. Both are
    /// terminal before any agent-capability call.
    pub fn resolve(
        &self,
        message: &InboundMessage,
    ) -> Result<(&Tenant, TenantBinding), TenantError> {
        let identity = message.tenant_hint.identity();
        let table = match &message.tenant_hint {
            TenantHint::PhoneNumber(_) => &self.by_phone,
            TenantHint::BotId(_) => &self.by_bot,
            TenantHint::RouteSlug(_) => &self.by_slug,
        };

        let tenant_id = *table.get(identity).ok_or_else(|| TenantError::UnknownTenant {
            identity: identity.to_string(),
        })?;

        // Table entries always point at a known tenant.
        let tenant = &self.tenants[&tenant_id];
        if tenant.status != TenantStatus::Active {
            return Err(TenantError::TenantInactive {
                tenant_id,
                status: tenant.status,
            });
        }

        Ok((
            tenant,
            TenantBinding {
                tenant_id,
                verified_identity: identity.to_string(),
            },
        ))
    }

    /// Look up a tenant by id.
    pub fn get(&self, tenant_id: TenantId) -> Option<&Tenant> {
        self.tenants.get(&tenant_id)
    }

    /// All configured tenants.
    pub fn tenants(&self) -> impl Iterator<Item = &Tenant> {
        self.tenants.values()
    }
}

fn insert_unique(
    table: &mut HashMap<String, TenantId>,
    identity: &str,
    tenant_id: TenantId,
) -> Result<(), ConfigError> {
    if table.insert(identity.to_string(), tenant_id).is_some() {
        return Err(ConfigError::DuplicateRoute {
            identity: identity.to_string(),
        });
    }
    Ok(())
}
