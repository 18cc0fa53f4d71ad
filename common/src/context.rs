//! Request context carried through audited engine calls.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Correlation identifier for a single logical request.
/// Uses UUID v7 for time-ordered identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CorrelationId(Uuid);

impl CorrelationId {
    /// Create a new correlation ID.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// Parse from string.
    pub fn parse(s: &str) -> Result<Self, uuid::Error> {
        Ok(Self(Uuid::parse_str(s)?))
    }

    /// Get the underlying UUID.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Who is asking, on behalf of which tenant, under which correlation id.
///
/// Passed explicitly to audited entry points instead of being inferred from
/// call arguments.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestContext {
    /// Authenticated actor, if any.
    pub actor_id: Option<String>,
    /// Tenant the request belongs to, if any.
    pub tenant_id: Option<String>,
    /// Correlation id for log stitching.
    pub correlation_id: CorrelationId,
}

impl RequestContext {
    /// Context for internal jobs with no actor or tenant.
    pub fn system() -> Self {
        Self {
            actor_id: Some("system".to_string()),
            ..Default::default()
        }
    }

    /// Context for an actor.
    pub fn for_actor(actor_id: impl Into<String>) -> Self {
        Self {
            actor_id: Some(actor_id.into()),
            ..Default::default()
        }
    }

    /// Attach a tenant.
    pub fn with_tenant(mut self, tenant_id: impl Into<String>) -> Self {
        self.tenant_id = Some(tenant_id.into());
        self
    }

    /// Override the correlation id (e.g. propagated from an upstream header).
    pub fn with_correlation_id(mut self, correlation_id: CorrelationId) -> Self {
        self.correlation_id = correlation_id;
        self
    }

    pub fn actor(&self) -> &str {
        self.actor_id.as_deref().unwrap_or("anonymous")
    }

    pub fn tenant(&self) -> &str {
        self.tenant_id.as_deref().unwrap_or("-")
    }
}
