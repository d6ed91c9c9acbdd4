use std::collections::BTreeSet;

use axum::async_trait;
use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use uuid::Uuid;

use crate::error::EngineError;

/// Normalized set of role names, lowercased and deduplicated once at session
/// start. Replaces scattered shape checks on whatever the gateway forwards
/// (single role, comma list, mixed case).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoleSet(BTreeSet<String>);

impl RoleSet {
    pub fn normalize(raw: &str) -> Self {
        let roles = raw
            .split(',')
            .map(|r| r.trim().to_ascii_lowercase())
            .filter(|r| !r.is_empty())
            .collect();
        Self(roles)
    }

    pub fn is_admin(&self) -> bool {
        self.0.contains("admin")
    }

    pub fn contains(&self, role: &str) -> bool {
        self.0.contains(&role.to_ascii_lowercase())
    }
}

impl Default for RoleSet {
    fn default() -> Self {
        Self::normalize("student")
    }
}

/// Authenticated caller identity, resolved from the gateway headers. A
/// missing or malformed identity is "no user": every gated route rejects.
#[derive(Debug, Clone)]
pub struct Session {
    pub user_id: Uuid,
    pub roles: RoleSet,
}

impl Session {
    pub fn require_admin(&self) -> Result<(), EngineError> {
        if self.roles.is_admin() {
            Ok(())
        } else {
            Err(EngineError::InvalidSession)
        }
    }
}

#[async_trait]
impl<S> FromRequestParts<S> for Session
where
    S: Send + Sync,
{
    type Rejection = EngineError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let user_id = parts
            .headers
            .get("x-user-id")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| Uuid::parse_str(v).ok())
            .ok_or(EngineError::InvalidSession)?;

        let roles = parts
            .headers
            .get("x-user-roles")
            .and_then(|v| v.to_str().ok())
            .map(RoleSet::normalize)
            .unwrap_or_default();

        Ok(Session { user_id, roles })
    }
}
