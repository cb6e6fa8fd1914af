//! Dashboard authentication and plan-limit gating.
//!
//! Both concerns belong to external collaborators (the operator session
//! system and billing). The orchestrator consumes them through these
//! traits; the implementations here are the defaults used by tests and
//! single-tenant deployments.

use berth_core::OwnerId;
use berth_proto::DashboardIntent;

/// Resolves an incoming dashboard upgrade request to the owner it
/// belongs to. The operator session itself is established out of band.
#[async_trait::async_trait]
pub trait DashboardAuth: Send + Sync {
    /// Authenticate from the request's `Cookie` header. `None` rejects
    /// the connection.
    async fn authenticate(&self, cookie_header: Option<&str>) -> Option<OwnerId>;
}

/// Cookie-based stand-in for the operator session collaborator: reads the
/// owner ID straight from a named cookie. Production deployments
/// implement [`DashboardAuth`] against their session store instead.
pub struct CookieOwnerAuth {
    cookie_name: String,
}

impl CookieOwnerAuth {
    /// Create with the default cookie name `berth-owner`.
    #[must_use]
    pub fn new() -> Self {
        Self {
            cookie_name: "berth-owner".to_owned(),
        }
    }
}

impl Default for CookieOwnerAuth {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl DashboardAuth for CookieOwnerAuth {
    async fn authenticate(&self, cookie_header: Option<&str>) -> Option<OwnerId> {
        let header = cookie_header?;
        header.split(';').find_map(|pair| {
            let (name, value) = pair.trim().split_once('=')?;
            if name == self.cookie_name {
                value.parse().ok()
            } else {
                None
            }
        })
    }
}

/// Authorizes an intent against the owner's subscription limits and role.
/// Billing is a collaborator; the orchestrator only consults the verdict
/// *before* signing a command.
#[async_trait::async_trait]
pub trait LimitGate: Send + Sync {
    /// `Err` carries the operator-facing refusal reason.
    async fn check(&self, owner_id: OwnerId, intent: &DashboardIntent) -> Result<(), String>;
}

/// Gate that allows everything (tests, self-hosted single-tenant use).
pub struct AllowAllGate;

#[async_trait::async_trait]
impl LimitGate for AllowAllGate {
    async fn check(&self, _owner_id: OwnerId, _intent: &DashboardIntent) -> Result<(), String> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn cookie_auth_parses_the_named_cookie() {
        let auth = CookieOwnerAuth::new();
        let owner = OwnerId::new();
        let header = format!("theme=dark; berth-owner={owner}; lang=en");

        assert_eq!(auth.authenticate(Some(&header)).await, Some(owner));
        assert_eq!(auth.authenticate(Some("theme=dark")).await, None);
        assert_eq!(auth.authenticate(None).await, None);
    }

    #[tokio::test]
    async fn cookie_auth_rejects_malformed_ids() {
        let auth = CookieOwnerAuth::new();
        assert_eq!(
            auth.authenticate(Some("berth-owner=not-a-uuid")).await,
            None
        );
    }
}
