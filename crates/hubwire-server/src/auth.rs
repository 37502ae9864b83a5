//! Authorization and user-id seams.
//!
//! Transport authentication happens outside the hub; the host hands the
//! resulting [`Principal`] to the connection handler. These traits decide
//! what that principal may invoke and which user it maps to.

use async_trait::async_trait;
use hubwire_core::Principal;
use hubwire_core::principal::NAME_IDENTIFIER_CLAIM;

/// Checks a caller against a method's policies.
#[async_trait]
pub trait Authorizer: Send + Sync {
    /// `true` when `principal` satisfies every policy in `policies`.
    async fn authorize(&self, principal: Option<&Principal>, policies: &[String]) -> bool;
}

/// Treats each policy as a role name.
///
/// The reserved policy [`AUTHENTICATED_POLICY`] only requires an
/// authenticated principal. Anonymous callers fail every policy.
#[derive(Debug, Default, Clone, Copy)]
pub struct RoleAuthorizer;

/// Policy satisfied by any authenticated principal.
pub const AUTHENTICATED_POLICY: &str = "authenticated";

#[async_trait]
impl Authorizer for RoleAuthorizer {
    async fn authorize(&self, principal: Option<&Principal>, policies: &[String]) -> bool {
        let Some(principal) = principal.filter(|p| p.authenticated) else {
            return policies.is_empty();
        };
        policies
            .iter()
            .all(|policy| policy == AUTHENTICATED_POLICY || principal.is_in_role(policy))
    }
}

/// Maps a principal to the user id used by `send_user`.
#[cfg_attr(test, mockall::automock)]
pub trait UserIdProvider: Send + Sync {
    /// User id, or `None` for anonymous connections.
    fn user_id(&self, principal: &Principal) -> Option<String>;
}

/// Uses the name-identifier claim, falling back to the principal's name.
#[derive(Debug, Default, Clone, Copy)]
pub struct ClaimUserIdProvider;

impl UserIdProvider for ClaimUserIdProvider {
    fn user_id(&self, principal: &Principal) -> Option<String> {
        principal
            .find_claim(NAME_IDENTIFIER_CLAIM)
            .map(str::to_owned)
            .or_else(|| principal.name.clone())
    }
}
