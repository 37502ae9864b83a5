//! Authenticated identity attached to a connection.

use serde::{Deserialize, Serialize};

/// Claim type carrying the stable user identifier.
pub const NAME_IDENTIFIER_CLAIM: &str = "nameidentifier";

/// Claim type carrying role membership.
pub const ROLE_CLAIM: &str = "role";

/// A single `(type, value)` claim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claim {
    /// Claim type, e.g. `"role"`.
    #[serde(rename = "type")]
    pub kind: String,
    /// Claim value.
    pub value: String,
}

/// The caller's identity as established by the host before the handshake.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    /// Display name, if any.
    pub name: Option<String>,
    /// Whether the host authenticated this principal.
    pub authenticated: bool,
    /// Claims attached to the principal.
    pub claims: Vec<Claim>,
}

impl Principal {
    /// An authenticated principal with the given name.
    pub fn authenticated(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            authenticated: true,
            claims: Vec::new(),
        }
    }

    /// Add a claim (builder style).
    #[must_use]
    pub fn with_claim(mut self, kind: impl Into<String>, value: impl Into<String>) -> Self {
        self.claims.push(Claim {
            kind: kind.into(),
            value: value.into(),
        });
        self
    }

    /// First value of the given claim type.
    pub fn find_claim(&self, kind: &str) -> Option<&str> {
        self.claims
            .iter()
            .find(|c| c.kind == kind)
            .map(|c| c.value.as_str())
    }

    /// Whether a `role` claim with this value is present.
    pub fn is_in_role(&self, role: &str) -> bool {
        self.claims
            .iter()
            .any(|c| c.kind == ROLE_CLAIM && c.value == role)
    }
}
