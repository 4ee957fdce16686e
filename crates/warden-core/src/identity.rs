//! Non-human identity model.
//!
//! Two kinds of principal exist, and the split is the whole point:
//! an orchestrator identity owns and manages jobs but holds no data-read
//! rights; a data-access identity is bound to exactly one scope and is the
//! identity jobs run as. No identity is ever both.
//!
//! Credential lifecycle:
//!
//! ```text
//!                    first successful exchange
//!     Pending ──────────────────────────────────► Active
//!                                                   │  ▲
//!                                         rotate    │  │ confirm_rotation
//!                                                   ▼  │
//!                                                 Rotating
//!
//!     any non-terminal state ──── revoke ────► Revoked (terminal)
//! ```
//!
//! Revocation is terminal; a revoked identity's ID is never reused.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::id::IdentityId;
use crate::scope::ScopeId;

/// The kind of a non-human identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IdentityKind {
    /// Owns and manages job definitions; never holds data-read rights.
    Orchestrator,
    /// Bound to one scope; jobs execute as this identity.
    DataAccess,
}

impl IdentityKind {
    /// Returns a lowercase label for logs and audit targets.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Orchestrator => "orchestrator",
            Self::DataAccess => "data_access",
        }
    }
}

impl std::fmt::Display for IdentityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Credential lifecycle state of an identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CredentialState {
    /// Registered with the identity provider, no successful token exchange yet.
    Pending,
    /// At least one token exchange has succeeded; the credential is usable.
    Active,
    /// A replacement secret exists; the old one stays valid until confirmation.
    Rotating,
    /// Explicitly torn down. Terminal.
    Revoked,
}

impl CredentialState {
    /// Returns true if this state permits transitioning to `next`.
    #[must_use]
    pub fn can_transition_to(&self, next: Self) -> bool {
        use CredentialState::{Active, Pending, Revoked, Rotating};
        matches!(
            (self, next),
            (Pending, Active)
                | (Active, Rotating)
                | (Rotating, Active)
                | (Pending | Active | Rotating, Revoked)
        )
    }

    /// Returns true if this is a terminal state.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Revoked)
    }

    /// Returns a lowercase label for logs and metrics.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Active => "active",
            Self::Rotating => "rotating",
            Self::Revoked => "revoked",
        }
    }
}

impl std::fmt::Display for CredentialState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A platform capability granted to an identity at registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Entitlement {
    /// Access to the shared workspace surface.
    WorkspaceAccess,
    /// Permission to issue SQL against governed data.
    SqlAccess,
    /// Permission to create compute clusters.
    ClusterCreate,
}

/// A non-human principal tracked by the identity registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    /// Unique identifier, never reused after revocation.
    pub identity_id: IdentityId,

    /// Orchestrator or data-access.
    pub kind: IdentityKind,

    /// The bound scope. `None` exactly when `kind` is orchestrator.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope_id: Option<ScopeId>,

    /// Name registered with the identity provider. Deterministic per
    /// kind + scope, which is what makes concurrent-creation recovery
    /// possible (look up by name, adopt the winner).
    pub display_name: String,

    /// Capabilities granted at registration.
    pub entitlements: Vec<Entitlement>,

    /// Current credential lifecycle state.
    pub credential_state: CredentialState,

    /// When the identity record was created.
    pub created_at: DateTime<Utc>,
}

impl Identity {
    /// Creates a new orchestrator identity in the `Pending` state.
    #[must_use]
    pub fn new_orchestrator() -> Self {
        Self {
            identity_id: IdentityId::generate(),
            kind: IdentityKind::Orchestrator,
            scope_id: None,
            display_name: orchestrator_display_name(),
            entitlements: vec![
                Entitlement::WorkspaceAccess,
                Entitlement::SqlAccess,
                Entitlement::ClusterCreate,
            ],
            credential_state: CredentialState::Pending,
            created_at: Utc::now(),
        }
    }

    /// Creates a new data-access identity for `scope_id` in the `Pending` state.
    #[must_use]
    pub fn new_data_access(scope_id: ScopeId) -> Self {
        let display_name = data_access_display_name(&scope_id);
        Self {
            identity_id: IdentityId::generate(),
            kind: IdentityKind::DataAccess,
            scope_id: Some(scope_id),
            display_name,
            entitlements: vec![Entitlement::WorkspaceAccess, Entitlement::SqlAccess],
            credential_state: CredentialState::Pending,
            created_at: Utc::now(),
        }
    }

    /// Returns true if the identity has been revoked.
    #[must_use]
    pub const fn is_revoked(&self) -> bool {
        self.credential_state.is_terminal()
    }
}

/// The provider-facing display name of the orchestrator identity.
#[must_use]
pub fn orchestrator_display_name() -> String {
    "export-orchestrator".to_string()
}

/// The provider-facing display name of a scope's data-access identity.
#[must_use]
pub fn data_access_display_name(scope_id: &ScopeId) -> String {
    format!("export-worker-{scope_id}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn credential_state_transitions() {
        use CredentialState::{Active, Pending, Revoked, Rotating};

        assert!(Pending.can_transition_to(Active));
        assert!(Active.can_transition_to(Rotating));
        assert!(Rotating.can_transition_to(Active));
        assert!(Pending.can_transition_to(Revoked));
        assert!(Active.can_transition_to(Revoked));
        assert!(Rotating.can_transition_to(Revoked));

        // No path back out of Revoked, and no skipping Pending -> Rotating.
        assert!(!Revoked.can_transition_to(Active));
        assert!(!Revoked.can_transition_to(Pending));
        assert!(!Pending.can_transition_to(Rotating));
        assert!(!Active.can_transition_to(Pending));
    }

    #[test]
    fn revoked_is_the_only_terminal_state() {
        assert!(CredentialState::Revoked.is_terminal());
        assert!(!CredentialState::Pending.is_terminal());
        assert!(!CredentialState::Active.is_terminal());
        assert!(!CredentialState::Rotating.is_terminal());
    }

    #[test]
    fn orchestrator_has_no_scope() {
        let identity = Identity::new_orchestrator();
        assert_eq!(identity.kind, IdentityKind::Orchestrator);
        assert!(identity.scope_id.is_none());
        assert_eq!(identity.credential_state, CredentialState::Pending);
        assert!(identity.entitlements.contains(&Entitlement::ClusterCreate));
    }

    #[test]
    fn data_access_is_scoped_and_cannot_create_clusters() {
        let scope = ScopeId::new("us").unwrap();
        let identity = Identity::new_data_access(scope.clone());
        assert_eq!(identity.kind, IdentityKind::DataAccess);
        assert_eq!(identity.scope_id, Some(scope));
        assert_eq!(identity.display_name, "export-worker-us");
        assert!(!identity.entitlements.contains(&Entitlement::ClusterCreate));
    }

    #[test]
    fn display_names_are_deterministic() {
        let scope = ScopeId::new("eu").unwrap();
        assert_eq!(data_access_display_name(&scope), "export-worker-eu");
        assert_eq!(
            data_access_display_name(&scope),
            data_access_display_name(&scope)
        );
        assert_eq!(orchestrator_display_name(), "export-orchestrator");
    }

    #[test]
    fn identity_serializes_states_screaming_snake() {
        let identity = Identity::new_data_access(ScopeId::new("us").unwrap());
        let json = serde_json::to_value(&identity).unwrap();
        assert_eq!(json["kind"], "DATA_ACCESS");
        assert_eq!(json["credentialState"], "PENDING");
        assert_eq!(json["entitlements"][0], "workspace-access");
    }
}
