//! Abstract contracts for the external platform collaborators.
//!
//! The engine never talks to a concrete identity provider, catalog, or
//! execution engine; it talks to these ports. Each port ships with an
//! in-memory implementation in [`memory`] used by tests and the driver
//! binary; production adapters for the real platform live outside this
//! crate behind the same traits.
//!
//! Credential and token types deliberately redact their secret fields in
//! `Debug` output so they can appear in logs and error context without
//! leaking material.

pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use warden_core::{
    AccessControlGroup, AssetRef, Entitlement, GroupId, IdentityId, JobId, PolicyRef, RunHandle,
    ScopeId,
};

use crate::error::Result;
use crate::job::JobDraft;

/// A long-lived application credential held by the broker.
///
/// One application can carry multiple secrets at once; that is what makes
/// two-phase rotation possible without a no-valid-credential window.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppCredential {
    /// Provider-assigned application id. Stable across secret rotation.
    pub application_id: String,

    /// Provider-assigned id of this particular secret.
    pub credential_id: String,

    /// The secret itself. Never logged, never audited.
    pub secret: String,

    /// When the secret was issued.
    pub issued_at: DateTime<Utc>,
}

impl std::fmt::Debug for AppCredential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppCredential")
            .field("application_id", &self.application_id)
            .field("credential_id", &self.credential_id)
            .field("secret", &"[REDACTED]")
            .field("issued_at", &self.issued_at)
            .finish()
    }
}

/// A short-lived access token obtained by exchanging an [`AppCredential`].
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessToken {
    /// The bearer token. Never logged, never audited.
    pub token: String,

    /// When the token stops being accepted.
    pub expires_at: DateTime<Utc>,
}

impl AccessToken {
    /// Returns true if the token has expired.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        Utc::now() >= self.expires_at
    }
}

impl std::fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccessToken")
            .field("token", &"[REDACTED]")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Facility-reported status of one run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    /// Accepted but not started.
    Pending,
    /// In progress.
    Running,
    /// Completed successfully.
    Succeeded,
    /// Failed definitively.
    Failed {
        /// The facility's failure cause.
        reason: String,
    },
}

impl RunStatus {
    /// Returns true if the run has settled.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed { .. })
    }
}

/// The external identity provider: application registration, token
/// exchange, secret lifecycle.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Registers a new application under `display_name` with the given
    /// entitlements and returns its first credential.
    async fn register_application(
        &self,
        display_name: &str,
        entitlements: &[Entitlement],
    ) -> Result<AppCredential>;

    /// Issues an additional secret on an existing application.
    ///
    /// Existing secrets stay valid; this is the first half of two-phase
    /// rotation.
    async fn issue_secret(&self, application_id: &str) -> Result<AppCredential>;

    /// Exchanges an application credential for a short-lived token.
    ///
    /// # Errors
    ///
    /// Returns `AuthRejected` for unknown applications, revoked
    /// applications, and invalid secrets.
    async fn exchange(&self, credential: &AppCredential) -> Result<AccessToken>;

    /// Invalidates one secret. Other secrets on the application stay valid.
    async fn revoke_application_secret(&self, credential_id: &str) -> Result<()>;

    /// Invalidates an application and all its secrets.
    async fn revoke_application(&self, application_id: &str) -> Result<()>;
}

/// The catalog's policy engine: groups and row/column policy attachment.
///
/// Membership operations are idempotent in both directions: adding a
/// present member and removing an absent one are no-ops, not errors.
#[async_trait]
pub trait PolicyEngine: Send + Sync {
    /// Gets or creates the group for a scope.
    async fn ensure_group(
        &self,
        group_id: &GroupId,
        scope_id: &ScopeId,
    ) -> Result<AccessControlGroup>;

    /// Returns the group if it exists.
    async fn get_group(&self, group_id: &GroupId) -> Result<Option<AccessControlGroup>>;

    /// Adds an identity to a group.
    async fn add_group_member(&self, group_id: &GroupId, identity_id: IdentityId) -> Result<()>;

    /// Removes an identity from a group.
    async fn remove_group_member(&self, group_id: &GroupId, identity_id: IdentityId)
    -> Result<()>;

    /// Attaches a row-filter policy to a scope's data resources.
    async fn attach_row_filter(&self, scope_id: &ScopeId, filter_ref: &PolicyRef) -> Result<()>;

    /// Attaches a column-masking policy to a scope's data resources.
    async fn attach_column_mask(&self, scope_id: &ScopeId, mask_ref: &PolicyRef) -> Result<()>;
}

/// The external job-execution facility.
#[async_trait]
pub trait ExecutionFacility: Send + Sync {
    /// Creates or updates a job from a draft, deduplicating by the
    /// draft's deterministic name, and returns the facility-assigned id.
    async fn create_or_update_job(&self, draft: &JobDraft) -> Result<JobId>;

    /// Starts a run of `job_id` executing as `run_as`.
    async fn run(&self, job_id: JobId, run_as: IdentityId) -> Result<RunHandle>;

    /// Non-blocking status check for a run.
    async fn get_run_state(&self, handle: &RunHandle) -> Result<RunStatus>;
}

/// The permission-grant service for executable assets.
///
/// The dispatcher only ever checks `has_read`; granting is performed by
/// the surrounding automation before submission.
#[async_trait]
pub trait GrantService: Send + Sync {
    /// Grants read permission on an asset to an identity.
    async fn grant_read(&self, asset_ref: &AssetRef, identity_id: IdentityId) -> Result<()>;

    /// Returns true if the identity can read the asset.
    async fn has_read(&self, asset_ref: &AssetRef, identity_id: IdentityId) -> Result<bool>;
}
