//! Durable registry of identities, scope bindings, policies, and jobs.
//!
//! The [`RegistryStore`] trait is the persistence seam: an in-memory
//! implementation ships in [`memory`] for tests and local runs, and a
//! durable transactional store is a deployment concern behind the same
//! trait. The registry is the source of truth — every orchestration step
//! is recomputable from it after a restart, no in-memory state is
//! load-bearing.
//!
//! ## CAS Semantics
//!
//! Two primitives carry the concurrency contract:
//!
//! - `bind_scope` is first-writer-wins keyed on the scope id, so two
//!   concurrent provisioners for the same scope converge on one identity
//! - `cas_credential_state` transitions credential state only when the
//!   current value matches, so the broker and registry never clobber each
//!   other

pub mod memory;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use warden_core::audit::{AuditAction, AuditEmitter, AuditOutcome, AuditRecord};
use warden_core::{CredentialState, Identity, IdentityId, IdentityKind, PolicyRef, ScopeId};

use crate::error::{Error, Result};
use crate::job::{JobDefinition, JobKey};
use crate::metrics::EngineMetrics;

/// Result of a compare-and-swap credential-state transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CasResult {
    /// Transition applied.
    Success,
    /// Identity not found.
    NotFound,
    /// Current state didn't match the expected value.
    StateMismatch {
        /// The actual state that was found.
        actual: CredentialState,
    },
}

impl CasResult {
    /// Returns true if the transition was applied.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }
}

/// Result of a first-writer-wins scope binding attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BindOutcome {
    /// The caller's identity is now bound to the scope.
    Bound,
    /// Another identity won the race; the caller must clean up its own.
    AlreadyBound {
        /// The identity that holds the binding.
        identity_id: IdentityId,
    },
}

/// The policy refs recorded as attached to a scope's data resources.
///
/// Persisted so policy drift is detected across restarts, not just within
/// one process lifetime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppliedPolicy {
    /// The scope the policy governs.
    pub scope_id: ScopeId,
    /// The attached column-masking policy.
    pub masking_policy_ref: PolicyRef,
    /// The attached row-filter policy.
    pub row_filter_ref: PolicyRef,
    /// When the attachment was recorded.
    pub applied_at: DateTime<Utc>,
}

/// Storage abstraction for registry state.
///
/// Implementations must provide durability appropriate for the deployment
/// and honor the CAS contracts documented on `bind_scope` and
/// `cas_credential_state`. All methods are `Send + Sync` to support
/// concurrent access from per-scope workers.
#[async_trait]
pub trait RegistryStore: Send + Sync {
    // --- Identity operations ---

    /// Gets an identity by id. Returns `None` if absent.
    async fn get_identity(&self, identity_id: &IdentityId) -> Result<Option<Identity>>;

    /// Inserts or replaces an identity record.
    async fn put_identity(&self, identity: &Identity) -> Result<()>;

    /// Lists all identity records, including revoked ones.
    async fn list_identities(&self) -> Result<Vec<Identity>>;

    /// Atomically transitions an identity's credential state if the
    /// current state matches `expected`.
    async fn cas_credential_state(
        &self,
        identity_id: &IdentityId,
        expected: CredentialState,
        target: CredentialState,
    ) -> Result<CasResult>;

    // --- Scope binding operations ---

    /// Binds `identity_id` to `scope_id` unless a binding already exists.
    ///
    /// First writer wins; losers receive [`BindOutcome::AlreadyBound`]
    /// with the winning identity and must revoke their own orphan.
    async fn bind_scope(&self, scope_id: &ScopeId, identity_id: IdentityId)
    -> Result<BindOutcome>;

    /// Returns the identity bound to `scope_id`, if any.
    async fn scope_binding(&self, scope_id: &ScopeId) -> Result<Option<IdentityId>>;

    /// Removes the binding for `scope_id`. Absent bindings are a no-op.
    async fn remove_scope_binding(&self, scope_id: &ScopeId) -> Result<()>;

    // --- Applied policy operations ---

    /// Returns the policy recorded as attached to `scope_id`, if any.
    async fn applied_policy(&self, scope_id: &ScopeId) -> Result<Option<AppliedPolicy>>;

    /// Records the policy attached to a scope's resources.
    async fn record_applied_policy(&self, policy: &AppliedPolicy) -> Result<()>;

    // --- Job operations ---

    /// Gets a job definition by its natural key.
    async fn get_job(&self, key: &JobKey) -> Result<Option<JobDefinition>>;

    /// Gets a job definition by facility-assigned id.
    async fn get_job_by_id(&self, job_id: warden_core::JobId) -> Result<Option<JobDefinition>>;

    /// Inserts or replaces a job definition.
    async fn save_job(&self, definition: &JobDefinition) -> Result<()>;

    /// Lists all job definitions.
    async fn list_jobs(&self) -> Result<Vec<JobDefinition>>;
}

/// Durable record of every non-human identity and its credential state.
///
/// A thin service over the injected [`RegistryStore`]: validation of the
/// kind/scope rules, idempotent lookups, revocation, and audit emission
/// live here; persistence and CAS live in the store.
#[derive(Clone)]
pub struct IdentityRegistry {
    store: Arc<dyn RegistryStore>,
    audit: AuditEmitter,
    metrics: EngineMetrics,
}

impl std::fmt::Debug for IdentityRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentityRegistry").finish_non_exhaustive()
    }
}

impl IdentityRegistry {
    /// Creates a new registry over the given store.
    #[must_use]
    pub fn new(store: Arc<dyn RegistryStore>, audit: AuditEmitter) -> Self {
        Self {
            store,
            audit,
            metrics: EngineMetrics::new(),
        }
    }

    /// Returns the underlying store.
    #[must_use]
    pub fn store(&self) -> Arc<dyn RegistryStore> {
        Arc::clone(&self.store)
    }

    /// Creates a new identity of the given kind.
    ///
    /// # Errors
    ///
    /// Returns `InvalidScopeBinding` when an orchestrator is given a scope
    /// or a data-access identity is missing one.
    pub async fn create_identity(
        &self,
        kind: IdentityKind,
        scope_id: Option<ScopeId>,
    ) -> Result<Identity> {
        let identity = match (kind, scope_id) {
            (IdentityKind::Orchestrator, None) => Identity::new_orchestrator(),
            (IdentityKind::Orchestrator, Some(scope)) => {
                return Err(Error::invalid_scope_binding(format!(
                    "orchestrator identities are scope-less, got scope '{scope}'"
                )));
            }
            (IdentityKind::DataAccess, Some(scope)) => Identity::new_data_access(scope),
            (IdentityKind::DataAccess, None) => {
                return Err(Error::invalid_scope_binding(
                    "data-access identities require a scope",
                ));
            }
        };

        self.store.put_identity(&identity).await?;
        self.metrics.record_identity_operation("create");
        self.emit_audit(
            AuditRecord::builder()
                .action(AuditAction::IdentityCreate)
                .target(format!("identity:{}", identity.identity_id))
                .outcome(AuditOutcome::Success)
                .detail(identity.kind.as_str().to_string()),
            identity.scope_id.clone(),
        );
        tracing::info!(
            identity_id = %identity.identity_id,
            kind = %identity.kind,
            scope_id = ?identity.scope_id,
            "identity created"
        );
        Ok(identity)
    }

    /// Idempotent variant of [`Self::create_identity`].
    ///
    /// Returns the existing non-revoked identity matching `(kind, scope_id)`
    /// when present: a scope has at most one data-access identity, and a
    /// deployment has one orchestrator.
    pub async fn ensure_identity(
        &self,
        kind: IdentityKind,
        scope_id: Option<ScopeId>,
    ) -> Result<Identity> {
        let existing = self
            .store
            .list_identities()
            .await?
            .into_iter()
            .find(|i| i.kind == kind && i.scope_id == scope_id && !i.is_revoked());

        match existing {
            Some(identity) => {
                self.metrics.record_identity_operation("ensure");
                Ok(identity)
            }
            None => self.create_identity(kind, scope_id).await,
        }
    }

    /// Gets an identity.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if no identity with that id exists.
    pub async fn get(&self, identity_id: &IdentityId) -> Result<Identity> {
        self.store
            .get_identity(identity_id)
            .await?
            .ok_or_else(|| Error::not_found(format!("identity {identity_id}")))
    }

    /// Finds a non-revoked identity by provider-facing display name.
    pub async fn find_by_display_name(&self, display_name: &str) -> Result<Option<Identity>> {
        Ok(self
            .store
            .list_identities()
            .await?
            .into_iter()
            .find(|i| i.display_name == display_name && !i.is_revoked()))
    }

    /// Lists all identity records.
    pub async fn list(&self) -> Result<Vec<Identity>> {
        self.store.list_identities().await
    }

    /// Revokes an identity. Terminal; the id is never reused.
    ///
    /// # Errors
    ///
    /// Returns `AlreadyRevoked` if the identity is already terminal,
    /// `NotFound` if it does not exist.
    pub async fn revoke(&self, identity_id: &IdentityId) -> Result<()> {
        let identity = self.get(identity_id).await?;
        if identity.is_revoked() {
            return Err(Error::AlreadyRevoked {
                identity_id: *identity_id,
            });
        }

        match self
            .store
            .cas_credential_state(identity_id, identity.credential_state, CredentialState::Revoked)
            .await?
        {
            CasResult::Success => {}
            CasResult::NotFound => {
                return Err(Error::not_found(format!("identity {identity_id}")));
            }
            // A concurrent revoke won the race.
            CasResult::StateMismatch {
                actual: CredentialState::Revoked,
            } => {
                return Err(Error::AlreadyRevoked {
                    identity_id: *identity_id,
                });
            }
            CasResult::StateMismatch { actual } => {
                return Err(Error::InvalidStateTransition {
                    from: actual.as_str().to_string(),
                    to: CredentialState::Revoked.as_str().to_string(),
                    reason: "credential state changed concurrently".to_string(),
                });
            }
        }

        self.metrics.record_identity_operation("revoke");
        self.emit_audit(
            AuditRecord::builder()
                .action(AuditAction::IdentityRevoke)
                .target(format!("identity:{identity_id}"))
                .outcome(AuditOutcome::Success),
            identity.scope_id.clone(),
        );
        tracing::info!(identity_id = %identity_id, "identity revoked");
        Ok(())
    }

    /// Transitions an identity's credential state with CAS semantics.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for missing identities and
    /// `InvalidStateTransition` when the current state doesn't match
    /// `expected` or the transition is not allowed.
    pub async fn set_credential_state(
        &self,
        identity_id: &IdentityId,
        expected: CredentialState,
        target: CredentialState,
    ) -> Result<()> {
        if !expected.can_transition_to(target) {
            return Err(Error::InvalidStateTransition {
                from: expected.as_str().to_string(),
                to: target.as_str().to_string(),
                reason: "not permitted by the credential state machine".to_string(),
            });
        }

        match self
            .store
            .cas_credential_state(identity_id, expected, target)
            .await?
        {
            CasResult::Success => Ok(()),
            CasResult::NotFound => Err(Error::not_found(format!("identity {identity_id}"))),
            CasResult::StateMismatch { actual } => Err(Error::InvalidStateTransition {
                from: actual.as_str().to_string(),
                to: target.as_str().to_string(),
                reason: format!("expected state {expected}"),
            }),
        }
    }

    fn emit_audit(&self, builder: warden_core::audit::AuditRecordBuilder, scope: Option<ScopeId>) {
        let builder = match scope {
            Some(scope_id) => builder.scope(scope_id),
            None => builder,
        };
        match builder.try_build() {
            Ok(record) => self.audit.emit(record),
            Err(err) => tracing::warn!(error = %err, "failed to build audit record"),
        }
    }
}
