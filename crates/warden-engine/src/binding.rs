//! Scope binding: one data-access identity per scope, converged and
//! torn down safely.
//!
//! Binding is first-writer-wins on the registry's CAS primitive. Two
//! provisioners racing on the same scope both create a candidate
//! identity; exactly one binds, and the loser revokes its own orphan and
//! adopts the winner. The provider-side registration happens only after
//! winning, so losing costs one registry record, not a dangling
//! application.
//!
//! Teardown order is load-bearing: group membership is removed before
//! the identity is revoked, so a half-finished teardown leaves a
//! powerless member rather than a revoked identity still keyed into
//! policy decisions. A membership-removal failure aborts the teardown.

use std::sync::Arc;

use chrono::Utc;

use warden_core::audit::{AuditAction, AuditEmitter, AuditOutcome, AuditRecord};
use warden_core::{GroupId, Identity, IdentityId, IdentityKind, Scope, ScopeId};

use crate::broker::CredentialBroker;
use crate::error::{Error, Result};
use crate::platform::PolicyEngine;
use crate::registry::{AppliedPolicy, BindOutcome, IdentityRegistry, RegistryStore};
use crate::retry::{RetryConfig, retry_transient};

/// Maintains the scope-to-identity bindings and the policy attachments
/// that make them least-privilege.
#[derive(Clone)]
pub struct ScopeBindingService {
    registry: IdentityRegistry,
    broker: CredentialBroker,
    policy: Arc<dyn PolicyEngine>,
    audit: AuditEmitter,
    retry: RetryConfig,
}

impl std::fmt::Debug for ScopeBindingService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScopeBindingService").finish_non_exhaustive()
    }
}

impl ScopeBindingService {
    /// Creates a binding service.
    #[must_use]
    pub fn new(
        registry: IdentityRegistry,
        broker: CredentialBroker,
        policy: Arc<dyn PolicyEngine>,
        audit: AuditEmitter,
        retry: RetryConfig,
    ) -> Self {
        Self {
            registry,
            broker,
            policy,
            audit,
            retry,
        }
    }

    /// Converges the scope onto exactly one bound data-access identity
    /// and returns it.
    ///
    /// Idempotent: an already-bound scope gets its provider registration
    /// and group membership re-asserted and its identity returned.
    pub async fn ensure_scope_binding(&self, scope: &Scope) -> Result<Identity> {
        let scope_id = &scope.scope_id;

        if let Some(existing) = self.bound_identity(scope_id).await? {
            self.broker.register(&existing.identity_id).await?;
            self.ensure_membership(scope_id, existing.identity_id).await?;
            tracing::debug!(scope_id = %scope_id, identity_id = %existing.identity_id, "scope already bound");
            return Ok(existing);
        }

        let candidate = self
            .registry
            .create_identity(IdentityKind::DataAccess, Some(scope_id.clone()))
            .await?;

        match self
            .registry
            .store()
            .bind_scope(scope_id, candidate.identity_id)
            .await?
        {
            BindOutcome::Bound => {
                self.broker.register(&candidate.identity_id).await?;
                self.ensure_membership(scope_id, candidate.identity_id).await?;
                tracing::info!(
                    scope_id = %scope_id,
                    identity_id = %candidate.identity_id,
                    "scope bound to new data-access identity"
                );
                Ok(candidate)
            }
            BindOutcome::AlreadyBound { identity_id: winner } => {
                // Lost the race: the candidate was never registered with
                // the provider, so revoking the registry record is the
                // whole cleanup.
                self.registry.revoke(&candidate.identity_id).await?;
                let winner = self.registry.get(&winner).await?;
                self.broker.register(&winner.identity_id).await?;
                self.ensure_membership(scope_id, winner.identity_id).await?;
                tracing::info!(
                    scope_id = %scope_id,
                    identity_id = %winner.identity_id,
                    orphan = %candidate.identity_id,
                    "adopted concurrent binding winner"
                );
                Ok(winner)
            }
        }
    }

    /// Returns the non-revoked identity bound to the scope, if any.
    ///
    /// A binding pointing at a revoked identity is treated as absent so
    /// the next converge pass replaces it.
    pub async fn bound_identity(&self, scope_id: &ScopeId) -> Result<Option<Identity>> {
        let store = self.registry.store();
        let Some(identity_id) = store.scope_binding(scope_id).await? else {
            return Ok(None);
        };
        let identity = self.registry.get(&identity_id).await?;
        if identity.is_revoked() {
            store.remove_scope_binding(scope_id).await?;
            return Ok(None);
        }
        Ok(Some(identity))
    }

    /// Attaches the scope's row-filter and column-mask policies to its
    /// data resources and records what was applied.
    ///
    /// A matching recorded attachment is a no-op. A differing one is
    /// drift: rejected with `PolicyConflict` unless `force` is set, in
    /// which case the configured policies are re-attached over it.
    pub async fn apply_data_policy(&self, scope: &Scope, force: bool) -> Result<AppliedPolicy> {
        let scope_id = &scope.scope_id;
        let store = self.registry.store();

        if let Some(recorded) = store.applied_policy(scope_id).await? {
            let matches = recorded.masking_policy_ref == scope.masking_policy_ref
                && recorded.row_filter_ref == scope.row_filter_ref;
            if matches {
                return Ok(recorded);
            }
            if !force {
                self.emit_audit(
                    AuditRecord::builder()
                        .action(AuditAction::PolicyAttach)
                        .target(format!("scope:{scope_id}"))
                        .outcome(AuditOutcome::Denied)
                        .detail(format!(
                            "drift: recorded mask {} filter {}",
                            recorded.masking_policy_ref, recorded.row_filter_ref
                        ))
                        .scope(scope_id.clone()),
                );
                return Err(Error::PolicyConflict {
                    scope_id: scope_id.clone(),
                    message: format!(
                        "recorded policies (mask {}, filter {}) differ from configured (mask {}, filter {})",
                        recorded.masking_policy_ref,
                        recorded.row_filter_ref,
                        scope.masking_policy_ref,
                        scope.row_filter_ref
                    ),
                });
            }
            tracing::warn!(scope_id = %scope_id, "re-attaching policies over drifted attachment");
        }

        {
            let policy = Arc::clone(&self.policy);
            let scope_id = scope_id.clone();
            let filter = scope.row_filter_ref.clone();
            retry_transient(&self.retry, "attach_row_filter", move || {
                let policy = Arc::clone(&policy);
                let scope_id = scope_id.clone();
                let filter = filter.clone();
                async move { policy.attach_row_filter(&scope_id, &filter).await }
            })
            .await?;
        }
        {
            let policy = Arc::clone(&self.policy);
            let scope_id = scope_id.clone();
            let mask = scope.masking_policy_ref.clone();
            retry_transient(&self.retry, "attach_column_mask", move || {
                let policy = Arc::clone(&policy);
                let scope_id = scope_id.clone();
                let mask = mask.clone();
                async move { policy.attach_column_mask(&scope_id, &mask).await }
            })
            .await?;
        }

        let applied = AppliedPolicy {
            scope_id: scope_id.clone(),
            masking_policy_ref: scope.masking_policy_ref.clone(),
            row_filter_ref: scope.row_filter_ref.clone(),
            applied_at: Utc::now(),
        };
        store.record_applied_policy(&applied).await?;

        self.emit_audit(
            AuditRecord::builder()
                .action(AuditAction::PolicyAttach)
                .target(format!("scope:{scope_id}"))
                .outcome(AuditOutcome::Success)
                .detail(format!(
                    "mask {} filter {}",
                    applied.masking_policy_ref, applied.row_filter_ref
                ))
                .scope(scope_id.clone()),
        );
        tracing::info!(
            scope_id = %scope_id,
            masking_policy = %applied.masking_policy_ref,
            row_filter = %applied.row_filter_ref,
            "data policies attached"
        );
        Ok(applied)
    }

    /// Tears down a scope's binding: membership out first, then provider
    /// credentials, then the identity, then the binding record.
    ///
    /// A membership-removal failure aborts before revocation so the
    /// identity never ends up revoked but still keyed into policy. A
    /// scope with no binding is a no-op.
    pub async fn teardown_scope(&self, scope_id: &ScopeId) -> Result<()> {
        let Some(identity) = self.bound_identity(scope_id).await? else {
            tracing::debug!(scope_id = %scope_id, "teardown: no binding present");
            return Ok(());
        };
        let group_id = GroupId::for_scope(scope_id);

        if let Err(err) = self
            .policy
            .remove_group_member(&group_id, identity.identity_id)
            .await
        {
            self.emit_audit(
                AuditRecord::builder()
                    .action(AuditAction::ScopeTeardown)
                    .target(format!("scope:{scope_id}"))
                    .outcome(AuditOutcome::Failed)
                    .detail("membership removal failed; revocation skipped")
                    .scope(scope_id.clone()),
            );
            return Err(err);
        }
        self.emit_audit(
            AuditRecord::builder()
                .action(AuditAction::GroupMemberRemove)
                .actor(identity.identity_id)
                .target(format!("group:{group_id}"))
                .outcome(AuditOutcome::Success)
                .scope(scope_id.clone()),
        );

        self.broker.revoke_credentials(&identity.identity_id).await?;
        match self.registry.revoke(&identity.identity_id).await {
            Ok(()) | Err(Error::AlreadyRevoked { .. }) => {}
            Err(err) => return Err(err),
        }
        self.registry.store().remove_scope_binding(scope_id).await?;

        self.emit_audit(
            AuditRecord::builder()
                .action(AuditAction::ScopeTeardown)
                .target(format!("scope:{scope_id}"))
                .outcome(AuditOutcome::Success)
                .scope(scope_id.clone()),
        );
        tracing::info!(scope_id = %scope_id, identity_id = %identity.identity_id, "scope torn down");
        Ok(())
    }

    async fn ensure_membership(&self, scope_id: &ScopeId, identity_id: IdentityId) -> Result<()> {
        let group_id = GroupId::for_scope(scope_id);

        {
            let policy = Arc::clone(&self.policy);
            let group_id = group_id.clone();
            let scope_id = scope_id.clone();
            retry_transient(&self.retry, "ensure_group", move || {
                let policy = Arc::clone(&policy);
                let group_id = group_id.clone();
                let scope_id = scope_id.clone();
                async move { policy.ensure_group(&group_id, &scope_id).await }
            })
            .await?;
        }

        let already_member = self
            .policy
            .get_group(&group_id)
            .await?
            .is_some_and(|g| g.is_member(&identity_id));
        if already_member {
            return Ok(());
        }

        {
            let policy = Arc::clone(&self.policy);
            let group_id = group_id.clone();
            retry_transient(&self.retry, "add_group_member", move || {
                let policy = Arc::clone(&policy);
                let group_id = group_id.clone();
                async move { policy.add_group_member(&group_id, identity_id).await }
            })
            .await?;
        }

        self.emit_audit(
            AuditRecord::builder()
                .action(AuditAction::GroupMemberAdd)
                .actor(identity_id)
                .target(format!("group:{group_id}"))
                .outcome(AuditOutcome::Success)
                .scope(scope_id.clone()),
        );
        Ok(())
    }

    fn emit_audit(&self, builder: warden_core::audit::AuditRecordBuilder) {
        match builder.try_build() {
            Ok(record) => self.audit.emit(record),
            Err(err) => tracing::warn!(error = %err, "failed to build audit record"),
        }
    }
}
