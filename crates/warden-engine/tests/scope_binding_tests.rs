//! Scope binding convergence, policy drift, and teardown ordering.

mod common;

use warden_core::audit::AuditAction;
use warden_core::{CredentialState, GroupId, IdentityKind, PolicyRef};

use warden_engine::Error;
use warden_engine::platform::PolicyEngine;
use warden_engine::registry::RegistryStore;

use common::{TestHarness, scope_config};

#[tokio::test]
async fn binding_converges_to_one_identity_and_one_member() {
    let h = TestHarness::new();
    let cfg = scope_config("us");
    let scope = cfg.to_scope();

    let identity = h.binding.ensure_scope_binding(&scope).await.unwrap();
    assert_eq!(identity.kind, IdentityKind::DataAccess);
    assert_eq!(identity.display_name, "export-worker-us");

    // Converging again changes nothing.
    let again = h.binding.ensure_scope_binding(&scope).await.unwrap();
    assert_eq!(identity.identity_id, again.identity_id);

    let group = h
        .policy
        .get_group(&GroupId::for_scope(&scope.scope_id))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(group.member_count(), 1);
    assert!(group.is_member(&identity.identity_id));

    let identities = h.registry.list().await.unwrap();
    assert_eq!(identities.len(), 1);
}

#[tokio::test]
async fn concurrent_binding_attempts_converge_on_one_winner() {
    let h = TestHarness::new();
    let cfg = scope_config("eu");
    let scope = cfg.to_scope();

    let (first, second) = tokio::join!(
        h.binding.ensure_scope_binding(&scope),
        h.binding.ensure_scope_binding(&scope),
    );
    let first = first.unwrap();
    let second = second.unwrap();
    assert_eq!(first.identity_id, second.identity_id);

    // Any orphan from the race is revoked; exactly one live identity.
    let live: Vec<_> = h
        .registry
        .list()
        .await
        .unwrap()
        .into_iter()
        .filter(|i| !i.is_revoked())
        .collect();
    assert_eq!(live.len(), 1);

    let group = h
        .policy
        .get_group(&GroupId::for_scope(&scope.scope_id))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(group.member_count(), 1);
}

#[tokio::test]
async fn policy_drift_is_rejected_then_forced_over() {
    let h = TestHarness::new();
    let cfg = scope_config("us");
    let scope = cfg.to_scope();

    h.binding.apply_data_policy(&scope, false).await.unwrap();

    let mut strict = scope.clone();
    strict.masking_policy_ref = PolicyRef::new("masks/pii-strict");

    let err = h.binding.apply_data_policy(&strict, false).await.unwrap_err();
    assert!(matches!(err, Error::PolicyConflict { .. }));

    // The catalog attachment was not touched by the rejected apply.
    assert_eq!(
        h.policy.column_mask(&scope.scope_id).unwrap(),
        Some(scope.masking_policy_ref.clone())
    );

    let applied = h.binding.apply_data_policy(&strict, true).await.unwrap();
    assert_eq!(applied.masking_policy_ref, strict.masking_policy_ref);
    assert_eq!(
        h.policy.column_mask(&scope.scope_id).unwrap(),
        Some(strict.masking_policy_ref)
    );
}

#[tokio::test]
async fn teardown_failure_leaves_identity_usable() {
    let h = TestHarness::new();
    let cfg = scope_config("us");
    let scope = cfg.to_scope();
    let identity = h.binding.ensure_scope_binding(&scope).await.unwrap();

    h.policy.fail_next_remove_member();
    let err = h.binding.teardown_scope(&scope.scope_id).await.unwrap_err();
    assert!(matches!(err, Error::ExternalFatal { .. }));

    // Membership removal failed, so revocation was skipped entirely.
    let stored = h.registry.get(&identity.identity_id).await.unwrap();
    assert_ne!(stored.credential_state, CredentialState::Revoked);
    assert_eq!(
        h.registry
            .store()
            .scope_binding(&scope.scope_id)
            .await
            .unwrap(),
        Some(identity.identity_id)
    );

    let failures = h.sink.find_by_action(AuditAction::ScopeTeardown);
    assert_eq!(failures.len(), 1);
    assert!(!failures[0].outcome.is_success());
}

#[tokio::test]
async fn teardown_orders_membership_before_revocation() {
    let h = TestHarness::new();
    let cfg = scope_config("eu");
    let scope = cfg.to_scope();
    let identity = h.binding.ensure_scope_binding(&scope).await.unwrap();
    h.broker.issue(&identity.identity_id).await.unwrap();

    h.binding.teardown_scope(&scope.scope_id).await.unwrap();

    let group = h
        .policy
        .get_group(&GroupId::for_scope(&scope.scope_id))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(group.member_count(), 0);
    assert!(
        h.registry
            .get(&identity.identity_id)
            .await
            .unwrap()
            .is_revoked()
    );
    assert!(
        h.registry
            .store()
            .scope_binding(&scope.scope_id)
            .await
            .unwrap()
            .is_none()
    );

    // Provider-side application is dead too.
    let err = h.broker.issue(&identity.identity_id).await.unwrap_err();
    assert!(matches!(err, Error::IdentityRevoked { .. }));

    // The audit trail shows removal strictly before revocation.
    let records = h.sink.records();
    let remove_at = records
        .iter()
        .position(|r| r.action == AuditAction::GroupMemberRemove)
        .unwrap();
    let revoke_at = records
        .iter()
        .position(|r| r.action == AuditAction::IdentityRevoke)
        .unwrap();
    assert!(remove_at < revoke_at);
}

#[tokio::test]
async fn torn_down_scope_can_be_rebound_with_a_fresh_identity() {
    let h = TestHarness::new();
    let cfg = scope_config("us");
    let scope = cfg.to_scope();

    let first = h.binding.ensure_scope_binding(&scope).await.unwrap();
    h.binding.teardown_scope(&scope.scope_id).await.unwrap();

    let second = h.binding.ensure_scope_binding(&scope).await.unwrap();
    assert_ne!(first.identity_id, second.identity_id);
    assert!(!second.is_revoked());
}
