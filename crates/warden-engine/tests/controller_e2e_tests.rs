//! Full converge passes across multiple scopes.

mod common;

use chrono::Utc;

use warden_core::audit::AuditAction;
use warden_core::{GroupId, IdentityKind, PolicyRef, ScopeId};

use warden_engine::platform::PolicyEngine;
use warden_engine::registry::{AppliedPolicy, RegistryStore};
use warden_engine::{JobState, ScopePhase};

use common::{TestHarness, scope_config};

#[tokio::test]
async fn converge_provisions_every_scope_exactly_once() {
    let h = TestHarness::new();
    let scopes = [scope_config("us"), scope_config("eu")];

    let reports = h.controller.converge(&scopes).await.unwrap();
    assert_eq!(reports.len(), 2);
    for report in &reports {
        assert!(report.is_success(), "scope {} failed: {:?}", report.scope_id, report.error);
        assert_eq!(report.phase, ScopePhase::Converged);
        assert_eq!(report.job_state, Some(JobState::Succeeded));
    }

    // One orchestrator plus one worker per scope.
    let identities = h.registry.list().await.unwrap();
    assert_eq!(identities.len(), 3);
    assert_eq!(
        identities
            .iter()
            .filter(|i| i.kind == IdentityKind::Orchestrator)
            .count(),
        1
    );

    // Each scope has its own single-member group and its own job.
    for scope in &scopes {
        let group = h
            .policy
            .get_group(&GroupId::for_scope(&scope.scope_id))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(group.member_count(), 1);
    }
    assert_eq!(h.facility.job_count().unwrap(), 2);
    assert_eq!(h.grants.grant_count().unwrap(), 2);

    // Converging again reuses everything.
    let again = h.controller.converge(&scopes).await.unwrap();
    assert!(again.iter().all(warden_engine::ScopeReport::is_success));
    assert_eq!(h.registry.list().await.unwrap().len(), 3);
    assert_eq!(h.facility.job_count().unwrap(), 2);
}

#[tokio::test]
async fn one_scope_failing_does_not_block_the_others() {
    let h = TestHarness::new();
    let scopes = [scope_config("us"), scope_config("eu")];

    // Someone attached a different masking policy to eu out of band.
    h.registry
        .store()
        .record_applied_policy(&AppliedPolicy {
            scope_id: ScopeId::new("eu").unwrap(),
            masking_policy_ref: PolicyRef::new("masks/legacy"),
            row_filter_ref: PolicyRef::new("filters/region-eu"),
            applied_at: Utc::now(),
        })
        .await
        .unwrap();

    let reports = h.controller.converge(&scopes).await.unwrap();
    let us = reports.iter().find(|r| r.scope_id.as_str() == "us").unwrap();
    let eu = reports.iter().find(|r| r.scope_id.as_str() == "eu").unwrap();

    assert!(us.is_success());
    assert!(!eu.is_success());
    assert!(eu.error.as_deref().unwrap().contains("policy conflict"));
    // eu got its binding but stopped at the policy step.
    assert_eq!(eu.phase, ScopePhase::PolicyApplied);
    assert!(eu.job_state.is_none());
}

#[tokio::test]
async fn rerun_scope_resets_and_settles_again() {
    let h = TestHarness::new();
    let scopes = [scope_config("us")];
    h.controller.converge(&scopes).await.unwrap();
    assert_eq!(h.facility.run_count().unwrap(), 1);

    let rerun = h
        .controller
        .rerun_scope(&ScopeId::new("us").unwrap())
        .await
        .unwrap();
    assert_eq!(rerun.state, JobState::Succeeded);
    assert_eq!(h.facility.run_count().unwrap(), 2);

    let reruns = h.sink.find_by_action(AuditAction::JobRerunRequest);
    assert_eq!(reruns.len(), 1);
}

#[tokio::test]
async fn rerun_of_an_unknown_scope_is_not_found() {
    let h = TestHarness::new();
    let err = h
        .controller
        .rerun_scope(&ScopeId::new("apac").unwrap())
        .await
        .unwrap_err();
    assert!(matches!(err, warden_engine::Error::NotFound { .. }));
}

#[tokio::test]
async fn converge_leaves_a_complete_audit_trail_in_order() {
    let h = TestHarness::new();
    h.controller.converge(&[scope_config("us")]).await.unwrap();

    let records = h.sink.records();
    let position = |action: AuditAction| {
        records
            .iter()
            .position(|r| r.action == action)
            .unwrap_or_else(|| panic!("no {action} record"))
    };

    let create = position(AuditAction::IdentityCreate);
    let member_add = position(AuditAction::GroupMemberAdd);
    let policy = position(AuditAction::PolicyAttach);
    let token = position(AuditAction::TokenIssue);
    let ensure = position(AuditAction::JobEnsure);
    let submit = position(AuditAction::JobSubmit);
    let state_change = position(AuditAction::JobStateChange);

    assert!(create < member_add);
    assert!(member_add < policy);
    assert!(policy < token);
    assert!(token < ensure);
    assert!(ensure < submit);
    assert!(submit < state_change);

    // The final state change records the successful settle.
    let changes = h.sink.find_by_action(AuditAction::JobStateChange);
    assert!(
        changes
            .last()
            .unwrap()
            .detail
            .as_deref()
            .unwrap()
            .ends_with("succeeded")
    );
}

#[tokio::test]
async fn scope_reports_serialize_for_the_run_summary() {
    let h = TestHarness::new();
    let reports = h.controller.converge(&[scope_config("eu")]).await.unwrap();

    let json = serde_json::to_value(&reports).unwrap();
    assert_eq!(json[0]["scopeId"], "eu");
    assert_eq!(json[0]["phase"], "CONVERGED");
    assert_eq!(json[0]["jobState"], "SUCCEEDED");
    assert!(json[0].get("error").is_none());
}
