//! Job dispatch: least-privilege validation, idempotent definition,
//! submission, and run polling.
//!
//! Every job is owned by the orchestrator identity and runs as a scope's
//! data-access identity. The dispatcher refuses any definition that
//! collapses that split. Definitions are idempotent under the natural key
//! (owner, run-as, asset); settings changes update the existing job in
//! place rather than minting a new one.

use std::sync::Arc;
use std::time::{Duration, Instant};

use warden_core::audit::{AuditAction, AuditEmitter, AuditOutcome, AuditRecord};
use warden_core::{AssetRef, Identity, IdentityId, IdentityKind};

use crate::error::{Error, Result};
use crate::job::{JobDefinition, JobKey, JobSettings, JobState};
use crate::metrics::EngineMetrics;
use crate::platform::{ExecutionFacility, GrantService, RunStatus};
use crate::registry::{IdentityRegistry, RegistryStore};
use crate::retry::{RetryConfig, retry_transient};

/// Creates, submits, and tracks export jobs against the execution
/// facility.
#[derive(Clone)]
pub struct JobDispatcher {
    registry: IdentityRegistry,
    facility: Arc<dyn ExecutionFacility>,
    grants: Arc<dyn GrantService>,
    audit: AuditEmitter,
    metrics: EngineMetrics,
    retry: RetryConfig,
    poll_interval: Duration,
}

impl std::fmt::Debug for JobDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobDispatcher").finish_non_exhaustive()
    }
}

impl JobDispatcher {
    /// Creates a dispatcher.
    #[must_use]
    pub fn new(
        registry: IdentityRegistry,
        facility: Arc<dyn ExecutionFacility>,
        grants: Arc<dyn GrantService>,
        audit: AuditEmitter,
        retry: RetryConfig,
        poll_interval: Duration,
    ) -> Self {
        Self {
            registry,
            facility,
            grants,
            audit,
            metrics: EngineMetrics::new(),
            retry,
            poll_interval,
        }
    }

    /// Creates or updates a job definition, idempotent under the natural
    /// key (owner, run-as, asset).
    ///
    /// The job's scope is the run-as identity's bound scope.
    ///
    /// # Errors
    ///
    /// Returns `LeastPrivilegeViolation` when the owner is not an
    /// orchestrator, the run-as is not a data-access identity, or the two
    /// are the same identity; `IdentityRevoked` when either is revoked.
    pub async fn ensure_job(
        &self,
        owner_identity_id: &IdentityId,
        run_as_identity_id: &IdentityId,
        asset_ref: &AssetRef,
        settings: JobSettings,
    ) -> Result<JobDefinition> {
        let (_, run_as) = self
            .validate_principals(owner_identity_id, run_as_identity_id)
            .await?;
        let scope_id = run_as
            .scope_id
            .clone()
            .ok_or_else(|| Error::invalid_scope_binding("run-as identity has no bound scope"))?;

        let key = JobKey {
            owner_identity_id: *owner_identity_id,
            run_as_identity_id: *run_as_identity_id,
            asset_ref: asset_ref.clone(),
        };
        let store = self.registry.store();

        let mut definition = match store.get_job(&key).await? {
            Some(mut existing) => {
                existing.settings = settings;
                existing
            }
            None => {
                let draft_name = JobDefinition::facility_name(&scope_id, asset_ref);
                tracing::debug!(scope_id = %scope_id, name = %draft_name, "defining new export job");
                JobDefinition::new(
                    warden_core::JobId::new(0),
                    *owner_identity_id,
                    *run_as_identity_id,
                    scope_id,
                    asset_ref.clone(),
                    settings,
                )
            }
        };

        // The facility deduplicates by name, so re-sending the draft is
        // an in-place update and the id stays stable.
        let draft = definition.draft();
        let job_id = {
            let facility = Arc::clone(&self.facility);
            retry_transient(&self.retry, "create_or_update_job", move || {
                let facility = Arc::clone(&facility);
                let draft = draft.clone();
                async move { facility.create_or_update_job(&draft).await }
            })
            .await?
        };
        definition.job_id = job_id;
        store.save_job(&definition).await?;

        self.emit_audit(
            AuditRecord::builder()
                .actor(*owner_identity_id)
                .action(AuditAction::JobEnsure)
                .target(format!("job:{job_id}"))
                .outcome(AuditOutcome::Success)
                .detail(definition.asset_ref.to_string())
                .scope(definition.scope_id.clone()),
        );
        Ok(definition)
    }

    /// Submits a run of the job to the execution facility.
    ///
    /// # Errors
    ///
    /// Returns `CredentialNotReady` unless the run-as credential is
    /// Active, `AssetPermissionMissing` unless the run-as identity can
    /// read the asset, and `InvalidStateTransition` unless the job is in
    /// the Defined state.
    pub async fn submit(&self, key: &JobKey) -> Result<JobDefinition> {
        let mut definition = self.get_job(key).await?;

        let run_as = self.registry.get(&definition.run_as_identity_id).await?;
        if run_as.is_revoked() {
            return Err(Error::IdentityRevoked {
                identity_id: run_as.identity_id,
            });
        }
        if run_as.credential_state != warden_core::CredentialState::Active {
            return Err(Error::CredentialNotReady {
                identity_id: run_as.identity_id,
                state: run_as.credential_state,
            });
        }
        if !self
            .grants
            .has_read(&definition.asset_ref, run_as.identity_id)
            .await?
        {
            return Err(Error::AssetPermissionMissing {
                identity_id: run_as.identity_id,
                asset_ref: definition.asset_ref.clone(),
            });
        }

        let handle = {
            let facility = Arc::clone(&self.facility);
            let job_id = definition.job_id;
            let run_as_id = run_as.identity_id;
            retry_transient(&self.retry, "run", move || {
                let facility = Arc::clone(&facility);
                async move { facility.run(job_id, run_as_id).await }
            })
            .await?
        };

        self.transition(&mut definition, JobState::Submitted)?;
        definition.last_run_handle = Some(handle.clone());
        self.registry.store().save_job(&definition).await?;

        self.emit_audit(
            AuditRecord::builder()
                .actor(run_as.identity_id)
                .action(AuditAction::JobSubmit)
                .target(format!("job:{}", definition.job_id))
                .outcome(AuditOutcome::Success)
                .detail(handle.to_string())
                .scope(definition.scope_id.clone()),
        );
        tracing::info!(
            job_id = %definition.job_id,
            run_handle = %handle,
            run_as = %run_as.identity_id,
            "job submitted"
        );
        Ok(definition)
    }

    /// Polls the facility once and advances the job state accordingly.
    ///
    /// A terminal job is returned unchanged without touching the
    /// facility. A definitively failed run records its reason and is not
    /// retried.
    pub async fn poll(&self, key: &JobKey) -> Result<JobDefinition> {
        let mut definition = self.get_job(key).await?;
        if definition.state.is_terminal() {
            return Ok(definition);
        }
        let Some(handle) = definition.last_run_handle.clone() else {
            return Err(Error::not_found(format!(
                "run in flight for job {}",
                definition.job_id
            )));
        };

        let status = {
            let facility = Arc::clone(&self.facility);
            let handle = handle.clone();
            retry_transient(&self.retry, "get_run_state", move || {
                let facility = Arc::clone(&facility);
                let handle = handle.clone();
                async move { facility.get_run_state(&handle).await }
            })
            .await?
        };

        let target = match status {
            RunStatus::Pending => None,
            RunStatus::Running => {
                (definition.state == JobState::Submitted).then_some(JobState::Running)
            }
            RunStatus::Succeeded => Some(JobState::Succeeded),
            RunStatus::Failed { reason } => {
                definition.failure_reason = Some(reason);
                Some(JobState::Failed)
            }
        };

        if let Some(target) = target {
            let from = definition.state;
            self.transition(&mut definition, target)?;
            self.registry.store().save_job(&definition).await?;
            self.emit_audit(
                AuditRecord::builder()
                    .action(AuditAction::JobStateChange)
                    .target(format!("job:{}", definition.job_id))
                    .outcome(if target == JobState::Failed {
                        AuditOutcome::Failed
                    } else {
                        AuditOutcome::Success
                    })
                    .detail(format!("{from} -> {target}"))
                    .scope(definition.scope_id.clone()),
            );
        }
        Ok(definition)
    }

    /// Polls until the job settles or the wait budget runs out.
    ///
    /// On timeout the job is returned in whatever non-terminal state it
    /// reached; the run keeps executing at the facility.
    pub async fn poll_until_settled(&self, key: &JobKey, timeout: Duration) -> Result<JobDefinition> {
        let started = Instant::now();
        loop {
            let definition = self.poll(key).await?;
            if definition.state.is_terminal() {
                return Ok(definition);
            }
            if started.elapsed() >= timeout {
                tracing::warn!(
                    job_id = %definition.job_id,
                    state = %definition.state,
                    "poll wait budget exhausted; run still in progress"
                );
                return Ok(definition);
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    /// Resets a settled job so it can be submitted again.
    ///
    /// # Errors
    ///
    /// Returns `InvalidStateTransition` unless the job is in a terminal
    /// state.
    pub async fn request_rerun(&self, key: &JobKey) -> Result<JobDefinition> {
        let mut definition = self.get_job(key).await?;
        let from = definition.state;
        self.transition(&mut definition, JobState::Defined)?;
        self.registry.store().save_job(&definition).await?;

        self.emit_audit(
            AuditRecord::builder()
                .actor(definition.owner_identity_id)
                .action(AuditAction::JobRerunRequest)
                .target(format!("job:{}", definition.job_id))
                .outcome(AuditOutcome::Success)
                .detail(format!("reset from {from}"))
                .scope(definition.scope_id.clone()),
        );
        Ok(definition)
    }

    /// Gets a job definition by natural key.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if no such job exists.
    pub async fn get_job(&self, key: &JobKey) -> Result<JobDefinition> {
        self.registry
            .store()
            .get_job(key)
            .await?
            .ok_or_else(|| Error::not_found(format!("job for asset {}", key.asset_ref)))
    }

    async fn validate_principals(
        &self,
        owner_id: &IdentityId,
        run_as_id: &IdentityId,
    ) -> Result<(Identity, Identity)> {
        if owner_id == run_as_id {
            return Err(Error::least_privilege(
                "owner and run-as are the same identity",
            ));
        }

        let owner = self.registry.get(owner_id).await?;
        let run_as = self.registry.get(run_as_id).await?;
        for identity in [&owner, &run_as] {
            if identity.is_revoked() {
                return Err(Error::IdentityRevoked {
                    identity_id: identity.identity_id,
                });
            }
        }
        if owner.kind != IdentityKind::Orchestrator {
            return Err(Error::least_privilege(format!(
                "job owner {} is not an orchestrator identity",
                owner.identity_id
            )));
        }
        if run_as.kind != IdentityKind::DataAccess {
            return Err(Error::least_privilege(format!(
                "run-as {} is not a data-access identity",
                run_as.identity_id
            )));
        }
        Ok((owner, run_as))
    }

    fn transition(&self, definition: &mut JobDefinition, target: JobState) -> Result<()> {
        let from = definition.state;
        definition.transition_to(target)?;
        self.metrics
            .record_job_transition(from.as_str(), target.as_str());
        Ok(())
    }

    fn emit_audit(&self, builder: warden_core::audit::AuditRecordBuilder) {
        match builder.try_build() {
            Ok(record) => self.audit.emit(record),
            Err(err) => tracing::warn!(error = %err, "failed to build audit record"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use warden_core::audit::TestAuditSink;
    use warden_core::{CredentialState, ScopeId};

    use crate::platform::memory::{MemoryExecutionFacility, MemoryGrantService, RunOutcome};
    use crate::registry::memory::MemoryRegistry;

    struct Fixture {
        dispatcher: JobDispatcher,
        registry: IdentityRegistry,
        facility: Arc<MemoryExecutionFacility>,
        grants: Arc<MemoryGrantService>,
    }

    fn fixture() -> Fixture {
        let sink = Arc::new(TestAuditSink::new());
        let audit = AuditEmitter::with_test_sink(sink);
        let registry = IdentityRegistry::new(Arc::new(MemoryRegistry::new()), audit.clone());
        let facility = Arc::new(MemoryExecutionFacility::new());
        let grants = Arc::new(MemoryGrantService::new());
        let dispatcher = JobDispatcher::new(
            registry.clone(),
            Arc::clone(&facility) as Arc<dyn ExecutionFacility>,
            Arc::clone(&grants) as Arc<dyn GrantService>,
            audit,
            RetryConfig {
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(4),
                max_attempts: 3,
            },
            Duration::from_millis(1),
        );
        Fixture {
            dispatcher,
            registry,
            facility,
            grants,
        }
    }

    async fn principals(f: &Fixture, scope: &str) -> (IdentityId, IdentityId) {
        let owner = f
            .registry
            .ensure_identity(IdentityKind::Orchestrator, None)
            .await
            .unwrap();
        let run_as = f
            .registry
            .ensure_identity(
                IdentityKind::DataAccess,
                Some(ScopeId::new(scope).unwrap()),
            )
            .await
            .unwrap();
        f.registry
            .set_credential_state(
                &run_as.identity_id,
                CredentialState::Pending,
                CredentialState::Active,
            )
            .await
            .unwrap();
        (owner.identity_id, run_as.identity_id)
    }

    fn asset() -> AssetRef {
        AssetRef::new("/exports/regional_export")
    }

    async fn ready_job(f: &Fixture) -> JobKey {
        let (owner, run_as) = principals(f, "us").await;
        let definition = f
            .dispatcher
            .ensure_job(&owner, &run_as, &asset(), JobSettings::default())
            .await
            .unwrap();
        f.grants.grant_read(&asset(), run_as).await.unwrap();
        definition.natural_key()
    }

    #[tokio::test]
    async fn ensure_job_is_idempotent_and_updates_settings() -> Result<()> {
        let f = fixture();
        let (owner, run_as) = principals(&f, "us").await;

        let first = f
            .dispatcher
            .ensure_job(&owner, &run_as, &asset(), JobSettings::default())
            .await?;
        let changed = JobSettings {
            timeout_seconds: 7200,
            ..JobSettings::default()
        };
        let second = f
            .dispatcher
            .ensure_job(&owner, &run_as, &asset(), changed)
            .await?;

        assert_eq!(first.job_id, second.job_id);
        assert_eq!(second.settings.timeout_seconds, 7200);
        assert_eq!(f.facility.job_count()?, 1);
        Ok(())
    }

    #[tokio::test]
    async fn owner_must_differ_from_run_as() {
        let f = fixture();
        let (owner, _) = principals(&f, "us").await;

        let err = f
            .dispatcher
            .ensure_job(&owner, &owner, &asset(), JobSettings::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::LeastPrivilegeViolation { .. }));
    }

    #[tokio::test]
    async fn submit_requires_active_credential_and_grant() -> Result<()> {
        let f = fixture();
        let (owner, run_as) = principals(&f, "us").await;
        // Walk the run-as back to a non-ready state via rotation.
        f.registry
            .set_credential_state(&run_as, CredentialState::Active, CredentialState::Rotating)
            .await?;

        let definition = f
            .dispatcher
            .ensure_job(&owner, &run_as, &asset(), JobSettings::default())
            .await?;
        let key = definition.natural_key();

        let err = f.dispatcher.submit(&key).await.unwrap_err();
        assert!(matches!(err, Error::CredentialNotReady { .. }));

        f.registry
            .set_credential_state(&run_as, CredentialState::Rotating, CredentialState::Active)
            .await?;
        let err = f.dispatcher.submit(&key).await.unwrap_err();
        assert!(matches!(err, Error::AssetPermissionMissing { .. }));

        f.grants.grant_read(&asset(), run_as).await?;
        let submitted = f.dispatcher.submit(&key).await?;
        assert_eq!(submitted.state, JobState::Submitted);
        assert!(submitted.last_run_handle.is_some());
        Ok(())
    }

    #[tokio::test]
    async fn poll_drives_the_state_machine_to_success() -> Result<()> {
        let f = fixture();
        let key = ready_job(&f).await;
        f.dispatcher.submit(&key).await?;

        // Default scripted outcome: one Running report, then Succeeded.
        let running = f.dispatcher.poll(&key).await?;
        assert_eq!(running.state, JobState::Running);

        let done = f.dispatcher.poll(&key).await?;
        assert_eq!(done.state, JobState::Succeeded);

        // Terminal jobs are not re-polled.
        let runs_before = f.facility.run_count()?;
        f.dispatcher.poll(&key).await?;
        assert_eq!(f.facility.run_count()?, runs_before);
        Ok(())
    }

    #[tokio::test]
    async fn definitive_failure_records_the_reason() -> Result<()> {
        let f = fixture();
        let key = ready_job(&f).await;
        let definition = f.dispatcher.get_job(&key).await?;
        f.facility.set_run_outcome(
            definition.job_id,
            RunOutcome::Fail {
                reason: "quota exceeded".to_string(),
            },
        )?;

        f.dispatcher.submit(&key).await?;
        let failed = f.dispatcher.poll_until_settled(&key, Duration::from_secs(1)).await?;
        assert_eq!(failed.state, JobState::Failed);
        assert_eq!(failed.failure_reason.as_deref(), Some("quota exceeded"));
        Ok(())
    }

    #[tokio::test]
    async fn rerun_resets_only_settled_jobs() -> Result<()> {
        let f = fixture();
        let key = ready_job(&f).await;

        let err = f.dispatcher.request_rerun(&key).await.unwrap_err();
        assert!(matches!(err, Error::InvalidStateTransition { .. }));

        f.dispatcher.submit(&key).await?;
        f.dispatcher
            .poll_until_settled(&key, Duration::from_secs(1))
            .await?;

        let reset = f.dispatcher.request_rerun(&key).await?;
        assert_eq!(reset.state, JobState::Defined);
        assert!(reset.last_run_handle.is_none());

        let resubmitted = f.dispatcher.submit(&key).await?;
        assert_eq!(resubmitted.state, JobState::Submitted);
        Ok(())
    }
}
