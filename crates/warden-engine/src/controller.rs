//! End-to-end orchestration: converge every configured scope onto a
//! bound identity, attached policies, an active credential, and a
//! settled export job.
//!
//! Convergence is resumable and per-scope isolated: the pipeline is
//! recomputed from registry state every pass (no persisted phase
//! column), and one scope's failure never blocks another's progress.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::Instrument;

use warden_core::observability::scope_span;
use warden_core::{Identity, IdentityKind, ScopeId};

use crate::binding::ScopeBindingService;
use crate::broker::CredentialBroker;
use crate::config::ScopeConfig;
use crate::dispatch::JobDispatcher;
use crate::error::{Error, Result};
use crate::job::{JobDefinition, JobState};
use crate::metrics::EngineMetrics;
use crate::platform::GrantService;
use crate::registry::{IdentityRegistry, RegistryStore};

/// How far along a scope's provisioning pipeline is, derived from
/// registry state on demand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ScopePhase {
    /// No identity bound.
    Unbound,
    /// Identity bound, policies not yet recorded.
    Bound,
    /// Policies attached, no job defined yet.
    PolicyApplied,
    /// The full pipeline exists; see the job state for run progress.
    Converged,
}

/// Outcome of one scope's converge pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScopeReport {
    /// The scope this report covers.
    pub scope_id: ScopeId,
    /// Pipeline phase after the pass.
    pub phase: ScopePhase,
    /// State of the scope's export job, when one exists.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_state: Option<JobState>,
    /// The error that stopped the pass, if it did not complete.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ScopeReport {
    /// Returns true if the pass completed and the job succeeded.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.error.is_none() && self.job_state == Some(JobState::Succeeded)
    }
}

/// Drives the provisioning pipeline across all configured scopes.
#[derive(Clone)]
pub struct OrchestrationController {
    registry: IdentityRegistry,
    broker: CredentialBroker,
    binding: ScopeBindingService,
    dispatcher: JobDispatcher,
    grants: Arc<dyn GrantService>,
    metrics: EngineMetrics,
    poll_timeout: Duration,
}

impl std::fmt::Debug for OrchestrationController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrchestrationController")
            .finish_non_exhaustive()
    }
}

impl OrchestrationController {
    /// Creates a controller over the assembled services.
    #[must_use]
    pub fn new(
        registry: IdentityRegistry,
        broker: CredentialBroker,
        binding: ScopeBindingService,
        dispatcher: JobDispatcher,
        grants: Arc<dyn GrantService>,
        poll_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            broker,
            binding,
            dispatcher,
            grants,
            metrics: EngineMetrics::new(),
            poll_timeout,
        }
    }

    /// Ensures the single orchestrator identity exists and is registered
    /// with the provider.
    pub async fn ensure_orchestrator(&self) -> Result<Identity> {
        let orchestrator = self
            .registry
            .ensure_identity(IdentityKind::Orchestrator, None)
            .await?;
        self.broker.register(&orchestrator.identity_id).await?;
        Ok(orchestrator)
    }

    /// Converges every scope in the roster, in parallel, isolating
    /// failures per scope.
    ///
    /// # Errors
    ///
    /// Only orchestrator bootstrap can fail the whole pass; scope-level
    /// failures land in their reports.
    pub async fn converge(&self, scopes: &[ScopeConfig]) -> Result<Vec<ScopeReport>> {
        let orchestrator = self.ensure_orchestrator().await?;

        let passes = scopes
            .iter()
            .map(|cfg| self.converge_scope_report(&orchestrator, cfg));
        Ok(futures::future::join_all(passes).await)
    }

    /// Runs the full pipeline for one scope and returns the settled job
    /// definition.
    ///
    /// Resumable: every step is idempotent, so a crashed pass picks up
    /// where registry state says it left off. An already-succeeded job is
    /// returned without resubmission.
    pub async fn converge_scope(
        &self,
        orchestrator: &Identity,
        cfg: &ScopeConfig,
    ) -> Result<JobDefinition> {
        let span = scope_span("converge", cfg.scope_id.as_str());
        self.converge_scope_inner(orchestrator, cfg)
            .instrument(span)
            .await
    }

    async fn converge_scope_inner(
        &self,
        orchestrator: &Identity,
        cfg: &ScopeConfig,
    ) -> Result<JobDefinition> {
        let scope = cfg.to_scope();
        let worker = self.binding.ensure_scope_binding(&scope).await?;
        self.binding.apply_data_policy(&scope, false).await?;

        // First successful exchange activates a Pending credential.
        self.broker.issue(&worker.identity_id).await?;
        self.grants
            .grant_read(&cfg.asset_ref, worker.identity_id)
            .await?;

        let definition = self
            .dispatcher
            .ensure_job(
                &orchestrator.identity_id,
                &worker.identity_id,
                &cfg.asset_ref,
                cfg.job_settings(),
            )
            .await?;
        let key = definition.natural_key();

        let definition = match definition.state {
            JobState::Defined => {
                self.dispatcher.submit(&key).await?;
                self.dispatcher.poll_until_settled(&key, self.poll_timeout).await?
            }
            JobState::Submitted | JobState::Running => {
                self.dispatcher.poll_until_settled(&key, self.poll_timeout).await?
            }
            JobState::Succeeded | JobState::Failed => definition,
        };

        if definition.state == JobState::Failed {
            return Err(Error::ExternalFatal {
                message: format!(
                    "export run failed: {}",
                    definition.failure_reason.as_deref().unwrap_or("unknown")
                ),
                attempts: 1,
            });
        }
        Ok(definition)
    }

    /// Requests a re-run of a scope's settled export job and drives it
    /// back to a settled state.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the scope has no job yet, and
    /// `InvalidStateTransition` if the job has a run in flight.
    pub async fn rerun_scope(&self, scope_id: &ScopeId) -> Result<JobDefinition> {
        let definition = self
            .job_for_scope(scope_id)
            .await?
            .ok_or_else(|| Error::not_found(format!("job for scope {scope_id}")))?;
        let key = definition.natural_key();

        self.dispatcher.request_rerun(&key).await?;
        self.dispatcher.submit(&key).await?;
        self.dispatcher.poll_until_settled(&key, self.poll_timeout).await
    }

    /// Derives how far along a scope's pipeline is.
    pub async fn scope_phase(&self, scope_id: &ScopeId) -> Result<ScopePhase> {
        if self.binding.bound_identity(scope_id).await?.is_none() {
            return Ok(ScopePhase::Unbound);
        }
        let store = self.registry.store();
        if store.applied_policy(scope_id).await?.is_none() {
            return Ok(ScopePhase::Bound);
        }
        if self.job_for_scope(scope_id).await?.is_none() {
            return Ok(ScopePhase::PolicyApplied);
        }
        Ok(ScopePhase::Converged)
    }

    async fn job_for_scope(&self, scope_id: &ScopeId) -> Result<Option<JobDefinition>> {
        Ok(self
            .registry
            .store()
            .list_jobs()
            .await?
            .into_iter()
            .find(|job| job.scope_id == *scope_id))
    }

    async fn converge_scope_report(
        &self,
        orchestrator: &Identity,
        cfg: &ScopeConfig,
    ) -> ScopeReport {
        let started = Instant::now();
        let outcome = self.converge_scope(orchestrator, cfg).await;
        let duration = started.elapsed();

        let (job_state, error) = match outcome {
            Ok(definition) => (Some(definition.state), None),
            Err(err) => {
                tracing::error!(
                    scope_id = %cfg.scope_id,
                    error = %err,
                    "scope converge failed"
                );
                let job_state = self
                    .job_for_scope(&cfg.scope_id)
                    .await
                    .ok()
                    .flatten()
                    .map(|job| job.state);
                (job_state, Some(err.to_string()))
            }
        };

        let status = match (&error, job_state) {
            (None, Some(JobState::Succeeded)) => "succeeded",
            (None, _) => "running",
            (Some(_), _) => "failed",
        };
        self.metrics.record_scope_converge(status, duration);

        let phase = self
            .scope_phase(&cfg.scope_id)
            .await
            .unwrap_or(ScopePhase::Unbound);
        ScopeReport {
            scope_id: cfg.scope_id.clone(),
            phase,
            job_state,
            error,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use warden_core::audit::{AuditEmitter, TestAuditSink};
    use warden_core::{AssetRef, PolicyRef};

    use crate::platform::memory::{
        MemoryExecutionFacility, MemoryGrantService, MemoryIdentityProvider, MemoryPolicyEngine,
    };
    use crate::platform::{ExecutionFacility, IdentityProvider, PolicyEngine};
    use crate::registry::memory::MemoryRegistry;
    use crate::retry::RetryConfig;

    fn controller() -> (OrchestrationController, IdentityRegistry) {
        let sink = Arc::new(TestAuditSink::new());
        let audit = AuditEmitter::with_test_sink(sink);
        let registry = IdentityRegistry::new(Arc::new(MemoryRegistry::new()), audit.clone());
        let provider = Arc::new(MemoryIdentityProvider::new());
        let policy = Arc::new(MemoryPolicyEngine::new());
        let facility = Arc::new(MemoryExecutionFacility::new());
        let grants = Arc::new(MemoryGrantService::new());
        let retry = RetryConfig {
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(4),
            max_attempts: 3,
        };

        let broker = CredentialBroker::new(
            registry.clone(),
            provider as Arc<dyn IdentityProvider>,
            audit.clone(),
            86_400,
        );
        let binding = ScopeBindingService::new(
            registry.clone(),
            broker.clone(),
            policy as Arc<dyn PolicyEngine>,
            audit.clone(),
            retry,
        );
        let dispatcher = JobDispatcher::new(
            registry.clone(),
            facility as Arc<dyn ExecutionFacility>,
            Arc::clone(&grants) as Arc<dyn GrantService>,
            audit,
            retry,
            Duration::from_millis(1),
        );
        let controller = OrchestrationController::new(
            registry.clone(),
            broker,
            binding,
            dispatcher,
            grants as Arc<dyn GrantService>,
            Duration::from_secs(1),
        );
        (controller, registry)
    }

    fn cfg(id: &str) -> ScopeConfig {
        ScopeConfig {
            scope_id: ScopeId::new(id).unwrap(),
            display_name: format!("{id} exports"),
            masking_policy_ref: PolicyRef::new("masks/pii-standard"),
            row_filter_ref: PolicyRef::new(format!("filters/region-{id}")),
            asset_ref: AssetRef::new("/exports/regional_export"),
            parameters: std::collections::BTreeMap::new(),
        }
    }

    #[tokio::test]
    async fn converge_scope_runs_the_full_pipeline() -> Result<()> {
        let (controller, _) = controller();
        let orchestrator = controller.ensure_orchestrator().await?;

        let job = controller.converge_scope(&orchestrator, &cfg("us")).await?;
        assert_eq!(job.state, JobState::Succeeded);
        assert_eq!(
            controller.scope_phase(&ScopeId::new("us")?).await?,
            ScopePhase::Converged
        );
        Ok(())
    }

    #[tokio::test]
    async fn converge_scope_is_resumable_without_duplicates() -> Result<()> {
        let (controller, registry) = controller();
        let orchestrator = controller.ensure_orchestrator().await?;

        let first = controller.converge_scope(&orchestrator, &cfg("us")).await?;
        // Second pass finds everything in place and does not resubmit.
        let second = controller.converge_scope(&orchestrator, &cfg("us")).await?;
        assert_eq!(first.job_id, second.job_id);
        assert_eq!(second.last_run_handle, first.last_run_handle);

        // One orchestrator, one worker.
        assert_eq!(registry.list().await?.len(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn phase_derivation_tracks_the_pipeline() -> Result<()> {
        let (controller, _) = controller();
        let scope_id = ScopeId::new("eu")?;
        assert_eq!(
            controller.scope_phase(&scope_id).await?,
            ScopePhase::Unbound
        );

        let orchestrator = controller.ensure_orchestrator().await?;
        controller.converge_scope(&orchestrator, &cfg("eu")).await?;
        assert_eq!(
            controller.scope_phase(&scope_id).await?,
            ScopePhase::Converged
        );
        Ok(())
    }

    #[tokio::test]
    async fn rerun_scope_drives_a_second_run() -> Result<()> {
        let (controller, _) = controller();
        let orchestrator = controller.ensure_orchestrator().await?;
        let first = controller.converge_scope(&orchestrator, &cfg("us")).await?;

        let rerun = controller.rerun_scope(&ScopeId::new("us")?).await?;
        assert_eq!(rerun.state, JobState::Succeeded);
        assert_ne!(rerun.last_run_handle, first.last_run_handle);
        Ok(())
    }
}
