//! Job definitions and the job state machine.
//!
//! A job is owned by the orchestrator identity and executes as a scope's
//! data-access identity. The two are never the same identity; that split
//! is enforced at construction by the dispatcher, and the stored record
//! keeps both ids so the invariant is auditable after the fact.
//!
//! State machine:
//!
//! ```text
//!     Defined ──► Submitted ──► Running ──► Succeeded
//!                     │            │
//!                     │            └──────► Failed
//!                     └──► Succeeded | Failed   (short runs may settle
//!                                                before a Running poll)
//!
//!     Succeeded | Failed ──► Defined   (explicit re-run request only)
//! ```

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use warden_core::{AssetRef, IdentityId, JobId, RunHandle, ScopeId};

use crate::error::{Error, Result};

/// Lifecycle state of a job definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    /// Defined in the execution facility, no run in flight.
    Defined,
    /// A run has been submitted; the facility has not reported progress yet.
    Submitted,
    /// The facility reports the run in progress.
    Running,
    /// The last run completed successfully.
    Succeeded,
    /// The last run failed definitively.
    Failed,
}

impl JobState {
    /// Returns true if this state permits transitioning to `target`.
    #[must_use]
    pub fn can_transition_to(&self, target: Self) -> bool {
        use JobState::{Defined, Failed, Running, Submitted, Succeeded};
        matches!(
            (self, target),
            (Defined, Submitted)
                | (Submitted, Running | Succeeded | Failed)
                | (Running, Succeeded | Failed)
                | (Succeeded | Failed, Defined)
        )
    }

    /// Returns true if this is a settled state.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }

    /// Returns a lowercase label for logs and metrics.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Defined => "defined",
            Self::Submitted => "submitted",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Execution settings carried on every job definition.
///
/// Settings changes are an in-place update under the job's natural key,
/// never a new job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobSettings {
    /// Whole-job timeout in seconds.
    pub timeout_seconds: u64,

    /// Per-task timeout in seconds.
    pub task_timeout_seconds: u64,

    /// Maximum concurrent runs of this job.
    pub max_concurrent_runs: u32,

    /// Whether runs queue instead of being rejected when at capacity.
    pub queue_enabled: bool,

    /// String parameters passed to the asset (e.g. catalog, schema).
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
}

impl Default for JobSettings {
    fn default() -> Self {
        Self {
            timeout_seconds: 3600,
            task_timeout_seconds: 1800,
            max_concurrent_runs: 1,
            queue_enabled: true,
            parameters: BTreeMap::new(),
        }
    }
}

impl JobSettings {
    /// Returns default settings with the given parameters.
    #[must_use]
    pub fn with_parameters(parameters: BTreeMap<String, String>) -> Self {
        Self {
            parameters,
            ..Self::default()
        }
    }
}

/// The natural key that makes `ensure_job` idempotent.
///
/// Two calls with the same owner, run-as, and asset address the same job
/// regardless of facility-assigned ids.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobKey {
    /// The orchestrator identity that owns the job.
    pub owner_identity_id: IdentityId,
    /// The data-access identity the job runs as.
    pub run_as_identity_id: IdentityId,
    /// The executable asset.
    pub asset_ref: AssetRef,
}

/// What the engine sends to the execution facility.
///
/// Carries no facility-assigned id and no engine-side state; the facility
/// deduplicates by `name`, which is derived deterministically from the
/// scope and asset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobDraft {
    /// Deterministic facility-side job name.
    pub name: String,
    /// The orchestrator identity that owns the job.
    pub owner_identity_id: IdentityId,
    /// The data-access identity the job runs as.
    pub run_as_identity_id: IdentityId,
    /// The scope this job exports.
    pub scope_id: ScopeId,
    /// The executable asset.
    pub asset_ref: AssetRef,
    /// Execution settings.
    pub settings: JobSettings,
}

/// A unit of scheduled/ad-hoc work tracked by the registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobDefinition {
    /// Facility-assigned job id.
    pub job_id: JobId,

    /// The orchestrator identity that owns the job. Orchestrator kind.
    pub owner_identity_id: IdentityId,

    /// The data-access identity the job runs as. DataAccess kind; never
    /// equal to the owner.
    pub run_as_identity_id: IdentityId,

    /// The scope this job exports. Always equal to the run-as identity's
    /// bound scope.
    pub scope_id: ScopeId,

    /// The executable asset (e.g. a notebook path).
    pub asset_ref: AssetRef,

    /// Execution settings.
    pub settings: JobSettings,

    /// Current lifecycle state.
    pub state: JobState,

    /// Handle of the most recent run, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_run_handle: Option<RunHandle>,

    /// Failure cause from the facility when `state` is Failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,

    /// When the definition was first created.
    pub created_at: DateTime<Utc>,

    /// When the definition was last updated.
    pub updated_at: DateTime<Utc>,
}

impl JobDefinition {
    /// Creates a new definition in the `Defined` state.
    #[must_use]
    pub fn new(
        job_id: JobId,
        owner_identity_id: IdentityId,
        run_as_identity_id: IdentityId,
        scope_id: ScopeId,
        asset_ref: AssetRef,
        settings: JobSettings,
    ) -> Self {
        let now = Utc::now();
        Self {
            job_id,
            owner_identity_id,
            run_as_identity_id,
            scope_id,
            asset_ref,
            settings,
            state: JobState::Defined,
            last_run_handle: None,
            failure_reason: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Returns the natural key for idempotent `ensure_job`.
    #[must_use]
    pub fn natural_key(&self) -> JobKey {
        JobKey {
            owner_identity_id: self.owner_identity_id,
            run_as_identity_id: self.run_as_identity_id,
            asset_ref: self.asset_ref.clone(),
        }
    }

    /// Returns the deterministic facility-side name for a scope/asset pair.
    #[must_use]
    pub fn facility_name(scope_id: &ScopeId, asset_ref: &AssetRef) -> String {
        let asset_leaf = asset_ref
            .as_str()
            .rsplit('/')
            .next()
            .unwrap_or("asset")
            .to_lowercase();
        format!("export-{scope_id}-{asset_leaf}")
    }

    /// Builds the draft sent to the execution facility.
    #[must_use]
    pub fn draft(&self) -> JobDraft {
        JobDraft {
            name: Self::facility_name(&self.scope_id, &self.asset_ref),
            owner_identity_id: self.owner_identity_id,
            run_as_identity_id: self.run_as_identity_id,
            scope_id: self.scope_id.clone(),
            asset_ref: self.asset_ref.clone(),
            settings: self.settings.clone(),
        }
    }

    /// Transitions to `target`, validating against the state machine.
    ///
    /// # Errors
    ///
    /// Returns `InvalidStateTransition` if the transition is not allowed.
    pub fn transition_to(&mut self, target: JobState) -> Result<()> {
        if !self.state.can_transition_to(target) {
            return Err(Error::InvalidStateTransition {
                from: self.state.as_str().to_string(),
                to: target.as_str().to_string(),
                reason: "not permitted by the job state machine".to_string(),
            });
        }
        self.state = target;
        self.updated_at = Utc::now();
        if target == JobState::Defined {
            self.last_run_handle = None;
            self.failure_reason = None;
        }
        Ok(())
    }
}
