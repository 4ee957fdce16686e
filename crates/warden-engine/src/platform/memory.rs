//! In-memory collaborator fakes for testing and local runs.
//!
//! Each port from the parent module gets a thread-safe fake with just
//! enough behavior to exercise the engine: secret validation and
//! counting on the provider, idempotent membership on the policy engine,
//! scripted run outcomes and transient-fault injection on the execution
//! facility.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use ulid::Ulid;

use warden_core::{
    AccessControlGroup, AssetRef, Entitlement, GroupId, IdentityId, JobId, PolicyRef, RunHandle,
    ScopeId,
};

use super::{
    AccessToken, AppCredential, ExecutionFacility, GrantService, IdentityProvider, PolicyEngine,
    RunStatus,
};
use crate::error::{Error, Result};
use crate::job::JobDraft;

/// Converts a lock poison error to a store error.
fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::store("lock poisoned")
}

#[derive(Debug, Clone)]
struct Application {
    display_name: String,
    entitlements: Vec<Entitlement>,
    // credential_id -> secret
    secrets: HashMap<String, String>,
    revoked: bool,
}

/// In-memory identity provider.
///
/// Validates secrets on exchange, counts exchanges so token-cache tests
/// can assert call volume, and supports multiple live secrets per
/// application for rotation tests.
#[derive(Debug)]
pub struct MemoryIdentityProvider {
    applications: RwLock<HashMap<String, Application>>,
    exchange_count: AtomicU32,
    token_ttl_seconds: i64,
}

impl Default for MemoryIdentityProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryIdentityProvider {
    /// Creates a provider issuing tokens with a one-hour lifetime.
    #[must_use]
    pub fn new() -> Self {
        Self::with_token_ttl_seconds(3600)
    }

    /// Creates a provider with a custom token lifetime.
    ///
    /// Short lifetimes let tests cross the refresh margin quickly.
    #[must_use]
    pub fn with_token_ttl_seconds(token_ttl_seconds: i64) -> Self {
        Self {
            applications: RwLock::new(HashMap::new()),
            exchange_count: AtomicU32::new(0),
            token_ttl_seconds,
        }
    }

    /// Returns how many token exchanges have been performed.
    #[must_use]
    pub fn exchange_count(&self) -> u32 {
        self.exchange_count.load(Ordering::SeqCst)
    }

    /// Returns the number of live secrets on an application.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn secret_count(&self, application_id: &str) -> Result<usize> {
        let count = {
            let applications = self.applications.read().map_err(poison_err)?;
            applications
                .get(application_id)
                .map_or(0, |app| app.secrets.len())
        };
        Ok(count)
    }

    /// Returns the entitlements registered for an application.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn entitlements(&self, application_id: &str) -> Result<Vec<Entitlement>> {
        let entitlements = {
            let applications = self.applications.read().map_err(poison_err)?;
            applications
                .get(application_id)
                .map(|app| app.entitlements.clone())
                .unwrap_or_default()
        };
        Ok(entitlements)
    }

    /// Returns true if the application has been revoked.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn is_application_revoked(&self, application_id: &str) -> Result<bool> {
        let revoked = {
            let applications = self.applications.read().map_err(poison_err)?;
            applications.get(application_id).is_some_and(|a| a.revoked)
        };
        Ok(revoked)
    }

    fn mint_credential(application_id: &str) -> (String, String, AppCredential) {
        let credential_id = format!("cred-{}", Ulid::new());
        let secret = format!("secret-{}", Ulid::new());
        let credential = AppCredential {
            application_id: application_id.to_string(),
            credential_id: credential_id.clone(),
            secret: secret.clone(),
            issued_at: Utc::now(),
        };
        (credential_id, secret, credential)
    }
}

#[async_trait]
impl IdentityProvider for MemoryIdentityProvider {
    async fn register_application(
        &self,
        display_name: &str,
        entitlements: &[Entitlement],
    ) -> Result<AppCredential> {
        let mut applications = self.applications.write().map_err(poison_err)?;

        // Registration under an existing name behaves like the platform's
        // conflict path: adopt the existing application, issue a secret.
        let existing_id = applications
            .iter()
            .find(|(_, app)| app.display_name == display_name && !app.revoked)
            .map(|(id, _)| id.clone());

        let credential = if let Some(application_id) = existing_id {
            let (credential_id, secret, credential) = Self::mint_credential(&application_id);
            if let Some(app) = applications.get_mut(&application_id) {
                app.secrets.insert(credential_id, secret);
            }
            credential
        } else {
            let application_id = format!("app-{}", Ulid::new());
            let (credential_id, secret, credential) = Self::mint_credential(&application_id);
            applications.insert(
                application_id,
                Application {
                    display_name: display_name.to_string(),
                    entitlements: entitlements.to_vec(),
                    secrets: HashMap::from([(credential_id, secret)]),
                    revoked: false,
                },
            );
            credential
        };

        drop(applications);
        Ok(credential)
    }

    async fn issue_secret(&self, application_id: &str) -> Result<AppCredential> {
        let mut applications = self.applications.write().map_err(poison_err)?;
        let Some(app) = applications.get_mut(application_id) else {
            drop(applications);
            return Err(Error::auth_rejected(format!(
                "unknown application {application_id}"
            )));
        };
        if app.revoked {
            drop(applications);
            return Err(Error::auth_rejected(format!(
                "application {application_id} is revoked"
            )));
        }

        let (credential_id, secret, credential) = Self::mint_credential(application_id);
        app.secrets.insert(credential_id, secret);
        drop(applications);
        Ok(credential)
    }

    async fn exchange(&self, credential: &AppCredential) -> Result<AccessToken> {
        let valid = {
            let applications = self.applications.read().map_err(poison_err)?;
            applications
                .get(&credential.application_id)
                .filter(|app| !app.revoked)
                .and_then(|app| app.secrets.get(&credential.credential_id))
                .is_some_and(|secret| *secret == credential.secret)
        };

        if !valid {
            return Err(Error::auth_rejected(format!(
                "invalid or expired secret for application {}",
                credential.application_id
            )));
        }

        self.exchange_count.fetch_add(1, Ordering::SeqCst);
        Ok(AccessToken {
            token: format!("token-{}", Ulid::new()),
            expires_at: Utc::now() + ChronoDuration::seconds(self.token_ttl_seconds),
        })
    }

    async fn revoke_application_secret(&self, credential_id: &str) -> Result<()> {
        let mut applications = self.applications.write().map_err(poison_err)?;
        for app in applications.values_mut() {
            app.secrets.remove(credential_id);
        }
        drop(applications);
        Ok(())
    }

    async fn revoke_application(&self, application_id: &str) -> Result<()> {
        let mut applications = self.applications.write().map_err(poison_err)?;
        if let Some(app) = applications.get_mut(application_id) {
            app.revoked = true;
            app.secrets.clear();
        }
        drop(applications);
        Ok(())
    }
}

#[derive(Debug, Default, Clone)]
struct PolicyAttachment {
    row_filter: Option<PolicyRef>,
    column_mask: Option<PolicyRef>,
}

/// In-memory policy engine.
///
/// Group membership is idempotent in both directions. A one-shot
/// failure can be injected into `remove_group_member` to exercise the
/// teardown ordering invariant.
#[derive(Debug, Default)]
pub struct MemoryPolicyEngine {
    groups: RwLock<HashMap<GroupId, AccessControlGroup>>,
    attachments: RwLock<HashMap<ScopeId, PolicyAttachment>>,
    fail_next_remove: AtomicBool,
}

impl MemoryPolicyEngine {
    /// Creates a new empty policy engine.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `remove_group_member` call fail definitively.
    pub fn fail_next_remove_member(&self) {
        self.fail_next_remove.store(true, Ordering::SeqCst);
    }

    /// Returns the row filter attached to a scope, if any.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn row_filter(&self, scope_id: &ScopeId) -> Result<Option<PolicyRef>> {
        let result = {
            let attachments = self.attachments.read().map_err(poison_err)?;
            attachments
                .get(scope_id)
                .and_then(|a| a.row_filter.clone())
        };
        Ok(result)
    }

    /// Returns the column mask attached to a scope, if any.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn column_mask(&self, scope_id: &ScopeId) -> Result<Option<PolicyRef>> {
        let result = {
            let attachments = self.attachments.read().map_err(poison_err)?;
            attachments
                .get(scope_id)
                .and_then(|a| a.column_mask.clone())
        };
        Ok(result)
    }
}

#[async_trait]
impl PolicyEngine for MemoryPolicyEngine {
    async fn ensure_group(
        &self,
        group_id: &GroupId,
        scope_id: &ScopeId,
    ) -> Result<AccessControlGroup> {
        let mut groups = self.groups.write().map_err(poison_err)?;
        let group = groups
            .entry(group_id.clone())
            .or_insert_with(|| AccessControlGroup {
                group_id: group_id.clone(),
                scope_id: scope_id.clone(),
                member_identity_ids: std::collections::BTreeSet::new(),
            })
            .clone();
        drop(groups);
        Ok(group)
    }

    async fn get_group(&self, group_id: &GroupId) -> Result<Option<AccessControlGroup>> {
        let result = {
            let groups = self.groups.read().map_err(poison_err)?;
            groups.get(group_id).cloned()
        };
        Ok(result)
    }

    async fn add_group_member(&self, group_id: &GroupId, identity_id: IdentityId) -> Result<()> {
        let mut groups = self.groups.write().map_err(poison_err)?;
        let Some(group) = groups.get_mut(group_id) else {
            drop(groups);
            return Err(Error::not_found(format!("group {group_id}")));
        };
        group.add_member(identity_id);
        drop(groups);
        Ok(())
    }

    async fn remove_group_member(
        &self,
        group_id: &GroupId,
        identity_id: IdentityId,
    ) -> Result<()> {
        if self.fail_next_remove.swap(false, Ordering::SeqCst) {
            return Err(Error::ExternalFatal {
                message: format!("membership removal rejected for group {group_id}"),
                attempts: 1,
            });
        }

        let mut groups = self.groups.write().map_err(poison_err)?;
        if let Some(group) = groups.get_mut(group_id) {
            group.remove_member(&identity_id);
        }
        drop(groups);
        Ok(())
    }

    async fn attach_row_filter(&self, scope_id: &ScopeId, filter_ref: &PolicyRef) -> Result<()> {
        let mut attachments = self.attachments.write().map_err(poison_err)?;
        attachments.entry(scope_id.clone()).or_default().row_filter = Some(filter_ref.clone());
        drop(attachments);
        Ok(())
    }

    async fn attach_column_mask(&self, scope_id: &ScopeId, mask_ref: &PolicyRef) -> Result<()> {
        let mut attachments = self.attachments.write().map_err(poison_err)?;
        attachments.entry(scope_id.clone()).or_default().column_mask = Some(mask_ref.clone());
        drop(attachments);
        Ok(())
    }
}

/// Scripted outcome for runs started on the in-memory facility.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// Report Running for `after_polls` polls, then Succeeded.
    Succeed {
        /// Number of Running reports before success.
        after_polls: u32,
    },
    /// Report Failed with the given reason on the first poll.
    Fail {
        /// The failure cause the facility reports.
        reason: String,
    },
    /// Report Running forever (exercises the poll wait budget).
    NeverSettle,
}

impl Default for RunOutcome {
    fn default() -> Self {
        Self::Succeed { after_polls: 1 }
    }
}

#[derive(Debug)]
struct RunRecord {
    outcome: RunOutcome,
    polls: u32,
}

/// In-memory execution facility.
///
/// Deduplicates jobs by draft name (ids are stable across updates),
/// scripts run outcomes per job, and can inject transient poll failures.
#[derive(Debug, Default)]
pub struct MemoryExecutionFacility {
    jobs: RwLock<HashMap<String, (JobId, JobDraft)>>,
    runs: RwLock<HashMap<RunHandle, RunRecord>>,
    outcomes: RwLock<HashMap<JobId, RunOutcome>>,
    next_job_id: AtomicU64,
    transient_poll_failures: AtomicU32,
}

impl MemoryExecutionFacility {
    /// Creates a new empty facility.
    #[must_use]
    pub fn new() -> Self {
        Self {
            jobs: RwLock::new(HashMap::new()),
            runs: RwLock::new(HashMap::new()),
            outcomes: RwLock::new(HashMap::new()),
            next_job_id: AtomicU64::new(100),
            transient_poll_failures: AtomicU32::new(0),
        }
    }

    /// Scripts the outcome of future runs of `job_id`.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn set_run_outcome(&self, job_id: JobId, outcome: RunOutcome) -> Result<()> {
        {
            let mut outcomes = self.outcomes.write().map_err(poison_err)?;
            outcomes.insert(job_id, outcome);
        }
        Ok(())
    }

    /// Makes the next `count` `get_run_state` calls fail transiently.
    pub fn inject_transient_poll_failures(&self, count: u32) {
        self.transient_poll_failures.store(count, Ordering::SeqCst);
    }

    /// Returns the number of distinct jobs the facility knows.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn job_count(&self) -> Result<usize> {
        let count = {
            let jobs = self.jobs.read().map_err(poison_err)?;
            jobs.len()
        };
        Ok(count)
    }

    /// Returns the number of runs started.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn run_count(&self) -> Result<usize> {
        let count = {
            let runs = self.runs.read().map_err(poison_err)?;
            runs.len()
        };
        Ok(count)
    }
}

#[async_trait]
impl ExecutionFacility for MemoryExecutionFacility {
    async fn create_or_update_job(&self, draft: &JobDraft) -> Result<JobId> {
        let mut jobs = self.jobs.write().map_err(poison_err)?;
        let job_id = match jobs.get_mut(&draft.name) {
            Some((existing_id, stored)) => {
                *stored = draft.clone();
                *existing_id
            }
            None => {
                let job_id = JobId::new(self.next_job_id.fetch_add(1, Ordering::SeqCst));
                jobs.insert(draft.name.clone(), (job_id, draft.clone()));
                job_id
            }
        };
        drop(jobs);
        Ok(job_id)
    }

    async fn run(&self, job_id: JobId, _run_as: IdentityId) -> Result<RunHandle> {
        let known = {
            let jobs = self.jobs.read().map_err(poison_err)?;
            jobs.values().any(|(id, _)| *id == job_id)
        };
        if !known {
            return Err(Error::not_found(format!("job {job_id}")));
        }

        let outcome = {
            let outcomes = self.outcomes.read().map_err(poison_err)?;
            outcomes.get(&job_id).cloned().unwrap_or_default()
        };

        let handle = RunHandle::new(format!("run-{}", Ulid::new()));
        {
            let mut runs = self.runs.write().map_err(poison_err)?;
            runs.insert(handle.clone(), RunRecord { outcome, polls: 0 });
        }
        Ok(handle)
    }

    async fn get_run_state(&self, handle: &RunHandle) -> Result<RunStatus> {
        let remaining = self.transient_poll_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.transient_poll_failures
                .store(remaining - 1, Ordering::SeqCst);
            return Err(Error::transient("execution facility unavailable"));
        }

        let mut runs = self.runs.write().map_err(poison_err)?;
        let Some(record) = runs.get_mut(handle) else {
            drop(runs);
            return Err(Error::not_found(format!("run {handle}")));
        };

        record.polls += 1;
        let status = match &record.outcome {
            RunOutcome::Succeed { after_polls } => {
                if record.polls > *after_polls {
                    RunStatus::Succeeded
                } else {
                    RunStatus::Running
                }
            }
            RunOutcome::Fail { reason } => RunStatus::Failed {
                reason: reason.clone(),
            },
            RunOutcome::NeverSettle => RunStatus::Running,
        };
        drop(runs);
        Ok(status)
    }
}

/// In-memory permission-grant service.
#[derive(Debug, Default)]
pub struct MemoryGrantService {
    grants: RwLock<HashSet<(String, IdentityId)>>,
}

impl MemoryGrantService {
    /// Creates a new empty grant service.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of grants recorded.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn grant_count(&self) -> Result<usize> {
        let count = {
            let grants = self.grants.read().map_err(poison_err)?;
            grants.len()
        };
        Ok(count)
    }
}

#[async_trait]
impl GrantService for MemoryGrantService {
    async fn grant_read(&self, asset_ref: &AssetRef, identity_id: IdentityId) -> Result<()> {
        {
            let mut grants = self.grants.write().map_err(poison_err)?;
            grants.insert((asset_ref.as_str().to_string(), identity_id));
        }
        Ok(())
    }

    async fn has_read(&self, asset_ref: &AssetRef, identity_id: IdentityId) -> Result<bool> {
        let granted = {
            let grants = self.grants.read().map_err(poison_err)?;
            grants.contains(&(asset_ref.as_str().to_string(), identity_id))
        };
        Ok(granted)
    }
}
