//! In-memory registry store for testing and local runs.
//!
//! ## Limitations
//!
//! - **NOT suitable for production**: No durability, no cross-process
//!   coordination
//! - **Single-process only**: State is not shared across process boundaries
//! - **No persistence**: All state is lost when the process exits

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;

use warden_core::{CredentialState, Identity, IdentityId, JobId, ScopeId};

use super::{AppliedPolicy, BindOutcome, CasResult, RegistryStore};
use crate::error::{Error, Result};
use crate::job::{JobDefinition, JobKey};

/// In-memory registry store.
///
/// Thread-safe implementation of [`RegistryStore`] using `RwLock`
/// maps. Operations are short and never await while holding a lock.
///
/// ## Example
///
/// ```rust
/// use warden_engine::registry::memory::MemoryRegistry;
///
/// let store = MemoryRegistry::new();
/// // Use store in tests...
/// ```
#[derive(Debug, Default)]
pub struct MemoryRegistry {
    identities: RwLock<HashMap<IdentityId, Identity>>,
    bindings: RwLock<HashMap<ScopeId, IdentityId>>,
    policies: RwLock<HashMap<ScopeId, AppliedPolicy>>,
    jobs: RwLock<HashMap<JobKey, JobDefinition>>,
}

/// Converts a lock poison error to a store error.
fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::store("lock poisoned")
}

impl MemoryRegistry {
    /// Creates a new empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of identity records currently stored.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn identity_count(&self) -> Result<usize> {
        let count = {
            let identities = self.identities.read().map_err(poison_err)?;
            identities.len()
        };
        Ok(count)
    }
}

#[async_trait]
impl RegistryStore for MemoryRegistry {
    async fn get_identity(&self, identity_id: &IdentityId) -> Result<Option<Identity>> {
        let result = {
            let identities = self.identities.read().map_err(poison_err)?;
            identities.get(identity_id).cloned()
        };
        Ok(result)
    }

    async fn put_identity(&self, identity: &Identity) -> Result<()> {
        {
            let mut identities = self.identities.write().map_err(poison_err)?;
            identities.insert(identity.identity_id, identity.clone());
        }
        Ok(())
    }

    async fn list_identities(&self) -> Result<Vec<Identity>> {
        let result = {
            let identities = self.identities.read().map_err(poison_err)?;
            let mut all: Vec<Identity> = identities.values().cloned().collect();
            all.sort_by_key(|i| i.identity_id);
            all
        };
        Ok(result)
    }

    async fn cas_credential_state(
        &self,
        identity_id: &IdentityId,
        expected: CredentialState,
        target: CredentialState,
    ) -> Result<CasResult> {
        let mut identities = self.identities.write().map_err(poison_err)?;

        let Some(identity) = identities.get_mut(identity_id) else {
            drop(identities);
            return Ok(CasResult::NotFound);
        };

        if identity.credential_state != expected {
            let actual = identity.credential_state;
            drop(identities);
            return Ok(CasResult::StateMismatch { actual });
        }

        identity.credential_state = target;
        drop(identities);
        Ok(CasResult::Success)
    }

    async fn bind_scope(
        &self,
        scope_id: &ScopeId,
        identity_id: IdentityId,
    ) -> Result<BindOutcome> {
        let mut bindings = self.bindings.write().map_err(poison_err)?;
        let outcome = match bindings.entry(scope_id.clone()) {
            Entry::Vacant(slot) => {
                slot.insert(identity_id);
                BindOutcome::Bound
            }
            Entry::Occupied(existing) => BindOutcome::AlreadyBound {
                identity_id: *existing.get(),
            },
        };
        drop(bindings);
        Ok(outcome)
    }

    async fn scope_binding(&self, scope_id: &ScopeId) -> Result<Option<IdentityId>> {
        let result = {
            let bindings = self.bindings.read().map_err(poison_err)?;
            bindings.get(scope_id).copied()
        };
        Ok(result)
    }

    async fn remove_scope_binding(&self, scope_id: &ScopeId) -> Result<()> {
        {
            let mut bindings = self.bindings.write().map_err(poison_err)?;
            bindings.remove(scope_id);
        }
        Ok(())
    }

    async fn applied_policy(&self, scope_id: &ScopeId) -> Result<Option<AppliedPolicy>> {
        let result = {
            let policies = self.policies.read().map_err(poison_err)?;
            policies.get(scope_id).cloned()
        };
        Ok(result)
    }

    async fn record_applied_policy(&self, policy: &AppliedPolicy) -> Result<()> {
        {
            let mut policies = self.policies.write().map_err(poison_err)?;
            policies.insert(policy.scope_id.clone(), policy.clone());
        }
        Ok(())
    }

    async fn get_job(&self, key: &JobKey) -> Result<Option<JobDefinition>> {
        let result = {
            let jobs = self.jobs.read().map_err(poison_err)?;
            jobs.get(key).cloned()
        };
        Ok(result)
    }

    async fn get_job_by_id(&self, job_id: JobId) -> Result<Option<JobDefinition>> {
        let result = {
            let jobs = self.jobs.read().map_err(poison_err)?;
            jobs.values().find(|j| j.job_id == job_id).cloned()
        };
        Ok(result)
    }

    async fn save_job(&self, definition: &JobDefinition) -> Result<()> {
        {
            let mut jobs = self.jobs.write().map_err(poison_err)?;
            jobs.insert(definition.natural_key(), definition.clone());
        }
        Ok(())
    }

    async fn list_jobs(&self) -> Result<Vec<JobDefinition>> {
        let result = {
            let jobs = self.jobs.read().map_err(poison_err)?;
            let mut all: Vec<JobDefinition> = jobs.values().cloned().collect();
            all.sort_by_key(|j| j.job_id);
            all
        };
        Ok(result)
    }
}
