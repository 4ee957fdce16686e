//! Error types for the orchestration engine.
//!
//! The taxonomy separates invariant violations (never retried) from
//! external failures (`ExternalTransient` is retried with bounded backoff,
//! then surfaced as `ExternalFatal`). Everything else surfaces immediately:
//! retrying a least-privilege violation can never succeed.

use warden_core::{AssetRef, CredentialState, IdentityId, ScopeId};

/// The result type used throughout warden-engine.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in orchestration operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// An identity/scope pairing violated the binding rules.
    #[error("invalid scope binding: {message}")]
    InvalidScopeBinding {
        /// Description of the violation.
        message: String,
    },

    /// A requested entity does not exist.
    #[error("not found: {entity}")]
    NotFound {
        /// Description of the missing entity.
        entity: String,
    },

    /// An identity was already revoked when revocation was requested.
    #[error("identity already revoked: {identity_id}")]
    AlreadyRevoked {
        /// The identity that is already terminal.
        identity_id: IdentityId,
    },

    /// The identity provider rejected an application credential.
    #[error("authentication rejected: {message}")]
    AuthRejected {
        /// Description of the rejection.
        message: String,
    },

    /// An operation targeted a revoked identity.
    #[error("identity revoked: {identity_id}")]
    IdentityRevoked {
        /// The revoked identity.
        identity_id: IdentityId,
    },

    /// A credential rotation was started while one is still pending.
    #[error("credential rotation already in progress for {identity_id}")]
    RotationInProgress {
        /// The identity whose rotation is pending confirmation.
        identity_id: IdentityId,
    },

    /// A different policy is already attached to the scope's resources.
    #[error("policy conflict for scope {scope_id}: {message}")]
    PolicyConflict {
        /// The scope with the conflicting policy.
        scope_id: ScopeId,
        /// Description of the conflict.
        message: String,
    },

    /// A job definition would collapse the owner/run-as separation.
    #[error("least-privilege violation: {message}")]
    LeastPrivilegeViolation {
        /// Description of the violation.
        message: String,
    },

    /// A job submission requires an Active run-as credential.
    #[error("credential not ready for {identity_id}: state is {state}")]
    CredentialNotReady {
        /// The run-as identity.
        identity_id: IdentityId,
        /// Its current credential state.
        state: CredentialState,
    },

    /// The run-as identity lacks read permission on the job's asset.
    #[error("asset permission missing: {identity_id} cannot read {asset_ref}")]
    AssetPermissionMissing {
        /// The run-as identity.
        identity_id: IdentityId,
        /// The asset the job would execute.
        asset_ref: AssetRef,
    },

    /// A retriable external failure (network blip, rate limit).
    #[error("transient external error: {message}")]
    ExternalTransient {
        /// Description of the failure.
        message: String,
    },

    /// An external failure that exhausted retries or is definitive.
    #[error("fatal external error after {attempts} attempt(s): {message}")]
    ExternalFatal {
        /// Description of the failure.
        message: String,
        /// How many attempts were made before giving up.
        attempts: u32,
    },

    /// An invalid state transition was attempted.
    #[error("invalid state transition: {from} -> {to} ({reason})")]
    InvalidStateTransition {
        /// The current state.
        from: String,
        /// The attempted target state.
        to: String,
        /// The reason the transition is invalid.
        reason: String,
    },

    /// Configuration was missing or malformed.
    #[error("configuration error: {message}")]
    Configuration {
        /// Description of the configuration problem.
        message: String,
    },

    /// A registry store operation failed.
    #[error("store error: {message}")]
    Store {
        /// Description of the store failure.
        message: String,
    },

    /// An error from warden-core.
    #[error("core error: {0}")]
    Core(#[from] warden_core::Error),
}

impl Error {
    /// Creates a new invalid-scope-binding error.
    #[must_use]
    pub fn invalid_scope_binding(message: impl Into<String>) -> Self {
        Self::InvalidScopeBinding {
            message: message.into(),
        }
    }

    /// Creates a new not-found error.
    #[must_use]
    pub fn not_found(entity: impl Into<String>) -> Self {
        Self::NotFound {
            entity: entity.into(),
        }
    }

    /// Creates a new auth-rejected error.
    #[must_use]
    pub fn auth_rejected(message: impl Into<String>) -> Self {
        Self::AuthRejected {
            message: message.into(),
        }
    }

    /// Creates a new least-privilege-violation error.
    #[must_use]
    pub fn least_privilege(message: impl Into<String>) -> Self {
        Self::LeastPrivilegeViolation {
            message: message.into(),
        }
    }

    /// Creates a new transient external error.
    #[must_use]
    pub fn transient(message: impl Into<String>) -> Self {
        Self::ExternalTransient {
            message: message.into(),
        }
    }

    /// Creates a new configuration error.
    #[must_use]
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Creates a new store error.
    #[must_use]
    pub fn store(message: impl Into<String>) -> Self {
        Self::Store {
            message: message.into(),
        }
    }

    /// Returns true if this error may be retried.
    ///
    /// This is the single predicate the retry helper consults; every
    /// other kind is an invariant violation or definitive failure.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::ExternalTransient { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_external_transient_is_retriable() {
        assert!(Error::transient("rate limited").is_transient());
        assert!(!Error::least_privilege("owner equals run-as").is_transient());
        assert!(!Error::not_found("identity").is_transient());
        assert!(
            !Error::ExternalFatal {
                message: "gone".into(),
                attempts: 5,
            }
            .is_transient()
        );
    }

    #[test]
    fn least_privilege_display() {
        let err = Error::least_privilege("owner and run-as are the same identity");
        assert!(err.to_string().contains("least-privilege violation"));
    }

    #[test]
    fn credential_not_ready_display() {
        let err = Error::CredentialNotReady {
            identity_id: IdentityId::generate(),
            state: CredentialState::Pending,
        };
        assert!(err.to_string().contains("pending"));
    }

    #[test]
    fn core_error_converts() {
        let core = warden_core::Error::invalid_scope("bad id");
        let err: Error = core.into();
        assert!(matches!(err, Error::Core(_)));
    }
}
