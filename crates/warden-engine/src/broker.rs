//! Credential brokerage: token issuance with caching and two-phase
//! secret rotation.
//!
//! The broker is the only component that ever holds application secrets
//! or access tokens. Neither leaves this module except as a returned
//! [`AccessToken`]; audit records and logs carry identities and
//! credential ids only.
//!
//! Rotation is two-phase so there is never a window with no valid
//! credential: `rotate` registers a replacement secret while the old one
//! stays valid, and `confirm_rotation` invalidates the old secret only
//! after the caller has verified the new one works. An unconfirmed
//! rotation older than the configured window is treated as abandoned and
//! may be restarted from scratch.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Duration as ChronoDuration, Utc};

use warden_core::audit::{AuditAction, AuditEmitter, AuditOutcome, AuditRecord};
use warden_core::{CredentialState, Identity, IdentityId, ScopeId};

use crate::error::{Error, Result};
use crate::metrics::EngineMetrics;
use crate::platform::{AccessToken, AppCredential, IdentityProvider};
use crate::registry::IdentityRegistry;

/// Fraction of a token's lifetime after which it is refreshed early.
///
/// A token is served from cache only while more than this fraction of
/// its lifetime remains, so callers never receive a token about to
/// expire mid-use.
const REFRESH_MARGIN_PERCENT: i64 = 20;

#[derive(Debug, Clone)]
struct PendingRotation {
    credential: AppCredential,
    started_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
struct CachedToken {
    token: AccessToken,
    refresh_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
struct CredentialEntry {
    current: AppCredential,
    pending: Option<PendingRotation>,
    cached: Option<CachedToken>,
}

/// Issues short-lived tokens and manages the secret lifecycle for every
/// registered identity.
///
/// Cheap to clone; the credential table is shared.
#[derive(Clone)]
pub struct CredentialBroker {
    registry: IdentityRegistry,
    provider: Arc<dyn IdentityProvider>,
    audit: AuditEmitter,
    metrics: EngineMetrics,
    rotation_window: ChronoDuration,
    // Never held across an await.
    entries: Arc<Mutex<HashMap<IdentityId, CredentialEntry>>>,
}

impl std::fmt::Debug for CredentialBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialBroker").finish_non_exhaustive()
    }
}

fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::store("lock poisoned")
}

impl CredentialBroker {
    /// Creates a broker over the given registry and identity provider.
    #[must_use]
    pub fn new(
        registry: IdentityRegistry,
        provider: Arc<dyn IdentityProvider>,
        audit: AuditEmitter,
        rotation_window_secs: i64,
    ) -> Self {
        Self {
            registry,
            provider,
            audit,
            metrics: EngineMetrics::new(),
            rotation_window: ChronoDuration::seconds(rotation_window_secs),
            entries: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Registers the identity with the provider and stores its first
    /// credential. Idempotent: an already-registered identity is a no-op.
    ///
    /// # Errors
    ///
    /// Returns `IdentityRevoked` for revoked identities.
    pub async fn register(&self, identity_id: &IdentityId) -> Result<()> {
        let identity = self.live_identity(identity_id).await?;

        let already = {
            let entries = self.entries.lock().map_err(poison_err)?;
            entries.contains_key(identity_id)
        };
        if already {
            return Ok(());
        }

        let credential = self
            .provider
            .register_application(&identity.display_name, &identity.entitlements)
            .await?;

        {
            let mut entries = self.entries.lock().map_err(poison_err)?;
            entries.entry(*identity_id).or_insert(CredentialEntry {
                current: credential,
                pending: None,
                cached: None,
            });
        }

        tracing::debug!(
            identity_id = %identity_id,
            display_name = %identity.display_name,
            "identity registered with provider"
        );
        Ok(())
    }

    /// Issues an access token for the identity, serving from cache while
    /// the cached token has more than the refresh margin remaining.
    ///
    /// The first successful exchange moves the credential state from
    /// Pending to Active.
    ///
    /// # Errors
    ///
    /// Returns `IdentityRevoked` for revoked identities, `NotFound` when
    /// the identity was never registered with the broker, and
    /// `AuthRejected` when the provider refuses the credential.
    pub async fn issue(&self, identity_id: &IdentityId) -> Result<AccessToken> {
        let identity = self.live_identity(identity_id).await?;

        let credential = {
            let entries = self.entries.lock().map_err(poison_err)?;
            let entry = entries
                .get(identity_id)
                .ok_or_else(|| Error::not_found(format!("credential for identity {identity_id}")))?;

            if let Some(cached) = &entry.cached {
                if Utc::now() < cached.refresh_at {
                    self.metrics.record_token_issue("cache_hit");
                    return Ok(cached.token.clone());
                }
            }
            entry.current.clone()
        };

        let token = match self.provider.exchange(&credential).await {
            Ok(token) => token,
            Err(err) => {
                self.metrics.record_token_issue("rejected");
                self.emit_audit(
                    AuditRecord::builder()
                        .actor(*identity_id)
                        .action(AuditAction::TokenIssue)
                        .target(format!("identity:{identity_id}"))
                        .outcome(AuditOutcome::Failed)
                        .detail(err.to_string()),
                    identity.scope_id.clone(),
                );
                return Err(err);
            }
        };

        if identity.credential_state == CredentialState::Pending {
            self.registry
                .set_credential_state(identity_id, CredentialState::Pending, CredentialState::Active)
                .await?;
        }

        {
            let mut entries = self.entries.lock().map_err(poison_err)?;
            if let Some(entry) = entries.get_mut(identity_id) {
                entry.cached = Some(CachedToken {
                    refresh_at: refresh_deadline(&token),
                    token: token.clone(),
                });
            }
        }

        self.metrics.record_token_issue("exchanged");
        self.emit_audit(
            AuditRecord::builder()
                .actor(*identity_id)
                .action(AuditAction::TokenIssue)
                .target(format!("identity:{identity_id}"))
                .outcome(AuditOutcome::Success),
            identity.scope_id,
        );
        Ok(token)
    }

    /// Starts a two-phase rotation: registers a replacement secret while
    /// the current one stays valid.
    ///
    /// # Errors
    ///
    /// Returns `RotationInProgress` if an unconfirmed rotation is still
    /// inside the rotation window, `IdentityRevoked` for revoked
    /// identities.
    pub async fn rotate(&self, identity_id: &IdentityId) -> Result<()> {
        let identity = self.live_identity(identity_id).await?;

        let (application_id, stale_pending) = {
            let entries = self.entries.lock().map_err(poison_err)?;
            let entry = entries
                .get(identity_id)
                .ok_or_else(|| Error::not_found(format!("credential for identity {identity_id}")))?;

            if let Some(pending) = &entry.pending {
                if Utc::now() < pending.started_at + self.rotation_window {
                    return Err(Error::RotationInProgress {
                        identity_id: *identity_id,
                    });
                }
            }
            (entry.current.application_id.clone(), entry.pending.clone())
        };

        // An abandoned rotation restarts from scratch: drop its secret so
        // it can't linger as a third valid credential.
        if let Some(stale) = stale_pending {
            tracing::warn!(
                identity_id = %identity_id,
                started_at = %stale.started_at,
                "discarding lapsed unconfirmed rotation"
            );
            self.provider
                .revoke_application_secret(&stale.credential.credential_id)
                .await?;
        } else {
            self.registry
                .set_credential_state(identity_id, identity.credential_state, CredentialState::Rotating)
                .await?;
        }

        let replacement = self.provider.issue_secret(&application_id).await?;
        {
            let mut entries = self.entries.lock().map_err(poison_err)?;
            if let Some(entry) = entries.get_mut(identity_id) {
                entry.pending = Some(PendingRotation {
                    credential: replacement,
                    started_at: Utc::now(),
                });
            }
        }

        self.emit_audit(
            AuditRecord::builder()
                .actor(*identity_id)
                .action(AuditAction::CredentialRotateStart)
                .target(format!("identity:{identity_id}"))
                .outcome(AuditOutcome::Success),
            identity.scope_id,
        );
        tracing::info!(identity_id = %identity_id, "credential rotation started");
        Ok(())
    }

    /// Completes a rotation: promotes the replacement secret and
    /// invalidates the old one.
    ///
    /// # Errors
    ///
    /// Returns `InvalidStateTransition` when no rotation is pending.
    pub async fn confirm_rotation(&self, identity_id: &IdentityId) -> Result<()> {
        let identity = self.live_identity(identity_id).await?;

        let (old_credential_id, replacement) = {
            let entries = self.entries.lock().map_err(poison_err)?;
            let entry = entries
                .get(identity_id)
                .ok_or_else(|| Error::not_found(format!("credential for identity {identity_id}")))?;
            let Some(pending) = &entry.pending else {
                return Err(Error::InvalidStateTransition {
                    from: identity.credential_state.as_str().to_string(),
                    to: CredentialState::Active.as_str().to_string(),
                    reason: "no rotation pending confirmation".to_string(),
                });
            };
            (entry.current.credential_id.clone(), pending.credential.clone())
        };

        // Verify the replacement works before killing the old secret.
        self.provider.exchange(&replacement).await?;
        self.provider
            .revoke_application_secret(&old_credential_id)
            .await?;

        {
            let mut entries = self.entries.lock().map_err(poison_err)?;
            if let Some(entry) = entries.get_mut(identity_id) {
                entry.current = replacement;
                entry.pending = None;
                // Cached tokens from the old secret stay valid until they
                // expire, but refreshing through the old path would fail.
                entry.cached = None;
            }
        }

        self.registry
            .set_credential_state(identity_id, CredentialState::Rotating, CredentialState::Active)
            .await?;

        self.emit_audit(
            AuditRecord::builder()
                .actor(*identity_id)
                .action(AuditAction::CredentialRotateConfirm)
                .target(format!("identity:{identity_id}"))
                .outcome(AuditOutcome::Success),
            identity.scope_id,
        );
        tracing::info!(identity_id = %identity_id, "credential rotation confirmed");
        Ok(())
    }

    /// Revokes the identity's application and all its secrets at the
    /// provider and forgets the broker-side entry.
    ///
    /// A no-op for identities the broker never registered.
    pub async fn revoke_credentials(&self, identity_id: &IdentityId) -> Result<()> {
        let entry = {
            let mut entries = self.entries.lock().map_err(poison_err)?;
            entries.remove(identity_id)
        };
        if let Some(entry) = entry {
            self.provider
                .revoke_application(&entry.current.application_id)
                .await?;
            tracing::info!(identity_id = %identity_id, "provider credentials revoked");
        }
        Ok(())
    }

    /// Returns the identity's current credential, if registered.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn current_credential(&self, identity_id: &IdentityId) -> Result<Option<AppCredential>> {
        let result = {
            let entries = self.entries.lock().map_err(poison_err)?;
            entries.get(identity_id).map(|e| e.current.clone())
        };
        Ok(result)
    }

    /// Returns true if the identity has an unconfirmed rotation.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn has_pending_rotation(&self, identity_id: &IdentityId) -> Result<bool> {
        let result = {
            let entries = self.entries.lock().map_err(poison_err)?;
            entries.get(identity_id).is_some_and(|e| e.pending.is_some())
        };
        Ok(result)
    }

    async fn live_identity(&self, identity_id: &IdentityId) -> Result<Identity> {
        let identity = self.registry.get(identity_id).await?;
        if identity.is_revoked() {
            return Err(Error::IdentityRevoked {
                identity_id: *identity_id,
            });
        }
        Ok(identity)
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

fn refresh_deadline(token: &AccessToken) -> DateTime<Utc> {
    let lifetime = token.expires_at - Utc::now();
    let margin = lifetime * i32::try_from(REFRESH_MARGIN_PERCENT).unwrap_or(20) / 100;
    token.expires_at - margin
}

#[cfg(test)]
mod tests {
    use super::*;
    use warden_core::audit::TestAuditSink;
    use warden_core::IdentityKind;

    use crate::platform::memory::MemoryIdentityProvider;
    use crate::registry::memory::MemoryRegistry;

    struct Fixture {
        broker: CredentialBroker,
        registry: IdentityRegistry,
        provider: Arc<MemoryIdentityProvider>,
        sink: Arc<TestAuditSink>,
    }

    fn fixture_with(provider: MemoryIdentityProvider, rotation_window_secs: i64) -> Fixture {
        let sink = Arc::new(TestAuditSink::new());
        let audit = AuditEmitter::with_test_sink(Arc::clone(&sink));
        let registry = IdentityRegistry::new(Arc::new(MemoryRegistry::new()), audit.clone());
        let provider = Arc::new(provider);
        let broker = CredentialBroker::new(
            registry.clone(),
            Arc::clone(&provider) as Arc<dyn IdentityProvider>,
            audit,
            rotation_window_secs,
        );
        Fixture {
            broker,
            registry,
            provider,
            sink,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(MemoryIdentityProvider::new(), 86_400)
    }

    async fn registered_identity(f: &Fixture) -> IdentityId {
        let identity = f
            .registry
            .ensure_identity(IdentityKind::DataAccess, Some(ScopeId::new("us").unwrap()))
            .await
            .unwrap();
        f.broker.register(&identity.identity_id).await.unwrap();
        identity.identity_id
    }

    #[tokio::test]
    async fn first_issue_activates_and_caches() -> Result<()> {
        let f = fixture();
        let id = registered_identity(&f).await;

        let token = f.broker.issue(&id).await?;
        assert!(!token.is_expired());
        assert_eq!(
            f.registry.get(&id).await?.credential_state,
            CredentialState::Active
        );

        // Second issue is served from cache; no further exchange.
        let again = f.broker.issue(&id).await?;
        assert_eq!(token, again);
        assert_eq!(f.provider.exchange_count(), 1);

        let issues = f.sink.find_by_action(AuditAction::TokenIssue);
        assert_eq!(issues.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn expired_cache_triggers_a_fresh_exchange() -> Result<()> {
        // Zero-lifetime tokens are always past the refresh margin.
        let f = fixture_with(MemoryIdentityProvider::with_token_ttl_seconds(0), 86_400);
        let id = registered_identity(&f).await;

        f.broker.issue(&id).await?;
        f.broker.issue(&id).await?;
        assert_eq!(f.provider.exchange_count(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn rotation_keeps_old_secret_valid_until_confirm() -> Result<()> {
        let f = fixture();
        let id = registered_identity(&f).await;
        f.broker.issue(&id).await?;

        let old = f.broker.current_credential(&id)?.unwrap();
        f.broker.rotate(&id).await?;
        assert!(f.broker.has_pending_rotation(&id)?);
        assert_eq!(
            f.registry.get(&id).await?.credential_state,
            CredentialState::Rotating
        );

        // Both secrets exchange during the window.
        assert!(f.provider.exchange(&old).await.is_ok());
        assert_eq!(f.provider.secret_count(&old.application_id)?, 2);

        f.broker.confirm_rotation(&id).await?;
        assert!(!f.broker.has_pending_rotation(&id)?);
        assert_eq!(
            f.registry.get(&id).await?.credential_state,
            CredentialState::Active
        );

        // The old secret is dead; the promoted one works.
        assert!(f.provider.exchange(&old).await.is_err());
        let current = f.broker.current_credential(&id)?.unwrap();
        assert!(f.provider.exchange(&current).await.is_ok());
        Ok(())
    }

    #[tokio::test]
    async fn second_rotate_inside_window_is_rejected() -> Result<()> {
        let f = fixture();
        let id = registered_identity(&f).await;
        f.broker.issue(&id).await?;

        f.broker.rotate(&id).await?;
        let err = f.broker.rotate(&id).await.unwrap_err();
        assert!(matches!(err, Error::RotationInProgress { .. }));
        Ok(())
    }

    #[tokio::test]
    async fn lapsed_rotation_window_allows_restart() -> Result<()> {
        let f = fixture_with(MemoryIdentityProvider::new(), 0);
        let id = registered_identity(&f).await;
        f.broker.issue(&id).await?;

        f.broker.rotate(&id).await?;
        // Window is zero, so the unconfirmed rotation has already lapsed.
        f.broker.rotate(&id).await?;
        assert!(f.broker.has_pending_rotation(&id)?);

        // The stale replacement was discarded, not accumulated.
        let current = f.broker.current_credential(&id)?.unwrap();
        assert_eq!(f.provider.secret_count(&current.application_id)?, 2);

        f.broker.confirm_rotation(&id).await?;
        assert_eq!(
            f.registry.get(&id).await?.credential_state,
            CredentialState::Active
        );
        Ok(())
    }

    #[tokio::test]
    async fn confirm_without_rotation_is_rejected() -> Result<()> {
        let f = fixture();
        let id = registered_identity(&f).await;

        let err = f.broker.confirm_rotation(&id).await.unwrap_err();
        assert!(matches!(err, Error::InvalidStateTransition { .. }));
        Ok(())
    }

    #[tokio::test]
    async fn revoked_identity_cannot_issue() -> Result<()> {
        let f = fixture();
        let id = registered_identity(&f).await;
        f.registry.revoke(&id).await?;

        let err = f.broker.issue(&id).await.unwrap_err();
        assert!(matches!(err, Error::IdentityRevoked { .. }));
        Ok(())
    }

    #[tokio::test]
    async fn revoke_credentials_kills_all_secrets() -> Result<()> {
        let f = fixture();
        let id = registered_identity(&f).await;
        let credential = f.broker.current_credential(&id)?.unwrap();

        f.broker.revoke_credentials(&id).await?;
        assert!(f.provider.exchange(&credential).await.is_err());
        assert!(f.broker.current_credential(&id)?.is_none());

        // Idempotent for unknown identities.
        f.broker.revoke_credentials(&IdentityId::generate()).await?;
        Ok(())
    }

    #[tokio::test]
    async fn register_is_idempotent() -> Result<()> {
        let f = fixture();
        let id = registered_identity(&f).await;
        let first = f.broker.current_credential(&id)?.unwrap();

        f.broker.register(&id).await?;
        let second = f.broker.current_credential(&id)?.unwrap();
        assert_eq!(first, second);
        Ok(())
    }
}
