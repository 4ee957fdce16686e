//! Shared test harness: the full engine wired to in-memory adapters.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use warden_core::audit::{AuditEmitter, TestAuditSink};
use warden_core::{AssetRef, PolicyRef, ScopeId};

use warden_engine::platform::memory::{
    MemoryExecutionFacility, MemoryGrantService, MemoryIdentityProvider, MemoryPolicyEngine,
};
use warden_engine::platform::{ExecutionFacility, GrantService, IdentityProvider, PolicyEngine};
use warden_engine::registry::memory::MemoryRegistry;
use warden_engine::{
    CredentialBroker, IdentityRegistry, JobDispatcher, OrchestrationController, RetryConfig,
    ScopeBindingService, ScopeConfig,
};

pub struct TestHarness {
    pub registry: IdentityRegistry,
    pub broker: CredentialBroker,
    pub binding: ScopeBindingService,
    pub dispatcher: JobDispatcher,
    pub controller: OrchestrationController,
    pub provider: Arc<MemoryIdentityProvider>,
    pub policy: Arc<MemoryPolicyEngine>,
    pub facility: Arc<MemoryExecutionFacility>,
    pub grants: Arc<MemoryGrantService>,
    pub sink: Arc<TestAuditSink>,
}

impl TestHarness {
    pub fn new() -> Self {
        Self::build(MemoryIdentityProvider::new(), 86_400)
    }

    pub fn with_provider(provider: MemoryIdentityProvider) -> Self {
        Self::build(provider, 86_400)
    }

    pub fn with_rotation_window(rotation_window_secs: i64) -> Self {
        Self::build(MemoryIdentityProvider::new(), rotation_window_secs)
    }

    fn build(provider: MemoryIdentityProvider, rotation_window_secs: i64) -> Self {
        let sink = Arc::new(TestAuditSink::new());
        let audit = AuditEmitter::with_test_sink(Arc::clone(&sink));
        let registry = IdentityRegistry::new(Arc::new(MemoryRegistry::new()), audit.clone());

        let provider = Arc::new(provider);
        let policy = Arc::new(MemoryPolicyEngine::new());
        let facility = Arc::new(MemoryExecutionFacility::new());
        let grants = Arc::new(MemoryGrantService::new());

        let broker = CredentialBroker::new(
            registry.clone(),
            Arc::clone(&provider) as Arc<dyn IdentityProvider>,
            audit.clone(),
            rotation_window_secs,
        );
        let binding = ScopeBindingService::new(
            registry.clone(),
            broker.clone(),
            Arc::clone(&policy) as Arc<dyn PolicyEngine>,
            audit.clone(),
            fast_retry(),
        );
        let dispatcher = JobDispatcher::new(
            registry.clone(),
            Arc::clone(&facility) as Arc<dyn ExecutionFacility>,
            Arc::clone(&grants) as Arc<dyn GrantService>,
            audit,
            fast_retry(),
            Duration::from_millis(1),
        );
        let controller = OrchestrationController::new(
            registry.clone(),
            broker.clone(),
            binding.clone(),
            dispatcher.clone(),
            Arc::clone(&grants) as Arc<dyn GrantService>,
            Duration::from_secs(2),
        );

        Self {
            registry,
            broker,
            binding,
            dispatcher,
            controller,
            provider,
            policy,
            facility,
            grants,
            sink,
        }
    }
}

pub fn fast_retry() -> RetryConfig {
    RetryConfig {
        base_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(4),
        max_attempts: 3,
    }
}

pub fn scope_config(id: &str) -> ScopeConfig {
    ScopeConfig {
        scope_id: ScopeId::new(id).unwrap(),
        display_name: format!("{id} exports"),
        masking_policy_ref: PolicyRef::new("masks/pii-standard"),
        row_filter_ref: PolicyRef::new(format!("filters/region-{id}")),
        asset_ref: AssetRef::new("/exports/regional_export"),
        parameters: std::collections::BTreeMap::new(),
    }
}
