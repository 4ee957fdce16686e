//! One-shot provisioner: converges every configured scope and prints a
//! JSON summary.
//!
//! Backed by the in-memory platform adapters, which makes it a local
//! dry-run of the full pipeline; production deployments wire real
//! adapters behind the same ports.
//!
//! Exits non-zero when any scope fails to converge.

use std::process::ExitCode;
use std::sync::Arc;

use warden_core::audit::AuditEmitter;
use warden_core::observability::init_logging;

use warden_engine::platform::memory::{
    MemoryExecutionFacility, MemoryGrantService, MemoryIdentityProvider, MemoryPolicyEngine,
};
use warden_engine::platform::{ExecutionFacility, GrantService, IdentityProvider, PolicyEngine};
use warden_engine::registry::memory::MemoryRegistry;
use warden_engine::{
    CredentialBroker, EngineConfig, IdentityRegistry, JobDispatcher, OrchestrationController,
    ScopeBindingService,
};

#[tokio::main]
async fn main() -> ExitCode {
    let config = match EngineConfig::from_env() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("configuration error: {err}");
            return ExitCode::FAILURE;
        }
    };
    init_logging(config.log_format);

    match run(&config).await {
        Ok(all_converged) => {
            if all_converged {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            }
        }
        Err(err) => {
            tracing::error!(error = %err, "provisioner failed");
            ExitCode::FAILURE
        }
    }
}

async fn run(config: &EngineConfig) -> warden_engine::Result<bool> {
    let audit = AuditEmitter::with_tracing();
    let registry = IdentityRegistry::new(Arc::new(MemoryRegistry::new()), audit.clone());

    let provider = Arc::new(MemoryIdentityProvider::new()) as Arc<dyn IdentityProvider>;
    let policy = Arc::new(MemoryPolicyEngine::new()) as Arc<dyn PolicyEngine>;
    let facility = Arc::new(MemoryExecutionFacility::new()) as Arc<dyn ExecutionFacility>;
    let grants = Arc::new(MemoryGrantService::new()) as Arc<dyn GrantService>;

    let broker = CredentialBroker::new(
        registry.clone(),
        provider,
        audit.clone(),
        config.rotation_window_secs,
    );
    let binding = ScopeBindingService::new(
        registry.clone(),
        broker.clone(),
        policy,
        audit.clone(),
        config.retry,
    );
    let dispatcher = JobDispatcher::new(
        registry.clone(),
        facility,
        Arc::clone(&grants),
        audit,
        config.retry,
        config.poll_interval,
    );
    let controller = OrchestrationController::new(
        registry,
        broker,
        binding,
        dispatcher,
        grants,
        config.poll_timeout,
    );

    tracing::info!(scopes = config.scopes.len(), "starting converge pass");
    let reports = controller.converge(&config.scopes).await?;

    let summary = serde_json::to_string_pretty(&reports)
        .map_err(|err| warden_engine::Error::store(format!("summary serialization: {err}")))?;
    println!("{summary}");

    let failed: Vec<_> = reports.iter().filter(|r| !r.is_success()).collect();
    for report in &failed {
        tracing::error!(
            scope_id = %report.scope_id,
            error = report.error.as_deref().unwrap_or("run not settled"),
            "scope did not converge"
        );
    }
    Ok(failed.is_empty())
}
