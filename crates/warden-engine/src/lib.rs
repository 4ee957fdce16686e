//! Scoped-job orchestration engine.
//!
//! warden-engine assembles the primitives from `warden-core` into the
//! services that provision least-privilege export pipelines:
//!
//! - [`registry`]: durable identity, binding, policy, and job records
//! - [`broker`]: token issuance with caching and two-phase rotation
//! - [`binding`]: one data-access identity per scope, policies attached
//! - [`dispatch`]: least-privilege job definition, submission, polling
//! - [`controller`]: the converge loop across all configured scopes
//! - [`platform`]: ports for the external identity provider, policy
//!   engine, execution facility, and grant service, with in-memory fakes
//!
//! All external collaborators sit behind `async` traits; the engine
//! itself never talks to a network.

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod binding;
pub mod broker;
pub mod config;
pub mod controller;
pub mod dispatch;
pub mod error;
pub mod job;
pub mod metrics;
pub mod platform;
pub mod registry;
pub mod retry;

pub use binding::ScopeBindingService;
pub use broker::CredentialBroker;
pub use config::{EngineConfig, ScopeConfig};
pub use controller::{OrchestrationController, ScopePhase, ScopeReport};
pub use dispatch::JobDispatcher;
pub use error::{Error, Result};
pub use job::{JobDefinition, JobDraft, JobKey, JobSettings, JobState};
pub use registry::{AppliedPolicy, BindOutcome, CasResult, IdentityRegistry, RegistryStore};
pub use retry::RetryConfig;
