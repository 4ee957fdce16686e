//! # warden-core
//!
//! Core abstractions for the Warden scoped-job orchestration engine.
//!
//! This crate provides the foundational types used across all Warden components:
//!
//! - **Scopes**: Named isolation boundaries governing data visibility
//! - **Identities**: Non-human principals (orchestrator and data-access kinds)
//! - **Groups**: Access-control group membership mirrored from the catalog
//! - **Identifiers**: Strongly-typed IDs for identities, jobs, and runs
//! - **Audit**: Append-only, versioned audit records and sinks
//! - **Error Types**: Shared error definitions and result types
//!
//! ## Crate Boundary
//!
//! `warden-core` is the **only** crate allowed to define shared primitives.
//! The engine crate (`warden-engine`) layers services, collaborator ports,
//! and the orchestration controller on top of them.
//!
//! ## Example
//!
//! ```rust
//! use warden_core::prelude::*;
//!
//! let scope = ScopeId::new("eu").unwrap();
//! let identity = Identity::new_data_access(scope);
//! assert_eq!(identity.credential_state, CredentialState::Pending);
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod audit;
pub mod error;
pub mod group;
pub mod id;
pub mod identity;
pub mod observability;
pub mod scope;

/// Prelude module for convenient imports.
///
/// # Example
///
/// ```rust
/// use warden_core::prelude::*;
/// ```
pub mod prelude {
    pub use crate::audit::{AuditAction, AuditEmitter, AuditOutcome, AuditRecord, AuditSink};
    pub use crate::error::{Error, Result};
    pub use crate::group::{AccessControlGroup, GroupId};
    pub use crate::id::{IdentityId, JobId, RunHandle};
    pub use crate::identity::{CredentialState, Entitlement, Identity, IdentityKind};
    pub use crate::scope::{AssetRef, PolicyRef, Scope, ScopeId};
}

// Re-export key types at crate root for ergonomics
pub use audit::{AuditAction, AuditEmitter, AuditOutcome, AuditRecord, AuditSink, TestAuditSink};
pub use error::{Error, Result};
pub use group::{AccessControlGroup, GroupId};
pub use id::{IdentityId, JobId, RunHandle};
pub use identity::{CredentialState, Entitlement, Identity, IdentityKind};
pub use observability::{LogFormat, init_logging};
pub use scope::{AssetRef, PolicyRef, Scope, ScopeId};
