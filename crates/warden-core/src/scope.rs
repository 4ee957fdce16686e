//! Scope primitives: the isolation boundary everything else hangs off.
//!
//! A scope (a region, a business unit) governs one slice of exported data.
//! Isolation is enforced in three places:
//! - **Identity**: each scope is bound to exactly one data-access identity
//! - **Policy**: row filters and column masks keyed by the scope
//! - **Jobs**: every job runs as its scope's bound identity
//!
//! # Example
//!
//! ```rust
//! use warden_core::scope::{PolicyRef, Scope, ScopeId};
//!
//! let scope = Scope::new(
//!     ScopeId::new("eu").unwrap(),
//!     "EU exports",
//!     PolicyRef::new("masks/pii-standard"),
//!     PolicyRef::new("filters/region-eu"),
//! );
//! assert_eq!(scope.scope_id.as_str(), "eu");
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{Error, Result};

/// A unique identifier for a scope.
///
/// Scope IDs must be:
/// - Non-empty
/// - Lowercase alphanumeric with hyphens
/// - Between 2 and 32 characters (region codes like `us` and `eu` are valid)
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ScopeId(String);

impl ScopeId {
    /// Creates a new scope ID after validating the format.
    ///
    /// # Errors
    ///
    /// Returns an error if the scope ID is invalid.
    pub fn new(id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        Self::validate(&id)?;
        Ok(Self(id))
    }

    /// Creates a scope ID without validation.
    ///
    /// The caller must ensure the ID is valid. Intended for IDs that have
    /// already been validated (e.g., read back from the registry store).
    #[must_use]
    pub fn new_unchecked(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the scope ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Validates a scope ID string.
    fn validate(id: &str) -> Result<()> {
        if id.is_empty() {
            return Err(Error::invalid_scope("scope ID cannot be empty"));
        }

        if id.len() < 2 {
            return Err(Error::invalid_scope(format!(
                "scope ID '{id}' is too short (minimum 2 characters)"
            )));
        }

        if id.len() > 32 {
            return Err(Error::invalid_scope(format!(
                "scope ID '{id}' is too long (maximum 32 characters)"
            )));
        }

        if !id
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        {
            return Err(Error::invalid_scope(format!(
                "scope ID '{id}' contains invalid characters (only lowercase letters, digits, and hyphens allowed)"
            )));
        }

        if id.starts_with('-') || id.ends_with('-') {
            return Err(Error::invalid_scope(format!(
                "scope ID '{id}' cannot start or end with a hyphen"
            )));
        }

        Ok(())
    }
}

impl fmt::Display for ScopeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for ScopeId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// A reference to a masking or row-filter policy in the external catalog.
///
/// Opaque to the engine; the policy engine interprets it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PolicyRef(String);

impl PolicyRef {
    /// Wraps a policy reference string.
    #[must_use]
    pub fn new(reference: impl Into<String>) -> Self {
        Self(reference.into())
    }

    /// Returns the reference as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PolicyRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A reference to an executable asset (e.g., a notebook path).
///
/// Opaque to the engine; the execution facility resolves it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AssetRef(String);

impl AssetRef {
    /// Wraps an asset reference string.
    #[must_use]
    pub fn new(reference: impl Into<String>) -> Self {
        Self(reference.into())
    }

    /// Returns the reference as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AssetRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A named isolation boundary.
///
/// Exactly one data-access identity is bound to a scope at any time;
/// the binding is maintained by the scope binding service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Scope {
    /// Unique, immutable scope identifier.
    pub scope_id: ScopeId,

    /// Human-readable name for reports and audit targets.
    pub display_name: String,

    /// Column-masking policy applied to the scope's data resources.
    pub masking_policy_ref: PolicyRef,

    /// Row-filter policy applied to the scope's data resources.
    pub row_filter_ref: PolicyRef,
}

impl Scope {
    /// Creates a new scope.
    #[must_use]
    pub fn new(
        scope_id: ScopeId,
        display_name: impl Into<String>,
        masking_policy_ref: PolicyRef,
        row_filter_ref: PolicyRef,
    ) -> Self {
        Self {
            scope_id,
            display_name: display_name.into(),
            masking_policy_ref,
            row_filter_ref,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_scope_ids() {
        assert!(ScopeId::new("us").is_ok());
        assert!(ScopeId::new("eu").is_ok());
        assert!(ScopeId::new("apac-south").is_ok());
        assert!(ScopeId::new("region7").is_ok());
    }

    #[test]
    fn invalid_scope_ids() {
        assert!(ScopeId::new("").is_err());
        assert!(ScopeId::new("x").is_err());
        assert!(ScopeId::new("UPPERCASE").is_err());
        assert!(ScopeId::new("-leading").is_err());
        assert!(ScopeId::new("trailing-").is_err());
        assert!(ScopeId::new("has spaces").is_err());
        assert!(ScopeId::new("has_underscore").is_err());
        assert!(ScopeId::new("a-very-long-scope-identifier-that-exceeds").is_err());
    }

    #[test]
    fn scope_serializes_with_camel_case_fields() {
        let scope = Scope::new(
            ScopeId::new("us").unwrap(),
            "US exports",
            PolicyRef::new("masks/pii"),
            PolicyRef::new("filters/us"),
        );
        let json = serde_json::to_value(&scope).unwrap();
        assert_eq!(json["scopeId"], "us");
        assert_eq!(json["maskingPolicyRef"], "masks/pii");
        assert_eq!(json["rowFilterRef"], "filters/us");
    }
}
