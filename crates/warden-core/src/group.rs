//! Access-control groups.
//!
//! A group lives in the external catalog and its membership is what the
//! policy engine keys row/column visibility on. The engine mirrors group
//! state so bindings can be validated without a catalog round trip, but
//! the catalog copy is authoritative.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

use crate::error::{Error, Result};
use crate::id::IdentityId;
use crate::scope::ScopeId;

/// A unique identifier (catalog name) for an access-control group.
///
/// Group IDs follow the same shape as scope IDs: lowercase alphanumeric
/// with hyphens, 3 to 63 characters.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GroupId(String);

impl GroupId {
    /// Creates a new group ID after validating the format.
    ///
    /// # Errors
    ///
    /// Returns an error if the group ID is invalid.
    pub fn new(id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        Self::validate(&id)?;
        Ok(Self(id))
    }

    /// Returns the canonical group ID for a scope.
    ///
    /// One group per scope, named deterministically, so concurrent
    /// provisioners always converge on the same group.
    #[must_use]
    pub fn for_scope(scope_id: &ScopeId) -> Self {
        Self(format!("{scope_id}-export-readers"))
    }

    /// Returns the group ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn validate(id: &str) -> Result<()> {
        if id.len() < 3 || id.len() > 63 {
            return Err(Error::invalid_id(format!(
                "group ID '{id}' must be between 3 and 63 characters"
            )));
        }

        if !id
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        {
            return Err(Error::invalid_id(format!(
                "group ID '{id}' contains invalid characters (only lowercase letters, digits, and hyphens allowed)"
            )));
        }

        if id.starts_with('-') || id.ends_with('-') {
            return Err(Error::invalid_id(format!(
                "group ID '{id}' cannot start or end with a hyphen"
            )));
        }

        Ok(())
    }
}

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for GroupId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// An access-control group and its membership.
///
/// Expected membership size is one in the current pattern, but the set
/// representation allows fan-out later without a schema change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessControlGroup {
    /// Catalog name of the group.
    pub group_id: GroupId,

    /// The scope this group governs (1:1).
    pub scope_id: ScopeId,

    /// Current members.
    pub member_identity_ids: BTreeSet<IdentityId>,
}

impl AccessControlGroup {
    /// Creates an empty group for a scope, named canonically.
    #[must_use]
    pub fn for_scope(scope_id: ScopeId) -> Self {
        Self {
            group_id: GroupId::for_scope(&scope_id),
            scope_id,
            member_identity_ids: BTreeSet::new(),
        }
    }

    /// Adds a member. Returns false if the member was already present
    /// (idempotent, not an error).
    pub fn add_member(&mut self, identity_id: IdentityId) -> bool {
        self.member_identity_ids.insert(identity_id)
    }

    /// Removes a member. Returns false if the member was absent
    /// (idempotent, not an error).
    pub fn remove_member(&mut self, identity_id: &IdentityId) -> bool {
        self.member_identity_ids.remove(identity_id)
    }

    /// Returns true if `identity_id` is a member.
    #[must_use]
    pub fn is_member(&self, identity_id: &IdentityId) -> bool {
        self.member_identity_ids.contains(identity_id)
    }

    /// Returns the number of members.
    #[must_use]
    pub fn member_count(&self) -> usize {
        self.member_identity_ids.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_group_name_per_scope() {
        let scope = ScopeId::new("us").unwrap();
        let group_id = GroupId::for_scope(&scope);
        assert_eq!(group_id.as_str(), "us-export-readers");
        assert_eq!(group_id, GroupId::for_scope(&scope));
    }

    #[test]
    fn group_id_validation() {
        assert!(GroupId::new("us-export-readers").is_ok());
        assert!(GroupId::new("ab").is_err());
        assert!(GroupId::new("Has-Upper").is_err());
        assert!(GroupId::new("-leading").is_err());
    }

    #[test]
    fn membership_is_idempotent() {
        let mut group = AccessControlGroup::for_scope(ScopeId::new("eu").unwrap());
        let member = IdentityId::generate();

        assert!(group.add_member(member));
        assert!(!group.add_member(member));
        assert_eq!(group.member_count(), 1);
        assert!(group.is_member(&member));

        assert!(group.remove_member(&member));
        assert!(!group.remove_member(&member));
        assert_eq!(group.member_count(), 0);
    }
}
