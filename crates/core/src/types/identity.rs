//! Identity keys that may label a customer's records.

use serde::{Deserialize, Serialize};

use super::email::Email;
use super::id::UserId;

/// The set of identity keys resolved from an authenticated session.
///
/// `primary` is the stable account id. `secondary` is the contact email, which
/// can change over time and is the only key present on records created before
/// the account was linked.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IdentityKeys {
    pub primary: UserId,
    pub secondary: Option<Email>,
}

impl IdentityKeys {
    /// Create identity keys from a primary id and an optional email.
    #[must_use]
    pub const fn new(primary: UserId, secondary: Option<Email>) -> Self {
        Self { primary, secondary }
    }

    /// Whether either key matches the given owner fields of a record.
    #[must_use]
    pub fn owns(&self, user_id: Option<&UserId>, email: Option<&Email>) -> bool {
        user_id.is_some_and(|id| *id == self.primary)
            || matches!((&self.secondary, email), (Some(mine), Some(theirs)) if mine == theirs)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn keys() -> IdentityKeys {
        IdentityKeys::new(
            UserId::new("uid-1"),
            Some(Email::parse("ana@example.com").unwrap()),
        )
    }

    #[test]
    fn test_owns_by_primary() {
        assert!(keys().owns(Some(&UserId::new("uid-1")), None));
        assert!(!keys().owns(Some(&UserId::new("uid-2")), None));
    }

    #[test]
    fn test_owns_by_secondary() {
        let email = Email::parse("ana@example.com").unwrap();
        assert!(keys().owns(None, Some(&email)));
        assert!(keys().owns(Some(&UserId::new("uid-2")), Some(&email)));
    }

    #[test]
    fn test_without_secondary_only_primary_matches() {
        let keys = IdentityKeys::new(UserId::new("uid-1"), None);
        let email = Email::parse("ana@example.com").unwrap();
        assert!(!keys.owns(None, Some(&email)));
    }
}
