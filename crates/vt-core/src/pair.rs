//! Canonical unordered pair key for the relationship ledger.
//!
//! The ledger stores one row per pair of users. `PairKey` enforces the
//! canonical ordering so (A, B) and (B, A) always coalesce to the same row.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Canonical unordered pair of user ids.
///
/// Invariant: `user_a < user_b` lexicographically. Self-pairs are rejected.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PairKey {
    user_a: String,
    user_b: String,
}

impl PairKey {
    /// Build a canonical pair from two user ids, in either order.
    pub fn new(x: impl Into<String>, y: impl Into<String>) -> Result<Self> {
        let (x, y) = (x.into(), y.into());
        if x == y {
            return Err(Error::SelfPair(x));
        }
        if x < y {
            Ok(Self { user_a: x, user_b: y })
        } else {
            Ok(Self { user_a: y, user_b: x })
        }
    }

    pub fn user_a(&self) -> &str {
        &self.user_a
    }

    pub fn user_b(&self) -> &str {
        &self.user_b
    }

    pub fn contains(&self, user_id: &str) -> bool {
        self.user_a == user_id || self.user_b == user_id
    }

    /// The other member of the pair, if `user_id` is a member at all.
    pub fn other(&self, user_id: &str) -> Option<&str> {
        if self.user_a == user_id {
            Some(&self.user_b)
        } else if self.user_b == user_id {
            Some(&self.user_a)
        } else {
            None
        }
    }
}

impl std::fmt::Display for PairKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}+{}", self.user_a, self.user_b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_canonical_ordering() {
        let ab = PairKey::new("alice", "bob").unwrap();
        let ba = PairKey::new("bob", "alice").unwrap();
        assert_eq!(ab, ba);
        assert_eq!(ab.user_a(), "alice");
        assert_eq!(ab.user_b(), "bob");
    }

    #[test]
    fn test_self_pair_rejected() {
        let result = PairKey::new("alice", "alice");
        assert!(matches!(result, Err(Error::SelfPair(_))));
    }

    #[test]
    fn test_contains_and_other() {
        let pair = PairKey::new("u2", "u1").unwrap();
        assert!(pair.contains("u1"));
        assert!(pair.contains("u2"));
        assert!(!pair.contains("u3"));
        assert_eq!(pair.other("u1"), Some("u2"));
        assert_eq!(pair.other("u2"), Some("u1"));
        assert_eq!(pair.other("u3"), None);
    }
}
