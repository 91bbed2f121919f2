//! Limit key generation and handling.

use std::fmt;

/// A key that uniquely identifies the state tracked for one caller.
///
/// The key is the configured identifier, optionally namespaced by a user id
/// so that each user gets an independent window under the same limit.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LimitKey {
    /// The identifier the limit is registered under
    pub identifier: String,
    /// Optional user namespace
    pub user: Option<String>,
}

impl LimitKey {
    /// Create a new limit key.
    pub fn new(identifier: &str, user: Option<&str>) -> Self {
        Self {
            identifier: identifier.to_string(),
            user: user.map(str::to_string),
        }
    }

    /// Key shared by every caller of an identifier.
    pub fn shared(identifier: &str) -> Self {
        Self::new(identifier, None)
    }

    /// Convert the key to the string form used in external stores and logs.
    pub fn to_string_key(&self) -> String {
        match &self.user {
            Some(user) => format!("{}:{}", self.identifier, user),
            None => self.identifier.clone(),
        }
    }
}

impl fmt::Display for LimitKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_string_key())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_with_user() {
        let key = LimitKey::new("translate", Some("u1"));
        assert_eq!(key.identifier, "translate");
        assert_eq!(key.user.as_deref(), Some("u1"));
        assert_eq!(key.to_string_key(), "translate:u1");
    }

    #[test]
    fn test_shared_key() {
        let key = LimitKey::shared("global");
        assert_eq!(key.to_string(), "global");
    }

    #[test]
    fn test_keys_with_different_users_differ() {
        assert_ne!(
            LimitKey::new("translate", Some("u1")),
            LimitKey::new("translate", Some("u2"))
        );
        assert_eq!(
            LimitKey::new("translate", Some("u1")),
            LimitKey::new("translate", Some("u1"))
        );
    }
}
