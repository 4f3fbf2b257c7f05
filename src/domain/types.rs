//! Core identifier types for domain entities.
//!
//! These newtype wrappers provide type safety for entity identifiers,
//! preventing accidental mixing of a remote message id with a remote
//! label id or a thread id.

use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(pub String);

        impl $name {
            /// Returns the identifier as a string slice.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_owned())
            }
        }
    };
}

string_id!(
    /// Unique external identifier of a connected mailbox.
    AccountId
);

string_id!(
    /// Remote message identifier, unique per account.
    EmailId
);

string_id!(
    /// Remote conversation identifier.
    ThreadId
);

string_id!(
    /// Remote label identifier (e.g. `INBOX`, `Label_12`).
    LabelId
);

string_id!(
    /// Local identifier of a stored attachment.
    AttachmentId
);

string_id!(
    /// Local identifier of an outbound draft awaiting send.
    DraftId
);

/// Opaque, monotonically increasing cursor into a mailbox's change stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct HistoryId(pub u64);

impl HistoryId {
    /// Parses the decimal string form the remote API uses on the wire.
    pub fn parse(value: &str) -> Option<Self> {
        value.trim().parse().ok().map(Self)
    }
}

impl fmt::Display for HistoryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for HistoryId {
    fn from(v: u64) -> Self {
        Self(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn account_id_display() {
        let id = AccountId("test-account".to_string());
        assert_eq!(id.to_string(), "test-account");
    }

    #[test]
    fn thread_id_equality() {
        let id1 = ThreadId::from("thread-1");
        let id2 = ThreadId::from("thread-1".to_string());
        assert_eq!(id1, id2);
    }

    #[test]
    fn email_id_hash() {
        use std::collections::HashSet;
        let mut set = HashSet::new();
        set.insert(EmailId::from("18c1f0"));
        assert!(set.contains(&EmailId::from("18c1f0")));
    }

    #[test]
    fn history_id_parses_decimal_strings() {
        assert_eq!(HistoryId::parse("123456"), Some(HistoryId(123456)));
        assert_eq!(HistoryId::parse(" 42 "), Some(HistoryId(42)));
        assert_eq!(HistoryId::parse("abc"), None);
    }

    #[test]
    fn history_id_orders_numerically() {
        assert!(HistoryId::parse("900").unwrap() < HistoryId::parse("1000").unwrap());
    }
}
