//! Label domain types.
//!
//! Represents remote mailbox labels mirrored locally, with a cached unread
//! counter.

use serde::{Deserialize, Serialize};

use super::{AccountId, LabelId};

/// A mirrored remote label.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Label {
    /// Account this label belongs to.
    pub account_id: AccountId,
    /// Remote label id, unique per account.
    pub id: LabelId,
    /// Display name.
    pub name: String,
    /// Whether the remote defines this label or the user created it.
    pub kind: LabelKind,
    /// Cached count of unread messages carrying this label.
    pub unread: u32,
}

/// Origin of a label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LabelKind {
    /// Defined by the mailbox provider (INBOX, SPAM, ...).
    System,
    /// Created by the user.
    User,
}

impl LabelKind {
    /// Parses the remote `type` field. Anything but `system` is a user label.
    pub fn from_remote(value: Option<&str>) -> Self {
        match value {
            Some(v) if v.eq_ignore_ascii_case("system") => LabelKind::System,
            _ => LabelKind::User,
        }
    }

    /// Storage representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            LabelKind::System => "system",
            LabelKind::User => "user",
        }
    }
}

/// Well-known system label IDs.
pub mod system_labels {
    use super::LabelId;

    /// Returns the inbox label ID.
    pub fn inbox() -> LabelId {
        LabelId::from("INBOX")
    }

    /// Returns the sent label ID.
    pub fn sent() -> LabelId {
        LabelId::from("SENT")
    }

    /// Returns the draft label ID.
    pub fn draft() -> LabelId {
        LabelId::from("DRAFT")
    }

    /// Returns the trash label ID.
    pub fn trash() -> LabelId {
        LabelId::from("TRASH")
    }

    /// Returns the spam label ID.
    pub fn spam() -> LabelId {
        LabelId::from("SPAM")
    }

    /// Returns the starred label ID.
    pub fn starred() -> LabelId {
        LabelId::from("STARRED")
    }

    /// Returns the unread label ID.
    ///
    /// Locally this is the inverse of the message read flag, never a row.
    pub fn unread() -> LabelId {
        LabelId::from("UNREAD")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn label_serialization() {
        let label = Label {
            account_id: AccountId::from("account-1"),
            id: LabelId::from("Label_123"),
            name: "Work".to_string(),
            kind: LabelKind::User,
            unread: 3,
        };

        let json = serde_json::to_string(&label).unwrap();
        assert!(json.contains("\"kind\":\"user\""));
        let deserialized: Label = serde_json::from_str(&json).unwrap();
        assert_eq!(deserialized, label);
    }

    #[test]
    fn kind_from_remote() {
        assert_eq!(LabelKind::from_remote(Some("system")), LabelKind::System);
        assert_eq!(LabelKind::from_remote(Some("user")), LabelKind::User);
        assert_eq!(LabelKind::from_remote(None), LabelKind::User);
    }

    #[test]
    fn system_label_ids() {
        assert_eq!(system_labels::inbox().0, "INBOX");
        assert_eq!(system_labels::sent().0, "SENT");
        assert_eq!(system_labels::draft().0, "DRAFT");
        assert_eq!(system_labels::trash().0, "TRASH");
        assert_eq!(system_labels::spam().0, "SPAM");
        assert_eq!(system_labels::starred().0, "STARRED");
        assert_eq!(system_labels::unread().0, "UNREAD");
    }
}
