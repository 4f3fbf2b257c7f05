//! Message domain types.
//!
//! A [`Message`] is the local mirror of one remote mail item.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{AccountId, EmailId, LabelId, ThreadId};

/// A mirrored mail item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Account this message belongs to.
    pub account_id: AccountId,
    /// Remote message id, unique per account.
    pub id: EmailId,
    /// Remote conversation id.
    pub thread_id: ThreadId,
    /// Whether the message has been read.
    pub is_read: bool,
    /// Subject line.
    pub subject: String,
    /// Short preview supplied by the remote.
    pub snippet: String,
    /// Decoded HTML body, with inline `cid:` references rewritten.
    pub body_html: String,
    /// Decoded plain text body.
    pub body_text: String,
    /// Date the message was sent.
    pub sent_date: DateTime<Utc>,
    /// Sender address.
    pub sender: Recipient,
    /// Primary recipients.
    pub to: Vec<Recipient>,
    /// Carbon copy recipients.
    pub cc: Vec<Recipient>,
    /// Addresses from `Delivered-To` headers.
    pub delivered_to: Vec<Recipient>,
    /// Whether any attachment was stored for this message.
    pub has_attachment: bool,
    /// Remote draft id, when this message mirrors a draft.
    pub draft_id: Option<String>,
    /// Remote label ids applied to this message (never includes `UNREAD`).
    pub labels: Vec<LabelId>,
    /// Headers not otherwise interpreted, in their original order.
    pub headers: Vec<Header>,
}

impl Message {
    /// Returns the value of the first header with the given name.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|h| h.name.eq_ignore_ascii_case(name))
            .map(|h| h.value.as_str())
    }

    /// Whether the given remote label is applied.
    pub fn has_label(&self, label: &LabelId) -> bool {
        self.labels.contains(label)
    }
}

/// An email address with optional display name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Recipient {
    /// Display name (e.g., "John Doe").
    pub name: Option<String>,
    /// Email address.
    pub email: String,
}

impl Recipient {
    /// Creates a new recipient with just an email.
    pub fn new(email: impl Into<String>) -> Self {
        Self {
            name: None,
            email: email.into(),
        }
    }

    /// Creates a new recipient with email and display name.
    pub fn with_name(email: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            email: email.into(),
        }
    }

    /// Parses every mailbox in an address-list header value.
    ///
    /// Group syntax is flattened. Unparseable values yield an empty list.
    pub fn parse_list(value: &str) -> Vec<Recipient> {
        let Ok(list) = mailparse::addrparse(value) else {
            return Vec::new();
        };

        let mut out = Vec::new();
        for addr in list.iter() {
            match addr {
                mailparse::MailAddr::Single(info) => out.push(Self::from_single(info)),
                mailparse::MailAddr::Group(group) => {
                    out.extend(group.addrs.iter().map(Self::from_single))
                }
            }
        }
        out
    }

    fn from_single(info: &mailparse::SingleInfo) -> Self {
        Self {
            name: info
                .display_name
                .as_ref()
                .map(|n| n.trim().to_string())
                .filter(|n| !n.is_empty()),
            email: info.addr.trim().to_lowercase(),
        }
    }

    /// Returns the display representation of this address.
    ///
    /// If a name is present, returns "Name <email>", otherwise just the email.
    pub fn display(&self) -> String {
        match &self.name {
            Some(name) => format!("{} <{}>", name, self.email),
            None => self.email.clone(),
        }
    }
}

/// A raw header stored verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    /// Header name as received.
    pub name: String,
    /// Header value as received.
    pub value: String,
}

impl Header {
    /// Creates a header.
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// A remote id confirmed not to be a retrievable mail message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NoMessageMarker {
    /// Account the id belongs to.
    pub account_id: AccountId,
    /// The remote id.
    pub id: EmailId,
    /// When the marker was recorded.
    pub recorded_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recipient_display_with_name() {
        let addr = Recipient::with_name("test@example.com", "Test User");
        assert_eq!(addr.display(), "Test User <test@example.com>");
    }

    #[test]
    fn recipient_display_without_name() {
        let addr = Recipient::new("test@example.com");
        assert_eq!(addr.display(), "test@example.com");
    }

    #[test]
    fn parse_list_handles_names_and_bare_addresses() {
        let parsed = Recipient::parse_list("\"Doe, Jane\" <Jane@Example.com>, bob@example.com");
        assert_eq!(
            parsed,
            vec![
                Recipient::with_name("jane@example.com", "Doe, Jane"),
                Recipient::new("bob@example.com"),
            ]
        );
    }

    #[test]
    fn parse_list_flattens_groups() {
        let parsed = Recipient::parse_list("Team: a@example.com, b@example.com;");
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[1].email, "b@example.com");
    }

    #[test]
    fn header_lookup_is_case_insensitive() {
        let message = Message {
            account_id: AccountId::from("acc"),
            id: EmailId::from("m1"),
            thread_id: ThreadId::from("t1"),
            is_read: true,
            subject: String::new(),
            snippet: String::new(),
            body_html: String::new(),
            body_text: String::new(),
            sent_date: Utc::now(),
            sender: Recipient::new("a@example.com"),
            to: vec![],
            cc: vec![],
            delivered_to: vec![],
            has_attachment: false,
            draft_id: None,
            labels: vec![LabelId::from("INBOX")],
            headers: vec![Header::new("Message-ID", "<abc@example.com>")],
        };

        assert_eq!(message.header("message-id"), Some("<abc@example.com>"));
        assert!(message.has_label(&LabelId::from("INBOX")));
        assert!(!message.has_label(&LabelId::from("SPAM")));
    }
}
