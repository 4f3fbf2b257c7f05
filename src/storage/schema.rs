//! SQL schema definitions as const strings.
//!
//! Every remote-keyed table uses `(account_id, id)` as its primary key so the
//! same remote id in two mailboxes never collides.

/// SQL to create the accounts table.
pub const CREATE_ACCOUNTS: &str = r#"
CREATE TABLE IF NOT EXISTS accounts (
    id TEXT PRIMARY KEY,
    email TEXT NOT NULL,
    authorized INTEGER NOT NULL DEFAULT 1,
    history_id INTEGER,
    is_syncing INTEGER NOT NULL DEFAULT 0,
    first_sync_finished_at TEXT,
    deleted INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    updated_at TEXT
)
"#;

/// SQL to create the messages table.
pub const CREATE_MESSAGES: &str = r#"
CREATE TABLE IF NOT EXISTS messages (
    account_id TEXT NOT NULL REFERENCES accounts(id),
    id TEXT NOT NULL,
    thread_id TEXT NOT NULL,
    is_read INTEGER NOT NULL DEFAULT 0,
    subject TEXT NOT NULL DEFAULT '',
    snippet TEXT NOT NULL DEFAULT '',
    body_html TEXT NOT NULL DEFAULT '',
    body_text TEXT NOT NULL DEFAULT '',
    sent_date TEXT NOT NULL,
    sender_name TEXT,
    sender_email TEXT NOT NULL,
    has_attachment INTEGER NOT NULL DEFAULT 0,
    draft_id TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    PRIMARY KEY (account_id, id)
)
"#;

/// SQL to create message indexes.
pub const CREATE_MESSAGE_INDEXES: &str = r#"
CREATE INDEX IF NOT EXISTS idx_messages_thread ON messages(account_id, thread_id);
CREATE INDEX IF NOT EXISTS idx_messages_draft ON messages(account_id, draft_id);
CREATE INDEX IF NOT EXISTS idx_messages_date ON messages(sent_date DESC)
"#;

/// SQL to create the recipients table (to, cc, delivered-to).
pub const CREATE_MESSAGE_RECIPIENTS: &str = r#"
CREATE TABLE IF NOT EXISTS message_recipients (
    account_id TEXT NOT NULL,
    message_id TEXT NOT NULL,
    kind TEXT NOT NULL,
    position INTEGER NOT NULL,
    name TEXT,
    email TEXT NOT NULL,
    PRIMARY KEY (account_id, message_id, kind, position),
    FOREIGN KEY (account_id, message_id)
        REFERENCES messages(account_id, id) ON DELETE CASCADE
)
"#;

/// SQL to create the verbatim headers table.
pub const CREATE_MESSAGE_HEADERS: &str = r#"
CREATE TABLE IF NOT EXISTS message_headers (
    account_id TEXT NOT NULL,
    message_id TEXT NOT NULL,
    position INTEGER NOT NULL,
    name TEXT NOT NULL,
    value TEXT NOT NULL,
    PRIMARY KEY (account_id, message_id, position),
    FOREIGN KEY (account_id, message_id)
        REFERENCES messages(account_id, id) ON DELETE CASCADE
)
"#;

/// SQL to create the labels table.
pub const CREATE_LABELS: &str = r#"
CREATE TABLE IF NOT EXISTS labels (
    account_id TEXT NOT NULL REFERENCES accounts(id),
    id TEXT NOT NULL,
    name TEXT NOT NULL,
    kind TEXT NOT NULL DEFAULT 'user',
    unread INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    PRIMARY KEY (account_id, id)
)
"#;

/// SQL to create the message/label join table.
pub const CREATE_MESSAGE_LABELS: &str = r#"
CREATE TABLE IF NOT EXISTS message_labels (
    account_id TEXT NOT NULL,
    message_id TEXT NOT NULL,
    label_id TEXT NOT NULL,
    PRIMARY KEY (account_id, message_id, label_id),
    FOREIGN KEY (account_id, message_id)
        REFERENCES messages(account_id, id) ON DELETE CASCADE,
    FOREIGN KEY (account_id, label_id)
        REFERENCES labels(account_id, id) ON DELETE CASCADE
)
"#;

/// SQL to create message label indexes.
pub const CREATE_MESSAGE_LABEL_INDEXES: &str = r#"
CREATE INDEX IF NOT EXISTS idx_message_labels_label ON message_labels(account_id, label_id)
"#;

/// SQL to create the attachments table.
pub const CREATE_ATTACHMENTS: &str = r#"
CREATE TABLE IF NOT EXISTS attachments (
    id TEXT PRIMARY KEY,
    account_id TEXT NOT NULL,
    message_id TEXT NOT NULL,
    filename TEXT NOT NULL,
    mime_type TEXT NOT NULL,
    size_bytes INTEGER NOT NULL,
    is_inline INTEGER NOT NULL DEFAULT 0,
    content_id TEXT,
    blob_key TEXT NOT NULL,
    created_at TEXT NOT NULL,
    FOREIGN KEY (account_id, message_id)
        REFERENCES messages(account_id, id) ON DELETE CASCADE
)
"#;

/// SQL to create attachment indexes.
pub const CREATE_ATTACHMENT_INDEXES: &str = r#"
CREATE INDEX IF NOT EXISTS idx_attachments_message ON attachments(account_id, message_id)
"#;

/// SQL to create the no-message marker table.
pub const CREATE_NO_MESSAGES: &str = r#"
CREATE TABLE IF NOT EXISTS no_messages (
    account_id TEXT NOT NULL REFERENCES accounts(id),
    id TEXT NOT NULL,
    recorded_at TEXT NOT NULL,
    PRIMARY KEY (account_id, id)
)
"#;

/// SQL to create the outbound drafts table.
pub const CREATE_OUTBOUND_DRAFTS: &str = r#"
CREATE TABLE IF NOT EXISTS outbound_drafts (
    id TEXT PRIMARY KEY,
    account_id TEXT NOT NULL REFERENCES accounts(id),
    kind TEXT NOT NULL,
    original_message_id TEXT,
    remote_draft_id TEXT,
    to_json TEXT NOT NULL DEFAULT '[]',
    cc_json TEXT NOT NULL DEFAULT '[]',
    bcc_json TEXT NOT NULL DEFAULT '[]',
    subject TEXT NOT NULL DEFAULT '',
    body_html TEXT NOT NULL DEFAULT '',
    body_text TEXT NOT NULL DEFAULT '',
    template_attachments_json TEXT NOT NULL DEFAULT '[]',
    original_attachment_ids_json TEXT NOT NULL DEFAULT '[]',
    created_at TEXT NOT NULL
)
"#;

/// Returns all migration statements in order.
pub fn all_migrations() -> Vec<&'static str> {
    vec![
        CREATE_ACCOUNTS,
        CREATE_MESSAGES,
        CREATE_MESSAGE_INDEXES,
        CREATE_MESSAGE_RECIPIENTS,
        CREATE_MESSAGE_HEADERS,
        CREATE_LABELS,
        CREATE_MESSAGE_LABELS,
        CREATE_MESSAGE_LABEL_INDEXES,
        CREATE_ATTACHMENTS,
        CREATE_ATTACHMENT_INDEXES,
        CREATE_NO_MESSAGES,
        CREATE_OUTBOUND_DRAFTS,
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_migrations_returns_statements() {
        let migrations = all_migrations();
        assert_eq!(migrations.len(), 12);
        assert!(migrations.iter().all(|m| !m.trim().is_empty()));
    }

    #[test]
    fn remote_keyed_tables_use_composite_keys() {
        for sql in [CREATE_MESSAGES, CREATE_LABELS, CREATE_NO_MESSAGES] {
            assert!(sql.contains("PRIMARY KEY (account_id, id)"));
        }
    }

    #[test]
    fn children_cascade_with_messages() {
        for sql in [
            CREATE_MESSAGE_RECIPIENTS,
            CREATE_MESSAGE_HEADERS,
            CREATE_MESSAGE_LABELS,
            CREATE_ATTACHMENTS,
        ] {
            assert!(sql.contains("ON DELETE CASCADE"));
        }
    }

    #[test]
    fn statements_are_idempotent() {
        for sql in all_migrations() {
            assert!(sql.contains("IF NOT EXISTS"));
        }
    }
}
