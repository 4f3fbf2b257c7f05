//! Message queries.
//!
//! A message row is stored together with its recipients, verbatim headers
//! and label links; [`insert`] writes all of them and [`get`] reads them back.

use std::collections::HashSet;

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};

use crate::domain::{AccountId, EmailId, Header, LabelId, Message, Recipient, ThreadId};
use crate::storage::database::Result;

use super::{labels, parse_timestamp};

const KIND_TO: &str = "to";
const KIND_CC: &str = "cc";
const KIND_DELIVERED_TO: &str = "delivered_to";

/// Inserts a message with its recipients, headers and label links.
///
/// Every label in `message.labels` must already exist.
pub fn insert(conn: &Connection, message: &Message) -> Result<()> {
    let now = Utc::now().to_rfc3339();
    conn.execute(
        r#"
        INSERT INTO messages (
            account_id, id, thread_id, is_read, subject, snippet,
            body_html, body_text, sent_date, sender_name, sender_email,
            has_attachment, draft_id, created_at, updated_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?14)
        "#,
        params![
            message.account_id.as_str(),
            message.id.as_str(),
            message.thread_id.as_str(),
            message.is_read,
            message.subject,
            message.snippet,
            message.body_html,
            message.body_text,
            message.sent_date.to_rfc3339(),
            message.sender.name,
            message.sender.email,
            message.has_attachment,
            message.draft_id,
            now,
        ],
    )?;

    let mut insert_recipient = conn.prepare_cached(
        "INSERT INTO message_recipients (account_id, message_id, kind, position, name, email)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
    )?;
    for (kind, list) in [
        (KIND_TO, &message.to),
        (KIND_CC, &message.cc),
        (KIND_DELIVERED_TO, &message.delivered_to),
    ] {
        for (position, recipient) in list.iter().enumerate() {
            insert_recipient.execute(params![
                message.account_id.as_str(),
                message.id.as_str(),
                kind,
                position as i64,
                recipient.name,
                recipient.email,
            ])?;
        }
    }

    let mut insert_header = conn.prepare_cached(
        "INSERT INTO message_headers (account_id, message_id, position, name, value)
         VALUES (?1, ?2, ?3, ?4, ?5)",
    )?;
    for (position, header) in message.headers.iter().enumerate() {
        insert_header.execute(params![
            message.account_id.as_str(),
            message.id.as_str(),
            position as i64,
            header.name,
            header.value,
        ])?;
    }

    for label_id in &message.labels {
        labels::link(conn, &message.account_id, &message.id, label_id)?;
    }

    Ok(())
}

/// Loads a message with its recipients, headers and labels.
pub fn get(conn: &Connection, account_id: &AccountId, id: &EmailId) -> Result<Option<Message>> {
    let row = conn
        .query_row(
            r#"
            SELECT thread_id, is_read, subject, snippet, body_html, body_text,
                   sent_date, sender_name, sender_email, has_attachment, draft_id
            FROM messages
            WHERE account_id = ?1 AND id = ?2
            "#,
            params![account_id.as_str(), id.as_str()],
            |row| {
                let sent: String = row.get(6)?;
                Ok(Message {
                    account_id: account_id.clone(),
                    id: id.clone(),
                    thread_id: ThreadId(row.get(0)?),
                    is_read: row.get(1)?,
                    subject: row.get(2)?,
                    snippet: row.get(3)?,
                    body_html: row.get(4)?,
                    body_text: row.get(5)?,
                    sent_date: parse_timestamp(6, &sent)?,
                    sender: Recipient {
                        name: row.get(7)?,
                        email: row.get(8)?,
                    },
                    to: Vec::new(),
                    cc: Vec::new(),
                    delivered_to: Vec::new(),
                    has_attachment: row.get(9)?,
                    draft_id: row.get(10)?,
                    labels: Vec::new(),
                    headers: Vec::new(),
                })
            },
        )
        .optional()?;

    let Some(mut message) = row else {
        return Ok(None);
    };

    let mut stmt = conn.prepare_cached(
        "SELECT kind, name, email FROM message_recipients
         WHERE account_id = ?1 AND message_id = ?2 ORDER BY kind, position",
    )?;
    let recipients = stmt.query_map(params![account_id.as_str(), id.as_str()], |row| {
        Ok((
            row.get::<_, String>(0)?,
            Recipient {
                name: row.get(1)?,
                email: row.get(2)?,
            },
        ))
    })?;
    for entry in recipients {
        let (kind, recipient) = entry?;
        match kind.as_str() {
            KIND_TO => message.to.push(recipient),
            KIND_CC => message.cc.push(recipient),
            KIND_DELIVERED_TO => message.delivered_to.push(recipient),
            _ => {}
        }
    }

    let mut stmt = conn.prepare_cached(
        "SELECT name, value FROM message_headers
         WHERE account_id = ?1 AND message_id = ?2 ORDER BY position",
    )?;
    let headers = stmt.query_map(params![account_id.as_str(), id.as_str()], |row| {
        Ok(Header::new(row.get::<_, String>(0)?, row.get::<_, String>(1)?))
    })?;
    message.headers = headers.collect::<std::result::Result<Vec<_>, _>>()?;

    message.labels = labels::for_message(conn, account_id, id)?;

    Ok(Some(message))
}

/// Whether a message exists locally.
pub fn exists(conn: &Connection, account_id: &AccountId, id: &EmailId) -> Result<bool> {
    let found: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM messages WHERE account_id = ?1 AND id = ?2",
            params![account_id.as_str(), id.as_str()],
            |row| row.get(0),
        )
        .optional()?;
    Ok(found.is_some())
}

/// Returns the remote ids of every stored message for the account.
pub fn ids_for_account(conn: &Connection, account_id: &AccountId) -> Result<HashSet<EmailId>> {
    let mut stmt = conn.prepare("SELECT id FROM messages WHERE account_id = ?1")?;
    let rows = stmt.query_map(params![account_id.as_str()], |row| Ok(EmailId(row.get(0)?)))?;
    Ok(rows.collect::<std::result::Result<HashSet<_>, _>>()?)
}

/// Counts stored messages for the account.
pub fn count(conn: &Connection, account_id: &AccountId) -> Result<u64> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM messages WHERE account_id = ?1",
        params![account_id.as_str()],
        |row| row.get(0),
    )?;
    Ok(count as u64)
}

/// Deletes a message and, by cascade, its children.
///
/// Returns the blob keys of the removed attachments, or `None` when no such
/// message was stored.
pub fn delete(
    conn: &Connection,
    account_id: &AccountId,
    id: &EmailId,
) -> Result<Option<Vec<String>>> {
    let mut stmt = conn.prepare(
        "SELECT blob_key FROM attachments WHERE account_id = ?1 AND message_id = ?2",
    )?;
    let keys = stmt
        .query_map(params![account_id.as_str(), id.as_str()], |row| row.get(0))?
        .collect::<std::result::Result<Vec<String>, _>>()?;

    let deleted = conn.execute(
        "DELETE FROM messages WHERE account_id = ?1 AND id = ?2",
        params![account_id.as_str(), id.as_str()],
    )?;
    Ok((deleted > 0).then_some(keys))
}

/// Sets the read flag.
pub fn set_read(conn: &Connection, account_id: &AccountId, id: &EmailId, read: bool) -> Result<()> {
    conn.execute(
        "UPDATE messages SET is_read = ?1, updated_at = ?2 WHERE account_id = ?3 AND id = ?4",
        params![read, Utc::now().to_rfc3339(), account_id.as_str(), id.as_str()],
    )?;
    Ok(())
}

/// Updates the thread id.
pub fn set_thread(
    conn: &Connection,
    account_id: &AccountId,
    id: &EmailId,
    thread_id: &ThreadId,
) -> Result<()> {
    conn.execute(
        "UPDATE messages SET thread_id = ?1, updated_at = ?2 WHERE account_id = ?3 AND id = ?4",
        params![thread_id.as_str(), Utc::now().to_rfc3339(), account_id.as_str(), id.as_str()],
    )?;
    Ok(())
}

/// Replaces the HTML body.
pub fn set_body_html(conn: &Connection, account_id: &AccountId, id: &EmailId, html: &str) -> Result<()> {
    conn.execute(
        "UPDATE messages SET body_html = ?1, updated_at = ?2 WHERE account_id = ?3 AND id = ?4",
        params![html, Utc::now().to_rfc3339(), account_id.as_str(), id.as_str()],
    )?;
    Ok(())
}

/// Finds the message mirroring a remote draft.
pub fn find_by_draft_id(
    conn: &Connection,
    account_id: &AccountId,
    draft_id: &str,
) -> Result<Option<EmailId>> {
    let id = conn
        .query_row(
            "SELECT id FROM messages WHERE account_id = ?1 AND draft_id = ?2",
            params![account_id.as_str(), draft_id],
            |row| Ok(EmailId(row.get(0)?)),
        )
        .optional()?;
    Ok(id)
}

/// Applies a remote label/thread state to a stored message.
///
/// `remote_labels` may include `UNREAD`, which maps onto the read flag instead
/// of a label link.
pub fn apply_remote_labels(
    conn: &Connection,
    account_id: &AccountId,
    id: &EmailId,
    thread_id: &ThreadId,
    remote_labels: &[LabelId],
) -> Result<()> {
    let unread = crate::domain::system_labels::unread();
    let is_read = !remote_labels.contains(&unread);
    let links: Vec<LabelId> = remote_labels
        .iter()
        .filter(|l| **l != unread)
        .cloned()
        .collect();

    set_read(conn, account_id, id, is_read)?;
    set_thread(conn, account_id, id, thread_id)?;
    labels::replace_for_message(conn, account_id, id, &links)
}
