//! No-message markers: remote ids known not to be retrievable mail.

use std::collections::HashSet;

use chrono::Utc;
use rusqlite::{params, Connection};

use crate::domain::{AccountId, EmailId};
use crate::storage::database::Result;

/// Records a marker. Recording the same id twice is a no-op.
pub fn record(conn: &Connection, account_id: &AccountId, id: &EmailId) -> Result<()> {
    conn.execute(
        "INSERT OR IGNORE INTO no_messages (account_id, id, recorded_at) VALUES (?1, ?2, ?3)",
        params![account_id.as_str(), id.as_str(), Utc::now().to_rfc3339()],
    )?;
    Ok(())
}

/// Returns every marked id for the account.
pub fn ids_for_account(conn: &Connection, account_id: &AccountId) -> Result<HashSet<EmailId>> {
    let mut stmt = conn.prepare("SELECT id FROM no_messages WHERE account_id = ?1")?;
    let rows = stmt.query_map(params![account_id.as_str()], |row| Ok(EmailId(row.get(0)?)))?;
    Ok(rows.collect::<std::result::Result<HashSet<_>, _>>()?)
}

/// Whether the id is marked.
pub fn contains(conn: &Connection, account_id: &AccountId, id: &EmailId) -> Result<bool> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM no_messages WHERE account_id = ?1 AND id = ?2",
        params![account_id.as_str(), id.as_str()],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

/// Removes every marker for the account.
pub fn clear(conn: &Connection, account_id: &AccountId) -> Result<usize> {
    Ok(conn.execute(
        "DELETE FROM no_messages WHERE account_id = ?1",
        params![account_id.as_str()],
    )?)
}
