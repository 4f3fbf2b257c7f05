//! Label queries and message/label associations.

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::domain::{AccountId, EmailId, Label, LabelId, LabelKind};
use crate::storage::database::Result;

/// Inserts a new label. Fails with a unique violation if it already exists.
pub fn insert(conn: &Connection, label: &Label) -> Result<()> {
    conn.execute(
        "INSERT INTO labels (account_id, id, name, kind, unread, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            label.account_id.as_str(),
            label.id.as_str(),
            label.name,
            label.kind.as_str(),
            label.unread,
            Utc::now().to_rfc3339(),
        ],
    )?;
    Ok(())
}

/// Gets a label by remote id.
pub fn get(conn: &Connection, account_id: &AccountId, id: &LabelId) -> Result<Option<Label>> {
    let label = conn
        .query_row(
            "SELECT account_id, id, name, kind, unread
             FROM labels WHERE account_id = ?1 AND id = ?2",
            params![account_id.as_str(), id.as_str()],
            row_to_label,
        )
        .optional()?;
    Ok(label)
}

/// Gets all labels for an account.
pub fn get_by_account(conn: &Connection, account_id: &AccountId) -> Result<Vec<Label>> {
    let mut stmt = conn.prepare(
        "SELECT account_id, id, name, kind, unread
         FROM labels WHERE account_id = ?1 ORDER BY name",
    )?;
    let rows = stmt.query_map(params![account_id.as_str()], row_to_label)?;
    Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
}

/// Updates a label's display name and kind.
pub fn set_name(
    conn: &Connection,
    account_id: &AccountId,
    id: &LabelId,
    name: &str,
    kind: LabelKind,
) -> Result<()> {
    conn.execute(
        "UPDATE labels SET name = ?1, kind = ?2 WHERE account_id = ?3 AND id = ?4",
        params![name, kind.as_str(), account_id.as_str(), id.as_str()],
    )?;
    Ok(())
}

/// Recomputes every label's unread counter for the account from the
/// message/label associations. Returns the number of labels updated.
pub fn recompute_unread(conn: &Connection, account_id: &AccountId) -> Result<usize> {
    let updated = conn.execute(
        r#"
        UPDATE labels SET unread = (
            SELECT COUNT(*)
            FROM message_labels ml
            JOIN messages m ON m.account_id = ml.account_id AND m.id = ml.message_id
            WHERE ml.account_id = labels.account_id
              AND ml.label_id = labels.id
              AND m.is_read = 0
        )
        WHERE account_id = ?1
        "#,
        params![account_id.as_str()],
    )?;
    Ok(updated)
}

/// Returns the label ids linked to a message, sorted.
pub fn for_message(
    conn: &Connection,
    account_id: &AccountId,
    message_id: &EmailId,
) -> Result<Vec<LabelId>> {
    let mut stmt = conn.prepare(
        "SELECT label_id FROM message_labels
         WHERE account_id = ?1 AND message_id = ?2 ORDER BY label_id",
    )?;
    let rows = stmt.query_map(params![account_id.as_str(), message_id.as_str()], |row| {
        Ok(LabelId(row.get(0)?))
    })?;
    Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
}

/// Links a label to a message. Existing links are left alone.
pub fn link(
    conn: &Connection,
    account_id: &AccountId,
    message_id: &EmailId,
    label_id: &LabelId,
) -> Result<()> {
    conn.execute(
        "INSERT OR IGNORE INTO message_labels (account_id, message_id, label_id)
         VALUES (?1, ?2, ?3)",
        params![account_id.as_str(), message_id.as_str(), label_id.as_str()],
    )?;
    Ok(())
}

/// Removes a label from a message.
pub fn unlink(
    conn: &Connection,
    account_id: &AccountId,
    message_id: &EmailId,
    label_id: &LabelId,
) -> Result<()> {
    conn.execute(
        "DELETE FROM message_labels
         WHERE account_id = ?1 AND message_id = ?2 AND label_id = ?3",
        params![account_id.as_str(), message_id.as_str(), label_id.as_str()],
    )?;
    Ok(())
}

/// Replaces all label links of a message.
pub fn replace_for_message(
    conn: &Connection,
    account_id: &AccountId,
    message_id: &EmailId,
    label_ids: &[LabelId],
) -> Result<()> {
    conn.execute(
        "DELETE FROM message_labels WHERE account_id = ?1 AND message_id = ?2",
        params![account_id.as_str(), message_id.as_str()],
    )?;
    for label_id in label_ids {
        link(conn, account_id, message_id, label_id)?;
    }
    Ok(())
}

fn row_to_label(row: &Row<'_>) -> rusqlite::Result<Label> {
    let kind: String = row.get(3)?;
    Ok(Label {
        account_id: AccountId(row.get(0)?),
        id: LabelId(row.get(1)?),
        name: row.get(2)?,
        kind: LabelKind::from_remote(Some(&kind)),
        unread: row.get(4)?,
    })
}
