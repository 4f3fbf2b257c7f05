//! Attachment rows. Bytes live in the blob store under `blob_key`.

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::domain::{AccountId, Attachment, AttachmentId, EmailId};
use crate::storage::database::Result;

const SELECT_COLUMNS: &str = "SELECT id, account_id, message_id, filename, mime_type, size_bytes, is_inline, content_id, blob_key FROM attachments";

/// Inserts an attachment row. The owning message must exist.
pub fn insert(conn: &Connection, attachment: &Attachment) -> Result<()> {
    conn.execute(
        r#"
        INSERT INTO attachments (
            id, account_id, message_id, filename, mime_type, size_bytes,
            is_inline, content_id, blob_key, created_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
        "#,
        params![
            attachment.id.as_str(),
            attachment.account_id.as_str(),
            attachment.message_id.as_str(),
            attachment.filename,
            attachment.mime_type,
            attachment.size as i64,
            attachment.inline,
            attachment.content_id,
            attachment.blob_key,
            Utc::now().to_rfc3339(),
        ],
    )?;
    Ok(())
}

/// Gets one attachment by id.
pub fn get(conn: &Connection, id: &AttachmentId) -> Result<Option<Attachment>> {
    let sql = format!("{SELECT_COLUMNS} WHERE id = ?1");
    Ok(conn.query_row(&sql, [id.as_str()], row_to_attachment).optional()?)
}

/// Gets every attachment of a message, in insertion order.
pub fn for_message(
    conn: &Connection,
    account_id: &AccountId,
    message_id: &EmailId,
) -> Result<Vec<Attachment>> {
    let sql = format!("{SELECT_COLUMNS} WHERE account_id = ?1 AND message_id = ?2 ORDER BY rowid");
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(
        params![account_id.as_str(), message_id.as_str()],
        row_to_attachment,
    )?;
    Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
}

fn row_to_attachment(row: &Row<'_>) -> rusqlite::Result<Attachment> {
    Ok(Attachment {
        id: AttachmentId(row.get(0)?),
        account_id: AccountId(row.get(1)?),
        message_id: EmailId(row.get(2)?),
        filename: row.get(3)?,
        mime_type: row.get(4)?,
        size: row.get::<_, i64>(5)? as u64,
        inline: row.get(6)?,
        content_id: row.get(7)?,
        blob_key: row.get(8)?,
    })
}
