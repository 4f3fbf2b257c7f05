//! Outbound draft persistence.

use rusqlite::{params, OptionalExtension, Row};

use crate::domain::{AccountId, DraftId, DraftKind, EmailId, OutboundDraft};
use crate::storage::database::{Database, DatabaseError, Result};

use super::{parse_json, parse_timestamp};

/// Inserts a draft.
pub async fn insert(db: &Database, draft: &OutboundDraft) -> Result<()> {
    let draft = draft.clone();
    let to = to_json(&draft.to)?;
    let cc = to_json(&draft.cc)?;
    let bcc = to_json(&draft.bcc)?;
    let templates = to_json(&draft.template_attachments)?;
    let originals = to_json(&draft.original_attachment_ids)?;

    db.with_conn(move |conn| {
        conn.execute(
            r#"
            INSERT INTO outbound_drafts (
                id, account_id, kind, original_message_id, remote_draft_id,
                to_json, cc_json, bcc_json, subject, body_html, body_text,
                template_attachments_json, original_attachment_ids_json, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
            "#,
            params![
                draft.id.as_str(),
                draft.account_id.as_str(),
                draft.kind.as_str(),
                draft.original_message_id.as_ref().map(|id| id.as_str()),
                draft.remote_draft_id,
                to,
                cc,
                bcc,
                draft.subject,
                draft.body_html,
                draft.body_text,
                templates,
                originals,
                draft.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    })
    .await
}

/// Gets a draft by id.
pub async fn get(db: &Database, id: &DraftId) -> Result<Option<OutboundDraft>> {
    let id = id.clone();

    db.with_conn(move |conn| {
        let draft = conn
            .query_row(
                r#"
                SELECT id, account_id, kind, original_message_id, remote_draft_id,
                       to_json, cc_json, bcc_json, subject, body_html, body_text,
                       template_attachments_json, original_attachment_ids_json, created_at
                FROM outbound_drafts WHERE id = ?1
                "#,
                [id.as_str()],
                row_to_draft,
            )
            .optional()?;
        Ok(draft)
    })
    .await
}

/// Deletes a consumed draft. Returns whether a row was removed.
pub async fn delete(db: &Database, id: &DraftId) -> Result<bool> {
    let id = id.clone();

    db.with_conn(move |conn| {
        let deleted = conn.execute("DELETE FROM outbound_drafts WHERE id = ?1", [id.as_str()])?;
        Ok(deleted > 0)
    })
    .await
}

fn row_to_draft(row: &Row<'_>) -> rusqlite::Result<OutboundDraft> {
    let kind: String = row.get(2)?;
    let created_at: String = row.get(13)?;

    Ok(OutboundDraft {
        id: DraftId(row.get(0)?),
        account_id: AccountId(row.get(1)?),
        kind: DraftKind::parse(&kind).ok_or_else(|| {
            rusqlite::Error::FromSqlConversionFailure(
                2,
                rusqlite::types::Type::Text,
                format!("unknown draft kind {kind}").into(),
            )
        })?,
        original_message_id: row.get::<_, Option<String>>(3)?.map(EmailId),
        remote_draft_id: row.get(4)?,
        to: parse_json(5, &row.get::<_, String>(5)?)?,
        cc: parse_json(6, &row.get::<_, String>(6)?)?,
        bcc: parse_json(7, &row.get::<_, String>(7)?)?,
        subject: row.get(8)?,
        body_html: row.get(9)?,
        body_text: row.get(10)?,
        template_attachments: parse_json(11, &row.get::<_, String>(11)?)?,
        original_attachment_ids: parse_json(12, &row.get::<_, String>(12)?)?,
        created_at: parse_timestamp(13, &created_at)?,
    })
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<String> {
    serde_json::to_string(value).map_err(|e| DatabaseError::Corrupt(e.to_string()))
}
