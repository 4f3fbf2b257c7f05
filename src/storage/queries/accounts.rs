//! Account persistence.
//!
//! Each mutation touches a single row so concurrent tasks never need a
//! cross-row transaction to update sync flags.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};

use crate::domain::{AccountId, HistoryId, MailAccount};
use crate::storage::database::{Database, Result};

use super::parse_timestamp;

const SELECT_COLUMNS: &str = r#"
    SELECT id, email, authorized, history_id, is_syncing, first_sync_finished_at, deleted
    FROM accounts
"#;

/// Inserts a new account.
pub async fn insert(db: &Database, account: &MailAccount) -> Result<()> {
    let account = account.clone();

    db.with_conn(move |conn| {
        conn.execute(
            r#"
            INSERT INTO accounts (
                id, email, authorized, history_id, is_syncing,
                first_sync_finished_at, deleted, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            "#,
            params![
                account.id.0,
                account.email,
                account.authorized,
                account.history_id.map(|h| h.0 as i64),
                account.is_syncing,
                account.first_sync_finished_at.map(|t| t.to_rfc3339()),
                account.deleted,
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    })
    .await
}

/// Retrieves an account by its ID, including soft-deleted ones.
pub async fn get_by_id(db: &Database, account_id: &AccountId) -> Result<Option<MailAccount>> {
    let account_id = account_id.clone();

    db.with_conn(move |conn| {
        let sql = format!("{SELECT_COLUMNS} WHERE id = ?1");
        let account = conn
            .query_row(&sql, [&account_id.0], row_to_account)
            .optional()?;
        Ok(account)
    })
    .await
}

/// Retrieves every account that is not soft-deleted.
pub async fn get_active(db: &Database) -> Result<Vec<MailAccount>> {
    db.with_conn(|conn| {
        let sql = format!("{SELECT_COLUMNS} WHERE deleted = 0 ORDER BY email");
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map([], row_to_account)?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    })
    .await
}

/// Stores a new history cursor.
pub async fn set_history_id(
    db: &Database,
    account_id: &AccountId,
    history_id: HistoryId,
) -> Result<()> {
    let account_id = account_id.clone();

    db.with_conn(move |conn| {
        conn.execute(
            "UPDATE accounts SET history_id = ?1, updated_at = ?2 WHERE id = ?3",
            params![history_id.0 as i64, Utc::now().to_rfc3339(), account_id.0],
        )?;
        Ok(())
    })
    .await
}

/// Sets or clears the advisory syncing flag.
pub async fn set_syncing(db: &Database, account_id: &AccountId, syncing: bool) -> Result<()> {
    let account_id = account_id.clone();

    db.with_conn(move |conn| {
        conn.execute(
            "UPDATE accounts SET is_syncing = ?1, updated_at = ?2 WHERE id = ?3",
            params![syncing, Utc::now().to_rfc3339(), account_id.0],
        )?;
        Ok(())
    })
    .await
}

/// Clears the syncing flag on every account. Returns how many were set.
pub async fn clear_syncing(db: &Database) -> Result<usize> {
    db.with_conn(|conn| {
        let cleared = conn.execute(
            "UPDATE accounts SET is_syncing = 0, updated_at = ?1 WHERE is_syncing = 1",
            params![Utc::now().to_rfc3339()],
        )?;
        Ok(cleared)
    })
    .await
}

/// Marks the account unauthorized and not syncing. The cursor is untouched.
pub async fn deauthorize(db: &Database, account_id: &AccountId) -> Result<()> {
    let account_id = account_id.clone();

    db.with_conn(move |conn| {
        conn.execute(
            "UPDATE accounts SET authorized = 0, is_syncing = 0, updated_at = ?1 WHERE id = ?2",
            params![Utc::now().to_rfc3339(), account_id.0],
        )?;
        Ok(())
    })
    .await
}

/// Marks the account authorized again after credentials were renewed.
pub async fn reauthorize(db: &Database, account_id: &AccountId) -> Result<()> {
    let account_id = account_id.clone();

    db.with_conn(move |conn| {
        conn.execute(
            "UPDATE accounts SET authorized = 1, updated_at = ?1 WHERE id = ?2",
            params![Utc::now().to_rfc3339(), account_id.0],
        )?;
        Ok(())
    })
    .await
}

/// Records completion of the first full sync and clears the syncing flag.
pub async fn finish_first_sync(
    db: &Database,
    account_id: &AccountId,
    at: DateTime<Utc>,
) -> Result<()> {
    let account_id = account_id.clone();

    db.with_conn(move |conn| {
        conn.execute(
            r#"
            UPDATE accounts
            SET is_syncing = 0,
                first_sync_finished_at = COALESCE(first_sync_finished_at, ?1),
                updated_at = ?1
            WHERE id = ?2
            "#,
            params![at.to_rfc3339(), account_id.0],
        )?;
        Ok(())
    })
    .await
}

/// Soft-deletes an account. Its rows stay in place.
pub async fn soft_delete(db: &Database, account_id: &AccountId) -> Result<()> {
    let account_id = account_id.clone();

    db.with_conn(move |conn| {
        conn.execute(
            "UPDATE accounts SET deleted = 1, is_syncing = 0, updated_at = ?1 WHERE id = ?2",
            params![Utc::now().to_rfc3339(), account_id.0],
        )?;
        Ok(())
    })
    .await
}

fn row_to_account(row: &Row<'_>) -> rusqlite::Result<MailAccount> {
    let first_sync: Option<String> = row.get(5)?;

    Ok(MailAccount {
        id: AccountId(row.get(0)?),
        email: row.get(1)?,
        authorized: row.get(2)?,
        history_id: row.get::<_, Option<i64>>(3)?.map(|h| HistoryId(h as u64)),
        is_syncing: row.get(4)?,
        first_sync_finished_at: first_sync
            .as_deref()
            .map(|s| parse_timestamp(5, s))
            .transpose()?,
        deleted: row.get(6)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn setup() -> (Database, AccountId) {
        let db = Database::open_in_memory().await.unwrap();
        let account = MailAccount::new("acc-1", "user@example.com");
        insert(&db, &account).await.unwrap();
        (db, account.id)
    }

    #[tokio::test]
    async fn insert_and_get_account() {
        let (db, id) = setup().await;

        let account = get_by_id(&db, &id).await.unwrap().unwrap();
        assert_eq!(account.email, "user@example.com");
        assert!(account.authorized);
        assert_eq!(account.history_id, None);
        assert!(!account.is_syncing);
    }

    #[tokio::test]
    async fn get_nonexistent_account_returns_none() {
        let db = Database::open_in_memory().await.unwrap();
        let result = get_by_id(&db, &AccountId::from("missing")).await.unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn history_id_roundtrip() {
        let (db, id) = setup().await;
        set_history_id(&db, &id, HistoryId(987_654_321)).await.unwrap();

        let account = get_by_id(&db, &id).await.unwrap().unwrap();
        assert_eq!(account.history_id, Some(HistoryId(987_654_321)));
    }

    #[tokio::test]
    async fn deauthorize_keeps_cursor() {
        let (db, id) = setup().await;
        set_history_id(&db, &id, HistoryId(5)).await.unwrap();
        set_syncing(&db, &id, true).await.unwrap();

        deauthorize(&db, &id).await.unwrap();

        let account = get_by_id(&db, &id).await.unwrap().unwrap();
        assert!(!account.authorized);
        assert!(!account.is_syncing);
        assert_eq!(account.history_id, Some(HistoryId(5)));

        reauthorize(&db, &id).await.unwrap();
        assert!(get_by_id(&db, &id).await.unwrap().unwrap().authorized);
    }

    #[tokio::test]
    async fn finish_first_sync_is_sticky() {
        let (db, id) = setup().await;
        set_syncing(&db, &id, true).await.unwrap();

        let first = Utc::now();
        finish_first_sync(&db, &id, first).await.unwrap();
        finish_first_sync(&db, &id, first + chrono::Duration::hours(1))
            .await
            .unwrap();

        let account = get_by_id(&db, &id).await.unwrap().unwrap();
        assert!(!account.is_syncing);
        assert_eq!(
            account.first_sync_finished_at.map(|t| t.timestamp()),
            Some(first.timestamp())
        );
    }

    #[tokio::test]
    async fn soft_deleted_accounts_are_not_active() {
        let (db, id) = setup().await;
        insert(&db, &MailAccount::new("acc-2", "other@example.com"))
            .await
            .unwrap();

        soft_delete(&db, &id).await.unwrap();

        let active = get_active(&db).await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id.as_str(), "acc-2");
        assert!(get_by_id(&db, &id).await.unwrap().unwrap().deleted);
    }

    #[tokio::test]
    async fn clear_syncing_resets_every_flag() {
        let (db, id) = setup().await;
        insert(&db, &MailAccount::new("acc-2", "other@example.com"))
            .await
            .unwrap();
        set_syncing(&db, &id, true).await.unwrap();

        assert_eq!(clear_syncing(&db).await.unwrap(), 1);
        assert!(!get_by_id(&db, &id).await.unwrap().unwrap().is_syncing);
    }
}
