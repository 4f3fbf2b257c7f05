//! Local mirror storage.
//!
//! - SQLite database for accounts, messages, labels and drafts
//! - Filesystem blob store for attachment bytes
//! - OS keychain integration for OAuth secrets

mod blobs;
mod database;
mod keychain;
pub mod queries;
mod schema;

pub use blobs::{BlobError, BlobStore};
pub use database::{Database, DatabaseError, Result};
pub use keychain::{
    refresh_token_key, KeychainAccess, KeychainError, MemorySecretStore, SecretStore,
    CLIENT_SECRET_KEY,
};

use std::path::Path;

/// Database plus blob store, shared by every sync task.
#[derive(Debug, Clone)]
pub struct StorageLayer {
    db: Database,
    blobs: BlobStore,
}

impl StorageLayer {
    /// Opens the database at `db_path` and roots the blob store at
    /// `attachments_dir`.
    pub async fn open(db_path: impl AsRef<Path>, attachments_dir: impl AsRef<Path>) -> Result<Self> {
        let db = Database::open(db_path).await?;
        Ok(Self {
            db,
            blobs: BlobStore::new(attachments_dir.as_ref()),
        })
    }

    /// Creates a storage layer over an in-memory database.
    pub async fn in_memory(attachments_dir: impl AsRef<Path>) -> Result<Self> {
        let db = Database::open_in_memory().await?;
        Ok(Self {
            db,
            blobs: BlobStore::new(attachments_dir.as_ref()),
        })
    }

    /// Returns the database.
    pub fn db(&self) -> &Database {
        &self.db
    }

    /// Returns the blob store.
    pub fn blobs(&self) -> &BlobStore {
        &self.blobs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn storage_layer_in_memory() {
        let dir = tempfile::tempdir().unwrap();
        let storage = StorageLayer::in_memory(dir.path()).await.unwrap();

        let count: i64 = storage
            .db()
            .with_conn(|conn| Ok(conn.query_row("SELECT COUNT(*) FROM messages", [], |row| row.get(0))?))
            .await
            .unwrap();

        assert_eq!(count, 0);
        assert_eq!(storage.blobs().root(), dir.path());
    }
}
