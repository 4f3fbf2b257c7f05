//! Get-or-create of local labels from remote descriptors.

use std::collections::HashSet;

use rusqlite::Connection;

use super::Result;
use crate::domain::{system_labels, Label, LabelId, LabelKind};
use crate::providers::email::{Connector, ProviderError, RemoteLabel};
use crate::storage::queries::labels;
use crate::storage::{Database, DatabaseError};

/// Maps remote label ids onto local label rows for one account.
pub struct LabelBuilder<'a> {
    db: &'a Database,
    connector: &'a Connector,
}

impl<'a> LabelBuilder<'a> {
    pub fn new(db: &'a Database, connector: &'a Connector) -> Self {
        Self { db, connector }
    }

    /// Returns the local label for `remote`, creating it if needed.
    ///
    /// A concurrent creation of the same label is absorbed by re-reading the
    /// row. The remote name and kind are applied on every call.
    pub async fn get_or_create(&self, remote: &RemoteLabel) -> Result<Label> {
        let label = Label {
            account_id: self.connector.account_id().clone(),
            id: LabelId(remote.id.clone()),
            name: remote.name.clone(),
            kind: LabelKind::from_remote(remote.kind.as_deref()),
            unread: 0,
        };

        let stored = self
            .db
            .with_conn(move |conn| {
                let known = labels::get(conn, &label.account_id, &label.id)?.is_some();
                store_label(conn, &label, known)
            })
            .await?;
        Ok(stored)
    }

    /// Resolves remote label ids to local ones, fetching labels not seen yet.
    ///
    /// `UNREAD` is dropped since it maps onto the read flag. Labels the
    /// remote no longer knows are skipped.
    pub async fn resolve(&self, ids: &[LabelId]) -> Result<Vec<LabelId>> {
        let account_id = self.connector.account_id().clone();
        let known: HashSet<LabelId> = self
            .db
            .with_conn(move |conn| {
                Ok(labels::get_by_account(conn, &account_id)?
                    .into_iter()
                    .map(|l| l.id)
                    .collect())
            })
            .await?;

        let unread = system_labels::unread();
        let mut resolved = Vec::with_capacity(ids.len());
        for id in ids {
            if *id == unread || resolved.contains(id) {
                continue;
            }
            if known.contains(id) {
                resolved.push(id.clone());
                continue;
            }
            match self.connector.get_label(id).await {
                Ok(remote) => resolved.push(self.get_or_create(&remote).await?.id),
                Err(ProviderError::NotFound(_)) => {
                    tracing::warn!(
                        account_id = %self.connector.account_id(),
                        label_id = %id,
                        "label unknown remotely, skipping"
                    );
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(resolved)
    }
}

/// Writes `label` and returns the stored row. `known` is the outcome of the
/// lookup that preceded it; an insert that loses to another writer since that
/// lookup takes over the row it created.
fn store_label(conn: &Connection, label: &Label, known: bool) -> std::result::Result<Label, DatabaseError> {
    if !known {
        match labels::insert(conn, label) {
            Ok(()) => {
                tracing::debug!(account_id = %label.account_id, label_id = %label.id, "created label");
            }
            Err(e) if e.is_unique_violation() => {
                tracing::debug!(account_id = %label.account_id, label_id = %label.id, "label created concurrently");
            }
            Err(e) => return Err(e),
        }
    }
    labels::set_name(conn, &label.account_id, &label.id, &label.name, label.kind)?;
    labels::get(conn, &label.account_id, &label.id)?
        .ok_or_else(|| DatabaseError::Corrupt(format!("label {} vanished", label.id)))
}
