//! Database query modules.
//!
//! `accounts` and `drafts` expose async functions over [`Database`]; the
//! message, label, attachment and marker modules take a `&Connection` so they
//! can be composed inside a single transaction.
//!
//! [`Database`]: super::Database

pub mod accounts;
pub mod attachments;
pub mod drafts;
pub mod labels;
pub mod messages;
pub mod no_messages;

use chrono::{DateTime, Utc};
use rusqlite::types::Type;

/// Parses an RFC 3339 column value, reporting failures against `column`.
pub(crate) fn parse_timestamp(column: usize, value: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(column, Type::Text, Box::new(e)))
}

/// Parses a JSON column value, reporting failures against `column`.
pub(crate) fn parse_json<T: serde::de::DeserializeOwned>(
    column: usize,
    value: &str,
) -> rusqlite::Result<T> {
    serde_json::from_str(value)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(column, Type::Text, Box::new(e)))
}
