//! Remote mailbox access.
//!
//! Layers, from the wire up:
//!
//! - [`GmailApi`] - one method per remote endpoint, raw [`ApiError`]s
//! - [`HttpGmailApi`] - the reqwest implementation, authenticated by a [`TokenSource`]
//! - [`Connector`] - retry with backoff, typed [`ProviderError`]s, deauthorization
//!
//! [`InMemoryMailbox`] implements [`GmailApi`] without a network and backs
//! the synchronization tests.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use mailmirror::providers::email::{Connector, HttpGmailApi, StaticToken, GMAIL_API_BASE};
//!
//! let api = HttpGmailApi::new(reqwest::Client::new(), GMAIL_API_BASE, 500, Arc::new(StaticToken(token)));
//! let connector = Connector::new(Arc::new(api), db, account_id);
//! let listing = connector.list_all_message_ids().await?;
//! ```

mod connector;
mod gmail;
mod memory;
mod oauth;
mod traits;

pub use connector::{Connector, HistoryDelta, MessageListing, RetryPolicy};
pub use gmail::{decode_base64url, encode_base64url, HttpGmailApi, GMAIL_API_BASE, GOOGLE_TOKEN_URL};
pub use memory::{remote_message_from_raw, InMemoryMailbox};
pub use oauth::{OAuthTokenSource, StaticToken, TokenError, TokenSource};
pub use traits::{
    ApiError, GmailApi, HistoryLabelChange, HistoryMessage, HistoryPage, HistoryRecord,
    MessageListPage, MessageRef, Profile, ProviderError, RemoteBody, RemoteDraft, RemoteHeader,
    RemoteLabel, RemoteMessage, RemotePart, Result, ShortMessage,
};

#[cfg(test)]
pub(crate) use traits::MockGmailApi;
