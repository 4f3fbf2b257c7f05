//! Remote service providers.
//!
//! - [`email`] - the Gmail API surface, OAuth tokens and the retrying connector

pub mod email;
