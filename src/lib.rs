//! mailmirror - incremental Gmail synchronization engine
//!
//! Mirrors remote mailboxes into a local SQLite database: messages with
//! decoded bodies, labels with unread counters, attachments on disk. Full and
//! history-based synchronization run as background tasks; label changes,
//! sends and drafts go to the remote first and are mirrored on success.

pub mod config;
pub mod domain;
pub mod providers;
pub mod services;
pub mod storage;
