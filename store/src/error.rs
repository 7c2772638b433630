//! Error type for the store layer.
//!
//! Follows the layered-wrapping convention used throughout this crate's
//! higher layers: one `thiserror`-derived enum, with the underlying
//! `rusqlite::Error` wrapped via `#[from]` so `?` composes without manual
//! mapping at each call site.

use thiserror::Error;

/// Error raised by any [`crate::Store`] operation.
#[derive(Error, Debug)]
pub enum StoreError {
    /// A query or statement failed against the underlying database.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// The caller asked for an inode id that does not exist.
    #[error("no such inode: {0}")]
    NoSuchInode(i64),

    /// The caller asked for a link (parent, name) pair that does not exist.
    #[error("no such link: parent={0} name={1:?}")]
    NoSuchLink(i64, Vec<u8>),

    /// A uniqueness constraint on `(parent_inode, name)` was violated.
    #[error("link already exists: parent={0} name={1:?}")]
    LinkExists(i64, Vec<u8>),

    /// The encryption key was rejected (wrong password, or the database
    /// was not created with one).
    #[error("invalid or missing encryption key")]
    BadKey,
}

/// Shorthand for a `Result` with the error type [`StoreError`].
pub type Result<T> = std::result::Result<T, StoreError>;
