//! Relational store for a FUSE filesystem: schema, SQL, and transaction
//! discipline for the `inode`/`link`/`block` tables described in
//! `SPEC_FULL.md`.
//!
//! This crate knows nothing about FUSE; it exposes a typed API the
//! operations layer (the `sqlfs` crate) drives one request at a time.

#![deny(missing_docs)]

pub mod error;
pub mod key;
pub mod schema;
pub mod store;
pub mod types;

pub use error::{Result, StoreError};
pub use store::Store;
