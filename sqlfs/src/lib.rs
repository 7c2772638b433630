//! FUSE operations layer for a SQL-backed filesystem.
//!
//! Wraps [`sqlfs_store::Store`] in a [`fuser::Filesystem`] implementation.
//! See `SPEC_FULL.md` at the workspace root for the full operation
//! contract this crate implements.

#![deny(missing_docs)]

pub mod attr;
pub mod blockmath;
pub mod error;
pub mod ops;

pub use error::{OpsError, Result};
pub use ops::SqlFs;
