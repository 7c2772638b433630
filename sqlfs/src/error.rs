//! Operations-layer error type. Wraps [`sqlfs_store::StoreError`] via
//! `#[from]` so store failures compose with `?`, and converts every
//! variant to the `libc` errno FUSE replies expect.

use thiserror::Error;

/// Error raised by an operations-layer method.
#[derive(Error, Debug)]
pub enum OpsError {
    /// No inode exists at the given id, or a name didn't resolve.
    #[error("not found")]
    NotFound,
    /// A name already exists where a create/link/rename expected none.
    #[error("already exists")]
    Exists,
    /// Operation required a directory but the target isn't one.
    #[error("not a directory")]
    NotADirectory,
    /// Operation required a non-directory but the target is one.
    #[error("is a directory")]
    IsADirectory,
    /// Directory (or rename destination) was not empty.
    #[error("not empty")]
    NotEmpty,
    /// Argument was structurally invalid (e.g. readlink on a non-symlink).
    #[error("invalid argument")]
    Invalid,
    /// The underlying store failed.
    #[error("store error: {0}")]
    Store(#[from] sqlfs_store::StoreError),
}

impl OpsError {
    /// Map to the errno this crate's `fuser::Filesystem` impl replies
    /// with.
    pub fn errno(&self) -> libc::c_int {
        match self {
            OpsError::NotFound => libc::ENOENT,
            OpsError::Exists => libc::EEXIST,
            OpsError::NotADirectory => libc::ENOTDIR,
            OpsError::IsADirectory => libc::EISDIR,
            OpsError::NotEmpty => libc::ENOTEMPTY,
            OpsError::Invalid => libc::EINVAL,
            OpsError::Store(e) => {
                log::error!("store error: {e}");
                libc::EIO
            }
        }
    }
}

/// Shorthand for a `Result` with the error type [`OpsError`].
pub type Result<T> = std::result::Result<T, OpsError>;
