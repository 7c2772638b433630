//! Password-derived encryption key handling.
//!
//! The key is the lowercase hex digest of the password's MD5 hash, matching
//! `sqlfs.py`'s on-disk key derivation so a database encrypted by one
//! implementation stays openable by the other. Unlike splicing that digest
//! into a `PRAGMA key='<digest>'` string, it is bound through `rusqlite`'s
//! parameterised `pragma_update`, which removes any quoting hazard.

use rusqlite::Connection;

use crate::error::Result;

/// Derive the fixed-width key used for `PRAGMA key` from a user password.
///
/// Returns the lowercase hex digest of the password's MD5 hash, matching
/// `sqlfs.py`'s key derivation so databases remain cross-compatible.
pub fn derive_key(password: &str) -> String {
    format!("{:x}", md5::compute(password.as_bytes()))
}

/// Apply an encryption key to a freshly opened connection.
///
/// Must run before any other statement touches the database: SQLCipher
/// pages are unreadable until the key is set, and setting a key after
/// other I/O has already started is rejected by the engine.
pub fn apply_key(conn: &Connection, password: &str) -> Result<()> {
    let key = derive_key(password);
    conn.pragma_update(None, "key", &key)?;
    Ok(())
}
