//! Schema DDL for the three persisted tables.

/// Creates `inode`, `link`, and `block` if they do not already exist, and
/// seeds the root inode (id 1) the first time the schema is created.
///
/// Foreign keys are enabled on the connection separately (SQLite does not
/// persist `PRAGMA foreign_keys` in the database file; it must be set on
/// every connection), see [`crate::store::Store::open`].
pub const CREATE_TABLES: &str = "
CREATE TABLE IF NOT EXISTS inode (
    id       INTEGER PRIMARY KEY,
    uid      INTEGER NOT NULL,
    gid      INTEGER NOT NULL,
    mode     INTEGER NOT NULL,
    mtime_ns INTEGER NOT NULL,
    atime_ns INTEGER NOT NULL,
    ctime_ns INTEGER NOT NULL,
    size     INTEGER NOT NULL DEFAULT 0,
    rdev     INTEGER NOT NULL DEFAULT 0,
    target   BLOB
);

CREATE TABLE IF NOT EXISTS link (
    id           INTEGER PRIMARY KEY,
    inode        INTEGER NOT NULL REFERENCES inode(id) ON DELETE CASCADE,
    parent_inode INTEGER NOT NULL REFERENCES inode(id) ON DELETE RESTRICT,
    name         BLOB NOT NULL,
    UNIQUE(parent_inode, name)
);

CREATE TABLE IF NOT EXISTS block (
    inode INTEGER NOT NULL REFERENCES inode(id) ON DELETE CASCADE,
    idx   INTEGER NOT NULL,
    data  BLOB NOT NULL,
    PRIMARY KEY (inode, idx)
);
";

/// Column list for `inode` plus its three derived counts, in the order
/// [`crate::store::inode_from_row`] expects to find them starting at a
/// given offset. Centralised here so every query that reads a full inode
/// row stays in sync with that decoder.
pub const INODE_COLUMNS: &str = "
    inode.id, inode.uid, inode.gid, inode.mode,
    inode.mtime_ns, inode.atime_ns, inode.ctime_ns,
    inode.size, inode.rdev, inode.target,
    (SELECT COUNT(*) FROM link WHERE link.inode = inode.id) AS nlink,
    (SELECT COUNT(*) FROM link WHERE link.parent_inode = inode.id) AS nchild,
    (SELECT COUNT(*) FROM block WHERE block.inode = inode.id) AS nblock
";

/// `mode` for the root directory: `S_IFDIR | 0o755`.
pub const ROOT_MODE: i64 = 0o040_755;

/// Inode id of the filesystem root. Fixed by the schema, never reassigned.
pub const ROOT_INODE: i64 = 1;
