//! The store itself: connection lifecycle, transaction discipline, and
//! every operation from the Store Layer's operation table.
//!
//! Queries live as free functions taking `&Connection` rather than methods
//! on [`Store`], so the same code path serves both plain reads (against
//! the guarded connection directly) and writes (against a
//! `rusqlite::Transaction`, which derefs to `Connection`). [`Store`]'s own
//! job is just to own the connection and bracket transactions.

use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use rusqlite::{params, Connection, OptionalExtension};

use crate::error::{Result, StoreError};
use crate::key;
use crate::schema;
use crate::types::{BlockRow, InodeRow, InodeUpdate, LinkRow, LinkUpdate, NewInodeExtras};

const S_IFMT: u32 = 0o170_000;
const S_IFDIR: u32 = 0o040_000;

fn is_dir(mode: u32) -> bool {
    mode & S_IFMT == S_IFDIR
}

/// Current time in nanoseconds since the Unix epoch, for stamping
/// `mtime_ns`/`atime_ns`/`ctime_ns`.
pub fn now_ns() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as i64
}

fn map_insert_err(e: rusqlite::Error, parent: i64, name: &[u8]) -> StoreError {
    if let rusqlite::Error::SqliteFailure(ref ffi_err, _) = e {
        if ffi_err.code == rusqlite::ErrorCode::ConstraintViolation {
            return StoreError::LinkExists(parent, name.to_vec());
        }
    }
    StoreError::Sqlite(e)
}

fn inode_from_row(row: &rusqlite::Row<'_>, base: usize) -> rusqlite::Result<InodeRow> {
    Ok(InodeRow {
        id: row.get::<_, i64>(base)?,
        uid: row.get::<_, i64>(base + 1)? as u32,
        gid: row.get::<_, i64>(base + 2)? as u32,
        mode: row.get::<_, i64>(base + 3)? as u32,
        mtime_ns: row.get::<_, i64>(base + 4)?,
        atime_ns: row.get::<_, i64>(base + 5)?,
        ctime_ns: row.get::<_, i64>(base + 6)?,
        size: row.get::<_, i64>(base + 7)? as u64,
        rdev: row.get::<_, i64>(base + 8)? as u32,
        target: row.get::<_, Option<Vec<u8>>>(base + 9)?,
        nlink: row.get::<_, i64>(base + 10)? as u32,
        nchild: row.get::<_, i64>(base + 11)? as u32,
        nblock: row.get::<_, i64>(base + 12)? as u32,
    })
}

/// Fetch a single inode by id, with its derived `nlink`/`nchild`/`nblock`
/// counts. `None` if no such inode exists.
pub fn get_inode(conn: &Connection, id: i64) -> Result<Option<InodeRow>> {
    let sql = format!(
        "SELECT {cols} FROM inode WHERE inode.id = ?1",
        cols = schema::INODE_COLUMNS
    );
    conn.query_row(&sql, params![id], |row| inode_from_row(row, 0))
        .optional()
        .map_err(Into::into)
}

/// Resolve a `(parent, name)` pair to the inode it names, along with the
/// link row itself. `None` if there is no such entry.
pub fn lookup(conn: &Connection, parent: i64, name: &[u8]) -> Result<Option<(InodeRow, LinkRow)>> {
    let sql = format!(
        "SELECT link.id, {cols} FROM link JOIN inode ON inode.id = link.inode \
         WHERE link.parent_inode = ?1 AND link.name = ?2",
        cols = schema::INODE_COLUMNS
    );
    conn.query_row(&sql, params![parent, name], |row| {
        let link_id: i64 = row.get(0)?;
        let inode = inode_from_row(row, 1)?;
        let inode_id = inode.id;
        Ok((
            inode,
            LinkRow {
                id: link_id,
                inode: inode_id,
                parent_inode: parent,
                name: name.to_vec(),
            },
        ))
    })
    .optional()
    .map_err(Into::into)
}

/// List the directory entries of `parent` whose link id is greater than
/// `after`, ordered by link id ascending. `after = 0` lists from the
/// start; a non-zero `after` resumes a paused `readdir`.
pub fn children(conn: &Connection, parent: i64, after: i64) -> Result<Vec<(InodeRow, LinkRow)>> {
    let sql = format!(
        "SELECT link.id, link.name, {cols} FROM link JOIN inode ON inode.id = link.inode \
         WHERE link.parent_inode = ?1 AND link.id > ?2 ORDER BY link.id ASC",
        cols = schema::INODE_COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params![parent, after], |row| {
        let link_id: i64 = row.get(0)?;
        let name: Vec<u8> = row.get(1)?;
        let inode = inode_from_row(row, 2)?;
        let inode_id = inode.id;
        Ok((
            inode,
            LinkRow {
                id: link_id,
                inode: inode_id,
                parent_inode: parent,
                name,
            },
        ))
    })?;
    rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
}

/// Fetch the stored blocks of `inode` whose index falls in `[lo, hi]`.
/// Missing indices in the range simply have no row; callers treat them as
/// zero-filled.
pub fn blocks(conn: &Connection, inode: i64, lo: u64, hi: u64) -> Result<Vec<BlockRow>> {
    let mut stmt = conn.prepare(
        "SELECT inode, idx, data FROM block WHERE inode = ?1 AND idx BETWEEN ?2 AND ?3 ORDER BY idx ASC",
    )?;
    let rows = stmt.query_map(params![inode, lo as i64, hi as i64], |row| {
        Ok(BlockRow {
            inode: row.get(0)?,
            idx: row.get::<_, i64>(1)? as u64,
            data: row.get(2)?,
        })
    })?;
    rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
}

/// Insert a new inode, its primary link, and (for directories) its seeded
/// `.`/`..` entries, all in the caller's transaction. Returns the new
/// inode id.
pub fn create_inode(
    conn: &Connection,
    parent: i64,
    name: &[u8],
    uid: u32,
    gid: u32,
    mode: u32,
    extras: &NewInodeExtras,
    now: i64,
) -> Result<i64> {
    conn.execute(
        "INSERT INTO inode (uid, gid, mode, mtime_ns, atime_ns, ctime_ns, size, rdev, target) \
         VALUES (?1, ?2, ?3, ?4, ?4, ?4, ?5, ?6, ?7)",
        params![
            uid as i64,
            gid as i64,
            mode as i64,
            now,
            extras.size as i64,
            extras.rdev as i64,
            extras.target,
        ],
    )?;
    let id = conn.last_insert_rowid();
    create_link(conn, id, parent, name)?;
    if is_dir(mode) {
        create_link(conn, id, id, b".")?;
        create_link(conn, parent, id, b"..")?;
    }
    Ok(id)
}

/// Insert a bare link row (used for `link()` hardlinks, and internally by
/// [`create_inode`]). Fails with [`StoreError::LinkExists`] on a
/// `(parent_inode, name)` collision.
pub fn create_link(conn: &Connection, inode: i64, parent: i64, name: &[u8]) -> Result<i64> {
    conn.execute(
        "INSERT INTO link (inode, parent_inode, name) VALUES (?1, ?2, ?3)",
        params![inode, parent, name],
    )
    .map_err(|e| map_insert_err(e, parent, name))?;
    Ok(conn.last_insert_rowid())
}

const UPDATE_INODE_SQL: &str = "UPDATE inode SET
    size = COALESCE(?1, size),
    mode = COALESCE(?2, mode),
    uid = COALESCE(?3, uid),
    gid = COALESCE(?4, gid),
    mtime_ns = COALESCE(?5, mtime_ns),
    atime_ns = COALESCE(?6, atime_ns),
    ctime_ns = COALESCE(?7, ctime_ns)
    WHERE id = ?8";

/// Apply a sparse attribute update. The SQL text is fixed; only values are
/// parameterised, with `NULL` meaning "leave this column unchanged" via
/// `COALESCE`. No column name is ever assembled from caller input.
pub fn update_inode(conn: &Connection, id: i64, fields: &InodeUpdate) -> Result<()> {
    if fields.is_empty() {
        return Ok(());
    }
    conn.execute(
        UPDATE_INODE_SQL,
        params![
            fields.size.map(|v| v as i64),
            fields.mode.map(|v| v as i64),
            fields.uid.map(|v| v as i64),
            fields.gid.map(|v| v as i64),
            fields.mtime_ns,
            fields.atime_ns,
            fields.ctime_ns,
            id,
        ],
    )?;
    Ok(())
}

const UPDATE_LINK_SQL: &str = "UPDATE link SET
    inode = COALESCE(?1, inode),
    parent_inode = COALESCE(?2, parent_inode),
    name = COALESCE(?3, name)
    WHERE id = ?4";

/// Repoint an existing link row, for rename's relink/exchange branches.
pub fn update_link(conn: &Connection, id: i64, fields: &LinkUpdate) -> Result<()> {
    conn.execute(
        UPDATE_LINK_SQL,
        params![fields.inode, fields.parent_inode, fields.name, id],
    )
    .map_err(StoreError::Sqlite)?;
    Ok(())
}

const UPSERT_BLOCK_SQL: &str = "INSERT INTO block (inode, idx, data) VALUES (?1, ?2, ?3) \
     ON CONFLICT(inode, idx) DO UPDATE SET data = excluded.data";

/// Upsert a batch of blocks. A row whose `data` is empty is deleted rather
/// than stored, preserving the invariant that every stored block is
/// non-empty.
pub fn update_blocks(conn: &Connection, rows: &[BlockRow]) -> Result<()> {
    for row in rows {
        if row.data.is_empty() {
            delete_block(conn, row.inode, row.idx)?;
        } else {
            conn.execute(UPSERT_BLOCK_SQL, params![row.inode, row.idx as i64, row.data])?;
        }
    }
    Ok(())
}

/// Remove a single block row, if present.
pub fn delete_block(conn: &Connection, inode: i64, idx: u64) -> Result<()> {
    conn.execute(
        "DELETE FROM block WHERE inode = ?1 AND idx = ?2",
        params![inode, idx as i64],
    )?;
    Ok(())
}

/// Remove a link row by id.
pub fn delete_link(conn: &Connection, id: i64) -> Result<()> {
    conn.execute("DELETE FROM link WHERE id = ?1", params![id])?;
    Ok(())
}

/// Remove every block of `inode` whose index is strictly greater than
/// `keep_through_idx`, for truncate-to-shorter.
pub fn truncate_blocks(conn: &Connection, inode: i64, keep_through_idx: u64) -> Result<()> {
    conn.execute(
        "DELETE FROM block WHERE inode = ?1 AND idx > ?2",
        params![inode, keep_through_idx as i64],
    )?;
    Ok(())
}

/// Reclaim `id` if it now has neither inbound links nor children. Returns
/// whether it was reclaimed. The root inode is never eligible.
pub fn reclaim_if_orphan(conn: &Connection, id: i64) -> Result<bool> {
    if id == schema::ROOT_INODE {
        return Ok(false);
    }
    let nlink: i64 = conn.query_row(
        "SELECT COUNT(*) FROM link WHERE inode = ?1",
        params![id],
        |r| r.get(0),
    )?;
    let nchild: i64 = conn.query_row(
        "SELECT COUNT(*) FROM link WHERE parent_inode = ?1",
        params![id],
        |r| r.get(0),
    )?;
    if nlink == 0 && nchild == 0 {
        conn.execute("DELETE FROM inode WHERE id = ?1", params![id])?;
        Ok(true)
    } else {
        Ok(false)
    }
}

/// Total inode and block row counts, for `statfs`.
pub fn totals(conn: &Connection) -> Result<(u64, u64)> {
    let ninodes: i64 = conn.query_row("SELECT COUNT(*) FROM inode", [], |r| r.get(0))?;
    let nblocks: i64 = conn.query_row("SELECT COUNT(*) FROM block", [], |r| r.get(0))?;
    Ok((ninodes as u64, nblocks as u64))
}

/// Defensive sweep: remove every inode (other than the root) with no
/// inbound links and no children. Run at shutdown; should be a no-op in
/// normal operation since mutating operations reclaim eagerly.
pub fn cleanup_inodes(conn: &Connection) -> Result<usize> {
    let n = conn.execute(
        "DELETE FROM inode WHERE id != ?1 \
         AND id NOT IN (SELECT inode FROM link) \
         AND id NOT IN (SELECT parent_inode FROM link)",
        params![schema::ROOT_INODE],
    )?;
    Ok(n)
}

fn seed_root(conn: &Connection, now: i64) -> Result<()> {
    conn.execute(
        "INSERT OR IGNORE INTO inode (id, uid, gid, mode, mtime_ns, atime_ns, ctime_ns, size, rdev, target) \
         VALUES (?1, 0, 0, ?2, ?3, ?3, ?3, 0, 0, NULL)",
        params![schema::ROOT_INODE, schema::ROOT_MODE as i64, now],
    )?;
    conn.execute(
        "INSERT OR IGNORE INTO link (inode, parent_inode, name) VALUES (?1, ?1, ?2)",
        params![schema::ROOT_INODE, b".".as_slice()],
    )?;
    conn.execute(
        "INSERT OR IGNORE INTO link (inode, parent_inode, name) VALUES (?1, ?1, ?2)",
        params![schema::ROOT_INODE, b"..".as_slice()],
    )?;
    Ok(())
}

/// Owns the database connection and brackets every mutating operation in
/// a transaction. Shared behind a `Mutex` because `fuser::Filesystem`'s
/// methods take `&self`, even though the FUSE session loop dispatches one
/// request at a time (see the concurrency notes in `SPEC_FULL.md`).
pub struct Store {
    conn: Mutex<Connection>,
    path: Option<PathBuf>,
}

impl Store {
    /// Open (creating if necessary) the store at `path`, or an ephemeral
    /// in-memory store if `path` is `None`. If `password` is given, page
    /// encryption is configured before the schema is touched.
    pub fn open(path: Option<&Path>, password: Option<&str>) -> Result<Self> {
        let conn = match path {
            Some(p) => Connection::open(p)?,
            None => Connection::open_in_memory()?,
        };
        if let Some(pw) = password {
            key::apply_key(&conn, pw)?;
        }
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.execute_batch(schema::CREATE_TABLES)?;
        seed_root(&conn, now_ns())?;
        Ok(Store {
            conn: Mutex::new(conn),
            path: path.map(Path::to_path_buf),
        })
    }

    /// The filesystem path backing this store, if it isn't in-memory.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Run `f` inside a fresh transaction. Commits on `Ok`, rolls back (by
    /// dropping the uncommitted transaction) on `Err`.
    ///
    /// Generic over the error type so callers above this crate (the
    /// operations layer) can return their own error enum directly from
    /// the closure, rather than funnelling everything through
    /// [`StoreError`] first; anything implementing `From<StoreError>`
    /// works, including `StoreError` itself.
    pub fn with_transaction<T, E>(&self, f: impl FnOnce(&Connection) -> std::result::Result<T, E>) -> std::result::Result<T, E>
    where
        E: From<StoreError>,
    {
        let mut guard = self.conn.lock().expect("store mutex poisoned");
        let tx = guard.transaction().map_err(|e| E::from(StoreError::from(e)))?;
        let result = f(&tx)?;
        tx.commit().map_err(|e| E::from(StoreError::from(e)))?;
        Ok(result)
    }

    /// Run `f` against the connection directly, with no transaction. For
    /// read-only operations that don't need atomicity across statements.
    pub fn read<T, E>(&self, f: impl FnOnce(&Connection) -> std::result::Result<T, E>) -> std::result::Result<T, E> {
        let guard = self.conn.lock().expect("store mutex poisoned");
        f(&guard)
    }

    /// Run the defensive `cleanup_inodes` sweep in its own transaction.
    /// Does not consume the store; safe to call from a callback that only
    /// has `&self` (e.g. `fuser::Filesystem::destroy`).
    pub fn shutdown_sweep(&self) -> Result<()> {
        self.with_transaction(|conn| {
            let n = cleanup_inodes(conn)?;
            if n > 0 {
                log::debug!("cleanup_inodes reclaimed {n} orphaned inode(s) at shutdown");
            }
            Ok(())
        })
    }

    /// Run the shutdown sweep, compact the file, and drop the connection.
    pub fn close(self) -> Result<()> {
        self.shutdown_sweep()?;
        let guard = self.conn.lock().expect("store mutex poisoned");
        guard.execute_batch("VACUUM;")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{InodeUpdate, NewInodeExtras};
    use tempfile::NamedTempFile;

    /// Each test gets its own temporary SQLite file, so the suite can run
    /// in parallel without tests contending over a single database. The
    /// returned `NamedTempFile` must stay alive for the duration of the
    /// test: dropping it deletes the backing file out from under the open
    /// connection.
    fn memstore() -> (Store, NamedTempFile) {
        let file = NamedTempFile::new().expect("create temp db file");
        let store = Store::open(Some(file.path()), None).expect("open file-backed store");
        (store, file)
    }

    #[test]
    fn root_exists_and_is_self_parented() {
        let (s, _tmp) = memstore();
        s.read(|conn| {
            let root = get_inode(conn, schema::ROOT_INODE)?.expect("root inode");
            assert_eq!(root.nlink, 1); // the primary "." self-link; ".." also targets root but is its own link row
            assert_eq!(root.nchild, 2); // "." and ".."
            let (dot, _) = lookup(conn, schema::ROOT_INODE, b".")?.expect(". exists");
            assert_eq!(dot.id, schema::ROOT_INODE);
            let (dotdot, _) = lookup(conn, schema::ROOT_INODE, b"..")?.expect(".. exists");
            assert_eq!(dotdot.id, schema::ROOT_INODE);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn create_file_and_lookup_roundtrip() {
        let (s, _tmp) = memstore();
        let id = s
            .with_transaction(|conn| {
                create_inode(
                    conn,
                    schema::ROOT_INODE,
                    b"a",
                    1000,
                    1000,
                    0o100_644,
                    &NewInodeExtras::default(),
                    now_ns(),
                )
            })
            .unwrap();
        s.read(|conn| {
            let (row, link) = lookup(conn, schema::ROOT_INODE, b"a")?.expect("a exists");
            assert_eq!(row.id, id);
            assert_eq!(row.nlink, 1);
            assert_eq!(link.name, b"a");
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn mkdir_seeds_dot_and_dotdot() {
        let (s, _tmp) = memstore();
        let d = s
            .with_transaction(|conn| {
                create_inode(
                    conn,
                    schema::ROOT_INODE,
                    b"d",
                    0,
                    0,
                    0o040_755,
                    &NewInodeExtras::default(),
                    now_ns(),
                )
            })
            .unwrap();
        s.read(|conn| {
            let row = get_inode(conn, d)?.expect("d exists");
            assert_eq!(row.nlink, 2); // "d" under root, plus "." inside d
            assert_eq!(row.nchild, 2); // "." and ".." inside d
            let root = get_inode(conn, schema::ROOT_INODE)?.expect("root");
            assert_eq!(root.nlink, 3); // ".", "..", and now ".." inside d points back at root
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn hardlink_shares_inode_and_bumps_nlink() {
        let (s, _tmp) = memstore();
        let id = s
            .with_transaction(|conn| {
                create_inode(
                    conn,
                    schema::ROOT_INODE,
                    b"x",
                    0,
                    0,
                    0o100_644,
                    &NewInodeExtras::default(),
                    now_ns(),
                )
            })
            .unwrap();
        s.with_transaction(|conn| create_link(conn, id, schema::ROOT_INODE, b"y"))
            .unwrap();
        s.read(|conn| {
            let row = get_inode(conn, id)?.expect("x exists");
            assert_eq!(row.nlink, 2);
            let (via_y, _) = lookup(conn, schema::ROOT_INODE, b"y")?.expect("y exists");
            assert_eq!(via_y.id, id);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn delete_link_then_reclaim_drops_orphan_inode() {
        let (s, _tmp) = memstore();
        let id = s
            .with_transaction(|conn| {
                create_inode(
                    conn,
                    schema::ROOT_INODE,
                    b"tmp",
                    0,
                    0,
                    0o100_644,
                    &NewInodeExtras::default(),
                    now_ns(),
                )
            })
            .unwrap();
        s.with_transaction(|conn| {
            let (_, link) = lookup(conn, schema::ROOT_INODE, b"tmp")?.expect("tmp exists");
            delete_link(conn, link.id)?;
            let reclaimed = reclaim_if_orphan(conn, id)?;
            assert!(reclaimed);
            Ok(())
        })
        .unwrap();
        s.read(|conn| {
            assert!(get_inode(conn, id)?.is_none());
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn update_inode_leaves_unspecified_fields_alone() {
        let (s, _tmp) = memstore();
        let id = s
            .with_transaction(|conn| {
                create_inode(
                    conn,
                    schema::ROOT_INODE,
                    b"f",
                    0,
                    0,
                    0o100_644,
                    &NewInodeExtras::default(),
                    1000,
                )
            })
            .unwrap();
        s.with_transaction(|conn| {
            update_inode(
                conn,
                id,
                &InodeUpdate {
                    size: Some(42),
                    ..Default::default()
                },
            )
        })
        .unwrap();
        s.read(|conn| {
            let row = get_inode(conn, id)?.expect("f exists");
            assert_eq!(row.size, 42);
            assert_eq!(row.mode, 0o100_644); // untouched
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn truncate_blocks_drops_only_tail_indices() {
        let (s, _tmp) = memstore();
        let id = s
            .with_transaction(|conn| {
                create_inode(
                    conn,
                    schema::ROOT_INODE,
                    b"blk",
                    0,
                    0,
                    0o100_644,
                    &NewInodeExtras::default(),
                    now_ns(),
                )
            })
            .unwrap();
        s.with_transaction(|conn| {
            update_blocks(
                conn,
                &[
                    BlockRow { inode: id, idx: 0, data: vec![1; 10] },
                    BlockRow { inode: id, idx: 1, data: vec![2; 10] },
                    BlockRow { inode: id, idx: 2, data: vec![3; 10] },
                ],
            )
        })
        .unwrap();
        s.with_transaction(|conn| truncate_blocks(conn, id, 0)).unwrap();
        s.read(|conn| {
            let remaining = blocks(conn, id, 0, 10)?;
            assert_eq!(remaining.len(), 1);
            assert_eq!(remaining[0].idx, 0);
            Ok(())
        })
        .unwrap();
    }
}
