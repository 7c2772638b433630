//! `fuser::Filesystem` implementation: translates kernel requests into
//! [`sqlfs_store::store`] calls, one transaction per mutating request.
//!
//! Read assembles its buffer from zero-filled blocks so sparse regions
//! read back as zero; write preserves the unwritten head/tail of the
//! blocks it touches via a scratch buffer; rename handles its four
//! distinct outcomes (plain relink, `RENAME_NOREPLACE`, `RENAME_EXCHANGE`,
//! and replace) in one transaction so a crash mid-rename can't leave the
//! tree in a half-updated state.

use std::ffi::OsStr;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::time::Duration;

use fuser::{
    FileType, Filesystem, KernelConfig, ReplyAttr, ReplyCreate, ReplyData, ReplyDirectory,
    ReplyEmpty, ReplyEntry, ReplyOpen, ReplyStatfs, ReplyWrite, Request, TimeOrNow,
};
use rusqlite::Connection;
use sqlfs_store::store::{self, now_ns};
use sqlfs_store::types::{BlockRow, InodeUpdate, LinkUpdate, NewInodeExtras};
use sqlfs_store::Store;

use crate::attr::{self, file_type};
use crate::blockmath::{self, BLKMASK, BLKSIZE};
use crate::error::{OpsError, Result};

const TTL: Duration = Duration::from_secs(1);

fn trim_trailing_zeros(chunk: &[u8]) -> &[u8] {
    let mut end = chunk.len();
    while end > 0 && chunk[end - 1] == 0 {
        end -= 1;
    }
    &chunk[..end]
}

/// Drop a directory's own "." and ".." link rows. A directory's self-links
/// keep `nlink`/`nchild` at 1/2 even once its primary link and all other
/// references are gone, so anything that removes a directory's last
/// reference (`rmdir`, rename replacing an empty directory) must call this
/// before checking for orphanhood.
fn drop_dir_self_links(conn: &Connection, dir_inode: i64) -> Result<()> {
    if let Some((_, dot)) = store::lookup(conn, dir_inode, b".")? {
        store::delete_link(conn, dot.id)?;
    }
    if let Some((_, dotdot)) = store::lookup(conn, dir_inode, b"..")? {
        store::delete_link(conn, dotdot.id)?;
    }
    Ok(())
}

/// The filesystem. Owns the single store handle used by every request.
pub struct SqlFs {
    store: Store,
}

impl SqlFs {
    /// Wrap an already-opened store.
    pub fn new(store: Store) -> Self {
        SqlFs { store }
    }

    fn getattr_row(&self, inode: i64) -> Result<sqlfs_store::types::InodeRow> {
        self.store
            .read(|conn| store::get_inode(conn, inode))?
            .ok_or(OpsError::Invalid)
    }

    fn lookup_row(&self, parent: i64, name: &[u8]) -> Result<sqlfs_store::types::InodeRow> {
        self.store
            .read(|conn| store::lookup(conn, parent, name))?
            .map(|(row, _link)| row)
            .ok_or(OpsError::NotFound)
    }

    fn create_node(
        &self,
        parent: i64,
        name: &[u8],
        mode: u32,
        uid: u32,
        gid: u32,
        extras: NewInodeExtras,
    ) -> Result<sqlfs_store::types::InodeRow> {
        let now = now_ns();
        let id = self.store.with_transaction(|conn| -> Result<i64> {
            Ok(store::create_inode(conn, parent, name, uid, gid, mode, &extras, now)?)
        })?;
        self.getattr_row(id)
    }

    fn read_bytes(&self, inode: i64, off: u64, size: u64) -> Result<Vec<u8>> {
        let result = self.store.read(|conn| -> Result<Option<Vec<u8>>> {
            let row = match store::get_inode(conn, inode)? {
                Some(r) => r,
                None => return Ok(None),
            };
            if size == 0 || off >= row.size {
                return Ok(Some(Vec::new()));
            }
            let clamped = size.min(row.size - off);
            let (b0, bn) = blockmath::block_range(off, clamped);
            let span = ((bn - b0 + 1) * BLKSIZE) as usize;
            let mut buf = vec![0u8; span];
            for block in store::blocks(conn, inode, b0, bn)? {
                let base = ((block.idx - b0) * BLKSIZE) as usize;
                buf[base..base + block.data.len()].copy_from_slice(&block.data);
            }
            let start = blockmath::offset_in_block(off) as usize;
            let end = start + clamped as usize;
            Ok(Some(buf[start..end].to_vec()))
        })?;
        result.ok_or(OpsError::Invalid)
    }

    fn write_bytes(&self, inode: i64, off: u64, data: &[u8]) -> Result<u32> {
        if data.is_empty() {
            return Ok(0);
        }
        let len = data.len() as u64;
        let end = off + len;
        let (b0, bn) = blockmath::block_range(off, len);
        let now = now_ns();
        self.store.with_transaction(|conn| -> Result<()> {
            let row = store::get_inode(conn, inode)?.ok_or(OpsError::Invalid)?;
            let span = ((bn - b0 + 1) * BLKSIZE) as usize;
            let mut scratch = vec![0u8; span];

            if blockmath::offset_in_block(off) != 0 {
                if let Some(existing) = store::blocks(conn, inode, b0, b0)?.into_iter().next() {
                    scratch[..existing.data.len()].copy_from_slice(&existing.data);
                }
            }
            if blockmath::offset_in_block(end - 1) != BLKMASK {
                if let Some(existing) = store::blocks(conn, inode, bn, bn)?.into_iter().next() {
                    let tail_base = ((bn - b0) * BLKSIZE) as usize;
                    scratch[tail_base..tail_base + existing.data.len()]
                        .copy_from_slice(&existing.data);
                }
            }
            let write_at = (off - b0 * BLKSIZE) as usize;
            scratch[write_at..write_at + data.len()].copy_from_slice(data);

            let rows: Vec<BlockRow> = scratch
                .chunks(BLKSIZE as usize)
                .enumerate()
                .map(|(i, chunk)| BlockRow {
                    inode,
                    idx: b0 + i as u64,
                    data: trim_trailing_zeros(chunk).to_vec(),
                })
                .collect();
            store::update_blocks(conn, &rows)?;

            if end > row.size {
                store::update_inode(
                    conn,
                    inode,
                    &InodeUpdate {
                        size: Some(end),
                        mtime_ns: Some(now),
                        ctime_ns: Some(now),
                        ..Default::default()
                    },
                )?;
            }
            Ok(())
        })?;
        Ok(data.len() as u32)
    }

    fn unlink_entry(&self, parent: i64, name: &[u8], allow_dir: bool) -> Result<()> {
        self.store.with_transaction(|conn| -> Result<()> {
            let (row, link) = store::lookup(conn, parent, name)?.ok_or(OpsError::NotFound)?;
            let is_dir = file_type(row.mode) == FileType::Directory;
            if is_dir && !allow_dir {
                return Err(OpsError::IsADirectory);
            }
            if !is_dir && allow_dir {
                return Err(OpsError::NotADirectory);
            }
            if is_dir && row.nchild > 2 {
                return Err(OpsError::NotEmpty);
            }
            if is_dir {
                drop_dir_self_links(conn, row.id)?;
            }
            store::delete_link(conn, link.id)?;
            store::reclaim_if_orphan(conn, row.id)?;
            Ok(())
        })
    }
}

impl Filesystem for SqlFs {
    fn init(&mut self, _req: &Request<'_>, _config: &mut KernelConfig) -> std::result::Result<(), libc::c_int> {
        log::info!("mounting sqlfs");
        Ok(())
    }

    fn destroy(&mut self) {
        log::info!("unmounting sqlfs");
        if let Err(e) = self.store.shutdown_sweep() {
            log::error!("error during shutdown sweep: {e}");
        }
    }

    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        match self.lookup_row(parent as i64, name.as_bytes()) {
            Ok(row) => reply.entry(&TTL, &attr::to_file_attr(&row), 0),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn forget(&mut self, _req: &Request<'_>, _ino: u64, _nlookup: u64) {
        // Reference counting lives entirely in `link` rows, not kernel
        // lookup counts, so there is nothing to do here.
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyAttr) {
        match self.getattr_row(ino as i64) {
            Ok(row) => reply.attr(&TTL, &attr::to_file_attr(&row)),
            Err(e) => reply.error(e.errno()),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn setattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        _ctime: Option<std::time::SystemTime>,
        _fh: Option<u64>,
        _crtime: Option<std::time::SystemTime>,
        _chgtime: Option<std::time::SystemTime>,
        _bkuptime: Option<std::time::SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        let inode = ino as i64;
        let now = now_ns();
        let to_ns = |t: TimeOrNow| match t {
            TimeOrNow::SpecificTime(st) => st
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_nanos() as i64)
                .unwrap_or(0),
            TimeOrNow::Now => now,
        };
        let result = self.store.with_transaction(|conn| -> Result<()> {
            if store::get_inode(conn, inode)?.is_none() {
                return Err(OpsError::Invalid);
            }
            let fields = InodeUpdate {
                size,
                mode,
                uid,
                gid,
                mtime_ns: mtime.map(to_ns),
                atime_ns: atime.map(to_ns),
                ctime_ns: Some(now),
            };
            if let Some(new_size) = size {
                store::truncate_blocks(conn, inode, new_size >> sqlfs_store::types::BLKSHFT)?;
            }
            store::update_inode(conn, inode, &fields)?;
            Ok(())
        });
        match result {
            Ok(()) => match self.getattr_row(inode) {
                Ok(row) => reply.attr(&TTL, &attr::to_file_attr(&row)),
                Err(e) => reply.error(e.errno()),
            },
            Err(e) => reply.error(e.errno()),
        }
    }

    fn readlink(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyData) {
        match self.getattr_row(ino as i64) {
            Ok(row) => match row.target {
                Some(target) => reply.data(&target),
                None => reply.error(OpsError::Invalid.errno()),
            },
            Err(e) => reply.error(e.errno()),
        }
    }

    fn mknod(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        rdev: u32,
        reply: ReplyEntry,
    ) {
        let extras = NewInodeExtras {
            rdev,
            ..Default::default()
        };
        match self.create_node(parent as i64, name.as_bytes(), mode, req.uid(), req.gid(), extras) {
            Ok(row) => reply.entry(&TTL, &attr::to_file_attr(&row), 0),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn mkdir(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        reply: ReplyEntry,
    ) {
        let full_mode = (mode & 0o7777) | libc::S_IFDIR;
        match self.create_node(
            parent as i64,
            name.as_bytes(),
            full_mode,
            req.uid(),
            req.gid(),
            NewInodeExtras::default(),
        ) {
            Ok(row) => reply.entry(&TTL, &attr::to_file_attr(&row), 0),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn unlink(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        match self.unlink_entry(parent as i64, name.as_bytes(), false) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn rmdir(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        match self.unlink_entry(parent as i64, name.as_bytes(), true) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn symlink(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        link_name: &OsStr,
        target: &Path,
        reply: ReplyEntry,
    ) {
        let target_bytes = target.as_os_str().as_bytes().to_vec();
        let extras = NewInodeExtras {
            size: target_bytes.len() as u64,
            target: Some(target_bytes),
            rdev: 0,
        };
        let mode = 0o777 | libc::S_IFLNK;
        match self.create_node(parent as i64, link_name.as_bytes(), mode, req.uid(), req.gid(), extras) {
            Ok(row) => reply.entry(&TTL, &attr::to_file_attr(&row), 0),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn link(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        newparent: u64,
        newname: &OsStr,
        reply: ReplyEntry,
    ) {
        let inode = ino as i64;
        let result = self.store.with_transaction(|conn| -> Result<()> {
            let row = store::get_inode(conn, inode)?.ok_or(OpsError::Invalid)?;
            if file_type(row.mode) == FileType::Directory {
                return Err(OpsError::IsADirectory);
            }
            store::create_link(conn, inode, newparent as i64, newname.as_bytes())?;
            Ok(())
        });
        match result {
            Ok(()) => match self.getattr_row(inode) {
                Ok(row) => reply.entry(&TTL, &attr::to_file_attr(&row), 0),
                Err(e) => reply.error(e.errno()),
            },
            Err(e) => reply.error(e.errno()),
        }
    }

    fn rename(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        flags: u32,
        reply: ReplyEmpty,
    ) {
        let (parent, newparent) = (parent as i64, newparent as i64);
        let (name, newname) = (name.as_bytes(), newname.as_bytes());
        let noreplace = flags & libc::RENAME_NOREPLACE as u32 != 0;
        let exchange = flags & libc::RENAME_EXCHANGE as u32 != 0;

        let result = self.store.with_transaction(|conn| -> Result<()> {
            let (src_row, src_link) = store::lookup(conn, parent, name)?.ok_or(OpsError::Invalid)?;
            let dest = store::lookup(conn, newparent, newname)?;

            match dest {
                None => {
                    store::update_link(
                        conn,
                        src_link.id,
                        &LinkUpdate {
                            parent_inode: Some(newparent),
                            name: Some(newname.to_vec()),
                            ..Default::default()
                        },
                    )?;
                }
                Some((dest_row, dest_link)) if exchange => {
                    store::update_link(
                        conn,
                        src_link.id,
                        &LinkUpdate {
                            inode: Some(dest_row.id),
                            ..Default::default()
                        },
                    )?;
                    store::update_link(
                        conn,
                        dest_link.id,
                        &LinkUpdate {
                            inode: Some(src_row.id),
                            ..Default::default()
                        },
                    )?;
                }
                Some(_) if noreplace => {
                    return Err(OpsError::Exists);
                }
                Some((dest_row, dest_link)) => {
                    let is_dir = file_type(dest_row.mode) == FileType::Directory;
                    let effective_children = if is_dir {
                        dest_row.nchild.saturating_sub(2)
                    } else {
                        dest_row.nchild
                    };
                    if effective_children > 0 {
                        return Err(OpsError::NotEmpty);
                    }
                    if is_dir {
                        drop_dir_self_links(conn, dest_row.id)?;
                    }
                    store::update_link(
                        conn,
                        dest_link.id,
                        &LinkUpdate {
                            inode: Some(src_row.id),
                            ..Default::default()
                        },
                    )?;
                    store::delete_link(conn, src_link.id)?;
                    store::reclaim_if_orphan(conn, dest_row.id)?;
                }
            }
            Ok(())
        });
        match result {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, _flags: i32, reply: ReplyOpen) {
        reply.opened(ino, 0);
    }

    fn opendir(&mut self, _req: &Request<'_>, ino: u64, _flags: i32, reply: ReplyOpen) {
        reply.opened(ino, 0);
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        match self.read_bytes(ino as i64, offset.max(0) as u64, size as u64) {
            Ok(buf) => reply.data(&buf),
            Err(e) => reply.error(e.errno()),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn write(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        match self.write_bytes(ino as i64, offset.max(0) as u64, data) {
            Ok(n) => reply.written(n),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn flush(&mut self, _req: &Request<'_>, _ino: u64, _fh: u64, _lock_owner: u64, reply: ReplyEmpty) {
        reply.ok();
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        _fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        reply.ok();
    }

    fn fsync(&mut self, _req: &Request<'_>, _ino: u64, _fh: u64, _datasync: bool, reply: ReplyEmpty) {
        reply.ok();
    }

    fn releasedir(&mut self, _req: &Request<'_>, _ino: u64, _fh: u64, _flags: i32, reply: ReplyEmpty) {
        reply.ok();
    }

    fn fsyncdir(&mut self, _req: &Request<'_>, _ino: u64, _fh: u64, _datasync: bool, reply: ReplyEmpty) {
        reply.ok();
    }

    fn readdir(&mut self, _req: &Request<'_>, ino: u64, _fh: u64, offset: i64, mut reply: ReplyDirectory) {
        let result = self.store.read(|conn| store::children(conn, ino as i64, offset));
        match result {
            Ok(entries) => {
                for (row, link) in entries {
                    let full = reply.add(
                        row.id as u64,
                        link.id,
                        file_type(row.mode),
                        OsStr::from_bytes(&link.name),
                    );
                    if full {
                        break;
                    }
                }
                reply.ok();
            }
            Err(e) => reply.error(OpsError::from(e).errno()),
        }
    }

    fn statfs(&mut self, _req: &Request<'_>, _ino: u64, reply: ReplyStatfs) {
        let totals = self.store.read(|conn| store::totals(conn));
        let (ninodes, nblocks) = match totals {
            Ok(t) => t,
            Err(e) => return reply.error(OpsError::from(e).errno()),
        };
        let (bfree, bavail, ffree) = match self.store.path() {
            Some(path) => match nix::sys::statvfs::statvfs(path) {
                Ok(vfs) => (
                    vfs.blocks_free() as u64,
                    vfs.blocks_available() as u64,
                    vfs.files_free() as u64,
                ),
                Err(_) => (1 << 20, 1 << 20, 1 << 20),
            },
            None => (1 << 20, 1 << 20, 1 << 20),
        };
        reply.statfs(
            nblocks + bfree,
            bfree,
            bavail,
            ninodes + ffree,
            ffree,
            BLKSIZE as u32,
            255,
            BLKSIZE as u32,
        );
    }

    fn access(&mut self, _req: &Request<'_>, _ino: u64, _mask: i32, reply: ReplyEmpty) {
        reply.ok();
    }

    fn create(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        _flags: i32,
        reply: ReplyCreate,
    ) {
        let full_mode = (mode & 0o7777) | libc::S_IFREG;
        match self.create_node(
            parent as i64,
            name.as_bytes(),
            full_mode,
            req.uid(),
            req.gid(),
            NewInodeExtras::default(),
        ) {
            Ok(row) => reply.created(&TTL, &attr::to_file_attr(&row), 0, row.id as u64, 0),
            Err(e) => reply.error(e.errno()),
        }
    }
}
