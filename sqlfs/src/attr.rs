//! Translate an [`InodeRow`] into the attribute reply structures `fuser`
//! expects, and the small set of mode-bit helpers the operations layer
//! needs to build new inodes.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use fuser::{FileAttr, FileType};
use sqlfs_store::types::InodeRow;

const S_IFMT: u32 = 0o170_000;

/// Classify `mode`'s file-type bits into the `fuser::FileType` the reply
/// structures need.
pub fn file_type(mode: u32) -> FileType {
    match mode & S_IFMT {
        libc::S_IFDIR => FileType::Directory,
        libc::S_IFLNK => FileType::Symlink,
        libc::S_IFCHR => FileType::CharDevice,
        libc::S_IFBLK => FileType::BlockDevice,
        libc::S_IFIFO => FileType::NamedPipe,
        libc::S_IFSOCK => FileType::Socket,
        _ => FileType::RegularFile,
    }
}

fn system_time_from_ns(ns: i64) -> SystemTime {
    if ns >= 0 {
        UNIX_EPOCH + Duration::from_nanos(ns as u64)
    } else {
        UNIX_EPOCH - Duration::from_nanos((-ns) as u64)
    }
}

/// Build the `fuser::FileAttr` reply for an inode row.
pub fn to_file_attr(row: &InodeRow) -> FileAttr {
    FileAttr {
        ino: row.id as u64,
        size: row.size,
        blocks: row.nblock as u64,
        atime: system_time_from_ns(row.atime_ns),
        mtime: system_time_from_ns(row.mtime_ns),
        ctime: system_time_from_ns(row.ctime_ns),
        crtime: system_time_from_ns(row.ctime_ns),
        kind: file_type(row.mode),
        perm: (row.mode & 0o7777) as u16,
        nlink: row.nlink,
        uid: row.uid,
        gid: row.gid,
        rdev: row.rdev,
        blksize: sqlfs_store::types::BLKSIZE as u32,
        flags: 0,
    }
}
