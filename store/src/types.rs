//! Row types exchanged between the store and its callers.
//!
//! One struct per persisted entity (mirroring `inode`/`link`/`block`),
//! plus sparse `*Update` structs that enumerate the fields an update may
//! touch explicitly rather than splicing caller-chosen column names into
//! SQL text.

/// 4096-byte fixed block size. Part of the on-disk contract: changing this
/// would make stored blocks unreadable by any implementation using a
/// different value.
pub const BLKSIZE: u64 = 4096;

/// `BLKSIZE - 1`, handy for masking off the in-block offset of a byte
/// position.
pub const BLKMASK: u64 = BLKSIZE - 1;

/// `log2(BLKSIZE)`, handy for shifting a byte position down to a block
/// index.
pub const BLKSHFT: u32 = 12;

/// A row from `inode`, plus the derived counts computed alongside it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InodeRow {
    /// Primary key.
    pub id: i64,
    /// Numeric owner id.
    pub uid: u32,
    /// Numeric group id.
    pub gid: u32,
    /// Combined file-type bits and permission bits.
    pub mode: u32,
    /// Last-modified time, nanoseconds since the Unix epoch.
    pub mtime_ns: i64,
    /// Last-accessed time, nanoseconds since the Unix epoch.
    pub atime_ns: i64,
    /// Last-changed time, nanoseconds since the Unix epoch.
    pub ctime_ns: i64,
    /// Logical byte length. May exceed the sum of stored block lengths.
    pub size: u64,
    /// Device id for character/block device nodes; 0 otherwise.
    pub rdev: u32,
    /// Symlink destination; `None` for non-symlinks.
    pub target: Option<Vec<u8>>,
    /// Count of `link` rows referencing this inode.
    pub nlink: u32,
    /// Count of `link` rows whose `parent_inode` is this inode.
    pub nchild: u32,
    /// Count of `block` rows belonging to this inode.
    pub nblock: u32,
}

/// A row from `link`, as returned alongside a lookup or directory listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkRow {
    /// Primary key, also used as a readdir cursor.
    pub id: i64,
    /// The inode this entry points at.
    pub inode: i64,
    /// The directory inode containing this entry.
    pub parent_inode: i64,
    /// Entry name within `parent_inode`.
    pub name: Vec<u8>,
}

/// A row from `block`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockRow {
    /// Owning inode.
    pub inode: i64,
    /// 0-based block index within the file.
    pub idx: u64,
    /// Block payload, length in `[1, BLKSIZE]`.
    pub data: Vec<u8>,
}

/// Attributes supplied when creating a new inode, beyond the identity
/// fields (`uid`/`gid`/`mode`) every creation needs.
#[derive(Debug, Clone, Default)]
pub struct NewInodeExtras {
    /// Initial logical size (used by symlink, where it must equal the
    /// target length, and by mknod, where it is 0).
    pub size: u64,
    /// Device id, for `mknod` device nodes.
    pub rdev: u32,
    /// Symlink destination, for `symlink`.
    pub target: Option<Vec<u8>>,
}

/// Sparse update to an inode's attributes. Every field left `None` is left
/// untouched; the enumerated fields keep the `UPDATE` statement's column
/// list fixed, never assembled from caller-chosen column names.
#[derive(Debug, Clone, Default)]
pub struct InodeUpdate {
    /// New logical size, if changing.
    pub size: Option<u64>,
    /// New mode bits, if changing.
    pub mode: Option<u32>,
    /// New owner uid, if changing.
    pub uid: Option<u32>,
    /// New owner gid, if changing.
    pub gid: Option<u32>,
    /// New mtime, if changing.
    pub mtime_ns: Option<i64>,
    /// New atime, if changing.
    pub atime_ns: Option<i64>,
    /// New ctime, if changing.
    pub ctime_ns: Option<i64>,
}

impl InodeUpdate {
    /// True if every field is `None`, i.e. applying this update would be a
    /// no-op.
    pub fn is_empty(&self) -> bool {
        self.size.is_none()
            && self.mode.is_none()
            && self.uid.is_none()
            && self.gid.is_none()
            && self.mtime_ns.is_none()
            && self.atime_ns.is_none()
            && self.ctime_ns.is_none()
    }
}

/// Sparse update to a link row, used by rename.
#[derive(Debug, Clone, Default)]
pub struct LinkUpdate {
    /// New target inode, if changing (plain rename-replace, exchange).
    pub inode: Option<i64>,
    /// New parent directory, if changing.
    pub parent_inode: Option<i64>,
    /// New entry name, if changing.
    pub name: Option<Vec<u8>>,
}
