//! Block-alignment arithmetic shared by `read`/`write`/`setattr`.

pub use sqlfs_store::types::{BLKMASK, BLKSHFT, BLKSIZE};

/// Block index containing byte offset `off`.
pub fn block_of(off: u64) -> u64 {
    off >> BLKSHFT
}

/// Offset of `off` within its block.
pub fn offset_in_block(off: u64) -> u64 {
    off & BLKMASK
}

/// Inclusive `[first, last]` block range covering `len` bytes starting at
/// `off`. Callers must ensure `len > 0`.
pub fn block_range(off: u64, len: u64) -> (u64, u64) {
    let first = block_of(off);
    let last = block_of(off + len - 1);
    (first, last)
}
