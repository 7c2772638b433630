//! End-to-end scenarios against the store and the pure helpers in this
//! crate, exercising the same algorithms `ops.rs` builds on top of
//! (block geometry, attribute translation, rename's branches) without
//! going through an actual kernel mount.

use sqlfs::attr;
use sqlfs::blockmath;
use sqlfs_store::schema;
use sqlfs_store::store;
use sqlfs_store::types::{BlockRow, InodeUpdate, LinkUpdate, NewInodeExtras};
use sqlfs_store::Store;
use tempfile::NamedTempFile;

/// Each test gets its own temporary SQLite file, so the suite can run in
/// parallel without tests contending over a single database. The returned
/// `NamedTempFile` must stay alive for the duration of the test: dropping
/// it deletes the backing file out from under the open connection.
fn memstore() -> (Store, NamedTempFile) {
    let file = NamedTempFile::new().expect("create temp db file");
    let store = Store::open(Some(file.path()), None).expect("open file-backed store");
    (store, file)
}

#[test]
fn touch_creates_empty_regular_file_with_one_link() {
    let (s, _tmp) = memstore();
    let id = s
        .with_transaction(|conn| {
            store::create_inode(
                conn,
                schema::ROOT_INODE,
                b"touched",
                1000,
                1000,
                0o100_644,
                &NewInodeExtras::default(),
                store::now_ns(),
            )
        })
        .unwrap();

    s.read(|conn| {
        let (row, link) = store::lookup(conn, schema::ROOT_INODE, b"touched")?.expect("exists");
        assert_eq!(row.id, id);
        assert_eq!(row.size, 0);
        assert_eq!(row.nlink, 1);
        assert_eq!(link.name, b"touched");
        assert_eq!(attr::file_type(row.mode), fuser::FileType::RegularFile);
        Ok(())
    })
    .unwrap();
}

#[test]
fn mkdir_nesting_tracks_parent_and_child_counts() {
    let (s, _tmp) = memstore();
    let a = s
        .with_transaction(|conn| {
            store::create_inode(
                conn,
                schema::ROOT_INODE,
                b"a",
                0,
                0,
                0o040_755,
                &NewInodeExtras::default(),
                store::now_ns(),
            )
        })
        .unwrap();
    let b = s
        .with_transaction(|conn| {
            store::create_inode(conn, a, b"b", 0, 0, 0o040_755, &NewInodeExtras::default(), store::now_ns())
        })
        .unwrap();

    s.read(|conn| {
        let row_a = store::get_inode(conn, a)?.expect("a exists");
        // ".", "..", and "b" live under a.
        assert_eq!(row_a.nchild, 3);
        let children = store::children(conn, a, 0)?;
        assert!(children.iter().any(|(row, link)| row.id == b && link.name == b"b"));
        let row_b = store::get_inode(conn, b)?.expect("b exists");
        assert_eq!(row_b.nchild, 2); // "." and ".." inside b
        Ok(())
    })
    .unwrap();
}

#[test]
fn hardlink_survives_removal_of_either_name() {
    let (s, _tmp) = memstore();
    let id = s
        .with_transaction(|conn| {
            store::create_inode(
                conn,
                schema::ROOT_INODE,
                b"x",
                0,
                0,
                0o100_644,
                &NewInodeExtras::default(),
                store::now_ns(),
            )
        })
        .unwrap();
    s.with_transaction(|conn| store::create_link(conn, id, schema::ROOT_INODE, b"y"))
        .unwrap();

    s.with_transaction(|conn| {
        let (_, link_x) = store::lookup(conn, schema::ROOT_INODE, b"x")?.expect("x exists");
        store::delete_link(conn, link_x.id)?;
        let reclaimed = store::reclaim_if_orphan(conn, id)?;
        assert!(!reclaimed, "y still references the inode");
        Ok::<_, sqlfs_store::StoreError>(())
    })
    .unwrap();

    s.read(|conn| {
        let (row, _) = store::lookup(conn, schema::ROOT_INODE, b"y")?.expect("y still exists");
        assert_eq!(row.id, id);
        assert_eq!(row.nlink, 1);
        Ok(())
    })
    .unwrap();
}

#[test]
fn block_straddling_write_reads_back_exactly() {
    let (s, _tmp) = memstore();
    let id = s
        .with_transaction(|conn| {
            store::create_inode(
                conn,
                schema::ROOT_INODE,
                b"data",
                0,
                0,
                0o100_644,
                &NewInodeExtras::default(),
                store::now_ns(),
            )
        })
        .unwrap();

    // A write spanning the boundary between block 0 and block 1.
    let off = blockmath::BLKSIZE - 10;
    let payload = vec![0xABu8; 20];
    let (b0, bn) = blockmath::block_range(off, payload.len() as u64);
    assert_eq!((b0, bn), (0, 1));

    s.with_transaction(|conn| {
        store::update_blocks(
            conn,
            &[
                BlockRow { inode: id, idx: 0, data: vec![0u8; blockmath::BLKSIZE as usize - 10] },
                BlockRow { inode: id, idx: 1, data: payload.clone() },
            ],
        )?;
        store::update_inode(
            conn,
            id,
            &InodeUpdate { size: Some(off + payload.len() as u64), ..Default::default() },
        )
    })
    .unwrap();

    s.read(|conn| {
        let stored = store::blocks(conn, id, 0, 1)?;
        assert_eq!(stored.len(), 2);
        assert_eq!(stored[1].data, vec![0xABu8; 20]);
        let row = store::get_inode(conn, id)?.expect("data exists");
        assert_eq!(row.size, off + 20);
        Ok(())
    })
    .unwrap();
}

#[test]
fn sparse_write_then_truncate_drops_only_tail_blocks() {
    let (s, _tmp) = memstore();
    let id = s
        .with_transaction(|conn| {
            store::create_inode(
                conn,
                schema::ROOT_INODE,
                b"sparse",
                0,
                0,
                0o100_644,
                &NewInodeExtras::default(),
                store::now_ns(),
            )
        })
        .unwrap();

    // Only block index 5 is ever written; size reflects a file ten blocks long.
    s.with_transaction(|conn| {
        store::update_blocks(conn, &[BlockRow { inode: id, idx: 5, data: vec![9u8; 100] }])?;
        store::update_inode(
            conn,
            id,
            &InodeUpdate { size: Some(10 * blockmath::BLKSIZE), ..Default::default() },
        )
    })
    .unwrap();

    s.read(|conn| {
        let holes = store::blocks(conn, id, 0, 4)?;
        assert!(holes.is_empty(), "unwritten blocks have no stored row");
        Ok(())
    })
    .unwrap();

    // Truncate down to 3 blocks: the sparse block at index 5 must be dropped.
    s.with_transaction(|conn| {
        store::truncate_blocks(conn, id, 2)?;
        store::update_inode(
            conn,
            id,
            &InodeUpdate { size: Some(3 * blockmath::BLKSIZE), ..Default::default() },
        )
    })
    .unwrap();

    s.read(|conn| {
        let remaining = store::blocks(conn, id, 0, 10)?;
        assert!(remaining.is_empty());
        let row = store::get_inode(conn, id)?.expect("sparse exists");
        assert_eq!(row.size, 3 * blockmath::BLKSIZE);
        Ok(())
    })
    .unwrap();
}

#[test]
fn rename_replace_onto_empty_directory_reclaims_destination() {
    let (s, _tmp) = memstore();
    let src = s
        .with_transaction(|conn| {
            store::create_inode(conn, schema::ROOT_INODE, b"src", 0, 0, 0o040_755, &NewInodeExtras::default(), store::now_ns())
        })
        .unwrap();
    let dest = s
        .with_transaction(|conn| {
            store::create_inode(conn, schema::ROOT_INODE, b"dest", 0, 0, 0o040_755, &NewInodeExtras::default(), store::now_ns())
        })
        .unwrap();

    s.with_transaction(|conn| {
        let (src_row, src_link) = store::lookup(conn, schema::ROOT_INODE, b"src")?.expect("src exists");
        let (dest_row, dest_link) = store::lookup(conn, schema::ROOT_INODE, b"dest")?.expect("dest exists");

        // Empty directory: only "." and ".." as children.
        assert_eq!(dest_row.nchild.saturating_sub(2), 0);

        store::update_link(conn, dest_link.id, &LinkUpdate { inode: Some(src_row.id), ..Default::default() })?;
        store::delete_link(conn, src_link.id)?;
        let reclaimed = store::reclaim_if_orphan(conn, dest_row.id)?;
        assert!(reclaimed);
        Ok::<_, sqlfs_store::StoreError>(())
    })
    .unwrap();

    s.read(|conn| {
        assert!(store::get_inode(conn, dest)?.is_none(), "replaced directory's inode is gone");
        let (row, _) = store::lookup(conn, schema::ROOT_INODE, b"dest")?.expect("dest name now points at src's inode");
        assert_eq!(row.id, src);
        assert!(store::lookup(conn, schema::ROOT_INODE, b"src")?.is_none(), "old name is gone");
        Ok(())
    })
    .unwrap();
}

#[test]
fn symlink_size_is_target_length_not_name_length() {
    let (s, _tmp) = memstore();
    let target = b"/a/much/longer/target/path/than/the/link/name".to_vec();
    let extras = NewInodeExtras {
        size: target.len() as u64,
        target: Some(target.clone()),
        rdev: 0,
    };
    let id = s
        .with_transaction(|conn| {
            store::create_inode(conn, schema::ROOT_INODE, b"ln", 0, 0, 0o120_777, &extras, store::now_ns())
        })
        .unwrap();

    s.read(|conn| {
        let row = store::get_inode(conn, id)?.expect("symlink exists");
        assert_eq!(row.size, target.len() as u64);
        assert_ne!(row.size, b"ln".len() as u64);
        assert_eq!(row.target.as_deref(), Some(target.as_slice()));
        assert_eq!(attr::file_type(row.mode), fuser::FileType::Symlink);
        Ok(())
    })
    .unwrap();
}
