//! Universal invariants (§8), exercised with `proptest` over randomized operation sequences on
//! a freshly mounted in-memory volume.

mod common;

use common::{mount_fresh, root};
use proptest::prelude::*;
use wccowfs::error::Error;
use wccowfs::layout::{B32, MAX_SUBFILES, S_IFREG};
use wccowfs::volume::BlockCategory;

#[derive(Debug, Clone, Copy)]
enum BlockOp {
    Alloc,
    Get(usize),
    Put(usize),
}

fn block_op() -> impl Strategy<Value = BlockOp> {
    prop_oneof![
        Just(BlockOp::Alloc),
        (0usize..16).prop_map(BlockOp::Get),
        (0usize..16).prop_map(BlockOp::Put),
    ]
}

proptest! {
    /// Invariant 1 & 4: `bfree_bit(bno) == 0 <=> refcount[bno] > 0`, and the free-block counter
    /// always equals the number of blocks with a live refcount. `Get`/`Put` are only ever
    /// applied to blocks the model still considers live, matching how the core itself only
    /// calls `get_block`/`put_block` on blocks a caller still holds a reference to.
    #[test]
    fn bfree_matches_refcount(ops in proptest::collection::vec(block_op(), 1..40)) {
        let v = mount_fresh(512);
        let mut live: std::collections::HashMap<u32, u32> = std::collections::HashMap::new();

        for op in ops {
            match op {
                BlockOp::Alloc => {
                    if let Ok(bno) = v.alloc_block() {
                        live.insert(bno, 1);
                    }
                }
                BlockOp::Get(i) => {
                    if !live.is_empty() {
                        let bno = *live.keys().nth(i % live.len()).unwrap();
                        v.get_block(bno).unwrap();
                        *live.get_mut(&bno).unwrap() += 1;
                    }
                }
                BlockOp::Put(i) => {
                    if !live.is_empty() {
                        let bno = *live.keys().nth(i % live.len()).unwrap();
                        v.put_block(bno, BlockCategory::Data).unwrap();
                        let rc = live.get_mut(&bno).unwrap();
                        *rc -= 1;
                        if *rc == 0 {
                            live.remove(&bno);
                        }
                    }
                }
            }
        }

        let data_start = v.sb.read().data_start();
        let nr_blocks = v.sb.read().nr_blocks;
        let mut live_count = 0u32;
        for bno in data_start..nr_blocks {
            let rc = v.block_refcount(bno).unwrap();
            let is_free = v.bfree.is_free(bno as usize);
            prop_assert_eq!(rc == 0, is_free, "bno {} refcount {} free {}", bno, rc, is_free);
            if rc > 0 {
                live_count += 1;
            }
        }
        prop_assert_eq!(v.sb.read().nr_free_blocks, nr_blocks - data_start - live_count);
    }

    /// Invariant 7: a name inserted into a directory resolves to the same inode until unlinked,
    /// after which lookup fails with ENOENT.
    #[test]
    fn name_roundtrip(name_suffix in 0u32..1000) {
        let v = mount_fresh(256);
        let mut dir = root(&v);
        let name = format!("f{}", name_suffix);

        let child = v.create_child(&mut dir, &name, S_IFREG | 0o644).unwrap();
        let found = v.lookup(&dir, &name).unwrap();
        prop_assert_eq!(found.ino, child.ino);

        v.unlink_child(&mut dir, &name).unwrap();
        prop_assert!(matches!(v.lookup(&dir, &name), Err(Error::NotFound)));
    }

    /// Invariant 9: writing exactly at `B32` (4 MiB) is EFBIG; writing at `B32 - 1` succeeds.
    #[test]
    fn max_file_size_boundary(_seed in 0u32..4) {
        let v = mount_fresh(4096);
        let mut dir = root(&v);
        let mut f = v.create_child(&mut dir, "big", S_IFREG | 0o644).unwrap();

        prop_assert!(matches!(v.file_get_block(&mut f, B32, true, false), Err(Error::FileTooBig)));
        prop_assert!(v.file_get_block(&mut f, B32 - 1, true, false).unwrap().is_some());
    }
}

/// Invariant 8: the `(MAX_SUBFILES + 1)`-th entry in a directory is always EMLINK, regardless of
/// which names were used to fill it.
#[test]
fn full_directory_is_emlink_regardless_of_names() {
    let v = mount_fresh(4096);
    let mut dir = root(&v);
    for i in 0..MAX_SUBFILES {
        let name = format!("entry-{:03}", i);
        v.create_child(&mut dir, &name, S_IFREG | 0o644).unwrap();
    }
    assert!(matches!(
        v.create_child(&mut dir, "one-too-many", S_IFREG | 0o644),
        Err(Error::TooManyLinks)
    ));
}

/// Invariant 6 (snapshot laws): create; delete is the identity on the named-snapshot set and on
/// live directory contents.
#[test]
fn snapshot_create_then_delete_is_identity() {
    let v = mount_fresh(1024);
    let mut dir = root(&v);
    v.create_child(&mut dir, "a", S_IFREG | 0o644).unwrap();

    let before = v.snapshot_list();
    let id = v.snapshot_create(0).unwrap();
    v.snapshot_delete(id).unwrap();
    let after = v.snapshot_list();

    assert_eq!(before, after);
    assert!(v.lookup(&dir, "a").is_ok());
}
