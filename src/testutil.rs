//! Shared unit-test fixture: an in-memory volume formatted the same way `mkfs-wccowfs` formats a
//! real one. Test-only; every module's `#[cfg(test)]` block mounts through this instead of
//! hand-rolling its own `MemBlockCache`/bitmap setup, so they can't drift from how a real volume
//! gets formatted (and, in particular, all three bitmaps are properly freed rather than left as
//! the zeroed bytes a bare `MemBlockCache::new` starts with).

use std::sync::Arc;

use crate::host::{BlockCache, MapInodeCache, MemBlockCache, NullQuiesce};
use crate::layout::{compute_layout, InodeRecord, BLOCK_SIZE, MAX_SNAPSHOTS};
use crate::volume::Volume;

pub(crate) fn mount_test_volume(nr_blocks: u32) -> Volume {
    let sb = compute_layout(nr_blocks);
    let cache = Arc::new(MemBlockCache::new(nr_blocks as usize));

    let mut block0 = [0u8; BLOCK_SIZE];
    block0[..core::mem::size_of::<crate::layout::Superblock>()]
        .copy_from_slice(zerocopy::AsBytes::as_bytes(&sb));
    cache.write(0, &block0).unwrap();

    crate::bitmap::format_bitmap(&*cache, sb.ifree_start(), sb.nr_ifree_blocks, sb.nr_inodes as usize, 0)
        .unwrap();
    crate::bitmap::format_bitmap(
        &*cache,
        sb.bfree_start(),
        sb.nr_bfree_blocks,
        sb.nr_blocks as usize,
        sb.data_start() as usize,
    )
    .unwrap();
    crate::bitmap::format_bitmap(
        &*cache,
        sb.idfree_start(),
        sb.nr_idfree_blocks,
        sb.nr_inode_data_entries as usize,
        0,
    )
    .unwrap();

    let v = Volume::mount(cache, Arc::new(NullQuiesce), Arc::new(MapInodeCache::new())).unwrap();
    v.ifree.alloc(); // reserve ino 1 the way mkfs does
    v.write_inode_record(1, &InodeRecord { i_data: [0; MAX_SNAPSHOTS] })
        .unwrap();
    v
}
