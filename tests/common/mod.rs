//! Shared scaffolding for the integration test suite: an in-memory volume bootstrapped the same
//! way `mkfs-wccowfs` bootstraps a real one, plus byte-level read/write built on `file_get_block`
//! (the crate itself only exposes block-granularity mapping, matching §4.5).

use std::sync::Arc;

use wccowfs::error::Result;
use wccowfs::host::{BlockCache, MapInodeCache, MemBlockCache, NullQuiesce};
use wccowfs::layout::{compute_layout, BLOCK_SIZE, S_IFDIR};
use wccowfs::{InodeHandle, Volume, ROOT_INO};

pub fn mount_fresh(nr_blocks: u32) -> Volume {
    let sb = compute_layout(nr_blocks);
    let cache = Arc::new(MemBlockCache::new(nr_blocks as usize));

    let mut block0 = [0u8; BLOCK_SIZE];
    block0[..core::mem::size_of::<wccowfs::layout::Superblock>()]
        .copy_from_slice(zerocopy::AsBytes::as_bytes(&sb));
    cache.write(0, &block0).unwrap();

    for i in 0..sb.nr_istore_blocks {
        cache.write(sb.istore_start() + i, &wccowfs::layout::ZERO_BLOCK).unwrap();
    }
    for i in 0..sb.nr_ididx_blocks {
        cache.write(sb.ididx_start() + i, &wccowfs::layout::ZERO_BLOCK).unwrap();
    }
    for i in 0..sb.nr_meta_blocks {
        cache.write(sb.meta_start() + i, &wccowfs::layout::ZERO_BLOCK).unwrap();
    }
    wccowfs::bitmap::format_bitmap(&*cache, sb.ifree_start(), sb.nr_ifree_blocks, sb.nr_inodes as usize, 0)
        .unwrap();
    // bfree is addressed by absolute block number, so the metadata regions before data_start()
    // must be pre-reserved the same way the format tool does.
    wccowfs::bitmap::format_bitmap(
        &*cache,
        sb.bfree_start(),
        sb.nr_bfree_blocks,
        sb.nr_blocks as usize,
        sb.data_start() as usize,
    )
    .unwrap();
    wccowfs::bitmap::format_bitmap(
        &*cache,
        sb.idfree_start(),
        sb.nr_idfree_blocks,
        sb.nr_inode_data_entries as usize,
        0,
    )
    .unwrap();

    let volume = Volume::mount(cache, Arc::new(NullQuiesce), Arc::new(MapInodeCache::new())).unwrap();

    volume.ifree.alloc();
    let mut root = volume.ifill(ROOT_INO, true).unwrap();
    let dir_block = volume.alloc_block().unwrap();
    root.data.mode = S_IFDIR | 0o775;
    root.data.size = BLOCK_SIZE as u64;
    root.data.blocks = 1;
    root.data.nlink = 2;
    root.data.index_block = dir_block;
    root.data.refcount = 1;
    volume.writeback(&root).unwrap();
    volume.sync_fs(true).unwrap();
    volume
}

pub fn root(v: &Volume) -> InodeHandle {
    v.iget(ROOT_INO, false).unwrap()
}

pub fn write_at(v: &Volume, inode: &mut InodeHandle, offset: u64, data: &[u8]) -> Result<()> {
    let block_size = BLOCK_SIZE as u64;
    let mut written = 0usize;
    while written < data.len() {
        let pos = offset + written as u64;
        let iblock = (pos / block_size) as usize;
        let within = (pos % block_size) as usize;
        let bno = v.file_get_block(inode, iblock, true, true)?.expect("allocated");
        let mut block = v.cache.read(bno)?;
        let n = (BLOCK_SIZE - within).min(data.len() - written);
        block[within..within + n].copy_from_slice(&data[written..written + n]);
        v.cache.write(bno, &block)?;
        written += n;
    }
    let new_size = (offset + data.len() as u64).max(inode.data.size);
    v.reconcile_size(inode, new_size)
}

pub fn read_at(v: &Volume, inode: &InodeHandle, offset: u64, len: usize) -> Vec<u8> {
    let block_size = BLOCK_SIZE as u64;
    let mut out = vec![0u8; len];
    let mut read = 0usize;
    let mut scratch = *inode;
    while read < len {
        let pos = offset + read as u64;
        let iblock = (pos / block_size) as usize;
        let within = (pos % block_size) as usize;
        let n = (BLOCK_SIZE - within).min(len - read);
        if let Some(bno) = v.file_get_block(&mut scratch, iblock, false, false).unwrap() {
            let block = v.cache.read(bno).unwrap();
            out[read..read + n].copy_from_slice(&block[within..within + n]);
        }
        read += n;
    }
    out
}
