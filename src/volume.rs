//! The mounted volume: superblock, the three bitmaps, and the host contracts bound together.
//! Corresponds to `fill_super`/`sync_fs`/`statfs`/`put_super` (§4.7 Super/Mount).

use std::sync::Arc;

use spin::RwLock;

use crate::bitmap::Bitmap;
use crate::error::{Error, Result};
use crate::host::{BlockCache, InodeCache, Quiesce};
use crate::layout::{Superblock, BLOCK_SIZE, MAGIC};

/// The four block categories the refcount/CoW layer dispatches on (§4.2). Not recoverable from
/// the block's own bytes; callers must always supply it explicitly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockCategory {
    Data,
    Index,
    Dir,
    InodeData,
}

pub struct Volume {
    pub sb: RwLock<Superblock>,
    pub ifree: Bitmap,
    pub bfree: Bitmap,
    pub idfree: Bitmap,
    pub cache: Arc<dyn BlockCache>,
    pub quiesce: Arc<dyn Quiesce>,
    pub inodes: Arc<dyn InodeCache>,
    /// Stands in for the host's per-metadata-buffer latch (§5): the `BlockCache` contract this
    /// core consumes is a coarse synchronous read/write pair rather than a pin/dirty/release
    /// API, so a single latch serializing metadata read-modify-write spans is sufficient to
    /// uphold "never hold two metadata latches simultaneously" without losing concurrency that
    /// the contract could express anyway.
    pub(crate) meta_latch: spin::Mutex<()>,
}

/// Root inode number, fixed by convention (inode 0 is reserved as a sentinel).
pub const ROOT_INO: u32 = 1;
/// The `idx` handle the root directory's inode-data record occupies in a freshly formatted
/// volume.
pub const ROOT_IDX: u32 = 1;

pub fn statfs_report(sb: &Superblock) -> StatFs {
    StatFs {
        block_size: BLOCK_SIZE as u32,
        blocks_total: sb.nr_blocks,
        blocks_free: sb.nr_free_blocks,
        inodes_total: sb.nr_inodes,
        inodes_free: sb.nr_free_inodes,
        name_len_max: crate::layout::FILENAME_LEN as u32,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatFs {
    pub block_size: u32,
    pub blocks_total: u32,
    pub blocks_free: u32,
    pub inodes_total: u32,
    pub inodes_free: u32,
    pub name_len_max: u32,
}

impl Volume {
    /// `fill_super`: reads block 0, verifies the magic, reconstructs the in-memory bitmaps from
    /// their on-disk regions, and hands back a mounted volume. The caller still has to verify
    /// the root inode separately (`Volume::root`), same split the original `fill_super` makes
    /// between superblock validation and root-inode validation.
    pub fn mount(
        cache: Arc<dyn BlockCache>,
        quiesce: Arc<dyn Quiesce>,
        inodes: Arc<dyn InodeCache>,
    ) -> Result<Self> {
        let block0 = cache.read(0)?;
        // `block0` is exactly BLOCK_SIZE bytes and Superblock is const_assert'd to the same size,
        // so read_from can only fail by returning None, which the Io mapping below covers.
        let sb: Superblock = crate::layout::read_from(&block0[..]).ok_or(Error::Io)?;
        if sb.magic != MAGIC {
            log::error!("volume: bad magic {:#x}", sb.magic);
            return Err(Error::Invalid);
        }

        let ifree = load_bitmap(&*cache, sb.ifree_start(), sb.nr_ifree_blocks, sb.nr_inodes as usize)?;
        let bfree = load_bitmap(&*cache, sb.bfree_start(), sb.nr_bfree_blocks, sb.nr_blocks as usize)?;
        let idfree = load_bitmap(
            &*cache,
            sb.idfree_start(),
            sb.nr_idfree_blocks,
            sb.nr_inode_data_entries as usize,
        )?;

        Ok(Self {
            sb: RwLock::new(sb),
            ifree,
            bfree,
            idfree,
            cache,
            quiesce,
            inodes,
            meta_latch: spin::Mutex::new(()),
        })
    }

    /// `sync_fs`: writes the superblock counters/snapshot table and the three bitmaps back to
    /// disk. `wait` is accepted for interface symmetry with the design; this host has no
    /// write-back cache to flush asynchronously, so every write is already synchronous.
    pub fn sync_fs(&self, _wait: bool) -> Result<()> {
        let sb = self.sb.read();
        let mut block0 = [0u8; BLOCK_SIZE];
        block0[..core::mem::size_of::<Superblock>()].copy_from_slice(zerocopy::AsBytes::as_bytes(&*sb));
        self.cache.write(0, &block0)?;
        store_bitmap(&*self.cache, sb.ifree_start(), sb.nr_ifree_blocks, &self.ifree)?;
        store_bitmap(&*self.cache, sb.bfree_start(), sb.nr_bfree_blocks, &self.bfree)?;
        store_bitmap(&*self.cache, sb.idfree_start(), sb.nr_idfree_blocks, &self.idfree)?;
        Ok(())
    }

    pub fn statfs(&self) -> StatFs {
        statfs_report(&self.sb.read())
    }

    pub fn live_snapshot_id(&self) -> u32 {
        self.sb.read().live_snapshot_id()
    }
}

fn load_bitmap(cache: &dyn BlockCache, start: u32, nr_blocks: u32, len: usize) -> Result<Bitmap> {
    let mut bytes = Vec::with_capacity(nr_blocks as usize * BLOCK_SIZE);
    for i in 0..nr_blocks {
        bytes.extend_from_slice(&cache.read(start + i)?);
    }
    Ok(Bitmap::from_bytes(&bytes, len))
}

fn store_bitmap(cache: &dyn BlockCache, start: u32, nr_blocks: u32, bm: &Bitmap) -> Result<()> {
    let bytes = bm.to_bytes();
    for i in 0..nr_blocks {
        let mut block = [0u8; BLOCK_SIZE];
        let off = i as usize * BLOCK_SIZE;
        let end = (off + BLOCK_SIZE).min(bytes.len());
        if off < bytes.len() {
            block[..end - off].copy_from_slice(&bytes[off..end]);
        }
        cache.write(start + i, &block)?;
    }
    Ok(())
}

/// Used only by the format tool, which builds a superblock from scratch rather than reading one.
pub fn fresh_layout(nr_blocks: u32, inode_ratio: u32) -> Superblock {
    crate::layout::compute_layout_with(nr_blocks, inode_ratio)
}
