//! Block refcount & CoW (§4.2). Direct generalization of the source's `block.c`
//! (`ouichefs_alloc_block` / `ouichefs_get_block` / `ouichefs_cow_block` / `ouichefs_put_block`).

use crate::error::{Error, Result};
use crate::layout::{MetaBlock, U32Block, BLOCK_SIZE};
use crate::volume::{BlockCategory, Volume};

impl Volume {
    /// `alloc_block`: allocate via bfree, set the new block's refcount to 1. `bfree` is indexed
    /// by absolute block number, the same scheme as `write_bfree_blocks`/`get_free_block` in the
    /// source mkfs, where bits `[0, data_start)` are pre-reserved as permanently allocated.
    pub fn alloc_block(&self) -> Result<u32> {
        let bno = self.bfree.alloc().ok_or(Error::NoSpace)? as u32;
        log::debug!("alloc_block: allocated {}", bno);

        let guard = self.meta_latch.lock();
        let result = (|| {
            let meta_bno = self.sb.read().meta_block(bno);
            let shift = self.sb.read().meta_shift(bno);
            let mut meta = self.read_meta(meta_bno)?;
            meta.refcount[shift] = 1;
            self.write_meta(meta_bno, &meta)
        })();
        drop(guard);

        if result.is_err() {
            self.bfree.free(bno as usize);
            return Err(Error::Io);
        }
        {
            let mut sb = self.sb.write();
            sb.nr_free_blocks = sb.nr_free_blocks.saturating_sub(1);
        }
        self.zero_block(bno)?;
        Ok(bno)
    }

    /// `get_block`: increment refcount on an already-allocated block.
    pub fn get_block(&self, bno: u32) -> Result<()> {
        if bno < self.sb.read().data_start() {
            log::debug!("get_block: invalid bno {}", bno);
            return Err(Error::Invalid);
        }
        let _guard = self.meta_latch.lock();
        let meta_bno = self.sb.read().meta_block(bno);
        let shift = self.sb.read().meta_shift(bno);
        let mut meta = self.read_meta(meta_bno)?;
        let old = meta.refcount[shift];
        meta.refcount[shift] = old.saturating_add(1);
        log::debug!("get_block: refcount of {}: {} -> {}", bno, old, meta.refcount[shift]);
        self.write_meta(meta_bno, &meta)
    }

    /// `cow_block`: returns `Ok(false)` if no copy was necessary (sole owner), `Ok(true)` if a
    /// private copy was made and `*bno` now points at it.
    pub fn cow_block(&self, bno: &mut u32, category: BlockCategory) -> Result<bool> {
        let data_start = self.sb.read().data_start();
        if *bno < data_start {
            log::warn!("cow_block: invalid bno {}", bno);
            return Err(Error::Invalid);
        }
        let old_bno = *bno;

        let refcount_after_dec = {
            let _guard = self.meta_latch.lock();
            let meta_bno = self.sb.read().meta_block(old_bno);
            let shift = self.sb.read().meta_shift(old_bno);
            let mut meta = self.read_meta(meta_bno)?;
            if meta.refcount[shift] <= 1 {
                log::debug!("cow_block: refcount of {} is 1, no copy needed", old_bno);
                return Ok(false);
            }
            meta.refcount[shift] -= 1;
            self.write_meta(meta_bno, &meta)?;
            meta.refcount[shift]
        };
        log::debug!(
            "cow_block: refcount of {} is {} after decrement, CoWing it",
            old_bno,
            refcount_after_dec + 1
        );

        let old_data = self.cache.read(old_bno)?;

        // alloc_block is issued only after the original metadata latch above has been released.
        let new_bno = match self.alloc_block() {
            Ok(b) => b,
            Err(e) => {
                // Restore the refcount we optimistically decremented.
                let _guard = self.meta_latch.lock();
                let meta_bno = self.sb.read().meta_block(old_bno);
                let shift = self.sb.read().meta_shift(old_bno);
                if let Ok(mut meta) = self.read_meta(meta_bno) {
                    meta.refcount[shift] += 1;
                    let _ = self.write_meta(meta_bno, &meta);
                }
                return Err(e);
            }
        };
        self.cache.write(new_bno, &old_data)?;

        if category == BlockCategory::Index {
            let index = read_u32_block(&old_data);
            for &child in index.entries.iter() {
                if child == 0 {
                    break;
                }
                // Safety (per the design's locking discipline): no metadata latch is held here.
                self.get_block(child)?;
            }
        }

        *bno = new_bno;
        Ok(true)
    }

    /// `put_block`: decrement refcount; free (and recurse into INDEX children) when it hits 0.
    pub fn put_block(&self, bno: u32, category: BlockCategory) -> Result<()> {
        let data_start = self.sb.read().data_start();
        if bno < data_start {
            log::debug!("put_block: invalid bno {}", bno);
            return Ok(());
        }

        let became_free = {
            let _guard = self.meta_latch.lock();
            let meta_bno = self.sb.read().meta_block(bno);
            let shift = self.sb.read().meta_shift(bno);
            let mut meta = self.read_meta(meta_bno)?;
            let was_zero_already = meta.refcount[shift] == 0;
            if was_zero_already {
                log::warn!("put_block: refcount underflow on {}", bno);
            }
            let free_now = meta.refcount[shift] <= 1;
            meta.refcount[shift] = meta.refcount[shift].saturating_sub(1);
            self.write_meta(meta_bno, &meta)?;
            free_now && !was_zero_already
        };

        if became_free {
            if category == BlockCategory::Index {
                let data = self.cache.read(bno)?;
                let index = read_u32_block(&data);
                for &child in index.entries.iter() {
                    if child == 0 {
                        break;
                    }
                    self.put_block(child, BlockCategory::Data)?;
                }
            }
            self.zero_block(bno)?;
            self.bfree.free(bno as usize);
            {
                let mut sb = self.sb.write();
                sb.nr_free_blocks = sb.nr_free_blocks.saturating_add(1);
            }
            log::debug!("put_block: freed block {}", bno);
        }
        Ok(())
    }

    /// Refcount currently recorded for data block `bno`. Exposed alongside `statfs` as a
    /// diagnostic: the design's testable invariants (§8) are stated directly in terms of it.
    pub fn block_refcount(&self, bno: u32) -> Result<u8> {
        let meta_bno = self.sb.read().meta_block(bno);
        let shift = self.sb.read().meta_shift(bno);
        Ok(self.read_meta(meta_bno)?.refcount[shift])
    }

    pub(crate) fn read_meta(&self, meta_bno: u32) -> Result<MetaBlock> {
        let raw = self.cache.read(meta_bno)?;
        crate::layout::read_from(&raw[..]).ok_or(Error::Io)
    }

    pub(crate) fn write_meta(&self, meta_bno: u32, meta: &MetaBlock) -> Result<()> {
        let mut raw = [0u8; BLOCK_SIZE];
        raw.copy_from_slice(zerocopy::AsBytes::as_bytes(meta));
        self.cache.write(meta_bno, &raw)
    }

    pub(crate) fn zero_block(&self, bno: u32) -> Result<()> {
        self.cache.write(bno, &crate::layout::ZERO_BLOCK)
    }
}

pub(crate) fn read_u32_block(raw: &crate::layout::Block) -> U32Block {
    crate::layout::read_from(&raw[..]).expect("U32Block is exactly one block wide")
}

pub(crate) fn write_u32_block(block: &U32Block) -> crate::layout::Block {
    let mut raw = [0u8; BLOCK_SIZE];
    raw.copy_from_slice(zerocopy::AsBytes::as_bytes(block));
    raw
}
