//! File Data Mapping (§4.5). Generalizes `file.c`'s `ouichefs_file_get_block` /
//! `__truncate_index_block` / `__reflink_file` / `__reflink_file_range` /
//! `ouichefs_remap_file_range` onto a single-level `B32`-entry index block.

use crate::error::{Error, Result};
use crate::inode::InodeHandle;
use crate::layout::{B32, BLOCK_SIZE};
use crate::volume::{BlockCategory, Volume};

bitflags::bitflags! {
    /// Accepted `remap_file_range` flags; anything else is `EINVAL`.
    pub struct RemapFlags: u32 {
        const DEDUP = 0b01;
        const ADVISORY = 0b10;
    }
}

impl Volume {
    fn read_index(&self, bno: u32) -> Result<crate::layout::U32Block> {
        let raw = self.cache.read(bno)?;
        Ok(crate::block::read_u32_block(&raw))
    }

    fn write_index(&self, bno: u32, block: &crate::layout::U32Block) -> Result<()> {
        self.cache.write(bno, &crate::block::write_u32_block(block))
    }

    /// `file_get_block`: resolve logical block `iblock` of `inode` to a physical block number,
    /// allocating and/or CoW'ing as requested. Returns `Ok(None)` for an unmapped hole.
    pub fn file_get_block(
        &self,
        inode: &mut InodeHandle,
        iblock: usize,
        allocate: bool,
        cow: bool,
    ) -> Result<Option<u32>> {
        if iblock >= B32 {
            return Err(Error::FileTooBig);
        }

        let mut index_block = inode.index_block();
        if cow {
            let moved = self.cow_block(&mut index_block, BlockCategory::Index)?;
            if moved {
                inode.data.index_block = index_block;
            }
        }

        let mut index = self.read_index(index_block)?;
        let mut bno = index.entries[iblock];
        let mut dirty = false;

        if bno == 0 {
            if !allocate {
                return Ok(None);
            }
            bno = self.alloc_block()?;
            index.entries[iblock] = bno;
            dirty = true;
        } else if cow {
            let mut moved_bno = bno;
            let moved = self.cow_block(&mut moved_bno, BlockCategory::Data)?;
            if moved {
                index.entries[iblock] = moved_bno;
                dirty = true;
            }
            bno = moved_bno;
        }

        if dirty {
            self.write_index(index_block, &index)?;
        }
        log::debug!("file_get_block: mapped {} to {} (cow={})", iblock, bno, cow);
        Ok(Some(bno))
    }

    /// `truncate_index`: free every block at or past `start`, assuming sole ownership of
    /// `index_block` (the caller must have CoW'ed it beforehand).
    pub fn truncate_index(&self, index_block: u32, start: usize) -> Result<()> {
        let mut index = self.read_index(index_block)?;
        for i in start..B32 {
            if index.entries[i] == 0 {
                break;
            }
            self.put_block(index.entries[i], BlockCategory::Data)?;
            index.entries[i] = 0;
        }
        self.write_index(index_block, &index)
    }

    /// `open(inode, O_TRUNC)`: discard all file content and reset size/blocks to empty.
    pub fn truncate_to_zero(&self, inode: &mut InodeHandle) -> Result<()> {
        if inode.data.size == 0 {
            return Ok(());
        }
        let mut index_block = inode.index_block();
        self.cow_block(&mut index_block, BlockCategory::Index)?;
        self.truncate_index(index_block, 0)?;
        inode.data.index_block = index_block;
        inode.data.size = 0;
        inode.data.blocks = 1;
        self.writeback(inode)
    }

    /// `write_end`: after a logical write, reconcile `inode.blocks` against `inode.size` and
    /// release any blocks the shrink left behind.
    pub fn reconcile_size(&self, inode: &mut InodeHandle, new_size: u64) -> Result<()> {
        let old_blocks = inode.data.blocks;
        inode.data.size = new_size;
        let mut blocks = 1 + (new_size / BLOCK_SIZE as u64) as u32;
        if new_size % BLOCK_SIZE as u64 != 0 {
            blocks += 1;
        }
        inode.data.blocks = blocks;
        if old_blocks > blocks {
            self.truncate_index(inode.index_block(), (blocks - 1) as usize)?;
        }
        self.writeback(inode)
    }

    /// Whole-file reflink fast path: `dst` adopts `src`'s index block outright.
    fn reflink_whole_file(&self, src: &InodeHandle, dst: &mut InodeHandle) -> Result<u64> {
        if src.index_block() == dst.index_block() {
            return Ok(src.data.size);
        }
        self.get_block(src.index_block())?;
        let dst_category = if dst.is_dir() {
            BlockCategory::Dir
        } else {
            BlockCategory::Index
        };
        self.put_block(dst.index_block(), dst_category)?;
        dst.data.index_block = src.index_block();
        Ok(src.data.size)
    }

    /// Block-aligned range reflink. `src_off`/`dst_off`/`len` must already be block-aligned;
    /// returns the number of bytes actually reflinked (may stop early on error).
    fn reflink_range(
        &self,
        src: &InodeHandle,
        src_off: u64,
        dst: &mut InodeHandle,
        dst_off: u64,
        len: u64,
    ) -> Result<u64> {
        let block = BLOCK_SIZE as u64;
        let len_b = (len / block) as usize;
        let s_off_b = (src_off / block) as usize;
        let d_off_b = (dst_off / block) as usize;

        let src_index = self.read_index(src.index_block())?;
        let mut dst_index_block = dst.index_block();
        let moved = self.cow_block(&mut dst_index_block, BlockCategory::Index)?;
        if moved {
            dst.data.index_block = dst_index_block;
        }
        let mut dst_index = self.read_index(dst_index_block)?;

        let mut reflinked: u64 = 0;
        let mut dirty = false;
        for i in 0..len_b {
            let s = src_index.entries[s_off_b + i];
            let d = dst_index.entries[d_off_b + i];
            if s == d {
                reflinked += block;
                continue;
            }
            if self.get_block(s).is_err() {
                break;
            }
            if d != 0 {
                if self.put_block(d, BlockCategory::Data).is_err() {
                    break;
                }
            }
            dst_index.entries[d_off_b + i] = s;
            dirty = true;
            reflinked += block;
        }

        if dirty {
            self.write_index(dst_index_block, &dst_index)?;
        }
        Ok(reflinked)
    }

    /// `remap_file_range`: reflink/dedup `len` bytes from `src` at `src_off` into `dst` at
    /// `dst_off`. `len == 0` means "the whole source file". Returns bytes reflinked.
    pub fn remap_file_range(
        &self,
        src: &InodeHandle,
        src_off: u64,
        dst: &mut InodeHandle,
        dst_off: u64,
        len: u64,
        flags: RemapFlags,
    ) -> Result<u64> {
        if !RemapFlags::all().contains(flags) {
            return Err(Error::Invalid);
        }
        let len = if len == 0 { src.data.size } else { len };
        let block = BLOCK_SIZE as u64;
        if src_off % block != 0 || dst_off % block != 0 || len % block != 0 {
            return Err(Error::Invalid);
        }

        let reflinked = if src_off == 0 && dst_off == 0 && len == src.data.size && len > dst.data.size
        {
            self.reflink_whole_file(src, dst)?
        } else {
            self.reflink_range(src, src_off, dst, dst_off, len)?
        };

        if dst_off + reflinked > dst.data.size {
            let new_size = dst_off + reflinked;
            dst.data.size = new_size;
            let mut blocks = 1 + (new_size / block) as u32;
            if new_size % block != 0 {
                blocks += 1;
            }
            dst.data.blocks = blocks;
        }
        self.writeback(dst)?;
        Ok(reflinked)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::S_IFREG;
    use crate::testutil::mount_test_volume as test_volume;

    fn new_file(v: &Volume) -> InodeHandle {
        let mut h = v.ifill(1, true).unwrap();
        let index_block = v.alloc_block().unwrap();
        h.data.mode = S_IFREG | 0o644;
        h.data.index_block = index_block;
        h.data.blocks = 1;
        h.data.refcount = 1;
        v.writeback(&h).unwrap();
        h
    }

    #[test]
    fn get_block_allocates_on_write() {
        let v = test_volume(512);
        let mut f = new_file(&v);
        let bno = v.file_get_block(&mut f, 0, true, false).unwrap();
        assert!(bno.is_some());
        let again = v.file_get_block(&mut f, 0, false, false).unwrap();
        assert_eq!(bno, again);
    }

    #[test]
    fn get_block_out_of_range_is_efbig() {
        let v = test_volume(512);
        let mut f = new_file(&v);
        assert!(matches!(v.file_get_block(&mut f, B32, true, false), Err(Error::FileTooBig)));
    }

    #[test]
    fn truncate_frees_blocks() {
        let v = test_volume(512);
        let mut f = new_file(&v);
        v.file_get_block(&mut f, 0, true, false).unwrap();
        v.file_get_block(&mut f, 1, true, false).unwrap();
        let free_before = v.sb.read().nr_free_blocks;
        v.truncate_index(f.index_block(), 0).unwrap();
        assert!(v.sb.read().nr_free_blocks > free_before);
    }

    #[test]
    fn reflink_whole_file_shares_index_block() {
        let v = test_volume(512);
        let mut src = new_file(&v);
        src.data.size = BLOCK_SIZE as u64;
        v.writeback(&src).unwrap();
        let mut dst = new_file(&v);
        let n = v
            .remap_file_range(&src, 0, &mut dst, 0, 0, RemapFlags::empty())
            .unwrap();
        assert_eq!(n, src.data.size);
        assert_eq!(dst.data.index_block, src.data.index_block);
    }
}
