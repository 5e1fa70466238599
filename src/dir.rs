//! Directory block scanning and mutation helpers shared by the inode layer's directory
//! operations (§4.4). A directory's `index_block` doubles as its one and only directory block.

use crate::error::{Error, Result};
use crate::layout::{DirBlock, DirEntry, FILENAME_LEN, MAX_SUBFILES};
use crate::volume::Volume;

fn name_bytes(name: &str) -> Result<[u8; FILENAME_LEN]> {
    if name.is_empty() || name.len() > FILENAME_LEN {
        return Err(Error::NameTooLong);
    }
    let mut buf = [0u8; FILENAME_LEN];
    buf[..name.len()].copy_from_slice(name.as_bytes());
    Ok(buf)
}

fn entry_name(entry: &DirEntry) -> &str {
    let len = entry.name.iter().position(|&b| b == 0).unwrap_or(FILENAME_LEN);
    core::str::from_utf8(&entry.name[..len]).unwrap_or("")
}

impl Volume {
    pub(crate) fn read_dir_block(&self, bno: u32) -> Result<DirBlock> {
        let raw = self.cache.read(bno)?;
        crate::layout::read_from(&raw[..]).ok_or(Error::Io)
    }

    pub(crate) fn write_dir_block(&self, bno: u32, block: &DirBlock) -> Result<()> {
        let mut raw = [0u8; crate::layout::BLOCK_SIZE];
        raw.copy_from_slice(zerocopy::AsBytes::as_bytes(block));
        self.cache.write(bno, &raw)
    }

    /// `lookup`: scan a directory block for `name`; returns the child's inode number.
    pub fn dir_lookup(&self, dir_index_block: u32, name: &str) -> Result<u32> {
        let block = self.read_dir_block(dir_index_block)?;
        for entry in block.files.iter() {
            if entry.ino == 0 {
                break;
            }
            if entry_name(entry) == name {
                return Ok(entry.ino);
            }
        }
        Err(Error::NotFound)
    }

    /// Inserts `{ino, name}` into the first free slot. Fails `EMLINK` if full, `EEXIST` if the
    /// name is already present.
    pub(crate) fn dir_insert(&self, dir_index_block: u32, name: &str, ino: u32) -> Result<()> {
        let mut block = self.read_dir_block(dir_index_block)?;
        let name_buf = name_bytes(name)?;
        let mut free_slot = None;
        for (i, entry) in block.files.iter().enumerate() {
            if entry.ino == 0 {
                free_slot = Some(i);
                break;
            }
            if entry_name(entry) == name {
                return Err(Error::Exists);
            }
        }
        let slot = free_slot.ok_or(Error::TooManyLinks)?;
        block.files[slot] = DirEntry { ino, name: name_buf };
        self.write_dir_block(dir_index_block, &block)
    }

    pub(crate) fn dir_is_full(&self, dir_index_block: u32) -> Result<bool> {
        let block = self.read_dir_block(dir_index_block)?;
        Ok(block.files[MAX_SUBFILES - 1].ino != 0)
    }

    /// Removes the entry named `name`, compacting the remaining entries to stay densely packed
    /// (mirrors the source's `memmove` compaction in `ouichefs_unlink`).
    pub(crate) fn dir_remove(&self, dir_index_block: u32, name: &str) -> Result<u32> {
        let mut block = self.read_dir_block(dir_index_block)?;
        let mut found = None;
        let mut count = 0;
        for (i, entry) in block.files.iter().enumerate() {
            if entry.ino == 0 {
                break;
            }
            count = i + 1;
            if entry_name(entry) == name {
                found = Some(i);
            }
        }
        let f_id = found.ok_or(Error::NotFound)?;
        let removed_ino = block.files[f_id].ino;
        if f_id != count - 1 {
            for i in f_id..count - 1 {
                block.files[i] = block.files[i + 1];
            }
        }
        block.files[count - 1] = DirEntry::EMPTY;
        self.write_dir_block(dir_index_block, &block)?;
        Ok(removed_ino)
    }

    pub(crate) fn dir_is_empty(&self, dir_index_block: u32) -> Result<bool> {
        let block = self.read_dir_block(dir_index_block)?;
        Ok(block.files[0].ino == 0)
    }
}
