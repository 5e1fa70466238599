//! Inode Layer (§4.4): in-memory inode handle, lazy fill/refresh across snapshots, and the
//! directory operations (lookup/create/unlink/rename/mkdir/rmdir). Generalizes the source's
//! `ouichefs_ifill` / `ouichefs_iget` / `ouichefs_create` / `ouichefs_unlink` / `ouichefs_rename`
//! (`inode.c`) onto the indirect inode-data scheme from §4.3.

use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::{Error, Result};
use crate::host::CachedInode;
use crate::layout::{InodeData, FILENAME_LEN, S_IFDIR, S_IFMT, S_IFREG};
use crate::volume::{BlockCategory, Volume};

bitflags::bitflags! {
    /// Accepted `rename_child` flags. `EXCHANGE`/`WHITEOUT` are the Linux `renameat2` flags this
    /// design doesn't implement (§4.4); either one is rejected outright.
    pub struct RenameFlags: u32 {
        const EXCHANGE = 0b01;
        const WHITEOUT = 0b10;
    }
}

/// In-memory inode: the host's cache entry augmented with `{index_block, snapshot_id}`, per
/// the design's invariant that an inode is stale whenever its cached `snapshot_id` no longer
/// matches the live snapshot.
#[derive(Debug, Clone, Copy)]
pub struct InodeHandle {
    pub ino: u32,
    pub data: InodeData,
    pub snapshot_id: u32,
}

impl InodeHandle {
    pub fn index_block(&self) -> u32 {
        self.data.index_block
    }
    pub fn is_dir(&self) -> bool {
        self.data.mode & S_IFMT == S_IFDIR
    }
    pub fn is_dead(&self) -> bool {
        self.data.index_block == 0
    }
}

fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

fn check_name(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > FILENAME_LEN {
        return Err(Error::NameTooLong);
    }
    Ok(())
}

impl Volume {
    /// `iget`: ask the host cache; if the cache already has a handle but it's stale relative to
    /// the live snapshot, refresh it via `ifill(false)`.
    pub fn iget(&self, ino: u32, create_allowed: bool) -> Result<InodeHandle> {
        let live = self.live_snapshot_id();
        if let Some(cached) = self.inodes.lookup(ino) {
            if cached.snapshot_id == live {
                return self.ifill(ino, false).map(|mut h| {
                    h.snapshot_id = live;
                    h
                });
            }
        }
        let handle = self.ifill(ino, create_allowed)?;
        self.inodes.insert(CachedInode {
            ino,
            index_block: handle.index_block(),
            snapshot_id: handle.snapshot_id,
        });
        Ok(handle)
    }

    /// `ifill`: load the live inode-data entry for `ino`; allocate a fresh one when
    /// `create_allowed` and none exists yet.
    pub fn ifill(&self, ino: u32, create_allowed: bool) -> Result<InodeHandle> {
        let rec = self.read_inode_record(ino)?;
        let needs_allocate = rec.i_data[0] == 0;
        if needs_allocate && !create_allowed {
            return Err(Error::Invalid);
        }
        let (_, _, _, entry) = self.get_inode_data(ino, needs_allocate, false)?;
        if entry.index_block == 0 && !create_allowed {
            return Err(Error::Invalid);
        }
        Ok(InodeHandle {
            ino,
            data: entry,
            snapshot_id: self.live_snapshot_id(),
        })
    }

    /// `writeback`: persist `inode.data` through the live inode-data entry, CoW'ing it first if
    /// it is shared with another snapshot. A no-op on an already-dead inode.
    pub fn writeback(&self, inode: &InodeHandle) -> Result<()> {
        let (_, bno, shift, existing) = self.get_inode_data(inode.ino, false, true)?;
        if existing.index_block == 0 && inode.data.index_block == 0 {
            return Ok(());
        }
        let mut new_data = inode.data;
        new_data.refcount = 1;
        self.write_inode_data_at(bno, shift, &new_data)
    }

    /// `lookup`: scan the directory's block for `name`; updates the directory's atime.
    pub fn lookup(&self, dir: &InodeHandle, name: &str) -> Result<InodeHandle> {
        if !dir.is_dir() {
            return Err(Error::NotDir);
        }
        let ino = self.dir_lookup(dir.index_block(), name)?;
        self.iget(ino, false)
    }

    /// `create`: allocate a new inode for `name` inside `dir`.
    pub fn create_child(&self, dir: &mut InodeHandle, name: &str, mode: u32) -> Result<InodeHandle> {
        check_name(name)?;
        if !dir.is_dir() {
            return Err(Error::NotDir);
        }
        let mode_kind = mode & S_IFMT;
        if mode_kind != S_IFDIR && mode_kind != S_IFREG {
            return Err(Error::Invalid);
        }

        let mut dir_index_block = dir.index_block();
        self.cow_block(&mut dir_index_block, BlockCategory::Dir)?;
        if self.dir_is_full(dir_index_block)? {
            if dir_index_block != dir.index_block() {
                self.put_block(dir_index_block, BlockCategory::Dir)?;
            }
            return Err(Error::TooManyLinks);
        }

        let ino = self.ifree.alloc().ok_or(Error::NoSpace)? as u32;
        let mut child = match self.ifill(ino as u32, true) {
            Ok(h) => h,
            Err(e) => {
                self.ifree.free(ino as usize);
                if dir_index_block != dir.index_block() {
                    self.put_block(dir_index_block, BlockCategory::Dir)?;
                }
                return Err(e);
            }
        };

        let result = (|| -> Result<()> {
            let index_block = self.alloc_block()?;
            let now = now_secs();
            child.data = InodeData {
                mode,
                uid: 0,
                gid: 0,
                size: if mode_kind == S_IFDIR { 4096 } else { 0 },
                ctime_s: now,
                ctime_ns: 0,
                atime_s: now,
                atime_ns: 0,
                mtime_s: now,
                mtime_ns: 0,
                blocks: 1,
                nlink: if mode_kind == S_IFDIR { 2 } else { 1 },
                index_block,
                refcount: 1,
                ..InodeData::EMPTY
            };
            self.writeback(&child)?;
            self.dir_insert(dir_index_block, name, ino)?;
            Ok(())
        })();

        if let Err(e) = result {
            self.ifree.free(ino as usize);
            if dir_index_block != dir.index_block() {
                self.put_block(dir_index_block, BlockCategory::Dir)?;
            }
            return Err(e);
        }

        let now = now_secs();
        dir.data.mtime_s = now;
        dir.data.atime_s = now;
        dir.data.ctime_s = now;
        if mode_kind == S_IFDIR {
            dir.data.nlink += 1;
        }
        dir.data.index_block = dir_index_block;
        self.writeback(dir)?;

        Ok(child)
    }

    /// `unlink`: remove `name` from `dir`, freeing the child's index block and the backing
    /// inode-data entry when it was the last reference.
    pub fn unlink_child(&self, dir: &mut InodeHandle, name: &str) -> Result<()> {
        if !dir.is_dir() {
            return Err(Error::NotDir);
        }
        let child_ino = self.dir_lookup(dir.index_block(), name)?;
        let child = self.iget(child_ino, false)?;

        let mut dir_index_block = dir.index_block();
        self.cow_block(&mut dir_index_block, BlockCategory::Dir)?;
        self.dir_remove(dir_index_block, name)?;

        let now = now_secs();
        dir.data.mtime_s = now;
        dir.data.atime_s = now;
        dir.data.ctime_s = now;
        if child.is_dir() {
            dir.data.nlink = dir.data.nlink.saturating_sub(1);
        }
        dir.data.index_block = dir_index_block;
        self.writeback(dir)?;

        let category = if child.is_dir() {
            BlockCategory::Dir
        } else {
            BlockCategory::Index
        };
        self.put_block(child.index_block(), category)?;

        // Design Note (iv): `put_inode_data` never touches `index_block`'s refcount, so the
        // caller decrements it itself (above) before reclaiming the inode-data record.
        self.put_inode_data(child_ino, 0)?;
        self.inodes.evict(child_ino);
        log::debug!("unlink: freed inode {} (index block {})", child_ino, child.index_block());
        Ok(())
    }

    pub fn mkdir_child(&self, dir: &mut InodeHandle, name: &str) -> Result<InodeHandle> {
        self.create_child(dir, name, S_IFDIR | 0o755)
    }

    /// `rmdir`: requires the target to be an (otherwise) empty directory.
    pub fn rmdir_child(&self, dir: &mut InodeHandle, name: &str) -> Result<()> {
        let child_ino = self.dir_lookup(dir.index_block(), name)?;
        let child = self.iget(child_ino, false)?;
        if !child.is_dir() {
            return Err(Error::NotDir);
        }
        if !self.dir_is_empty(child.index_block())? || child.data.nlink > 2 {
            return Err(Error::NotEmpty);
        }
        self.unlink_child(dir, name)
    }

    /// `rename`: move `old_name` from `old_dir` to `new_name` in `new_dir`.
    pub fn rename_child(
        &self,
        old_dir: &mut InodeHandle,
        old_name: &str,
        new_dir: &mut InodeHandle,
        new_name: &str,
        flags: RenameFlags,
    ) -> Result<()> {
        if flags.intersects(RenameFlags::EXCHANGE | RenameFlags::WHITEOUT) {
            return Err(Error::NotSupported);
        }
        check_name(new_name)?;
        let child_ino = self.dir_lookup(old_dir.index_block(), old_name)?;

        if old_dir.ino == new_dir.ino {
            let mut index_block = old_dir.index_block();
            self.cow_block(&mut index_block, BlockCategory::Dir)?;
            if self.dir_lookup(index_block, new_name).is_ok() {
                return Err(Error::Exists);
            }
            self.dir_remove(index_block, old_name)?;
            self.dir_insert(index_block, new_name, child_ino)?;
            old_dir.data.index_block = index_block;
            old_dir.data.mtime_s = now_secs();
            self.writeback(old_dir)?;
            return Ok(());
        }

        let mut new_index_block = new_dir.index_block();
        self.cow_block(&mut new_index_block, BlockCategory::Dir)?;
        if self.dir_lookup(new_index_block, new_name).is_ok() {
            if new_index_block != new_dir.index_block() {
                self.put_block(new_index_block, BlockCategory::Dir)?;
            }
            return Err(Error::Exists);
        }
        self.dir_insert(new_index_block, new_name, child_ino)?;
        new_dir.data.index_block = new_index_block;
        new_dir.data.mtime_s = now_secs();
        self.writeback(new_dir)?;

        let mut old_index_block = old_dir.index_block();
        self.cow_block(&mut old_index_block, BlockCategory::Dir)?;
        self.dir_remove(old_index_block, old_name)?;
        old_dir.data.index_block = old_index_block;
        old_dir.data.mtime_s = now_secs();
        self.writeback(old_dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::mount_test_volume;

    fn test_root() -> (Volume, InodeHandle) {
        let v = mount_test_volume(512);
        let mut root = v.ifill(1, true).unwrap();
        root.data.mode = S_IFDIR | 0o775;
        root.data.index_block = v.alloc_block().unwrap();
        root.data.nlink = 2;
        root.data.refcount = 1;
        v.writeback(&root).unwrap();
        (v, root)
    }

    #[test]
    fn rename_rejects_exchange_and_whiteout() {
        let (v, mut root) = test_root();
        v.create_child(&mut root, "a", S_IFREG | 0o644).unwrap();
        let mut other = root;
        assert!(matches!(
            v.rename_child(&mut root, "a", &mut other, "b", RenameFlags::EXCHANGE),
            Err(Error::NotSupported)
        ));
        assert!(matches!(
            v.rename_child(&mut root, "a", &mut other, "b", RenameFlags::WHITEOUT),
            Err(Error::NotSupported)
        ));
    }

    #[test]
    fn rename_same_dir_moves_name() {
        let (v, mut root) = test_root();
        v.create_child(&mut root, "a", S_IFREG | 0o644).unwrap();
        let mut other = root;
        v.rename_child(&mut root, "a", &mut other, "b", RenameFlags::empty())
            .unwrap();
        assert!(v.lookup(&root, "a").is_err());
        assert!(v.lookup(&root, "b").is_ok());
    }
}
