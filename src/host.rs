//! Host collaborator contracts.
//!
//! The core never talks to a real block device, the VFS dentry/page cache, or a scheduler: it
//! consumes exactly three traits from its host, matching the "external collaborators" named in
//! the design (a block-cache contract, a volume-quiesce contract, and an inode-cache contract).
//! [`MemBlockCache`] is the in-memory reference implementation used by the format tool and the
//! test suite; it is not a production block driver.

use crate::error::{Error, Result};
use crate::layout::{Block, BLOCK_SIZE, ZERO_BLOCK};
use spin::Mutex;

/// Read/write access to the volume's raw 4 KiB blocks. A single synchronous call pair
/// (`read`/`write`) is sufficient at the granularity the core needs: every operation above this
/// trait already brackets its own latch (the bitmap lock, or the per-bno refcount
/// read-modify-write) around the smallest span of reads and writes it requires, so a finer
/// pin/dirty/release split would only duplicate bookkeeping the core already does itself.
pub trait BlockCache: Send + Sync {
    fn read(&self, bno: u32) -> Result<Block>;
    fn write(&self, bno: u32, data: &Block) -> Result<()>;
}

/// Freezes/thaws the volume around a whole-volume snapshot operation. The host is responsible
/// for draining in-flight writers before `freeze` returns and for flushing dirty state.
pub trait Quiesce: Send + Sync {
    fn freeze(&self);
    fn thaw(&self);
}

/// Keyed by inode number. The host owns the actual in-memory inode objects; the core only needs
/// to know whether one is already resident so it can decide between `ifill(create)` and
/// `ifill(refresh)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CachedInode {
    pub ino: u32,
    pub index_block: u32,
    pub snapshot_id: u32,
}

pub trait InodeCache: Send + Sync {
    fn lookup(&self, ino: u32) -> Option<CachedInode>;
    fn insert(&self, inode: CachedInode);
    fn evict(&self, ino: u32);
}

/// A `Vec<Block>`-backed block cache, guarded the way the teacher guards its buffer cache: one
/// lock over the whole backing store (the teacher's `Bcache` uses a single `Sleeplock` list;
/// here a single `spin::Mutex` is enough since there is no disk latency to hide).
pub struct MemBlockCache {
    blocks: Mutex<Vec<Block>>,
}

impl MemBlockCache {
    pub fn new(nr_blocks: usize) -> Self {
        Self {
            blocks: Mutex::new(vec![ZERO_BLOCK; nr_blocks]),
        }
    }

    pub fn nr_blocks(&self) -> usize {
        self.blocks.lock().len()
    }
}

impl BlockCache for MemBlockCache {
    fn read(&self, bno: u32) -> Result<Block> {
        let blocks = self.blocks.lock();
        blocks.get(bno as usize).copied().ok_or(Error::Io)
    }

    fn write(&self, bno: u32, data: &Block) -> Result<()> {
        let mut blocks = self.blocks.lock();
        let slot = blocks.get_mut(bno as usize).ok_or(Error::Io)?;
        slot.copy_from_slice(&data[..BLOCK_SIZE]);
        Ok(())
    }
}

/// No-op quiesce: correct for a single-threaded host such as the test suite and `mkfs`, which
/// never has a concurrent writer to drain.
pub struct NullQuiesce;

impl Quiesce for NullQuiesce {
    fn freeze(&self) {
        log::debug!("quiesce: freeze (no-op host)");
    }
    fn thaw(&self) {
        log::debug!("quiesce: thaw (no-op host)");
    }
}

/// A plain hash-map inode cache, sufficient for hosts that don't need eviction pressure.
pub struct MapInodeCache {
    map: Mutex<std::collections::HashMap<u32, CachedInode>>,
}

impl MapInodeCache {
    pub fn new() -> Self {
        Self {
            map: Mutex::new(std::collections::HashMap::new()),
        }
    }
}

impl Default for MapInodeCache {
    fn default() -> Self {
        Self::new()
    }
}

impl InodeCache for MapInodeCache {
    fn lookup(&self, ino: u32) -> Option<CachedInode> {
        self.map.lock().get(&ino).copied()
    }
    fn insert(&self, inode: CachedInode) {
        self.map.lock().insert(inode.ino, inode);
    }
    fn evict(&self, ino: u32) {
        self.map.lock().remove(&ino);
    }
}
