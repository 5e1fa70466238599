//! On-disk record layout and the offset arithmetic that turns superblock counters into
//! block numbers for every region of the volume.
//!
//! Disk layout:
//! `[ superblock | inode_store | ifree | bfree | idfree | ididx | meta | data ]`
//!
//! All multi-byte fields are little-endian. Every block-sized record is checked against
//! [`BLOCK_SIZE`] with [`static_assertions::const_assert_eq`].

use static_assertions::const_assert_eq;
use zerocopy::{AsBytes, FromBytes};

/// Interprets a byte slice as a `T`, copying it out regardless of the slice's alignment.
/// Equivalent to the `FromBytes::read_from` convenience method provided by newer `zerocopy`
/// releases, which 0.5's `FromBytes` lacks (0.5 only offers the alignment-sensitive
/// `LayoutVerified::new`, which would spuriously fail on the unaligned byte buffers this crate
/// reads blocks into). Sound because `FromBytes` guarantees every bit pattern is a valid `T`.
pub(crate) fn read_from<T: FromBytes + Copy>(bytes: &[u8]) -> Option<T> {
    if bytes.len() != core::mem::size_of::<T>() {
        return None;
    }
    let mut uninit = core::mem::MaybeUninit::<T>::uninit();
    unsafe {
        core::ptr::copy_nonoverlapping(bytes.as_ptr(), uninit.as_mut_ptr() as *mut u8, bytes.len());
        Some(uninit.assume_init())
    }
}

/// Fixed block size of the volume.
pub const BLOCK_SIZE: usize = 4096;
/// Number of `u32` entries in a block (`B32` in the design notes).
pub const B32: usize = BLOCK_SIZE / 4;
/// Magic number identifying a formatted volume ("WICH" backwards, matches the source format).
pub const MAGIC: u32 = 0x4843_4957;
/// Maximum number of snapshot slots, including the live slot 0.
pub const MAX_SNAPSHOTS: usize = 32;
/// Slot index of the always-present, writable live snapshot.
pub const LIVE_SLOT: usize = 0;
/// Maximum file name length, not including a NUL terminator.
pub const FILENAME_LEN: usize = 28;
/// Maximum number of directory entries per directory block.
pub const MAX_SUBFILES: usize = 128;
/// Maximum representable file size in bytes (one index block's worth of data blocks).
pub const MAX_FILE_SIZE: u64 = (B32 as u64) * (BLOCK_SIZE as u64);
/// Width of the on-disk volume label, ext2-`s_volume_name`-style.
pub const LABEL_LEN: usize = 16;

/// A raw, in-memory copy of one on-disk block.
pub type Block = [u8; BLOCK_SIZE];

pub const ZERO_BLOCK: Block = [0u8; BLOCK_SIZE];

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, AsBytes, FromBytes)]
pub struct SnapshotSlot {
    pub created_sec: i64,
    pub id: u32,
    _pad: u32,
}
const_assert_eq!(core::mem::size_of::<SnapshotSlot>(), 16);

impl SnapshotSlot {
    pub const EMPTY: SnapshotSlot = SnapshotSlot {
        created_sec: 0,
        id: 0,
        _pad: 0,
    };

    pub fn new(created_sec: i64, id: u32) -> Self {
        Self {
            created_sec,
            id,
            _pad: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.id == 0
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, AsBytes, FromBytes)]
pub struct Superblock {
    // `snapshots` is listed first because its `i64` field needs 8-byte alignment; putting it
    // up front (where the offset is trivially aligned) avoids the compiler inserting implicit
    // padding before it, which `zerocopy`'s `AsBytes` derive refuses to allow.
    pub snapshots: [SnapshotSlot; MAX_SNAPSHOTS],
    pub magic: u32,
    pub nr_blocks: u32,
    pub nr_inodes: u32,
    pub nr_inode_data_entries: u32,
    pub nr_istore_blocks: u32,
    pub nr_ifree_blocks: u32,
    pub nr_bfree_blocks: u32,
    pub nr_idfree_blocks: u32,
    pub nr_ididx_blocks: u32,
    pub nr_meta_blocks: u32,
    pub nr_free_inodes: u32,
    pub nr_free_blocks: u32,
    pub nr_free_inode_data_entries: u32,
    /// Volume label, NUL-padded; set at format time via `FormatOptions`.
    pub label: [u8; LABEL_LEN],
    _reserved: [u8; BLOCK_SIZE - 52 - LABEL_LEN - MAX_SNAPSHOTS * 16],
}
const_assert_eq!(core::mem::size_of::<Superblock>(), BLOCK_SIZE);

/// Inodes per block: `inode[ino] = { i_data[MAX_SNAPSHOTS]: u32 }`.
#[repr(C)]
#[derive(Debug, Clone, Copy, AsBytes, FromBytes)]
pub struct InodeRecord {
    pub i_data: [u32; MAX_SNAPSHOTS],
}
const_assert_eq!(core::mem::size_of::<InodeRecord>(), 128);
pub const IPB: usize = BLOCK_SIZE / core::mem::size_of::<InodeRecord>();

/// File mode bits, POSIX-flavored; only the bits the core cares about are named.
pub const S_IFDIR: u32 = 0o040000;
pub const S_IFREG: u32 = 0o100000;
pub const S_IFMT: u32 = 0o170000;

#[repr(C)]
#[derive(Debug, Clone, Copy, AsBytes, FromBytes)]
pub struct InodeData {
    // The 8-byte-aligned fields are grouped first so the compiler never needs to insert
    // implicit alignment padding between them and the `u32`/`u8` fields that follow; `zerocopy`'s
    // `AsBytes` derive rejects any type with implicit padding.
    pub size: u64,
    pub ctime_s: i64,
    pub atime_s: i64,
    pub mtime_s: i64,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub ctime_ns: u32,
    pub atime_ns: u32,
    pub mtime_ns: u32,
    pub blocks: u32,
    pub nlink: u32,
    pub index_block: u32,
    pub refcount: u8,
    pub(crate) _pad: [u8; 3],
}
const_assert_eq!(core::mem::size_of::<InodeData>(), 72);

impl InodeData {
    pub const EMPTY: InodeData = InodeData {
        mode: 0,
        uid: 0,
        gid: 0,
        size: 0,
        ctime_s: 0,
        ctime_ns: 0,
        atime_s: 0,
        atime_ns: 0,
        mtime_s: 0,
        mtime_ns: 0,
        blocks: 0,
        nlink: 0,
        index_block: 0,
        refcount: 0,
        _pad: [0; 3],
    };

    pub fn is_dir(&self) -> bool {
        self.mode & S_IFMT == S_IFDIR
    }
}

/// Number of inode-data entries packed per block.
pub const IDE: usize = BLOCK_SIZE / core::mem::size_of::<InodeData>();

/// A block of `B32` little-endian `u32`s: used both for file index blocks and ididx blocks.
#[repr(C)]
#[derive(Debug, Clone, Copy, AsBytes, FromBytes)]
pub struct U32Block {
    pub entries: [u32; B32],
}
const_assert_eq!(core::mem::size_of::<U32Block>(), BLOCK_SIZE);

impl U32Block {
    pub const ZERO: U32Block = U32Block { entries: [0; B32] };
}

/// One byte per data block, holding its refcount.
#[repr(C)]
#[derive(Debug, Clone, Copy, AsBytes, FromBytes)]
pub struct MetaBlock {
    pub refcount: [u8; BLOCK_SIZE],
}
const_assert_eq!(core::mem::size_of::<MetaBlock>(), BLOCK_SIZE);

impl MetaBlock {
    pub const ZERO: MetaBlock = MetaBlock {
        refcount: [0; BLOCK_SIZE],
    };
}

#[repr(C)]
#[derive(Debug, Clone, Copy, AsBytes, FromBytes)]
pub struct DirEntry {
    pub ino: u32,
    pub name: [u8; FILENAME_LEN],
}
const_assert_eq!(core::mem::size_of::<DirEntry>(), 32);

impl DirEntry {
    pub const EMPTY: DirEntry = DirEntry {
        ino: 0,
        name: [0; FILENAME_LEN],
    };
}

#[repr(C)]
#[derive(Debug, Clone, Copy, AsBytes, FromBytes)]
pub struct DirBlock {
    pub files: [DirEntry; MAX_SUBFILES],
}
const_assert_eq!(core::mem::size_of::<DirBlock>(), BLOCK_SIZE);

impl DirBlock {
    pub const ZERO: DirBlock = DirBlock {
        files: [DirEntry::EMPTY; MAX_SUBFILES],
    };
}

/// Region layout derived from a live superblock's counters. Every method is a pure
/// offset computation; none of them touch the block cache.
impl Superblock {
    pub fn istore_start(&self) -> u32 {
        1
    }
    pub fn ifree_start(&self) -> u32 {
        self.istore_start() + self.nr_istore_blocks
    }
    pub fn bfree_start(&self) -> u32 {
        self.ifree_start() + self.nr_ifree_blocks
    }
    pub fn idfree_start(&self) -> u32 {
        self.bfree_start() + self.nr_bfree_blocks
    }
    pub fn ididx_start(&self) -> u32 {
        self.idfree_start() + self.nr_idfree_blocks
    }
    pub fn meta_start(&self) -> u32 {
        self.ididx_start() + self.nr_ididx_blocks
    }
    pub fn data_start(&self) -> u32 {
        self.meta_start() + self.nr_meta_blocks
    }

    /// Block that contains inode record `ino`.
    pub fn iblock(&self, ino: u32) -> u32 {
        self.istore_start() + ino / IPB as u32
    }
    /// Offset of inode `ino` within its block.
    pub fn ioffset(&self, ino: u32) -> usize {
        (ino as usize % IPB) * core::mem::size_of::<InodeRecord>()
    }

    /// Ididx block holding the backing-block pointer for `idx`.
    pub fn ididx_block(&self, idx: u32) -> u32 {
        self.ididx_start() + idx / (IDE as u32 * B32 as u32)
    }
    /// Index within that ididx block (which inode-data block within the ididx block's range).
    pub fn ididx_index(&self, idx: u32) -> usize {
        (idx as usize % (IDE * B32)) / IDE
    }
    /// Offset of the entry within the inode-data block.
    pub fn ididx_shift(&self, idx: u32) -> usize {
        idx as usize % IDE
    }

    /// Metadata block carrying the refcount byte for data block `bno`.
    pub fn meta_block(&self, bno: u32) -> u32 {
        self.meta_start() + (bno - self.data_start()) / BLOCK_SIZE as u32
    }
    /// Offset of `bno`'s refcount byte within its metadata block.
    pub fn meta_shift(&self, bno: u32) -> usize {
        (bno - self.data_start()) as usize % BLOCK_SIZE
    }

    pub fn live_snapshot_id(&self) -> u32 {
        self.snapshots[LIVE_SLOT].id
    }

    pub fn label_str(&self) -> &str {
        let len = self.label.iter().position(|&b| b == 0).unwrap_or(LABEL_LEN);
        core::str::from_utf8(&self.label[..len]).unwrap_or("")
    }

    /// Sets the volume label, truncating to `LABEL_LEN` bytes and NUL-padding the rest.
    pub fn set_label(&mut self, label: &str) {
        self.label = [0u8; LABEL_LEN];
        let bytes = label.as_bytes();
        let n = bytes.len().min(LABEL_LEN);
        self.label[..n].copy_from_slice(&bytes[..n]);
    }
}

fn ceil_div(a: u32, b: u32) -> u32 {
    (a + b - 1) / b
}

/// Computes a fresh superblock's region counters from a requested device size in blocks, using
/// the source mkfs's 1:1 block-to-inode ratio (`compute_layout_with(nr_blocks, BLOCK_SIZE)`).
pub fn compute_layout(nr_blocks: u32) -> Superblock {
    compute_layout_with(nr_blocks, BLOCK_SIZE as u32)
}

/// As [`compute_layout`], but `inode_ratio` sets the target bytes-of-volume per inode
/// (ext2 `mke2fs -i` convention) instead of assuming a 1:1 block-to-inode ratio. The inode count
/// is never allowed to exceed `nr_blocks`, since the metadata regions derived from it must still
/// fit inside the volume.
pub fn compute_layout_with(nr_blocks: u32, inode_ratio: u32) -> Superblock {
    let by_ratio = (nr_blocks as u64 * BLOCK_SIZE as u64) / inode_ratio.max(1) as u64;
    let nr_inodes = by_ratio.clamp(1, nr_blocks as u64) as u32;
    let nr_inode_data_entries = nr_inodes * MAX_SNAPSHOTS as u32;

    let nr_istore_blocks = ceil_div(nr_inodes, IPB as u32);
    let nr_ifree_blocks = ceil_div(nr_inodes, (BLOCK_SIZE * 8) as u32);
    let nr_bfree_blocks = ceil_div(nr_blocks, (BLOCK_SIZE * 8) as u32);
    let nr_idfree_blocks = ceil_div(nr_inode_data_entries, (BLOCK_SIZE * 8) as u32);
    let nr_ididx_blocks = ceil_div(nr_inode_data_entries, (IDE * B32) as u32).max(1);

    // Reserve all remaining blocks as data region first, then size the metadata region to
    // cover it; meta covers one byte per data block, BLOCK_SIZE bytes per meta block.
    let used_so_far = 1 + nr_istore_blocks + nr_ifree_blocks + nr_bfree_blocks
        + nr_idfree_blocks
        + nr_ididx_blocks;
    // Solve nr_meta_blocks + data_blocks = nr_blocks - used_so_far,
    // data_blocks <= nr_meta_blocks * BLOCK_SIZE.
    let remaining = nr_blocks.saturating_sub(used_so_far);
    let nr_meta_blocks = ceil_div(remaining, BLOCK_SIZE as u32 + 1).max(1);

    let mut sb = Superblock {
        magic: MAGIC,
        nr_blocks,
        nr_inodes,
        nr_inode_data_entries,
        nr_istore_blocks,
        nr_ifree_blocks,
        nr_bfree_blocks,
        nr_idfree_blocks,
        nr_ididx_blocks,
        nr_meta_blocks,
        nr_free_inodes: nr_inodes,
        nr_free_blocks: 0,
        nr_free_inode_data_entries: nr_inode_data_entries,
        label: [0u8; LABEL_LEN],
        snapshots: [SnapshotSlot::EMPTY; MAX_SNAPSHOTS],
        _reserved: [0; BLOCK_SIZE - 52 - LABEL_LEN - MAX_SNAPSHOTS * 16],
    };
    sb.nr_free_blocks = sb.nr_blocks - sb.data_start();
    sb
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offsets_are_monotonic() {
        let sb = compute_layout(4096);
        assert!(sb.ifree_start() > sb.istore_start());
        assert!(sb.bfree_start() > sb.ifree_start());
        assert!(sb.idfree_start() > sb.bfree_start());
        assert!(sb.ididx_start() > sb.idfree_start());
        assert!(sb.meta_start() > sb.ididx_start());
        assert!(sb.data_start() > sb.meta_start());
        assert!(sb.data_start() < sb.nr_blocks);
    }

    #[test]
    fn meta_roundtrip() {
        let sb = compute_layout(4096);
        let bno = sb.data_start() + 5;
        assert_eq!(sb.meta_shift(bno), 5);
        assert_eq!(sb.meta_block(bno), sb.meta_start());
    }

    #[test]
    fn ratio_matches_default_at_one_block_per_inode() {
        let sb = compute_layout(4096);
        let ratioed = compute_layout_with(4096, BLOCK_SIZE as u32);
        assert_eq!(sb.nr_inodes, ratioed.nr_inodes);
    }

    #[test]
    fn sparser_ratio_yields_fewer_inodes() {
        let sb = compute_layout_with(4096, 4 * BLOCK_SIZE as u32);
        assert!(sb.nr_inodes < 4096);
        assert!(sb.nr_inodes >= 1);
    }

    #[test]
    fn label_roundtrips_and_truncates() {
        let mut sb = compute_layout(256);
        sb.set_label("data");
        assert_eq!(sb.label_str(), "data");
        sb.set_label("a label far longer than sixteen bytes");
        assert_eq!(sb.label_str(), "a label far long");
    }
}
