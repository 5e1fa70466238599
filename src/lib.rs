//! wccowfs: a block-addressed, copy-on-write file system with explicit whole-volume snapshots.

pub mod bitmap;
mod block;
pub mod config;
pub mod control;
mod dir;
pub mod error;
mod file;
pub mod host;
mod inode;
mod inode_data;
pub mod layout;
pub mod snapshot;
#[cfg(test)]
mod testutil;
pub mod volume;

pub use config::{FormatOptions, MountOptions};
pub use control::SnapshotControl;
pub use error::{Error, Result};
pub use file::RemapFlags;
pub use inode::{InodeHandle, RenameFlags};
pub use snapshot::SnapshotInfo;
pub use volume::{BlockCategory, StatFs, Volume, ROOT_IDX, ROOT_INO};
