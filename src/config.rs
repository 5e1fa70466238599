//! Ambient configuration (§1A): `FormatOptions` for `mkfs`, `MountOptions` for a host binding
//! this core into a filesystem front-end. Both are `serde`-deserializable from TOML, the way
//! the pack's userspace tools configure themselves.

use serde::{Deserialize, Serialize};

fn default_block_count() -> u32 {
    4096
}

fn default_inode_ratio() -> u32 {
    crate::layout::BLOCK_SIZE as u32
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FormatOptions {
    /// Size of the volume to format, in 4 KiB blocks.
    #[serde(default = "default_block_count")]
    pub nr_blocks: u32,
    /// Target bytes of volume per inode (ext2 `mke2fs -i` convention). Defaults to one inode per
    /// block, the source mkfs's fixed 1:1 ratio.
    #[serde(default = "default_inode_ratio")]
    pub inode_ratio: u32,
    /// Volume label, truncated to `layout::LABEL_LEN` bytes if longer.
    #[serde(default)]
    pub label: Option<String>,
    /// Overwrite an existing, already-formatted volume without prompting.
    #[serde(default)]
    pub force: bool,
}

impl Default for FormatOptions {
    fn default() -> Self {
        Self {
            nr_blocks: default_block_count(),
            inode_ratio: default_inode_ratio(),
            label: None,
            force: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MountOptions {
    /// Mount read-only; the core still exposes write paths, but a host should reject them.
    #[serde(default)]
    pub read_only: bool,
    /// Maximum number of in-memory inode handles the host's `InodeCache` should retain.
    #[serde(default = "default_inode_cache_size")]
    pub inode_cache_size: usize,
}

fn default_inode_cache_size() -> usize {
    1024
}

impl Default for MountOptions {
    fn default() -> Self {
        Self {
            read_only: false,
            inode_cache_size: default_inode_cache_size(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_options_defaults_from_empty_toml() {
        let opts: FormatOptions = toml::from_str("").unwrap();
        assert_eq!(opts.nr_blocks, 4096);
        assert_eq!(opts.inode_ratio, crate::layout::BLOCK_SIZE as u32);
        assert!(opts.label.is_none());
        assert!(!opts.force);
    }

    #[test]
    fn format_options_parses_ratio_and_label() {
        let opts: FormatOptions = toml::from_str("inode_ratio = 16384\nlabel = \"data\"\n").unwrap();
        assert_eq!(opts.inode_ratio, 16384);
        assert_eq!(opts.label.as_deref(), Some("data"));
    }

    #[test]
    fn mount_options_roundtrip() {
        let opts = MountOptions {
            read_only: true,
            inode_cache_size: 64,
        };
        let text = toml::to_string(&opts).unwrap();
        let back: MountOptions = toml::from_str(&text).unwrap();
        assert_eq!(back.inode_cache_size, 64);
        assert!(back.read_only);
    }
}
