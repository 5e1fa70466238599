//! `mkfs-wccowfs`: formats a file or block device as a wccowfs volume (§4.9, ambient).
//! Generalizes `mkfs-ouichefs.c`'s layout computation and raw superblock/bitmap writes; the
//! root directory itself is bootstrapped through the library's own inode/directory primitives
//! rather than hand-written disk writes.

use std::fs::OpenOptions;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use clap::Parser;

use wccowfs::error::{Error, Result};
use wccowfs::host::{BlockCache, MapInodeCache, NullQuiesce};
use wccowfs::layout::{Block, BLOCK_SIZE, MAGIC, S_IFDIR};
use wccowfs::{FormatOptions, Volume};

/// Minimum volume size required by the design (§4.9): at least 100 blocks.
const MIN_BLOCKS: u32 = 100;

#[derive(Parser, Debug)]
#[command(name = "mkfs-wccowfs", about = "Format a volume for wccowfs")]
struct Cli {
    /// Path to the file or block device to format.
    path: PathBuf,

    /// Number of 4 KiB blocks to format (overrides --config and the default).
    #[arg(short = 'b', long)]
    blocks: Option<u32>,

    /// TOML file with `FormatOptions`.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Reformat even if the target already looks like a wccowfs volume.
    #[arg(short, long)]
    force: bool,
}

struct FileBlockCache {
    file: Mutex<std::fs::File>,
}

impl BlockCache for FileBlockCache {
    fn read(&self, bno: u32) -> Result<Block> {
        let mut file = self.file.lock().unwrap();
        file.seek(SeekFrom::Start(bno as u64 * BLOCK_SIZE as u64))
            .map_err(|_| Error::Io)?;
        let mut buf = [0u8; BLOCK_SIZE];
        file.read_exact(&mut buf).map_err(|_| Error::Io)?;
        Ok(buf)
    }

    fn write(&self, bno: u32, data: &Block) -> Result<()> {
        let mut file = self.file.lock().unwrap();
        file.seek(SeekFrom::Start(bno as u64 * BLOCK_SIZE as u64))
            .map_err(|_| Error::Io)?;
        file.write_all(data).map_err(|_| Error::Io)
    }
}

fn load_format_options(cli: &Cli) -> Result<FormatOptions> {
    let mut opts = match &cli.config {
        Some(path) => {
            let text = std::fs::read_to_string(path).map_err(|_| Error::Io)?;
            toml::from_str(&text).map_err(|_| Error::Invalid)?
        }
        None => FormatOptions::default(),
    };
    if let Some(blocks) = cli.blocks {
        opts.nr_blocks = blocks;
    }
    if cli.force {
        opts.force = true;
    }
    Ok(opts)
}

fn looks_formatted(cache: &dyn BlockCache) -> bool {
    match cache.read(0) {
        Ok(block0) => {
            let magic = u32::from_le_bytes([block0[0], block0[1], block0[2], block0[3]]);
            magic == MAGIC
        }
        Err(_) => false,
    }
}

fn write_zero_blocks(cache: &dyn BlockCache, start: u32, count: u32) -> Result<()> {
    for i in 0..count {
        cache.write(start + i, &wccowfs::layout::ZERO_BLOCK)?;
    }
    Ok(())
}

fn format(path: &PathBuf, opts: &FormatOptions) -> Result<()> {
    if opts.nr_blocks < MIN_BLOCKS {
        log::error!("refusing to format {} blocks (< {} minimum)", opts.nr_blocks, MIN_BLOCKS);
        return Err(Error::Invalid);
    }

    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .open(path)
        .map_err(|_| Error::Io)?;
    file.set_len(opts.nr_blocks as u64 * BLOCK_SIZE as u64)
        .map_err(|_| Error::Io)?;
    let cache: Arc<dyn BlockCache> = Arc::new(FileBlockCache { file: Mutex::new(file) });

    if !opts.force && looks_formatted(&*cache) {
        log::error!("{} already looks like a wccowfs volume; pass --force to reformat", path.display());
        return Err(Error::Exists);
    }

    let mut sb = wccowfs::volume::fresh_layout(opts.nr_blocks, opts.inode_ratio);
    if let Some(label) = &opts.label {
        sb.set_label(label);
    }
    let mut block0 = [0u8; BLOCK_SIZE];
    block0[..core::mem::size_of::<wccowfs::layout::Superblock>()]
        .copy_from_slice(zerocopy::AsBytes::as_bytes(&sb));
    cache.write(0, &block0)?;

    write_zero_blocks(&*cache, sb.istore_start(), sb.nr_istore_blocks)?;
    write_zero_blocks(&*cache, sb.ididx_start(), sb.nr_ididx_blocks)?;
    write_zero_blocks(&*cache, sb.meta_start(), sb.nr_meta_blocks)?;
    wccowfs::bitmap::format_bitmap(&*cache, sb.ifree_start(), sb.nr_ifree_blocks, sb.nr_inodes as usize, 0)?;
    // The data region's bitmap is addressed by absolute block number (§4.2), so the metadata
    // regions preceding data_start() must be pre-reserved the way write_bfree_blocks's nr_used
    // prefix does; the root's own data block is then allocated normally below.
    wccowfs::bitmap::format_bitmap(
        &*cache,
        sb.bfree_start(),
        sb.nr_bfree_blocks,
        sb.nr_blocks as usize,
        sb.data_start() as usize,
    )?;
    wccowfs::bitmap::format_bitmap(
        &*cache,
        sb.idfree_start(),
        sb.nr_idfree_blocks,
        sb.nr_inode_data_entries as usize,
        0,
    )?;

    let volume = Volume::mount(cache, Arc::new(NullQuiesce), Arc::new(MapInodeCache::new()))?;

    // Reserve ino 1 for the root directory (bit 0 is the bitmap's own sentinel).
    volume.ifree.alloc();
    let mut root = volume.ifill(wccowfs::ROOT_INO, true)?;
    let dir_block = volume.alloc_block()?;
    root.data.mode = S_IFDIR | 0o775;
    root.data.size = BLOCK_SIZE as u64;
    root.data.blocks = 1;
    root.data.nlink = 2;
    root.data.index_block = dir_block;
    root.data.refcount = 1;
    volume.writeback(&root)?;
    volume.sync_fs(true)?;

    log::info!(
        "formatted {} as wccowfs: {} blocks, {} inodes, root at ino={} idx={}",
        path.display(),
        opts.nr_blocks,
        sb.nr_inodes,
        wccowfs::ROOT_INO,
        wccowfs::ROOT_IDX
    );
    Ok(())
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();
    let opts = match load_format_options(&cli) {
        Ok(opts) => opts,
        Err(e) => {
            eprintln!("mkfs-wccowfs: {}", e);
            std::process::exit(e.errno().unsigned_abs() as i32);
        }
    };
    if let Err(e) = format(&cli.path, &opts) {
        eprintln!("mkfs-wccowfs: {}", e);
        std::process::exit(e.errno().unsigned_abs() as i32);
    }
}
