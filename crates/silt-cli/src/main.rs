#![forbid(unsafe_code)]

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use silt_block::ChunkStore;
use silt_core::{Filesystem, SuperBlockHeader, read_header};
use silt_types::{ChunkSize, DEFAULT_CHUNK_SIZE};
use std::path::PathBuf;
use std::sync::Arc;

// ── CLI definition ──────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(name = "silt", about = "SiltFS — log-structured chunk filesystem toolkit")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Format a backing file as a fresh volume.
    Mkfs {
        /// Path to the backing file (created or truncated).
        backing_file: PathBuf,
        /// Volume size in bytes (rounded down to whole chunks).
        bytes: u64,
        /// Chunk size in bytes (power of two).
        #[arg(long, default_value_t = DEFAULT_CHUNK_SIZE)]
        chunk_size: u32,
        /// Fraction of the volume set aside for the inode table.
        #[arg(long, default_value_t = 0.1)]
        inode_fraction: f64,
    },
    /// Print a volume's superblock header.
    Inspect {
        /// Path to the backing file.
        backing_file: PathBuf,
        /// Volume size in bytes, as given at format time.
        bytes: u64,
        /// Chunk size in bytes, as given at format time.
        #[arg(long, default_value_t = DEFAULT_CHUNK_SIZE)]
        chunk_size: u32,
        /// Output in JSON format.
        #[arg(long)]
        json: bool,
    },
}

// ── Main ────────────────────────────────────────────────────────────────────

fn main() {
    if let Err(error) = run() {
        eprintln!("error: {error:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Mkfs {
            backing_file,
            bytes,
            chunk_size,
            inode_fraction,
        } => mkfs(&backing_file, bytes, chunk_size, inode_fraction),
        Command::Inspect {
            backing_file,
            bytes,
            chunk_size,
            json,
        } => inspect(&backing_file, bytes, chunk_size, json),
    }
}

fn volume_geometry(bytes: u64, chunk_size: u32) -> Result<(u64, ChunkSize)> {
    let chunk_size = ChunkSize::new(chunk_size).context("invalid chunk size")?;
    let chunk_count = bytes / u64::from(chunk_size.get());
    if chunk_count == 0 {
        bail!("{bytes} bytes is smaller than one chunk");
    }
    Ok((chunk_count, chunk_size))
}

fn mkfs(path: &PathBuf, bytes: u64, chunk_size: u32, inode_fraction: f64) -> Result<()> {
    let (chunk_count, chunk_size) = volume_geometry(bytes, chunk_size)?;
    let store = Arc::new(
        ChunkStore::create(path, chunk_count, chunk_size)
            .with_context(|| format!("creating backing file {}", path.display()))?,
    );
    let fs = Filesystem::format(store, inode_fraction).context("formatting volume")?;
    let header = fs.superblock().header().clone();
    fs.close().context("flushing fresh volume")?;

    println!(
        "formatted {}: {} chunks of {} bytes, {} inodes, {} segments of {} chunks",
        path.display(),
        header.disk_chunks,
        header.chunk_size,
        header.inode_count,
        header.segment_count,
        header.segment_size,
    );
    Ok(())
}

fn inspect(path: &PathBuf, bytes: u64, chunk_size: u32, json: bool) -> Result<()> {
    let (chunk_count, chunk_size) = volume_geometry(bytes, chunk_size)?;
    let store = ChunkStore::open(path, chunk_count, chunk_size)
        .with_context(|| format!("opening backing file {}", path.display()))?;
    let header = read_header(&store).context("reading superblock header")?;

    if json {
        println!("{}", serde_json::to_string_pretty(&header)?);
    } else {
        print_header(&header);
    }
    Ok(())
}

fn print_header(header: &SuperBlockHeader) {
    println!("disk:        {} bytes, {} chunks of {}", header.disk_bytes, header.disk_chunks, header.chunk_size);
    println!("block map:   chunk {} (+{})", header.block_map_offset, header.block_map_chunks);
    println!("inode table: chunk {} (+{}), {} inodes", header.inode_table_offset, header.inode_table_chunks, header.inode_count);
    println!("data region: chunk {}, {} segments of {} chunks", header.data_offset, header.segment_count, header.segment_size);
    println!("root inode:  {}", header.root_inode);
    println!("free:        {} segments", header.free_segments);
}
