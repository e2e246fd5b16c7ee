//! vmdkio CLI - Inspect and extract VMware VMDK virtual disks.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use log::{debug, info, LevelFilter};
use sha2::{Digest, Sha256};
use vmdkio_core::vmdk::ExtentBacking;
use vmdkio_core::{check_signature, Handle, OpenOptions, ReadOutcome};

/// Buffer size for streaming the whole disk (4 MiB).
const COPY_BUFFER_SIZE: usize = 4 * 1024 * 1024;

/// Read-only tool for inspecting and extracting VMDK virtual disks.
#[derive(Parser)]
#[command(name = "vmdkio")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Increase log verbosity (-v info, -vv debug, -vvv trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

/// Options applied when opening an image.
#[derive(Args, Clone)]
struct OpenArgs {
    /// Read backing files with read calls instead of memory mapping them.
    #[arg(long)]
    no_mmap: bool,

    /// Number of decompressed grains cached per sparse extent (0 disables).
    /// Defaults to 32, or 256 for commands that read the whole disk.
    #[arg(long)]
    grain_cache: Option<usize>,

    /// Open extents one after another instead of in parallel.
    #[arg(long)]
    serial: bool,
}

impl OpenArgs {
    fn to_options(&self, streaming: bool) -> OpenOptions {
        let base = if streaming {
            OpenOptions::sequential()
        } else {
            OpenOptions::new()
        };
        let grain_cache = self.grain_cache.unwrap_or(base.grain_cache_size);
        base.use_mmap(!self.no_mmap)
            .grain_cache_size(grain_cache)
            .parallel_resolve(!self.serial)
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Display the descriptor and extents of an image.
    Info {
        /// Path to the descriptor or monolithic sparse file.
        image: PathBuf,

        #[command(flatten)]
        open: OpenArgs,
    },

    /// Check that a file is a VMDK image and that all of its extents open.
    Check {
        /// Path to the descriptor or monolithic sparse file.
        image: PathBuf,

        /// Also read every byte of the disk to find corrupt grains.
        #[arg(long)]
        full: bool,

        #[command(flatten)]
        open: OpenArgs,
    },

    /// Export the disk contents to a raw image.
    Export {
        /// Path to the descriptor or monolithic sparse file.
        image: PathBuf,

        /// Output raw image path. Defaults to the image name with .raw extension.
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Suppress progress output.
        #[arg(short, long)]
        quiet: bool,

        #[command(flatten)]
        open: OpenArgs,
    },

    /// Compute the SHA-256 of the disk contents.
    Hash {
        /// Path to the descriptor or monolithic sparse file.
        image: PathBuf,

        /// Suppress progress output.
        #[arg(short, long)]
        quiet: bool,

        #[command(flatten)]
        open: OpenArgs,
    },

    /// Print a hex dump of a range of the disk.
    Dump {
        /// Path to the descriptor or monolithic sparse file.
        image: PathBuf,

        /// Byte offset to start at.
        #[arg(short = 'O', long, default_value = "0")]
        offset: u64,

        /// Number of bytes to dump.
        #[arg(short, long, default_value = "512")]
        size: usize,

        #[command(flatten)]
        open: OpenArgs,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let level_filter = match cli.verbose {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        2 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };
    env_logger::Builder::new().filter_level(level_filter).init();

    match cli.command {
        Commands::Info { image, open } => show_info(&image, &open)?,
        Commands::Check { image, full, open } => run_check(&image, full, &open)?,
        Commands::Export {
            image,
            output,
            quiet,
            open,
        } => run_export(&image, output.as_deref(), quiet, &open)?,
        Commands::Hash { image, quiet, open } => run_hash(&image, quiet, &open)?,
        Commands::Dump {
            image,
            offset,
            size,
            open,
        } => run_dump(&image, offset, size, &open)?,
    }

    Ok(())
}

fn open_image(image: &Path, open: &OpenArgs, streaming: bool) -> Result<Handle> {
    let options = open.to_options(streaming);
    debug!("Open options: {:?}", options);
    Handle::open(image, &options).with_context(|| format!("Failed to open {}", image.display()))
}

fn show_info(image: &Path, open: &OpenArgs) -> Result<()> {
    let handle = open_image(image, open, false)?;
    let manifest = handle.manifest()?;

    println!("VMDK Information");
    println!("================");
    println!();
    println!("File:        {}", image.display());
    println!("Create type: {}", manifest.create_type);
    println!("Version:     {}", manifest.version);
    println!("CID:         {:08x}", manifest.cid);
    println!(
        "Size:        {} ({} sectors)",
        format_bytes(handle.media_size()?),
        manifest.total_sectors()
    );
    if let Some(adapter) = &manifest.adapter_type {
        println!("Adapter:     {}", adapter);
    }
    if let Some(geometry) = &manifest.geometry {
        println!(
            "Geometry:    {}/{}/{} (C/H/S)",
            geometry.cylinders, geometry.heads, geometry.sectors
        );
    }
    if let Some(hw_version) = &manifest.hw_version {
        println!("HW version:  {}", hw_version);
    }
    if let Some(uuid) = &manifest.uuid {
        println!("UUID:        {}", uuid);
    }
    println!();

    println!("Extents:");
    for (i, extent) in handle.disk()?.extents().iter().enumerate() {
        let spec = extent.spec();
        let detail = match extent.backing() {
            ExtentBacking::Sparse(sparse) => format!(
                ", grain {}{}",
                format_bytes(sparse.grain_size_bytes()),
                if sparse.header().is_compressed() {
                    ", compressed"
                } else {
                    ""
                }
            ),
            ExtentBacking::Flat(_) if spec.file_offset > 0 => {
                format!(", file offset {} sectors", spec.file_offset)
            }
            _ => String::new(),
        };
        println!(
            "  {}. {} {} {} - {} at sector {}{}",
            i + 1,
            spec.access,
            spec.extent_type,
            spec.filename.as_deref().unwrap_or("-"),
            format_bytes(spec.size_bytes()),
            spec.start_sector,
            detail
        );
    }

    Ok(())
}

fn run_check(image: &Path, full: bool, open: &OpenArgs) -> Result<()> {
    if !check_signature(image)? {
        anyhow::bail!("{} is not a VMDK descriptor or sparse extent", image.display());
    }
    let mut handle = open_image(image, open, full)?;
    let extents = handle.extent_descriptors()?.len();
    println!(
        "{}: OK ({} extent(s), {})",
        image.display(),
        extents,
        format_bytes(handle.media_size()?)
    );

    if full {
        let total = stream_disk(&mut handle, None, |_| Ok(()))?;
        println!("Read {} without errors", format_bytes(total));
    }
    Ok(())
}

fn run_export(image: &Path, output: Option<&Path>, quiet: bool, open: &OpenArgs) -> Result<()> {
    let mut handle = open_image(image, open, true)?;
    let media_size = handle.media_size()?;

    let output_path = match output {
        Some(path) => path.to_path_buf(),
        None => image.with_extension("raw"),
    };
    if output_path == image {
        anyhow::bail!("Output path would overwrite the input image");
    }

    if !quiet {
        println!("VMDK Export");
        println!("-----------");
        println!("Input:     {}", image.display());
        println!("Output:    {}", output_path.display());
        println!("Size:      {}", format_bytes(media_size));
        println!();
    }

    let file = File::create(&output_path)
        .with_context(|| format!("Failed to create {}", output_path.display()))?;
    let mut writer = BufWriter::new(file);

    let progress_bar = if quiet {
        None
    } else {
        Some(new_progress_bar(media_size)?)
    };
    let written = stream_disk(&mut handle, progress_bar.as_ref(), |chunk| {
        writer.write_all(chunk)?;
        Ok(())
    })?;
    writer.flush()?;

    if let Some(pb) = progress_bar {
        pb.finish_with_message("Complete!");
    }
    info!("Wrote {} bytes to {}", written, output_path.display());

    if !quiet {
        println!();
        println!("Export completed successfully: {}", output_path.display());
    }
    Ok(())
}

fn run_hash(image: &Path, quiet: bool, open: &OpenArgs) -> Result<()> {
    let mut handle = open_image(image, open, true)?;
    let media_size = handle.media_size()?;

    let progress_bar = if quiet {
        None
    } else {
        Some(new_progress_bar(media_size)?)
    };
    let mut hasher = Sha256::new();
    stream_disk(&mut handle, progress_bar.as_ref(), |chunk| {
        hasher.update(chunk);
        Ok(())
    })?;
    if let Some(pb) = progress_bar {
        pb.finish_and_clear();
    }

    let digest = hasher.finalize();
    let hex: String = digest.iter().map(|b| format!("{:02x}", b)).collect();
    println!("{}  {}", hex, image.display());
    Ok(())
}

fn run_dump(image: &Path, offset: u64, size: usize, open: &OpenArgs) -> Result<()> {
    let mut handle = open_image(image, open, false)?;
    let mut buf = vec![0u8; size];
    let n = handle.read_at(offset, &mut buf)?;
    if n < size {
        info!("End of disk reached after {} bytes", n);
    }

    for (i, line) in buf[..n].chunks(16).enumerate() {
        let hex: Vec<String> = line.iter().map(|b| format!("{:02x}", b)).collect();
        let ascii: String = line
            .iter()
            .map(|&b| if b.is_ascii_graphic() || b == b' ' { b as char } else { '.' })
            .collect();
        println!(
            "{:016x}  {:<47}  |{}|",
            offset + (i * 16) as u64,
            hex.join(" "),
            ascii
        );
    }
    Ok(())
}

/// Reads the disk from the start in large chunks, handing each to `sink`.
fn stream_disk<F>(handle: &mut Handle, progress: Option<&ProgressBar>, mut sink: F) -> Result<u64>
where
    F: FnMut(&[u8]) -> Result<()>,
{
    handle.seek(0, vmdkio_core::Whence::Start)?;
    let mut buf = vec![0u8; COPY_BUFFER_SIZE];
    let mut total = 0u64;

    loop {
        let outcome = handle
            .read_into(&mut buf)
            .with_context(|| format!("Read failed at offset {}", total))?;
        let n = outcome.bytes_read();
        sink(&buf[..n])?;
        total += n as u64;
        if let Some(pb) = progress {
            pb.set_position(total);
        }
        if let ReadOutcome::EndOfDisk(_) = outcome {
            break;
        }
    }
    Ok(total)
}

fn new_progress_bar(total: u64) -> Result<ProgressBar> {
    let pb = ProgressBar::new(total);
    let style = ProgressStyle::default_bar()
        .template("{spinner:.green} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec}, {eta})")?
        .progress_chars("#>-");
    pb.set_style(style);
    Ok(pb)
}

/// Format bytes as human-readable string.
fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;
    const TB: u64 = GB * 1024;

    if bytes >= TB {
        format!("{:.2} TB", bytes as f64 / TB as f64)
    } else if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}
