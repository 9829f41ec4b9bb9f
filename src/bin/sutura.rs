//! Sutura CLI - binary delta patching for file trees.

use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use sutura::blockpool::{
    apply_remote, read_manifest, upload_tree, write_manifest, BlockTransport, DiskStore,
    RemoteOptions, DEFAULT_BIG_BLOCK_SIZE,
};
use sutura::{
    accept_all, compute_signature, heal_from_dir, read_signature, write_signature, ApplyBuilder,
    BsdiffPolicy, CompressionAlgorithm, CompressionSettings, Container, DiffBuilder, FsPool,
    NoProgress, PatchReader, Result, SuturaError, ValidateBuilder,
};

/// Sutura - binary delta patching for file trees
#[derive(Parser)]
#[command(name = "sutura")]
#[command(version)]
#[command(about = "Diff, patch, verify and heal file trees")]
#[command(long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct CompressionArgs {
    /// Artifact compression, as `name` or `name:quality` (none, brotli, zstd, gzip)
    #[arg(short, long, default_value = "brotli:1")]
    compression: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Compute the signature of a tree
    Sign {
        /// Tree to sign
        dir: PathBuf,

        /// Signature file to write
        #[arg(short, long)]
        output: PathBuf,

        #[command(flatten)]
        compression: CompressionArgs,
    },

    /// Write a patch from an old tree to a new one
    Diff {
        /// Old tree
        old: PathBuf,

        /// New tree
        new: PathBuf,

        /// Patch file to write
        #[arg(short, long)]
        output: PathBuf,

        /// Only use block matching
        #[arg(long)]
        no_bsdiff: bool,

        #[command(flatten)]
        compression: CompressionArgs,
    },

    /// Apply a patch to an old tree
    Apply {
        /// Patch file
        patch: PathBuf,

        /// Old tree
        dir: PathBuf,

        /// Write the new tree here
        #[arg(short, long, conflicts_with_all = ["in_place", "dry_run"])]
        output: Option<PathBuf>,

        /// Replace the old tree with the new one
        #[arg(long)]
        in_place: bool,

        /// Check the patch against the old tree without writing anything
        #[arg(long)]
        dry_run: bool,

        /// Verify old blocks against this signature of the old tree
        #[arg(long)]
        signature: Option<PathBuf>,

        /// Record corrupt old blocks here instead of failing
        #[arg(long, conflicts_with = "heal_from")]
        wounds: Option<PathBuf>,

        /// Repair corrupt old blocks from this healthy copy of the old tree
        #[arg(long)]
        heal_from: Option<PathBuf>,
    },

    /// Check a tree against a signature
    Verify {
        /// Signature file
        signature: PathBuf,

        /// Tree to check
        dir: PathBuf,

        /// Record wounds here instead of failing on the first one
        #[arg(long, conflicts_with = "heal_from")]
        wounds: Option<PathBuf>,

        /// Repair wounds from this healthy copy of the tree
        #[arg(long)]
        heal_from: Option<PathBuf>,
    },

    /// Repair a tree from a wounds file
    Heal {
        /// Wounds file written by `verify --wounds`
        wounds: PathBuf,

        /// Tree to repair
        dir: PathBuf,

        /// Healthy copy of the tree
        #[arg(short, long)]
        source: PathBuf,
    },

    /// Store a tree as big blocks and write its manifest
    Upload {
        /// Tree to store
        dir: PathBuf,

        /// Block store directory
        #[arg(long)]
        store: PathBuf,

        /// Manifest file to write
        #[arg(short, long)]
        output: PathBuf,

        /// Big block size in bytes
        #[arg(long, default_value_t = DEFAULT_BIG_BLOCK_SIZE)]
        big_block_size: u64,
    },

    /// Apply a patch to a stored tree, storing the new tree
    RemoteApply {
        /// Patch file
        patch: PathBuf,

        /// Manifest of the old tree
        manifest: PathBuf,

        /// Block store directory
        #[arg(long)]
        store: PathBuf,

        /// Manifest file to write for the new tree
        #[arg(short, long)]
        output: PathBuf,

        /// Parallel upload workers
        #[arg(long, default_value_t = 4)]
        fan_out: usize,

        /// Simulated latency per block, in milliseconds
        #[arg(long)]
        latency_ms: Option<u64>,
    },
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Sign {
            dir,
            output,
            compression,
        } => run_sign(&dir, &output, parse_compression(&compression.compression)?),
        Commands::Diff {
            old,
            new,
            output,
            no_bsdiff,
            compression,
        } => run_diff(
            &old,
            &new,
            &output,
            no_bsdiff,
            parse_compression(&compression.compression)?,
        ),
        Commands::Apply {
            patch,
            dir,
            output,
            in_place,
            dry_run,
            signature,
            wounds,
            heal_from,
        } => {
            let mut builder = ApplyBuilder::new();
            builder = match (output, in_place, dry_run) {
                (Some(out), false, false) => builder.output_dir(&out),
                (None, true, false) => builder.in_place().allow_in_place(true),
                (None, false, true) => builder.dry_run(),
                _ => {
                    return Err(SuturaError::Usage(
                        "pass exactly one of --output, --in-place, --dry-run".into(),
                    ))
                }
            };
            if let Some(path) = signature {
                builder = builder.signature(read_signature(BufReader::new(File::open(path)?))?);
            }
            if let Some(path) = wounds {
                builder = builder.wounds_path(&path);
            }
            if let Some(healthy) = heal_from {
                let target = PatchReader::open(BufReader::new(File::open(&patch)?))?.target;
                builder = builder.heal_source(Box::new(FsPool::new(&target, &healthy)));
            }
            let stats = builder
                .build()?
                .apply_patch(BufReader::new(File::open(&patch)?), &dir, &NoProgress)?;
            println!(
                "Applied {}: {} written, {} unchanged, {} deleted, {} wounds, {} bytes healed",
                patch.display(),
                stats.touched_files,
                stats.noop_files,
                stats.deleted_files,
                stats.wounds,
                stats.healed_bytes
            );
            Ok(())
        }
        Commands::Verify {
            signature,
            dir,
            wounds,
            heal_from,
        } => run_verify(&signature, &dir, wounds, heal_from),
        Commands::Heal {
            wounds,
            dir,
            source,
        } => {
            let summary = heal_from_dir(
                BufReader::new(File::open(&wounds)?),
                &dir,
                &source,
                &NoProgress,
            )?;
            println!(
                "Healed {}: {} bytes from {} wounds, {} failed",
                dir.display(),
                summary.healed_bytes,
                summary.count,
                summary.failed_wounds
            );
            if summary.failed_wounds > 0 {
                return Err(SuturaError::Malformed(format!(
                    "{} wounds could not be healed",
                    summary.failed_wounds
                )));
            }
            Ok(())
        }
        Commands::Upload {
            dir,
            store,
            output,
            big_block_size,
        } => {
            let container = Container::walk_directory(&dir, &accept_all)?;
            let mut pool = FsPool::new(&container, &dir);
            let store: Arc<dyn BlockTransport> = Arc::new(DiskStore::new(&store));
            let manifest = upload_tree(&container, &mut pool, &store, big_block_size)?;
            save_manifest(&output, &manifest)?;
            println!(
                "Stored {} ({} blocks) -> {}",
                dir.display(),
                manifest.hashes.len(),
                output.display()
            );
            Ok(())
        }
        Commands::RemoteApply {
            patch,
            manifest,
            store,
            output,
            fan_out,
            latency_ms,
        } => {
            let old = read_manifest(BufReader::new(File::open(&manifest)?))?;
            let mut options = RemoteOptions::new()
                .big_block_size(old.big_block_size)
                .fan_out(fan_out);
            if let Some(ms) = latency_ms {
                options = options.latency(Duration::from_millis(ms));
            }
            let store: Arc<dyn BlockTransport> = Arc::new(DiskStore::new(&store));
            let outcome = apply_remote(BufReader::new(File::open(&patch)?), &old, &store, &options)?;
            save_manifest(&output, &outcome.manifest)?;
            println!(
                "Applied {}: {} blocks reused, {} uploaded, {} fetched -> {}",
                patch.display(),
                outcome.stats.reused_blocks,
                outcome.stats.fresh_blocks,
                outcome.stats.fetched_blocks,
                output.display()
            );
            Ok(())
        }
    }
}

fn run_sign(dir: &Path, output: &Path, compression: CompressionSettings) -> Result<()> {
    let container = Container::walk_directory(dir, &accept_all)?;
    let mut pool = FsPool::new(&container, dir);
    let signature = compute_signature(&container, &mut pool, &NoProgress)?;
    let mut writer = write_signature(BufWriter::new(File::create(output)?), compression, &signature)?;
    writer.flush()?;
    println!(
        "Generated signature: {} ({}, {} blocks)",
        output.display(),
        container.stats(),
        signature.hashes.len()
    );
    Ok(())
}

fn run_diff(
    old: &Path,
    new: &Path,
    output: &Path,
    no_bsdiff: bool,
    compression: CompressionSettings,
) -> Result<()> {
    let mut builder = DiffBuilder::new().compression(compression);
    if no_bsdiff {
        builder = builder.bsdiff(BsdiffPolicy::disabled());
    }
    let mut writer = BufWriter::new(File::create(output)?);
    let outcome = builder
        .build()?
        .diff_trees(old, new, &mut writer, &NoProgress)?;
    writer.flush()?;
    let stats = outcome.stats;
    info!(
        rsync_files = stats.rsync_files,
        bsdiff_files = stats.bsdiff_files,
        "diff done"
    );
    println!(
        "Generated patch: {} ({} bytes reused, {} bytes fresh, {:.1}% reuse)",
        output.display(),
        stats.reused_bytes,
        stats.fresh_bytes,
        stats.reuse_ratio() * 100.0
    );
    Ok(())
}

fn run_verify(
    signature: &Path,
    dir: &Path,
    wounds: Option<PathBuf>,
    heal_from: Option<PathBuf>,
) -> Result<()> {
    let signature = read_signature(BufReader::new(File::open(signature)?))?;
    let mut builder = ValidateBuilder::new();
    if let Some(path) = &wounds {
        builder = builder.wounds_path(path);
    }
    if let Some(healthy) = &heal_from {
        builder = builder.heal_source(Box::new(FsPool::new(&signature.container, healthy)));
    }
    let summary = builder.build()?.validate(dir, &signature, &NoProgress)?;
    println!(
        "Verified {}: {} wounds, {} bytes corrupted, {} bytes healed",
        dir.display(),
        summary.count,
        summary.total_corrupted,
        summary.healed_bytes
    );
    Ok(())
}

fn save_manifest(path: &Path, manifest: &sutura::blockpool::Manifest) -> Result<()> {
    let mut writer = write_manifest(
        BufWriter::new(File::create(path)?),
        CompressionSettings::default(),
        manifest,
    )?;
    writer.flush()?;
    Ok(())
}

fn parse_compression(value: &str) -> Result<CompressionSettings> {
    let (name, quality) = match value.split_once(':') {
        Some((name, quality)) => {
            let quality = quality.parse::<i32>().map_err(|_| {
                SuturaError::Usage(format!("bad compression quality {quality:?}"))
            })?;
            (name, Some(quality))
        }
        None => (value, None),
    };
    let algorithm = CompressionAlgorithm::from_name(name)
        .ok_or_else(|| SuturaError::Usage(format!("unknown compression {name:?}")))?;
    let quality = quality.unwrap_or(1);
    Ok(CompressionSettings::new(algorithm, quality))
}
