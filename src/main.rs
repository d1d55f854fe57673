use std::ops::ControlFlow;
use std::path::PathBuf;
use std::time::Instant;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::debug;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use treedelta::tree::display_hash;
use treedelta::{
    reader, ApplyOptions, Compression, CompressionSpec, CreateOptions, MajorVersion,
    PatchSummary,
};

#[derive(Parser)]
#[command(
    name = "treedelta",
    about = "Create and apply binary patches between directory trees"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a patch that turns BEFORE into AFTER
    Create {
        /// Archive major version to write
        #[arg(long = "version", value_name = "MAJOR", default_value_t = MajorVersion::LATEST.as_u16())]
        major: u16,
        /// none, gzip, zstd, lz4 or zlib; defaults to the best the version allows
        #[arg(long, value_name = "NAME")]
        compression: Option<Compression>,
        /// Codec level; 0 picks the codec default
        #[arg(long, value_name = "LEVEL", default_value_t = 0)]
        compression_level: u8,
        /// Log every archived operation
        #[arg(long, short)]
        verbose: bool,
        before: PathBuf,
        after: PathBuf,
        patch: PathBuf,
    },
    /// Apply PATCH to BEFORE, producing AFTER (may be the same directory)
    Apply {
        /// Log every applied operation
        #[arg(long, short)]
        verbose: bool,
        before: PathBuf,
        after: PathBuf,
        patch: PathBuf,
    },
    /// Show a patch's format version, or the newest this tool writes
    Info { patch: Option<PathBuf> },
}

impl Commands {
    fn verbose(&self) -> bool {
        match self {
            Commands::Create { verbose, .. } | Commands::Apply { verbose, .. } => *verbose,
            Commands::Info { .. } => false,
        }
    }
}

fn init_tracing(verbose: bool) {
    let env_filter = if verbose {
        tracing_subscriber::EnvFilter::new("debug")
    } else {
        tracing_subscriber::EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into())
    };

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(env_filter)
        .init();
}

fn print_summary(summary: &PatchSummary) {
    println!("  Added: {}", summary.added);
    println!("  Removed: {}", summary.removed);
    println!("  Content modified: {}", summary.content_modified);
    println!("  Permissions modified: {}", summary.permissions_modified);
    println!("  Symlinks retargeted: {}", summary.symlinks_retargeted);
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.command.verbose());

    match cli.command {
        Commands::Create {
            major,
            compression,
            compression_level,
            verbose,
            before,
            after,
            patch,
        } => {
            let major_version = MajorVersion::from_u16(major)?;
            let mode = compression.unwrap_or(major_version.default_compression().mode);
            let options = CreateOptions {
                major_version,
                compression: CompressionSpec::new(mode, compression_level),
                verbose,
            };

            println!("Creating patch...");
            println!("  Before: {}", before.display());
            println!("  After: {}", after.display());
            println!("  Output: {}", patch.display());

            let start = Instant::now();
            let summary = treedelta::create_patch(&before, &after, &patch, &options)
                .await
                .with_context(|| format!("failed to create {}", patch.display()))?;
            let elapsed = start.elapsed();
            let size = std::fs::metadata(&patch)
                .with_context(|| format!("failed to stat {}", patch.display()))?
                .len();

            println!("\nPatch created successfully!");
            print_summary(&summary);
            println!(
                "  Format: {} ({})",
                treedelta::PatchHeader::for_version(major_version),
                options.compression
            );
            println!("  Size: {size} bytes");
            println!("  Time elapsed: {:.3}s", elapsed.as_secs_f64());
        }
        Commands::Apply {
            verbose,
            before,
            after,
            patch,
        } => {
            println!("Applying patch...");
            println!("  Before: {}", before.display());
            println!("  After: {}", after.display());
            println!("  Patch: {}", patch.display());

            let options = ApplyOptions {
                verbose,
                ..ApplyOptions::default()
            };
            let start = Instant::now();
            let summary = tokio::task::spawn_blocking(move || {
                treedelta::apply_patch(&before, &after, &patch, &options, |event| {
                    debug!(
                        "{:>5.1}% {}",
                        event.fraction() * 100.0,
                        event.operation.path()
                    );
                    ControlFlow::Continue(())
                })
            })
            .await?
            .context("failed to apply patch")?;
            let elapsed = start.elapsed();

            println!("\nPatch applied successfully!");
            print_summary(&summary);
            println!("  Time elapsed: {:.3}s", elapsed.as_secs_f64());
        }
        Commands::Info { patch } => match patch {
            Some(path) => {
                let header = treedelta::version_info(Some(&path))
                    .with_context(|| format!("failed to read {}", path.display()))?;
                println!("{}", path.display());
                println!("  Format: {header}");
                // The preamble is only readable for versions this build knows.
                match reader::read_info(&path) {
                    Ok(info) => {
                        println!("  Compression: {}", info.compression);
                        println!("  Before tree: {}", display_hash(&info.trees.before));
                        println!("  After tree: {}", display_hash(&info.trees.after));
                    }
                    Err(e) => println!("  Details unavailable: {e}"),
                }
            }
            None => {
                println!(
                    "Latest writable format: {}",
                    treedelta::version_info(None)?
                );
            }
        },
    }

    Ok(())
}
