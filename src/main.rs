use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use indicatif::{HumanBytes, ProgressBar, ProgressStyle};
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::{info, Level};

use netpatch::address::{ContentAddresser, SyntheticAddresser};
use netpatch::output::{DirectoryOutput, DiscardOutput, OutputPool};
use netpatch::pool::{HttpSource, SimulatedSource};
use netpatch::progress::ProgressSink;
use netpatch::required::{RequirementSummary, DEFAULT_FETCH_BLOCK_SIZE};
use netpatch::{
    open_patch, util, ApplyContext, ApplySummary, BlockAddresser, BlockPool, BlockSource,
    Container, Coverage, LocalPool, RemotePool, RemotePoolConfig, RequiredBlocks,
};

#[derive(Parser)]
#[command(name = "netpatch", about = "Apply block-level patches from local or remote old builds")]
struct Cli {
    /// Increase log verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
    /// Only log errors
    #[arg(short, long, global = true)]
    quiet: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Apply a patch, reading the old build from disk
    Apply {
        /// Directory holding the old build
        #[arg(long)]
        target: PathBuf,
        /// Path to the patch file
        #[arg(long, short)]
        patch: PathBuf,
        /// Directory to write the new build to
        #[arg(long, short)]
        output: PathBuf,
    },
    /// Show which old blocks a patch needs, then apply it through a remote block pool
    Ranges {
        /// Path to the patch file
        #[arg(long, short)]
        patch: PathBuf,
        /// Fetch block size in bytes
        #[arg(long, default_value_t = DEFAULT_FETCH_BLOCK_SIZE)]
        fetch_block_size: u64,
        /// Block store base URL; blocks are simulated when absent
        #[arg(long)]
        upstream: Option<String>,
        /// Simulated per-block latency in milliseconds
        #[arg(long, default_value_t = 0)]
        latency: u64,
        /// Local old build: serves unchanged bytes and content addresses
        #[arg(long)]
        target: Option<PathBuf>,
        /// Write the new build here instead of discarding it
        #[arg(long, short)]
        output: Option<PathBuf>,
        /// Concurrent background fetches
        #[arg(long, default_value_t = 4)]
        workers: usize,
        /// Fetch blocks kept in memory
        #[arg(long, default_value_t = 32)]
        cache_blocks: usize,
    },
    /// Compare two directory trees by BLAKE3 digest
    Verify {
        #[arg(long)]
        dir: PathBuf,
        #[arg(long)]
        reference: PathBuf,
    },
}

struct BarProgress(ProgressBar);

impl BarProgress {
    fn new(total: u64) -> Self {
        let bar = ProgressBar::new(total);
        let template =
            "{spinner:.green} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {percent}% ({eta})";
        if let Ok(style) = ProgressStyle::default_bar().template(template) {
            bar.set_style(style.progress_chars("#>-"));
        }
        Self(bar)
    }
}

impl ProgressSink for BarProgress {
    fn status(&self, line: &str) {
        self.0.set_message(line.to_string());
    }

    fn progress(&self, fraction: f64) {
        let len = self.0.length().unwrap_or(0);
        self.0.set_position((fraction * len as f64) as u64);
    }
}

fn init_logging(verbose: u8, quiet: bool) -> Result<()> {
    let level = if quiet {
        Level::ERROR
    } else {
        match verbose {
            0 => Level::WARN,
            1 => Level::INFO,
            2 => Level::DEBUG,
            _ => Level::TRACE,
        }
    };
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}

fn print_summary(summary: &ApplySummary) {
    let stats = &summary.stats;
    println!("  Files written: {}", stats.files);
    println!("  Bytes written: {}", HumanBytes(summary.bytes_written));
    println!("  Unchanged bytes: {}", HumanBytes(stats.unchanged_bytes));
    println!("  Moved bytes    : {}", HumanBytes(stats.moved_bytes));
    println!("  Fresh bytes    : {}", HumanBytes(stats.fresh_bytes));
    println!("  Likely renames: {}", stats.renames);
    println!("  Time elapsed: {:.3}s", summary.elapsed.as_secs_f64());
}

fn open_patch_file(path: &Path) -> Result<BufReader<File>> {
    let file =
        File::open(path).with_context(|| format!("Failed to open patch: {}", path.display()))?;
    Ok(BufReader::with_capacity(256 * 1024, file))
}

fn run_apply(target: &Path, patch: &Path, output: &Path, cancel: CancellationToken) -> Result<()> {
    let mut opened = open_patch(open_patch_file(patch)?)?;
    let pool = LocalPool::new(target, opened.target.clone());
    let mut out = DirectoryOutput::new(output);
    let bar = BarProgress::new(1000);

    let summary = ApplyContext::new(&pool, &mut out)
        .with_progress(&bar)
        .with_cancellation(cancel)
        .apply_opened(&mut opened.reader, &opened.target, &opened.source)
        .context("Failed to apply patch")?;
    bar.0.finish_and_clear();

    println!("\nPatch applied successfully!");
    print_summary(&summary);
    Ok(())
}

fn print_requirements(target: &Container, fetch_block_size: u64, req: &RequirementSummary) {
    println!(
        "Total old blocks: {}, needed: {} (of which {} are smaller than {})",
        req.total_blocks,
        req.needed_blocks,
        req.partial_blocks,
        HumanBytes(fetch_block_size)
    );
    let share = if target.total_size() == 0 {
        0.0
    } else {
        req.needed_bytes as f64 / target.total_size() as f64 * 100.0
    };
    println!(
        "Needed block size: {} ({:.2}% of full old build size)",
        HumanBytes(req.needed_bytes),
        share
    );
}

struct RangesArgs {
    patch: PathBuf,
    fetch_block_size: u64,
    upstream: Option<String>,
    latency: Duration,
    target: Option<PathBuf>,
    output: Option<PathBuf>,
    config: RemotePoolConfig,
}

fn run_ranges(args: RangesArgs, handle: Handle, cancel: CancellationToken) -> Result<()> {
    if args.fetch_block_size == 0 {
        bail!("--fetch-block-size must be greater than zero");
    }
    let patch_size = std::fs::metadata(&args.patch)
        .with_context(|| format!("Failed to stat patch: {}", args.patch.display()))?
        .len();

    // Pre-pass: nothing is fetched until the whole patch has been scanned.
    let mut opened = open_patch(open_patch_file(&args.patch)?)?;
    let (target, source) = (opened.target.clone(), opened.source.clone());

    println!("Showing ranges for {} patch", HumanBytes(patch_size));
    println!("Old version: {} in {} files", HumanBytes(target.total_size()), target.len());
    println!("New version: {} in {} files", HumanBytes(source.total_size()), source.len());

    let coverage = if args.target.is_some() {
        Coverage::MovedOnly
    } else {
        Coverage::All
    };
    let analysis = RequiredBlocks::analyze(
        &mut opened.reader,
        &target,
        &source,
        args.fetch_block_size,
        coverage,
    )
    .context("Failed to analyze patch")?;
    let stats = &analysis.stats;

    println!();
    println!("{} BlockRange ops, {} Data ops", stats.block_range_ops, stats.data_ops);
    println!("Unchanged bytes: {}", HumanBytes(stats.unchanged_bytes));
    println!("Moved bytes    : {}", HumanBytes(stats.moved_bytes));
    println!("Fresh bytes    : {}", HumanBytes(stats.fresh_bytes));
    println!();
    print_requirements(
        &target,
        args.fetch_block_size,
        &analysis.required.summary(&target),
    );

    let local = args
        .target
        .as_ref()
        .map(|root| LocalPool::new(root, target.clone()));
    let addresser: Box<dyn BlockAddresser + '_> = match &local {
        Some(pool) => Box::new(ContentAddresser::new(pool, args.fetch_block_size)),
        None => Box::new(SyntheticAddresser),
    };
    let addresses = analysis
        .required
        .address_map(&target, addresser.as_ref())
        .context("Failed to address required blocks")?;

    let upstream: Arc<dyn BlockSource> = match &args.upstream {
        Some(url) => Arc::new(HttpSource::new(url.clone(), handle, cancel.clone())?),
        None => Arc::new(SimulatedSource::new(args.latency)),
    };
    let remote = RemotePool::new(
        target.clone(),
        args.fetch_block_size,
        Arc::new(addresses),
        upstream,
        args.config,
        cancel.clone(),
    );
    remote.start_prefetch(analysis.required.schedule().to_vec())?;

    let mut directory;
    let mut discard = DiscardOutput;
    let out: &mut dyn OutputPool = match &args.output {
        Some(dir) => {
            directory = DirectoryOutput::new(dir);
            &mut directory
        }
        None => &mut discard,
    };

    let mut reopened = open_patch(open_patch_file(&args.patch)?)?;
    let bar = BarProgress::new(1000);
    let start = Instant::now();
    let mut ctx = ApplyContext::new(&remote, out)
        .with_progress(&bar)
        .with_cancellation(cancel);
    if let Some(pool) = &local {
        ctx = ctx.with_unchanged_pool(pool as &dyn BlockPool);
    }
    let summary = ctx
        .apply_opened(&mut reopened.reader, &reopened.target, &reopened.source)
        .context("Failed to apply patch through remote pool")?;
    bar.0.finish_and_clear();

    let elapsed = start.elapsed();
    let throughput = target.total_size() as f64 / elapsed.as_secs_f64().max(f64::EPSILON);
    println!();
    println!(
        "Processed in {:.3}s ({}/s), {} block fetches",
        elapsed.as_secs_f64(),
        HumanBytes(throughput as u64),
        remote.fetch_count()
    );
    print_summary(&summary);
    Ok(())
}

fn run_verify(dir: &Path, reference: &Path) -> Result<()> {
    let actual = util::digest_tree(dir)?;
    let expected = util::digest_tree(reference)?;

    let mut mismatches = 0;
    for (path, hash) in &expected {
        match actual.iter().find(|(p, _)| p == path) {
            Some((_, h)) if h == hash => {}
            Some(_) => {
                println!("  differs: {path}");
                mismatches += 1;
            }
            None => {
                println!("  missing: {path}");
                mismatches += 1;
            }
        }
    }
    for (path, _) in &actual {
        if !expected.iter().any(|(p, _)| p == path) {
            println!("  extra:   {path}");
            mismatches += 1;
        }
    }

    if mismatches > 0 {
        bail!("{mismatches} files differ between {} and {}", dir.display(), reference.display());
    }
    println!("{} files identical", expected.len());
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.quiet)?;
    info!("netpatch v{}", env!("CARGO_PKG_VERSION"));

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            on_interrupt.cancel();
        }
    });

    match cli.command {
        Commands::Apply {
            target,
            patch,
            output,
        } => {
            println!("Applying patch...");
            println!("  Target: {}", target.display());
            println!("  Patch: {}", patch.display());
            println!("  Output: {}", output.display());

            tokio::task::spawn_blocking(move || run_apply(&target, &patch, &output, cancel))
                .await??;
        }
        Commands::Ranges {
            patch,
            fetch_block_size,
            upstream,
            latency,
            target,
            output,
            workers,
            cache_blocks,
        } => {
            let args = RangesArgs {
                patch,
                fetch_block_size,
                upstream,
                latency: Duration::from_millis(latency),
                target,
                output,
                config: RemotePoolConfig {
                    cache_blocks,
                    prefetch_workers: workers,
                    ..RemotePoolConfig::default()
                },
            };
            let handle = Handle::current();
            tokio::task::spawn_blocking(move || run_ranges(args, handle, cancel)).await??;
        }
        Commands::Verify { dir, reference } => {
            tokio::task::spawn_blocking(move || run_verify(&dir, &reference)).await??;
        }
    }

    Ok(())
}
