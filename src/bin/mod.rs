use std::{
    path::{Path, PathBuf},
    process::ExitCode,
    sync::Arc,
    time::Duration,
};

use clap::{Args as ClapArgs, Parser, Subcommand};
use hashstash::{
    Error, Result,
    command::{
        list::list,
        snapshot::{self, ScanOptions, Strategy},
        upload::{UploadOptions, upload},
    },
    context::Context,
    metadata::SnapshotSet,
    reader::{ChunkerConfig, DEFAULT_MAX_CHUNK_SIZE},
    storage::{Bin, DirectoryBackend},
};
use humansize::{BINARY, format_size};
use tracing::{error, info, level_filters::LevelFilter, warn};

const DIRECTORY_STORES: &str = "directory_stores";

#[derive(Debug, Clone, Parser)]
#[command(version, about)]
struct Args {
    #[command(subcommand)]
    command: Commands,
    #[arg(long, global = true, default_value_t = false)]
    verbose: bool,
    /// Where snapshots, caches and settings are kept. Defaults to ~/.hashstash.
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Subcommand)]
enum Commands {
    /// Record the current state of a directory.
    Snapshot {
        dir: PathBuf,
        /// Resume an interrupted scan from its cache.
        #[arg(short = 'c', long = "continue", default_value_t = false)]
        resume: bool,
        #[arg(long, conflicts_with = "fast_hash", default_value_t = false)]
        fast_check: bool,
        #[arg(long, default_value_t = false)]
        fast_hash: bool,
        #[arg(long, default_value_t = DEFAULT_MAX_CHUNK_SIZE)]
        chunk_size: usize,
    },
    /// Send chunks of the latest snapshot to every configured store.
    Upload {
        dir: PathBuf,
        /// Only upload paths starting with one of these patterns.
        filters: Vec<String>,
        #[arg(long, default_value_t = 4)]
        jobs: usize,
        #[arg(long, default_value_t = 0)]
        grace_secs: u64,
    },
    /// Show the snapshot history of a directory.
    List {
        dir: PathBuf,
        #[arg(long, default_value_t = false)]
        json: bool,
    },
    Setup(SetupArgs),
}

#[derive(Debug, Clone, ClapArgs)]
#[group(required = true, multiple = false)]
struct SetupArgs {
    /// Add a directory store.
    #[arg(long)]
    directory: Option<PathBuf>,
    /// Print the configured stores.
    #[arg(long)]
    list: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let log_level = if args.verbose {
        LevelFilter::TRACE
    } else {
        LevelFilter::INFO
    };

    tracing_subscriber::fmt().with_max_level(log_level).init();

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "command failed");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> Result<()> {
    let data_dir = match args.data_dir {
        Some(dir) => dir,
        None => dirs::home_dir()
            .ok_or_else(|| std::io::Error::other("cannot locate home directory"))?
            .join(".hashstash"),
    };
    let mut ctx = Context::open(&data_dir)?;

    let result = match args.command {
        Commands::Snapshot {
            dir,
            resume,
            fast_check,
            fast_hash,
            chunk_size,
        } => {
            let strategy = match (fast_check, fast_hash) {
                (true, _) => Strategy::FastCheck,
                (_, true) => Strategy::FastHash,
                _ => Strategy::FullHash,
            };
            take_snapshot(&ctx, &dir, strategy, chunk_size, resume).await
        }
        Commands::Upload {
            dir,
            filters,
            jobs,
            grace_secs,
        } => {
            let options = UploadOptions {
                pool_size: jobs,
                grace_period: Duration::from_secs(grace_secs),
                filters,
                ..Default::default()
            };
            run_upload(&mut ctx, &dir, options).await
        }
        Commands::List { dir, json } => print_list(&ctx, &dir, json),
        Commands::Setup(setup) => run_setup(&mut ctx, setup),
    };

    let shutdown = ctx.shutdown().await;
    result.and(shutdown)
}

/// Snapshot and cache files of `dir` inside the data directory.
fn data_files(ctx: &Context, dir: &Path) -> Result<(PathBuf, PathBuf, PathBuf)> {
    let root = std::fs::canonicalize(dir)?;
    let escaped = escape(&root.to_string_lossy());
    let snapshots = ctx.data_dir().join(format!("{escaped}.snapshots"));
    let cache = ctx.data_dir().join(format!("{escaped}.cache"));
    Ok((root, snapshots, cache))
}

fn load_set(root: &Path, snapshots: &Path) -> Result<SnapshotSet> {
    let mut set = SnapshotSet::new(root)?;
    set.load(snapshots)?;
    info!(count = set.snapshots().len(), "loaded snapshots");
    Ok(set)
}

async fn take_snapshot(
    ctx: &Context,
    dir: &Path,
    strategy: Strategy,
    chunk_size: usize,
    resume: bool,
) -> Result<()> {
    let (root, snapshots, cache) = data_files(ctx, dir)?;
    let mut set = load_set(&root, &snapshots)?;

    let options = ScanOptions {
        strategy,
        chunker: ChunkerConfig {
            max_chunk_size: chunk_size.max(1),
        },
        cache_path: Some(cache.clone()),
        resume,
        ..Default::default()
    };

    let set = tokio::task::spawn_blocking(move || {
        snapshot::snapshot(&mut set, &options)?;
        Ok::<_, Error>(set)
    })
    .await??;

    info!("saving snapshots");
    set.save(&snapshots)?;
    snapshot::remove_cache(&cache)?;
    info!(path = %snapshots.display(), "snapshots saved");
    Ok(())
}

async fn run_upload(ctx: &mut Context, dir: &Path, options: UploadOptions) -> Result<()> {
    let (root, snapshots, _) = data_files(ctx, dir)?;
    let set = load_set(&root, &snapshots)?;

    let configured: Vec<PathBuf> = ctx.settings().get(DIRECTORY_STORES)?.unwrap_or_default();
    if configured.is_empty() {
        return Err(Error::NoStores);
    }

    let mut stores = Vec::with_capacity(configured.len());
    for path in configured {
        let keys = ctx.key_cache(&escape(&path.to_string_lossy()))?;
        let backend = DirectoryBackend::new(&path, keys).await?;
        stores.push(Bin::new(path.display().to_string(), Arc::new(backend)));
    }

    let cancel = ctx.token().child_token();
    let on_signal = cancel.clone();
    let watcher = tokio::spawn(async move {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                warn!("received Ctrl-C, finishing in-flight uploads");
                on_signal.cancel();
            }
            _ = on_signal.cancelled() => {}
        }
    });

    let report = upload(&set, &stores, &options, cancel.clone()).await;
    cancel.cancel();
    watcher.await?;

    let report = report?;
    for failure in &report.failed {
        error!(
            store = %failure.store,
            path = %failure.path.display(),
            offset = failure.offset,
            error = %failure.error,
            "job failed"
        );
    }
    report.into_result().map(|_| ())
}

fn print_list(ctx: &Context, dir: &Path, json: bool) -> Result<()> {
    let (root, snapshots, _) = data_files(ctx, dir)?;
    let set = load_set(&root, &snapshots)?;
    let summaries = list(&set);

    if json {
        let out = serde_json::to_string_pretty(&summaries).map_err(std::io::Error::other)?;
        println!("{out}");
        return Ok(());
    }

    println!(
        "{:>4}  {:>12}  {:>8}  {:>12}  {:>8}  {:>8}",
        "#", "time", "files", "size", "chunks", "unique"
    );
    for (i, s) in summaries.iter().enumerate() {
        println!(
            "{:>4}  {:>12}  {:>8}  {:>12}  {:>8}  {:>8}",
            i,
            s.time,
            s.files,
            format_size(s.total_bytes, BINARY),
            s.chunks,
            s.unique_chunks
        );
    }
    Ok(())
}

fn run_setup(ctx: &mut Context, setup: SetupArgs) -> Result<()> {
    let mut stores: Vec<PathBuf> = ctx.settings().get(DIRECTORY_STORES)?.unwrap_or_default();

    if let Some(directory) = setup.directory {
        std::fs::create_dir_all(&directory)?;
        let directory = std::fs::canonicalize(directory)?;
        if stores.contains(&directory) {
            info!(path = %directory.display(), "store already configured");
            return Ok(());
        }
        stores.push(directory.clone());
        ctx.settings_mut().set(DIRECTORY_STORES, &stores)?;
        info!(path = %directory.display(), "directory store added");
    }

    if setup.list {
        for store in &stores {
            println!("directory\t{}", store.display());
        }
    }
    Ok(())
}

/// Percent-encodes everything but unreserved characters so a path can be
/// used as a single file name.
fn escape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for byte in raw.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}
