use anyhow::{bail, Context, Result};
use chrono::NaiveDate;
use clap::{Args, Parser, Subcommand};
use pubgraph::checkpoint::{self, CheckpointStore, FileCheckpointStore, MemoryCheckpointStore};
use pubgraph::config::{CorruptPolicy, LoaderConfig, RetryPolicy};
use pubgraph::loader::{run_load, RunSummary, StopReason};
use pubgraph::memory::MemoryGraphStore;
use pubgraph::neo4j::Neo4jStore;
use pubgraph::source::SourceFormat;
use pubgraph::store::GraphStore;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Parser)]
#[command(name = "pubgraph")]
#[command(about = "Load bibliographic search-index exports into a Neo4j graph")]
struct Cli {
    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Load (or resume loading) an export into the graph
    Load(LoadArgs),
    /// Show the saved checkpoint
    Status(CheckpointArgs),
    /// Delete the saved checkpoint so the next load starts at offset 0
    Reset(CheckpointArgs),
}

#[derive(Args)]
struct LoadArgs {
    /// Path to the export (.json, .jsonl, optionally .bz2)
    #[arg(short, long)]
    input: PathBuf,

    /// Checkpoint file
    #[arg(long, default_value = pubgraph::config::DEFAULT_CHECKPOINT_FILE)]
    checkpoint: PathBuf,

    /// Publications per write transaction
    #[arg(long, default_value_t = pubgraph::config::DEFAULT_BATCH_SIZE)]
    batch_size: usize,

    /// Stop after this many batches in this run
    #[arg(long)]
    max_batches: Option<u32>,

    /// Save a checkpoint every N batches
    #[arg(long, default_value_t = pubgraph::config::DEFAULT_CHECKPOINT_EVERY)]
    checkpoint_every: u32,

    /// Write attempts per batch before it is reported as failed
    #[arg(long, default_value_t = pubgraph::config::DEFAULT_MAX_ATTEMPTS)]
    max_attempts: u32,

    /// Exclude affiliations shorter than this many whole months
    #[arg(long, default_value_t = pubgraph::config::DEFAULT_MIN_AFFILIATION_MONTHS)]
    min_affiliation_months: u32,

    /// Do not match people by display name alone
    #[arg(long)]
    no_name_fallback: bool,

    /// Stop at the first unparsable record instead of skipping it
    #[arg(long)]
    abort_on_corrupt: bool,

    /// Source layout: ndjson, array or search-export (detected when omitted)
    #[arg(long)]
    format: Option<String>,

    /// Reference date for current affiliations, YYYY-MM-DD (defaults to today)
    #[arg(long)]
    as_of: Option<NaiveDate>,

    /// Neo4j Bolt URI
    #[arg(long, env = "NEO4J_URI", default_value = pubgraph::config::DEFAULT_BOLT_URI)]
    bolt_uri: String,

    #[arg(long, env = "NEO4J_USER", default_value = pubgraph::config::DEFAULT_BOLT_USER)]
    user: String,

    #[arg(long, env = "NEO4J_PASSWORD", default_value = "", hide_env_values = true)]
    password: String,

    /// Load into an in-memory graph instead of Neo4j
    #[arg(long)]
    dry_run: bool,

    /// Clear the checkpoint before starting
    #[arg(long)]
    reset: bool,

    /// Hide the progress spinner
    #[arg(long)]
    no_progress: bool,
}

#[derive(Args)]
struct CheckpointArgs {
    /// Checkpoint file
    #[arg(long, default_value = pubgraph::config::DEFAULT_CHECKPOINT_FILE)]
    checkpoint: PathBuf,
}

fn loader_config(args: &LoadArgs) -> Result<LoaderConfig> {
    let format = match &args.format {
        Some(name) => match SourceFormat::from_name(name) {
            Some(format) => Some(format),
            None => bail!("Unknown source format: {name}"),
        },
        None => None,
    };

    let retry = if args.dry_run {
        RetryPolicy::immediate(args.max_attempts)
    } else {
        RetryPolicy {
            max_attempts: args.max_attempts,
            ..RetryPolicy::default()
        }
    };

    Ok(LoaderConfig {
        batch_size: args.batch_size,
        max_batches: args.max_batches,
        checkpoint_every: args.checkpoint_every,
        retry,
        on_corrupt: if args.abort_on_corrupt {
            CorruptPolicy::Abort
        } else {
            CorruptPolicy::Skip
        },
        min_affiliation_months: args.min_affiliation_months,
        display_name_fallback: !args.no_name_fallback,
        show_progress: !args.no_progress,
        as_of: args.as_of,
        format,
        ..LoaderConfig::default()
    })
}

/// Dry runs keep their progress in memory so they never move the offset of a
/// real load sharing the same checkpoint file.
fn checkpoint_store(args: &LoadArgs) -> Result<Box<dyn CheckpointStore>> {
    if args.dry_run {
        return Ok(Box::new(MemoryCheckpointStore::new()));
    }
    let store = FileCheckpointStore::new(&args.checkpoint);
    if args.reset {
        store.clear()?;
    }
    Ok(Box::new(store))
}

async fn load(args: LoadArgs) -> Result<RunSummary> {
    let config = loader_config(&args)?;
    let checkpoints = checkpoint_store(&args)?;
    info!("Checkpoint: {}", checkpoints.describe());

    let store: Arc<dyn GraphStore> = if args.dry_run {
        info!("Dry run, loading into an in-memory graph");
        Arc::new(MemoryGraphStore::new())
    } else {
        Arc::new(
            Neo4jStore::connect(&args.bolt_uri, &args.user, &args.password)
                .await
                .context("Failed to connect to Neo4j")?,
        )
    };

    let cancel = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&cancel);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, finishing the current batch");
            flag.store(true, Ordering::SeqCst);
        }
    });

    let summary = run_load(&args.input, config, store, checkpoints, cancel).await?;
    Ok(summary)
}

fn run_load_command(args: LoadArgs) -> Result<()> {
    let rt = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .thread_name("pubgraph-worker")
        .enable_io()
        .enable_time()
        .build()?;
    let summary = rt.block_on(load(args))?;
    print_summary(&summary);
    Ok(())
}

fn print_summary(summary: &RunSummary) {
    let stop = match summary.stop {
        Some(StopReason::Exhausted) => "source exhausted",
        Some(StopReason::MaxBatches) => "batch limit reached",
        Some(StopReason::Cancelled) => "cancelled",
        None => "error",
    };
    let c = &summary.counters;

    println!();
    println!("=== Summary ===");
    println!("Stopped:            {stop}");
    println!("Status:             {:?}", summary.status);
    match summary.resumed_from {
        Some(offset) => println!("Resumed from:       {offset}"),
        None => println!("Resumed from:       (fresh start)"),
    }
    println!("Next offset:        {}", summary.offset);
    println!("Batches this run:   {}", summary.batches_this_run);
    println!("Batches committed:  {}", summary.batches_completed);
    println!("Elapsed:            {:.2}s", summary.elapsed.as_secs_f64());
    println!();
    println!(
        "Created:            {} publications, {} persons, {} organizations, {} relationships",
        c.created.publications, c.created.persons, c.created.organizations, c.created.relationships
    );
    println!(
        "Merged:             {} publications, {} persons, {} organizations, {} relationships",
        c.merged.publications, c.merged.persons, c.merged.organizations, c.merged.relationships
    );
    println!("Invalid records:    {}", c.skipped.invalid_records);
    println!("Corrupt records:    {}", c.skipped.corrupt_records);
    println!("Authors skipped:    {}", c.skipped.authors);
    println!("Affiliations excl.: {}", c.skipped.affiliations);
    println!("Hierarchy cycles:   {}", c.skipped.hierarchy_cycles);
    println!("Merge candidates:   {}", c.skipped.merge_candidates);
    println!(
        "Failed:             {} records in {} batches",
        c.failed.records, c.failed.batches
    );
    if !summary.unresolved_hierarchy.is_empty() {
        println!("Unresolved PART_OF: {}", summary.unresolved_hierarchy.len());
    }
    if !summary.recent_errors.is_empty() {
        println!();
        println!("Recent errors:");
        for e in &summary.recent_errors {
            match e.offset_end {
                Some(end) => println!("  [{:?}] offsets {}-{}: {}", e.kind, e.offset, end, e.message),
                None => println!("  [{:?}] offset {}: {}", e.kind, e.offset, e.message),
            }
        }
    }
}

fn run_status(args: CheckpointArgs) -> Result<()> {
    let store = FileCheckpointStore::new(&args.checkpoint);
    let Some(cp) = checkpoint::inspect(&store)? else {
        println!("No checkpoint at {}", store.describe());
        return Ok(());
    };

    println!("Checkpoint:         {}", store.describe());
    println!("Input:              {}", cp.input_path);
    println!("Status:             {:?}", cp.status);
    println!("Offset:             {}", cp.offset);
    println!("Batches committed:  {}", cp.batches_completed);
    println!("Updated:            {}", cp.updated_at.to_rfc3339());
    println!(
        "Created:            {} publications, {} persons, {} organizations, {} relationships",
        cp.counters.created.publications,
        cp.counters.created.persons,
        cp.counters.created.organizations,
        cp.counters.created.relationships
    );
    println!(
        "Failed:             {} records in {} batches",
        cp.counters.failed.records, cp.counters.failed.batches
    );
    println!("Recent errors:      {}", cp.recent_errors.len());
    println!("Pending PART_OF:    {}", cp.pending_hierarchy.len());
    Ok(())
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => Level::WARN,
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .finish();

    tracing::subscriber::set_global_default(subscriber).expect("Failed to set tracing subscriber");

    let result = match cli.command {
        Commands::Load(args) => run_load_command(args),
        Commands::Status(args) => run_status(args),
        Commands::Reset(args) => FileCheckpointStore::new(&args.checkpoint).clear(),
    };

    match result {
        Ok(()) => {
            info!("Completed successfully");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("Error: {:#}", e);
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn load_args(extra: &[&str]) -> LoadArgs {
        let mut argv = vec!["pubgraph", "load"];
        argv.extend_from_slice(extra);
        match Cli::try_parse_from(argv).unwrap().command {
            Commands::Load(args) => args,
            _ => panic!("expected the load command"),
        }
    }

    #[test]
    fn dry_run_keeps_checkpoint_in_memory() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("checkpoint.json");
        let path_arg = path.to_str().unwrap();

        fs::write(&path, b"{}").unwrap();

        let args = load_args(&["-i", "in.jsonl", "--dry-run", "--reset", "--checkpoint", path_arg]);
        assert_eq!(checkpoint_store(&args).unwrap().describe(), "in-memory");
        assert!(path.exists());

        let args = load_args(&["-i", "in.jsonl", "--reset", "--checkpoint", path_arg]);
        assert_eq!(checkpoint_store(&args).unwrap().describe(), path_arg);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn dry_run_leaves_file_checkpoint_untouched() {
        let dir = TempDir::new().unwrap();
        let input = dir.path().join("in.jsonl");
        fs::write(&input, "{\"Id\":\"pub-1\",\"Title\":\"T\",\"Year\":2020}\n").unwrap();
        let path = dir.path().join("checkpoint.json");
        fs::write(&path, b"saved by a real load").unwrap();

        let args = load_args(&[
            "-i",
            input.to_str().unwrap(),
            "--dry-run",
            "--no-progress",
            "--checkpoint",
            path.to_str().unwrap(),
        ]);
        let summary = load(args).await.unwrap();

        assert_eq!(summary.counters.created.publications, 1);
        assert_eq!(fs::read(&path).unwrap(), b"saved by a real load");
    }
}
