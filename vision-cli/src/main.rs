//! Vision CLI — download, ETL, query and store maintenance commands.
//!
//! Commands:
//! - `download`: fetch daily archives per the config and extract them
//! - `etl`: build Parquet partitions from the raw CSV tree
//! - `init`: create the raw and store directories and pin the store layout
//! - `cleanup`: remove partial, corrupt and (optionally) orphaned files
//! - `status`: per-kind partition, row and size totals
//! - `query scan|series|rank`: partition-pruned reads
//! - `perf`: time the pruning, scan and ranking paths
//!
//! `--json` switches the etl, cleanup, status and perf reports to JSON on stdout.

use anyhow::{anyhow, bail, Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;
use vision_core::circuit_breaker::CircuitBreaker;
use vision_core::pool::read_failed;
use vision_core::progress::{format_file_size, LogProgress};
use vision_core::{planner, DataKind, DownloadPool, HttpFetcher, Interval, VaultConfig};
use vision_store::cleanup::{Cleaner, CleanupOptions, CleanupReport};
use vision_store::ingest::day_bounds;
use vision_store::transform::{EtlFilter, PartitionStatus};
use vision_store::{
    perf, EtlMode, EtlTransformer, PartitionStore, QueryEngine, QueryResult, QuerySpec,
};

#[derive(Parser)]
#[command(
    name = "vision",
    about = "Vision — Binance public market data downloader and Parquet store"
)]
struct Cli {
    /// Path to the TOML config file.
    #[arg(long, global = true, default_value = "config.toml")]
    config: PathBuf,

    /// Print reports as JSON instead of tables.
    #[arg(long, global = true, default_value_t = false)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Download and extract the archives the config describes.
    Download {
        /// Replay only the tasks listed in a failed-downloads file.
        #[arg(long)]
        only_failed: Option<PathBuf>,

        /// Where to write the failed subset of this run.
        #[arg(long, default_value = "failed_downloads.json")]
        failed_out: PathBuf,
    },
    /// Build Parquet partitions from the raw CSV tree.
    Etl {
        /// Rebuild every partition, even ones that are up to date.
        #[arg(long, default_value_t = false)]
        force: bool,

        /// Restrict to these data types (e.g. klines aggTrades).
        #[arg(long = "kind", num_args = 1..)]
        kinds: Vec<String>,

        /// Restrict to these symbols.
        #[arg(long = "symbol", num_args = 1..)]
        symbols: Vec<String>,

        /// First date to build (YYYY-MM-DD).
        #[arg(long)]
        start: Option<String>,

        /// Last date to build (YYYY-MM-DD).
        #[arg(long)]
        end: Option<String>,
    },
    /// Create the raw and store directories and write the store manifest.
    Init,
    /// Remove partial, zero-byte and corrupt files from the store and raw tree.
    Cleanup {
        /// Only list what would be removed.
        #[arg(long, default_value_t = false)]
        dry_run: bool,

        /// Also remove partitions whose raw CSV is gone.
        #[arg(long, default_value_t = false)]
        remove_orphans: bool,
    },
    /// Report partitions, rows and size per data type.
    Status,
    /// Partition-pruned queries over the store.
    Query {
        #[command(subcommand)]
        action: QueryAction,
    },
    /// Time repeated queries over a range.
    Perf {
        #[command(flatten)]
        range: RangeArgs,

        /// Repetitions per measured path.
        #[arg(long, default_value_t = 5)]
        iterations: u32,
    },
}

#[derive(Subcommand)]
enum QueryAction {
    /// All rows in a range, sorted by time then symbol.
    Scan {
        #[command(flatten)]
        range: RangeArgs,

        /// Maximum rows to print.
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// One symbol's rows in a range.
    Series {
        /// Symbol, e.g. BTCUSDT.
        #[arg(long)]
        symbol: String,

        #[command(flatten)]
        range: RangeArgs,

        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Symbols ranked by the sum of a numeric column (volume by default).
    Rank {
        #[command(flatten)]
        range: RangeArgs,

        /// Column to sum. Defaults to the data type's volume column.
        #[arg(long)]
        column: Option<String>,

        #[arg(long, default_value_t = 10)]
        limit: usize,
    },
}

#[derive(clap::Args)]
struct RangeArgs {
    /// Data type, e.g. klines.
    #[arg(long, default_value = "klines")]
    kind: String,

    /// Kline interval; required for the klines family.
    #[arg(long)]
    interval: Option<String>,

    /// Range start: YYYY-MM-DD (start of day, UTC) or epoch milliseconds.
    #[arg(long)]
    start: String,

    /// Range end, inclusive: YYYY-MM-DD (whole day, UTC) or epoch milliseconds.
    #[arg(long)]
    end: String,

    /// Restrict to these symbols.
    #[arg(long = "symbol", num_args = 1..)]
    symbols: Vec<String>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = VaultConfig::from_file(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    let _log_guard = vision_core::logging::init(&config.logging, &config.log_directory)?;

    match cli.command {
        Commands::Download {
            only_failed,
            failed_out,
        } => run_download(&config, only_failed.as_deref(), &failed_out),
        Commands::Etl {
            force,
            kinds,
            symbols,
            start,
            end,
        } => run_etl(&config, cli.json, force, kinds, symbols, start, end),
        Commands::Init => run_init(&config),
        Commands::Cleanup {
            dry_run,
            remove_orphans,
        } => run_cleanup(&config, cli.json, dry_run, remove_orphans),
        Commands::Status => run_status(&config, cli.json),
        Commands::Query { action } => run_query(&config, action),
        Commands::Perf { range, iterations } => run_perf(&config, cli.json, &range, iterations),
    }
}

fn run_download(config: &VaultConfig, only_failed: Option<&Path>, failed_out: &Path) -> Result<()> {
    let layout = config.layout();
    let breaker = Arc::new(CircuitBreaker::default_upstream());
    let fetcher = HttpFetcher::new(config.request_timeout(), breaker)?;

    let tasks: Vec<_> = if let Some(path) = only_failed {
        let ids = read_failed(path).with_context(|| format!("reading {}", path.display()))?;
        info!(tasks = ids.len(), file = %path.display(), "replaying failed downloads");
        ids.into_iter().map(|id| layout.task(id)).collect()
    } else {
        let mut input = config.plan_input(chrono::Utc::now().date_naive())?;
        if input.symbols.is_empty() {
            info!("no trading_pairs configured, fetching perpetual USDT symbols");
            input.symbols = fetcher.fetch_trading_pairs()?;
            info!(symbols = input.symbols.len(), "resolved trading pairs");
        }
        planner::plan(&input, &layout)
    };

    if tasks.is_empty() {
        println!("Nothing to download.");
        return Ok(());
    }

    let pool = DownloadPool::new(
        Arc::new(fetcher),
        Arc::new(config.rate_gate()),
        config.pool_settings(),
    )?;
    let summary = pool.run(tasks, &LogProgress::default());

    println!();
    println!("=== Download Summary ===");
    println!("Tasks:      {}", summary.total);
    println!("Completed:  {}", summary.completed);
    println!("Skipped:    {}", summary.skipped);
    println!("Failed:     {}", summary.failed);
    println!("Downloaded: {}", format_file_size(summary.bytes_downloaded()));
    println!("Elapsed:    {:.1}s", summary.elapsed.as_secs_f64());

    if !summary.all_succeeded() {
        for outcome in summary.failures() {
            if let Some(err) = &outcome.error {
                eprintln!("Error for {}: {err}", outcome.id);
            }
        }
        summary
            .write_failed(failed_out)
            .with_context(|| format!("writing {}", failed_out.display()))?;
        bail!(
            "{} task(s) failed; retry them with --only-failed {}",
            summary.failed,
            failed_out.display()
        );
    }
    Ok(())
}

fn run_etl(
    config: &VaultConfig,
    json: bool,
    force: bool,
    kinds: Vec<String>,
    symbols: Vec<String>,
    start: Option<String>,
    end: Option<String>,
) -> Result<()> {
    let filter = EtlFilter {
        kinds: (!kinds.is_empty())
            .then(|| kinds.iter().map(|k| parse_kind(k)).collect::<Result<Vec<_>>>())
            .transpose()?,
        symbols: (!symbols.is_empty())
            .then(|| symbols.iter().map(|s| s.to_ascii_uppercase()).collect()),
        start: start.as_deref().map(parse_date).transpose()?,
        end: end.as_deref().map(parse_date).transpose()?,
    };
    let mode = if force { EtlMode::Force } else { EtlMode::Resume };

    let store = PartitionStore::new(&config.store_directory);
    store.init()?;
    let report = EtlTransformer::new(config.layout(), store)
        .with_mode(mode)
        .with_filter(filter)
        .run()?;

    if json {
        println!("{}", to_json(&report)?);
    } else {
        println!();
        println!("=== ETL Summary ===");
        println!("Sources:   {}", report.total());
        println!("Written:   {}", report.written);
        println!("Skipped:   {}", report.skipped);
        println!("Failed:    {}", report.failed);
        println!("Rows:      {}", report.rows_written);
        println!("Elapsed:   {:.1}s", report.elapsed.as_secs_f64());
    }

    if report.failed > 0 {
        for outcome in report.failures() {
            if let PartitionStatus::Failed { error } = &outcome.status {
                eprintln!("Error for {}: {error}", outcome.key);
            }
        }
        bail!("{} partition(s) failed", report.failed);
    }
    Ok(())
}

fn run_init(config: &VaultConfig) -> Result<()> {
    std::fs::create_dir_all(&config.output_directory)
        .with_context(|| format!("creating {}", config.output_directory.display()))?;
    let store = PartitionStore::new(&config.store_directory);
    let manifest = store.init()?;
    println!("Raw directory:   {}", config.output_directory.display());
    println!("Store directory: {}", store.root().display());
    println!(
        "Layout version:  {} (created {})",
        manifest.layout_version, manifest.created_at
    );
    Ok(())
}

fn run_cleanup(config: &VaultConfig, json: bool, dry_run: bool, remove_orphans: bool) -> Result<()> {
    let store = PartitionStore::open(&config.store_directory)?;
    let layout = config.layout();
    let report = Cleaner::new(&store, &layout).run(CleanupOptions {
        dry_run,
        remove_orphans,
    })?;

    if json {
        println!("{}", to_json(&report)?);
    } else {
        print_cleanup(&report);
    }
    if !report.errors.is_empty() {
        bail!("{} file(s) could not be removed", report.errors.len());
    }
    Ok(())
}

fn print_cleanup(report: &CleanupReport) {
    if report.entries.is_empty() {
        println!("Nothing to clean.");
        return;
    }
    for entry in &report.entries {
        println!(
            "  {} ({}, {})",
            entry.path.display(),
            entry.reason,
            format_file_size(entry.bytes)
        );
    }
    println!();
    if report.dry_run {
        println!(
            "Dry run: {} file(s), {} would be removed.",
            report.entries.len(),
            format_file_size(report.bytes_reclaimed())
        );
    } else {
        println!(
            "Removed {} file(s), {}.",
            report.entries.len() - report.errors.len(),
            format_file_size(report.bytes_reclaimed())
        );
    }
    for (path, err) in &report.errors {
        eprintln!("Failed to remove {}: {err}", path.display());
    }
}

fn run_status(config: &VaultConfig, json: bool) -> Result<()> {
    let store = PartitionStore::new(&config.store_directory);
    if !store.root().exists() {
        println!("Store directory does not exist: {}", store.root().display());
        return Ok(());
    }
    let status = store.status()?;
    if json {
        println!("{}", to_json(&status)?);
        return Ok(());
    }

    println!("Store: {}", store.root().display());
    match status.layout_version {
        Some(v) => println!("Layout version: {v}"),
        None => println!("Layout version: (no manifest, run `vision init`)"),
    }
    if status.kinds.is_empty() {
        println!("Store is empty.");
        return Ok(());
    }

    println!();
    println!(
        "{:<22} {:>10} {:>8} {:>12} {:>10}  {}",
        "Data Type", "Partitions", "Symbols", "Rows", "Size", "Dates"
    );
    println!("{}", "-".repeat(90));
    for (name, kind) in &status.kinds {
        let dates = match (kind.first_date, kind.last_date) {
            (Some(first), Some(last)) => format!("{first} to {last}"),
            _ => "-".into(),
        };
        println!(
            "{:<22} {:>10} {:>8} {:>12} {:>10}  {}",
            name,
            kind.partitions,
            kind.symbols,
            kind.rows,
            format_file_size(kind.bytes),
            dates
        );
        if kind.missing_meta > 0 {
            println!("  WARNING: {} partition(s) without metadata", kind.missing_meta);
        }
    }
    Ok(())
}

fn run_query(config: &VaultConfig, action: QueryAction) -> Result<()> {
    let engine = QueryEngine::new(PartitionStore::open(&config.store_directory)?);

    let result = match action {
        QueryAction::Scan { range, limit } => engine.scan(&range.spec()?, Some(limit))?,
        QueryAction::Series {
            symbol,
            range,
            limit,
        } => {
            let spec = range.spec()?;
            engine.series(
                spec.kind,
                spec.interval,
                &symbol.to_ascii_uppercase(),
                spec.start_ms,
                spec.end_ms,
                Some(limit),
            )?
        }
        QueryAction::Rank {
            range,
            column,
            limit,
        } => {
            let spec = range.spec()?;
            match column {
                Some(column) => engine.sum_by_symbol(&spec, &column, Some(limit))?,
                None => engine.volume_ranking(&spec, Some(limit))?,
            }
        }
    };
    print_result(&result);
    Ok(())
}

fn run_perf(config: &VaultConfig, json: bool, range: &RangeArgs, iterations: u32) -> Result<()> {
    let engine = QueryEngine::new(PartitionStore::open(&config.store_directory)?);
    let report = perf::measure(&engine, &range.spec()?, iterations)?;
    if json {
        println!("{}", to_json(&report)?);
        return Ok(());
    }

    println!();
    println!("=== Query Performance ({} iterations) ===", report.iterations);
    println!("Partitions: {}", report.partitions);
    println!("Rows:       {}", report.rows);
    println!("{:<10} {:>12} {:>12} {:>12}", "Path", "Min", "Mean", "Max");
    println!("{}", "-".repeat(49));
    let mut rows = vec![("plan", report.plan), ("scan", report.scan)];
    if let Some(ranking) = report.ranking {
        rows.push(("rank", ranking));
    }
    for (name, t) in rows {
        println!(
            "{:<10} {:>10.2}ms {:>10.2}ms {:>10.2}ms",
            name,
            t.min.as_secs_f64() * 1e3,
            t.mean.as_secs_f64() * 1e3,
            t.max.as_secs_f64() * 1e3
        );
    }
    Ok(())
}

impl RangeArgs {
    fn spec(&self) -> Result<QuerySpec> {
        let kind = parse_kind(&self.kind)?;
        let interval = self
            .interval
            .as_deref()
            .map(|s| s.parse::<Interval>().map_err(|e| anyhow!("{e}")))
            .transpose()?;
        let start_ms = parse_bound(&self.start, false)?;
        let end_ms = parse_bound(&self.end, true)?;

        let mut spec = QuerySpec::new(kind, interval, start_ms, end_ms);
        if !self.symbols.is_empty() {
            spec = spec.with_symbols(self.symbols.iter().map(|s| s.to_ascii_uppercase()).collect());
        }
        spec.validate()?;
        Ok(spec)
    }
}

fn parse_kind(s: &str) -> Result<DataKind> {
    s.parse::<DataKind>().map_err(|e| anyhow!("{e}"))
}

fn parse_date(s: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(s, "%Y-%m-%d").with_context(|| format!("invalid date '{s}'"))
}

/// A date covers its whole UTC day: start of day for a lower bound, last
/// millisecond for an upper one. Anything else must be epoch milliseconds.
fn parse_bound(s: &str, upper: bool) -> Result<i64> {
    if let Ok(date) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        let (start, end_excl) = day_bounds(date);
        return Ok(if upper { end_excl - 1 } else { start });
    }
    s.parse::<i64>()
        .map_err(|_| anyhow!("expected YYYY-MM-DD or epoch milliseconds, got '{s}'"))
}

fn to_json<T: Serialize>(report: &T) -> Result<String> {
    serde_json::to_string_pretty(report).context("serializing report")
}

fn print_result(result: &QueryResult) {
    println!("{}", result.frame);
    println!(
        "{} row(s) from {} partition(s)",
        result.rows(),
        result.partitions_read
    );
    for skipped in &result.skipped {
        println!("WARNING: skipped {}: {}", skipped.key, skipped.reason);
    }
}
