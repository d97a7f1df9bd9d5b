//! LadderLab CLI: fetch daily bars, analyze the limit-up ladder, show storage status.
//!
//! Commands:
//! - `fetch`: incremental (or full) bar fetch, validation, save, concept tags
//! - `analyze`: rebuild the ladder table from stored bars
//! - `status`: stored tables and their coverage

use anyhow::{bail, Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use ladderlab_core::data::ParquetStorage;
use ladderlab_core::domain::parse_date_key;
use ladderlab_core::ladder::AnalysisError;
use ladderlab_runner::{
    run_analyze, run_fetch, run_status, AnalyzeReport, FetchOptions, FetchReport, LadderConfig,
    RunError, Sources, StatusReport,
};
use std::path::{Path, PathBuf};
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Loaded when `--config` is not given and the file exists.
const DEFAULT_CONFIG_FILE: &str = "ladderlab.toml";

#[derive(Parser)]
#[command(
    name = "ladderlab",
    about = "LadderLab CLI: A-share limit-up ladder data pipeline"
)]
struct Cli {
    /// Path to a TOML config file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Data directory, overriding `storage.data_dir`.
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Log level used when RUST_LOG is unset.
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fetch daily bars for every instrument and store them.
    Fetch {
        /// Ignore stored coverage and replace the bar table.
        #[arg(long, default_value_t = false)]
        full_refresh: bool,

        /// Start date (YYYYMMDD or YYYY-MM-DD). Defaults to `fetch.default_start_date`.
        #[arg(long)]
        start_date: Option<String>,

        /// End date (YYYYMMDD or YYYY-MM-DD). Defaults to the last closed session.
        #[arg(long)]
        end_date: Option<String>,
    },
    /// Rebuild the limit-up ladder from stored bars.
    Analyze,
    /// Report stored tables and coverage.
    Status,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log_level);

    let config = load_config(cli.config.as_deref(), cli.data_dir)?;
    let storage = ParquetStorage::new(config.storage.data_dir.clone());

    match cli.command {
        Commands::Fetch {
            full_refresh,
            start_date,
            end_date,
        } => {
            let options = FetchOptions {
                full_refresh,
                start: start_date.as_deref().map(parse_cli_date).transpose()?,
                end: end_date.as_deref().map(parse_cli_date).transpose()?,
            };
            let sources = Sources::from_config(&config)?;
            let cancel = config.fetch.cancel_token();
            match run_fetch(&config, &storage, &sources, &options, &cancel) {
                Ok(report) => print_fetch(&report),
                Err(e) => fail(e),
            }
        }
        Commands::Analyze => match run_analyze(&config, &storage) {
            Ok(report) => print_analyze(&report),
            Err(e) => fail(e),
        },
        Commands::Status => print_status(&run_status(&storage)?),
    }
    Ok(())
}

fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

fn load_config(path: Option<&Path>, data_dir: Option<PathBuf>) -> Result<LadderConfig> {
    let mut config = match path {
        Some(p) => LadderConfig::from_file(p)
            .with_context(|| format!("loading config {}", p.display()))?,
        None if Path::new(DEFAULT_CONFIG_FILE).is_file() => {
            LadderConfig::from_file(Path::new(DEFAULT_CONFIG_FILE))?
        }
        None => LadderConfig::default(),
    };
    if let Some(dir) = data_dir {
        config.storage.data_dir = dir;
    }
    info!(data_dir = %config.storage.data_dir.display(), "configuration loaded");
    Ok(config)
}

fn parse_cli_date(s: &str) -> Result<NaiveDate> {
    if let Some(d) = parse_date_key(s) {
        return Ok(d);
    }
    match NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        Ok(d) => Ok(d),
        Err(_) => bail!("invalid date '{s}', expected YYYYMMDD or YYYY-MM-DD"),
    }
}

/// Print what went wrong and exit non-zero.
fn fail(err: RunError) -> ! {
    eprintln!("Error: {err}");
    match &err {
        RunError::Validation(report) => {
            for v in report.hard().take(20) {
                eprintln!("  {v}");
            }
        }
        RunError::Analysis(AnalysisError::InconsistencyRate { examples, .. }) => {
            eprintln!("Example unclassified rows (stored ladder left unchanged):");
            for a in examples {
                eprintln!("  {} {}: {}", a.symbol, a.date, a.reason);
            }
        }
        _ => {}
    }
    std::process::exit(1);
}

fn print_fetch(report: &FetchReport) {
    println!();
    println!("=== Fetch {} → {} ===", report.start, report.end);
    println!(
        "Mode:           {}",
        if report.full_refresh { "full refresh" } else { "incremental" }
    );
    println!("Instruments:    {}", report.instruments);
    println!("Succeeded:      {}", report.succeeded);
    println!("Failed:         {}", report.failures.len());
    println!("Up to date:     {}", report.up_to_date);
    println!("Fallbacks:      {}", report.fallbacks);
    println!("Bars fetched:   {}", report.bars_fetched);
    if let Some((path, rows)) = &report.saved {
        println!("Stored rows:    {rows} ({})", path.display());
    }
    println!("Concept tags:   {}", report.tags_fetched);
    println!(
        "Sessions:       {} opened, {} closed, {} failed to close",
        report.teardown.opened, report.teardown.closed, report.teardown.failed
    );
    if !report.soft_violations.is_empty() {
        println!();
        println!("--- Warnings ---");
        for v in &report.soft_violations {
            println!("  {v}");
        }
    }
    if !report.failures.is_empty() {
        println!();
        println!("--- Failed instruments ---");
        for f in &report.failures {
            println!("  {:<10} {}", f.symbol, f.error);
        }
    }
}

fn print_analyze(report: &AnalyzeReport) {
    println!();
    println!("=== Limit-Up Ladder ===");
    println!("Rows:           {}", report.rows);
    println!("Limit-up rows:  {}", report.limit_up_rows);
    for (pattern, count) in &report.by_pattern {
        println!("  {:<12} {count}", pattern.as_str());
    }
    println!("Anomalies:      {}", report.anomalies.len());
    if let Some(path) = &report.ladder_path {
        println!("Saved to:       {}", path.display());
    }

    if let Some(date) = report.latest_date {
        println!();
        println!("--- Ladder on {date} ---");
        if report.latest_ladder.is_empty() {
            println!("  (no limit-up instruments)");
        }
        for (level, symbols) in report.latest_ladder.iter().rev() {
            println!("  {level:>2} board(s): {:>4}  {}", symbols.len(), symbols.join(" "));
        }
    }

    if !report.latest_promotion.is_empty() {
        println!();
        println!("--- Promotion rates ---");
        println!("{:<12} {:>6} {:>10} {:>9} {:>7}", "Date", "Level", "Candidates", "Promoted", "Rate");
        for p in &report.latest_promotion {
            println!(
                "{:<12} {:>6} {:>10} {:>9} {:>6.1}%",
                p.date.to_string(),
                p.level,
                p.candidates,
                p.promoted,
                p.rate * 100.0
            );
        }
    }
}

fn print_status(report: &StatusReport) {
    println!("Data directory: {}", report.data_dir.display());
    if report.tables.is_empty() {
        println!("No tables stored yet.");
        return;
    }
    println!();
    println!(
        "{:<18} {:>8} {:>8} {:<19} {:<19}",
        "Table", "Rows", "Symbols", "Range", "Updated"
    );
    println!("{}", "-".repeat(76));
    for (name, meta) in &report.tables {
        let range = format!(
            "{}-{}",
            meta.start_date.as_deref().unwrap_or("?"),
            meta.end_date.as_deref().unwrap_or("?")
        );
        println!(
            "{:<18} {:>8} {:>8} {:<19} {}",
            name,
            meta.rows,
            meta.symbols,
            range,
            meta.updated_at.format("%Y-%m-%d %H:%M")
        );
    }
    println!();
    println!("Instruments with concept tags: {}", report.tagged_symbols);
}
