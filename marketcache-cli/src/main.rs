//! marketcache CLI: cached price history, verification, and cache management.
//!
//! Commands:
//! - `history`: adjusted price history, fetched incrementally through the cache
//! - `verify`: compare cached series with the provider, optionally correcting
//! - `info` / `document` / `shares`: cached non-series records
//! - `cache status`: report symbols, records and cached ranges
//! - `cache quarantine`: move a corrupt record aside

use anyhow::{bail, Context, Result};
use chrono::{Duration, NaiveDate};
use clap::{Args, Parser, Subcommand};
use marketcache_core::domain::{CacheKey, Interval, Payload};
use marketcache_core::provider::{CircuitBreaker, FixtureProvider, MarketDataProvider, YahooProvider};
use marketcache_core::store::layout::Representation;
use marketcache_core::{AdjustOptions, CacheConfig, HistoryRequest, MarketCache};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "marketcache",
    about = "marketcache: persistent, self-verifying market data cache"
)]
struct Cli {
    #[command(flatten)]
    global: GlobalArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct GlobalArgs {
    /// TOML config file. Defaults are used when omitted.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Cache directory, overriding the config.
    #[arg(long, global = true)]
    cache_dir: Option<PathBuf>,

    /// Serve data from a CSV fixture instead of Yahoo Finance.
    #[arg(long, global = true)]
    fixture: Option<PathBuf>,

    /// Exchange code reported for every fixture symbol.
    #[arg(long, global = true, default_value = "NMS")]
    fixture_exchange: String,

    /// Debug logging (RUST_LOG takes precedence).
    #[arg(long, short, global = true, default_value_t = false)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Adjusted price history for one symbol.
    History {
        symbol: String,

        /// Bar interval (1m, 2m, 5m, 15m, 30m, 60m, 90m, 1h, 1d, 1wk, 1mo, 3mo).
        #[arg(long, default_value = "1d")]
        interval: Interval,

        /// First local trading date (YYYY-MM-DD).
        #[arg(long)]
        start: NaiveDate,

        /// Local date to stop before (YYYY-MM-DD). Defaults to tomorrow.
        #[arg(long)]
        end: Option<NaiveDate>,

        /// Refetch rows older than this many minutes.
        #[arg(long)]
        max_age_minutes: Option<i64>,

        /// Treat an unfinished row as stale as soon as its session closes.
        #[arg(long, default_value_t = false)]
        trigger_at_close: bool,

        #[arg(long, default_value_t = false)]
        no_adjust_splits: bool,

        #[arg(long, default_value_t = false)]
        no_adjust_divs: bool,

        /// Round prices to four significant figures.
        #[arg(long, default_value_t = false)]
        round: bool,

        /// Keep "no trade" rows.
        #[arg(long, default_value_t = false)]
        keep_na: bool,

        /// Write bars to this CSV file instead of printing them.
        #[arg(long)]
        csv: Option<PathBuf>,
    },
    /// Verify cached series against the provider.
    Verify {
        /// Symbol to verify (omit with --all).
        symbol: Option<String>,

        /// Verify every cached symbol.
        #[arg(long, default_value_t = false)]
        all: bool,

        /// Discard diverging rows and refetch them.
        #[arg(long, default_value_t = false)]
        correct: bool,

        /// With --all, start at this symbol.
        #[arg(long)]
        resume_from: Option<String>,

        /// With --all, stop at the first failing symbol.
        #[arg(long, default_value_t = false)]
        halt_on_fail: bool,

        /// Relative price tolerance (config default when omitted).
        #[arg(long)]
        rtol: Option<f64>,

        /// Relative volume tolerance (config default when omitted).
        #[arg(long)]
        vol_rtol: Option<f64>,
    },
    /// Cached `info` document.
    Info {
        symbol: String,

        #[arg(long)]
        max_age_hours: Option<i64>,
    },
    /// Any other cached document, e.g. quarterly_cashflow.
    Document {
        symbol: String,
        name: String,

        /// Without this the cached copy never expires.
        #[arg(long)]
        max_age_hours: Option<i64>,
    },
    /// Shares outstanding.
    Shares {
        symbol: String,

        #[arg(long)]
        start: Option<NaiveDate>,

        #[arg(long)]
        end: Option<NaiveDate>,

        #[arg(long)]
        max_age_days: Option<i64>,
    },
    /// Cache management commands.
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },
}

#[derive(Subcommand)]
enum CacheAction {
    /// Report cached symbols, records and series ranges.
    Status,
    /// Move a record's files aside so the next access refetches it.
    Quarantine { symbol: String, name: String },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.global.verbose);

    let config = load_config(&cli.global)?;
    let cache = build_cache(&cli.global, &config)?;

    match cli.command {
        Commands::History {
            symbol,
            interval,
            start,
            end,
            max_age_minutes,
            trigger_at_close,
            no_adjust_splits,
            no_adjust_divs,
            round,
            keep_na,
            csv,
        } => {
            let end = end.unwrap_or_else(|| chrono::Local::now().date_naive() + Duration::days(1));
            let mut req = HistoryRequest::new(
                interval,
                cache.local_midnight(&symbol, start)?,
                cache.local_midnight(&symbol, end)?,
            )
            .trigger_at_market_close(trigger_at_close)
            .adjust(AdjustOptions {
                adjust_splits: !no_adjust_splits,
                adjust_divs: !no_adjust_divs,
                rounding: round,
                keep_na,
            });
            if let Some(minutes) = max_age_minutes {
                req = req.max_age(Duration::minutes(minutes));
            }
            run_history(&cache, &symbol, &req, csv.as_deref())
        }
        Commands::Verify {
            symbol,
            all,
            correct,
            resume_from,
            halt_on_fail,
            rtol,
            vol_rtol,
        } => {
            let mut opts = config.verify.options(correct);
            opts.rtol = rtol.unwrap_or(opts.rtol);
            opts.vol_rtol = vol_rtol.unwrap_or(opts.vol_rtol);
            match (symbol, all) {
                (Some(_), true) => bail!("give a symbol or --all, not both"),
                (None, false) => bail!("one of SYMBOL or --all is required"),
                (Some(symbol), false) => run_verify(&cache, &symbol, &opts),
                (None, true) => run_verify_all(&cache, &opts, resume_from.as_deref(), halt_on_fail),
            }
        }
        Commands::Info {
            symbol,
            max_age_hours,
        } => {
            let info = cache
                .info(&symbol, max_age_hours.map(Duration::hours))
                .with_context(|| format!("info for {symbol}"))?;
            println!("{}", serde_json::to_string_pretty(&info)?);
            Ok(())
        }
        Commands::Document {
            symbol,
            name,
            max_age_hours,
        } => {
            let doc = cache
                .document(&symbol, &name, max_age_hours.map(Duration::hours))
                .with_context(|| format!("{name} for {symbol}"))?;
            println!("{}", serde_json::to_string_pretty(&doc)?);
            Ok(())
        }
        Commands::Shares {
            symbol,
            start,
            end,
            max_age_days,
        } => {
            let points = cache
                .shares(&symbol, start, end, max_age_days.map(Duration::days))
                .with_context(|| format!("shares for {symbol}"))?;
            println!("{:<12} {:>16}", "Date", "Shares");
            for p in points {
                println!("{:<12} {:>16}", p.date, p.shares);
            }
            Ok(())
        }
        Commands::Cache { action } => match action {
            CacheAction::Status => run_cache_status(&cache),
            CacheAction::Quarantine { symbol, name } => {
                let key = CacheKey::new(&symbol, &name)?;
                cache
                    .store()
                    .quarantine(&key)
                    .with_context(|| format!("quarantine {key}"))?;
                println!("Quarantined {key}");
                Ok(())
            }
        },
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn load_config(global: &GlobalArgs) -> Result<CacheConfig> {
    let mut config = match &global.config {
        Some(path) => CacheConfig::from_file(path)
            .with_context(|| format!("load config {}", path.display()))?,
        None => CacheConfig::default(),
    };
    if let Some(dir) = &global.cache_dir {
        config.cache_dir = dir.clone();
    }
    Ok(config)
}

fn build_cache(global: &GlobalArgs, config: &CacheConfig) -> Result<MarketCache> {
    let provider: Arc<dyn MarketDataProvider> = match &global.fixture {
        Some(path) => {
            let fixture = FixtureProvider::from_csv(path)
                .with_context(|| format!("load fixture {}", path.display()))?;
            for symbol in fixture.series_symbols() {
                fixture.set_scalar(&symbol, "exchangeName", global.fixture_exchange.as_str().into());
            }
            Arc::new(fixture)
        }
        None => {
            let circuit_breaker = Arc::new(CircuitBreaker::default_provider());
            Arc::new(YahooProvider::new(circuit_breaker).context("build Yahoo client")?)
        }
    };
    tracing::debug!(provider = provider.name(), cache_dir = %config.cache_dir.display(), "opening cache");
    Ok(MarketCache::open(config, provider))
}

fn run_history(cache: &MarketCache, symbol: &str, req: &HistoryRequest, csv_path: Option<&Path>) -> Result<()> {
    let bars = cache
        .history(symbol, req)
        .with_context(|| format!("{} history for {symbol}", req.interval))?;

    if let Some(path) = csv_path {
        let mut writer =
            csv::Writer::from_path(path).with_context(|| format!("create {}", path.display()))?;
        for bar in &bars {
            writer.serialize(bar)?;
        }
        writer.flush()?;
        println!("Wrote {} bars to {}", bars.len(), path.display());
        return Ok(());
    }

    let price = |v: Option<f64>| v.map_or_else(|| "-".to_string(), |x| format!("{x:.4}"));
    println!(
        "{:<26} {:>12} {:>12} {:>12} {:>12} {:>14} {:>8} {:>6}",
        "Timestamp", "Open", "High", "Low", "Close", "Volume", "Div", "Split"
    );
    println!("{}", "-".repeat(110));
    for b in &bars {
        println!(
            "{:<26} {:>12} {:>12} {:>12} {:>12} {:>14} {:>8} {:>6}",
            b.timestamp.to_rfc3339(),
            price(b.open),
            price(b.high),
            price(b.low),
            price(b.close),
            b.volume.map_or_else(|| "-".to_string(), |v| v.to_string()),
            b.dividends,
            b.stock_splits,
        );
    }
    println!("{} bars", bars.len());
    Ok(())
}

fn run_verify(cache: &MarketCache, symbol: &str, opts: &marketcache_core::VerifyOptions) -> Result<()> {
    let result = cache
        .verify_symbol(symbol, opts)
        .with_context(|| format!("verify {symbol}"))?;
    for (interval, report) in &result.reports {
        let verdict = if report.is_consistent() { "ok" } else { "DIVERGED" };
        println!(
            "{symbol} {interval}: {verdict} ({} rows compared, {} divergences)",
            report.compared,
            report.divergences.len()
        );
        for d in report.divergences.iter().take(10) {
            println!("    {d}");
        }
        if let Some(from) = report.corrected_from {
            println!("    corrected from {from} and refetched");
        }
    }
    if result.reports.is_empty() {
        println!("{symbol}: nothing cached");
    }
    if result.corrected {
        println!("{symbol}: corrected; run verify again to confirm");
        std::process::exit(2);
    }
    if !result.is_consistent() {
        std::process::exit(1);
    }
    Ok(())
}

fn run_verify_all(
    cache: &MarketCache,
    opts: &marketcache_core::VerifyOptions,
    resume_from: Option<&str>,
    halt_on_fail: bool,
) -> Result<()> {
    let summary = cache.verify_all(opts, resume_from, halt_on_fail)?;
    println!("Consistent: {}", summary.consistent.len());
    if !summary.corrected.is_empty() {
        println!("Corrected:  {}", summary.corrected.join(", "));
    }
    if !summary.diverged.is_empty() {
        println!("Diverged:   {}", summary.diverged.join(", "));
    }
    for (symbol, err) in &summary.failed {
        eprintln!("Error for {symbol}: {err}");
    }
    if let Some(symbol) = &summary.halted_at {
        println!("Halted at {symbol}; resume with --resume-from {symbol}");
    }
    if !summary.all_consistent() {
        std::process::exit(1);
    }
    Ok(())
}

fn run_cache_status(cache: &MarketCache) -> Result<()> {
    let root = cache.store().root();
    if !root.exists() {
        println!("Cache directory does not exist: {}", root.display());
        return Ok(());
    }
    let symbols = cache.store().symbols()?;
    if symbols.is_empty() {
        println!("Cache is empty: {}", root.display());
        return Ok(());
    }

    let total_size: u64 = symbols.iter().map(|s| dir_size(&root.join(s))).sum();
    println!("Cache: {}", root.display());
    println!("Symbols: {}", symbols.len());
    println!("Total size: {}", format_size(total_size));
    println!();
    println!("{:<8} {:<28} {:<9} {:<40}", "Symbol", "Record", "Format", "Range");
    println!("{}", "-".repeat(88));

    for symbol in &symbols {
        for entry in cache.store().entries(symbol)? {
            let format = match (&entry.packed_in, entry.representation) {
                (Some(unit), _) => format!("{unit}"),
                (None, Representation::Parquet) => "parquet".to_string(),
                (None, Representation::Json) => "json".to_string(),
            };
            let range = match Interval::from_cache_name(&entry.name) {
                Some(_) => series_range(cache, symbol, &entry.name),
                None => String::new(),
            };
            println!("{:<8} {:<28} {:<9} {:<40}", symbol, entry.name, format, range);
        }
    }
    Ok(())
}

fn series_range(cache: &MarketCache, symbol: &str, name: &str) -> String {
    let record = CacheKey::new(symbol, name).and_then(|key| cache.store().get(&key));
    match record {
        Ok(Some(record)) => match record.payload {
            Payload::Table(table) => match (table.first_timestamp(), table.last_timestamp()) {
                (Some(first), Some(last)) => format!(
                    "{} to {} ({} rows)",
                    first.date_naive(),
                    last.date_naive(),
                    table.len()
                ),
                _ => "(empty)".into(),
            },
            other => format!("(unexpected {})", other.kind()),
        },
        Ok(None) => "(expired)".into(),
        Err(e) => format!("(error: {e})"),
    }
}

fn dir_size(path: &Path) -> u64 {
    let mut size = 0u64;
    if let Ok(entries) = std::fs::read_dir(path) {
        for entry in entries.flatten() {
            if let Ok(meta) = entry.metadata() {
                size += meta.len();
            }
        }
    }
    size
}

fn format_size(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{bytes} B")
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    }
}
