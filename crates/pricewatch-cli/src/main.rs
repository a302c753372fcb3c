use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use pricewatch_core::{analyze_price_change, normalize_price, parse_price, PriceChangeResult, SchedulePolicy};
use pricewatch_sync::{pipeline_from_config, report_recent_runs, CheckConfig};
use tracing::{info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "pricewatch")]
#[command(about = "Price monitoring checks and decision tools")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one check tick over the watchlist.
    Check,
    /// Run ticks on the configured cron schedule until interrupted.
    Watch,
    /// Print the canonical form of a scraped price string.
    Normalize { raw: String },
    /// Classify a new price against the previous price and historical low.
    Classify {
        #[arg(long)]
        old: Option<String>,
        #[arg(long)]
        new: String,
        #[arg(long)]
        low: Option<String>,
    },
    /// Show the check interval chosen for an item profile.
    Interval {
        #[arg(long)]
        price: String,
        #[arg(long, default_value_t = 0)]
        subscribers: u32,
        #[arg(long, default_value_t = 0.0)]
        volatility: f64,
    },
    /// Summarize the most recent run reports.
    Report {
        #[arg(long, default_value_t = 5)]
        runs: usize,
        #[arg(long)]
        dir: Option<PathBuf>,
    },
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("PRICEWATCH_LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));

    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_target(true).with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
            .init();
    }
}

fn canonical_price(raw: &str) -> Result<String> {
    normalize_price(Some(raw)).with_context(|| format!("no price found in {raw:?}"))
}

fn classify_args(old: Option<&str>, new: &str, low: Option<&str>) -> Result<PriceChangeResult> {
    let old = old.map(canonical_price).transpose()?;
    let new = canonical_price(new)?;
    let low = low.map(canonical_price).transpose()?;
    Ok(analyze_price_change(old.as_deref(), &new, low.as_deref())?)
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();
    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Check) {
        Commands::Check => {
            let pipeline = pipeline_from_config(CheckConfig::from_env()).await?;
            let summary = pipeline.run_once().await?;
            println!(
                "check complete: run_id={} dispatched={} failed={} changes={} events={} report={}",
                summary.run_id,
                summary.dispatched,
                summary.failed,
                summary.price_changes,
                summary.events_emitted,
                summary.report_path.as_deref().unwrap_or("-")
            );
        }
        Commands::Watch => {
            let pipeline = pipeline_from_config(CheckConfig::from_env()).await?;
            let Some(mut sched) = pipeline.maybe_build_scheduler().await? else {
                warn!("scheduler disabled (PRICEWATCH_SCHEDULER_ENABLED); running a single tick");
                pipeline.run_once().await?;
                return Ok(());
            };
            sched.start().await.context("starting scheduler")?;
            info!(cron = %pipeline.config().tick_cron, "watching");
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            info!("shutting down");
            sched.shutdown().await.context("stopping scheduler")?;
        }
        Commands::Normalize { raw } => match normalize_price(Some(&raw)) {
            Some(price) => println!("{price}"),
            None => anyhow::bail!("no price found in {raw:?}"),
        },
        Commands::Classify { old, new, low } => {
            let result = classify_args(old.as_deref(), &new, low.as_deref())?;
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        Commands::Interval {
            price,
            subscribers,
            volatility,
        } => {
            let policy = SchedulePolicy::default();
            let value = parse_price(&canonical_price(&price)?)?;
            let rule = policy.matching_rule(value, subscribers, volatility);
            println!(
                "{} minutes ({})",
                policy.interval_minutes(value, subscribers, volatility),
                rule.map(|r| r.name).unwrap_or("default")
            );
        }
        Commands::Report { runs, dir } => {
            let dir = dir
                .or_else(|| CheckConfig::from_env().reports_dir)
                .unwrap_or_else(|| PathBuf::from("./reports"));
            println!("{}", report_recent_runs(runs, &dir)?);
        }
    }

    Ok(())
}
