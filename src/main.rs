mod analytics;
mod api;
mod config;
mod error;
mod export;
mod ledger;
mod models;
mod pipeline;
mod scraper;
mod storage;
mod utils;

use anyhow::{Result, bail};
use chrono::{Local, NaiveDate};
use clap::{Args, Parser, Subcommand};
use std::io;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

use crate::api::ReadApi;
use crate::config::AppConfig;
use crate::export::{OutputFormat, write_json, write_records};
use crate::pipeline::Pipeline;
use crate::scraper::hkex_session_factory;
use crate::storage::StorageGateway;

#[derive(Parser)]
#[command(name = "ccass-etl", about = "CCASS shareholding disclosure ETL", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Output format for query commands
    #[arg(short, long, value_enum, default_value_t = OutputFormat::Json, global = true)]
    format: OutputFormat,
}

#[derive(Args)]
struct Window {
    /// Stock code, e.g. 00001
    #[arg(short, long)]
    code: String,

    #[arg(long)]
    start: NaiveDate,

    #[arg(long)]
    end: NaiveDate,
}

#[derive(Subcommand)]
enum Command {
    /// Create tables and indexes
    Migrate,

    /// Scrape disclosures; defaults to the configured lookback window
    Ingest {
        /// Single day (YYYY-MM-DD)
        #[arg(long, conflicts_with_all = ["from", "to"])]
        date: Option<NaiveDate>,

        #[arg(long, requires = "to")]
        from: Option<NaiveDate>,

        #[arg(long, requires = "from")]
        to: Option<NaiveDate>,
    },

    /// Show database statistics
    Stats,

    /// Securities with stored disclosures and the stored date span
    Securities,

    /// Holdings of the top participants over a window
    Trend(Window),

    /// Per-participant change between two dates
    Delta(Window),

    /// Largest gainers and losers between two dates
    Changes(Window),

    /// Plausible counterparties of one participant's change
    Counterparties {
        #[command(flatten)]
        window: Window,

        #[arg(short, long)]
        participant: String,

        /// Minimum |change| for a counterparty (default: analytics.change_threshold)
        #[arg(short, long)]
        threshold: Option<f64>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => "ccass_etl=info,warn",
        1 => "ccass_etl=debug,info",
        _ => "trace",
    };

    tracing_subscriber::registry()
        .with(fmt::layer().compact().with_target(false).with_writer(io::stderr))
        .with(EnvFilter::new(filter))
        .init();

    let config = AppConfig::load()?;
    let storage = Arc::new(StorageGateway::connect(&config.storage).await?);
    if config.storage.run_migrations || matches!(cli.command, Command::Migrate) {
        storage.initialise().await?;
    }
    let api = ReadApi::new(Arc::clone(&storage), &config.analytics);
    let out = io::stdout().lock();

    match cli.command {
        Command::Migrate => {
            println!("Schema ready on {}.", storage.backend_name());
        }

        Command::Ingest { date, from, to } => {
            let pipeline = Arc::new(Pipeline::new(
                &config,
                Arc::clone(&storage),
                hkex_session_factory(&config.scraper),
            ));
            let t = utils::Timer::start("Ingestion");

            if let Some(date) = date {
                let report = pipeline.run_daily_ingestion(date).await?;
                info!("{}: {:?}, {} rows", date, report.state, report.rows_stored);
            } else {
                let dates = match (from, to) {
                    (Some(from), Some(to)) => {
                        if from > to {
                            bail!("--from {} is after --to {}", from, to);
                        }
                        let mut days = utils::business_days(from, to);
                        if config.ingestion.descending {
                            days.reverse();
                        }
                        days
                    }
                    _ => utils::lookback_range(
                        Local::now().date_naive(),
                        config.ingestion.lookback_days,
                        config.ingestion.descending,
                    ),
                };
                let stats = pipeline.run(&dates).await?;
                info!(
                    "{} rows in {:.1?} ({} of {} days complete)",
                    stats.rows_stored,
                    t.elapsed(),
                    stats.days_complete,
                    stats.days_attempted
                );
            }
        }

        Command::Stats => {
            let rows = storage.disclosure_count().await?;
            let securities = storage.security_count().await?;
            let (min, max) = storage.date_range().await.unwrap_or((None, None));
            println!("─────────────────────────────────");
            println!("  CCASS ETL  ({})", storage.backend_name());
            println!("─────────────────────────────────");
            println!("  Securities : {}", utils::fmt_number(securities));
            println!("  Holdings   : {}", utils::fmt_number(rows));
            println!("  From       : {}", min.map(|d| d.to_string()).unwrap_or("-".into()));
            println!("  To         : {}", max.map(|d| d.to_string()).unwrap_or("-".into()));
            println!("─────────────────────────────────");
        }

        Command::Securities => {
            let params = api.get_init_params().await?;
            match cli.format {
                OutputFormat::Json => write_json(&params, out)?,
                OutputFormat::Csv => write_records(&params.security_list, cli.format, out)?,
            }
        }

        Command::Trend(w) => {
            let rows = api.get_trend(&w.code, w.start, w.end).await?;
            write_records(&rows, cli.format, out)?;
        }

        Command::Delta(w) => {
            let rows = api.get_delta(&w.code, w.start, w.end).await?;
            write_records(&rows, cli.format, out)?;
        }

        Command::Changes(w) => {
            let ranked = api.get_changes(&w.code, w.start, w.end).await?;
            match cli.format {
                OutputFormat::Json => write_json(&ranked, out)?,
                OutputFormat::Csv => {
                    let rows: Vec<_> = ranked.gainers.into_iter().chain(ranked.losers).collect();
                    write_records(&rows, cli.format, out)?;
                }
            }
        }

        Command::Counterparties {
            window: w,
            participant,
            threshold,
        } => {
            let delta = api.get_delta(&w.code, w.start, w.end).await?;
            if !delta.iter().any(|r| r.participant_id == participant) {
                bail!("{} holds no {} between {} and {}", participant, w.code, w.start, w.end);
            }
            let rows = api.get_counterparties(&delta, &participant, threshold);
            write_records(&rows, cli.format, out)?;
        }
    }

    Ok(())
}
