use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use clap::{Args, Parser, Subcommand};
use fareline_core::{weekday_name, ObservationFilter};
use fareline_storage::FlightStore;
use fareline_sync::{pipeline_from_env, SyncConfig};
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "fareline")]
#[command(about = "Flight price ingestion and trend analysis")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Create or upgrade the observation database.
    Migrate,
    /// Run one ingestion cycle and print its report.
    Sync,
    /// Ingest on the configured interval (or cron) until Ctrl-C.
    Run,
    /// List stored observations.
    Query {
        #[command(flatten)]
        filter: FilterArgs,
        #[arg(long, default_value_t = false)]
        json: bool,
    },
    /// Print the trend summary for stored observations.
    Trends {
        #[command(flatten)]
        filter: FilterArgs,
    },
    /// Ask for insights over the most recent observations.
    Ask { question: Option<String> },
}

#[derive(Debug, Args)]
struct FilterArgs {
    #[arg(long)]
    origin: Option<String>,
    #[arg(long)]
    destination: Option<String>,
    /// Earliest travel date, inclusive (YYYY-MM-DD).
    #[arg(long)]
    from: Option<NaiveDate>,
    /// Latest travel date, inclusive (YYYY-MM-DD).
    #[arg(long)]
    to: Option<NaiveDate>,
}

impl FilterArgs {
    fn into_filter(self) -> ObservationFilter {
        ObservationFilter {
            origin: self.origin.map(|o| o.trim().to_ascii_uppercase()),
            destination: self.destination.map(|d| d.trim().to_ascii_uppercase()),
            ..ObservationFilter::default()
        }
        .between(self.from, self.to)
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("FARELINE_LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(
                fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_span_list(true)
                    .with_writer(std::io::stderr),
            )
            .init();
    } else {
        registry
            .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
            .init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Sync) {
        Commands::Migrate => {
            let config = SyncConfig::from_env();
            let store = FlightStore::connect(&config.database_url)
                .await
                .with_context(|| format!("opening store {}", config.database_url))?;
            let rows = store.count().await?;
            println!("database ready: url={} observations={rows}", config.database_url);
            store.close().await;
        }
        Commands::Sync => {
            let pipeline = pipeline_from_env().await?;
            let report = pipeline.ingest_cycle().await;
            println!("{}", serde_json::to_string_pretty(&report)?);
            pipeline.store().close().await;
        }
        Commands::Run => run_forever().await?,
        Commands::Query { filter, json } => {
            let pipeline = pipeline_from_env().await?;
            let rows = pipeline.query_observations(&filter.into_filter()).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&rows)?);
            } else {
                for obs in &rows {
                    let price = obs
                        .price
                        .map(|p| format!("{p:.2}"))
                        .unwrap_or_else(|| "-".to_string());
                    println!(
                        "{}  {}  {}-{}  {:<20} dep={:<8} price={:>9}  scraped={}",
                        obs.date,
                        weekday_name(obs.day_of_week()),
                        obs.origin,
                        obs.destination,
                        obs.airline,
                        obs.departure_time,
                        price,
                        obs.scraped_at.format("%Y-%m-%d %H:%M"),
                    );
                }
                println!("{} observation(s)", rows.len());
            }
        }
        Commands::Trends { filter } => {
            let pipeline = pipeline_from_env().await?;
            let summary = pipeline.trends(&filter.into_filter()).await?;
            if summary.is_empty() {
                warn!("no observations match; trend summary is empty");
            }
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Commands::Ask { question } => {
            let pipeline = pipeline_from_env().await?;
            println!("{}", pipeline.ask(question.as_deref()).await?);
        }
    }

    Ok(())
}

async fn run_forever() -> Result<()> {
    let pipeline = Arc::new(pipeline_from_env().await?);

    if let Some(mut sched) = pipeline.maybe_build_scheduler().await? {
        sched.start().await.context("starting scheduler")?;
        info!("cron scheduler started; waiting for Ctrl-C");
        tokio::signal::ctrl_c().await.context("listening for Ctrl-C")?;
        sched.shutdown().await.context("stopping scheduler")?;
        return Ok(());
    }

    let (cancel_tx, cancel_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Ctrl-C received; stopping after the current route pair");
            cancel_tx.send_replace(true);
        }
    });
    pipeline.run_until_cancelled(cancel_rx).await;
    pipeline.store().close().await;
    Ok(())
}
