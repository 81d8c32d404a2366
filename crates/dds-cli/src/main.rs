use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

use dds_core::SyncRunSummary;
use dds_sheets::{FinancialDomain, HygieneDomain, SheetDomain};
use dds_sync::{build_scheduler, SyncConfig, SyncPipeline};

#[derive(Debug, Parser)]
#[command(name = "dds")]
#[command(about = "Dental dashboard spreadsheet sync")]
struct Cli {
    /// Credentials/settings file; overrides the DDS_CONFIG env var.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Clone, Copy, Default, ValueEnum)]
enum Domain {
    #[default]
    Financials,
    Hygiene,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Process a workbook export and push its records to the dashboard.
    Sync {
        workbook: PathBuf,
        #[arg(long)]
        location: String,
        #[arg(long, value_enum, default_value_t)]
        domain: Domain,
    },
    /// Validate credentials with a single dry-run record.
    TestConnection {
        #[arg(long)]
        location: String,
        #[arg(long, value_enum, default_value_t)]
        domain: Domain,
    },
    /// Run the daily sync trigger in-process until interrupted.
    Schedule {
        workbook: PathBuf,
        #[arg(long)]
        location: String,
        #[arg(long, value_enum, default_value_t)]
        domain: Domain,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    FmtSubscriber::builder()
        .with_max_level(
            std::env::var("RUST_LOG")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(Level::INFO),
        )
        .init();

    let cli = Cli::parse();
    if let Some(path) = &cli.config {
        std::env::set_var("DDS_CONFIG", path);
    }
    let config = SyncConfig::load()?;

    match cli.command {
        Commands::Sync {
            workbook,
            location,
            domain,
        } => match domain {
            Domain::Financials => {
                let domain = FinancialDomain::new(location.clone());
                sync(config, domain, workbook, location).await
            }
            Domain::Hygiene => {
                let domain = HygieneDomain::new(default_provider(&config, &location));
                sync(config, domain, workbook, location).await
            }
        },
        Commands::TestConnection { location, domain } => {
            match domain {
                Domain::Financials => {
                    let domain = FinancialDomain::new(location.clone());
                    SyncPipeline::new(config, domain)?.test_connection(&location).await?;
                }
                Domain::Hygiene => {
                    let domain = HygieneDomain::new(default_provider(&config, &location));
                    SyncPipeline::new(config, domain)?.test_connection(&location).await?;
                }
            }
            println!("connection ok: credentials accepted by the import endpoint");
            Ok(())
        }
        Commands::Schedule {
            workbook,
            location,
            domain,
        } => match domain {
            Domain::Financials => {
                let domain = FinancialDomain::new(location.clone());
                schedule(config, domain, workbook, location).await
            }
            Domain::Hygiene => {
                let domain = HygieneDomain::new(default_provider(&config, &location));
                schedule(config, domain, workbook, location).await
            }
        },
    }
}

fn default_provider(config: &SyncConfig, location: &str) -> String {
    config
        .clinic_for(location)
        .ok()
        .and_then(|c| c.provider_code.clone())
        .unwrap_or_else(|| location.to_string())
}

async fn sync<D>(config: SyncConfig, domain: D, workbook: PathBuf, location: String) -> Result<()>
where
    D: SheetDomain,
{
    let pipeline = SyncPipeline::new(config, domain)?;
    let summary = pipeline.run_once(&workbook, &location).await?;
    print_summary(&summary);
    Ok(())
}

async fn schedule<D>(
    config: SyncConfig,
    domain: D,
    workbook: PathBuf,
    location: String,
) -> Result<()>
where
    D: SheetDomain + Send + Sync + 'static,
    D::Record: Send + Sync,
{
    let cron = config.schedule_cron.clone();
    let pipeline = Arc::new(SyncPipeline::new(config, domain)?);
    let sched = build_scheduler(pipeline, workbook, location).await?;
    sched.start().await?;
    println!("scheduler running ({cron}); press ctrl-c to stop");
    tokio::signal::ctrl_c().await?;
    Ok(())
}

fn print_summary(summary: &SyncRunSummary) {
    println!("sync {}", summary.status.as_str());
    println!(
        "  tabs: {}  rows: {}  added: {}  skipped: {}",
        summary.tabs_selected, summary.rows_seen, summary.records_added, summary.rows_skipped
    );
    println!(
        "  row errors: {}  tab errors: {}  batches: {}  created: {}  updated: {}",
        summary.row_errors,
        summary.tab_errors,
        summary.batches_sent,
        summary.created,
        summary.updated
    );
    println!("  duration: {} ms", summary.duration_ms());
    if summary.generated_ids > 0 {
        println!(
            "  note: {} rows were assigned fresh ids; write them back to the sheet to keep re-syncs idempotent",
            summary.generated_ids
        );
    }
    if let Some(error) = &summary.error {
        println!("  error: {error}");
    }
}
