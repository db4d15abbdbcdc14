use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};
use vitals_core::PeriodKind;
use vitals_source::{Identifier, TableRef};
use vitals_sync::{EtlConfig, EtlPipeline};

#[derive(Debug, Parser)]
#[command(name = "vitals-cli")]
#[command(about = "Garmin health summary ETL and API")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run every enabled job from the job registry, then refresh the recent projection.
    Sync,
    /// Load one source table as day, week, month or year summaries.
    Process {
        kind: PeriodKind,
        #[arg(long, default_value = "garmin_summary")]
        database: String,
        /// Defaults to `<kind>s_summary`.
        #[arg(long)]
        table: Option<String>,
    },
    /// Build the seven-day projection ending on or before a date.
    Recent {
        #[arg(long)]
        reference_date: Option<NaiveDate>,
    },
    /// List the tables of a source database.
    Tables {
        #[arg(long, default_value = "garmin_summary")]
        database: String,
    },
    /// Dump a source table as a JSON array of row objects, or with `--all`
    /// every table of the database as `<out>/<database>/<table>.json`.
    Export {
        #[arg(long, default_value = "garmin_summary")]
        database: String,
        #[arg(long, required_unless_present = "all", conflicts_with = "all")]
        table: Option<String>,
        #[arg(long)]
        all: bool,
        /// Output file for one table (stdout when omitted) or the fixture
        /// root for `--all` (current directory when omitted).
        #[arg(long)]
        out: Option<PathBuf>,
    },
    Migrate,
    Serve,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "vitals=info,warn".into()))
        .with(fmt::layer())
        .init();

    let cli = Cli::parse();
    let config = EtlConfig::from_env();

    let command = cli.command.unwrap_or(Commands::Sync);
    info!(?command, "vitals-cli starting");

    match command {
        Commands::Sync => {
            let summary = vitals_sync::run_sync_once_from_env().await?;
            println!(
                "sync complete: run_id={} tables={} skipped={} recent={} reports={}",
                summary.run_id,
                summary.tables.len(),
                summary.failures(),
                summary
                    .recent
                    .as_ref()
                    .map(|r| r.latest_day.to_string())
                    .or(summary.recent_skipped.clone())
                    .unwrap_or_default(),
                summary.reports_dir.as_deref().unwrap_or("-")
            );
        }
        Commands::Process {
            kind,
            database,
            table,
        } => {
            let table_name = table.unwrap_or_else(|| format!("{}s_summary", kind.as_str()));
            let table = TableRef::parse(&database, &table_name)?;
            let pipeline = EtlPipeline::from_config(&config).await?;
            let summary = pipeline.run_table(kind, &table).await?;
            println!(
                "{} run complete: run_id={} read={} inserted={} updated={} skipped={}",
                summary.kind,
                summary.run_id,
                summary.rows_read,
                summary.inserted,
                summary.updated,
                summary.failures.len()
            );
            for failure in &summary.failures {
                println!("  row {}: {}", failure.row_index, failure.message);
            }
        }
        Commands::Recent { reference_date } => {
            let pipeline = EtlPipeline::from_config(&config).await?;
            let reference = match reference_date {
                Some(date) => date,
                None => pipeline
                    .reader()
                    .latest_day()
                    .await?
                    .context("no daily summaries stored yet")?,
            };
            let summary = pipeline.run_recent(reference).await?;
            println!(
                "recent projection stored: latest_day={} id={}",
                summary.latest_day,
                summary.outcome.id()
            );
        }
        Commands::Tables { database } => {
            let database = Identifier::parse(&database)?;
            for table in config.build_source().list_tables(&database).await? {
                println!("{table}");
            }
        }
        Commands::Export {
            database,
            all: true,
            out,
            ..
        } => {
            let database = Identifier::parse(&database)?;
            let root = out.unwrap_or_else(|| PathBuf::from("."));
            let exported =
                vitals_source::export_database(config.build_source().as_ref(), &database, &root).await?;
            for (table, rows) in &exported {
                println!("{table}: {rows} rows");
            }
            println!("exported {} tables under {}", exported.len(), root.display());
        }
        Commands::Export {
            database,
            table,
            out,
            ..
        } => {
            let table_name = table.context("--table is required unless --all is given")?;
            let table = TableRef::parse(&database, &table_name)?;
            let rows = config.build_source().fetch_rows(&table).await?;
            let json = serde_json::to_string_pretty(&rows).context("serializing rows")?;
            match out {
                Some(path) => {
                    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                        tokio::fs::create_dir_all(parent)
                            .await
                            .with_context(|| format!("creating {}", parent.display()))?;
                    }
                    tokio::fs::write(&path, json)
                        .await
                        .with_context(|| format!("writing {}", path.display()))?;
                    println!("exported {} rows from {table} to {}", rows.len(), path.display());
                }
                None => println!("{json}"),
            }
        }
        Commands::Migrate => {
            config.open_store().await?;
            println!("document store ready");
        }
        Commands::Serve => {
            vitals_web::serve_from_env().await?;
        }
    }

    Ok(())
}
