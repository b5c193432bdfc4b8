use anyhow::Result;
use clap::{Parser, Subcommand};
use lotto_core::format_api_date;
use lotto_sync::{EvaluationOutcome, IngestOptions};
use tracing::warn;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "lotto-cli")]
#[command(about = "Mega-Sena draw ingestion and result tracking")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Backfill draws from the remote service (default: 1..=latest)
    Ingest {
        #[arg(long)]
        from: Option<u32>,
        #[arg(long)]
        to: Option<u32>,
        #[arg(long)]
        workers: Option<usize>,
    },
    /// Score configured selections against the latest draw and notify new results
    Evaluate,
    /// Create the draws and results tables
    Migrate,
    /// Compare the latest remote draw id with what is stored
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_logging();
    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Ingest {
        from: None,
        to: None,
        workers: None,
    }) {
        Commands::Ingest { from, to, workers } => {
            let summary =
                lotto_sync::run_ingestion_from_env(IngestOptions { from, to, workers }).await?;
            let c = &summary.counts;
            println!(
                "ingest complete: run_id={} range={}..={} inserted={} already_present={} not_found={} skipped={} failed={} not_dispatched={} duration={:.2}s",
                summary.run_id,
                summary.first_id,
                summary.last_id,
                c.inserted,
                c.already_present,
                c.not_found,
                c.wrong_game_type + c.incomplete + c.invalid,
                c.failed,
                c.not_dispatched,
                summary.duration.as_secs_f64()
            );
            let failed = summary.failed_ids();
            if !failed.is_empty() {
                warn!(?failed, "some draws failed; rerun ingest to retry them");
            }
        }
        Commands::Evaluate => match lotto_sync::run_evaluation_from_env().await? {
            EvaluationOutcome::NoNewResults { evaluated } => {
                println!(
                    "evaluate complete: no new results ({} already recorded)",
                    evaluated.len()
                );
            }
            EvaluationOutcome::RecordedAndNotified {
                recorded,
                already_recorded,
            } => {
                for result in &recorded {
                    println!(
                        "{} {} hits={} prize={}",
                        format_api_date(result.evaluation_date),
                        result.selection_key,
                        result.hit_count,
                        result.tier()
                    );
                }
                println!(
                    "evaluate complete: recorded={} already_recorded={}",
                    recorded.len(),
                    already_recorded
                );
            }
        },
        Commands::Migrate => {
            lotto_sync::migrate_from_env().await?;
            println!("migrate complete");
        }
        Commands::Status => {
            let status = lotto_sync::status_from_env().await?;
            println!(
                "latest_remote_id={} stored_draws={} missing={} recorded_results={}",
                status.latest_remote_id,
                status.stored_draws,
                status.missing_draws(),
                status.recorded_results
            );
        }
    }

    Ok(())
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,sqlx=warn"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();
}
