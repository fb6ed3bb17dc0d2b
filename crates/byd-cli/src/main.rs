use anyhow::{bail, Result};
use byd_sync::{EtlConfig, RunOptions, RunSummary, SyncPipeline};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "byd-cli")]
#[command(about = "Incremental ByDesign analytics loader")]
struct Cli {
    /// Load into an in-memory sink; nothing is written to PostgreSQL.
    #[arg(long, global = true)]
    dry_run: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Load every enabled dataset.
    Run,
    /// Load a single dataset by id.
    Dataset { id: String },
    /// Print the reload window this run would use.
    Window,
}

fn print_summary(summary: &RunSummary) {
    for report in &summary.datasets {
        let detail = match (&report.outcome, &report.error) {
            (Some(outcome), _) => format!(
                "pages={} written={} deleted={} dropped={} nan={}",
                outcome.pages,
                outcome.rows_written,
                outcome.rows_deleted,
                outcome.normalize.dropped_out_of_window,
                outcome.normalize.unparsable_values
            ),
            (None, Some(error)) => error.clone(),
            (None, None) => String::new(),
        };
        println!(
            "{:<16} {:<18} {:<28} {:?} {}",
            report.dataset_id, report.display_name, report.table, report.status, detail
        );
    }
    println!(
        "run complete: run_id={} reports={}",
        summary.run_id,
        summary.reports_dir.as_deref().unwrap_or("-")
    );
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .compact()
        .try_init();

    let cli = Cli::parse();
    let pipeline = SyncPipeline::new(EtlConfig::from_env()?);

    let only_dataset = match cli.command.unwrap_or(Commands::Run) {
        Commands::Window => {
            let window = pipeline.plan_window(chrono::Local::now().date_naive());
            println!("{}", serde_json::to_string_pretty(&window)?);
            return Ok(());
        }
        Commands::Run => None,
        Commands::Dataset { id } => Some(id),
    };

    let summary = pipeline
        .run_once(&RunOptions {
            only_dataset,
            dry_run: cli.dry_run,
        })
        .await?;
    print_summary(&summary);

    let failed: Vec<_> = summary.failed().map(|d| d.dataset_id.as_str()).collect();
    if !failed.is_empty() {
        bail!("{} dataset(s) failed: {}", failed.len(), failed.join(", "));
    }
    Ok(())
}
