use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};

use rally_elo::config::Settings;
use rally_elo::error::PipelineError;
use rally_elo::pipeline::{Pipeline, RunSummary};
use rally_elo::pipeline_state::PipelineState;
use rally_elo::source::HttpSource;

#[derive(Parser)]
#[command(name = "rally_elo")]
#[command(about = "Match ingestion, staging and Elo ratings")]
#[command(version)]
struct Cli {
    /// TOML settings file
    #[arg(short, long, global = true, env = "RALLY_ELO_CONFIG")]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the full pipeline once
    Run {
        /// Use the backfill window instead of the rolling window
        #[arg(long)]
        backfill: bool,
    },

    /// Print a summary of the pipeline state file
    State,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    rally_elo::init_tracing(cli.verbose);

    match dispatch(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            match err.downcast_ref::<PipelineError>().and_then(PipelineError::step_name) {
                Some(step) => eprintln!("pipeline failed at step `{step}`: {err:#}"),
                None => eprintln!("error: {err:#}"),
            }
            ExitCode::FAILURE
        }
    }
}

fn dispatch(cli: &Cli) -> Result<()> {
    let settings = Settings::load(cli.config.as_deref())?;
    match &cli.command {
        Commands::Run { backfill } => {
            let source = HttpSource::new(
                settings.api.base_url.clone(),
                Duration::from_secs(settings.api.request_timeout_secs),
            );
            let summary = Pipeline::new(settings, source)
                .with_backfill(*backfill)
                .run()?;
            print_summary(&summary);
        }
        Commands::State => {
            let state = PipelineState::load(&settings.storage.state_path)?;
            println!("State: {}", settings.storage.state_path.display());
            println!("Schema version: {}", state.schema_version);
            println!("Created: {}", state.created_at.to_rfc3339());
            match state.last_run {
                Some(ts) => println!("Last run: {}", ts.to_rfc3339()),
                None => println!("Last run: never"),
            }
            println!("Fetched matches: {}", state.fetched_match_nos.len());
            println!("Fetched tournaments: {}", state.fetched_tournament_nos.len());
        }
    }
    Ok(())
}

fn print_summary(summary: &RunSummary) {
    println!("Pipeline run {} complete", summary.run_id);
    println!("Window: {} days", summary.window_days);
    println!(
        "Extracted: {} tournaments, {} matches",
        summary.tournaments_extracted, summary.matches_extracted
    );
    println!(
        "Details: {} fetched, {} failed",
        summary.details_fetched,
        summary.details_failed.len()
    );
    println!(
        "Rankings: {} fetched, {} failed",
        summary.rankings_fetched,
        summary.rankings_failed.len()
    );
    println!(
        "Quality: {} checks, {} warnings, {} failures",
        summary.quality.checks.len(),
        summary.quality.warnings().count(),
        summary.quality.failures().count()
    );
    println!("Matches rated: {}", summary.matches_rated);
    println!("Upsets: {}", summary.upsets.len());
    for u in summary.upsets.iter().take(5) {
        println!(
            "  #{} {} beat {} (win prob {:.2}, surprise {:.2})",
            u.match_no, u.winner, u.loser, u.expected_win_prob, u.surprise_index
        );
    }
    if summary.views_applied > 0 {
        println!("Derived views applied: {}", summary.views_applied);
    }
    println!("Top ratings:");
    for (team, rating) in summary.final_ratings.iter().take(10) {
        println!("  {team:<30} {rating:>7.1}");
    }
}
