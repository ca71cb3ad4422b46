use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;

use rally_elo::config::Settings;
use rally_elo::elo;
use rally_elo::pipeline::rebuild_ratings;
use rally_elo::warehouse;

/// Recompute `team_elo_history` and `upsets` from the staged matches.
#[derive(Parser)]
#[command(name = "elo_rebuild")]
#[command(version)]
struct Args {
    /// TOML settings file
    #[arg(short, long, env = "RALLY_ELO_CONFIG")]
    config: Option<PathBuf>,

    /// Override the configured K-factor for this rebuild
    #[arg(short, long)]
    k_factor: Option<f64>,

    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();
    rally_elo::init_tracing(args.verbose);

    let mut settings = Settings::load(args.config.as_deref())?;
    if let Some(k) = args.k_factor {
        settings.elo.k_factor = k;
        settings.validate().context("invalid --k-factor")?;
    }

    let db_path = settings.storage.warehouse_path.clone();
    let mut conn = warehouse::open_warehouse(&db_path)?;
    let outputs = rebuild_ratings(&mut conn, &settings.elo_config())?;

    println!("Rating rebuild complete");
    println!("DB: {}", db_path.display());
    println!("K-factor: {}", settings.elo.k_factor);
    println!("Matches rated: {}", outputs.matches_rated());
    println!("Upsets: {}", outputs.upsets.len());
    for (team, rating) in elo::final_ratings(&outputs.history).iter().take(10) {
        println!("  {team:<30} {rating:>7.1}");
    }
    Ok(())
}
