//! Sports-event ingestion: rate-limited extraction into a Parquet lake,
//! SQLite staging with quality checks, and an Elo rating history with upset
//! detection on top.

pub mod config;
pub mod elo;
pub mod error;
pub mod extract;
pub mod frame;
pub mod lake;
pub mod pipeline;
pub mod pipeline_state;
pub mod quality;
pub mod rate_limit;
pub mod source;
pub mod upsets;
pub mod warehouse;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Installs the global subscriber. `RUST_LOG` wins over the default filter.
pub fn init_tracing(verbose: bool) {
    let default_filter = if verbose {
        "rally_elo=debug,elo_rebuild=debug"
    } else {
        "rally_elo=info,elo_rebuild=info"
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}
