//! Adjutant server binary.
//!
//! Usage:
//!   adjutant --bind 0.0.0.0:4210 --project-root ~/src/app
//!
//! Every flag also reads an `ADJUTANT_*` environment variable; see `--help`.
//! Log verbosity follows `RUST_LOG` (default `info`).

use adjutant_server::Config;
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,tower_http=debug".into()),
        )
        .init();

    let config = Config::parse();
    tracing::debug!(bind = %config.bind, data_dir = %config.data_dir().display(), "Configuration loaded");
    adjutant_server::run(config).await
}
