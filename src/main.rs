//! budget-guardian - HTTP Server Entry Point
//!
//! Starts the HTTP server that exposes the budget API.

use budget_guardian::{api, config::Config};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "budget_guardian=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env()?;
    info!(
        data_dir = %config.data_dir.display(),
        failure_mode = ?config.ledger_failure_mode,
        "Loaded configuration"
    );

    api::serve(config).await?;

    Ok(())
}
