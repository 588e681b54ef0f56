//! Router assembly and server startup.

use std::sync::Arc;

use axum::{extract::State, response::Json, routing::get, Router};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::budget::{create_budget_store, BudgetStore, Guardian};
use crate::config::Config;
use crate::ledger::{create_cost_ledger, CostLedger};
use crate::pricing::{PricingTable, SharedPricingTable};

use super::budget as budget_api;
use super::costs as costs_api;

/// Shared application state.
pub struct AppState {
    /// Budget configuration store
    pub budgets: Arc<dyn BudgetStore>,
    /// Cost ledger
    pub ledger: Arc<dyn CostLedger>,
    /// Model pricing table
    pub pricing: SharedPricingTable,
    /// Evaluates requests against budgets and the ledger
    pub guardian: Guardian,
}

impl AppState {
    pub fn new(
        config: &Config,
        budgets: Arc<dyn BudgetStore>,
        ledger: Arc<dyn CostLedger>,
        pricing: SharedPricingTable,
    ) -> Self {
        let guardian = Guardian::new(
            Arc::clone(&budgets),
            Arc::clone(&ledger),
            config.ledger_failure_mode,
            config.ledger_timeout,
        );
        Self {
            budgets,
            ledger,
            pricing,
            guardian,
        }
    }
}

/// Build the router over `state`.
pub fn app(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .nest("/api/budget", budget_api::routes())
        .nest("/api/costs", costs_api::routes())
        .nest("/api/pricing", costs_api::pricing_routes())
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Start the HTTP server.
pub async fn serve(config: Config) -> anyhow::Result<()> {
    let budgets = create_budget_store(config.budget_store, config.data_dir.clone()).await?;
    tracing::info!(
        store = ?config.budget_store,
        persistent = budgets.is_persistent(),
        "Budget store initialized"
    );

    let ledger = create_cost_ledger(config.ledger_store, config.data_dir.clone()).await?;
    tracing::info!(store = ?config.ledger_store, "Cost ledger initialized");

    let pricing = Arc::new(PricingTable::new(config.pricing_url.clone()));

    let addr = format!("{}:{}", config.host, config.port);
    let state = Arc::new(AppState::new(&config, budgets, ledger, pricing));

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Listening on {}", addr);
    axum::serve(listener, app(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutting down");
}

async fn health(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "ledger_failure_mode": state.guardian.failure_mode(),
    }))
}
