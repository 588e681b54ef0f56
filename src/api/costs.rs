//! Cost ledger and pricing endpoints.

use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::ledger::{
    CostLedger, CostRecord, CostSummary, LedgerError, NewCostRecord, RecordQuery,
    DEFAULT_RECORD_LIMIT,
};
use crate::pricing::{ModelPrice, PricingError, TokenUsage};

use super::routes::AppState;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/summary", get(summary))
        .route("/records", get(list_records).post(record_cost))
}

pub fn pricing_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(list_prices))
        .route("/sync", post(sync_prices))
}

#[derive(Debug, Deserialize)]
pub struct RecordsQuery {
    pub agent_id: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

/// Body for recording a completed request. When `cost_usd` is omitted it is
/// computed from the token counts and the pricing table.
#[derive(Debug, Deserialize)]
pub struct RecordCostRequest {
    pub agent_id: String,
    #[serde(default)]
    pub provider: String,
    pub model: String,
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub cache_creation_input_tokens: Option<u64>,
    #[serde(default)]
    pub cache_read_input_tokens: Option<u64>,
    #[serde(default)]
    pub cost_usd: Option<Decimal>,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize)]
pub struct SyncResponse {
    pub updated: usize,
}

fn ledger_error(e: LedgerError) -> (StatusCode, String) {
    let status = match e {
        LedgerError::InvalidRecord(_) => StatusCode::BAD_REQUEST,
        LedgerError::Storage(_) | LedgerError::Timeout(_) => StatusCode::SERVICE_UNAVAILABLE,
    };
    (status, e.to_string())
}

async fn summary(
    State(state): State<Arc<AppState>>,
) -> Result<Json<CostSummary>, (StatusCode, String)> {
    state
        .ledger
        .summary(Utc::now())
        .await
        .map(Json)
        .map_err(ledger_error)
}

async fn list_records(
    State(state): State<Arc<AppState>>,
    Query(params): Query<RecordsQuery>,
) -> Result<Json<Vec<CostRecord>>, (StatusCode, String)> {
    let query = RecordQuery {
        agent_id: params
            .agent_id
            .map(|id| id.trim().to_string())
            .filter(|id| !id.is_empty()),
        since: params.since,
        limit: params.limit.unwrap_or(DEFAULT_RECORD_LIMIT),
        offset: params.offset.unwrap_or(0),
    };
    state
        .ledger
        .records(&query)
        .await
        .map(Json)
        .map_err(ledger_error)
}

async fn record_cost(
    State(state): State<Arc<AppState>>,
    Json(req): Json<RecordCostRequest>,
) -> Result<(StatusCode, Json<CostRecord>), (StatusCode, String)> {
    let cost_usd = match req.cost_usd {
        Some(cost) => cost,
        None => {
            let usage = TokenUsage {
                input_tokens: req.input_tokens,
                output_tokens: req.output_tokens,
                cache_creation_input_tokens: req.cache_creation_input_tokens,
                cache_read_input_tokens: req.cache_read_input_tokens,
            };
            state
                .pricing
                .cost_for(&req.model, &usage)
                .await
                .map_err(|e| match e {
                    PricingError::UnknownModel(model) => (
                        StatusCode::UNPROCESSABLE_ENTITY,
                        format!("No price known for model '{}'; supply cost_usd", model),
                    ),
                    other => (StatusCode::UNPROCESSABLE_ENTITY, other.to_string()),
                })?
        }
    };

    let record = state
        .ledger
        .append(NewCostRecord {
            agent_id: req.agent_id,
            provider: req.provider,
            model: req.model,
            input_tokens: req.input_tokens,
            output_tokens: req.output_tokens,
            cost_usd,
            timestamp: req.timestamp,
        })
        .await
        .map_err(ledger_error)?;

    tracing::debug!(
        agent_id = %record.agent_id,
        model = %record.model,
        cost = %record.cost_usd,
        "Cost recorded"
    );
    Ok((StatusCode::CREATED, Json(record)))
}

async fn list_prices(State(state): State<Arc<AppState>>) -> Json<Vec<ModelPrice>> {
    Json(state.pricing.list().await)
}

async fn sync_prices(
    State(state): State<Arc<AppState>>,
) -> Result<Json<SyncResponse>, (StatusCode, String)> {
    match state.pricing.sync().await {
        Ok(updated) => Ok(Json(SyncResponse { updated })),
        Err(e) => {
            tracing::warn!("Pricing sync failed: {}", e);
            Err((StatusCode::BAD_GATEWAY, e.to_string()))
        }
    }
}
