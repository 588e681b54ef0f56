//! Budget configuration and evaluation endpoints.

use std::str::FromStr;
use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, HeaderValue, StatusCode},
    response::Json,
    routing::{get, post, put},
    Router,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::budget::{
    Admission, AgentBudget, BudgetAction, BudgetError, BudgetStore, Decision, Evaluation,
    GlobalBudget, GuardianAlert, GuardianError,
};

use super::routes::AppState;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route(
            "/global",
            get(get_global).put(set_global).delete(clear_global),
        )
        .route("/agents", get(list_agents))
        .route("/agents/:agent_id", put(set_agent).delete(delete_agent))
        .route("/evaluate", post(evaluate))
        .route("/status", get(status))
}

/// Body for setting a budget.
///
/// `daily_limit_usd` accepts a JSON number or a numeric string. For the
/// global budget `null` or an empty string removes the cap.
#[derive(Debug, Deserialize)]
pub struct SetBudgetRequest {
    #[serde(default)]
    pub daily_limit_usd: Value,
    #[serde(default)]
    pub action: BudgetAction,
}

#[derive(Debug, Deserialize)]
pub struct EvaluateRequest {
    #[serde(default)]
    pub agent_id: Option<String>,
    pub today_spend_global: Decimal,
    #[serde(default)]
    pub today_spend_agent: Option<Decimal>,
}

#[derive(Debug, Serialize)]
pub struct EvaluateResponse {
    pub decision: Decision,
    #[serde(flatten)]
    pub evaluation: Evaluation,
    pub alerts: Vec<GuardianAlert>,
}

#[derive(Debug, Deserialize)]
pub struct StatusQuery {
    #[serde(default)]
    pub agent_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    /// False only for `block`.
    pub allowed: bool,
    #[serde(flatten)]
    pub admission: Admission,
    pub alerts: Vec<GuardianAlert>,
}

fn budget_error(e: BudgetError) -> (StatusCode, String) {
    let status = match e {
        BudgetError::InvalidLimit(_) | BudgetError::InvalidAgentId(_) => StatusCode::BAD_REQUEST,
        BudgetError::NotFound(_) => StatusCode::NOT_FOUND,
        BudgetError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, e.to_string())
}

fn guardian_error(e: GuardianError) -> (StatusCode, String) {
    let status = match e {
        GuardianError::MissingAgentSpend(_) => StatusCode::BAD_REQUEST,
        GuardianError::LedgerUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
    };
    (status, e.to_string())
}

fn parse_decimal(s: &str) -> Option<Decimal> {
    Decimal::from_str(s)
        .or_else(|_| Decimal::from_scientific(s))
        .ok()
}

/// Interpret a limit field. `Ok(None)` means "no limit given".
fn parse_limit(value: &Value) -> Result<Option<Decimal>, BudgetError> {
    match value {
        Value::Null => Ok(None),
        Value::Number(n) => parse_decimal(&n.to_string())
            .map(Some)
            .ok_or_else(|| BudgetError::InvalidLimit(format!("{} is not a valid amount", n))),
        Value::String(s) if s.trim().is_empty() => Ok(None),
        Value::String(s) => parse_decimal(s.trim())
            .map(Some)
            .ok_or_else(|| BudgetError::InvalidLimit(format!("'{}' is not a number", s))),
        other => Err(BudgetError::InvalidLimit(format!(
            "expected a number, got {}",
            other
        ))),
    }
}

async fn get_global(State(state): State<Arc<AppState>>) -> Json<GlobalBudget> {
    Json(state.budgets.get_global_budget().await)
}

async fn set_global(
    State(state): State<Arc<AppState>>,
    Json(req): Json<SetBudgetRequest>,
) -> Result<Json<GlobalBudget>, (StatusCode, String)> {
    let limit = parse_limit(&req.daily_limit_usd).map_err(budget_error)?;
    state
        .budgets
        .set_global_budget(limit, req.action)
        .await
        .map(Json)
        .map_err(budget_error)
}

async fn clear_global(
    State(state): State<Arc<AppState>>,
) -> Result<Json<GlobalBudget>, (StatusCode, String)> {
    state
        .budgets
        .clear_global_budget()
        .await
        .map(Json)
        .map_err(budget_error)
}

async fn list_agents(State(state): State<Arc<AppState>>) -> Json<Vec<AgentBudget>> {
    Json(state.budgets.list_agent_budgets().await)
}

async fn set_agent(
    State(state): State<Arc<AppState>>,
    Path(agent_id): Path<String>,
    Json(req): Json<SetBudgetRequest>,
) -> Result<Json<AgentBudget>, (StatusCode, String)> {
    let limit = parse_limit(&req.daily_limit_usd)
        .and_then(|l| {
            l.ok_or_else(|| BudgetError::InvalidLimit("daily_limit_usd is required".to_string()))
        })
        .map_err(budget_error)?;
    state
        .budgets
        .set_agent_budget(&agent_id, limit, req.action)
        .await
        .map(Json)
        .map_err(budget_error)
}

async fn delete_agent(
    State(state): State<Arc<AppState>>,
    Path(agent_id): Path<String>,
) -> Result<StatusCode, (StatusCode, String)> {
    state
        .budgets
        .delete_agent_budget(&agent_id)
        .await
        .map(|_| StatusCode::NO_CONTENT)
        .map_err(budget_error)
}

async fn evaluate(
    State(state): State<Arc<AppState>>,
    Json(req): Json<EvaluateRequest>,
) -> Result<Json<EvaluateResponse>, (StatusCode, String)> {
    let evaluation = state
        .guardian
        .evaluate(
            req.agent_id.as_deref(),
            req.today_spend_global,
            req.today_spend_agent,
        )
        .await
        .map_err(guardian_error)?;
    Ok(Json(EvaluateResponse {
        decision: evaluation.decision(),
        alerts: evaluation.alerts(),
        evaluation,
    }))
}

/// Evaluate today's ledger spend. The decision is mirrored in the
/// `x-budget-decision` and `x-budget-degraded` headers.
async fn status(
    State(state): State<Arc<AppState>>,
    Query(query): Query<StatusQuery>,
) -> (HeaderMap, Json<StatusResponse>) {
    let agent_id = query.agent_id.filter(|id| !id.trim().is_empty());
    let admission = state.guardian.admit(agent_id.as_deref()).await;

    let mut headers = HeaderMap::new();
    headers.insert(
        "x-budget-decision",
        HeaderValue::from_static(admission.decision.as_str()),
    );
    headers.insert(
        "x-budget-degraded",
        HeaderValue::from_static(if admission.degraded { "true" } else { "false" }),
    );

    let alerts = admission
        .evaluation
        .as_ref()
        .map(Evaluation::alerts)
        .unwrap_or_default();
    (
        headers,
        Json(StatusResponse {
            allowed: admission.decision.allows_request(),
            admission,
            alerts,
        }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use serde_json::json;

    #[test]
    fn test_parse_limit_accepts_numbers_and_strings() {
        assert_eq!(parse_limit(&json!(5)).unwrap(), Some(dec!(5)));
        assert_eq!(parse_limit(&json!(2.5)).unwrap(), Some(dec!(2.5)));
        assert_eq!(parse_limit(&json!("10.25")).unwrap(), Some(dec!(10.25)));
        assert_eq!(parse_limit(&json!(" 3 ")).unwrap(), Some(dec!(3)));
    }

    #[test]
    fn test_parse_limit_blank_means_no_limit() {
        assert_eq!(parse_limit(&Value::Null).unwrap(), None);
        assert_eq!(parse_limit(&json!("")).unwrap(), None);
        assert_eq!(parse_limit(&json!("   ")).unwrap(), None);
    }

    #[test]
    fn test_parse_limit_rejects_non_numeric() {
        assert!(matches!(
            parse_limit(&json!("abc")),
            Err(BudgetError::InvalidLimit(_))
        ));
        assert!(matches!(
            parse_limit(&json!(true)),
            Err(BudgetError::InvalidLimit(_))
        ));
        assert!(matches!(
            parse_limit(&json!([1])),
            Err(BudgetError::InvalidLimit(_))
        ));
    }

    #[test]
    fn test_budget_error_status() {
        assert_eq!(
            budget_error(BudgetError::InvalidLimit("x".into())).0,
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            budget_error(BudgetError::NotFound("a".into())).0,
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            budget_error(BudgetError::Storage("disk".into())).0,
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
