//! Budget evaluation.
//!
//! The free functions here are pure: they take a budget and a spend figure
//! and compute the alert state. [`Guardian`] wires them to the budget store
//! and the cost ledger.
//!
//! Enforcement is a soft cap. Spend is read, a decision is made, and the
//! cost of the request is only appended to the ledger after the provider
//! answers, so concurrent requests can all be admitted against the same
//! stale total.

use std::sync::Arc;
use std::time::Duration;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

use super::store::BudgetStore;
use super::types::{AgentBudget, BudgetAction, GlobalBudget};
use crate::ledger::{CostLedger, LedgerError};

/// Fraction of the limit at which a warning is raised.
pub const WARNING_THRESHOLD: Decimal = dec!(0.8);

/// `pct_used` reported when spend is positive against a zero limit.
pub const PCT_UNBOUNDED: Decimal = Decimal::MAX;

/// Which budget a result was computed against.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "agent_id", rename_all = "snake_case")]
pub enum Scope {
    Global,
    Agent(String),
}

impl std::fmt::Display for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Global => write!(f, "global"),
            Self::Agent(id) => write!(f, "agent:{}", id),
        }
    }
}

/// Outcome of checking one budget against one spend figure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GuardianResult {
    pub scope: Scope,
    pub today_spend_usd: Decimal,
    /// `None` when the scope has no limit.
    pub budget_usd: Option<Decimal>,
    /// Unclamped `today_spend_usd / budget_usd`; `None` without a limit.
    pub pct_used: Option<Decimal>,
    pub over_budget: bool,
    pub warning: bool,
    pub action: BudgetAction,
}

impl GuardianResult {
    fn unlimited(scope: Scope, today_spend_usd: Decimal, action: BudgetAction) -> Self {
        Self {
            scope,
            today_spend_usd,
            budget_usd: None,
            pct_used: None,
            over_budget: false,
            warning: false,
            action,
        }
    }

    pub fn has_limit(&self) -> bool {
        self.budget_usd.is_some()
    }

    /// `pct_used` clamped to `[0, 1]`, for progress bars only.
    pub fn display_pct(&self) -> Decimal {
        self.pct_used
            .unwrap_or(Decimal::ZERO)
            .clamp(Decimal::ZERO, Decimal::ONE)
    }

    pub fn decision(&self) -> Decision {
        decide(self)
    }

    /// The alert for this result, if it is warning or over budget.
    pub fn alert(&self) -> Option<GuardianAlert> {
        if !(self.over_budget || self.warning) {
            return None;
        }
        Some(GuardianAlert {
            scope: self.scope.clone(),
            today_spend_usd: self.today_spend_usd,
            budget_usd: self.budget_usd.unwrap_or(Decimal::ZERO),
            pct_used: self.pct_used.unwrap_or(Decimal::ZERO),
            over_budget: self.over_budget,
            warning: self.warning,
            action: self.action,
        })
    }
}

/// Alert surfaced to operators for a scope that is warning or over budget.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GuardianAlert {
    pub scope: Scope,
    pub today_spend_usd: Decimal,
    pub budget_usd: Decimal,
    pub pct_used: Decimal,
    pub over_budget: bool,
    pub warning: bool,
    pub action: BudgetAction,
}

/// What the caller should do with the in-flight request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Allow,
    Warn,
    Block,
}

impl Decision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Allow => "allow",
            Self::Warn => "warn",
            Self::Block => "block",
        }
    }

    /// Only `Block` refuses the request.
    pub fn allows_request(&self) -> bool {
        !matches!(self, Self::Block)
    }
}

impl std::fmt::Display for Decision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

fn evaluate_limit(
    scope: Scope,
    limit: Decimal,
    action: BudgetAction,
    today_spend_usd: Decimal,
) -> GuardianResult {
    let (pct_used, over_budget) = if limit.is_zero() {
        if today_spend_usd > Decimal::ZERO {
            (PCT_UNBOUNDED, true)
        } else {
            (Decimal::ZERO, false)
        }
    } else {
        let pct = today_spend_usd
            .checked_div(limit)
            .unwrap_or(PCT_UNBOUNDED);
        (pct, today_spend_usd >= limit)
    };

    GuardianResult {
        scope,
        today_spend_usd,
        budget_usd: Some(limit),
        pct_used: Some(pct_used),
        over_budget,
        warning: !over_budget && pct_used >= WARNING_THRESHOLD,
        action,
    }
}

/// Check total spend across all agents against the wallet cap.
pub fn evaluate_global(global_budget: &GlobalBudget, today_spend_usd: Decimal) -> GuardianResult {
    match global_budget.daily_limit_usd {
        None => GuardianResult::unlimited(Scope::Global, today_spend_usd, global_budget.action),
        Some(limit) => evaluate_limit(Scope::Global, limit, global_budget.action, today_spend_usd),
    }
}

/// Check an agent's own spend against its override.
///
/// Returns `None` when the agent has no budget of its own; the global check
/// is then the only one that applies. The global budget and global spend are
/// accepted for symmetry with [`Evaluation`] but never change the agent
/// result: an override replaces the wallet cap for the agent-level check.
pub fn evaluate_agent(
    agent_budget: Option<&AgentBudget>,
    _global_budget: &GlobalBudget,
    today_spend_usd_for_agent: Decimal,
    _today_spend_usd_global: Decimal,
) -> Option<GuardianResult> {
    let budget = agent_budget?;
    Some(evaluate_limit(
        Scope::Agent(budget.agent_id.clone()),
        budget.daily_limit_usd,
        budget.action,
        today_spend_usd_for_agent,
    ))
}

/// Map a result to a request decision.
pub fn decide(result: &GuardianResult) -> Decision {
    if result.over_budget {
        match result.action {
            BudgetAction::Block => Decision::Block,
            BudgetAction::Warn => Decision::Warn,
        }
    } else if result.warning {
        Decision::Warn
    } else {
        Decision::Allow
    }
}

/// Both checks for one request. The caller combines them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Evaluation {
    pub global: GuardianResult,
    pub agent: Option<GuardianResult>,
}

impl Evaluation {
    /// Most severe decision of the two results.
    pub fn decision(&self) -> Decision {
        let global = decide(&self.global);
        match &self.agent {
            Some(agent) => global.max(decide(agent)),
            None => global,
        }
    }

    pub fn alerts(&self) -> Vec<GuardianAlert> {
        std::iter::once(&self.global)
            .chain(self.agent.as_ref())
            .filter_map(GuardianResult::alert)
            .collect()
    }
}

/// What to do when today's spend cannot be read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerFailureMode {
    /// Allow the request and log a warning.
    #[default]
    FailOpen,
    /// Block the request.
    FailClosed,
}

impl LedgerFailureMode {
    /// Parse from environment variable value.
    pub fn from_str(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "closed" | "fail_closed" | "fail-closed" | "block" => Self::FailClosed,
            _ => Self::FailOpen,
        }
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum GuardianError {
    #[error("Cost ledger unavailable: {0}")]
    LedgerUnavailable(String),

    #[error("Agent '{0}' has a budget but no agent spend was supplied")]
    MissingAgentSpend(String),
}

/// Result of [`Guardian::admit`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Admission {
    pub decision: Decision,
    /// `None` when spend could not be read.
    pub evaluation: Option<Evaluation>,
    /// True when the decision came from the ledger failure policy.
    pub degraded: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Evaluates requests against the configured budgets and the cost ledger.
pub struct Guardian {
    budgets: Arc<dyn BudgetStore>,
    ledger: Arc<dyn CostLedger>,
    failure_mode: LedgerFailureMode,
    ledger_timeout: Duration,
}

impl Guardian {
    pub fn new(
        budgets: Arc<dyn BudgetStore>,
        ledger: Arc<dyn CostLedger>,
        failure_mode: LedgerFailureMode,
        ledger_timeout: Duration,
    ) -> Self {
        Self {
            budgets,
            ledger,
            failure_mode,
            ledger_timeout,
        }
    }

    pub fn failure_mode(&self) -> LedgerFailureMode {
        self.failure_mode
    }

    /// Evaluate already-known spend figures against the current budgets.
    ///
    /// Fails with `MissingAgentSpend` when `agent_id` has its own budget but
    /// `today_spend_agent` is `None`. For agents without a budget the figure
    /// is not needed.
    pub async fn evaluate(
        &self,
        agent_id: Option<&str>,
        today_spend_global: Decimal,
        today_spend_agent: Option<Decimal>,
    ) -> Result<Evaluation, GuardianError> {
        let config = self.budgets.snapshot().await;
        let global = evaluate_global(&config.global, today_spend_global);
        let agent = match agent_id.map(str::trim).and_then(|id| config.agent(id)) {
            Some(budget) => {
                let spend = today_spend_agent
                    .ok_or_else(|| GuardianError::MissingAgentSpend(budget.agent_id.clone()))?;
                evaluate_agent(Some(budget), &config.global, spend, today_spend_global)
            }
            None => None,
        };
        Ok(Evaluation { global, agent })
    }

    /// Read today's spend from the ledger and evaluate.
    pub async fn check(&self, agent_id: Option<&str>) -> Result<Evaluation, GuardianError> {
        let global_spend = self.today_spend(None).await?;
        let agent_spend = match agent_id {
            Some(id) => Some(self.today_spend(Some(id.trim())).await?),
            None => None,
        };
        self.evaluate(agent_id, global_spend, agent_spend).await
    }

    async fn today_spend(&self, agent_id: Option<&str>) -> Result<Decimal, GuardianError> {
        match tokio::time::timeout(self.ledger_timeout, self.ledger.today_spend(agent_id)).await {
            Ok(Ok(spend)) => Ok(spend),
            Ok(Err(e)) => Err(GuardianError::LedgerUnavailable(e.to_string())),
            Err(_) => Err(GuardianError::LedgerUnavailable(
                LedgerError::Timeout(self.ledger_timeout).to_string(),
            )),
        }
    }

    /// Decide whether a request may proceed.
    ///
    /// Never fails: a ledger outage is turned into `Allow` or `Block`
    /// according to the configured failure mode, with `degraded` set.
    pub async fn admit(&self, agent_id: Option<&str>) -> Admission {
        match self.check(agent_id).await {
            Ok(evaluation) => {
                let decision = evaluation.decision();
                match decision {
                    Decision::Allow => {}
                    Decision::Warn => {
                        for alert in evaluation.alerts() {
                            tracing::warn!(
                                scope = %alert.scope,
                                spend = %alert.today_spend_usd,
                                budget = %alert.budget_usd,
                                over_budget = alert.over_budget,
                                "Budget warning"
                            );
                        }
                    }
                    Decision::Block => {
                        for alert in evaluation.alerts().iter().filter(|a| a.over_budget) {
                            tracing::warn!(
                                scope = %alert.scope,
                                spend = %alert.today_spend_usd,
                                budget = %alert.budget_usd,
                                action = %alert.action,
                                "Budget exceeded, blocking request"
                            );
                        }
                    }
                }
                Admission {
                    decision,
                    evaluation: Some(evaluation),
                    degraded: false,
                    error: None,
                }
            }
            Err(e) => {
                let decision = match self.failure_mode {
                    LedgerFailureMode::FailOpen => Decision::Allow,
                    LedgerFailureMode::FailClosed => Decision::Block,
                };
                tracing::warn!(
                    agent_id = agent_id.unwrap_or("-"),
                    decision = %decision,
                    "Budget enforcement degraded: {}",
                    e
                );
                Admission {
                    decision,
                    evaluation: None,
                    degraded: true,
                    error: Some(e.to_string()),
                }
            }
        }
    }
}
