//! Budget configuration types.
//!
//! # Invariants
//! - `AgentBudget::daily_limit_usd > 0` (enforced by the stores)
//! - `GlobalBudget::daily_limit_usd` is `None` or `>= 0`
//! - agent ids are unique keys of `BudgetConfig::agents`

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// What happens when a budget is exceeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BudgetAction {
    /// Signal the overrun but let the request through.
    #[default]
    Warn,
    /// Refuse the request.
    Block,
}

impl BudgetAction {
    /// Parse from a stored/textual value. Unknown values fall back to `Warn`.
    pub fn from_str(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "block" => Self::Block,
            _ => Self::Warn,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Warn => "warn",
            Self::Block => "block",
        }
    }
}

impl std::fmt::Display for BudgetAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The wallet cap: a daily limit on total spend across all agents.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct GlobalBudget {
    /// `None` means no global cap.
    #[serde(default)]
    pub daily_limit_usd: Option<Decimal>,
    #[serde(default)]
    pub action: BudgetAction,
}

impl GlobalBudget {
    pub fn new(daily_limit_usd: Option<Decimal>, action: BudgetAction) -> Self {
        Self {
            daily_limit_usd,
            action,
        }
    }

    pub fn is_limited(&self) -> bool {
        self.daily_limit_usd.is_some()
    }
}

/// A per-agent override of the wallet cap.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentBudget {
    pub agent_id: String,
    pub daily_limit_usd: Decimal,
    pub action: BudgetAction,
    pub updated_at: DateTime<Utc>,
}

/// Immutable snapshot of every budget setting.
///
/// Stores publish a new `Arc<BudgetConfig>` on each mutation; readers never
/// observe a partially applied change.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct BudgetConfig {
    #[serde(default)]
    pub global: GlobalBudget,
    /// Keyed by agent id. `BTreeMap` keeps listing order stable.
    #[serde(default)]
    pub agents: BTreeMap<String, AgentBudget>,
}

impl BudgetConfig {
    pub fn agent(&self, agent_id: &str) -> Option<&AgentBudget> {
        self.agents.get(agent_id)
    }

    /// Agent budgets ordered by agent id.
    pub fn agent_list(&self) -> Vec<AgentBudget> {
        self.agents.values().cloned().collect()
    }
}
