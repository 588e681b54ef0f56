//! Budget module - daily spend budgets and their evaluation.
//!
//! # Key Concepts
//! - Wallet cap: the global daily budget across all agents
//! - Agent override: a per-agent daily budget that replaces the wallet cap
//!   for that agent's own spend check
//! - Guardian: turns budgets + today's spend into Allow / Warn / Block

mod guardian;
mod store;
mod types;

pub use guardian::{
    decide, evaluate_agent, evaluate_global, Admission, Decision, Evaluation, Guardian,
    GuardianAlert, GuardianError, GuardianResult, LedgerFailureMode, Scope, PCT_UNBOUNDED,
    WARNING_THRESHOLD,
};
pub use store::{
    create_budget_store, normalize_agent_id, BudgetChange, BudgetError, BudgetStore,
    BudgetStoreType, ConfigCell, ConfigDraft, FileBudgetStore, InMemoryBudgetStore,
    SqliteBudgetStore, MAX_AGENT_ID_LEN,
};
pub use types::{AgentBudget, BudgetAction, BudgetConfig, GlobalBudget};
