//! Budget configuration storage with pluggable backends.
//!
//! Supports:
//! - `memory`: In-memory storage (non-persistent, for testing)
//! - `file`: JSON file-based storage
//! - `sqlite`: SQLite database
//!
//! Every backend keeps the live configuration as an immutable
//! [`BudgetConfig`] behind an `Arc`. Mutations are serialized, applied to a
//! private copy, persisted, and only then published by swapping the pointer,
//! so evaluations always read a complete snapshot.

mod file;
mod memory;
mod sqlite;

pub use file::FileBudgetStore;
pub use memory::InMemoryBudgetStore;
pub use sqlite::SqliteBudgetStore;

use super::types::{AgentBudget, BudgetAction, BudgetConfig, GlobalBudget};
use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use std::ops::{Deref, DerefMut};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard, RwLock};

/// Longest accepted agent id.
pub const MAX_AGENT_ID_LEN: usize = 128;

/// Errors returned by budget configuration stores.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum BudgetError {
    #[error("Invalid budget limit: {0}")]
    InvalidLimit(String),

    #[error("Invalid agent id: {0}")]
    InvalidAgentId(String),

    #[error("No budget configured for agent '{0}'")]
    NotFound(String),

    #[error("Budget storage error: {0}")]
    Storage(String),
}

/// A single applied mutation, handed to backends that persist incrementally.
#[derive(Debug, Clone)]
pub enum BudgetChange {
    Global(GlobalBudget),
    AgentSet(AgentBudget),
    AgentDeleted(String),
}

/// Holder for the published configuration snapshot.
#[derive(Debug, Default)]
pub struct ConfigCell {
    current: RwLock<Arc<BudgetConfig>>,
    writer: Mutex<()>,
}

impl ConfigCell {
    pub fn new(config: BudgetConfig) -> Self {
        Self {
            current: RwLock::new(Arc::new(config)),
            writer: Mutex::new(()),
        }
    }

    pub async fn load(&self) -> Arc<BudgetConfig> {
        Arc::clone(&*self.current.read().await)
    }

    /// Start a mutation. Holds the writer lock until the draft is published
    /// or dropped; dropping without publishing discards the change.
    pub async fn draft(&self) -> ConfigDraft<'_> {
        let guard = self.writer.lock().await;
        let config = (*self.load().await).clone();
        ConfigDraft {
            cell: self,
            _guard: guard,
            config,
        }
    }
}

/// A private, mutable copy of the configuration.
pub struct ConfigDraft<'a> {
    cell: &'a ConfigCell,
    _guard: MutexGuard<'a, ()>,
    config: BudgetConfig,
}

impl ConfigDraft<'_> {
    /// Swap the draft in as the current snapshot.
    pub async fn publish(self) {
        *self.cell.current.write().await = Arc::new(self.config);
    }
}

impl Deref for ConfigDraft<'_> {
    type Target = BudgetConfig;

    fn deref(&self) -> &BudgetConfig {
        &self.config
    }
}

impl DerefMut for ConfigDraft<'_> {
    fn deref_mut(&mut self) -> &mut BudgetConfig {
        &mut self.config
    }
}

/// Reject negative global limits. `None` (no cap) and zero are accepted.
pub fn validate_global_limit(limit: Option<Decimal>) -> Result<(), BudgetError> {
    match limit {
        Some(l) if l < Decimal::ZERO => Err(BudgetError::InvalidLimit(
            format!("global daily limit must not be negative (got {})", l),
        )),
        _ => Ok(()),
    }
}

/// Agent limits must be strictly positive.
pub fn validate_agent_limit(limit: Decimal) -> Result<(), BudgetError> {
    if limit <= Decimal::ZERO {
        return Err(BudgetError::InvalidLimit(format!(
            "agent daily limit must be greater than zero (got {})",
            limit
        )));
    }
    Ok(())
}

/// Trim and validate an agent id.
pub fn normalize_agent_id(agent_id: &str) -> Result<String, BudgetError> {
    let trimmed = agent_id.trim();
    if trimmed.is_empty() {
        return Err(BudgetError::InvalidAgentId(
            "agent id must not be empty".to_string(),
        ));
    }
    if trimmed.chars().count() > MAX_AGENT_ID_LEN {
        return Err(BudgetError::InvalidAgentId(format!(
            "agent id longer than {} characters",
            MAX_AGENT_ID_LEN
        )));
    }
    if trimmed.chars().any(char::is_control) {
        return Err(BudgetError::InvalidAgentId(
            "agent id contains control characters".to_string(),
        ));
    }
    Ok(trimmed.to_string())
}

/// Budget store trait - implemented by all storage backends.
///
/// Backends provide the snapshot cell and a `persist` hook; the CRUD
/// operations are shared.
#[async_trait]
pub trait BudgetStore: Send + Sync {
    /// Whether this store persists data across restarts.
    fn is_persistent(&self) -> bool;

    /// The cell holding the published configuration.
    fn cell(&self) -> &ConfigCell;

    /// Durably record `change`. `config` is the full configuration after the
    /// change. Called with the writer lock held, before publishing.
    async fn persist(&self, change: &BudgetChange, config: &BudgetConfig)
        -> Result<(), BudgetError>;

    /// The current immutable configuration.
    async fn snapshot(&self) -> Arc<BudgetConfig> {
        self.cell().load().await
    }

    async fn get_global_budget(&self) -> GlobalBudget {
        self.snapshot().await.global.clone()
    }

    /// Replace the global budget.
    async fn set_global_budget(
        &self,
        limit: Option<Decimal>,
        action: BudgetAction,
    ) -> Result<GlobalBudget, BudgetError> {
        validate_global_limit(limit)?;
        let global = GlobalBudget::new(limit.map(|l| l.normalize()), action);

        let mut draft = self.cell().draft().await;
        draft.global = global.clone();
        self.persist(&BudgetChange::Global(global.clone()), &draft)
            .await?;
        draft.publish().await;

        tracing::info!(
            limit = ?global.daily_limit_usd,
            action = %global.action,
            "Global budget updated"
        );
        Ok(global)
    }

    /// Remove the global cap. Same as `set_global_budget(None, Warn)`.
    async fn clear_global_budget(&self) -> Result<GlobalBudget, BudgetError> {
        self.set_global_budget(None, BudgetAction::Warn).await
    }

    /// Agent budgets ordered by agent id.
    async fn list_agent_budgets(&self) -> Vec<AgentBudget> {
        self.snapshot().await.agent_list()
    }

    async fn get_agent_budget(&self, agent_id: &str) -> Option<AgentBudget> {
        self.snapshot().await.agent(agent_id.trim()).cloned()
    }

    /// Create or replace the budget for an agent.
    async fn set_agent_budget(
        &self,
        agent_id: &str,
        limit: Decimal,
        action: BudgetAction,
    ) -> Result<AgentBudget, BudgetError> {
        let agent_id = normalize_agent_id(agent_id)?;
        validate_agent_limit(limit)?;
        let budget = AgentBudget {
            agent_id: agent_id.clone(),
            daily_limit_usd: limit.normalize(),
            action,
            updated_at: Utc::now(),
        };

        let mut draft = self.cell().draft().await;
        draft.agents.insert(agent_id, budget.clone());
        self.persist(&BudgetChange::AgentSet(budget.clone()), &draft)
            .await?;
        draft.publish().await;

        tracing::info!(
            agent_id = %budget.agent_id,
            limit = %budget.daily_limit_usd,
            action = %budget.action,
            "Agent budget updated"
        );
        Ok(budget)
    }

    /// Remove an agent budget. Fails with `NotFound` when none exists.
    async fn delete_agent_budget(&self, agent_id: &str) -> Result<(), BudgetError> {
        let agent_id = agent_id.trim().to_string();

        let mut draft = self.cell().draft().await;
        if draft.agents.remove(&agent_id).is_none() {
            return Err(BudgetError::NotFound(agent_id));
        }
        self.persist(&BudgetChange::AgentDeleted(agent_id.clone()), &draft)
            .await?;
        draft.publish().await;

        tracing::info!(agent_id = %agent_id, "Agent budget deleted");
        Ok(())
    }
}

/// Budget store type selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BudgetStoreType {
    Memory,
    File,
    #[default]
    Sqlite,
}

impl BudgetStoreType {
    /// Parse from environment variable value.
    pub fn from_str(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "memory" => Self::Memory,
            "file" | "json" => Self::File,
            "sqlite" | "db" => Self::Sqlite,
            _ => Self::default(),
        }
    }
}

/// Create a budget store based on type and data directory.
pub async fn create_budget_store(
    store_type: BudgetStoreType,
    base_dir: PathBuf,
) -> Result<Arc<dyn BudgetStore>, BudgetError> {
    match store_type {
        BudgetStoreType::Memory => Ok(Arc::new(InMemoryBudgetStore::new())),
        BudgetStoreType::File => Ok(Arc::new(FileBudgetStore::new(base_dir).await?)),
        BudgetStoreType::Sqlite => Ok(Arc::new(SqliteBudgetStore::new(base_dir).await?)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn test_global_budget_starts_unlimited() {
        let store = InMemoryBudgetStore::new();
        let global = store.get_global_budget().await;
        assert_eq!(global.daily_limit_usd, None);
        assert_eq!(global.action, BudgetAction::Warn);
    }

    #[tokio::test]
    async fn test_set_global_budget_rejects_negative() {
        let store = InMemoryBudgetStore::new();
        let err = store
            .set_global_budget(Some(dec!(-1)), BudgetAction::Block)
            .await
            .unwrap_err();
        assert!(matches!(err, BudgetError::InvalidLimit(_)));
        assert_eq!(store.get_global_budget().await, GlobalBudget::default());
    }

    #[tokio::test]
    async fn test_set_global_budget_is_idempotent() {
        let store = InMemoryBudgetStore::new();
        store
            .set_global_budget(Some(dec!(5.00)), BudgetAction::Warn)
            .await
            .unwrap();
        let once = store.snapshot().await;
        store
            .set_global_budget(Some(dec!(5.00)), BudgetAction::Warn)
            .await
            .unwrap();
        let twice = store.snapshot().await;
        assert_eq!(*once, *twice);
    }

    #[tokio::test]
    async fn test_clear_global_budget() {
        let store = InMemoryBudgetStore::new();
        store
            .set_global_budget(Some(dec!(10)), BudgetAction::Block)
            .await
            .unwrap();
        let cleared = store.clear_global_budget().await.unwrap();
        assert_eq!(cleared, GlobalBudget::new(None, BudgetAction::Warn));
        assert_eq!(store.get_global_budget().await, cleared);
    }

    #[tokio::test]
    async fn test_zero_global_limit_is_accepted() {
        let store = InMemoryBudgetStore::new();
        let global = store
            .set_global_budget(Some(Decimal::ZERO), BudgetAction::Block)
            .await
            .unwrap();
        assert_eq!(global.daily_limit_usd, Some(Decimal::ZERO));
    }

    #[tokio::test]
    async fn test_agent_budget_validation() {
        let store = InMemoryBudgetStore::new();
        assert!(matches!(
            store
                .set_agent_budget("bot1", Decimal::ZERO, BudgetAction::Warn)
                .await,
            Err(BudgetError::InvalidLimit(_))
        ));
        assert!(matches!(
            store
                .set_agent_budget("bot1", dec!(-3), BudgetAction::Warn)
                .await,
            Err(BudgetError::InvalidLimit(_))
        ));
        assert!(matches!(
            store
                .set_agent_budget("   ", dec!(1), BudgetAction::Warn)
                .await,
            Err(BudgetError::InvalidAgentId(_))
        ));
        assert!(matches!(
            store
                .set_agent_budget(&"x".repeat(MAX_AGENT_ID_LEN + 1), dec!(1), BudgetAction::Warn)
                .await,
            Err(BudgetError::InvalidAgentId(_))
        ));
        assert!(store.list_agent_budgets().await.is_empty());
    }

    #[tokio::test]
    async fn test_set_agent_budget_creates_then_replaces() {
        let store = InMemoryBudgetStore::new();
        let first = store
            .set_agent_budget(" bot1 ", dec!(2.00), BudgetAction::Warn)
            .await
            .unwrap();
        assert_eq!(first.agent_id, "bot1");

        let second = store
            .set_agent_budget("bot1", dec!(3.50), BudgetAction::Block)
            .await
            .unwrap();
        assert!(second.updated_at >= first.updated_at);

        let list = store.list_agent_budgets().await;
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].daily_limit_usd, dec!(3.5));
        assert_eq!(list[0].action, BudgetAction::Block);
    }

    #[tokio::test]
    async fn test_list_agent_budgets_is_sorted() {
        let store = InMemoryBudgetStore::new();
        for id in ["zeta", "alpha", "mid"] {
            store
                .set_agent_budget(id, dec!(1), BudgetAction::Warn)
                .await
                .unwrap();
        }
        let ids: Vec<String> = store
            .list_agent_budgets()
            .await
            .into_iter()
            .map(|b| b.agent_id)
            .collect();
        assert_eq!(ids, vec!["alpha", "mid", "zeta"]);
    }

    #[tokio::test]
    async fn test_delete_agent_budget() {
        let store = InMemoryBudgetStore::new();
        store
            .set_agent_budget("bot1", dec!(2), BudgetAction::Warn)
            .await
            .unwrap();
        store.delete_agent_budget("bot1").await.unwrap();
        assert!(store
            .list_agent_budgets()
            .await
            .iter()
            .all(|b| b.agent_id != "bot1"));

        // Deleting again is an error, not a no-op.
        assert_eq!(
            store.delete_agent_budget("bot1").await,
            Err(BudgetError::NotFound("bot1".to_string()))
        );
    }

    #[tokio::test]
    async fn test_snapshot_is_not_affected_by_later_writes() {
        let store = InMemoryBudgetStore::new();
        let before = store.snapshot().await;
        store
            .set_global_budget(Some(dec!(1)), BudgetAction::Block)
            .await
            .unwrap();
        assert_eq!(before.global.daily_limit_usd, None);
        assert_eq!(
            store.snapshot().await.global.daily_limit_usd,
            Some(dec!(1))
        );
    }

    #[tokio::test]
    async fn test_concurrent_writers_all_land() {
        let store = Arc::new(InMemoryBudgetStore::new());
        let mut handles = Vec::new();
        for i in 0..16 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                store
                    .set_agent_budget(&format!("agent-{:02}", i), dec!(1), BudgetAction::Warn)
                    .await
                    .unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(store.list_agent_budgets().await.len(), 16);
    }

    #[test]
    fn test_store_type_parsing() {
        assert_eq!(BudgetStoreType::from_str("memory"), BudgetStoreType::Memory);
        assert_eq!(BudgetStoreType::from_str("JSON"), BudgetStoreType::File);
        assert_eq!(BudgetStoreType::from_str("db"), BudgetStoreType::Sqlite);
        assert_eq!(BudgetStoreType::from_str("nope"), BudgetStoreType::Sqlite);
    }
}
