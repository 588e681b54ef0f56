//! JSON file-based budget store.
//!
//! Limits are written as decimal strings so they reload exactly.

use super::{BudgetChange, BudgetError, BudgetStore, ConfigCell};
use crate::budget::types::{AgentBudget, BudgetAction, BudgetConfig, GlobalBudget};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::fs;

/// On-disk layout of `budgets.json`.
#[derive(Debug, Default, Serialize, Deserialize)]
struct StoredConfig {
    #[serde(default)]
    global: StoredGlobal,
    #[serde(default)]
    agents: Vec<StoredAgent>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoredGlobal {
    #[serde(default, with = "rust_decimal::serde::str_option")]
    daily_limit_usd: Option<Decimal>,
    #[serde(default)]
    action: BudgetAction,
}

#[derive(Debug, Serialize, Deserialize)]
struct StoredAgent {
    agent_id: String,
    #[serde(with = "rust_decimal::serde::str")]
    daily_limit_usd: Decimal,
    #[serde(default)]
    action: BudgetAction,
    updated_at: DateTime<Utc>,
}

impl From<&BudgetConfig> for StoredConfig {
    fn from(config: &BudgetConfig) -> Self {
        Self {
            global: StoredGlobal {
                daily_limit_usd: config.global.daily_limit_usd,
                action: config.global.action,
            },
            agents: config
                .agents
                .values()
                .map(|a| StoredAgent {
                    agent_id: a.agent_id.clone(),
                    daily_limit_usd: a.daily_limit_usd,
                    action: a.action,
                    updated_at: a.updated_at,
                })
                .collect(),
        }
    }
}

impl From<StoredConfig> for BudgetConfig {
    fn from(stored: StoredConfig) -> Self {
        Self {
            global: GlobalBudget::new(stored.global.daily_limit_usd, stored.global.action),
            agents: stored
                .agents
                .into_iter()
                .map(|a| {
                    (
                        a.agent_id.clone(),
                        AgentBudget {
                            agent_id: a.agent_id,
                            daily_limit_usd: a.daily_limit_usd,
                            action: a.action,
                            updated_at: a.updated_at,
                        },
                    )
                })
                .collect(),
        }
    }
}

pub struct FileBudgetStore {
    path: PathBuf,
    cell: ConfigCell,
}

impl FileBudgetStore {
    pub async fn new(base_dir: PathBuf) -> Result<Self, BudgetError> {
        fs::create_dir_all(&base_dir)
            .await
            .map_err(|e| BudgetError::Storage(format!("Failed to create budget dir: {}", e)))?;
        let path = base_dir.join("budgets.json");
        let config = match fs::read(&path).await {
            Ok(bytes) => match serde_json::from_slice::<StoredConfig>(&bytes) {
                Ok(stored) => {
                    let config = BudgetConfig::from(stored);
                    tracing::info!(
                        "Loaded {} agent budget(s) from {}",
                        config.agents.len(),
                        path.display()
                    );
                    config
                }
                Err(e) => {
                    tracing::warn!("Failed to parse budget store {}: {}", path.display(), e);
                    BudgetConfig::default()
                }
            },
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => BudgetConfig::default(),
            Err(err) => {
                tracing::warn!("Failed to read budget store {}: {}", path.display(), err);
                BudgetConfig::default()
            }
        };

        Ok(Self {
            path,
            cell: ConfigCell::new(config),
        })
    }
}

#[async_trait]
impl BudgetStore for FileBudgetStore {
    fn is_persistent(&self) -> bool {
        true
    }

    fn cell(&self) -> &ConfigCell {
        &self.cell
    }

    async fn persist(
        &self,
        _change: &BudgetChange,
        config: &BudgetConfig,
    ) -> Result<(), BudgetError> {
        let data = serde_json::to_vec_pretty(&StoredConfig::from(config))
            .map_err(|e| BudgetError::Storage(format!("Failed to serialize budgets: {}", e)))?;
        let tmp_path = self.path.with_extension("json.tmp");
        fs::write(&tmp_path, data)
            .await
            .map_err(|e| BudgetError::Storage(format!("Failed to write budgets: {}", e)))?;
        fs::rename(&tmp_path, &self.path)
            .await
            .map_err(|e| BudgetError::Storage(format!("Failed to finalize budgets: {}", e)))?;
        tracing::debug!("Saved budgets to {}", self.path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn test_budgets_survive_restart() {
        let temp = tempfile::tempdir().expect("tempdir");

        let store = FileBudgetStore::new(temp.path().to_path_buf())
            .await
            .unwrap();
        store
            .set_global_budget(Some(dec!(5.00)), BudgetAction::Block)
            .await
            .unwrap();
        store
            .set_agent_budget("bot1", dec!(2.00), BudgetAction::Warn)
            .await
            .unwrap();
        store
            .set_agent_budget("bot2", dec!(7.25), BudgetAction::Block)
            .await
            .unwrap();
        store.delete_agent_budget("bot2").await.unwrap();
        let before = store.snapshot().await;
        drop(store);

        let reopened = FileBudgetStore::new(temp.path().to_path_buf())
            .await
            .unwrap();
        assert_eq!(*reopened.snapshot().await, *before);
        assert!(reopened.get_agent_budget("bot2").await.is_none());
    }

    #[tokio::test]
    async fn test_limits_reload_exactly() {
        let temp = tempfile::tempdir().expect("tempdir");
        let precise = dec!(1.00000000000000000001);

        let store = FileBudgetStore::new(temp.path().to_path_buf())
            .await
            .unwrap();
        store
            .set_global_budget(Some(precise), BudgetAction::Block)
            .await
            .unwrap();
        store
            .set_agent_budget("bot1", precise, BudgetAction::Warn)
            .await
            .unwrap();
        let before = store.snapshot().await;
        drop(store);

        let raw = std::fs::read_to_string(temp.path().join("budgets.json")).unwrap();
        assert!(raw.contains("\"1.00000000000000000001\""));

        let reopened = FileBudgetStore::new(temp.path().to_path_buf())
            .await
            .unwrap();
        assert_eq!(*reopened.snapshot().await, *before);
        assert_eq!(
            reopened.get_global_budget().await.daily_limit_usd,
            Some(precise)
        );
        assert_eq!(
            reopened.get_agent_budget("bot1").await.unwrap().daily_limit_usd,
            precise
        );
    }

    #[tokio::test]
    async fn test_corrupt_file_starts_empty() {
        let temp = tempfile::tempdir().expect("tempdir");
        std::fs::write(temp.path().join("budgets.json"), b"{not json").unwrap();

        let store = FileBudgetStore::new(temp.path().to_path_buf())
            .await
            .unwrap();
        assert_eq!(*store.snapshot().await, BudgetConfig::default());
    }
}
