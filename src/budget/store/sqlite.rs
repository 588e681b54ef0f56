//! SQLite-based budget store.

use super::{BudgetChange, BudgetError, BudgetStore, ConfigCell};
use crate::budget::types::{AgentBudget, BudgetAction, BudgetConfig, GlobalBudget};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use rust_decimal::Decimal;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::Mutex;

const SCHEMA: &str = r#"
PRAGMA journal_mode = WAL;

CREATE TABLE IF NOT EXISTS global_budget (
    id INTEGER PRIMARY KEY NOT NULL CHECK (id = 1),
    daily_limit_usd TEXT,
    action TEXT NOT NULL DEFAULT 'warn',
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS agent_budgets (
    agent_id TEXT PRIMARY KEY NOT NULL,
    daily_limit_usd TEXT NOT NULL,
    action TEXT NOT NULL DEFAULT 'warn',
    updated_at TEXT NOT NULL
);
"#;

pub struct SqliteBudgetStore {
    conn: Arc<Mutex<Connection>>,
    cell: ConfigCell,
}

impl SqliteBudgetStore {
    pub async fn new(base_dir: PathBuf) -> Result<Self, BudgetError> {
        let db_path = base_dir.join("budgets.db");

        tokio::fs::create_dir_all(&base_dir)
            .await
            .map_err(|e| BudgetError::Storage(format!("Failed to create budget dir: {}", e)))?;

        let (conn, config) = tokio::task::spawn_blocking(move || {
            let conn = Connection::open(&db_path)
                .map_err(|e| format!("Failed to open SQLite database: {}", e))?;
            conn.execute_batch(SCHEMA)
                .map_err(|e| format!("Failed to run schema: {}", e))?;
            let config = Self::load_config(&conn)?;
            tracing::info!(
                "Loaded {} agent budget(s) from {}",
                config.agents.len(),
                db_path.display()
            );
            Ok::<_, String>((conn, config))
        })
        .await
        .map_err(|e| BudgetError::Storage(format!("Task join error: {}", e)))?
        .map_err(BudgetError::Storage)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            cell: ConfigCell::new(config),
        })
    }

    fn load_config(conn: &Connection) -> Result<BudgetConfig, String> {
        let global = conn
            .query_row(
                "SELECT daily_limit_usd, action FROM global_budget WHERE id = 1",
                [],
                |row| {
                    let limit: Option<String> = row.get(0)?;
                    let action: String = row.get(1)?;
                    Ok((limit, action))
                },
            )
            .optional()
            .map_err(|e| e.to_string())?
            .map(|(limit, action)| GlobalBudget {
                daily_limit_usd: limit.and_then(|l| parse_decimal(&l)),
                action: BudgetAction::from_str(&action),
            })
            .unwrap_or_default();

        let mut stmt = conn
            .prepare(
                "SELECT agent_id, daily_limit_usd, action, updated_at
                 FROM agent_budgets ORDER BY agent_id",
            )
            .map_err(|e| e.to_string())?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                ))
            })
            .map_err(|e| e.to_string())?
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| e.to_string())?;

        let mut agents = BTreeMap::new();
        for (agent_id, limit, action, updated_at) in rows {
            let Some(daily_limit_usd) = parse_decimal(&limit) else {
                tracing::warn!(agent_id = %agent_id, limit = %limit, "Skipping agent budget with unparsable limit");
                continue;
            };
            let updated_at = DateTime::parse_from_rfc3339(&updated_at)
                .map(|t| t.with_timezone(&Utc))
                .unwrap_or_else(|_| Utc::now());
            agents.insert(
                agent_id.clone(),
                AgentBudget {
                    agent_id,
                    daily_limit_usd,
                    action: BudgetAction::from_str(&action),
                    updated_at,
                },
            );
        }

        Ok(BudgetConfig { global, agents })
    }
}

fn parse_decimal(value: &str) -> Option<Decimal> {
    Decimal::from_str(value.trim()).ok()
}

#[async_trait]
impl BudgetStore for SqliteBudgetStore {
    fn is_persistent(&self) -> bool {
        true
    }

    fn cell(&self) -> &ConfigCell {
        &self.cell
    }

    async fn persist(
        &self,
        change: &BudgetChange,
        _config: &BudgetConfig,
    ) -> Result<(), BudgetError> {
        let conn = self.conn.clone();
        let change = change.clone();
        let now = Utc::now().to_rfc3339();

        tokio::task::spawn_blocking(move || {
            let conn = conn.blocking_lock();
            match change {
                BudgetChange::Global(global) => conn.execute(
                    "INSERT INTO global_budget (id, daily_limit_usd, action, updated_at)
                     VALUES (1, ?1, ?2, ?3)
                     ON CONFLICT(id) DO UPDATE SET
                        daily_limit_usd = excluded.daily_limit_usd,
                        action = excluded.action,
                        updated_at = excluded.updated_at",
                    params![
                        global.daily_limit_usd.map(|l| l.to_string()),
                        global.action.as_str(),
                        now
                    ],
                ),
                BudgetChange::AgentSet(budget) => conn.execute(
                    "INSERT INTO agent_budgets (agent_id, daily_limit_usd, action, updated_at)
                     VALUES (?1, ?2, ?3, ?4)
                     ON CONFLICT(agent_id) DO UPDATE SET
                        daily_limit_usd = excluded.daily_limit_usd,
                        action = excluded.action,
                        updated_at = excluded.updated_at",
                    params![
                        budget.agent_id,
                        budget.daily_limit_usd.to_string(),
                        budget.action.as_str(),
                        budget.updated_at.to_rfc3339()
                    ],
                ),
                BudgetChange::AgentDeleted(agent_id) => conn.execute(
                    "DELETE FROM agent_budgets WHERE agent_id = ?1",
                    params![agent_id],
                ),
            }
            .map(|_| ())
            .map_err(|e| BudgetError::Storage(e.to_string()))
        })
        .await
        .map_err(|e| BudgetError::Storage(format!("Task join error: {}", e)))?
    }
}
