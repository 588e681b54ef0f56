//! SQLite-based cost ledger.
//!
//! Timestamps are stored as integer microseconds since the epoch so range
//! queries compare numbers. Costs are stored as decimal TEXT and summed in
//! Rust to avoid float rounding in SQL.

use super::{checked_total, CostLedger, CostRecord, LedgerError, NewCostRecord, RecordQuery};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, types::Type, Connection};
use rust_decimal::Decimal;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

const SCHEMA: &str = r#"
PRAGMA journal_mode = WAL;

CREATE TABLE IF NOT EXISTS cost_records (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    id TEXT NOT NULL UNIQUE,
    agent_id TEXT NOT NULL,
    provider TEXT NOT NULL,
    model TEXT NOT NULL,
    input_tokens INTEGER NOT NULL DEFAULT 0,
    output_tokens INTEGER NOT NULL DEFAULT 0,
    cost_usd TEXT NOT NULL,
    ts_us INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_cost_records_ts ON cost_records(ts_us);
CREATE INDEX IF NOT EXISTS idx_cost_records_agent_ts ON cost_records(agent_id, ts_us);
"#;

const RECORD_COLUMNS: &str =
    "id, agent_id, provider, model, input_tokens, output_tokens, cost_usd, ts_us";

pub struct SqliteCostLedger {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteCostLedger {
    pub async fn new(base_dir: PathBuf) -> Result<Self, LedgerError> {
        let db_path = base_dir.join("costs.db");

        tokio::fs::create_dir_all(&base_dir)
            .await
            .map_err(|e| LedgerError::Storage(format!("Failed to create ledger dir: {}", e)))?;

        let conn = tokio::task::spawn_blocking(move || {
            let conn = Connection::open(&db_path)
                .map_err(|e| format!("Failed to open SQLite database: {}", e))?;
            conn.execute_batch(SCHEMA)
                .map_err(|e| format!("Failed to run schema: {}", e))?;
            tracing::info!("Opened cost ledger at {}", db_path.display());
            Ok::<_, String>(conn)
        })
        .await
        .map_err(|e| LedgerError::Storage(format!("Task join error: {}", e)))?
        .map_err(LedgerError::Storage)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run a blocking closure against the connection.
    async fn with_conn<T, F>(&self, f: F) -> Result<T, LedgerError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> rusqlite::Result<T> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn.blocking_lock();
            f(&conn).map_err(|e| LedgerError::Storage(e.to_string()))
        })
        .await
        .map_err(|e| LedgerError::Storage(format!("Task join error: {}", e)))?
    }
}

fn to_micros(t: DateTime<Utc>) -> i64 {
    t.timestamp_micros()
}

fn from_micros(us: i64) -> DateTime<Utc> {
    let secs = us.div_euclid(1_000_000);
    let nanos = (us.rem_euclid(1_000_000) * 1_000) as u32;
    Utc.timestamp_opt(secs, nanos)
        .single()
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

fn parse_cost(value: &str) -> Result<Decimal, rust_decimal::Error> {
    Decimal::from_str(value.trim())
}

fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<CostRecord> {
    let id: String = row.get(0)?;
    let cost: String = row.get(6)?;
    Ok(CostRecord {
        id: Uuid::parse_str(&id).unwrap_or_default(),
        agent_id: row.get(1)?,
        provider: row.get(2)?,
        model: row.get(3)?,
        input_tokens: row.get::<_, i64>(4)?.max(0) as u64,
        output_tokens: row.get::<_, i64>(5)?.max(0) as u64,
        cost_usd: parse_cost(&cost)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(6, Type::Text, Box::new(e)))?,
        timestamp: from_micros(row.get(7)?),
    })
}

#[async_trait]
impl CostLedger for SqliteCostLedger {
    async fn append(&self, record: NewCostRecord) -> Result<CostRecord, LedgerError> {
        let mut record = record.into_record()?;
        // Stored precision is microseconds; return what a reload would see.
        record.timestamp = from_micros(to_micros(record.timestamp));
        let stored = record.clone();

        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO cost_records
                    (id, agent_id, provider, model, input_tokens, output_tokens, cost_usd, ts_us)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    stored.id.to_string(),
                    stored.agent_id,
                    stored.provider,
                    stored.model,
                    stored.input_tokens.min(i64::MAX as u64) as i64,
                    stored.output_tokens.min(i64::MAX as u64) as i64,
                    stored.cost_usd.to_string(),
                    to_micros(stored.timestamp),
                ],
            )
            .map(|_| ())
        })
        .await?;

        tracing::debug!(
            agent_id = %record.agent_id,
            model = %record.model,
            cost_usd = %record.cost_usd,
            "Recorded cost"
        );
        Ok(record)
    }

    async fn spend_since(
        &self,
        agent_id: Option<&str>,
        since: DateTime<Utc>,
    ) -> Result<Decimal, LedgerError> {
        let agent_id = agent_id.map(str::to_string);
        let since_us = to_micros(since);

        let costs: Vec<String> = self
            .with_conn(move |conn| match agent_id {
                Some(agent_id) => {
                    let mut stmt = conn.prepare(
                        "SELECT cost_usd FROM cost_records WHERE agent_id = ?1 AND ts_us >= ?2",
                    )?;
                    let rows = stmt.query_map(params![agent_id, since_us], |row| row.get(0))?;
                    rows.collect()
                }
                None => {
                    let mut stmt =
                        conn.prepare("SELECT cost_usd FROM cost_records WHERE ts_us >= ?1")?;
                    let rows = stmt.query_map(params![since_us], |row| row.get(0))?;
                    rows.collect()
                }
            })
            .await?;

        let costs = costs
            .iter()
            .map(|c| {
                parse_cost(c).map_err(|e| {
                    tracing::warn!(value = %c, "Unparsable cost in ledger: {}", e);
                    LedgerError::Storage(format!("unparsable cost '{}' in ledger: {}", c, e))
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        checked_total(costs)
    }

    async fn records(&self, query: &RecordQuery) -> Result<Vec<CostRecord>, LedgerError> {
        let agent_id = query.agent_id.clone();
        let since_us = query.since.map(to_micros).unwrap_or(i64::MIN);
        let limit = query.clamped_limit() as i64;
        let offset = query.offset.min(i64::MAX as usize) as i64;

        self.with_conn(move |conn| {
            let sql = format!(
                "SELECT {} FROM cost_records
                 WHERE (?1 IS NULL OR agent_id = ?1) AND ts_us >= ?2
                 ORDER BY ts_us DESC, seq DESC
                 LIMIT ?3 OFFSET ?4",
                RECORD_COLUMNS
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params![agent_id, since_us, limit, offset], row_to_record)?;
            rows.collect()
        })
        .await
    }

    async fn records_since(&self, since: DateTime<Utc>) -> Result<Vec<CostRecord>, LedgerError> {
        let since_us = to_micros(since);
        self.with_conn(move |conn| {
            let sql = format!(
                "SELECT {} FROM cost_records WHERE ts_us >= ?1",
                RECORD_COLUMNS
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params![since_us], row_to_record)?;
            rows.collect()
        })
        .await
    }

    async fn record_count(&self) -> Result<u64, LedgerError> {
        let count: i64 = self
            .with_conn(|conn| {
                conn.query_row("SELECT COUNT(*) FROM cost_records", [], |row| row.get(0))
            })
            .await?;
        Ok(count.max(0) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::tests::{at, exercise_ledger, record_at};
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn test_sqlite_ledger() {
        let temp = tempfile::tempdir().expect("tempdir");
        let ledger = SqliteCostLedger::new(temp.path().to_path_buf())
            .await
            .unwrap();
        exercise_ledger(&ledger).await;
    }

    #[tokio::test]
    async fn test_records_survive_restart() {
        let temp = tempfile::tempdir().expect("tempdir");
        let noon = at(2026, 5, 5, 12, 0, 0);

        let ledger = SqliteCostLedger::new(temp.path().to_path_buf())
            .await
            .unwrap();
        let written = ledger
            .append(record_at("bot1", "claude-sonnet-4", dec!(0.123456789), noon))
            .await
            .unwrap();
        drop(ledger);

        let reopened = SqliteCostLedger::new(temp.path().to_path_buf())
            .await
            .unwrap();
        let records = reopened.records(&RecordQuery::default()).await.unwrap();
        assert_eq!(records, vec![written]);
        assert_eq!(
            reopened
                .spend_since(Some("bot1"), at(2026, 5, 5, 0, 0, 0))
                .await
                .unwrap(),
            dec!(0.123456789)
        );
    }

    fn insert_raw(dir: &std::path::Path, id: &str, cost: &str, timestamp: DateTime<Utc>) {
        let conn = Connection::open(dir.join("costs.db")).unwrap();
        conn.execute(
            "INSERT INTO cost_records (id, agent_id, provider, model, cost_usd, ts_us)
             VALUES (?1, 'bot1', 'openai', 'gpt-4o', ?2, ?3)",
            params![id, cost, to_micros(timestamp)],
        )
        .unwrap();
    }

    #[tokio::test]
    async fn test_overflowing_rows_are_a_storage_error() {
        let temp = tempfile::tempdir().expect("tempdir");
        let noon = at(2026, 5, 5, 12, 0, 0);
        let ledger = SqliteCostLedger::new(temp.path().to_path_buf())
            .await
            .unwrap();
        insert_raw(temp.path(), "a", "50000000000000000000000000000", noon);
        insert_raw(temp.path(), "b", "50000000000000000000000000000", noon);

        let day = at(2026, 5, 5, 0, 0, 0);
        assert!(matches!(
            ledger.spend_since(None, day).await,
            Err(LedgerError::Storage(_))
        ));
        assert!(matches!(
            ledger.summary(noon).await,
            Err(LedgerError::Storage(_))
        ));
    }

    #[tokio::test]
    async fn test_unparsable_cost_is_a_storage_error() {
        let temp = tempfile::tempdir().expect("tempdir");
        let noon = at(2026, 5, 5, 12, 0, 0);
        let ledger = SqliteCostLedger::new(temp.path().to_path_buf())
            .await
            .unwrap();
        ledger
            .append(record_at("bot1", "gpt-4o", dec!(0.50), noon))
            .await
            .unwrap();
        insert_raw(temp.path(), "damaged", "twelve dollars", noon);

        let day = at(2026, 5, 5, 0, 0, 0);
        assert!(matches!(
            ledger.spend_since(Some("bot1"), day).await,
            Err(LedgerError::Storage(_))
        ));
        assert!(matches!(
            ledger.records(&RecordQuery::default()).await,
            Err(LedgerError::Storage(_))
        ));
    }
}
