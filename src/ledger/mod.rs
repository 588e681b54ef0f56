//! Cost ledger: append-only per-request cost records.
//!
//! Supports:
//! - `memory`: In-memory storage (non-persistent, for testing)
//! - `sqlite`: SQLite database
//!
//! "Today" is the current UTC calendar day. A record stamped exactly at
//! midnight belongs to the day that starts at that instant.

mod memory;
mod sqlite;

pub use memory::InMemoryCostLedger;
pub use sqlite::SqliteCostLedger;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Default page size for record listings.
pub const DEFAULT_RECORD_LIMIT: usize = 100;
/// Largest page size accepted for record listings.
pub const MAX_RECORD_LIMIT: usize = 1000;
/// Largest cost accepted for a single record.
pub const MAX_RECORD_COST_USD: Decimal = dec!(1000000000);

#[derive(Debug, Clone, thiserror::Error)]
pub enum LedgerError {
    #[error("Invalid cost record: {0}")]
    InvalidRecord(String),

    #[error("Ledger storage error: {0}")]
    Storage(String),

    #[error("Ledger query timed out after {0:?}")]
    Timeout(Duration),
}

/// A stored cost record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CostRecord {
    pub id: Uuid,
    pub agent_id: String,
    pub provider: String,
    pub model: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost_usd: Decimal,
    pub timestamp: DateTime<Utc>,
}

/// A record to append. `timestamp` defaults to now.
#[derive(Debug, Clone, Deserialize)]
pub struct NewCostRecord {
    pub agent_id: String,
    pub provider: String,
    pub model: String,
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    pub cost_usd: Decimal,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
}

impl NewCostRecord {
    /// Validate and stamp the record.
    pub fn into_record(self) -> Result<CostRecord, LedgerError> {
        let agent_id = self.agent_id.trim().to_string();
        if agent_id.is_empty() {
            return Err(LedgerError::InvalidRecord(
                "agent_id must not be empty".to_string(),
            ));
        }
        if self.cost_usd < Decimal::ZERO {
            return Err(LedgerError::InvalidRecord(format!(
                "cost_usd must not be negative (got {})",
                self.cost_usd
            )));
        }
        if self.cost_usd > MAX_RECORD_COST_USD {
            return Err(LedgerError::InvalidRecord(format!(
                "cost_usd {} exceeds the per-record maximum of {}",
                self.cost_usd, MAX_RECORD_COST_USD
            )));
        }
        Ok(CostRecord {
            id: Uuid::new_v4(),
            agent_id,
            provider: self.provider.trim().to_string(),
            model: self.model.trim().to_string(),
            input_tokens: self.input_tokens,
            output_tokens: self.output_tokens,
            cost_usd: self.cost_usd,
            timestamp: self.timestamp.unwrap_or_else(Utc::now),
        })
    }
}

/// Filter and paging for record listings. Results are newest first.
#[derive(Debug, Clone)]
pub struct RecordQuery {
    pub agent_id: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub limit: usize,
    pub offset: usize,
}

impl Default for RecordQuery {
    fn default() -> Self {
        Self {
            agent_id: None,
            since: None,
            limit: DEFAULT_RECORD_LIMIT,
            offset: 0,
        }
    }
}

impl RecordQuery {
    pub fn clamped_limit(&self) -> usize {
        self.limit.clamp(1, MAX_RECORD_LIMIT)
    }

    pub fn matches(&self, record: &CostRecord) -> bool {
        self.agent_id
            .as_deref()
            .map_or(true, |id| record.agent_id == id)
            && self.since.map_or(true, |since| record.timestamp >= since)
    }
}

/// Spend grouped by one key (agent or model).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpendBreakdown {
    pub key: String,
    pub cost_usd: Decimal,
    pub requests: u64,
}

/// Dashboard summary of the ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CostSummary {
    pub day_start: DateTime<Utc>,
    pub today_usd: Decimal,
    pub today_requests: u64,
    pub total_usd: Decimal,
    pub record_count: u64,
    pub by_agent_today: Vec<SpendBreakdown>,
    pub by_model_today: Vec<SpendBreakdown>,
}

/// Most recent UTC midnight at or before `t`.
pub fn utc_day_start(t: DateTime<Utc>) -> DateTime<Utc> {
    t.date_naive()
        .and_hms_opt(0, 0, 0)
        .map(|midnight| Utc.from_utc_datetime(&midnight))
        .unwrap_or(t)
}

/// Sum costs, failing instead of overflowing.
pub fn checked_total<I>(costs: I) -> Result<Decimal, LedgerError>
where
    I: IntoIterator<Item = Decimal>,
{
    costs.into_iter().try_fold(Decimal::ZERO, |total, cost| {
        total
            .checked_add(cost)
            .ok_or_else(|| LedgerError::Storage("spend total overflows".to_string()))
    })
}

/// Group records by `key`, most expensive first.
fn breakdown<F>(records: &[CostRecord], key: F) -> Result<Vec<SpendBreakdown>, LedgerError>
where
    F: Fn(&CostRecord) -> &str,
{
    let mut groups: HashMap<&str, (Decimal, u64)> = HashMap::new();
    for record in records {
        let entry = groups.entry(key(record)).or_insert((Decimal::ZERO, 0));
        entry.0 = checked_total([entry.0, record.cost_usd])?;
        entry.1 += 1;
    }
    let mut out: Vec<SpendBreakdown> = groups
        .into_iter()
        .map(|(key, (cost_usd, requests))| SpendBreakdown {
            key: key.to_string(),
            cost_usd,
            requests,
        })
        .collect();
    out.sort_by(|a, b| b.cost_usd.cmp(&a.cost_usd).then_with(|| a.key.cmp(&b.key)));
    Ok(out)
}

/// Cost ledger trait - implemented by all storage backends.
#[async_trait]
pub trait CostLedger: Send + Sync {
    /// Append a record. Records are never modified afterwards.
    async fn append(&self, record: NewCostRecord) -> Result<CostRecord, LedgerError>;

    /// Sum of `cost_usd` for records at or after `since`. `None` = all agents.
    async fn spend_since(
        &self,
        agent_id: Option<&str>,
        since: DateTime<Utc>,
    ) -> Result<Decimal, LedgerError>;

    /// Records matching `query`, newest first.
    async fn records(&self, query: &RecordQuery) -> Result<Vec<CostRecord>, LedgerError>;

    /// Every record at or after `since`, in any order.
    async fn records_since(&self, since: DateTime<Utc>) -> Result<Vec<CostRecord>, LedgerError>;

    /// Total number of records.
    async fn record_count(&self) -> Result<u64, LedgerError>;

    /// Spend since the most recent UTC midnight.
    async fn today_spend(&self, agent_id: Option<&str>) -> Result<Decimal, LedgerError> {
        self.spend_since(agent_id, utc_day_start(Utc::now())).await
    }

    async fn summary(&self, now: DateTime<Utc>) -> Result<CostSummary, LedgerError> {
        let day_start = utc_day_start(now);
        let today = self.records_since(day_start).await?;
        let total_usd = self.spend_since(None, DateTime::<Utc>::MIN_UTC).await?;
        let record_count = self.record_count().await?;

        Ok(CostSummary {
            day_start,
            today_usd: checked_total(today.iter().map(|r| r.cost_usd))?,
            today_requests: today.len() as u64,
            total_usd,
            record_count,
            by_agent_today: breakdown(&today, |r| r.agent_id.as_str())?,
            by_model_today: breakdown(&today, |r| r.model.as_str())?,
        })
    }
}

/// Ledger type selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CostLedgerType {
    Memory,
    #[default]
    Sqlite,
}

impl CostLedgerType {
    /// Parse from environment variable value.
    pub fn from_str(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "memory" => Self::Memory,
            "sqlite" | "db" => Self::Sqlite,
            _ => Self::default(),
        }
    }
}

/// Create a cost ledger based on type and data directory.
pub async fn create_cost_ledger(
    ledger_type: CostLedgerType,
    base_dir: PathBuf,
) -> Result<Arc<dyn CostLedger>, LedgerError> {
    match ledger_type {
        CostLedgerType::Memory => Ok(Arc::new(InMemoryCostLedger::new())),
        CostLedgerType::Sqlite => Ok(Arc::new(SqliteCostLedger::new(base_dir).await?)),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    pub(crate) fn at(y: i32, m: u32, d: u32, h: u32, min: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, min, s).unwrap()
    }

    pub(crate) fn record_at(
        agent_id: &str,
        model: &str,
        cost: Decimal,
        timestamp: DateTime<Utc>,
    ) -> NewCostRecord {
        NewCostRecord {
            agent_id: agent_id.to_string(),
            provider: "openai".to_string(),
            model: model.to_string(),
            input_tokens: 100,
            output_tokens: 10,
            cost_usd: cost,
            timestamp: Some(timestamp),
        }
    }

    /// Behavior every backend must share.
    pub(crate) async fn exercise_ledger(ledger: &dyn CostLedger) {
        let yesterday_late = at(2026, 3, 1, 23, 59, 59);
        let midnight = at(2026, 3, 2, 0, 0, 0);
        let noon = at(2026, 3, 2, 12, 0, 0);

        ledger
            .append(record_at("bot1", "gpt-4o", dec!(1.50), yesterday_late))
            .await
            .unwrap();
        ledger
            .append(record_at("bot1", "gpt-4o", dec!(0.25), midnight))
            .await
            .unwrap();
        ledger
            .append(record_at("bot2", "gpt-4o-mini", dec!(0.10), noon))
            .await
            .unwrap();
        ledger
            .append(record_at("bot1", "gpt-4o-mini", dec!(0.05), noon))
            .await
            .unwrap();

        // Yesterday's spend is excluded; midnight is inclusive.
        let day = utc_day_start(noon);
        assert_eq!(day, midnight);
        assert_eq!(ledger.spend_since(None, day).await.unwrap(), dec!(0.40));
        assert_eq!(
            ledger.spend_since(Some("bot1"), day).await.unwrap(),
            dec!(0.30)
        );
        assert_eq!(
            ledger.spend_since(Some("nobody"), day).await.unwrap(),
            Decimal::ZERO
        );

        let summary = ledger.summary(noon).await.unwrap();
        assert_eq!(summary.day_start, midnight);
        assert_eq!(summary.today_usd, dec!(0.40));
        assert_eq!(summary.today_requests, 3);
        assert_eq!(summary.total_usd, dec!(1.90));
        assert_eq!(summary.record_count, 4);
        assert_eq!(summary.by_agent_today[0].key, "bot1");
        assert_eq!(summary.by_agent_today[0].cost_usd, dec!(0.30));
        assert_eq!(summary.by_agent_today[0].requests, 2);
        assert_eq!(summary.by_model_today[0].key, "gpt-4o");
        assert_eq!(summary.by_model_today[1].cost_usd, dec!(0.15));

        let newest = ledger
            .records(&RecordQuery {
                limit: 2,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(newest.len(), 2);
        assert!(newest.iter().all(|r| r.timestamp == noon));

        let bot1 = ledger
            .records(&RecordQuery {
                agent_id: Some("bot1".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(bot1.len(), 3);
        assert_eq!(bot1.last().unwrap().timestamp, yesterday_late);

        let page = ledger
            .records(&RecordQuery {
                offset: 3,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].cost_usd, dec!(1.50));

        let rejected = ledger
            .append(record_at("bot1", "gpt-4o", dec!(-1), noon))
            .await;
        assert!(matches!(rejected, Err(LedgerError::InvalidRecord(_))));
        let rejected = ledger
            .append(record_at("  ", "gpt-4o", dec!(1), noon))
            .await;
        assert!(matches!(rejected, Err(LedgerError::InvalidRecord(_))));
        let rejected = ledger
            .append(record_at("bot1", "gpt-4o", dec!(50000000000000000000000000000), noon))
            .await;
        assert!(matches!(rejected, Err(LedgerError::InvalidRecord(_))));
        ledger
            .append(record_at("bot3", "gpt-4o", MAX_RECORD_COST_USD, yesterday_late))
            .await
            .unwrap();
        assert_eq!(ledger.record_count().await.unwrap(), 5);
    }

    #[test]
    fn test_utc_day_start() {
        assert_eq!(
            utc_day_start(at(2026, 10, 19, 23, 59, 59)),
            at(2026, 10, 19, 0, 0, 0)
        );
        assert_eq!(
            utc_day_start(at(2026, 10, 20, 0, 0, 0)),
            at(2026, 10, 20, 0, 0, 0)
        );
    }

    #[test]
    fn test_utc_day_start_ignores_local_offset() {
        let tokyo = chrono::FixedOffset::east_opt(9 * 3600).unwrap();
        // 08:00 in Tokyo on the 20th is still the 19th in UTC.
        let t = tokyo
            .with_ymd_and_hms(2026, 10, 20, 8, 0, 0)
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(utc_day_start(t), at(2026, 10, 19, 0, 0, 0));
    }

    #[test]
    fn test_record_query_limits() {
        let q = RecordQuery {
            limit: 0,
            ..Default::default()
        };
        assert_eq!(q.clamped_limit(), 1);
        let q = RecordQuery {
            limit: 50_000,
            ..Default::default()
        };
        assert_eq!(q.clamped_limit(), MAX_RECORD_LIMIT);
    }

    #[test]
    fn test_checked_total_reports_overflow() {
        assert_eq!(
            checked_total([dec!(1.25), dec!(2.75)]).unwrap(),
            dec!(4)
        );
        assert_eq!(checked_total(Vec::new()).unwrap(), Decimal::ZERO);
        let huge = dec!(50000000000000000000000000000);
        assert!(matches!(
            checked_total([huge, huge]),
            Err(LedgerError::Storage(_))
        ));
    }

    #[test]
    fn test_ledger_type_parsing() {
        assert_eq!(CostLedgerType::from_str("memory"), CostLedgerType::Memory);
        assert_eq!(CostLedgerType::from_str("other"), CostLedgerType::Sqlite);
    }
}
