//! In-memory cost ledger (non-persistent).

use super::{checked_total, CostLedger, CostRecord, LedgerError, NewCostRecord, RecordQuery};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Clone, Default)]
pub struct InMemoryCostLedger {
    records: Arc<RwLock<Vec<CostRecord>>>,
}

impl InMemoryCostLedger {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CostLedger for InMemoryCostLedger {
    async fn append(&self, record: NewCostRecord) -> Result<CostRecord, LedgerError> {
        let record = record.into_record()?;
        self.records.write().await.push(record.clone());
        Ok(record)
    }

    async fn spend_since(
        &self,
        agent_id: Option<&str>,
        since: DateTime<Utc>,
    ) -> Result<Decimal, LedgerError> {
        let records = self.records.read().await;
        checked_total(
            records
                .iter()
                .filter(|r| r.timestamp >= since)
                .filter(|r| agent_id.map_or(true, |id| r.agent_id == id))
                .map(|r| r.cost_usd),
        )
    }

    async fn records(&self, query: &RecordQuery) -> Result<Vec<CostRecord>, LedgerError> {
        let records = self.records.read().await;
        // Stable sort keeps append order among equal timestamps; reverse
        // afterwards so the latest append comes first.
        let mut matching: Vec<CostRecord> =
            records.iter().filter(|r| query.matches(r)).cloned().collect();
        matching.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
        matching.reverse();
        Ok(matching
            .into_iter()
            .skip(query.offset)
            .take(query.clamped_limit())
            .collect())
    }

    async fn records_since(&self, since: DateTime<Utc>) -> Result<Vec<CostRecord>, LedgerError> {
        let records = self.records.read().await;
        Ok(records
            .iter()
            .filter(|r| r.timestamp >= since)
            .cloned()
            .collect())
    }

    async fn record_count(&self) -> Result<u64, LedgerError> {
        Ok(self.records.read().await.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::tests::exercise_ledger;

    #[tokio::test]
    async fn test_in_memory_ledger() {
        let ledger = InMemoryCostLedger::new();
        exercise_ledger(&ledger).await;
    }
}
