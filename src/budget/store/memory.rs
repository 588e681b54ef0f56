//! In-memory budget store (non-persistent).

use super::{BudgetChange, BudgetError, BudgetStore, ConfigCell};
use crate::budget::types::BudgetConfig;
use async_trait::async_trait;

#[derive(Debug, Default)]
pub struct InMemoryBudgetStore {
    cell: ConfigCell,
}

impl InMemoryBudgetStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BudgetStore for InMemoryBudgetStore {
    fn is_persistent(&self) -> bool {
        false
    }

    fn cell(&self) -> &ConfigCell {
        &self.cell
    }

    async fn persist(
        &self,
        _change: &BudgetChange,
        _config: &BudgetConfig,
    ) -> Result<(), BudgetError> {
        Ok(())
    }
}
