//! # Budget Guardian
//!
//! Daily spend budgets for LLM agents.
//!
//! This library provides:
//! - A wallet-wide daily cap plus per-agent overrides, each with a
//!   warn or block action
//! - A guardian that turns today's spend into Allow / Warn / Block
//! - A cost ledger recording the price of every completed request
//! - A model pricing table used to price requests from token counts
//! - An HTTP API over all of the above
//!
//! ## Request Flow
//! 1. Caller asks `/api/budget/status` (or calls [`budget::Guardian::admit`])
//! 2. Guardian reads today's UTC spend from the ledger
//! 3. Global and agent budgets are evaluated; the most severe decision wins
//! 4. After the request completes, its cost is appended to the ledger
//!
//! ## Modules
//! - `budget`: budget types, stores and the guardian
//! - `ledger`: cost records and spend queries
//! - `pricing`: per-model token prices
//! - `api`: axum routes

pub mod api;
pub mod budget;
pub mod config;
pub mod ledger;
pub mod pricing;

pub use budget::{BudgetAction, BudgetStore, Decision, Guardian};
pub use config::Config;
pub use ledger::{CostLedger, CostRecord};
pub use pricing::PricingTable;
