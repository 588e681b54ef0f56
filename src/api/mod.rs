//! HTTP API for the budget guardian.
//!
//! ## Endpoints
//!
//! - `GET /api/health` - Health check
//! - `GET|PUT|DELETE /api/budget/global` - Wallet cap
//! - `GET /api/budget/agents` - List agent overrides
//! - `PUT|DELETE /api/budget/agents/:agent_id` - Set / remove an agent override
//! - `POST /api/budget/evaluate` - Evaluate caller-supplied spend figures
//! - `GET /api/budget/status` - Evaluate today's ledger spend (fail-open/closed applies)
//! - `GET /api/costs/summary` - Today's and all-time spend
//! - `GET|POST /api/costs/records` - List / append cost records
//! - `GET /api/pricing` - Model price table
//! - `POST /api/pricing/sync` - Refresh prices from the remote source

mod budget;
mod costs;
mod routes;

pub use routes::{app, serve, AppState};
