//! Model pricing and cost calculation from token usage.
//!
//! Ships with built-in prices for common models and can refresh them from
//! an OpenRouter-compatible `/models` endpoint. Prices are USD per million
//! tokens, held as exact decimals.

use std::collections::HashMap;
use std::sync::Arc;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

/// Default source for [`PricingTable::sync`].
pub const DEFAULT_PRICING_URL: &str = "https://openrouter.ai/api/v1/models";

const PER_MILLION: Decimal = dec!(1000000);

/// Price of one model, USD per million tokens.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelPrice {
    pub model: String,
    pub input_per_million: Decimal,
    pub output_per_million: Decimal,
    /// Cache creation input tokens; falls back to the input price.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_write_per_million: Option<Decimal>,
    /// Cache read input tokens; falls back to the input price.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_read_per_million: Option<Decimal>,
}

/// Token usage reported by a provider for one request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TokenUsage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub cache_creation_input_tokens: Option<u64>,
    #[serde(default)]
    pub cache_read_input_tokens: Option<u64>,
}

impl TokenUsage {
    /// Check if there's any usage to compute cost from.
    pub fn has_usage(&self) -> bool {
        self.input_tokens > 0 || self.output_tokens > 0
    }
}

impl ModelPrice {
    fn new(
        model: &str,
        input: Decimal,
        output: Decimal,
        cache_write: Option<Decimal>,
        cache_read: Option<Decimal>,
    ) -> Self {
        Self {
            model: model.to_string(),
            input_per_million: input,
            output_per_million: output,
            cache_write_per_million: cache_write,
            cache_read_per_million: cache_read,
        }
    }

    /// Cost of `usage` in USD, or `None` if it does not fit in a `Decimal`.
    /// Cache tokens are counted inside `input_tokens` and billed at their
    /// own rates.
    pub fn cost(&self, usage: &TokenUsage) -> Option<Decimal> {
        let cache_create = usage.cache_creation_input_tokens.unwrap_or(0);
        let cache_read = usage.cache_read_input_tokens.unwrap_or(0);
        let regular_input = usage
            .input_tokens
            .saturating_sub(cache_create.saturating_add(cache_read));

        let parts = [
            (regular_input, self.input_per_million),
            (usage.output_tokens, self.output_per_million),
            (
                cache_create,
                self.cache_write_per_million.unwrap_or(self.input_per_million),
            ),
            (
                cache_read,
                self.cache_read_per_million.unwrap_or(self.input_per_million),
            ),
        ];
        let total = parts
            .iter()
            .filter(|(tokens, _)| *tokens > 0)
            .try_fold(Decimal::ZERO, |total, (tokens, rate)| {
                Decimal::from(*tokens)
                    .checked_mul(*rate)
                    .and_then(|part| total.checked_add(part))
            })?;
        Some((total / PER_MILLION).normalize())
    }
}

/// Normalize model names to canonical form for pricing lookup.
///
/// Strips any `provider/` prefix and maps dated or dotted variants onto a
/// base name.
pub fn normalize_model(model: &str) -> String {
    let lowered = model.trim().to_lowercase();
    let name = lowered.rsplit('/').next().unwrap_or(&lowered);

    let base = match name {
        // Claude
        s if s.contains("claude-3-5-sonnet") || s.contains("claude-3.5-sonnet") => {
            "claude-3-5-sonnet"
        }
        s if s.contains("claude-3-7-sonnet") || s.contains("claude-3.7-sonnet") => {
            "claude-3-7-sonnet"
        }
        s if s.contains("claude-sonnet-4") || s.contains("claude-4-sonnet") => "claude-sonnet-4",
        s if s.contains("claude-3-5-haiku") || s.contains("claude-3.5-haiku") => "claude-3-5-haiku",
        s if s.contains("claude-haiku-4") => "claude-haiku-4",
        s if s.contains("claude-3-opus") => "claude-3-opus",
        s if s.contains("claude-opus-4") || s.contains("claude-4-opus") => "claude-opus-4",

        // GPT
        s if s.contains("gpt-4o-mini") => "gpt-4o-mini",
        s if s.contains("gpt-4o") => "gpt-4o",
        s if s.contains("gpt-4-turbo") => "gpt-4-turbo",
        s if s.contains("gpt-4.1-mini") => "gpt-4.1-mini",
        s if s.contains("gpt-4.1") => "gpt-4.1",
        s if s.starts_with("gpt-4") => "gpt-4",
        s if s.contains("gpt-5") => "gpt-5",
        s if s.starts_with("o4-mini") => "o4-mini",
        s if s.starts_with("o3") => "o3",

        // Gemini
        s if s.contains("gemini-2.5-pro") || s.contains("gemini-2-5-pro") => "gemini-2.5-pro",
        s if s.contains("gemini-2.5-flash") || s.contains("gemini-2-5-flash") => "gemini-2.5-flash",
        s if s.contains("gemini-2.0-flash") || s.contains("gemini-2-0-flash") => "gemini-2.0-flash",
        s if s.contains("gemini-1.5-pro") || s.contains("gemini-1-5-pro") => "gemini-1.5-pro",
        s if s.contains("gemini-1.5-flash") || s.contains("gemini-1-5-flash") => "gemini-1.5-flash",

        s => s,
    };
    base.to_string()
}

/// Built-in prices, USD per 1M tokens.
fn builtin_prices() -> Vec<ModelPrice> {
    vec![
        ModelPrice::new("claude-3-5-sonnet", dec!(3), dec!(15), Some(dec!(3.75)), Some(dec!(0.30))),
        ModelPrice::new("claude-3-7-sonnet", dec!(3), dec!(15), Some(dec!(3.75)), Some(dec!(0.30))),
        ModelPrice::new("claude-sonnet-4", dec!(3), dec!(15), Some(dec!(3.75)), Some(dec!(0.30))),
        ModelPrice::new("claude-3-5-haiku", dec!(0.80), dec!(4), Some(dec!(1)), Some(dec!(0.08))),
        ModelPrice::new("claude-haiku-4", dec!(1), dec!(5), Some(dec!(1.25)), Some(dec!(0.10))),
        ModelPrice::new("claude-3-opus", dec!(15), dec!(75), Some(dec!(18.75)), Some(dec!(1.50))),
        ModelPrice::new("claude-opus-4", dec!(15), dec!(75), Some(dec!(18.75)), Some(dec!(1.50))),
        ModelPrice::new("gpt-4o", dec!(2.50), dec!(10), None, Some(dec!(1.25))),
        ModelPrice::new("gpt-4o-mini", dec!(0.15), dec!(0.60), None, Some(dec!(0.075))),
        ModelPrice::new("gpt-4-turbo", dec!(10), dec!(30), None, None),
        ModelPrice::new("gpt-4", dec!(30), dec!(60), None, None),
        ModelPrice::new("gpt-4.1", dec!(2), dec!(8), None, Some(dec!(0.50))),
        ModelPrice::new("gpt-4.1-mini", dec!(0.40), dec!(1.60), None, Some(dec!(0.10))),
        ModelPrice::new("gpt-5", dec!(1.25), dec!(10), None, Some(dec!(0.125))),
        ModelPrice::new("o3", dec!(2), dec!(8), None, Some(dec!(0.50))),
        ModelPrice::new("o4-mini", dec!(1.10), dec!(4.40), None, Some(dec!(0.275))),
        ModelPrice::new("gemini-2.5-pro", dec!(1.25), dec!(10), None, None),
        ModelPrice::new("gemini-2.5-flash", dec!(0.30), dec!(2.50), None, None),
        ModelPrice::new("gemini-2.0-flash", dec!(0.10), dec!(0.40), None, None),
        ModelPrice::new("gemini-1.5-pro", dec!(1.25), dec!(5), None, None),
        ModelPrice::new("gemini-1.5-flash", dec!(0.075), dec!(0.30), None, None),
    ]
}

/// Pricing-related errors.
#[derive(Debug, thiserror::Error)]
pub enum PricingError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("API error: {0}")]
    Api(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("No price known for model '{0}'")]
    UnknownModel(String),

    #[error("Cost of {0} usage is too large to represent")]
    Overflow(String),
}

/// Model → price lookup with built-in defaults and remote refresh.
pub struct PricingTable {
    entries: RwLock<HashMap<String, ModelPrice>>,
    client: reqwest::Client,
    source_url: String,
}

impl PricingTable {
    /// Table seeded with the built-in prices.
    pub fn new(source_url: impl Into<String>) -> Self {
        Self::with_prices(builtin_prices(), source_url)
    }

    /// Table with exactly `prices` (for testing or offline use).
    pub fn with_prices(prices: Vec<ModelPrice>, source_url: impl Into<String>) -> Self {
        let entries = prices
            .into_iter()
            .map(|p| (p.model.to_lowercase(), p))
            .collect();
        Self {
            entries: RwLock::new(entries),
            client: reqwest::Client::new(),
            source_url: source_url.into(),
        }
    }

    /// Exact (case-insensitive) id first, then the normalized base name.
    pub async fn price_for(&self, model: &str) -> Option<ModelPrice> {
        let entries = self.entries.read().await;
        entries
            .get(&model.trim().to_lowercase())
            .or_else(|| entries.get(&normalize_model(model)))
            .cloned()
    }

    /// Cost of `usage` on `model`.
    pub async fn cost_for(&self, model: &str, usage: &TokenUsage) -> Result<Decimal, PricingError> {
        if !usage.has_usage() {
            return Ok(Decimal::ZERO);
        }
        match self.price_for(model).await {
            Some(price) => price.cost(usage).ok_or_else(|| {
                tracing::warn!(model = %model, "Cost calculation overflowed");
                PricingError::Overflow(model.to_string())
            }),
            None => {
                tracing::warn!(model = %model, "Unknown model for cost calculation");
                Err(PricingError::UnknownModel(model.to_string()))
            }
        }
    }

    /// All entries sorted by model id.
    pub async fn list(&self) -> Vec<ModelPrice> {
        let mut prices: Vec<ModelPrice> = self.entries.read().await.values().cloned().collect();
        prices.sort_by(|a, b| a.model.cmp(&b.model));
        prices
    }

    /// Insert or replace entries. Each entry is also stored under its
    /// normalized name so aliases pick up the fresh price.
    pub async fn upsert(&self, prices: Vec<ModelPrice>) -> usize {
        let mut entries = self.entries.write().await;
        let count = prices.len();
        for price in prices {
            let key = price.model.to_lowercase();
            let base = normalize_model(&price.model);
            if base != key {
                entries.insert(
                    base.clone(),
                    ModelPrice {
                        model: base,
                        ..price.clone()
                    },
                );
            }
            entries.insert(key, price);
        }
        count
    }

    /// Refresh prices from the configured source.
    ///
    /// On failure the current table is left untouched.
    pub async fn sync(&self) -> Result<usize, PricingError> {
        let response = self
            .client
            .get(&self.source_url)
            .send()
            .await
            .map_err(|e| PricingError::Network(e.to_string()))?;

        if !response.status().is_success() {
            return Err(PricingError::Api(format!("Status: {}", response.status())));
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| PricingError::Network(e.to_string()))?;
        let prices = parse_models_response(&body)?;
        let count = self.upsert(prices).await;
        tracing::info!(count, source = %self.source_url, "Synced model pricing");
        Ok(count)
    }
}

/// Shared pricing table.
pub type SharedPricingTable = Arc<PricingTable>;

#[derive(Debug, Deserialize)]
struct ModelsResponse {
    data: Vec<RemoteModel>,
}

#[derive(Debug, Deserialize)]
struct RemoteModel {
    id: String,
    pricing: RemotePricing,
}

/// Per-token prices as decimal strings.
#[derive(Debug, Deserialize)]
struct RemotePricing {
    prompt: String,
    completion: String,
    #[serde(default)]
    input_cache_write: Option<String>,
    #[serde(default)]
    input_cache_read: Option<String>,
}

fn per_token_to_per_million(value: &str) -> Option<Decimal> {
    value
        .trim()
        .parse::<Decimal>()
        .ok()
        .filter(|d| *d >= Decimal::ZERO)
        .and_then(|d| d.checked_mul(PER_MILLION))
        .map(|d| d.normalize())
}

/// Parse an OpenRouter-style `/models` body. Models with unparsable,
/// negative (dynamic) or unrepresentably large prices are skipped.
pub fn parse_models_response(body: &[u8]) -> Result<Vec<ModelPrice>, PricingError> {
    let response: ModelsResponse =
        serde_json::from_slice(body).map_err(|e| PricingError::Parse(e.to_string()))?;

    Ok(response
        .data
        .into_iter()
        .filter_map(|m| {
            let input = per_token_to_per_million(&m.pricing.prompt)?;
            let output = per_token_to_per_million(&m.pricing.completion)?;
            Some(ModelPrice {
                model: m.id,
                input_per_million: input,
                output_per_million: output,
                cache_write_per_million: m
                    .pricing
                    .input_cache_write
                    .as_deref()
                    .and_then(per_token_to_per_million),
                cache_read_per_million: m
                    .pricing
                    .input_cache_read
                    .as_deref()
                    .and_then(per_token_to_per_million),
            })
        })
        .collect())
}
