/// Usage accounting: converts token counts into a cost figure and keeps
/// per-task running totals.
///
/// Prices are USD per 1M tokens. Cache columns are optional because many
/// endpoints (and local models) don't bill them.
use serde::{Deserialize, Serialize};

use crate::client::Usage;

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ModelPrices {
    /// USD per 1M input tokens
    pub input: f64,
    /// USD per 1M output tokens
    pub output: f64,
    pub cache_writes: Option<f64>,
    pub cache_reads: Option<f64>,
}

impl ModelPrices {
    /// Cost of one response in USD.
    pub fn cost(&self, usage: &Usage) -> f64 {
        let mut total = (self.input / 1_000_000.0) * usage.input_tokens as f64
            + (self.output / 1_000_000.0) * usage.output_tokens as f64;
        if let (Some(price), Some(tokens)) = (self.cache_writes, usage.cache_write_tokens) {
            total += (price / 1_000_000.0) * tokens as f64;
        }
        if let (Some(price), Some(tokens)) = (self.cache_reads, usage.cache_read_tokens) {
            total += (price / 1_000_000.0) * tokens as f64;
        }
        total
    }
}

// ── Running totals ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct UsageTotals {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_write_tokens: u64,
    pub cache_read_tokens: u64,
    pub cost: f64,
}

impl UsageTotals {
    pub fn add(&mut self, usage: &Usage, prices: &ModelPrices) -> f64 {
        let cost = prices.cost(usage);
        self.input_tokens += usage.input_tokens;
        self.output_tokens += usage.output_tokens;
        self.cache_write_tokens += usage.cache_write_tokens.unwrap_or(0);
        self.cache_read_tokens += usage.cache_read_tokens.unwrap_or(0);
        self.cost += cost;
        cost
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_prices() -> ModelPrices {
        ModelPrices {
            input: 3.0,
            output: 15.0,
            cache_writes: Some(3.75),
            cache_reads: Some(0.3),
        }
    }

    #[test]
    fn cost_covers_all_four_columns() {
        let usage = Usage {
            input_tokens: 1_000_000,
            output_tokens: 1_000_000,
            cache_write_tokens: Some(1_000_000),
            cache_read_tokens: Some(1_000_000),
        };
        let cost = sample_prices().cost(&usage);
        assert!((cost - 22.05).abs() < 1e-9);
    }

    #[test]
    fn missing_cache_prices_cost_nothing() {
        let prices = ModelPrices { input: 3.0, output: 15.0, ..Default::default() };
        let usage = Usage {
            input_tokens: 1000,
            output_tokens: 0,
            cache_write_tokens: Some(999_999),
            cache_read_tokens: None,
        };
        let cost = prices.cost(&usage);
        assert!((cost - 0.003).abs() < 1e-9);
    }

    #[test]
    fn totals_accumulate() {
        let prices = sample_prices();
        let mut totals = UsageTotals::default();
        let usage = Usage {
            input_tokens: 100,
            output_tokens: 50,
            cache_write_tokens: None,
            cache_read_tokens: Some(10),
        };
        totals.add(&usage, &prices);
        totals.add(&usage, &prices);
        assert_eq!(totals.input_tokens, 200);
        assert_eq!(totals.output_tokens, 100);
        assert_eq!(totals.cache_read_tokens, 20);
        assert!(totals.cost > 0.0);
    }
}
