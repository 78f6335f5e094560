//! Per-model cost estimation.

use std::collections::HashMap;

use monitor_core::config::{ModelPrice, PricingConfig};
use monitor_core::TokenCounts;
use serde::{Deserialize, Serialize};

/// Estimated spend for one model.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct CostBreakdown {
    pub input_cost: f64,
    pub output_cost: f64,
    pub total_cost: f64,
}

impl CostBreakdown {
    pub fn from_tokens(tokens: &TokenCounts, price: &ModelPrice) -> Self {
        let input_cost = tokens.prompt as f64 * price.input;
        let output_cost = tokens.completion as f64 * price.output;
        Self {
            input_cost,
            output_cost,
            total_cost: input_cost + output_cost,
        }
    }
}

/// Unit prices keyed by model identifier, with a fallback tier.
#[derive(Debug, Clone)]
pub struct PricingTable {
    prices: HashMap<String, ModelPrice>,
    default: ModelPrice,
}

impl PricingTable {
    pub fn new(default: ModelPrice) -> Self {
        Self {
            prices: HashMap::new(),
            default,
        }
    }

    pub fn from_config(config: &PricingConfig) -> Self {
        Self {
            prices: config
                .models
                .iter()
                .map(|(name, price)| (name.clone(), *price))
                .collect(),
            default: config.default,
        }
    }

    pub fn with_model(mut self, model: impl Into<String>, price: ModelPrice) -> Self {
        self.prices.insert(model.into(), price);
        self
    }

    /// Price for `model`, or the fallback tier.
    pub fn price_for(&self, model: &str) -> &ModelPrice {
        self.prices.get(model).unwrap_or(&self.default)
    }

    pub fn estimate(&self, model: &str, tokens: &TokenCounts) -> CostBreakdown {
        CostBreakdown::from_tokens(tokens, self.price_for(model))
    }
}

impl Default for PricingTable {
    fn default() -> Self {
        Self::from_config(&PricingConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_model_cost() {
        let table = PricingTable::default();
        let cost = table.estimate("gpt-4", &TokenCounts::new(1000, 500, None));
        assert!((cost.input_cost - 0.03).abs() < 1e-12);
        assert!((cost.output_cost - 0.03).abs() < 1e-12);
        assert!((cost.total_cost - 0.06).abs() < 1e-12);
    }

    #[test]
    fn test_unknown_model_uses_default_tier() {
        let table = PricingTable::default();
        assert_eq!(table.price_for("unknown"), table.price_for("some-new-model"));
        let cost = table.estimate("unknown", &TokenCounts::new(1_000_000, 0, None));
        assert!((cost.total_cost - 5.0).abs() < 1e-9);
    }

    #[test]
    fn test_custom_table() {
        let table = PricingTable::new(ModelPrice {
            input: 0.0,
            output: 0.0,
        })
        .with_model("local", ModelPrice {
            input: 1.0,
            output: 2.0,
        });
        let cost = table.estimate("local", &TokenCounts::new(3, 4, None));
        assert_eq!(cost.total_cost, 11.0);
        assert_eq!(table.estimate("other", &TokenCounts::new(3, 4, None)).total_cost, 0.0);
    }
}
