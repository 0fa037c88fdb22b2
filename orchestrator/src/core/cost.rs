//! Provider pricing and spend limits.
//!
//! Costs are USD per 1K tokens. The ledger is checked before every provider
//! call; a breach surfaces as [`LimitExceeded`], which callers recover with
//! `err.downcast_ref::<LimitExceeded>()`.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Spend guard tripped. Dispatch stops; work-item state is left untouched.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum LimitExceeded {
    #[error("cost ceiling reached: ${spent_usd:.4} >= ${limit_usd:.2}")]
    CostCeiling { limit_usd: f64, spent_usd: f64 },

    #[error("provider call limit reached: {calls} >= {limit}")]
    CallLimit { limit: u64, calls: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Price {
    pub input_per_1k: f64,
    pub output_per_1k: f64,
}

impl Price {
    pub const fn new(input_per_1k: f64, output_per_1k: f64) -> Self {
        Self {
            input_per_1k,
            output_per_1k,
        }
    }

    pub fn cost(&self, input_tokens: u64, output_tokens: u64) -> f64 {
        (input_tokens as f64 / 1000.0) * self.input_per_1k
            + (output_tokens as f64 / 1000.0) * self.output_per_1k
    }
}

const ZERO: Price = Price::new(0.0, 0.0);

/// Built-in rates for well-known provider ids; unknown ids are free.
pub fn default_price(provider_id: &str) -> Price {
    match provider_id {
        "anthropic" | "claude" => Price::new(0.003, 0.015),
        "deepseek" => Price::new(0.001, 0.001),
        "openai" | "gpt" => Price::new(0.005, 0.015),
        _ => ZERO,
    }
}

/// Rough token count for providers that do not report usage.
pub fn estimate_tokens(text: &str) -> u64 {
    (text.chars().count() as u64).div_ceil(4)
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Limits {
    pub max_cost_usd: f64,
    pub max_calls: u64,
}

/// Running spend for one dispatcher.
#[derive(Debug, Clone, PartialEq)]
pub struct Ledger {
    limits: Limits,
    spent_usd: f64,
    calls: u64,
}

impl Ledger {
    pub fn new(limits: Limits) -> Self {
        Self {
            limits,
            spent_usd: 0.0,
            calls: 0,
        }
    }

    pub fn spent_usd(&self) -> f64 {
        self.spent_usd
    }

    pub fn calls(&self) -> u64 {
        self.calls
    }

    /// Fails if `planned` more calls would go past either limit.
    pub fn check(&self, planned: u64) -> Result<(), LimitExceeded> {
        if self.spent_usd >= self.limits.max_cost_usd {
            return Err(LimitExceeded::CostCeiling {
                limit_usd: self.limits.max_cost_usd,
                spent_usd: self.spent_usd,
            });
        }
        if self.calls + planned > self.limits.max_calls {
            return Err(LimitExceeded::CallLimit {
                limit: self.limits.max_calls,
                calls: self.calls + planned,
            });
        }
        Ok(())
    }

    pub fn record_call(&mut self, cost: f64) {
        self.calls += 1;
        self.spent_usd += cost.max(0.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn price_is_per_thousand_tokens() {
        let price = default_price("anthropic");
        let cost = price.cost(1000, 2000);
        assert!((cost - (0.003 + 0.030)).abs() < 1e-12);
        assert_eq!(default_price("local"), ZERO);
    }

    #[test]
    fn token_estimate_rounds_up() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("abcde"), 2);
    }

    #[test]
    fn ledger_trips_cost_ceiling() {
        let mut ledger = Ledger::new(Limits {
            max_cost_usd: 1.0,
            max_calls: 100,
        });
        ledger.check(1).expect("under limit");
        ledger.record_call(1.5);
        let err = ledger.check(1).expect_err("over limit");
        assert!(matches!(err, LimitExceeded::CostCeiling { .. }));
    }

    #[test]
    fn ledger_counts_planned_calls() {
        let mut ledger = Ledger::new(Limits {
            max_cost_usd: 10.0,
            max_calls: 3,
        });
        ledger.record_call(0.0);
        ledger.check(2).expect("exactly at limit");
        let err = ledger.check(3).expect_err("past limit");
        assert_eq!(err, LimitExceeded::CallLimit { limit: 3, calls: 4 });
    }
}
