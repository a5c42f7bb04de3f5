use std::{iter::Sum, ops::Add, sync::Arc};

use rust_decimal::Decimal;
use serde::Serialize;
use tollway_core::TokenUsage;

use crate::{ModelPricing, PricingResolver, format_cost};

const TOKENS_PER_UNIT: u64 = 1_000_000;

/// Dollar cost per token category
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CostBreakdown {
    pub input: Decimal,
    pub output: Decimal,
    pub cache_write: Decimal,
    pub cache_read: Decimal,
    pub total: Decimal,
}

impl CostBreakdown {
    pub fn formatted_total(&self) -> String {
        format_cost(self.total)
    }
}

impl Add for CostBreakdown {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        Self {
            input: self.input + rhs.input,
            output: self.output + rhs.output,
            cache_write: self.cache_write + rhs.cache_write,
            cache_read: self.cache_read + rhs.cache_read,
            total: self.total + rhs.total,
        }
    }
}

impl Sum for CostBreakdown {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(Self::default(), Add::add)
    }
}

/// What the cache-read tokens saved compared to paying the input rate
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheSavings {
    /// Cost of the cache-read tokens at the input price
    pub normal_cost: Decimal,
    /// Cost of the cache-read tokens at the cache-read price
    pub cache_cost: Decimal,
    pub savings: Decimal,
    /// Share of `normal_cost` saved, 0 to 100
    pub percentage: Decimal,
}

/// Result of costing one request
#[derive(Debug, Clone, Serialize)]
pub struct CostReport {
    pub model: String,
    pub usage: TokenUsage,
    pub pricing: ModelPricing,
    pub cost: CostBreakdown,
    pub savings: CacheSavings,
}

fn priced(tokens: u64, unit_price: Decimal) -> Decimal {
    Decimal::from(tokens) / Decimal::from(TOKENS_PER_UNIT) * unit_price
}

/// Cost of a usage record at the given unit prices
pub fn compute_cost(usage: &TokenUsage, pricing: &ModelPricing) -> CostBreakdown {
    let input = priced(usage.input_tokens, pricing.input);
    let output = priced(usage.output_tokens, pricing.output);
    let cache_write = priced(usage.cache_creation_tokens, pricing.cache_write);
    let cache_read = priced(usage.cache_read_tokens, pricing.cache_read);

    CostBreakdown {
        input,
        output,
        cache_write,
        cache_read,
        total: input + output + cache_write + cache_read,
    }
}

pub fn cache_savings(usage: &TokenUsage, pricing: &ModelPricing) -> CacheSavings {
    let normal_cost = priced(usage.cache_read_tokens, pricing.input);
    let cache_cost = priced(usage.cache_read_tokens, pricing.cache_read);
    let savings = normal_cost - cache_cost;

    let percentage = if normal_cost.is_zero() {
        Decimal::ZERO
    } else {
        savings / normal_cost * Decimal::ONE_HUNDRED
    };

    CacheSavings {
        normal_cost,
        cache_cost,
        savings,
        percentage,
    }
}

/// Prices token usage through a shared [`PricingResolver`]
#[derive(Debug, Clone)]
pub struct CostCalculator {
    resolver: Arc<PricingResolver>,
}

impl CostCalculator {
    pub const fn new(resolver: Arc<PricingResolver>) -> Self {
        Self { resolver }
    }

    pub fn resolver(&self) -> &PricingResolver {
        &self.resolver
    }

    pub async fn calculate(&self, model: &str, usage: &TokenUsage) -> CostReport {
        let pricing = self.resolver.get_pricing(model).await;

        CostReport {
            model: model.to_string(),
            usage: *usage,
            pricing,
            cost: compute_cost(usage, &pricing),
            savings: cache_savings(usage, &pricing),
        }
    }

    /// Total cost of many requests, each priced by its own model
    pub async fn calculate_aggregated<'a, I>(&self, records: I) -> CostBreakdown
    where
        I: IntoIterator<Item = (&'a str, &'a TokenUsage)>,
    {
        let mut total = CostBreakdown::default();
        for (model, usage) in records {
            let pricing = self.resolver.get_pricing(model).await;
            total = total + compute_cost(usage, &pricing);
        }
        total
    }
}
