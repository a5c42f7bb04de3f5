use std::collections::HashMap;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tollway_config::PricingConfig;

use crate::PricingError;

/// Unit prices for one model in USD per 1,000,000 tokens
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelPricing {
    pub input: Decimal,
    pub output: Decimal,
    pub cache_write: Decimal,
    pub cache_read: Decimal,
}

pub type PricingTable = HashMap<String, ModelPricing>;

/// Where current model prices come from
#[async_trait::async_trait]
pub trait PricingSource: Send + Sync {
    /// Load every current price row keyed by model name
    async fn load(&self) -> Result<PricingTable, PricingError>;
}

/// Price table fixed at startup
#[derive(Debug, Clone, Default)]
pub struct StaticPricing {
    table: PricingTable,
}

impl StaticPricing {
    pub const fn new(table: PricingTable) -> Self {
        Self { table }
    }

    pub fn from_config(config: &PricingConfig) -> Self {
        let table = config
            .models
            .iter()
            .map(|(model, price)| {
                let pricing = ModelPricing {
                    input: price.input,
                    output: price.output,
                    cache_write: price.cache_write,
                    cache_read: price.cache_read,
                };
                (model.clone(), pricing)
            })
            .collect();

        Self { table }
    }
}

#[async_trait::async_trait]
impl PricingSource for StaticPricing {
    async fn load(&self) -> Result<PricingTable, PricingError> {
        Ok(self.table.clone())
    }
}
