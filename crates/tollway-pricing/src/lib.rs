//! Model pricing and request cost calculation
//!
//! [`PricingResolver`] owns a TTL cache over a [`PricingSource`]; the
//! [`CostCalculator`] turns token usage into dollar amounts with it.

#![allow(clippy::missing_errors_doc, clippy::must_use_candidate)]

mod calculator;
mod error;
mod format;
#[cfg(feature = "postgres")]
mod postgres;
mod resolver;
mod source;

pub use calculator::{CacheSavings, CostBreakdown, CostCalculator, CostReport, cache_savings, compute_cost};
pub use error::PricingError;
pub use format::{format_cost, format_percentage};
#[cfg(feature = "postgres")]
pub use postgres::PostgresPricing;
pub use resolver::{PricingResolver, UNKNOWN_MODEL};
pub use source::{ModelPricing, PricingSource, PricingTable, StaticPricing};
