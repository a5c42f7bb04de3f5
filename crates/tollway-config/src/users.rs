use rust_decimal::Decimal;
use serde::Deserialize;

/// Funding granted to a user when the ledger starts
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UserSeed {
    pub id: String,
    #[serde(default)]
    pub balance: Decimal,
    #[serde(default)]
    pub usage_plans: Vec<UsagePlanSeed>,
    #[serde(default)]
    pub time_plans: Vec<TimePlanSeed>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UsagePlanSeed {
    /// Number of prepaid calls
    pub total: u32,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TimePlanSeed {
    /// Calls allowed per calendar day
    pub daily_limit: u32,
    /// Validity starting now
    pub days: u32,
}
