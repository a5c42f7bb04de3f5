//! Persisted ledger rows

use jiff::{Timestamp, civil::Date};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tollway_core::TokenUsage;

pub type PlanId = i64;

/// Cash balance of one user, created lazily on first need
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Balance {
    pub user_id: String,
    pub balance: Decimal,
    pub total_recharged: Decimal,
    pub total_consumed: Decimal,
    pub updated_at: Timestamp,
}

impl Balance {
    pub fn empty(user_id: &str, now: Timestamp) -> Self {
        Self {
            user_id: user_id.to_string(),
            balance: Decimal::ZERO,
            total_recharged: Decimal::ZERO,
            total_consumed: Decimal::ZERO,
            updated_at: now,
        }
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::AsRefStr, strum::EnumString, strum::Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum UsagePlanStatus {
    Active,
    Exhausted,
    Disabled,
}

/// Grant of prepaid calls
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsagePlan {
    pub id: PlanId,
    pub user_id: String,
    pub total_usage: u32,
    pub used_usage: u32,
    pub remaining_usage: u32,
    pub status: UsagePlanStatus,
    /// Card the plan was redeemed from, if any
    pub card_code: Option<String>,
    pub created_at: Timestamp,
}

impl UsagePlan {
    pub const fn is_usable(&self) -> bool {
        matches!(self.status, UsagePlanStatus::Active) && self.remaining_usage > 0
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::AsRefStr, strum::EnumString, strum::Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum TimePlanStatus {
    Active,
    Expired,
    Disabled,
}

/// Billing period label carried by time cards
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    strum::AsRefStr,
    strum::EnumString,
    strum::Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum TimeType {
    #[default]
    Daily,
    Weekly,
    Monthly,
}

/// Grant valid over `[start_date, end_date]` with a per-day call cap
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimePlan {
    pub id: PlanId,
    pub user_id: String,
    pub time_type: TimeType,
    pub daily_limit: u32,
    pub start_date: Timestamp,
    pub end_date: Timestamp,
    pub today_used: u32,
    pub last_reset_date: Option<Date>,
    pub status: TimePlanStatus,
    pub card_code: Option<String>,
    pub created_at: Timestamp,
}

impl TimePlan {
    /// Active and inside its validity window
    pub fn is_current(&self, now: Timestamp) -> bool {
        matches!(self.status, TimePlanStatus::Active) && self.start_date <= now && now <= self.end_date
    }

    pub const fn daily_remaining(&self) -> u32 {
        self.daily_limit.saturating_sub(self.today_used)
    }
}

/// Funding source charged by a deduction
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::AsRefStr,
    strum::EnumString,
    strum::Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum DeductionType {
    TimeLimit,
    UsageCount,
    Balance,
}

/// Append-only audit row written by every successful deduction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsumptionRecord {
    pub user_id: String,
    pub request_id: String,
    pub api_key_id: Option<String>,
    pub account_id: Option<String>,
    pub deduction_type: DeductionType,
    /// Plan charged when plan-funded
    pub plan_id: Option<PlanId>,
    /// Calls consumed from a plan, 0 for balance-funded requests
    pub usage_count: u32,
    /// Dollars charged, 0 for plan-funded requests
    pub cost_usd: Decimal,
    pub usage: TokenUsage,
    pub total_tokens: u64,
    pub model: String,
    pub is_stream: bool,
    pub balance_before: Option<Decimal>,
    pub balance_after: Option<Decimal>,
    pub created_at: Timestamp,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::AsRefStr, strum::EnumString, strum::Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum RechargeKind {
    Card,
    Manual,
    System,
}

/// Audit row for money added to a balance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RechargeLog {
    pub user_id: String,
    pub amount: Decimal,
    pub kind: RechargeKind,
    pub description: String,
    pub operator_id: Option<String>,
    pub card_code: Option<String>,
    pub balance_after: Decimal,
    pub created_at: Timestamp,
}

/// What a recharge card grants when redeemed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CardValue {
    /// Cash credited to the balance
    Balance { value: Decimal },
    /// A usage plan with this many calls
    UsageCount { usage_count: u32 },
    /// A time plan starting at redemption
    TimeLimit {
        time_type: TimeType,
        duration_days: u32,
        daily_limit: u32,
    },
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::AsRefStr, strum::EnumString, strum::Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum CardStatus {
    Unused,
    Used,
    Expired,
    Disabled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RechargeCard {
    pub code: String,
    pub value: CardValue,
    pub status: CardStatus,
    pub user_id: Option<String>,
    pub used_at: Option<Timestamp>,
    pub expires_at: Option<Timestamp>,
    pub batch_id: Option<String>,
    pub created_by: Option<String>,
    pub created_at: Timestamp,
}

/// Per-request audit and statistics row, subject to retention cleanup
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestLog {
    pub request_id: String,
    pub user_id: String,
    pub api_key_id: Option<String>,
    pub account_id: Option<String>,
    pub model: String,
    pub usage: TokenUsage,
    pub cost_usd: Decimal,
    pub is_stream: bool,
    pub status: u16,
    pub duration_ms: u64,
    pub created_at: Timestamp,
}
