//! Results of quota probes and deductions

use rust_decimal::Decimal;
use serde::Serialize;
use tollway_core::TokenUsage;

use crate::model::{Balance, DeductionType, PlanId, TimePlan, UsagePlan};

/// Funding-source tag reported by the quota probe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, strum::AsRefStr, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum QuotaType {
    TimeLimit,
    UsageCount,
    Balance,
    None,
}

impl From<DeductionType> for QuotaType {
    fn from(value: DeductionType) -> Self {
        match value {
            DeductionType::TimeLimit => Self::TimeLimit,
            DeductionType::UsageCount => Self::UsageCount,
            DeductionType::Balance => Self::Balance,
        }
    }
}

/// Advisory answer to "could this user pay for a request right now?"
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "quota_type", rename_all = "snake_case")]
pub enum QuotaProbe {
    TimeLimit { plan_id: PlanId, daily_remaining: u32 },
    UsageCount { plan_id: PlanId, remaining_usage: u32 },
    Balance { remaining_balance: Decimal },
    None { balance: Decimal },
}

impl QuotaProbe {
    pub const fn has_quota(&self) -> bool {
        !matches!(self, Self::None { .. })
    }

    pub const fn quota_type(&self) -> QuotaType {
        match self {
            Self::TimeLimit { .. } => QuotaType::TimeLimit,
            Self::UsageCount { .. } => QuotaType::UsageCount,
            Self::Balance { .. } => QuotaType::Balance,
            Self::None { .. } => QuotaType::None,
        }
    }

    pub fn message(&self) -> String {
        match self {
            Self::TimeLimit { daily_remaining, .. } => format!("time plan, {daily_remaining} calls left today"),
            Self::UsageCount { remaining_usage, .. } => format!("usage plan, {remaining_usage} calls left"),
            Self::Balance { remaining_balance } => format!("balance of ${remaining_balance}"),
            Self::None { balance } => format!("no active plan and balance ${balance} is insufficient"),
        }
    }
}

/// Charge for one completed request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeductionRequest {
    pub user_id: String,
    /// Real cost of the request, charged only when balance-funded
    pub cost_usd: Decimal,
    pub usage: TokenUsage,
    pub model: String,
    pub request_id: String,
    pub api_key_id: Option<String>,
    pub account_id: Option<String>,
    pub is_stream: bool,
}

/// What is left on the funding source after a deduction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Remaining {
    DailyCalls(u32),
    Calls(u32),
    Balance(Decimal),
}

/// A committed deduction
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Deduction {
    pub deduction_type: DeductionType,
    /// Dollars taken from the balance, 0 for plan-funded requests
    pub cost_charged: Decimal,
    pub remaining: Remaining,
    pub plan_id: Option<PlanId>,
}

impl Deduction {
    pub(crate) fn from_time_plan(plan: &TimePlan) -> Self {
        Self {
            deduction_type: DeductionType::TimeLimit,
            cost_charged: Decimal::ZERO,
            remaining: Remaining::DailyCalls(plan.daily_remaining()),
            plan_id: Some(plan.id),
        }
    }

    pub(crate) fn from_usage_plan(plan: &UsagePlan) -> Self {
        Self {
            deduction_type: DeductionType::UsageCount,
            cost_charged: Decimal::ZERO,
            remaining: Remaining::Calls(plan.remaining_usage),
            plan_id: Some(plan.id),
        }
    }

    pub(crate) fn from_balance(balance: &Balance, cost: Decimal) -> Self {
        Self {
            deduction_type: DeductionType::Balance,
            cost_charged: cost,
            remaining: Remaining::Balance(balance.balance),
            plan_id: None,
        }
    }

    pub fn message(&self) -> String {
        match self.remaining {
            Remaining::DailyCalls(left) => format!("charged time plan, {left} calls left today"),
            Remaining::Calls(left) => format!("charged usage plan, {left} calls left"),
            Remaining::Balance(left) => format!("charged ${}, balance ${left}", self.cost_charged),
        }
    }
}

/// Why nothing was charged
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum Rejection {
    /// No plan applies and the balance does not cover the cost
    InsufficientBalance { balance: Decimal, cost: Decimal },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum DeductionOutcome {
    Charged(Deduction),
    Rejected(Rejection),
}

impl DeductionOutcome {
    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Charged(_))
    }

    pub fn message(&self) -> String {
        match self {
            Self::Charged(deduction) => deduction.message(),
            Self::Rejected(Rejection::InsufficientBalance { balance, cost }) => {
                format!("insufficient balance: ${balance} available, ${cost} required")
            }
        }
    }
}

/// Result of redeeming a recharge card
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "granted", rename_all = "snake_case")]
pub enum Redemption {
    Balance { amount: Decimal, balance: Decimal },
    UsagePlan(UsagePlan),
    TimePlan(TimePlan),
}

/// Counts from the expiry sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    pub plans_expired: u64,
    pub cards_expired: u64,
}

/// Balance, live plans, and consumption totals of one user
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UserBillingStats {
    pub user_id: String,
    pub balance: Decimal,
    pub total_recharged: Decimal,
    pub total_consumed: Decimal,
    pub active_time_plans: Vec<TimePlan>,
    pub active_usage_plans: Vec<UsagePlan>,
    pub total_requests: u64,
    pub today_requests: u64,
    pub today_cost: Decimal,
}
