//! Funding-source selection shared by the quota probe and deductions

use jiff::{Timestamp, civil::Date};
use rust_decimal::Decimal;

use crate::model::{Balance, DeductionType, TimePlan, UsagePlan};

/// Everything a user can pay with, as read from the store
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FundingSnapshot {
    pub balance: Option<Balance>,
    pub time_plans: Vec<TimePlan>,
    pub usage_plans: Vec<UsagePlan>,
}

impl FundingSnapshot {
    pub fn balance_amount(&self) -> Decimal {
        self.balance.as_ref().map_or(Decimal::ZERO, |b| b.balance)
    }
}

/// Which plan tiers take part in selection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FundingPolicy {
    pub time_plans: bool,
    pub usage_plans: bool,
}

impl Default for FundingPolicy {
    fn default() -> Self {
        Self {
            time_plans: true,
            usage_plans: true,
        }
    }
}

/// The one source a request is charged against
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FundingSource {
    /// Time plan with the daily counter already rolled to `today`
    TimePlan(TimePlan),
    UsagePlan(UsagePlan),
    Balance(Balance),
}

impl FundingSource {
    pub const fn deduction_type(&self) -> DeductionType {
        match self {
            Self::TimePlan(_) => DeductionType::TimeLimit,
            Self::UsagePlan(_) => DeductionType::UsageCount,
            Self::Balance(_) => DeductionType::Balance,
        }
    }
}

/// Roll a time plan's daily counter over when it was last reset before `today`
///
/// Used by deductions (lazily) and by the daily sweep (eagerly) so both
/// paths agree. Applying it twice on the same day is a no-op.
pub fn reset_if_stale(mut plan: TimePlan, today: Date) -> TimePlan {
    if plan.last_reset_date != Some(today) {
        plan.today_used = 0;
        plan.last_reset_date = Some(today);
    }
    plan
}

/// Pick the funding source for a charge of `amount`
///
/// Time plans with calls left today win over usage plans with calls left,
/// which win over a balance covering `amount`. Among time plans the one
/// ending soonest is used first; among usage plans the oldest.
pub fn select_funding(
    snapshot: &FundingSnapshot,
    policy: FundingPolicy,
    amount: Decimal,
    now: Timestamp,
    today: Date,
) -> Option<FundingSource> {
    if policy.time_plans {
        let plan = snapshot
            .time_plans
            .iter()
            .filter(|plan| plan.is_current(now))
            .map(|plan| reset_if_stale(plan.clone(), today))
            .filter(|plan| plan.daily_remaining() > 0)
            .min_by_key(|plan| (plan.end_date, plan.id));

        if let Some(plan) = plan {
            return Some(FundingSource::TimePlan(plan));
        }
    }

    if policy.usage_plans {
        let plan = snapshot
            .usage_plans
            .iter()
            .filter(|plan| plan.is_usable())
            .min_by_key(|plan| plan.id);

        if let Some(plan) = plan {
            return Some(FundingSource::UsagePlan(plan.clone()));
        }
    }

    snapshot
        .balance
        .as_ref()
        .filter(|balance| balance.balance >= amount)
        .map(|balance| FundingSource::Balance(balance.clone()))
}

#[cfg(test)]
mod tests {
    use jiff::{SignedDuration, ToSpan};
    use rust_decimal_macros::dec;

    use super::*;
    use crate::model::{TimePlanStatus, TimeType, UsagePlanStatus};

    fn now() -> Timestamp {
        "2025-06-10T12:00:00Z".parse().unwrap()
    }

    fn today() -> Date {
        jiff::civil::date(2025, 6, 10)
    }

    fn time_plan(id: i64, daily_limit: u32, today_used: u32, last_reset: Option<Date>) -> TimePlan {
        TimePlan {
            id,
            user_id: "u".to_string(),
            time_type: TimeType::Daily,
            daily_limit,
            start_date: now() - SignedDuration::from_hours(240),
            end_date: now() + SignedDuration::from_hours(240),
            today_used,
            last_reset_date: last_reset,
            status: TimePlanStatus::Active,
            card_code: None,
            created_at: now(),
        }
    }

    fn usage_plan(id: i64, remaining: u32) -> UsagePlan {
        UsagePlan {
            id,
            user_id: "u".to_string(),
            total_usage: 10,
            used_usage: 10 - remaining,
            remaining_usage: remaining,
            status: UsagePlanStatus::Active,
            card_code: None,
            created_at: now(),
        }
    }

    fn balance(amount: Decimal) -> Balance {
        Balance {
            balance: amount,
            ..Balance::empty("u", now())
        }
    }

    fn select(snapshot: &FundingSnapshot, amount: Decimal) -> Option<FundingSource> {
        select_funding(snapshot, FundingPolicy::default(), amount, now(), today())
    }

    #[test]
    fn reset_is_idempotent_within_a_day() {
        let yesterday = today() - 1.day();
        let plan = time_plan(1, 5, 5, Some(yesterday));

        let once = reset_if_stale(plan, today());
        assert_eq!(once.today_used, 0);
        assert_eq!(once.last_reset_date, Some(today()));

        let mut used = once.clone();
        used.today_used = 3;
        assert_eq!(reset_if_stale(used.clone(), today()), used);
    }

    #[test]
    fn time_plan_beats_usage_plan_and_balance() {
        let snapshot = FundingSnapshot {
            balance: Some(balance(dec!(100))),
            time_plans: vec![time_plan(1, 5, 0, Some(today()))],
            usage_plans: vec![usage_plan(2, 3)],
        };
        assert!(matches!(select(&snapshot, dec!(1)), Some(FundingSource::TimePlan(_))));
    }

    #[test]
    fn exhausted_day_falls_through_to_usage_plan() {
        let snapshot = FundingSnapshot {
            balance: Some(balance(dec!(100))),
            time_plans: vec![time_plan(1, 5, 5, Some(today()))],
            usage_plans: vec![usage_plan(2, 3)],
        };
        assert!(matches!(select(&snapshot, dec!(1)), Some(FundingSource::UsagePlan(p)) if p.id == 2));
    }

    #[test]
    fn stale_counter_is_seen_as_reset() {
        let snapshot = FundingSnapshot {
            time_plans: vec![time_plan(1, 5, 5, Some(today() - 1.day()))],
            ..FundingSnapshot::default()
        };
        let Some(FundingSource::TimePlan(plan)) = select(&snapshot, dec!(1)) else {
            panic!("expected time plan");
        };
        assert_eq!(plan.today_used, 0);
    }

    #[test]
    fn time_plan_outside_window_is_ignored() {
        let mut plan = time_plan(1, 5, 0, None);
        plan.end_date = now() - SignedDuration::from_secs(1);
        let snapshot = FundingSnapshot {
            time_plans: vec![plan],
            ..FundingSnapshot::default()
        };
        assert_eq!(select(&snapshot, dec!(0)), None);
    }

    #[test]
    fn soonest_ending_time_plan_first() {
        let mut later = time_plan(1, 5, 0, Some(today()));
        later.end_date = now() + SignedDuration::from_hours(500);
        let sooner = time_plan(2, 5, 0, Some(today()));
        let snapshot = FundingSnapshot {
            time_plans: vec![later, sooner],
            ..FundingSnapshot::default()
        };
        assert!(matches!(select(&snapshot, dec!(1)), Some(FundingSource::TimePlan(p)) if p.id == 2));
    }

    #[test]
    fn balance_boundary_is_inclusive() {
        let snapshot = FundingSnapshot {
            balance: Some(balance(dec!(0.50))),
            ..FundingSnapshot::default()
        };
        assert!(matches!(select(&snapshot, dec!(0.50)), Some(FundingSource::Balance(_))));
        assert_eq!(select(&snapshot, dec!(0.51)), None);
    }

    #[test]
    fn disabled_tiers_are_skipped() {
        let snapshot = FundingSnapshot {
            balance: Some(balance(dec!(5))),
            time_plans: vec![time_plan(1, 5, 0, Some(today()))],
            usage_plans: vec![usage_plan(2, 3)],
        };
        let policy = FundingPolicy {
            time_plans: false,
            usage_plans: false,
        };
        let selected = select_funding(&snapshot, policy, dec!(1), now(), today());
        assert!(matches!(selected, Some(FundingSource::Balance(_))));
    }
}
