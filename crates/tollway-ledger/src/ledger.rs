use std::sync::Arc;

use jiff::{SignedDuration, Timestamp, ToSpan, civil::Date, tz::TimeZone};
use rust_decimal::{Decimal, RoundingStrategy};
use tollway_config::{LedgerConfig, UserSeed};
use tollway_core::SharedClock;

use crate::{
    LedgerError,
    funding::{FundingPolicy, FundingSource, reset_if_stale, select_funding},
    model::{
        Balance, CardStatus, CardValue, ConsumptionRecord, DeductionType, RechargeCard, RechargeKind, RechargeLog,
        RequestLog, TimePlan, TimePlanStatus, TimeType, UsagePlan, UsagePlanStatus,
    },
    outcome::{
        CleanupReport, Deduction, DeductionOutcome, DeductionRequest, QuotaProbe, Redemption, Rejection,
        UserBillingStats,
    },
    store::{LedgerStore, LedgerTx},
};

/// Ledger behavior derived from configuration
#[derive(Debug, Clone)]
pub struct LedgerSettings {
    /// Zone in which calendar days (and daily plan resets) are counted
    pub timezone: TimeZone,
    pub policy: FundingPolicy,
    pub log_retention_months: u32,
}

impl Default for LedgerSettings {
    fn default() -> Self {
        Self {
            timezone: TimeZone::UTC,
            policy: FundingPolicy::default(),
            log_retention_months: 3,
        }
    }
}

impl LedgerSettings {
    pub fn from_config(config: &LedgerConfig) -> Result<Self, LedgerError> {
        let timezone = TimeZone::get(&config.timezone)
            .map_err(|e| LedgerError::InvalidInput(format!("unknown time zone '{}': {e}", config.timezone)))?;

        Ok(Self {
            timezone,
            policy: FundingPolicy {
                time_plans: config.time_plans_enabled,
                usage_plans: config.usage_plans_enabled,
            },
            log_retention_months: config.log_retention_months,
        })
    }
}

/// Card to be issued
#[derive(Debug, Clone)]
pub struct NewCard {
    pub code: String,
    pub value: CardValue,
    pub expires_at: Option<Timestamp>,
    pub batch_id: Option<String>,
    pub created_by: Option<String>,
}

/// Decimal places kept for money written to balances and journals
pub const MONEY_SCALE: u32 = 4;

/// Tiered quota ledger
///
/// Owns funding-source selection and every balance or plan mutation.
/// All mutations run inside a store transaction holding the user's lock.
pub struct Ledger {
    store: Arc<dyn LedgerStore>,
    clock: SharedClock,
    settings: LedgerSettings,
}

impl std::fmt::Debug for Ledger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ledger").field("settings", &self.settings).finish_non_exhaustive()
    }
}

impl Ledger {
    pub fn new(store: Arc<dyn LedgerStore>, clock: SharedClock, settings: LedgerSettings) -> Self {
        Self { store, clock, settings }
    }

    pub fn store(&self) -> &Arc<dyn LedgerStore> {
        &self.store
    }

    /// Current calendar day in the ledger's time zone
    pub fn today(&self) -> Date {
        self.clock.now().to_zoned(self.settings.timezone.clone()).date()
    }

    /// Non-mutating admission check
    ///
    /// Reads committed rows without the user's lock, so the answer may be
    /// stale by the time a deduction runs. The deduction re-selects.
    pub async fn check_quota(&self, user_id: &str, estimated_cost: Decimal) -> Result<QuotaProbe, LedgerError> {
        require_user(user_id)?;
        require_non_negative(estimated_cost, "estimated cost")?;

        let snapshot = self.store.funding_snapshot(user_id).await?;
        let selected = select_funding(
            &snapshot,
            self.settings.policy,
            estimated_cost,
            self.clock.now(),
            self.today(),
        );

        let probe = match selected {
            Some(FundingSource::TimePlan(plan)) => QuotaProbe::TimeLimit {
                plan_id: plan.id,
                daily_remaining: plan.daily_remaining(),
            },
            Some(FundingSource::UsagePlan(plan)) => QuotaProbe::UsageCount {
                plan_id: plan.id,
                remaining_usage: plan.remaining_usage,
            },
            Some(FundingSource::Balance(balance)) => QuotaProbe::Balance {
                remaining_balance: balance.balance,
            },
            None => QuotaProbe::None {
                balance: snapshot.balance_amount(),
            },
        };

        Ok(probe)
    }

    /// Charge one completed request against exactly one funding source
    ///
    /// Selection is repeated under the user's lock. A rejected deduction
    /// writes nothing; a charged one writes exactly one consumption record.
    pub async fn process_deduction(&self, request: &DeductionRequest) -> Result<DeductionOutcome, LedgerError> {
        require_user(&request.user_id)?;
        require_non_negative(request.cost_usd, "cost")?;

        let mut attempted = None;
        let result = self.deduct(request, &mut attempted).await;

        match &result {
            Ok(DeductionOutcome::Charged(deduction)) => {
                tracing::debug!(
                    user_id = %request.user_id,
                    request_id = %request.request_id,
                    deduction_type = %deduction.deduction_type,
                    cost = %deduction.cost_charged,
                    "deduction committed"
                );
            }
            Ok(DeductionOutcome::Rejected(rejection)) => {
                tracing::warn!(
                    user_id = %request.user_id,
                    request_id = %request.request_id,
                    cost = %request.cost_usd,
                    ?rejection,
                    "deduction rejected"
                );
            }
            Err(e) => {
                tracing::error!(
                    user_id = %request.user_id,
                    request_id = %request.request_id,
                    cost = %request.cost_usd,
                    funding = ?attempted,
                    model = %request.model,
                    error = %e,
                    "deduction aborted"
                );
            }
        }

        result
    }

    async fn deduct(
        &self,
        request: &DeductionRequest,
        attempted: &mut Option<DeductionType>,
    ) -> Result<DeductionOutcome, LedgerError> {
        let mut tx = self.store.begin(&request.user_id).await?;
        let snapshot = tx.funding().await?;
        let now = self.clock.now();
        let cost = round_money(request.cost_usd);

        let Some(source) = select_funding(&snapshot, self.settings.policy, cost, now, self.today()) else {
            return Ok(DeductionOutcome::Rejected(Rejection::InsufficientBalance {
                balance: snapshot.balance_amount(),
                cost,
            }));
        };

        *attempted = Some(source.deduction_type());
        let mut record = consumption_record(request, source.deduction_type(), now);

        let deduction = match source {
            FundingSource::TimePlan(mut plan) => {
                plan.today_used += 1;
                tx.save_time_plan(&plan).await?;
                record.plan_id = Some(plan.id);
                record.usage_count = 1;
                Deduction::from_time_plan(&plan)
            }
            FundingSource::UsagePlan(mut plan) => {
                plan.used_usage += 1;
                plan.remaining_usage -= 1;
                if plan.remaining_usage == 0 {
                    plan.status = UsagePlanStatus::Exhausted;
                }
                tx.save_usage_plan(&plan).await?;
                record.plan_id = Some(plan.id);
                record.usage_count = 1;
                Deduction::from_usage_plan(&plan)
            }
            FundingSource::Balance(mut balance) => {
                let before = balance.balance;
                balance.balance -= cost;
                balance.total_consumed += cost;
                balance.updated_at = now;
                tx.save_balance(&balance).await?;
                record.cost_usd = cost;
                record.balance_before = Some(before);
                record.balance_after = Some(balance.balance);
                Deduction::from_balance(&balance, cost)
            }
        };

        tx.append_consumption(&record).await?;
        tx.commit().await?;

        Ok(DeductionOutcome::Charged(deduction))
    }

    /// Credit a user's balance by hand
    pub async fn recharge_balance(
        &self,
        user_id: &str,
        amount: Decimal,
        description: &str,
        operator_id: Option<&str>,
    ) -> Result<Balance, LedgerError> {
        require_user(user_id)?;
        if amount <= Decimal::ZERO {
            return Err(LedgerError::InvalidInput("recharge amount must be positive".to_string()));
        }

        let mut tx = self.store.begin(user_id).await?;
        let credit = Credit {
            amount,
            kind: RechargeKind::Manual,
            description,
            operator_id,
            card_code: None,
        };
        let balance = self.credit(tx.as_mut(), user_id, credit).await?;
        tx.commit().await?;

        tracing::info!(user_id, amount = %amount, balance = %balance.balance, "balance recharged");

        Ok(balance)
    }

    /// Redeem a recharge card for a user
    pub async fn redeem_card(&self, user_id: &str, code: &str) -> Result<Redemption, LedgerError> {
        require_user(user_id)?;
        let code = code.trim();
        if code.is_empty() {
            return Err(LedgerError::InvalidInput("card code is required".to_string()));
        }

        let now = self.clock.now();
        let mut tx = self.store.begin(user_id).await?;
        let mut card = tx.lock_card(code).await?.ok_or(LedgerError::CardNotFound)?;

        if card.status != CardStatus::Unused {
            return Err(LedgerError::CardUnavailable(card.status));
        }

        if card.expires_at.is_some_and(|at| at < now) {
            card.status = CardStatus::Expired;
            tx.save_card(&card).await?;
            tx.commit().await?;
            return Err(LedgerError::CardExpired);
        }

        card.status = CardStatus::Used;
        card.user_id = Some(user_id.to_string());
        card.used_at = Some(now);
        tx.save_card(&card).await?;

        let redemption = match card.value {
            CardValue::Balance { value } => {
                let credit = Credit {
                    amount: value,
                    kind: RechargeKind::Card,
                    description: "recharge card",
                    operator_id: None,
                    card_code: Some(code),
                };
                let balance = self.credit(tx.as_mut(), user_id, credit).await?;
                Redemption::Balance {
                    amount: value,
                    balance: balance.balance,
                }
            }
            CardValue::UsageCount { usage_count } => {
                let plan = new_usage_plan(user_id, usage_count, Some(code), now);
                Redemption::UsagePlan(tx.insert_usage_plan(plan).await?)
            }
            CardValue::TimeLimit {
                time_type,
                duration_days,
                daily_limit,
            } => {
                let plan = new_time_plan(user_id, time_type, daily_limit, duration_days, Some(code), now)?;
                Redemption::TimePlan(tx.insert_time_plan(plan).await?)
            }
        };

        tx.commit().await?;

        tracing::info!(user_id, card = code, "recharge card redeemed");

        Ok(redemption)
    }

    /// Create an unused recharge card
    pub async fn issue_card(&self, card: NewCard) -> Result<RechargeCard, LedgerError> {
        if card.code.trim().is_empty() {
            return Err(LedgerError::InvalidInput("card code is required".to_string()));
        }

        let valid = match &card.value {
            CardValue::Balance { value } => *value > Decimal::ZERO,
            CardValue::UsageCount { usage_count } => *usage_count > 0,
            CardValue::TimeLimit {
                duration_days,
                daily_limit,
                ..
            } => *duration_days > 0 && *daily_limit > 0,
        };
        if !valid {
            return Err(LedgerError::InvalidInput("card must grant a positive amount".to_string()));
        }

        let card = RechargeCard {
            code: card.code.trim().to_string(),
            value: card.value,
            status: CardStatus::Unused,
            user_id: None,
            used_at: None,
            expires_at: card.expires_at,
            batch_id: card.batch_id,
            created_by: card.created_by,
            created_at: self.clock.now(),
        };
        self.store.insert_card(&card).await?;

        Ok(card)
    }

    /// Grant a usage plan directly, without a card
    pub async fn grant_usage_plan(&self, user_id: &str, total: u32) -> Result<UsagePlan, LedgerError> {
        require_user(user_id)?;
        if total == 0 {
            return Err(LedgerError::InvalidInput("usage plan must grant at least one call".to_string()));
        }

        let mut tx = self.store.begin(user_id).await?;
        let plan = tx
            .insert_usage_plan(new_usage_plan(user_id, total, None, self.clock.now()))
            .await?;
        tx.commit().await?;
        Ok(plan)
    }

    /// Grant a time plan starting now, without a card
    pub async fn grant_time_plan(
        &self,
        user_id: &str,
        time_type: TimeType,
        daily_limit: u32,
        days: u32,
    ) -> Result<TimePlan, LedgerError> {
        require_user(user_id)?;
        if daily_limit == 0 || days == 0 {
            return Err(LedgerError::InvalidInput(
                "time plan needs a positive daily limit and duration".to_string(),
            ));
        }

        let plan = new_time_plan(user_id, time_type, daily_limit, days, None, self.clock.now())?;
        let mut tx = self.store.begin(user_id).await?;
        let plan = tx.insert_time_plan(plan).await?;
        tx.commit().await?;
        Ok(plan)
    }

    /// Apply startup funding from configuration
    ///
    /// Intended for process-local stores; against a durable store every
    /// restart would grant the funding again.
    pub async fn seed(&self, seeds: &[UserSeed]) -> Result<(), LedgerError> {
        for seed in seeds {
            if seed.balance > Decimal::ZERO {
                let mut tx = self.store.begin(&seed.id).await?;
                let credit = Credit {
                    amount: seed.balance,
                    kind: RechargeKind::System,
                    description: "seed",
                    operator_id: None,
                    card_code: None,
                };
                self.credit(tx.as_mut(), &seed.id, credit).await?;
                tx.commit().await?;
            }
            for plan in &seed.usage_plans {
                self.grant_usage_plan(&seed.id, plan.total).await?;
            }
            for plan in &seed.time_plans {
                self.grant_time_plan(&seed.id, TimeType::Daily, plan.daily_limit, plan.days)
                    .await?;
            }
        }

        Ok(())
    }

    /// Zero the daily counter of every active time plan not reset today
    ///
    /// Takes each owner's lock in turn, so it can run alongside live
    /// deductions. Returns the number of plans reset.
    pub async fn reset_daily_usage(&self) -> Result<u64, LedgerError> {
        let today = self.today();
        let users = self.store.users_with_stale_time_plans(today).await?;

        let mut reset = 0;
        for user_id in users {
            match self.reset_user_plans(&user_id, today).await {
                Ok(count) => reset += count,
                Err(e) => tracing::warn!(user_id, error = %e, "failed to reset daily usage"),
            }
        }

        tracing::info!(plans = reset, %today, "daily usage reset");

        Ok(reset)
    }

    async fn reset_user_plans(&self, user_id: &str, today: Date) -> Result<u64, LedgerError> {
        let mut tx = self.store.begin(user_id).await?;
        let snapshot = tx.funding().await?;

        let mut reset = 0;
        for plan in snapshot.time_plans {
            if plan.status != TimePlanStatus::Active {
                continue;
            }
            let rolled = reset_if_stale(plan.clone(), today);
            if rolled != plan {
                tx.save_time_plan(&rolled).await?;
                reset += 1;
            }
        }

        tx.commit().await?;
        Ok(reset)
    }

    /// Expire lapsed time plans and unused cards past their expiry
    pub async fn cleanup_expired(&self) -> Result<CleanupReport, LedgerError> {
        let now = self.clock.now();
        let users = self.store.users_with_lapsed_time_plans(now).await?;

        let mut report = CleanupReport::default();
        for user_id in users {
            match self.expire_user_plans(&user_id, now).await {
                Ok(count) => report.plans_expired += count,
                Err(e) => tracing::warn!(user_id, error = %e, "failed to expire time plans"),
            }
        }

        report.cards_expired = self.store.expire_cards(now).await?;

        tracing::info!(
            plans_expired = report.plans_expired,
            cards_expired = report.cards_expired,
            "expired plans and cards"
        );

        Ok(report)
    }

    async fn expire_user_plans(&self, user_id: &str, now: Timestamp) -> Result<u64, LedgerError> {
        let mut tx = self.store.begin(user_id).await?;
        let snapshot = tx.funding().await?;

        let mut expired = 0;
        for mut plan in snapshot.time_plans {
            if plan.status == TimePlanStatus::Active && plan.end_date < now {
                plan.status = TimePlanStatus::Expired;
                tx.save_time_plan(&plan).await?;
                expired += 1;
            }
        }

        tx.commit().await?;
        Ok(expired)
    }

    /// Append a request to the audit log
    pub async fn record_request(&self, log: &RequestLog) -> Result<(), LedgerError> {
        self.store.insert_request_log(log).await
    }

    /// Delete request logs older than the retention window
    pub async fn purge_request_logs(&self) -> Result<u64, LedgerError> {
        let months = i64::from(self.settings.log_retention_months);
        let cutoff = self
            .clock
            .now()
            .to_zoned(self.settings.timezone.clone())
            .checked_sub(months.months())
            .map_err(|e| LedgerError::InvalidInput(format!("retention window out of range: {e}")))?
            .timestamp();

        let purged = self.store.purge_request_logs(cutoff).await?;
        tracing::info!(purged, %cutoff, "purged old request logs");
        Ok(purged)
    }

    /// Cost logged today for requests made with one API key
    pub async fn api_key_cost_today(&self, api_key_id: &str) -> Result<Decimal, LedgerError> {
        let start_of_day = self.start_of_day()?;
        self.store.api_key_cost(api_key_id, start_of_day).await
    }

    fn start_of_day(&self) -> Result<Timestamp, LedgerError> {
        self.today()
            .to_zoned(self.settings.timezone.clone())
            .map(|zoned| zoned.timestamp())
            .map_err(|e| LedgerError::InvalidInput(format!("cannot resolve start of day: {e}")))
    }

    /// Balance, live plans, and consumption totals for one user
    pub async fn user_stats(&self, user_id: &str) -> Result<UserBillingStats, LedgerError> {
        require_user(user_id)?;

        let now = self.clock.now();
        let snapshot = self.store.funding_snapshot(user_id).await?;
        let start_of_day = self.start_of_day()?;

        let total = self.store.consumption_summary(user_id, None).await?;
        let today = self.store.consumption_summary(user_id, Some(start_of_day)).await?;
        let balance = snapshot.balance.clone().unwrap_or_else(|| Balance::empty(user_id, now));

        Ok(UserBillingStats {
            user_id: user_id.to_string(),
            balance: balance.balance,
            total_recharged: balance.total_recharged,
            total_consumed: balance.total_consumed,
            active_time_plans: snapshot.time_plans.into_iter().filter(|p| p.is_current(now)).collect(),
            active_usage_plans: snapshot.usage_plans.into_iter().filter(UsagePlan::is_usable).collect(),
            total_requests: total.requests,
            today_requests: today.requests,
            today_cost: today.cost_usd,
        })
    }

    async fn credit(&self, tx: &mut dyn LedgerTx, user_id: &str, credit: Credit<'_>) -> Result<Balance, LedgerError> {
        let now = self.clock.now();
        let snapshot = tx.funding().await?;
        let mut balance = snapshot.balance.unwrap_or_else(|| Balance::empty(user_id, now));
        let amount = round_money(credit.amount);

        balance.balance += amount;
        balance.total_recharged += amount;
        balance.updated_at = now;
        tx.save_balance(&balance).await?;

        tx.append_recharge(&RechargeLog {
            user_id: user_id.to_string(),
            amount,
            kind: credit.kind,
            description: credit.description.to_string(),
            operator_id: credit.operator_id.map(ToString::to_string),
            card_code: credit.card_code.map(ToString::to_string),
            balance_after: balance.balance,
            created_at: now,
        })
        .await?;

        Ok(balance)
    }
}

struct Credit<'a> {
    amount: Decimal,
    kind: RechargeKind,
    description: &'a str,
    operator_id: Option<&'a str>,
    card_code: Option<&'a str>,
}

fn consumption_record(request: &DeductionRequest, deduction_type: DeductionType, now: Timestamp) -> ConsumptionRecord {
    ConsumptionRecord {
        user_id: request.user_id.clone(),
        request_id: request.request_id.clone(),
        api_key_id: request.api_key_id.clone(),
        account_id: request.account_id.clone(),
        deduction_type,
        plan_id: None,
        usage_count: 0,
        cost_usd: Decimal::ZERO,
        usage: request.usage,
        total_tokens: request.usage.total(),
        model: request.model.clone(),
        is_stream: request.is_stream,
        balance_before: None,
        balance_after: None,
        created_at: now,
    }
}

fn new_usage_plan(user_id: &str, total: u32, card_code: Option<&str>, now: Timestamp) -> UsagePlan {
    UsagePlan {
        id: 0,
        user_id: user_id.to_string(),
        total_usage: total,
        used_usage: 0,
        remaining_usage: total,
        status: UsagePlanStatus::Active,
        card_code: card_code.map(ToString::to_string),
        created_at: now,
    }
}

fn new_time_plan(
    user_id: &str,
    time_type: TimeType,
    daily_limit: u32,
    days: u32,
    card_code: Option<&str>,
    now: Timestamp,
) -> Result<TimePlan, LedgerError> {
    let end_date = now
        .checked_add(SignedDuration::from_hours(i64::from(days) * 24))
        .map_err(|e| LedgerError::InvalidInput(format!("time plan duration out of range: {e}")))?;

    Ok(TimePlan {
        id: 0,
        user_id: user_id.to_string(),
        time_type,
        daily_limit,
        start_date: now,
        end_date,
        today_used: 0,
        last_reset_date: None,
        status: TimePlanStatus::Active,
        card_code: card_code.map(ToString::to_string),
        created_at: now,
    })
}

/// Round dollars to the stored precision, halves away from zero
fn round_money(amount: Decimal) -> Decimal {
    amount.round_dp_with_strategy(MONEY_SCALE, RoundingStrategy::MidpointAwayFromZero)
}

fn require_user(user_id: &str) -> Result<(), LedgerError> {
    if user_id.trim().is_empty() {
        return Err(LedgerError::InvalidInput("user id is required".to_string()));
    }
    Ok(())
}

fn require_non_negative(amount: Decimal, what: &str) -> Result<(), LedgerError> {
    if amount.is_sign_negative() && !amount.is_zero() {
        return Err(LedgerError::InvalidInput(format!("{what} must not be negative")));
    }
    Ok(())
}
