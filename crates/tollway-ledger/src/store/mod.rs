//! Persistence seam for the ledger

mod memory;
#[cfg(feature = "postgres")]
mod postgres;

use jiff::{Timestamp, civil::Date};
use rust_decimal::Decimal;

pub use self::memory::MemoryLedgerStore;
#[cfg(feature = "postgres")]
pub use self::postgres::PostgresLedgerStore;
use crate::{
    LedgerError,
    funding::FundingSnapshot,
    model::{Balance, ConsumptionRecord, RechargeCard, RechargeLog, RequestLog, TimePlan, UsagePlan},
};

/// Aggregate of a user's consumption records
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsumptionSummary {
    pub requests: u64,
    pub cost_usd: Decimal,
    pub total_tokens: u64,
}

/// Storage for balances, plans, cards, and the audit journals
#[async_trait::async_trait]
pub trait LedgerStore: Send + Sync {
    /// Open a transaction holding the user's row lock
    ///
    /// Every mutation of a user's balance or plans goes through one of
    /// these; a second `begin` for the same user waits until the first
    /// commits or is dropped.
    async fn begin(&self, user_id: &str) -> Result<Box<dyn LedgerTx>, LedgerError>;

    /// Last committed funding rows, read without the user's lock
    async fn funding_snapshot(&self, user_id: &str) -> Result<FundingSnapshot, LedgerError>;

    /// Insert a new card; fails if the code is taken
    async fn insert_card(&self, card: &RechargeCard) -> Result<(), LedgerError>;

    async fn find_card(&self, code: &str) -> Result<Option<RechargeCard>, LedgerError>;

    /// Mark unused cards whose expiry passed before `now` as expired
    async fn expire_cards(&self, now: Timestamp) -> Result<u64, LedgerError>;

    /// Users owning an active time plan not yet reset on `today`
    async fn users_with_stale_time_plans(&self, today: Date) -> Result<Vec<String>, LedgerError>;

    /// Users owning an active time plan that ended before `now`
    async fn users_with_lapsed_time_plans(&self, now: Timestamp) -> Result<Vec<String>, LedgerError>;

    async fn insert_request_log(&self, log: &RequestLog) -> Result<(), LedgerError>;

    /// Delete request logs created before `cutoff`
    async fn purge_request_logs(&self, cutoff: Timestamp) -> Result<u64, LedgerError>;

    /// Consumption of a user, optionally only records created at or after `since`
    async fn consumption_summary(
        &self,
        user_id: &str,
        since: Option<Timestamp>,
    ) -> Result<ConsumptionSummary, LedgerError>;

    /// Cost of requests made with one API key at or after `since`
    async fn api_key_cost(&self, api_key_id: &str, since: Timestamp) -> Result<Decimal, LedgerError>;
}

/// Writes staged under one user's lock
///
/// Nothing is visible to other readers until [`LedgerTx::commit`];
/// dropping the transaction discards every staged write.
#[async_trait::async_trait]
pub trait LedgerTx: Send {
    /// Funding rows as seen inside this transaction
    async fn funding(&mut self) -> Result<FundingSnapshot, LedgerError>;

    /// Lock a card row for the rest of the transaction
    async fn lock_card(&mut self, code: &str) -> Result<Option<RechargeCard>, LedgerError>;

    async fn save_balance(&mut self, balance: &Balance) -> Result<(), LedgerError>;

    async fn save_time_plan(&mut self, plan: &TimePlan) -> Result<(), LedgerError>;

    async fn save_usage_plan(&mut self, plan: &UsagePlan) -> Result<(), LedgerError>;

    /// Insert a plan, returning it with its assigned id
    async fn insert_time_plan(&mut self, plan: TimePlan) -> Result<TimePlan, LedgerError>;

    /// Insert a plan, returning it with its assigned id
    async fn insert_usage_plan(&mut self, plan: UsagePlan) -> Result<UsagePlan, LedgerError>;

    /// Update a card previously returned by [`LedgerTx::lock_card`]
    async fn save_card(&mut self, card: &RechargeCard) -> Result<(), LedgerError>;

    async fn append_consumption(&mut self, record: &ConsumptionRecord) -> Result<(), LedgerError>;

    async fn append_recharge(&mut self, log: &RechargeLog) -> Result<(), LedgerError>;

    async fn commit(self: Box<Self>) -> Result<(), LedgerError>;
}
