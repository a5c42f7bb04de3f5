use std::sync::{
    Arc, PoisonError, RwLock,
    atomic::{AtomicI64, Ordering},
};

use dashmap::DashMap;
use jiff::{Timestamp, civil::Date};
use rust_decimal::Decimal;
use tokio::sync::{Mutex, OwnedMutexGuard};

use super::{ConsumptionSummary, LedgerStore, LedgerTx};
use crate::{
    LedgerError,
    funding::FundingSnapshot,
    model::{
        Balance, CardStatus, ConsumptionRecord, RechargeCard, RechargeLog, RequestLog, TimePlan, TimePlanStatus,
        UsagePlan,
    },
};

/// Committed rows of one user plus the lock serializing their writers
#[derive(Default)]
struct UserSlot {
    lock: Arc<Mutex<()>>,
    committed: RwLock<FundingSnapshot>,
}

struct CardSlot {
    lock: Arc<Mutex<()>>,
    committed: RwLock<RechargeCard>,
}

#[derive(Default)]
struct Journal {
    consumption: Vec<ConsumptionRecord>,
    recharges: Vec<RechargeLog>,
    requests: Vec<RequestLog>,
}

#[derive(Default)]
struct Inner {
    users: DashMap<String, Arc<UserSlot>>,
    cards: DashMap<String, Arc<CardSlot>>,
    journal: RwLock<Journal>,
    next_id: AtomicI64,
}

impl Inner {
    fn user(&self, user_id: &str) -> Arc<UserSlot> {
        Arc::clone(self.users.entry(user_id.to_string()).or_default().value())
    }

    fn card(&self, code: &str) -> Option<Arc<CardSlot>> {
        self.cards.get(code).map(|slot| Arc::clone(slot.value()))
    }

    fn allocate_id(&self) -> i64 {
        self.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }
}

/// Process-local ledger store
///
/// Each user has a `tokio` mutex standing in for a row lock; committed
/// rows sit behind a separate `RwLock` so quota probes never wait on an
/// in-flight deduction.
#[derive(Clone, Default)]
pub struct MemoryLedgerStore {
    inner: Arc<Inner>,
}

impl MemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Consumption journal of one user, oldest first
    pub fn consumption_records(&self, user_id: &str) -> Vec<ConsumptionRecord> {
        read(&self.inner.journal)
            .consumption
            .iter()
            .filter(|record| record.user_id == user_id)
            .cloned()
            .collect()
    }

    /// Recharge journal of one user, oldest first
    pub fn recharge_logs(&self, user_id: &str) -> Vec<RechargeLog> {
        read(&self.inner.journal)
            .recharges
            .iter()
            .filter(|log| log.user_id == user_id)
            .cloned()
            .collect()
    }

    pub fn request_logs(&self) -> Vec<RequestLog> {
        read(&self.inner.journal).requests.clone()
    }
}

impl std::fmt::Debug for MemoryLedgerStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryLedgerStore")
            .field("users", &self.inner.users.len())
            .field("cards", &self.inner.cards.len())
            .finish()
    }
}

fn read<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

#[async_trait::async_trait]
impl LedgerStore for MemoryLedgerStore {
    async fn begin(&self, user_id: &str) -> Result<Box<dyn LedgerTx>, LedgerError> {
        let slot = self.inner.user(user_id);
        let guard = Arc::clone(&slot.lock).lock_owned().await;
        let rows = read(&slot.committed).clone();

        Ok(Box::new(MemoryTx {
            inner: Arc::clone(&self.inner),
            slot,
            _guard: guard,
            rows,
            card: None,
            consumption: Vec::new(),
            recharges: Vec::new(),
        }))
    }

    async fn funding_snapshot(&self, user_id: &str) -> Result<FundingSnapshot, LedgerError> {
        let snapshot = self
            .inner
            .users
            .get(user_id)
            .map(|slot| read(&slot.committed).clone())
            .unwrap_or_default();
        Ok(snapshot)
    }

    async fn insert_card(&self, card: &RechargeCard) -> Result<(), LedgerError> {
        match self.inner.cards.entry(card.code.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(LedgerError::DuplicateCard),
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                entry.insert(Arc::new(CardSlot {
                    lock: Arc::new(Mutex::new(())),
                    committed: RwLock::new(card.clone()),
                }));
                Ok(())
            }
        }
    }

    async fn find_card(&self, code: &str) -> Result<Option<RechargeCard>, LedgerError> {
        Ok(self.inner.card(code).map(|slot| read(&slot.committed).clone()))
    }

    async fn expire_cards(&self, now: Timestamp) -> Result<u64, LedgerError> {
        let slots: Vec<_> = self.inner.cards.iter().map(|slot| Arc::clone(slot.value())).collect();

        let mut expired = 0;
        for slot in slots {
            let _guard = slot.lock.lock().await;
            let mut card = write(&slot.committed);
            if card.status == CardStatus::Unused && card.expires_at.is_some_and(|at| at < now) {
                card.status = CardStatus::Expired;
                expired += 1;
            }
        }

        Ok(expired)
    }

    async fn users_with_stale_time_plans(&self, today: Date) -> Result<Vec<String>, LedgerError> {
        Ok(self.users_matching(|plan| {
            plan.status == TimePlanStatus::Active && plan.last_reset_date != Some(today)
        }))
    }

    async fn users_with_lapsed_time_plans(&self, now: Timestamp) -> Result<Vec<String>, LedgerError> {
        Ok(self.users_matching(|plan| plan.status == TimePlanStatus::Active && plan.end_date < now))
    }

    async fn insert_request_log(&self, log: &RequestLog) -> Result<(), LedgerError> {
        write(&self.inner.journal).requests.push(log.clone());
        Ok(())
    }

    async fn purge_request_logs(&self, cutoff: Timestamp) -> Result<u64, LedgerError> {
        let mut journal = write(&self.inner.journal);
        let before = journal.requests.len();
        journal.requests.retain(|log| log.created_at >= cutoff);
        Ok((before - journal.requests.len()) as u64)
    }

    async fn consumption_summary(
        &self,
        user_id: &str,
        since: Option<Timestamp>,
    ) -> Result<ConsumptionSummary, LedgerError> {
        let journal = read(&self.inner.journal);
        let summary = journal
            .consumption
            .iter()
            .filter(|record| record.user_id == user_id)
            .filter(|record| since.is_none_or(|since| record.created_at >= since))
            .fold(ConsumptionSummary::default(), |mut acc, record| {
                acc.requests += 1;
                acc.cost_usd += record.cost_usd;
                acc.total_tokens += record.total_tokens;
                acc
            });
        Ok(summary)
    }

    async fn api_key_cost(&self, api_key_id: &str, since: Timestamp) -> Result<Decimal, LedgerError> {
        let journal = read(&self.inner.journal);
        Ok(journal
            .requests
            .iter()
            .filter(|log| log.api_key_id.as_deref() == Some(api_key_id) && log.created_at >= since)
            .map(|log| log.cost_usd)
            .sum())
    }
}

impl MemoryLedgerStore {
    fn users_matching(&self, predicate: impl Fn(&TimePlan) -> bool) -> Vec<String> {
        self.inner
            .users
            .iter()
            .filter(|slot| read(&slot.committed).time_plans.iter().any(&predicate))
            .map(|slot| slot.key().clone())
            .collect()
    }
}

struct LockedCard {
    slot: Arc<CardSlot>,
    _guard: OwnedMutexGuard<()>,
    working: RechargeCard,
}

struct MemoryTx {
    inner: Arc<Inner>,
    slot: Arc<UserSlot>,
    _guard: OwnedMutexGuard<()>,
    rows: FundingSnapshot,
    card: Option<LockedCard>,
    consumption: Vec<ConsumptionRecord>,
    recharges: Vec<RechargeLog>,
}

#[async_trait::async_trait]
impl LedgerTx for MemoryTx {
    async fn funding(&mut self) -> Result<FundingSnapshot, LedgerError> {
        Ok(self.rows.clone())
    }

    async fn lock_card(&mut self, code: &str) -> Result<Option<RechargeCard>, LedgerError> {
        if let Some(locked) = self.card.as_ref().filter(|locked| locked.working.code == code) {
            return Ok(Some(locked.working.clone()));
        }

        if self.card.is_some() {
            return Err(LedgerError::InvalidInput(
                "only one card can be locked per transaction".to_string(),
            ));
        }

        let Some(slot) = self.inner.card(code) else {
            return Ok(None);
        };

        let guard = Arc::clone(&slot.lock).lock_owned().await;
        let working = read(&slot.committed).clone();
        self.card = Some(LockedCard {
            slot,
            _guard: guard,
            working: working.clone(),
        });

        Ok(Some(working))
    }

    async fn save_balance(&mut self, balance: &Balance) -> Result<(), LedgerError> {
        self.rows.balance = Some(balance.clone());
        Ok(())
    }

    async fn save_time_plan(&mut self, plan: &TimePlan) -> Result<(), LedgerError> {
        let row = self
            .rows
            .time_plans
            .iter_mut()
            .find(|row| row.id == plan.id)
            .ok_or_else(|| LedgerError::store("save time plan", format!("no time plan {}", plan.id)))?;
        *row = plan.clone();
        Ok(())
    }

    async fn save_usage_plan(&mut self, plan: &UsagePlan) -> Result<(), LedgerError> {
        let row = self
            .rows
            .usage_plans
            .iter_mut()
            .find(|row| row.id == plan.id)
            .ok_or_else(|| LedgerError::store("save usage plan", format!("no usage plan {}", plan.id)))?;
        *row = plan.clone();
        Ok(())
    }

    async fn insert_time_plan(&mut self, mut plan: TimePlan) -> Result<TimePlan, LedgerError> {
        plan.id = self.inner.allocate_id();
        self.rows.time_plans.push(plan.clone());
        Ok(plan)
    }

    async fn insert_usage_plan(&mut self, mut plan: UsagePlan) -> Result<UsagePlan, LedgerError> {
        plan.id = self.inner.allocate_id();
        self.rows.usage_plans.push(plan.clone());
        Ok(plan)
    }

    async fn save_card(&mut self, card: &RechargeCard) -> Result<(), LedgerError> {
        match self.card.as_mut() {
            Some(locked) if locked.working.code == card.code => {
                locked.working = card.clone();
                Ok(())
            }
            _ => Err(LedgerError::store("save card", "card was not locked in this transaction")),
        }
    }

    async fn append_consumption(&mut self, record: &ConsumptionRecord) -> Result<(), LedgerError> {
        self.consumption.push(record.clone());
        Ok(())
    }

    async fn append_recharge(&mut self, log: &RechargeLog) -> Result<(), LedgerError> {
        self.recharges.push(log.clone());
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), LedgerError> {
        let tx = *self;

        if let Some(locked) = &tx.card {
            *write(&locked.slot.committed) = locked.working.clone();
        }

        *write(&tx.slot.committed) = tx.rows;

        let mut journal = write(&tx.inner.journal);
        journal.consumption.extend(tx.consumption);
        journal.recharges.extend(tx.recharges);

        Ok(())
    }
}
