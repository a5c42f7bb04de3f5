use jiff::{Timestamp, civil::Date};
use rust_decimal::Decimal;
use sqlx::{
    PgConnection, PgPool, Postgres, Row, Transaction,
    postgres::{PgPoolOptions, PgRow},
};

use super::{ConsumptionSummary, LedgerStore, LedgerTx};
use crate::{
    LedgerError,
    funding::FundingSnapshot,
    model::{
        Balance, CardValue, ConsumptionRecord, PlanId, RechargeCard, RechargeLog, RequestLog, TimePlan, UsagePlan,
    },
};

const BALANCE_COLUMNS: &str = "user_id, balance, total_recharged, total_consumed, updated_at";

const TIME_PLAN_COLUMNS: &str = "id, user_id, time_type, daily_limit, start_date, end_date, today_used, \
     last_reset_date::text AS last_reset_date, status, card_code, created_at";

const USAGE_PLAN_COLUMNS: &str =
    "id, user_id, total_usage, used_usage, remaining_usage, status, card_code, created_at";

const CARD_COLUMNS: &str = "code, card_type, value, usage_count, time_type, duration_days, daily_limit, \
     status, user_id, used_at, expires_at, batch_id, created_by, created_at";

const SCHEMA: &[&str] = &[
    r"
    CREATE TABLE IF NOT EXISTS user_balances (
        user_id TEXT PRIMARY KEY,
        balance NUMERIC(20, 4) NOT NULL DEFAULT 0,
        total_recharged NUMERIC(20, 4) NOT NULL DEFAULT 0,
        total_consumed NUMERIC(20, 4) NOT NULL DEFAULT 0,
        updated_at BIGINT NOT NULL
    )
    ",
    r"
    CREATE TABLE IF NOT EXISTS usage_plans (
        id BIGSERIAL PRIMARY KEY,
        user_id TEXT NOT NULL,
        total_usage INT NOT NULL,
        used_usage INT NOT NULL DEFAULT 0,
        remaining_usage INT NOT NULL,
        status TEXT NOT NULL,
        card_code TEXT,
        created_at BIGINT NOT NULL
    )
    ",
    "CREATE INDEX IF NOT EXISTS idx_usage_plans_user ON usage_plans (user_id, status)",
    r"
    CREATE TABLE IF NOT EXISTS time_plans (
        id BIGSERIAL PRIMARY KEY,
        user_id TEXT NOT NULL,
        time_type TEXT NOT NULL,
        daily_limit INT NOT NULL,
        start_date BIGINT NOT NULL,
        end_date BIGINT NOT NULL,
        today_used INT NOT NULL DEFAULT 0,
        last_reset_date DATE,
        status TEXT NOT NULL,
        card_code TEXT,
        created_at BIGINT NOT NULL
    )
    ",
    "CREATE INDEX IF NOT EXISTS idx_time_plans_user ON time_plans (user_id, status)",
    r"
    CREATE TABLE IF NOT EXISTS consumption_records (
        id BIGSERIAL PRIMARY KEY,
        user_id TEXT NOT NULL,
        request_id TEXT NOT NULL,
        api_key_id TEXT,
        account_id TEXT,
        deduction_type TEXT NOT NULL,
        plan_id BIGINT,
        usage_count INT NOT NULL,
        cost_usd NUMERIC(20, 4) NOT NULL,
        input_tokens BIGINT NOT NULL,
        output_tokens BIGINT NOT NULL,
        cache_creation_tokens BIGINT NOT NULL,
        cache_read_tokens BIGINT NOT NULL,
        total_tokens BIGINT NOT NULL,
        model TEXT NOT NULL,
        is_stream BOOLEAN NOT NULL,
        balance_before NUMERIC(20, 4),
        balance_after NUMERIC(20, 4),
        created_at BIGINT NOT NULL
    )
    ",
    "CREATE INDEX IF NOT EXISTS idx_consumption_user_time ON consumption_records (user_id, created_at)",
    r"
    CREATE TABLE IF NOT EXISTS recharge_logs (
        id BIGSERIAL PRIMARY KEY,
        user_id TEXT NOT NULL,
        amount NUMERIC(20, 4) NOT NULL,
        kind TEXT NOT NULL,
        description TEXT NOT NULL,
        operator_id TEXT,
        card_code TEXT,
        balance_after NUMERIC(20, 4) NOT NULL,
        created_at BIGINT NOT NULL
    )
    ",
    r"
    CREATE TABLE IF NOT EXISTS recharge_cards (
        code TEXT PRIMARY KEY,
        card_type TEXT NOT NULL,
        value NUMERIC,
        usage_count INT,
        time_type TEXT,
        duration_days INT,
        daily_limit INT,
        status TEXT NOT NULL,
        user_id TEXT,
        used_at BIGINT,
        expires_at BIGINT,
        batch_id TEXT,
        created_by TEXT,
        created_at BIGINT NOT NULL
    )
    ",
    r"
    CREATE TABLE IF NOT EXISTS request_logs (
        id BIGSERIAL PRIMARY KEY,
        request_id TEXT NOT NULL,
        user_id TEXT NOT NULL,
        api_key_id TEXT,
        account_id TEXT,
        model TEXT NOT NULL,
        input_tokens BIGINT NOT NULL,
        output_tokens BIGINT NOT NULL,
        cache_creation_tokens BIGINT NOT NULL,
        cache_read_tokens BIGINT NOT NULL,
        cost_usd NUMERIC NOT NULL,
        is_stream BOOLEAN NOT NULL,
        status INT NOT NULL,
        duration_ms BIGINT NOT NULL,
        created_at BIGINT NOT NULL
    )
    ",
    "CREATE INDEX IF NOT EXISTS idx_request_logs_time ON request_logs (created_at)",
    "CREATE INDEX IF NOT EXISTS idx_request_logs_key_time ON request_logs (api_key_id, created_at)",
];

/// Ledger store backed by `PostgreSQL`
///
/// A transaction takes a transaction-scoped advisory lock keyed on the
/// user id, which serializes writers per user while leaving plain reads
/// (the quota probe) unblocked. Timestamps are stored as Unix seconds.
#[derive(Debug, Clone)]
pub struct PostgresLedgerStore {
    pool: PgPool,
}

impl PostgresLedgerStore {
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(url: &str, max_connections: u32) -> Result<Self, LedgerError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await
            .map_err(|e| LedgerError::store("connect", e))?;
        Ok(Self::new(pool))
    }

    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create tables and indexes if missing
    pub async fn migrate(&self) -> Result<(), LedgerError> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(|e| LedgerError::store("migrate", e))?;
        }
        Ok(())
    }

    async fn users_where(
        &self,
        operation: &'static str,
        condition: &str,
        bind: Bind,
    ) -> Result<Vec<String>, LedgerError> {
        let sql = format!("SELECT DISTINCT user_id FROM time_plans WHERE status = 'active' AND {condition}");
        let query = sqlx::query(&sql);
        let query = match bind {
            Bind::Date(date) => query.bind(date.to_string()),
            Bind::Seconds(seconds) => query.bind(seconds),
        };

        let rows = query
            .fetch_all(&self.pool)
            .await
            .map_err(|e| LedgerError::store(operation, e))?;
        rows.iter().map(|row| get(row, "user_id")).collect()
    }
}

enum Bind {
    Date(Date),
    Seconds(i64),
}

#[async_trait::async_trait]
impl LedgerStore for PostgresLedgerStore {
    async fn begin(&self, user_id: &str) -> Result<Box<dyn LedgerTx>, LedgerError> {
        let mut tx = self.pool.begin().await.map_err(|e| LedgerError::store("begin", e))?;

        sqlx::query("SELECT pg_advisory_xact_lock(hashtextextended($1, 0))")
            .bind(user_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| LedgerError::store("lock user", e))?;

        Ok(Box::new(PostgresTx {
            tx,
            user_id: user_id.to_string(),
        }))
    }

    async fn funding_snapshot(&self, user_id: &str) -> Result<FundingSnapshot, LedgerError> {
        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(|e| LedgerError::store("acquire", e))?;
        load_funding(&mut *conn, user_id).await
    }

    async fn insert_card(&self, card: &RechargeCard) -> Result<(), LedgerError> {
        let (card_type, value, usage_count, time_type, duration_days, daily_limit) = match &card.value {
            CardValue::Balance { value } => ("balance", Some(*value), None, None, None, None),
            CardValue::UsageCount { usage_count } => {
                ("usage_count", None, Some(to_i32(*usage_count)?), None, None, None)
            }
            CardValue::TimeLimit {
                time_type,
                duration_days,
                daily_limit,
            } => (
                "time_limit",
                None,
                None,
                Some(time_type.as_ref().to_string()),
                Some(to_i32(*duration_days)?),
                Some(to_i32(*daily_limit)?),
            ),
        };

        let result = sqlx::query(
            "INSERT INTO recharge_cards (code, card_type, value, usage_count, time_type, duration_days, daily_limit, \
             status, user_id, used_at, expires_at, batch_id, created_by, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14) \
             ON CONFLICT (code) DO NOTHING",
        )
        .bind(&card.code)
        .bind(card_type)
        .bind(value)
        .bind(usage_count)
        .bind(time_type)
        .bind(duration_days)
        .bind(daily_limit)
        .bind(card.status.as_ref())
        .bind(&card.user_id)
        .bind(card.used_at.map(|at| at.as_second()))
        .bind(card.expires_at.map(|at| at.as_second()))
        .bind(&card.batch_id)
        .bind(&card.created_by)
        .bind(card.created_at.as_second())
        .execute(&self.pool)
        .await
        .map_err(|e| LedgerError::store("insert card", e))?;

        if result.rows_affected() == 0 {
            return Err(LedgerError::DuplicateCard);
        }
        Ok(())
    }

    async fn find_card(&self, code: &str) -> Result<Option<RechargeCard>, LedgerError> {
        let row = sqlx::query(&format!("SELECT {CARD_COLUMNS} FROM recharge_cards WHERE code = $1"))
            .bind(code)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| LedgerError::store("find card", e))?;
        row.as_ref().map(card_from_row).transpose()
    }

    async fn expire_cards(&self, now: Timestamp) -> Result<u64, LedgerError> {
        let result = sqlx::query(
            "UPDATE recharge_cards SET status = 'expired' \
             WHERE status = 'unused' AND expires_at IS NOT NULL AND expires_at < $1",
        )
        .bind(now.as_second())
        .execute(&self.pool)
        .await
        .map_err(|e| LedgerError::store("expire cards", e))?;
        Ok(result.rows_affected())
    }

    async fn users_with_stale_time_plans(&self, today: Date) -> Result<Vec<String>, LedgerError> {
        self.users_where(
            "find stale time plans",
            "(last_reset_date IS NULL OR last_reset_date <> $1::date)",
            Bind::Date(today),
        )
        .await
    }

    async fn users_with_lapsed_time_plans(&self, now: Timestamp) -> Result<Vec<String>, LedgerError> {
        self.users_where("find lapsed time plans", "end_date < $1", Bind::Seconds(now.as_second()))
            .await
    }

    async fn insert_request_log(&self, log: &RequestLog) -> Result<(), LedgerError> {
        sqlx::query(
            "INSERT INTO request_logs (request_id, user_id, api_key_id, account_id, model, input_tokens, \
             output_tokens, cache_creation_tokens, cache_read_tokens, cost_usd, is_stream, status, duration_ms, \
             created_at) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)",
        )
        .bind(&log.request_id)
        .bind(&log.user_id)
        .bind(&log.api_key_id)
        .bind(&log.account_id)
        .bind(&log.model)
        .bind(to_i64(log.usage.input_tokens)?)
        .bind(to_i64(log.usage.output_tokens)?)
        .bind(to_i64(log.usage.cache_creation_tokens)?)
        .bind(to_i64(log.usage.cache_read_tokens)?)
        .bind(log.cost_usd)
        .bind(log.is_stream)
        .bind(i32::from(log.status))
        .bind(to_i64(log.duration_ms)?)
        .bind(log.created_at.as_second())
        .execute(&self.pool)
        .await
        .map_err(|e| LedgerError::store("insert request log", e))?;
        Ok(())
    }

    async fn purge_request_logs(&self, cutoff: Timestamp) -> Result<u64, LedgerError> {
        let result = sqlx::query("DELETE FROM request_logs WHERE created_at < $1")
            .bind(cutoff.as_second())
            .execute(&self.pool)
            .await
            .map_err(|e| LedgerError::store("purge request logs", e))?;
        Ok(result.rows_affected())
    }

    async fn consumption_summary(
        &self,
        user_id: &str,
        since: Option<Timestamp>,
    ) -> Result<ConsumptionSummary, LedgerError> {
        let row = sqlx::query(
            "SELECT COUNT(*)::BIGINT AS requests, \
             COALESCE(SUM(cost_usd), 0) AS cost_usd, \
             COALESCE(SUM(total_tokens), 0)::BIGINT AS total_tokens \
             FROM consumption_records \
             WHERE user_id = $1 AND ($2::BIGINT IS NULL OR created_at >= $2)",
        )
        .bind(user_id)
        .bind(since.map(|at| at.as_second()))
        .fetch_one(&self.pool)
        .await
        .map_err(|e| LedgerError::store("summarize consumption", e))?;

        Ok(ConsumptionSummary {
            requests: from_i64(get(&row, "requests")?)?,
            cost_usd: get(&row, "cost_usd")?,
            total_tokens: from_i64(get(&row, "total_tokens")?)?,
        })
    }

    async fn api_key_cost(&self, api_key_id: &str, since: Timestamp) -> Result<Decimal, LedgerError> {
        let row = sqlx::query(
            "SELECT COALESCE(SUM(cost_usd), 0) AS cost_usd FROM request_logs \
             WHERE api_key_id = $1 AND created_at >= $2",
        )
        .bind(api_key_id)
        .bind(since.as_second())
        .fetch_one(&self.pool)
        .await
        .map_err(|e| LedgerError::store("sum api key cost", e))?;

        get(&row, "cost_usd")
    }
}

struct PostgresTx {
    tx: Transaction<'static, Postgres>,
    user_id: String,
}

#[async_trait::async_trait]
impl LedgerTx for PostgresTx {
    async fn funding(&mut self) -> Result<FundingSnapshot, LedgerError> {
        load_funding(&mut *self.tx, &self.user_id).await
    }

    async fn lock_card(&mut self, code: &str) -> Result<Option<RechargeCard>, LedgerError> {
        let row = sqlx::query(&format!(
            "SELECT {CARD_COLUMNS} FROM recharge_cards WHERE code = $1 FOR UPDATE"
        ))
        .bind(code)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(|e| LedgerError::store("lock card", e))?;
        row.as_ref().map(card_from_row).transpose()
    }

    async fn save_balance(&mut self, balance: &Balance) -> Result<(), LedgerError> {
        sqlx::query(
            "INSERT INTO user_balances (user_id, balance, total_recharged, total_consumed, updated_at) \
             VALUES ($1, $2, $3, $4, $5) \
             ON CONFLICT (user_id) DO UPDATE SET balance = EXCLUDED.balance, \
             total_recharged = EXCLUDED.total_recharged, total_consumed = EXCLUDED.total_consumed, \
             updated_at = EXCLUDED.updated_at",
        )
        .bind(&balance.user_id)
        .bind(balance.balance)
        .bind(balance.total_recharged)
        .bind(balance.total_consumed)
        .bind(balance.updated_at.as_second())
        .execute(&mut *self.tx)
        .await
        .map_err(|e| LedgerError::store("save balance", e))?;
        Ok(())
    }

    async fn save_time_plan(&mut self, plan: &TimePlan) -> Result<(), LedgerError> {
        sqlx::query(
            "UPDATE time_plans SET today_used = $2, last_reset_date = $3::date, status = $4, end_date = $5 \
             WHERE id = $1",
        )
        .bind(plan.id)
        .bind(to_i32(plan.today_used)?)
        .bind(plan.last_reset_date.map(|date| date.to_string()))
        .bind(plan.status.as_ref())
        .bind(plan.end_date.as_second())
        .execute(&mut *self.tx)
        .await
        .map_err(|e| LedgerError::store("save time plan", e))?;
        Ok(())
    }

    async fn save_usage_plan(&mut self, plan: &UsagePlan) -> Result<(), LedgerError> {
        sqlx::query("UPDATE usage_plans SET used_usage = $2, remaining_usage = $3, status = $4 WHERE id = $1")
            .bind(plan.id)
            .bind(to_i32(plan.used_usage)?)
            .bind(to_i32(plan.remaining_usage)?)
            .bind(plan.status.as_ref())
            .execute(&mut *self.tx)
            .await
            .map_err(|e| LedgerError::store("save usage plan", e))?;
        Ok(())
    }

    async fn insert_time_plan(&mut self, mut plan: TimePlan) -> Result<TimePlan, LedgerError> {
        let row = sqlx::query(
            "INSERT INTO time_plans (user_id, time_type, daily_limit, start_date, end_date, today_used, \
             last_reset_date, status, card_code, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7::date, $8, $9, $10) RETURNING id",
        )
        .bind(&plan.user_id)
        .bind(plan.time_type.as_ref())
        .bind(to_i32(plan.daily_limit)?)
        .bind(plan.start_date.as_second())
        .bind(plan.end_date.as_second())
        .bind(to_i32(plan.today_used)?)
        .bind(plan.last_reset_date.map(|date| date.to_string()))
        .bind(plan.status.as_ref())
        .bind(&plan.card_code)
        .bind(plan.created_at.as_second())
        .fetch_one(&mut *self.tx)
        .await
        .map_err(|e| LedgerError::store("insert time plan", e))?;

        plan.id = get::<PlanId>(&row, "id")?;
        Ok(plan)
    }

    async fn insert_usage_plan(&mut self, mut plan: UsagePlan) -> Result<UsagePlan, LedgerError> {
        let row = sqlx::query(
            "INSERT INTO usage_plans (user_id, total_usage, used_usage, remaining_usage, status, card_code, \
             created_at) VALUES ($1, $2, $3, $4, $5, $6, $7) RETURNING id",
        )
        .bind(&plan.user_id)
        .bind(to_i32(plan.total_usage)?)
        .bind(to_i32(plan.used_usage)?)
        .bind(to_i32(plan.remaining_usage)?)
        .bind(plan.status.as_ref())
        .bind(&plan.card_code)
        .bind(plan.created_at.as_second())
        .fetch_one(&mut *self.tx)
        .await
        .map_err(|e| LedgerError::store("insert usage plan", e))?;

        plan.id = get::<PlanId>(&row, "id")?;
        Ok(plan)
    }

    async fn save_card(&mut self, card: &RechargeCard) -> Result<(), LedgerError> {
        sqlx::query("UPDATE recharge_cards SET status = $2, user_id = $3, used_at = $4 WHERE code = $1")
            .bind(&card.code)
            .bind(card.status.as_ref())
            .bind(&card.user_id)
            .bind(card.used_at.map(|at| at.as_second()))
            .execute(&mut *self.tx)
            .await
            .map_err(|e| LedgerError::store("save card", e))?;
        Ok(())
    }

    async fn append_consumption(&mut self, record: &ConsumptionRecord) -> Result<(), LedgerError> {
        sqlx::query(
            "INSERT INTO consumption_records (user_id, request_id, api_key_id, account_id, deduction_type, plan_id, \
             usage_count, cost_usd, input_tokens, output_tokens, cache_creation_tokens, cache_read_tokens, \
             total_tokens, model, is_stream, balance_before, balance_after, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18)",
        )
        .bind(&record.user_id)
        .bind(&record.request_id)
        .bind(&record.api_key_id)
        .bind(&record.account_id)
        .bind(record.deduction_type.as_ref())
        .bind(record.plan_id)
        .bind(to_i32(record.usage_count)?)
        .bind(record.cost_usd)
        .bind(to_i64(record.usage.input_tokens)?)
        .bind(to_i64(record.usage.output_tokens)?)
        .bind(to_i64(record.usage.cache_creation_tokens)?)
        .bind(to_i64(record.usage.cache_read_tokens)?)
        .bind(to_i64(record.total_tokens)?)
        .bind(&record.model)
        .bind(record.is_stream)
        .bind(record.balance_before)
        .bind(record.balance_after)
        .bind(record.created_at.as_second())
        .execute(&mut *self.tx)
        .await
        .map_err(|e| LedgerError::store("append consumption", e))?;
        Ok(())
    }

    async fn append_recharge(&mut self, log: &RechargeLog) -> Result<(), LedgerError> {
        sqlx::query(
            "INSERT INTO recharge_logs (user_id, amount, kind, description, operator_id, card_code, \
             balance_after, created_at) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
        )
        .bind(&log.user_id)
        .bind(log.amount)
        .bind(log.kind.as_ref())
        .bind(&log.description)
        .bind(&log.operator_id)
        .bind(&log.card_code)
        .bind(log.balance_after)
        .bind(log.created_at.as_second())
        .execute(&mut *self.tx)
        .await
        .map_err(|e| LedgerError::store("append recharge", e))?;
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), LedgerError> {
        self.tx.commit().await.map_err(|e| LedgerError::store("commit", e))
    }
}

async fn load_funding(conn: &mut PgConnection, user_id: &str) -> Result<FundingSnapshot, LedgerError> {
    let balance = sqlx::query(&format!("SELECT {BALANCE_COLUMNS} FROM user_balances WHERE user_id = $1"))
        .bind(user_id)
        .fetch_optional(&mut *conn)
        .await
        .map_err(|e| LedgerError::store("load balance", e))?;

    let time_plans = sqlx::query(&format!(
        "SELECT {TIME_PLAN_COLUMNS} FROM time_plans WHERE user_id = $1 ORDER BY id"
    ))
    .bind(user_id)
    .fetch_all(&mut *conn)
    .await
    .map_err(|e| LedgerError::store("load time plans", e))?;

    let usage_plans = sqlx::query(&format!(
        "SELECT {USAGE_PLAN_COLUMNS} FROM usage_plans WHERE user_id = $1 ORDER BY id"
    ))
    .bind(user_id)
    .fetch_all(&mut *conn)
    .await
    .map_err(|e| LedgerError::store("load usage plans", e))?;

    Ok(FundingSnapshot {
        balance: balance.as_ref().map(balance_from_row).transpose()?,
        time_plans: time_plans.iter().map(time_plan_from_row).collect::<Result<_, _>>()?,
        usage_plans: usage_plans.iter().map(usage_plan_from_row).collect::<Result<_, _>>()?,
    })
}

fn balance_from_row(row: &PgRow) -> Result<Balance, LedgerError> {
    Ok(Balance {
        user_id: get(row, "user_id")?,
        balance: get(row, "balance")?,
        total_recharged: get(row, "total_recharged")?,
        total_consumed: get(row, "total_consumed")?,
        updated_at: timestamp(get(row, "updated_at")?)?,
    })
}

fn time_plan_from_row(row: &PgRow) -> Result<TimePlan, LedgerError> {
    let last_reset_date = get::<Option<String>>(row, "last_reset_date")?
        .map(|raw| raw.parse::<Date>())
        .transpose()
        .map_err(|e| LedgerError::store("decode row", e))?;

    Ok(TimePlan {
        id: get(row, "id")?,
        user_id: get(row, "user_id")?,
        time_type: parse(&get::<String>(row, "time_type")?)?,
        daily_limit: from_i32(get(row, "daily_limit")?)?,
        start_date: timestamp(get(row, "start_date")?)?,
        end_date: timestamp(get(row, "end_date")?)?,
        today_used: from_i32(get(row, "today_used")?)?,
        last_reset_date,
        status: parse(&get::<String>(row, "status")?)?,
        card_code: get(row, "card_code")?,
        created_at: timestamp(get(row, "created_at")?)?,
    })
}

fn usage_plan_from_row(row: &PgRow) -> Result<UsagePlan, LedgerError> {
    Ok(UsagePlan {
        id: get(row, "id")?,
        user_id: get(row, "user_id")?,
        total_usage: from_i32(get(row, "total_usage")?)?,
        used_usage: from_i32(get(row, "used_usage")?)?,
        remaining_usage: from_i32(get(row, "remaining_usage")?)?,
        status: parse(&get::<String>(row, "status")?)?,
        card_code: get(row, "card_code")?,
        created_at: timestamp(get(row, "created_at")?)?,
    })
}

fn card_from_row(row: &PgRow) -> Result<RechargeCard, LedgerError> {
    let card_type: String = get(row, "card_type")?;
    let value = match card_type.as_str() {
        "balance" => CardValue::Balance {
            value: get::<Option<Decimal>>(row, "value")?.unwrap_or_default(),
        },
        "usage_count" => CardValue::UsageCount {
            usage_count: from_i32(get::<Option<i32>>(row, "usage_count")?.unwrap_or_default())?,
        },
        "time_limit" => CardValue::TimeLimit {
            time_type: get::<Option<String>>(row, "time_type")?
                .map(|raw| parse(&raw))
                .transpose()?
                .unwrap_or_default(),
            duration_days: from_i32(get::<Option<i32>>(row, "duration_days")?.unwrap_or_default())?,
            daily_limit: from_i32(get::<Option<i32>>(row, "daily_limit")?.unwrap_or_default())?,
        },
        other => return Err(LedgerError::store("decode row", format!("unknown card type '{other}'"))),
    };

    Ok(RechargeCard {
        code: get(row, "code")?,
        value,
        status: parse(&get::<String>(row, "status")?)?,
        user_id: get(row, "user_id")?,
        used_at: get::<Option<i64>>(row, "used_at")?.map(timestamp).transpose()?,
        expires_at: get::<Option<i64>>(row, "expires_at")?.map(timestamp).transpose()?,
        batch_id: get(row, "batch_id")?,
        created_by: get(row, "created_by")?,
        created_at: timestamp(get(row, "created_at")?)?,
    })
}

fn get<'r, T>(row: &'r PgRow, column: &str) -> Result<T, LedgerError>
where
    T: sqlx::Decode<'r, Postgres> + sqlx::Type<Postgres>,
{
    row.try_get(column).map_err(|e| LedgerError::store("decode row", e))
}

fn parse<T>(raw: &str) -> Result<T, LedgerError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    raw.parse().map_err(|e| LedgerError::store("decode row", e))
}

fn timestamp(seconds: i64) -> Result<Timestamp, LedgerError> {
    Timestamp::from_second(seconds).map_err(|e| LedgerError::store("decode row", e))
}

fn to_i32(value: u32) -> Result<i32, LedgerError> {
    i32::try_from(value).map_err(|e| LedgerError::store("encode row", e))
}

fn from_i32(value: i32) -> Result<u32, LedgerError> {
    u32::try_from(value).map_err(|e| LedgerError::store("decode row", e))
}

fn to_i64(value: u64) -> Result<i64, LedgerError> {
    i64::try_from(value).map_err(|e| LedgerError::store("encode row", e))
}

fn from_i64(value: i64) -> Result<u64, LedgerError> {
    u64::try_from(value).map_err(|e| LedgerError::store("decode row", e))
}
