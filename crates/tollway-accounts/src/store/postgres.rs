use jiff::Timestamp;
use secrecy::{ExposeSecret, SecretString};
use sqlx::{PgPool, Row, postgres::PgRow};

use super::AccountStore;
use crate::{AccountError, AccountStatus, TokenUpdate, UpstreamAccount};

const COLUMNS: &str =
    "id, name, access_token, refresh_token, expires_at, status, rate_limit_end, last_used_at";

/// Account store backed by the `upstream_accounts` table
///
/// Timestamps are Unix seconds.
#[derive(Debug, Clone)]
pub struct PostgresAccountStore {
    pool: PgPool,
}

impl PostgresAccountStore {
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> Result<(), AccountError> {
        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS upstream_accounts (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                access_token TEXT NOT NULL,
                refresh_token TEXT,
                expires_at BIGINT NOT NULL DEFAULT 0,
                status TEXT NOT NULL DEFAULT 'active',
                rate_limit_end BIGINT,
                last_used_at BIGINT
            )
            ",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| AccountError::store("migrate", e))?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl AccountStore for PostgresAccountStore {
    async fn upsert(&self, account: &UpstreamAccount) -> Result<(), AccountError> {
        sqlx::query(
            "INSERT INTO upstream_accounts (id, name, access_token, refresh_token, expires_at, status, \
             rate_limit_end, last_used_at) VALUES ($1, $2, $3, $4, $5, $6, $7, $8) \
             ON CONFLICT (id) DO UPDATE SET name = EXCLUDED.name, access_token = EXCLUDED.access_token, \
             refresh_token = EXCLUDED.refresh_token, expires_at = EXCLUDED.expires_at",
        )
        .bind(&account.id)
        .bind(&account.name)
        .bind(account.access_token.expose_secret())
        .bind(account.refresh_token.as_ref().map(|token| token.expose_secret().to_string()))
        .bind(account.expires_at)
        .bind(account.status.as_ref())
        .bind(account.rate_limit_end.map(|at| at.as_second()))
        .bind(account.last_used_at.map(|at| at.as_second()))
        .execute(&self.pool)
        .await
        .map_err(|e| AccountError::store("upsert account", e))?;
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<UpstreamAccount>, AccountError> {
        let row = sqlx::query(&format!("SELECT {COLUMNS} FROM upstream_accounts WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| AccountError::store("get account", e))?;
        row.as_ref().map(account_from_row).transpose()
    }

    async fn list(&self) -> Result<Vec<UpstreamAccount>, AccountError> {
        let rows = sqlx::query(&format!("SELECT {COLUMNS} FROM upstream_accounts ORDER BY id"))
            .fetch_all(&self.pool)
            .await
            .map_err(|e| AccountError::store("list accounts", e))?;
        rows.iter().map(account_from_row).collect()
    }

    async fn update_tokens(&self, id: &str, update: &TokenUpdate) -> Result<(), AccountError> {
        let result = sqlx::query(
            "UPDATE upstream_accounts SET access_token = $2, refresh_token = $3, expires_at = $4 WHERE id = $1",
        )
        .bind(id)
        .bind(update.access_token.expose_secret())
        .bind(update.refresh_token.as_ref().map(|token| token.expose_secret().to_string()))
        .bind(update.expires_at)
        .execute(&self.pool)
        .await
        .map_err(|e| AccountError::store("update tokens", e))?;

        if result.rows_affected() == 0 {
            return Err(AccountError::NotFound(id.to_string()));
        }
        Ok(())
    }

    async fn transition(
        &self,
        id: &str,
        from: &[AccountStatus],
        status: AccountStatus,
        rate_limit_end: Option<Timestamp>,
    ) -> Result<bool, AccountError> {
        let from: Vec<String> = from.iter().map(|status| status.as_ref().to_string()).collect();

        let result = sqlx::query(
            "UPDATE upstream_accounts SET status = $3, rate_limit_end = $4 WHERE id = $1 AND status = ANY($2)",
        )
        .bind(id)
        .bind(from)
        .bind(status.as_ref())
        .bind(rate_limit_end.map(|at| at.as_second()))
        .execute(&self.pool)
        .await
        .map_err(|e| AccountError::store("transition account", e))?;

        Ok(result.rows_affected() > 0)
    }

    async fn touch(&self, id: &str, used_at: Timestamp) -> Result<(), AccountError> {
        sqlx::query("UPDATE upstream_accounts SET last_used_at = $2 WHERE id = $1")
            .bind(id)
            .bind(used_at.as_second())
            .execute(&self.pool)
            .await
            .map_err(|e| AccountError::store("touch account", e))?;
        Ok(())
    }
}

fn account_from_row(row: &PgRow) -> Result<UpstreamAccount, AccountError> {
    let decode = |e: sqlx::Error| AccountError::store("decode account", e);
    let seconds = |value: Option<i64>| {
        value
            .map(Timestamp::from_second)
            .transpose()
            .map_err(|e| AccountError::store("decode account", e))
    };

    let status: String = row.try_get("status").map_err(decode)?;

    Ok(UpstreamAccount {
        id: row.try_get("id").map_err(decode)?,
        name: row.try_get("name").map_err(decode)?,
        access_token: SecretString::from(row.try_get::<String, _>("access_token").map_err(decode)?),
        refresh_token: row
            .try_get::<Option<String>, _>("refresh_token")
            .map_err(decode)?
            .map(SecretString::from),
        expires_at: row.try_get("expires_at").map_err(decode)?,
        status: status
            .parse()
            .map_err(|e| AccountError::store("decode account", e))?,
        rate_limit_end: seconds(row.try_get("rate_limit_end").map_err(decode)?)?,
        last_used_at: seconds(row.try_get("last_used_at").map_err(decode)?)?,
    })
}
