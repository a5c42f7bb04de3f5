use sqlx::{PgPool, Row};

use crate::{ModelPricing, PricingError, PricingSource, PricingTable};

/// Price rows read from the `model_pricing` table
///
/// Only rows flagged `is_current` are served; older rows are kept for
/// auditing past charges.
#[derive(Debug, Clone)]
pub struct PostgresPricing {
    pool: PgPool,
}

impl PostgresPricing {
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> Result<(), sqlx::Error> {
        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS model_pricing (
                id BIGSERIAL PRIMARY KEY,
                model TEXT NOT NULL,
                input_price NUMERIC NOT NULL DEFAULT 0,
                output_price NUMERIC NOT NULL DEFAULT 0,
                cache_write_price NUMERIC NOT NULL DEFAULT 0,
                cache_read_price NUMERIC NOT NULL DEFAULT 0,
                is_current BOOLEAN NOT NULL DEFAULT TRUE,
                created_at BIGINT NOT NULL DEFAULT EXTRACT(EPOCH FROM NOW())::BIGINT
            )
            ",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_model_pricing_current ON model_pricing (model) WHERE is_current")
            .execute(&self.pool)
            .await?;

        Ok(())
    }
}

#[async_trait::async_trait]
impl PricingSource for PostgresPricing {
    async fn load(&self) -> Result<PricingTable, PricingError> {
        let rows = sqlx::query(
            "SELECT model, input_price, output_price, cache_write_price, cache_read_price \
             FROM model_pricing WHERE is_current ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| PricingError::Source(e.to_string()))?;

        let mut table = PricingTable::with_capacity(rows.len());
        for row in rows {
            let pricing = ModelPricing {
                input: row.try_get("input_price").map_err(|e| PricingError::Source(e.to_string()))?,
                output: row.try_get("output_price").map_err(|e| PricingError::Source(e.to_string()))?,
                cache_write: row
                    .try_get("cache_write_price")
                    .map_err(|e| PricingError::Source(e.to_string()))?,
                cache_read: row
                    .try_get("cache_read_price")
                    .map_err(|e| PricingError::Source(e.to_string()))?,
            };
            let model: String = row.try_get("model").map_err(|e| PricingError::Source(e.to_string()))?;
            table.insert(model, pricing);
        }

        Ok(table)
    }
}
