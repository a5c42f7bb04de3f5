use std::{sync::Arc, time::Duration};

use jiff::Timestamp;
use tokio::sync::{Mutex, RwLock};
use tollway_core::SharedClock;

use crate::{ModelPricing, PricingSource, PricingTable};

/// Price row used when a model has no entry of its own
pub const UNKNOWN_MODEL: &str = "unknown";

/// Snapshot of the price table and when it was last (re)loaded
struct CacheState {
    table: Arc<PricingTable>,
    checked_at: Option<Timestamp>,
}

/// Model price lookup over a cached [`PricingSource`]
///
/// The table is reloaded at most once per `ttl`. A failed reload keeps
/// serving the previous table until the next interval.
pub struct PricingResolver {
    source: Arc<dyn PricingSource>,
    clock: SharedClock,
    ttl: Duration,
    state: RwLock<CacheState>,
    reload: Mutex<()>,
}

impl PricingResolver {
    pub fn new(source: Arc<dyn PricingSource>, clock: SharedClock, ttl: Duration) -> Self {
        Self {
            source,
            clock,
            ttl,
            state: RwLock::new(CacheState {
                table: Arc::new(PricingTable::new()),
                checked_at: None,
            }),
            reload: Mutex::new(()),
        }
    }

    /// Resolve the unit prices for a model
    ///
    /// Falls back to the `unknown` row, then to zero prices, so a lookup
    /// never fails.
    pub async fn get_pricing(&self, model: &str) -> ModelPricing {
        let table = self.table().await;
        let model = if model.is_empty() { UNKNOWN_MODEL } else { model };

        if let Some(pricing) = table.get(model) {
            return *pricing;
        }

        tracing::debug!(model, "no price row for model, using fallback");

        table.get(UNKNOWN_MODEL).copied().unwrap_or_default()
    }

    /// Whether the model has a price row of its own
    pub async fn is_model_priced(&self, model: &str) -> bool {
        self.table().await.contains_key(model)
    }

    /// Current price table, reloading it first when stale
    pub async fn table(&self) -> Arc<PricingTable> {
        {
            let state = self.state.read().await;
            if !self.is_stale(state.checked_at) {
                return Arc::clone(&state.table);
            }
        }

        // One reload at a time; latecomers see the fresh table
        let _guard = self.reload.lock().await;
        let checked_at = self.state.read().await.checked_at;
        if self.is_stale(checked_at) {
            self.reload().await;
        }

        Arc::clone(&self.state.read().await.table)
    }

    async fn reload(&self) {
        let now = self.clock.now();

        match self.source.load().await {
            Ok(table) => {
                tracing::debug!(models = table.len(), "price table reloaded");
                let mut state = self.state.write().await;
                state.table = Arc::new(table);
                state.checked_at = Some(now);
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to reload price table, keeping previous prices");
                self.state.write().await.checked_at = Some(now);
            }
        }
    }

    fn is_stale(&self, checked_at: Option<Timestamp>) -> bool {
        let Some(checked_at) = checked_at else {
            return true;
        };

        let age = self.clock.now().duration_since(checked_at);
        age.is_negative() || age.unsigned_abs() >= self.ttl
    }
}

impl std::fmt::Debug for PricingResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PricingResolver").field("ttl", &self.ttl).finish_non_exhaustive()
    }
}
