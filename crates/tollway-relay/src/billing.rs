//! Post-stream billing
//!
//! Completed relays are queued and charged by a background task so the
//! client never waits on the ledger. Usage that cannot be charged is
//! reported on the [`UNBILLED_TARGET`] log target for reconciliation.

use std::sync::Arc;

use rust_decimal::Decimal;
use tokio::{sync::mpsc, task::JoinHandle};
use tollway_core::{CallerIdentity, SharedClock, TokenUsage};
use tollway_ledger::{DeductionOutcome, DeductionRequest, Ledger, LedgerError, RequestLog};
use tollway_pricing::CostCalculator;
use tollway_telemetry::metrics::{self, UNBILLED_TARGET};

/// Usage of one fully relayed response, waiting to be charged
#[derive(Debug, Clone)]
pub struct BillingJob {
    pub request_id: String,
    pub caller: CallerIdentity,
    pub account_id: String,
    pub model: String,
    pub usage: TokenUsage,
    pub is_stream: bool,
    pub status: u16,
    pub duration_ms: u64,
}

/// Charges jobs against the ledger and writes their request log
pub struct Biller {
    ledger: Arc<Ledger>,
    calculator: CostCalculator,
    clock: SharedClock,
}

impl std::fmt::Debug for Biller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Biller").finish_non_exhaustive()
    }
}

impl Biller {
    pub const fn new(ledger: Arc<Ledger>, calculator: CostCalculator, clock: SharedClock) -> Self {
        Self {
            ledger,
            calculator,
            clock,
        }
    }

    /// Price and charge one job
    ///
    /// Failures and rejections are reported as unbilled usage before being
    /// returned; the caller has nothing left to do with them.
    pub async fn settle(&self, job: &BillingJob) -> Result<DeductionOutcome, LedgerError> {
        let report = self.calculator.calculate(&job.model, &job.usage).await;
        let cost = report.cost.total;

        let request = DeductionRequest {
            user_id: job.caller.user_id.clone(),
            cost_usd: cost,
            usage: job.usage,
            model: job.model.clone(),
            request_id: job.request_id.clone(),
            api_key_id: Some(job.caller.api_key_id.clone()),
            account_id: Some(job.account_id.clone()),
            is_stream: job.is_stream,
        };

        let result = self.ledger.process_deduction(&request).await;

        match &result {
            Ok(DeductionOutcome::Charged(deduction)) => {
                metrics::record_deduction(deduction.deduction_type.as_ref(), "charged");
                tracing::debug!(
                    request_id = %job.request_id,
                    user_id = %job.caller.user_id,
                    cost = %cost,
                    "{}",
                    deduction.message()
                );
            }
            Ok(outcome @ DeductionOutcome::Rejected(_)) => {
                metrics::record_deduction("none", "rejected");
                report_unbilled(job, cost, &outcome.message());
            }
            Err(e) => {
                metrics::record_deduction("none", "error");
                report_unbilled(job, cost, &e.to_string());
            }
        }

        self.write_request_log(job, cost).await;

        result
    }

    async fn write_request_log(&self, job: &BillingJob, cost: Decimal) {
        let log = RequestLog {
            request_id: job.request_id.clone(),
            user_id: job.caller.user_id.clone(),
            api_key_id: Some(job.caller.api_key_id.clone()),
            account_id: Some(job.account_id.clone()),
            model: job.model.clone(),
            usage: job.usage,
            cost_usd: cost,
            is_stream: job.is_stream,
            status: job.status,
            duration_ms: job.duration_ms,
            created_at: self.clock.now(),
        };

        if let Err(e) = self.ledger.record_request(&log).await {
            tracing::warn!(request_id = %job.request_id, error = %e, "failed to write request log");
        }
    }
}

fn report_unbilled(job: &BillingJob, cost: Decimal, reason: &str) {
    metrics::record_unbilled();
    tracing::error!(
        target: UNBILLED_TARGET,
        request_id = %job.request_id,
        user_id = %job.caller.user_id,
        api_key_id = %job.caller.api_key_id,
        account_id = %job.account_id,
        model = %job.model,
        input_tokens = job.usage.input_tokens,
        output_tokens = job.usage.output_tokens,
        cache_creation_tokens = job.usage.cache_creation_tokens,
        cache_read_tokens = job.usage.cache_read_tokens,
        cost = %cost,
        reason,
        "relayed usage was not billed"
    );
}

/// Sending side of the billing queue, cloned into every request
#[derive(Clone)]
pub struct BillingQueue {
    tx: mpsc::UnboundedSender<BillingJob>,
}

impl BillingQueue {
    /// Start the background biller
    ///
    /// The task drains every queued job and exits once all queue handles
    /// are dropped; await the handle to finish billing before shutdown.
    pub fn spawn(biller: Biller) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(process_jobs(rx, biller));
        (Self { tx }, handle)
    }

    /// Enqueue a job without waiting for it to be charged
    pub fn submit(&self, job: BillingJob) {
        if let Err(e) = self.tx.send(job) {
            let job = e.0;
            report_unbilled(&job, Decimal::ZERO, "billing queue closed");
        }
    }
}

impl std::fmt::Debug for BillingQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BillingQueue").finish_non_exhaustive()
    }
}

async fn process_jobs(mut rx: mpsc::UnboundedReceiver<BillingJob>, biller: Biller) {
    while let Some(job) = rx.recv().await {
        let _ = biller.settle(&job).await;
    }

    tracing::debug!("billing queue drained");
}
