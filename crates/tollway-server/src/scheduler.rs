//! Periodic maintenance
//!
//! Daily jobs fire at a wall-clock time in the ledger's time zone; sweeps
//! run on fixed intervals. Every job stops when the shutdown token fires.

use std::{sync::Arc, time::Duration};

use jiff::{Timestamp, civil::Time, tz::TimeZone};
use tokio::{task::JoinHandle, time::MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tollway_accounts::AccountManager;
use tollway_config::SchedulerConfig;
use tollway_core::SharedClock;
use tollway_ledger::Ledger;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Job {
    /// Zero `today_used` on time plans whose day has rolled over
    DailyReset,
    /// Drop request logs past the retention window
    LogRetention,
    /// Expire ended plans and lapsed cards
    ExpiryCleanup,
    /// Reinstate accounts whose rate-limit cooldown has passed
    RateLimitSweep,
    /// Refresh access tokens that are about to expire
    TokenRefreshSweep,
}

impl Job {
    pub const fn name(self) -> &'static str {
        match self {
            Self::DailyReset => "daily_reset",
            Self::LogRetention => "log_retention",
            Self::ExpiryCleanup => "expiry_cleanup",
            Self::RateLimitSweep => "rate_limit_sweep",
            Self::TokenRefreshSweep => "token_refresh_sweep",
        }
    }
}

/// Runs ledger and account maintenance in the background
pub struct Scheduler {
    ledger: Arc<Ledger>,
    accounts: Arc<AccountManager>,
    clock: SharedClock,
    timezone: TimeZone,
    config: SchedulerConfig,
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("timezone", &self.timezone)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Scheduler {
    pub const fn new(
        ledger: Arc<Ledger>,
        accounts: Arc<AccountManager>,
        clock: SharedClock,
        timezone: TimeZone,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            ledger,
            accounts,
            clock,
            timezone,
            config,
        }
    }

    pub const fn enabled(&self) -> bool {
        self.config.enabled
    }

    /// Start one task per job
    pub fn spawn(self: Arc<Self>, shutdown: &CancellationToken) -> Vec<JoinHandle<()>> {
        let daily = [
            (Job::DailyReset, self.config.daily_reset_at),
            (Job::LogRetention, self.config.retention_at),
            (Job::ExpiryCleanup, self.config.cleanup_at),
        ];
        let periodic = [
            (Job::RateLimitSweep, self.config.rate_limit_sweep),
            (Job::TokenRefreshSweep, self.config.token_refresh_sweep),
        ];

        let mut handles = Vec::with_capacity(daily.len() + periodic.len());

        for (job, at) in daily {
            let scheduler = Arc::clone(&self);
            let shutdown = shutdown.clone();
            handles.push(tokio::spawn(async move { scheduler.run_daily(job, at, shutdown).await }));
        }

        for (job, every) in periodic {
            let scheduler = Arc::clone(&self);
            let shutdown = shutdown.clone();
            handles.push(tokio::spawn(async move { scheduler.run_every(job, every, shutdown).await }));
        }

        tracing::info!(timezone = ?self.timezone.iana_name(), "maintenance jobs scheduled");
        handles
    }

    async fn run_daily(&self, job: Job, at: Time, shutdown: CancellationToken) {
        loop {
            let wait = match until_next(self.clock.now(), at, &self.timezone) {
                Ok(wait) => wait,
                Err(e) => {
                    tracing::error!(job = job.name(), error = %e, "cannot compute next run, job stopped");
                    return;
                }
            };

            tokio::select! {
                () = shutdown.cancelled() => return,
                () = tokio::time::sleep(wait) => {}
            }

            self.run(job).await;
        }
    }

    async fn run_every(&self, job: Job, every: Duration, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = shutdown.cancelled() => return,
                _ = ticker.tick() => self.run(job).await,
            }
        }
    }

    /// Run one job now, logging its result
    pub async fn run(&self, job: Job) {
        let name = job.name();

        match job {
            Job::DailyReset => match self.ledger.reset_daily_usage().await {
                Ok(reset) => tracing::info!(job = name, reset, "time plan daily usage reset"),
                Err(e) => tracing::error!(job = name, error = %e, "job failed"),
            },
            Job::LogRetention => match self.ledger.purge_request_logs().await {
                Ok(purged) => tracing::info!(job = name, purged, "request logs purged"),
                Err(e) => tracing::error!(job = name, error = %e, "job failed"),
            },
            Job::ExpiryCleanup => match self.ledger.cleanup_expired().await {
                Ok(report) => tracing::info!(
                    job = name,
                    plans_expired = report.plans_expired,
                    cards_expired = report.cards_expired,
                    "expired plans and cards marked"
                ),
                Err(e) => tracing::error!(job = name, error = %e, "job failed"),
            },
            Job::RateLimitSweep => match self.accounts.sweep_rate_limits().await {
                Ok(0) => tracing::debug!(job = name, "no rate limits to clear"),
                Ok(recovered) => tracing::info!(job = name, recovered, "rate-limited accounts reinstated"),
                Err(e) => tracing::error!(job = name, error = %e, "job failed"),
            },
            Job::TokenRefreshSweep => match self.accounts.sweep_token_refresh().await {
                Ok(report) => tracing::debug!(
                    job = name,
                    refreshed = report.refreshed,
                    skipped = report.skipped,
                    failed = report.failed,
                    disabled = report.disabled,
                    "token refresh sweep finished"
                ),
                Err(e) => tracing::error!(job = name, error = %e, "job failed"),
            },
        }
    }
}

/// Time from `now` until the next occurrence of `at` in `tz`
pub fn until_next(now: Timestamp, at: Time, tz: &TimeZone) -> Result<Duration, jiff::Error> {
    let today = now.to_zoned(tz.clone()).date();
    let mut next = today.to_datetime(at).to_zoned(tz.clone())?.timestamp();

    if next <= now {
        next = today.tomorrow()?.to_datetime(at).to_zoned(tz.clone())?.timestamp();
    }

    Ok(Duration::try_from(next.duration_since(now)).unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use rust_decimal_macros::dec;
    use tollway_accounts::{AccountSettings, MemoryAccountStore, OAuthRefresher};
    use tollway_core::ManualClock;
    use tollway_ledger::{LedgerSettings, MemoryLedgerStore, TimeType};

    use super::*;

    fn ts(s: &str) -> Timestamp {
        s.parse().unwrap()
    }

    #[test]
    fn next_run_later_today() {
        let wait = until_next(ts("2025-06-10T10:00:00Z"), Time::constant(12, 0, 0, 0), &TimeZone::UTC).unwrap();
        assert_eq!(wait, Duration::from_secs(2 * 3600));
    }

    #[test]
    fn next_run_rolls_to_tomorrow() {
        let midnight = Time::midnight();
        let wait = until_next(ts("2025-06-10T00:00:00Z"), midnight, &TimeZone::UTC).unwrap();
        assert_eq!(wait, Duration::from_secs(24 * 3600));

        let wait = until_next(ts("2025-06-10T23:59:00Z"), midnight, &TimeZone::UTC).unwrap();
        assert_eq!(wait, Duration::from_secs(60));
    }

    #[test]
    fn next_run_uses_the_ledger_zone() {
        let tz = TimeZone::get("Asia/Shanghai").unwrap();
        // 15:30 UTC is 23:30 in Shanghai, half an hour before local midnight
        let wait = until_next(ts("2025-06-10T15:30:00Z"), Time::midnight(), &tz).unwrap();
        assert_eq!(wait, Duration::from_secs(30 * 60));
    }

    #[tokio::test]
    async fn daily_reset_job_clears_yesterdays_usage() {
        let clock = Arc::new(ManualClock::new(ts("2025-06-10T12:00:00Z")));
        let ledger = Arc::new(Ledger::new(
            Arc::new(MemoryLedgerStore::new()),
            clock.clone(),
            LedgerSettings::default(),
        ));
        let accounts = Arc::new(AccountManager::new(
            Arc::new(MemoryAccountStore::new()),
            Arc::new(OAuthRefresher::new("http://127.0.0.1:1/token".parse().unwrap(), "client".to_string()).unwrap()),
            clock.clone(),
            AccountSettings::default(),
        ));

        ledger.grant_time_plan("alice", TimeType::Monthly, 10, 30).await.unwrap();
        ledger.recharge_balance("alice", dec!(1), "top up", None).await.unwrap();
        let request = tollway_ledger::DeductionRequest {
            user_id: "alice".to_string(),
            cost_usd: dec!(0.01),
            usage: tollway_core::TokenUsage {
                input_tokens: 10,
                ..Default::default()
            },
            model: "claude-sonnet-4".to_string(),
            request_id: "req-1".to_string(),
            api_key_id: None,
            account_id: None,
            is_stream: true,
        };
        ledger.process_deduction(&request).await.unwrap();

        clock.advance(jiff::SignedDuration::from_hours(24));
        let scheduler = Scheduler::new(
            ledger.clone(),
            accounts,
            clock.clone(),
            TimeZone::UTC,
            SchedulerConfig::default(),
        );
        scheduler.run(Job::DailyReset).await;

        let stats = ledger.user_stats("alice").await.unwrap();
        assert_eq!(stats.active_time_plans[0].today_used, 0);
        assert_eq!(stats.balance, dec!(1));
    }

    #[tokio::test]
    async fn periodic_jobs_stop_on_shutdown() {
        let clock = Arc::new(ManualClock::new(ts("2025-06-10T12:00:00Z")));
        let ledger = Arc::new(Ledger::new(
            Arc::new(MemoryLedgerStore::new()),
            clock.clone(),
            LedgerSettings::default(),
        ));
        let accounts = Arc::new(AccountManager::new(
            Arc::new(MemoryAccountStore::new()),
            Arc::new(OAuthRefresher::new("http://127.0.0.1:1/token".parse().unwrap(), "client".to_string()).unwrap()),
            clock.clone(),
            AccountSettings::default(),
        ));
        let scheduler = Arc::new(Scheduler::new(ledger, accounts, clock, TimeZone::UTC, SchedulerConfig::default()));

        let shutdown = CancellationToken::new();
        let handles = scheduler.spawn(&shutdown);
        shutdown.cancel();

        for handle in handles {
            tokio::time::timeout(Duration::from_secs(5), handle).await.unwrap().unwrap();
        }
    }
}
