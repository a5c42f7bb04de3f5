use std::time::Duration;

use jiff::civil::Time;
use serde::Deserialize;

/// Periodic maintenance jobs run in-process
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SchedulerConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Local time of the daily time-plan reset
    #[serde(default = "default_daily_reset_at")]
    pub daily_reset_at: Time,
    /// Local time of the request-log retention job
    #[serde(default = "default_retention_at")]
    pub retention_at: Time,
    /// Local time of the plan and card expiry job
    #[serde(default = "default_cleanup_at")]
    pub cleanup_at: Time,
    /// Interval of the rate-limit expiry sweep
    #[serde(default = "default_sweep_interval", deserialize_with = "duration_str::deserialize_duration")]
    pub rate_limit_sweep: Duration,
    /// Interval of the proactive token refresh sweep
    #[serde(default = "default_sweep_interval", deserialize_with = "duration_str::deserialize_duration")]
    pub token_refresh_sweep: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            daily_reset_at: default_daily_reset_at(),
            retention_at: default_retention_at(),
            cleanup_at: default_cleanup_at(),
            rate_limit_sweep: default_sweep_interval(),
            token_refresh_sweep: default_sweep_interval(),
        }
    }
}

#[allow(clippy::missing_const_for_fn)]
fn default_enabled() -> bool {
    true
}

const fn default_daily_reset_at() -> Time {
    Time::constant(0, 0, 0, 0)
}

const fn default_retention_at() -> Time {
    Time::constant(1, 0, 0, 0)
}

const fn default_cleanup_at() -> Time {
    Time::constant(2, 0, 0, 0)
}

const fn default_sweep_interval() -> Duration {
    Duration::from_secs(10 * 60)
}
