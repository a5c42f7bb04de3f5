//! Upstream account records

use jiff::{SignedDuration, Timestamp};
use secrecy::{ExposeSecret, SecretString};
use tollway_config::AccountSeed;

/// Operational state of an upstream account
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::AsRefStr, strum::EnumString, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum AccountStatus {
    Active,
    /// Provider refused service until `rate_limit_end`
    RateLimited,
    /// Credentials are unusable; only an operator can bring it back
    Disabled,
}

/// Credential set used to call the upstream provider
#[derive(Debug, Clone)]
pub struct UpstreamAccount {
    pub id: String,
    pub name: String,
    pub access_token: SecretString,
    pub refresh_token: Option<SecretString>,
    /// Access token expiry as Unix seconds, 0 when unknown
    pub expires_at: i64,
    pub status: AccountStatus,
    pub rate_limit_end: Option<Timestamp>,
    pub last_used_at: Option<Timestamp>,
}

impl UpstreamAccount {
    pub fn from_seed(seed: &AccountSeed) -> Self {
        Self {
            id: seed.id.clone(),
            name: seed.name.clone().unwrap_or_else(|| seed.id.clone()),
            access_token: seed.access_token.clone(),
            refresh_token: seed.refresh_token.clone(),
            expires_at: seed.expires_at,
            status: AccountStatus::Active,
            rate_limit_end: None,
            last_used_at: None,
        }
    }

    /// Usable now, counting a rate limit whose cooldown has passed as usable
    pub fn is_schedulable(&self, now: Timestamp) -> bool {
        match self.status {
            AccountStatus::Active => true,
            AccountStatus::RateLimited => self.cooldown_elapsed(now),
            AccountStatus::Disabled => false,
        }
    }

    pub fn cooldown_elapsed(&self, now: Timestamp) -> bool {
        self.rate_limit_end.is_some_and(|end| now > end)
    }

    pub fn has_access_token(&self) -> bool {
        !self.access_token.expose_secret().is_empty()
    }

    pub fn has_refresh_token(&self) -> bool {
        self.refresh_token
            .as_ref()
            .is_some_and(|token| !token.expose_secret().is_empty())
    }

    /// Whether the access token expires within `window` of `now`
    ///
    /// Always false when the expiry is unknown.
    pub fn expires_within(&self, now: Timestamp, window: SignedDuration) -> bool {
        self.expires_at > 0 && now.as_second() >= self.expires_at.saturating_sub(window.as_secs())
    }

    pub fn is_expired(&self, now: Timestamp) -> bool {
        self.expires_at > 0 && now.as_second() >= self.expires_at
    }
}

/// Tokens written back after a successful refresh
#[derive(Debug, Clone)]
pub struct TokenUpdate {
    pub access_token: SecretString,
    pub refresh_token: Option<SecretString>,
    pub expires_at: i64,
}

/// Mask a credential for logging, keeping the first and last four characters
pub fn mask_token(token: &str) -> String {
    let chars: Vec<char> = token.chars().collect();
    if chars.len() <= 8 {
        return "*".repeat(chars.len());
    }

    let head: String = chars[..4].iter().collect();
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{head}...{tail}")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn account(expires_at: i64) -> UpstreamAccount {
        UpstreamAccount {
            id: "a1".to_string(),
            name: "a1".to_string(),
            access_token: SecretString::from("tok"),
            refresh_token: None,
            expires_at,
            status: AccountStatus::Active,
            rate_limit_end: None,
            last_used_at: None,
        }
    }

    #[test]
    fn masks_long_and_short_tokens() {
        assert_eq!(mask_token("sk-ant-oat01-abcdefgh"), "sk-a...efgh");
        assert_eq!(mask_token("short"), "*****");
        assert_eq!(mask_token(""), "");
    }

    #[test]
    fn expiry_window() {
        let now = Timestamp::from_second(1_000_000).unwrap();
        let window = SignedDuration::from_mins(5);

        assert!(!account(0).expires_within(now, window));
        assert!(!account(0).is_expired(now));
        assert!(account(1_000_000 + 299).expires_within(now, window));
        assert!(!account(1_000_000 + 301).expires_within(now, window));
        assert!(account(1_000_000).is_expired(now));
        assert!(!account(1_000_001).is_expired(now));
    }

    #[test]
    fn rate_limited_account_is_schedulable_after_cooldown() {
        let end = Timestamp::from_second(2_000).unwrap();
        let limited = UpstreamAccount {
            status: AccountStatus::RateLimited,
            rate_limit_end: Some(end),
            ..account(0)
        };

        assert!(!limited.is_schedulable(end));
        assert!(limited.is_schedulable(Timestamp::from_second(2_001).unwrap()));

        let disabled = UpstreamAccount {
            status: AccountStatus::Disabled,
            ..account(0)
        };
        assert!(!disabled.is_schedulable(end));
    }
}
