//! Lifecycle tuning knobs.
//!
//! Required values are constructor parameters; everything else defaults and
//! can be overridden with `with_*` methods or
//! [`from_env()`](LifecycleConfig::from_env).

use std::time::Duration;

use crate::error::Error;

/// How the browser-driven variant behaves on first mount.
///
/// A deployment-time choice, not runtime logic. Values mirror the OIDC SDK
/// convention (`check-sso` / `login-required`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InitMode {
    /// Resume only if a session already exists; stay unauthenticated
    /// otherwise.
    CheckExistingSession,
    /// Force a login redirect whenever no session exists.
    #[default]
    RequireLogin,
}

impl std::str::FromStr for InitMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "check-sso" => Ok(Self::CheckExistingSession),
            "login-required" => Ok(Self::RequireLogin),
            other => Err(Error::Config(format!(
                "unknown init mode '{other}' (expected 'check-sso' or 'login-required')"
            ))),
        }
    }
}

/// Bounded retry with exponential backoff.
///
/// An unbounded immediate retry loop is exactly what this type exists to
/// rule out: renewal makes at most `max_attempts` calls, doubling the delay
/// between them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, the first one included. Minimum 1.
    pub max_attempts: u32,
    /// Delay before the second attempt; doubles per subsequent attempt.
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
        }
    }
}

impl RetryPolicy {
    /// Backoff delay after a failed `attempt` (1-based).
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(10);
        self.base_delay.saturating_mul(1 << exponent)
    }
}

/// Session lifecycle configuration.
#[derive(Debug, Clone)]
pub struct LifecycleConfig {
    pub(crate) init_mode: InitMode,
    pub(crate) refresh_lead: Duration,
    pub(crate) retry: RetryPolicy,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            init_mode: InitMode::default(),
            // Renew five seconds before expiry.
            refresh_lead: Duration::from_secs(5),
            retry: RetryPolicy::default(),
        }
    }
}

impl LifecycleConfig {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create config from environment variables.
    ///
    /// # Optional env vars
    /// - `OIDC_INIT_MODE`: `check-sso` or `login-required`
    /// - `OIDC_REFRESH_LEAD_SECS`: proactive renewal margin in seconds
    /// - `OIDC_REFRESH_MAX_ATTEMPTS`: bounded retry attempt count
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if a set variable does not parse.
    pub fn from_env() -> Result<Self, Error> {
        let mut config = Self::default();

        if let Ok(mode) = std::env::var("OIDC_INIT_MODE") {
            config.init_mode = mode.parse()?;
        }
        if let Ok(secs) = std::env::var("OIDC_REFRESH_LEAD_SECS") {
            let secs: u64 = secs
                .parse()
                .map_err(|e| Error::Config(format!("OIDC_REFRESH_LEAD_SECS: {e}")))?;
            config.refresh_lead = Duration::from_secs(secs);
        }
        if let Ok(attempts) = std::env::var("OIDC_REFRESH_MAX_ATTEMPTS") {
            let attempts: u32 = attempts
                .parse()
                .map_err(|e| Error::Config(format!("OIDC_REFRESH_MAX_ATTEMPTS: {e}")))?;
            config.retry.max_attempts = attempts.max(1);
        }

        Ok(config)
    }

    #[must_use]
    pub fn with_init_mode(mut self, mode: InitMode) -> Self {
        self.init_mode = mode;
        self
    }

    #[must_use]
    pub fn with_refresh_lead(mut self, lead: Duration) -> Self {
        self.refresh_lead = lead;
        self
    }

    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    #[must_use]
    pub fn init_mode(&self) -> InitMode {
        self.init_mode
    }

    #[must_use]
    pub fn refresh_lead(&self) -> Duration {
        self.refresh_lead
    }

    #[must_use]
    pub fn retry(&self) -> RetryPolicy {
        self.retry
    }
}
