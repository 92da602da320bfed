//! Rate limiting for sensitive, replayable operations.
//!
//! Two policies share one mechanism, a fixed window per identifier:
//!
//! - [`RateLimiter::check_limit`] refuses once the window's budget is spent
//!   and starts a fresh window when the old one ends.
//! - [`RateLimiter::check_login_limit`] additionally blocks the identifier
//!   for a longer period once the budget is exceeded. A successful login
//!   calls [`RateLimiter::reset`] to clear the entry early.
//!
//! Refusals are values, never errors. Every check has an `_at` variant that
//! takes the current time in unix milliseconds.

use crate::sweeper::spawn_periodic;
use crate::unix_millis;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Key namespace for the generic counter.
const LIMIT_PREFIX: &str = "limit:";

/// Key namespace for the login counter.
const LOGIN_PREFIX: &str = "login:";

/// Default cleanup interval.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Budget for the fixed-window counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LimitPolicy {
    /// Requests allowed per window.
    pub max: u32,
    /// Window length.
    pub window: Duration,
}

impl LimitPolicy {
    /// Password change operations: 5 per 15 minutes.
    pub const PASSWORD_OPERATION: LimitPolicy = LimitPolicy {
        max: 5,
        window: Duration::from_secs(15 * 60),
    };

    /// Credential decryption: 10 per hour.
    pub const PASSWORD_DECRYPT: LimitPolicy = LimitPolicy {
        max: 10,
        window: Duration::from_secs(60 * 60),
    };
}

/// Budget and lockout for the login counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoginPolicy {
    /// Attempts allowed per window.
    pub max: u32,
    /// Window length.
    pub window: Duration,
    /// Lockout after the budget is exceeded; never shorter than `window`.
    pub block: Duration,
}

impl LoginPolicy {
    /// 5 attempts per 15 minutes, then a 30 minute block.
    pub const DEFAULT: LoginPolicy = LoginPolicy {
        max: 5,
        window: Duration::from_secs(15 * 60),
        block: Duration::from_secs(30 * 60),
    };
}

impl Default for LoginPolicy {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// Per-identifier counter state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitEntry {
    /// Requests counted in the current window.
    pub count: u32,
    /// End of the current window, unix milliseconds.
    pub reset_at: u64,
    /// End of the lockout, unix milliseconds.
    pub blocked_until: Option<u64>,
}

impl RateLimitEntry {
    fn fresh(now: u64, window: Duration) -> Self {
        Self {
            count: 1,
            reset_at: now.saturating_add(window.as_millis() as u64),
            blocked_until: None,
        }
    }

    fn is_blocked_at(&self, now: u64) -> bool {
        self.blocked_until.is_some_and(|until| now < until)
    }
}

/// Outcome of a fixed-window check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitDecision {
    pub allowed: bool,
    /// Requests left in the window.
    pub remaining: u32,
    /// End of the window, unix milliseconds.
    pub reset_at: u64,
}

impl RateLimitDecision {
    /// Time the caller should wait before retrying, measured from `now_ms`.
    #[must_use]
    pub fn retry_after(&self, now_ms: u64) -> Duration {
        if self.allowed {
            Duration::ZERO
        } else {
            Duration::from_millis(self.reset_at.saturating_sub(now_ms))
        }
    }
}

/// Outcome of a login check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoginDecision {
    pub allowed: bool,
    /// Attempts left in the window.
    pub remaining: u32,
    /// End of the window, unix milliseconds.
    pub reset_at: u64,
    /// End of the lockout, unix milliseconds.
    pub blocked_until: Option<u64>,
    pub is_blocked: bool,
}

impl LoginDecision {
    /// Time the caller should wait before retrying, measured from `now_ms`.
    #[must_use]
    pub fn retry_after(&self, now_ms: u64) -> Duration {
        if self.allowed {
            return Duration::ZERO;
        }
        let until = self.blocked_until.unwrap_or(self.reset_at);
        Duration::from_millis(until.saturating_sub(now_ms))
    }
}

/// Mask an identifier for logging: first three characters, then `***`.
#[must_use]
pub fn mask_identifier(identifier: &str) -> String {
    if identifier.chars().count() <= 3 {
        return "***".to_string();
    }
    let prefix: String = identifier.chars().take(3).collect();
    format!("{prefix}***")
}

/// In-memory rate limiter.
#[derive(Debug, Default)]
pub struct RateLimiter {
    entries: DashMap<String, RateLimitEntry>,
}

impl RateLimiter {
    /// Create an empty limiter.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Check and count one request against a fixed window.
    pub fn check_limit(&self, identifier: &str, max: u32, window: Duration) -> RateLimitDecision {
        self.check_limit_at(identifier, max, window, unix_millis())
    }

    /// Check and count one request against a policy.
    pub fn check_policy(&self, identifier: &str, policy: LimitPolicy) -> RateLimitDecision {
        self.check_limit(identifier, policy.max, policy.window)
    }

    /// [`Self::check_limit`] at an explicit time.
    pub fn check_limit_at(
        &self,
        identifier: &str,
        max: u32,
        window: Duration,
        now: u64,
    ) -> RateLimitDecision {
        let key = format!("{LIMIT_PREFIX}{identifier}");
        if max == 0 {
            return RateLimitDecision {
                allowed: false,
                remaining: 0,
                reset_at: self.entries.get(&key).map_or(now, |entry| entry.reset_at),
            };
        }

        let mut entry = self
            .entries
            .entry(key)
            .or_insert_with(|| RateLimitEntry {
                count: 0,
                reset_at: 0,
                blocked_until: None,
            });

        if entry.count == 0 || now > entry.reset_at {
            *entry = RateLimitEntry::fresh(now, window);
            return RateLimitDecision {
                allowed: true,
                remaining: max - 1,
                reset_at: entry.reset_at,
            };
        }

        if entry.count >= max {
            warn!(
                identifier = %mask_identifier(identifier),
                reset_at = entry.reset_at,
                "Rate limit exceeded"
            );
            return RateLimitDecision {
                allowed: false,
                remaining: 0,
                reset_at: entry.reset_at,
            };
        }

        entry.count += 1;
        RateLimitDecision {
            allowed: true,
            remaining: max - entry.count,
            reset_at: entry.reset_at,
        }
    }

    /// Check and count one login attempt.
    pub fn check_login_limit(
        &self,
        identifier: &str,
        max: u32,
        window: Duration,
        block: Duration,
    ) -> LoginDecision {
        self.check_login_limit_at(identifier, max, window, block, unix_millis())
    }

    /// Check and count one login attempt against a policy.
    pub fn check_login_policy(&self, identifier: &str, policy: LoginPolicy) -> LoginDecision {
        self.check_login_limit(identifier, policy.max, policy.window, policy.block)
    }

    /// [`Self::check_login_limit`] at an explicit time.
    pub fn check_login_limit_at(
        &self,
        identifier: &str,
        max: u32,
        window: Duration,
        block: Duration,
        now: u64,
    ) -> LoginDecision {
        let block = if block < window {
            debug!(
                block_ms = block.as_millis() as u64,
                window_ms = window.as_millis() as u64,
                "Login block shorter than window, using window"
            );
            window
        } else {
            block
        };

        let key = format!("{LOGIN_PREFIX}{identifier}");
        if max == 0 {
            let existing = self.entries.get(&key).map(|entry| *entry);
            let blocked_until = existing
                .filter(|entry| entry.is_blocked_at(now))
                .and_then(|entry| entry.blocked_until);
            return LoginDecision {
                allowed: false,
                remaining: 0,
                reset_at: existing.map_or(now, |entry| entry.reset_at),
                blocked_until,
                is_blocked: blocked_until.is_some(),
            };
        }

        let mut entry = self
            .entries
            .entry(key)
            .or_insert_with(|| RateLimitEntry {
                count: 0,
                reset_at: 0,
                blocked_until: None,
            });

        if entry.is_blocked_at(now) {
            return LoginDecision {
                allowed: false,
                remaining: 0,
                reset_at: entry.reset_at,
                blocked_until: entry.blocked_until,
                is_blocked: true,
            };
        }

        // An expired lockout starts over from zero.
        if entry.blocked_until.is_some() {
            entry.blocked_until = None;
            entry.count = 0;
        }

        if entry.count == 0 || now > entry.reset_at {
            *entry = RateLimitEntry::fresh(now, window);
            return LoginDecision {
                allowed: true,
                remaining: max - 1,
                reset_at: entry.reset_at,
                blocked_until: None,
                is_blocked: false,
            };
        }

        if entry.count >= max {
            let until = now.saturating_add(block.as_millis() as u64);
            entry.blocked_until = Some(until);
            warn!(
                identifier = %mask_identifier(identifier),
                blocked_until = until,
                "Login attempts exceeded, identifier blocked"
            );
            return LoginDecision {
                allowed: false,
                remaining: 0,
                reset_at: entry.reset_at,
                blocked_until: Some(until),
                is_blocked: true,
            };
        }

        entry.count += 1;
        LoginDecision {
            allowed: true,
            remaining: max - entry.count,
            reset_at: entry.reset_at,
            blocked_until: None,
            is_blocked: false,
        }
    }

    /// Clear an identifier's login counter and lockout after a successful login.
    pub fn reset(&self, identifier: &str) {
        if self
            .entries
            .remove(&format!("{LOGIN_PREFIX}{identifier}"))
            .is_some()
        {
            debug!(identifier = %mask_identifier(identifier), "Login rate limit reset");
        }
    }

    /// Get the number of tracked entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check whether no identifiers are tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop entries whose window has ended and which are not blocked.
    ///
    /// Returns the number of entries removed.
    pub fn sweep(&self) -> usize {
        self.sweep_at(unix_millis())
    }

    /// [`Self::sweep`] at an explicit time.
    pub fn sweep_at(&self, now: u64) -> usize {
        let before = self.entries.len();
        self.entries
            .retain(|_, entry| now <= entry.reset_at || entry.is_blocked_at(now));
        let removed = before.saturating_sub(self.entries.len());
        if removed > 0 {
            debug!(removed, "Swept expired rate limit entries");
        }
        removed
    }

    /// Run [`Self::sweep`] every `every` until cancelled.
    pub fn spawn_sweeper(
        self: &Arc<Self>,
        every: Duration,
        token: CancellationToken,
    ) -> JoinHandle<()> {
        let limiter = Arc::clone(self);
        spawn_periodic("rate-limit-sweep", every, token, move || {
            let limiter = limiter.clone();
            async move {
                limiter.sweep();
            }
        })
    }
}
