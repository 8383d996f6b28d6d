//! Cascading sliding-window admission control.
//!
//! A key is admitted when every configured window admits it. Each call records
//! a ticket in every window before deciding, so a client that keeps hammering
//! while rejected keeps its windows full instead of dropping out of the
//! ledger.

use std::{fmt, ops::Deref, str::FromStr, sync::Arc};

use async_trait::async_trait;

use crate::{BitswarmError, WindowLimit, WindowSizeSeconds};

/// One sliding window: at most `limit` admissions per `window_size_seconds`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitWindow {
    /// Window length.
    pub window_size_seconds: WindowSizeSeconds,
    /// Admissions allowed inside the window.
    pub limit: WindowLimit,
}

impl RateLimitWindow {
    /// Build a window from raw values.
    pub fn new(limit: u64, window_size_seconds: u64) -> Result<Self, BitswarmError> {
        Ok(Self {
            window_size_seconds: WindowSizeSeconds::try_from(window_size_seconds)?,
            limit: WindowLimit::try_from(limit)?,
        })
    }

    /// Tickets a ledger must keep to decide this window exactly.
    ///
    /// Counts above `limit + 1` reject the same way, so older tickets can be
    /// dropped without changing any decision.
    pub fn retained_tickets(&self) -> u64 {
        self.limit.saturating_add(1)
    }
}

impl fmt::Display for RateLimitWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", *self.limit, *self.window_size_seconds)
    }
}

impl FromStr for RateLimitWindow {
    type Err = BitswarmError;

    /// Parse `limit/seconds`, e.g. `7/1`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let Some((limit, seconds)) = s.trim().split_once('/') else {
            return Err(BitswarmError::InvalidWindowSize(format!(
                "expected `limit/seconds`, got `{s}`"
            )));
        };

        let limit = limit
            .trim()
            .parse::<u64>()
            .map_err(|err| BitswarmError::InvalidWindowLimit(format!("{limit}: {err}")))?;
        let seconds = seconds
            .trim()
            .parse::<u64>()
            .map_err(|err| BitswarmError::InvalidWindowSize(format!("{seconds}: {err}")))?;

        Self::new(limit, seconds)
    }
}

/// The full set of windows applied to every key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitWindows(Vec<RateLimitWindow>);

impl RateLimitWindows {
    /// Wrap a list of windows. An empty list admits everything.
    pub fn new(windows: Vec<RateLimitWindow>) -> Self {
        Self(windows)
    }

    /// Longest configured window in milliseconds.
    pub fn longest_ms(&self) -> u64 {
        self.0
            .iter()
            .map(|w| w.window_size_seconds.as_millis())
            .max()
            .unwrap_or(0)
    }
}

impl Default for RateLimitWindows {
    /// 7 per second for bursts, 80 per 15 seconds and 240 per minute for
    /// sustained abuse.
    fn default() -> Self {
        Self(
            [(7, 1), (80, 15), (240, 60)]
                .into_iter()
                .map(|(limit, seconds)| RateLimitWindow {
                    window_size_seconds: WindowSizeSeconds(seconds),
                    limit: WindowLimit(limit),
                })
                .collect(),
        )
    }
}

impl Deref for RateLimitWindows {
    type Target = [RateLimitWindow];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl FromStr for RateLimitWindows {
    type Err = BitswarmError;

    /// Parse a comma separated list such as `7/1,80/15,240/60`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.split(',')
            .filter(|part| !part.trim().is_empty())
            .map(RateLimitWindow::from_str)
            .collect::<Result<Vec<_>, _>>()
            .map(Self)
    }
}

/// Outcome of an admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitDecision {
    /// Every window admitted the call.
    Allowed,
    /// At least one window is over its limit.
    Rejected {
        /// Size of the first rejecting window.
        window_size_seconds: u64,
        /// Limit of that window.
        limit: u64,
        /// Tickets seen in that window, this call included. Saturates at
        /// `limit + 1`.
        observed: u64,
    },
}

/// Ticket storage behind the rate limiter.
#[async_trait]
pub trait TicketLedger: Send + Sync {
    /// Record one ticket for `key` in every window, prune expired tickets and
    /// return the remaining ticket count per window, in `windows` order.
    async fn record(
        &self,
        key: &str,
        windows: &RateLimitWindows,
    ) -> Result<Vec<u64>, BitswarmError>;

    /// Drop state for keys idle for longer than `stale_after_ms`.
    async fn cleanup(&self, stale_after_ms: u64) -> Result<(), BitswarmError>;
}

/// Sliding-window rate limiter evaluating every configured window.
#[derive(Clone)]
pub struct RateLimiter {
    ledger: Arc<dyn TicketLedger>,
    windows: RateLimitWindows,
}

impl RateLimiter {
    /// Create a limiter over `ledger`.
    pub fn new(ledger: Arc<dyn TicketLedger>, windows: RateLimitWindows) -> Self {
        Self { ledger, windows }
    }

    /// Record a ticket for `key` and decide whether it is admitted.
    ///
    /// Unknown keys start from an empty ledger. Store failures are returned to
    /// the caller rather than treated as an admission.
    pub async fn is_allowed(&self, key: &str) -> Result<RateLimitDecision, BitswarmError> {
        if self.windows.is_empty() {
            return Ok(RateLimitDecision::Allowed);
        }

        let counts = self.ledger.record(key, &self.windows).await?;

        for (window, observed) in self.windows.iter().zip(counts) {
            if observed > *window.limit {
                return Ok(RateLimitDecision::Rejected {
                    window_size_seconds: *window.window_size_seconds,
                    limit: *window.limit,
                    observed,
                });
            }
        }

        Ok(RateLimitDecision::Allowed)
    }

    /// Configured windows.
    pub fn windows(&self) -> &RateLimitWindows {
        &self.windows
    }

    pub(crate) fn ledger(&self) -> &Arc<dyn TicketLedger> {
        &self.ledger
    }
}
