//! # Probe Outcomes and Retry Policy
//!
//! Every candidate ID examined during a sweep resolves to exactly one
//! [`ProbeOutcome`]. Per-ID failures never travel as errors; the aggregator
//! only ever sees outcomes.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::catalog::model::ListedItem;

/// Which allow-set rejected a listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterReason {
    Country,
    Size,
    Brand,
}

/// Tagged result of examining one candidate ID.
#[derive(Debug, Clone)]
pub enum ProbeOutcome {
    /// Already in the ledger; no request was made.
    AlreadySeen,
    /// 404, or a success envelope with a non-zero status code.
    NotFound,
    /// 429. Counted toward governor pressure, left eligible for later sweeps.
    RateLimited,
    /// 401 that survived one session refresh and retry.
    AuthExpired,
    /// Timeout, connection failure, 5xx or an undecodable body.
    Unresolved,
    /// Present but outside the subscriber allow-sets. Terminal.
    FilteredOut(FilterReason),
    /// Present and allowed, but last updated too long ago. Terminal.
    Stale,
    /// Present, allowed and fresh.
    Matched(Arc<ListedItem>),
}

impl ProbeOutcome {
    /// Outcomes that neither terminate nor match. These feed the early-exit
    /// run counter.
    pub fn is_unresolved(&self) -> bool {
        matches!(
            self,
            ProbeOutcome::NotFound
                | ProbeOutcome::RateLimited
                | ProbeOutcome::AuthExpired
                | ProbeOutcome::Unresolved
        )
    }

    /// Outcomes after which the ID never needs probing again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ProbeOutcome::FilteredOut(_) | ProbeOutcome::Stale | ProbeOutcome::Matched(_)
        )
    }

    pub fn label(&self) -> &'static str {
        match self {
            ProbeOutcome::AlreadySeen => "already_seen",
            ProbeOutcome::NotFound => "not_found",
            ProbeOutcome::RateLimited => "rate_limited",
            ProbeOutcome::AuthExpired => "auth_expired",
            ProbeOutcome::Unresolved => "unresolved",
            ProbeOutcome::FilteredOut(_) => "filtered_out",
            ProbeOutcome::Stale => "stale",
            ProbeOutcome::Matched(_) => "matched",
        }
    }
}

impl fmt::Display for ProbeOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Coarse classification of a failed attempt, used by [`RetryPolicy`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    Auth,
    RateLimited,
    Transient,
}

/// Explicit retry policy passed to the call site instead of wrapping calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    /// Pause between attempts.
    pub delay: Duration,
    pub retry_auth: bool,
    pub retry_rate_limited: bool,
    pub retry_transient: bool,
}

impl RetryPolicy {
    /// Item probes: a 401 earns one refresh and one more attempt, nothing
    /// else is retried within the sweep.
    pub const fn item_probe() -> Self {
        Self {
            max_attempts: 2,
            delay: Duration::ZERO,
            retry_auth: true,
            retry_rate_limited: false,
            retry_transient: false,
        }
    }

    /// Anchor fetches: every failure class is retried up to `max_attempts`.
    pub const fn anchor_fetch(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            delay,
            retry_auth: true,
            retry_rate_limited: true,
            retry_transient: true,
        }
    }

    /// Whether another attempt is allowed after `attempts_made` attempts
    /// ended in a failure of class `class`.
    pub fn should_retry(&self, attempts_made: u32, class: FailureClass) -> bool {
        let retryable = match class {
            FailureClass::Auth => self.retry_auth,
            FailureClass::RateLimited => self.retry_rate_limited,
            FailureClass::Transient => self.retry_transient,
        };
        retryable && attempts_made < self.max_attempts
    }
}
