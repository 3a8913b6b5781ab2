//! # Concurrency Governor
//!
//! Feedback controller for the worker count. Workers report 429s while a
//! sweep runs; at the next sweep boundary the governor compares the count
//! with the window size:
//!
//! - above `window * high_watermark`: halve, floored at `min_workers`
//! - below `window * low_watermark`: double, capped at `max_workers`
//! - otherwise, including exactly on a watermark: unchanged
//!
//! The counter is reset at every boundary whatever the decision.

use std::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GovernorState {
    pub worker_count: usize,
    pub rate_limit_errors: u64,
}

pub struct ConcurrencyGovernor {
    min_workers: usize,
    max_workers: usize,
    high_watermark: f64,
    low_watermark: f64,
    state: Mutex<GovernorState>,
}

impl ConcurrencyGovernor {
    /// `initial` is clamped into `[min_workers, max_workers]`.
    pub fn new(min_workers: usize, max_workers: usize, initial: usize, high_watermark: f64, low_watermark: f64) -> Self {
        Self {
            min_workers,
            max_workers,
            high_watermark,
            low_watermark,
            state: Mutex::new(GovernorState {
                worker_count: initial.clamp(min_workers, max_workers),
                rate_limit_errors: 0,
            }),
        }
    }

    /// Called by a worker that observed a 429.
    pub fn record_rate_limit(&self) {
        self.state.lock().expect("governor lock poisoned").rate_limit_errors += 1;
    }

    pub fn snapshot(&self) -> GovernorState {
        *self.state.lock().expect("governor lock poisoned")
    }

    pub fn worker_count(&self) -> usize {
        self.snapshot().worker_count
    }

    /// Applies the decision rule to `errors_observed` and stores the result.
    pub fn decide(&self, errors_observed: u64, window_size: u64) -> usize {
        let mut state = self.state.lock().expect("governor lock poisoned");
        let next = self.next_count(state.worker_count, errors_observed, window_size);
        if next != state.worker_count {
            tracing::info!(
                from = state.worker_count,
                to = next,
                rate_limited = errors_observed,
                window = window_size,
                "worker pool resized"
            );
        }
        state.worker_count = next;
        next
    }

    /// Sweep boundary: consumes the previous sweep's 429 count, resets it
    /// and returns the worker count for the next sweep.
    pub fn rebalance(&self, window_size: u64) -> usize {
        let errors = {
            let mut state = self.state.lock().expect("governor lock poisoned");
            std::mem::take(&mut state.rate_limit_errors)
        };
        self.decide(errors, window_size)
    }

    fn next_count(&self, current: usize, errors: u64, window_size: u64) -> usize {
        let errors = errors as f64;
        let window = window_size as f64;

        if errors > window * self.high_watermark {
            (current / 2).max(self.min_workers)
        } else if errors < window * self.low_watermark {
            current.saturating_mul(2).min(self.max_workers)
        } else {
            current
        }
    }
}
