//! Per-script rate limiting for API script execution.
//!
//! Each API script carries its own quota (count + window) on the script
//! record, so unlike a fixed-action limiter the limit is supplied per
//! call. Keys are script names.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{Duration, Instant};

/// Result of a rate limit check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RateLimitResult {
    /// The call is allowed and has been recorded.
    Allowed,
    /// The call is denied; nothing was recorded.
    Denied {
        /// Time until the oldest call in the window expires.
        retry_after: Duration,
    },
}

impl RateLimitResult {
    pub fn is_allowed(&self) -> bool {
        matches!(self, RateLimitResult::Allowed)
    }
}

/// Sliding-window rate limiter keyed by script name.
///
/// `check_and_record` is atomic across concurrent callers sharing the
/// same script name: the window is inspected and the call recorded under
/// a single write lock.
#[derive(Debug, Default)]
pub struct ScriptRateLimiter {
    calls: RwLock<HashMap<String, Vec<Instant>>>,
}

impl ScriptRateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Check the quota for `name` and record the call if allowed.
    ///
    /// Returns `Denied` without recording when `max_calls` calls already
    /// happened within `window`.
    pub fn check_and_record(
        &self,
        name: &str,
        max_calls: u32,
        window: Duration,
    ) -> RateLimitResult {
        let mut calls = self.calls.write().unwrap();
        let timestamps = calls.entry(name.to_string()).or_default();

        if let Some(cutoff) = window_cutoff(window) {
            timestamps.retain(|&t| t > cutoff);
        }

        if timestamps.len() >= max_calls as usize {
            let retry_after = timestamps
                .iter()
                .min()
                .map(|oldest| window.saturating_sub(oldest.elapsed()))
                .unwrap_or(Duration::ZERO);
            return RateLimitResult::Denied { retry_after };
        }

        timestamps.push(Instant::now());
        RateLimitResult::Allowed
    }

    /// Remaining calls for `name` within the window.
    pub fn remaining(&self, name: &str, max_calls: u32, window: Duration) -> u32 {
        let calls = self.calls.read().unwrap();
        let cutoff = window_cutoff(window);
        let used = calls
            .get(name)
            .map(|ts| {
                ts.iter()
                    .filter(|&&t| cutoff.map_or(true, |c| t > c))
                    .count()
            })
            .unwrap_or(0);
        max_calls.saturating_sub(used as u32)
    }

    /// Drop expired entries for all scripts. Call periodically to free
    /// memory; window is the longest window in use.
    pub fn cleanup(&self, window: Duration) {
        let mut calls = self.calls.write().unwrap();
        if let Some(cutoff) = window_cutoff(window) {
            for timestamps in calls.values_mut() {
                timestamps.retain(|&t| t > cutoff);
            }
        }
        calls.retain(|_, timestamps| !timestamps.is_empty());
    }
}

/// Start of the current window. `None` when the monotonic clock has not
/// been running for a full window yet, in which case nothing can have
/// expired.
fn window_cutoff(window: Duration) -> Option<Instant> {
    Instant::now().checked_sub(window)
}
