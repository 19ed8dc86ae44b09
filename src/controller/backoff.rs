//! Per-curator requeue backoff for failed reconciles

use std::time::Duration;

use dashmap::DashMap;

use crate::crd::CuratorRef;

/// Exponential requeue delay keyed by curator identity
///
/// The delay for the n-th consecutive failure is `base * 2^(n-1)`, capped at
/// `max`. A successful reconcile forgets the identity.
#[derive(Debug)]
pub struct ErrorBackoff {
    base: Duration,
    max: Duration,
    failures: DashMap<CuratorRef, u32>,
}

impl ErrorBackoff {
    /// Create a backoff with the given bounds
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            failures: DashMap::new(),
        }
    }

    /// Record a failure for `curator` and return how long to wait before retrying
    pub fn next_delay(&self, curator: &CuratorRef) -> Duration {
        let mut count = self.failures.entry(curator.clone()).or_insert(0);
        let previous = *count;
        *count = previous.saturating_add(1);
        let exponent = previous.min(31);

        drop(count);

        self.base
            .checked_mul(1u32 << exponent)
            .map_or(self.max, |d| d.min(self.max))
    }

    /// Forget past failures of `curator`
    pub fn reset(&self, curator: &CuratorRef) {
        self.failures.remove(curator);
    }

    /// Consecutive failures currently recorded for `curator`
    pub fn failures(&self, curator: &CuratorRef) -> u32 {
        self.failures.get(curator).map_or(0, |c| *c)
    }
}
