//! Engine counters: cheap atomics bumped on hot paths, snapshotted for
//! status queries and tests.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

#[derive(Default)]
pub struct Counters {
    idempotency_hits: AtomicU64,
    provider_errors: AtomicU64,
    outbound_dropped: AtomicU64,
    subagent_retries: AtomicU64,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub struct CountersSnapshot {
    pub idempotency_hits: u64,
    pub provider_errors: u64,
    pub outbound_dropped: u64,
    pub subagent_retries: u64,
}

impl Counters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn idempotency_hit(&self) {
        self.idempotency_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn provider_error(&self) {
        self.provider_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn outbound_drop(&self) {
        self.outbound_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn subagent_retry(&self) {
        self.subagent_retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CountersSnapshot {
        CountersSnapshot {
            idempotency_hits: self.idempotency_hits.load(Ordering::Relaxed),
            provider_errors: self.provider_errors.load(Ordering::Relaxed),
            outbound_dropped: self.outbound_dropped.load(Ordering::Relaxed),
            subagent_retries: self.subagent_retries.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let counters = Counters::new();
        counters.idempotency_hit();
        counters.idempotency_hit();
        counters.provider_error();
        counters.outbound_drop();

        let snap = counters.snapshot();
        assert_eq!(snap.idempotency_hits, 2);
        assert_eq!(snap.provider_errors, 1);
        assert_eq!(snap.outbound_dropped, 1);
        assert_eq!(snap.subagent_retries, 0);
    }
}
