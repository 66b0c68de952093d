//! The ingress-wide request-memory admission budget.
//!
//! A single `AtomicI64` counter tracks bytes currently committed to
//! in-flight request bodies. Admission is checked against half of
//! `RequestMemoryLimit` — the other half is slack for bodies whose size
//! isn't known up front and must be capped mid-stream instead.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

/// The shared counter plus its configured limit.
pub struct RequestMemoryBudget {
    limit_bytes: i64,
    in_flight: AtomicI64,
}

impl RequestMemoryBudget {
    pub fn new(limit_mib: u64) -> Arc<Self> {
        Arc::new(Self {
            limit_bytes: (limit_mib.max(1) * 1024 * 1024) as i64,
            in_flight: AtomicI64::new(0),
        })
    }

    /// The admission threshold: requests are only admitted while the
    /// resulting in-flight total stays at or under half the configured
    /// limit.
    pub fn threshold(&self) -> i64 {
        self.limit_bytes / 2
    }

    pub fn in_flight_bytes(&self) -> i64 {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Try to admit `size` additional bytes. On success, the returned guard
    /// releases its share of the budget when dropped.
    pub fn try_admit(self: &Arc<Self>, size: i64) -> Option<RequestMemoryGuard> {
        loop {
            let current = self.in_flight.load(Ordering::Acquire);
            let updated = current + size;
            if updated > self.threshold() {
                return None;
            }
            if self
                .in_flight
                .compare_exchange(current, updated, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return Some(RequestMemoryGuard { budget: self.clone(), size });
            }
        }
    }

    /// Grow an already-admitted guard by `extra` bytes, used while draining
    /// a body of unknown length one chunk at a time. Aborts (returning
    /// `false`, leaving the guard's prior admission untouched) once the
    /// running total would cross the threshold.
    fn try_grow(self: &Arc<Self>, extra: i64) -> bool {
        loop {
            let current = self.in_flight.load(Ordering::Acquire);
            let updated = current + extra;
            if updated > self.threshold() {
                return false;
            }
            if self
                .in_flight
                .compare_exchange(current, updated, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return true;
            }
        }
    }
}

/// RAII admission: releases its committed bytes from the budget on drop,
/// regardless of which exit path the request takes.
pub struct RequestMemoryGuard {
    budget: Arc<RequestMemoryBudget>,
    size: i64,
}

impl RequestMemoryGuard {
    /// Grow this guard's reservation by `extra` bytes, used when draining a
    /// body whose `Content-Length` was unknown up front. Returns `false`
    /// (without growing) if admitting `extra` more bytes would cross the
    /// budget's threshold — the caller must abort the read with `413`.
    pub fn try_grow(&mut self, extra: i64) -> bool {
        if self.budget.try_grow(extra) {
            self.size += extra;
            true
        } else {
            false
        }
    }
}

impl Drop for RequestMemoryGuard {
    fn drop(&mut self) {
        self.budget.in_flight.fetch_sub(self.size, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_request_over_half_the_limit_is_rejected() {
        // RequestMemoryLimit=1 MiB; 550 KiB body -> 413.
        let budget = RequestMemoryBudget::new(1);
        assert!(budget.try_admit(550 * 1024).is_none());
    }

    #[test]
    fn concurrent_requests_contend_for_the_shared_half() {
        let budget = RequestMemoryBudget::new(1);
        let first = budget.try_admit(340 * 1024);
        assert!(first.is_some());
        let second = budget.try_admit(340 * 1024);
        assert!(second.is_none(), "680 KiB exceeds the 512 KiB threshold");
        drop(first);
        let third = budget.try_admit(340 * 1024);
        assert!(third.is_some(), "releasing the first frees room for a new request");
    }

    #[test]
    fn growing_past_threshold_fails_without_mutating_the_guard() {
        let budget = RequestMemoryBudget::new(1);
        let mut guard = budget.try_admit(100 * 1024).unwrap();
        assert!(!guard.try_grow(500 * 1024));
        assert_eq!(budget.in_flight_bytes(), 100 * 1024);
    }

    #[test]
    fn guard_drop_releases_its_bytes() {
        let budget = RequestMemoryBudget::new(1);
        {
            let _guard = budget.try_admit(100 * 1024).unwrap();
            assert_eq!(budget.in_flight_bytes(), 100 * 1024);
        }
        assert_eq!(budget.in_flight_bytes(), 0);
    }
}
