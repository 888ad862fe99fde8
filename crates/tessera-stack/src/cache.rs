//! Pre-allocated record pools
//!
//! # Design
//!
//! - Records are created up front (`create`) and recycled (`acquire`/`release`)
//! - Exhaustion is reported to the caller, never papered over by allocating
//! - Shrinking (`destroy`) only touches free records, so live records are
//!   never taken away from their owner

use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use tessera_common::{AtomicCounter, CounterMap};
use tracing::debug;

/// Pool of reusable records
pub struct Cache<T> {
    /// Pool name (for logs)
    name: &'static str,
    /// Free list
    free: Mutex<Vec<T>>,
    /// Records owned by the pool, free or lent out
    allocated: AtomicUsize,
    /// Successful acquisitions
    acquires: AtomicCounter,
    /// Records returned
    releases: AtomicCounter,
    /// Acquisitions refused because the pool was empty
    fails: AtomicCounter,
}

impl<T: Default> Cache<T> {
    /// Create an empty pool
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            free: Mutex::new(Vec::new()),
            allocated: AtomicUsize::new(0),
            acquires: AtomicCounter::new(0),
            releases: AtomicCounter::new(0),
            fails: AtomicCounter::new(0),
        }
    }

    /// Create `n` more records
    pub fn create(&self, n: usize) {
        if n == 0 {
            return;
        }
        let mut free = self.free.lock();
        free.reserve(n);
        for _ in 0..n {
            free.push(T::default());
        }
        self.allocated.fetch_add(n, Ordering::Relaxed);
        debug!(cache = self.name, created = n, free = free.len(), "cache grown");
    }

    /// Destroy up to `n` free records; returns how many were destroyed
    pub fn destroy(&self, n: usize) -> usize {
        let mut free = self.free.lock();
        let count = n.min(free.len());
        let keep = free.len() - count;
        free.truncate(keep);
        free.shrink_to_fit();
        self.allocated.fetch_sub(count, Ordering::Relaxed);
        if count > 0 {
            debug!(cache = self.name, destroyed = count, free = keep, "cache shrunk");
        }
        count
    }

    /// Take a record, `None` when the pool is exhausted
    #[inline]
    pub fn acquire(&self) -> Option<T> {
        match self.free.lock().pop() {
            Some(record) => {
                self.acquires.inc();
                Some(record)
            }
            None => {
                self.fails.inc();
                None
            }
        }
    }

    /// Give a record back
    #[inline]
    pub fn release(&self, record: T) {
        self.releases.inc();
        self.free.lock().push(record);
    }
}

impl<T> Cache<T> {
    /// Free records
    pub fn free_count(&self) -> usize {
        self.free.lock().len()
    }

    /// Records owned by the pool (free + lent out)
    pub fn allocated(&self) -> usize {
        self.allocated.load(Ordering::Relaxed)
    }

    /// Records currently lent out
    pub fn in_use(&self) -> usize {
        self.allocated().saturating_sub(self.free_count())
    }

    /// Successful acquisitions
    pub fn total_acquires(&self) -> u64 {
        self.acquires.get()
    }

    /// Returned records
    pub fn total_releases(&self) -> u64 {
        self.releases.get()
    }

    /// Refused acquisitions
    pub fn total_fails(&self) -> u64 {
        self.fails.get()
    }

    /// Counter map
    pub fn counters(&self) -> CounterMap {
        CounterMap::new()
            .with("allocated", self.allocated() as u64)
            .with("free", self.free_count() as u64)
            .with("acquires", self.total_acquires())
            .with("releases", self.total_releases())
            .with("fails", self.total_fails())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_until_exhausted() {
        let cache: Cache<u64> = Cache::new("test");
        cache.create(2);
        assert!(cache.acquire().is_some());
        assert!(cache.acquire().is_some());
        assert!(cache.acquire().is_none());
        assert_eq!(cache.total_fails(), 1);
        assert_eq!(cache.in_use(), 2);
    }

    #[test]
    fn test_destroy_spares_lent_records() {
        let cache: Cache<u64> = Cache::new("test");
        cache.create(4);
        let a = cache.acquire().unwrap();
        let _b = cache.acquire().unwrap();

        // Only the two free records can go
        assert_eq!(cache.destroy(10), 2);
        assert_eq!(cache.allocated(), 2);
        assert_eq!(cache.free_count(), 0);

        cache.release(a);
        assert_eq!(cache.free_count(), 1);
        assert_eq!(cache.in_use(), 1);
    }

    #[test]
    fn test_grow_again() {
        let cache: Cache<u64> = Cache::new("test");
        cache.create(1);
        cache.create(3);
        assert_eq!(cache.allocated(), 4);
        assert_eq!(cache.counters().get("free"), Some(4));
    }
}
