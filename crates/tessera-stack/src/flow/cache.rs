//! Pool of flow records

use super::SharedFlow;
use crate::cache::Cache;
use std::io::{self, Write};
use tessera_common::CounterMap;

/// Pre-sized pool supplying flow records to a [`super::FlowManager`]
pub struct FlowCache {
    records: Cache<SharedFlow>,
}

impl FlowCache {
    /// Create an empty cache
    pub fn new(name: &'static str) -> Self {
        Self {
            records: Cache::new(name),
        }
    }

    /// Pre-allocate `n` more flow records
    pub fn create_flows(&self, n: usize) {
        self.records.create(n);
    }

    /// Destroy up to `n` free flow records; live flows are never touched
    pub fn destroy_flows(&self, n: usize) -> usize {
        self.records.destroy(n)
    }

    /// Take a record, `None` when exhausted
    #[inline]
    pub fn acquire_flow(&self) -> Option<SharedFlow> {
        self.records.acquire()
    }

    /// Return a record (the caller resets it first)
    #[inline]
    pub fn release_flow(&self, flow: SharedFlow) {
        self.records.release(flow);
    }

    /// Free records
    pub fn total_flows(&self) -> usize {
        self.records.free_count()
    }

    /// Records owned by the cache, free or live
    pub fn capacity(&self) -> usize {
        self.records.allocated()
    }

    /// Successful acquisitions
    pub fn total_acquires(&self) -> u64 {
        self.records.total_acquires()
    }

    /// Returned records
    pub fn total_releases(&self) -> u64 {
        self.records.total_releases()
    }

    /// Refused acquisitions
    pub fn total_fails(&self) -> u64 {
        self.records.total_fails()
    }

    /// Counter map
    pub fn counters(&self) -> CounterMap {
        self.records.counters()
    }

    /// Human readable statistics
    pub fn statistics(&self, out: &mut dyn Write, name: &str) -> io::Result<()> {
        writeln!(out, "FlowCache({}) statistics", name)?;
        writeln!(out, "\tTotal flows:            {:>12}", self.capacity())?;
        writeln!(out, "\tTotal free flows:       {:>12}", self.total_flows())?;
        writeln!(out, "\tTotal acquires:         {:>12}", self.total_acquires())?;
        writeln!(out, "\tTotal releases:         {:>12}", self.total_releases())?;
        writeln!(out, "\tTotal fails:            {:>12}", self.total_fails())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_records_are_recycled() {
        let cache = FlowCache::new("test");
        cache.create_flows(1);
        let flow = cache.acquire_flow().unwrap();
        flow.lock().set_evidence(true);
        assert!(cache.acquire_flow().is_none());

        flow.lock().reset();
        cache.release_flow(flow);
        let again = cache.acquire_flow().unwrap();
        assert!(!again.lock().have_evidence());
        assert_eq!(cache.total_fails(), 1);
        assert_eq!(cache.capacity(), 1);
    }

    #[test]
    fn test_statistics_output() {
        let cache = FlowCache::new("test");
        cache.create_flows(3);
        let mut out = Vec::new();
        cache.statistics(&mut out, "tcp").unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("FlowCache(tcp) statistics"));
        assert!(text.contains("Total free flows:"));
    }
}
