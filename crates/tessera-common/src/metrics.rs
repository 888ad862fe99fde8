//! Counters for decoder and framework statistics

use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// High-performance counter for lock-free metrics
#[derive(Debug, Default)]
pub struct AtomicCounter(AtomicU64);

impl AtomicCounter {
    /// Create new counter
    pub const fn new(value: u64) -> Self {
        Self(AtomicU64::new(value))
    }

    /// Increment and return previous value
    #[inline(always)]
    pub fn inc(&self) -> u64 {
        self.0.fetch_add(1, Ordering::Relaxed)
    }

    /// Add value and return previous
    #[inline(always)]
    pub fn add(&self, val: u64) -> u64 {
        self.0.fetch_add(val, Ordering::Relaxed)
    }

    /// Get current value
    #[inline(always)]
    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }

    /// Reset to zero
    pub fn reset(&self) {
        self.0.store(0, Ordering::Relaxed);
    }
}

/// Uniform name → count mapping exposed by every decoder
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CounterMap(BTreeMap<&'static str, u64>);

impl CounterMap {
    /// Create empty map
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or overwrite a counter
    pub fn add_key_value(&mut self, key: &'static str, value: u64) {
        self.0.insert(key, value);
    }

    /// Builder-style insert
    pub fn with(mut self, key: &'static str, value: u64) -> Self {
        self.add_key_value(key, value);
        self
    }

    /// Get a counter
    pub fn get(&self, key: &str) -> Option<u64> {
        self.0.get(key).copied()
    }

    /// Iterate in key order
    pub fn iter(&self) -> impl Iterator<Item = (&'static str, u64)> + '_ {
        self.0.iter().map(|(k, v)| (*k, *v))
    }

    /// Number of counters
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_atomic_counter() {
        let counter = AtomicCounter::new(0);
        assert_eq!(counter.inc(), 0);
        assert_eq!(counter.inc(), 1);
        assert_eq!(counter.add(3), 2);
        assert_eq!(counter.get(), 5);
        counter.reset();
        assert_eq!(counter.get(), 0);
    }

    #[test]
    fn test_counter_map() {
        let cm = CounterMap::new().with("packets", 10).with("bytes", 1500);
        assert_eq!(cm.get("packets"), Some(10));
        assert_eq!(cm.get("missing"), None);
        let keys: Vec<_> = cm.iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["bytes", "packets"]);
        assert_eq!(
            serde_json::to_string(&cm).unwrap(),
            r#"{"bytes":1500,"packets":10}"#
        );
    }
}
