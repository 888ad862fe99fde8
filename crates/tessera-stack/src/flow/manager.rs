//! Live flow index with idle eviction
//!
//! # Design
//!
//! - Flows are indexed in an LRU list keyed by connection identity; packet
//!   lookups move the flow to the front, read-only lookups do not
//! - Access order is not timestamp order: a late packet with an older
//!   capture time still moves its flow to the front. Sweeps therefore test
//!   every flow's `last_seen` instead of stopping at the first live tail
//! - Evicted flows are released outside the index lock

use super::{FlowCache, SharedFlow};
use crate::protocol::Protocol;
use lru::LruCache;
use parking_lot::{Mutex, RwLock};
use std::io::{self, Write};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tessera_common::{AtomicCounter, CounterMap, DpiError, DpiResult, FlowDirection, FlowKey};
use tracing::{debug, trace};

/// Default idle timeout in seconds
pub const DEFAULT_FLOW_TIMEOUT: u64 = 180;

/// Owner of the live flows of one layer
pub struct FlowManager {
    name: &'static str,
    flows: Mutex<LruCache<FlowKey, SharedFlow>>,
    cache: RwLock<Option<Arc<FlowCache>>>,
    protocol: RwLock<Option<Weak<dyn Protocol>>>,
    timeout: AtomicU64,
    created: AtomicCounter,
    timed_out: AtomicCounter,
    released: AtomicCounter,
    exhausted: AtomicCounter,
}

impl FlowManager {
    /// Create a manager with the default timeout and no cache bound
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            flows: Mutex::new(LruCache::unbounded()),
            cache: RwLock::new(None),
            protocol: RwLock::new(None),
            timeout: AtomicU64::new(DEFAULT_FLOW_TIMEOUT),
            created: AtomicCounter::new(0),
            timed_out: AtomicCounter::new(0),
            released: AtomicCounter::new(0),
            exhausted: AtomicCounter::new(0),
        }
    }

    /// Manager name
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Bind the pool new flows are drawn from
    pub fn set_flow_cache(&self, cache: Arc<FlowCache>) {
        *self.cache.write() = Some(cache);
    }

    /// Bound pool
    pub fn flow_cache(&self) -> Option<Arc<FlowCache>> {
        self.cache.read().clone()
    }

    /// Decoder notified when a flow is released
    pub fn set_protocol(&self, protocol: Weak<dyn Protocol>) {
        *self.protocol.write() = Some(protocol);
    }

    /// Idle timeout in seconds
    pub fn set_timeout(&self, seconds: u64) {
        self.timeout.store(seconds, Ordering::Relaxed);
    }

    /// Idle timeout in seconds
    pub fn timeout(&self) -> u64 {
        self.timeout.load(Ordering::Relaxed)
    }

    /// Fail assembly when the manager cannot create flows
    pub fn validate(&self) -> DpiResult<()> {
        if self.cache.read().is_none() {
            return Err(DpiError::Assembly(format!(
                "flow manager {} has no flow cache",
                self.name
            )));
        }
        let bound = self.protocol.read().as_ref().is_some_and(|p| p.strong_count() > 0);
        if !bound {
            return Err(DpiError::Assembly(format!(
                "flow manager {} has no protocol",
                self.name
            )));
        }
        Ok(())
    }

    /// Live flows
    pub fn total_flows(&self) -> usize {
        self.flows.lock().len()
    }

    /// Flows created since start
    pub fn total_created(&self) -> u64 {
        self.created.get()
    }

    /// Flows evicted on timeout
    pub fn total_timeouts(&self) -> u64 {
        self.timed_out.get()
    }

    /// Flows returned to the cache (timeout or explicit close)
    pub fn total_released(&self) -> u64 {
        self.released.get()
    }

    /// New connections refused because the cache was empty
    pub fn total_exhausted(&self) -> u64 {
        self.exhausted.get()
    }

    /// Find a live flow in either direction without creating one
    pub fn find_flow(&self, key: &FlowKey) -> Option<(SharedFlow, FlowDirection)> {
        let flows = self.flows.lock();
        if let Some(flow) = flows.peek(key) {
            return Some((flow.clone(), FlowDirection::Upstream));
        }
        flows
            .peek(&key.reverse())
            .map(|flow| (flow.clone(), FlowDirection::Downstream))
    }

    /// Return the flow for `key` (either direction) or open a new one.
    ///
    /// Fails with [`DpiError::FlowCacheExhausted`] when no record is free;
    /// existing flows are left untouched in that case.
    pub fn lookup_or_create(
        &self,
        key: FlowKey,
        now: u64,
    ) -> DpiResult<(SharedFlow, FlowDirection, bool)> {
        let mut flows = self.flows.lock();
        if let Some(flow) = flows.get(&key) {
            return Ok((flow.clone(), FlowDirection::Upstream, false));
        }
        if let Some(flow) = flows.get(&key.reverse()) {
            return Ok((flow.clone(), FlowDirection::Downstream, false));
        }

        let record = self.cache.read().as_ref().and_then(|cache| cache.acquire_flow());
        let Some(flow) = record else {
            self.exhausted.inc();
            metrics::counter!("tessera_flow_cache_exhausted_total").increment(1);
            trace!(manager = self.name, %key, "no flow available");
            return Err(DpiError::FlowCacheExhausted);
        };

        {
            let mut f = flow.lock();
            f.reset();
            f.set_key(key);
            f.set_last_seen(now);
        }
        flows.put(key, flow.clone());
        self.created.inc();
        Ok((flow, FlowDirection::Upstream, true))
    }

    /// Evict every flow idle for longer than the timeout at `now`
    pub fn update_timers(&self, now: u64) -> usize {
        let timeout = self.timeout();
        let mut expired = Vec::new();
        {
            let mut flows = self.flows.lock();
            let idle: Vec<FlowKey> = flows
                .iter()
                .rev()
                .filter(|(_, flow)| flow.lock().is_idle(now, timeout))
                .map(|(key, _)| *key)
                .collect();
            for key in idle {
                if let Some(flow) = flows.pop(&key) {
                    expired.push(flow);
                }
            }
        }

        let count = expired.len();
        if count > 0 {
            self.timed_out.add(count as u64);
            metrics::counter!("tessera_flows_evicted_total").increment(count as u64);
            debug!(manager = self.name, evicted = count, now, "flows timed out");
        }
        for flow in expired {
            self.release(flow);
        }
        count
    }

    /// Close a flow explicitly (e.g. TCP reset); returns false if unknown
    pub fn remove_flow(&self, key: &FlowKey) -> bool {
        let removed = {
            let mut flows = self.flows.lock();
            flows.pop(key).or_else(|| flows.pop(&key.reverse()))
        };
        match removed {
            Some(flow) => {
                self.release(flow);
                true
            }
            None => false,
        }
    }

    /// Release every live flow
    pub fn clear(&self) {
        let all: Vec<SharedFlow> = {
            let mut flows = self.flows.lock();
            let mut all = Vec::with_capacity(flows.len());
            while let Some((_, flow)) = flows.pop_lru() {
                all.push(flow);
            }
            all
        };
        for flow in all {
            self.release(flow);
        }
    }

    /// Snapshot of the live flows, most recently used first
    pub fn flows(&self) -> Vec<SharedFlow> {
        self.flows.lock().iter().map(|(_, flow)| flow.clone()).collect()
    }

    fn release(&self, flow: SharedFlow) {
        let protocol = self.protocol.read().as_ref().and_then(Weak::upgrade);
        {
            let mut f = flow.lock();
            if let Some(ff) = f.forwarder() {
                if let Some(owner) = ff.protocol() {
                    owner.release_flow_info(&mut f);
                }
            }
            if let Some(protocol) = &protocol {
                protocol.release_flow_info(&mut f);
            }
            f.reset();
        }
        self.released.inc();
        if let Some(cache) = self.cache.read().as_ref() {
            cache.release_flow(flow);
        }
    }

    /// Print live flows, optionally only those claimed by `protocol`
    pub fn show_flows(
        &self,
        out: &mut dyn Write,
        protocol: Option<&str>,
        limit: usize,
    ) -> io::Result<usize> {
        let mut shown = 0;
        for flow in self.flows() {
            if shown >= limit {
                break;
            }
            let f = flow.lock();
            if let Some(name) = protocol {
                if f.l7_protocol() != Some(name) {
                    continue;
                }
            }
            writeln!(out, "{}", *f)?;
            shown += 1;
        }
        Ok(shown)
    }

    /// Counter map
    pub fn counters(&self) -> CounterMap {
        CounterMap::new()
            .with("flows", self.total_flows() as u64)
            .with("created", self.total_created())
            .with("timeouts", self.total_timeouts())
            .with("released", self.total_released())
            .with("cache exhausted", self.total_exhausted())
    }

    /// Human readable statistics
    pub fn statistics(&self, out: &mut dyn Write) -> io::Result<()> {
        writeln!(out, "FlowManager({}) statistics", self.name)?;
        writeln!(out, "\tTimeout:                {:>12}", self.timeout())?;
        for (key, value) in self.counters().iter() {
            writeln!(out, "\t{:<24}{:>12}", format!("Total {}:", key), value)?;
        }
        Ok(())
    }
}
