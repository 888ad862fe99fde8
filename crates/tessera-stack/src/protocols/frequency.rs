//! Byte frequency analysis
//!
//! Lightweight alternative to the L7 classifiers: while frequency mode is on
//! it claims every flow and accumulates a byte histogram per flow. Records
//! come from a pool the stack creates when the mode is switched on and
//! destroys when it is switched off.

use crate::cache::Cache;
use crate::flow::Flow;
use crate::protocol::{FlowDecoder, Protocol, ProtocolCounters};
use std::mem;
use std::sync::atomic::{AtomicBool, Ordering};
use tessera_common::{AtomicCounter, CounterMap};

/// Byte histogram of one flow
#[derive(Debug, Clone)]
pub struct Frequencies {
    counts: [u64; 256],
    total: u64,
}

impl Default for Frequencies {
    fn default() -> Self {
        Self {
            counts: [0; 256],
            total: 0,
        }
    }
}

impl Frequencies {
    /// Account a payload
    pub fn add(&mut self, payload: &[u8]) {
        for &b in payload {
            self.counts[usize::from(b)] += 1;
        }
        self.total += payload.len() as u64;
    }

    /// Occurrences of `byte`
    pub fn count(&self, byte: u8) -> u64 {
        self.counts[usize::from(byte)]
    }

    /// Bytes accounted
    pub fn total(&self) -> u64 {
        self.total
    }

    /// Distinct byte values seen
    pub fn dispersion(&self) -> usize {
        self.counts.iter().filter(|c| **c > 0).count()
    }

    /// Shannon entropy in bits per byte
    pub fn entropy(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        let total = self.total as f64;
        self.counts
            .iter()
            .filter(|c| **c > 0)
            .map(|c| {
                let p = *c as f64 / total;
                -p * p.log2()
            })
            .sum()
    }

    fn clear(&mut self) {
        self.counts = [0; 256];
        self.total = 0;
    }
}

/// Frequency analysis decoder
pub struct FrequencyProtocol {
    name: &'static str,
    short_name: &'static str,
    active: AtomicBool,
    pool: Cache<Box<Frequencies>>,
    counters: ProtocolCounters,
    flows: AtomicCounter,
}

impl FrequencyProtocol {
    /// Frequency decoder for TCP flows
    pub fn tcp() -> Self {
        Self::new("TCPFrequencyProtocol", "tcpfrequency")
    }

    /// Frequency decoder for UDP flows
    pub fn udp() -> Self {
        Self::new("UDPFrequencyProtocol", "udpfrequency")
    }

    fn new(name: &'static str, short_name: &'static str) -> Self {
        Self {
            name,
            short_name,
            active: AtomicBool::new(false),
            pool: Cache::new(short_name),
            counters: ProtocolCounters::default(),
            flows: AtomicCounter::new(0),
        }
    }

    /// Grow the histogram pool
    pub fn create_frequencies(&self, n: usize) {
        self.pool.create(n);
    }

    /// Shrink the histogram pool; attached histograms are spared
    pub fn destroy_frequencies(&self, n: usize) -> usize {
        self.pool.destroy(n)
    }

    /// Histograms owned, free or attached
    pub fn total_frequencies(&self) -> usize {
        self.pool.allocated()
    }
}

impl Protocol for FrequencyProtocol {
    fn name(&self) -> &'static str {
        self.name
    }

    fn short_name(&self) -> &'static str {
        self.short_name
    }

    fn header_size(&self) -> usize {
        0
    }

    fn counters(&self) -> CounterMap {
        self.counters
            .to_map()
            .with("flows", self.flows.get())
            .with("allocated frequencies", self.pool.allocated() as u64)
    }

    fn is_active(&self) -> bool {
        self.active.load(Ordering::Relaxed)
    }

    fn set_active(&self, active: bool) {
        self.active.store(active, Ordering::Relaxed);
    }

    fn release_flow_info(&self, flow: &mut Flow) {
        let Some(info) = flow.take_l7_info() else {
            return;
        };
        match info.downcast::<Frequencies>() {
            Ok(mut freqs) => {
                freqs.clear();
                self.pool.release(freqs);
            }
            Err(other) => flow.set_l7_info(other),
        }
    }

    fn allocated_memory(&self) -> usize {
        self.pool.allocated() * mem::size_of::<Frequencies>()
    }

    fn increase_allocated_memory(&self, records: usize) {
        self.create_frequencies(records);
    }

    fn decrease_allocated_memory(&self, records: usize) {
        self.destroy_frequencies(records);
    }
}

impl FlowDecoder for FrequencyProtocol {
    fn check_flow(&self, _flow: &Flow) -> bool {
        self.counters.verdict(self.is_active())
    }

    fn process_flow(&self, flow: &mut Flow) {
        self.counters.record(flow.payload().len());
        if !flow.has_l7_info() {
            if let Some(freqs) = self.pool.acquire() {
                self.flows.inc();
                flow.set_l7_info(freqs);
            }
        }
        let Some(packet) = flow.packet().cloned() else {
            return;
        };
        if let Some(freqs) = flow.l7_info_mut::<Frequencies>() {
            freqs.add(packet.payload());
        }
    }
}
