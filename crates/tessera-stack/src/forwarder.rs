//! Flow-scoped dispatch chain
//!
//! Above the transport layer the dispatch unit is the flow. A transport
//! decoder hands each payload to its [`FlowForwarder`], which tries its
//! upper forwarders in registration order. The first enabled candidate whose
//! checker accepts the payload claims the flow; later payloads of that flow
//! go straight to it.
//!
//! # Design
//!
//! - Priority is registration order, nothing else
//! - Disabled forwarders stay registered so mode switches never reallocate
//! - A flow bound to a forwarder that was since disabled or removed releases
//!   the old decoder's state and is dispatched through the chain again

use crate::flow::Flow;
use crate::protocol::{FlowDecoder, Protocol};
use parking_lot::RwLock;
use std::io::{self, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tessera_common::{AtomicCounter, CounterMap, DpiError, DpiResult};
use tracing::trace;

/// Flow classification bound to a forwarder
pub type FlowChecker = Box<dyn Fn(&Flow) -> bool + Send + Sync>;

/// Flow decode bound to a forwarder
pub type FlowFunction = Box<dyn Fn(&mut Flow) + Send + Sync>;

/// One entry of a flow dispatch chain, and the chain above it
pub struct FlowForwarder {
    name: &'static str,
    protocol: RwLock<Option<Weak<dyn Protocol>>>,
    checker: RwLock<Option<FlowChecker>>,
    flow_fn: RwLock<Option<FlowFunction>>,
    up: RwLock<Vec<Arc<FlowForwarder>>>,
    enabled: AtomicBool,
    received: AtomicCounter,
    forwarded: AtomicCounter,
    failed: AtomicCounter,
}

impl FlowForwarder {
    /// Create an enabled forwarder with no decoder bound
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            protocol: RwLock::new(None),
            checker: RwLock::new(None),
            flow_fn: RwLock::new(None),
            up: RwLock::new(Vec::new()),
            enabled: AtomicBool::new(true),
            received: AtomicCounter::new(0),
            forwarded: AtomicCounter::new(0),
            failed: AtomicCounter::new(0),
        }
    }

    /// Forwarder name (the short name of its decoder)
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Bind `decoder`: protocol, checker and flow function, plus the
    /// decoder's back-reference to this forwarder.
    pub fn bind_decoder<D>(self: &Arc<Self>, decoder: &Arc<D>)
    where
        D: FlowDecoder + 'static,
    {
        let protocol: Weak<dyn Protocol> = Arc::<D>::downgrade(decoder);
        self.set_protocol(protocol);

        let d = Arc::downgrade(decoder);
        self.add_checker(move |flow| d.upgrade().is_some_and(|d| d.check_flow(flow)));
        let d = Arc::downgrade(decoder);
        self.add_flow_function(move |flow| {
            if let Some(d) = d.upgrade() {
                d.process_flow(flow);
            }
        });
        decoder.set_flow_forwarder(Arc::downgrade(self));
    }

    /// Decoder bound to this forwarder
    pub fn set_protocol(&self, protocol: Weak<dyn Protocol>) {
        *self.protocol.write() = Some(protocol);
    }

    /// Decoder bound to this forwarder, if still alive
    pub fn protocol(&self) -> Option<Arc<dyn Protocol>> {
        self.protocol.read().as_ref().and_then(Weak::upgrade)
    }

    /// Classification run before this forwarder claims a flow
    pub fn add_checker<F>(&self, checker: F)
    where
        F: Fn(&Flow) -> bool + Send + Sync + 'static,
    {
        *self.checker.write() = Some(Box::new(checker));
    }

    /// Decode run on every payload of a claimed flow
    pub fn add_flow_function<F>(&self, function: F)
    where
        F: Fn(&mut Flow) + Send + Sync + 'static,
    {
        *self.flow_fn.write() = Some(Box::new(function));
    }

    /// Whether dispatch considers this forwarder
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    /// Toggle this forwarder
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
    }

    /// Append a candidate; no-op if already registered
    pub fn add_up_flow_forwarder(&self, ff: Arc<FlowForwarder>) {
        let mut up = self.up.write();
        if !up.iter().any(|x| Arc::ptr_eq(x, &ff)) {
            up.push(ff);
        }
    }

    /// Put a candidate in front of every other; no-op if already registered
    pub fn insert_up_flow_forwarder(&self, ff: Arc<FlowForwarder>) {
        let mut up = self.up.write();
        if !up.iter().any(|x| Arc::ptr_eq(x, &ff)) {
            up.insert(0, ff);
        }
    }

    /// Unregister a candidate; the others keep their order
    pub fn remove_up_flow_forwarder(&self, ff: &Arc<FlowForwarder>) -> bool {
        let mut up = self.up.write();
        let before = up.len();
        up.retain(|x| !Arc::ptr_eq(x, ff));
        up.len() != before
    }

    /// Enable a batch of candidates, registering any that are missing
    pub fn enable_flow_forwarders(&self, set: &[Arc<FlowForwarder>]) {
        let mut up = self.up.write();
        for ff in set {
            if !up.iter().any(|x| Arc::ptr_eq(x, ff)) {
                up.push(ff.clone());
            }
            ff.set_enabled(true);
        }
    }

    /// Disable a batch of candidates; they stay registered
    pub fn disable_flow_forwarders(&self, set: &[Arc<FlowForwarder>]) {
        let _up = self.up.write();
        for ff in set {
            ff.set_enabled(false);
        }
    }

    /// Registered candidates in dispatch order
    pub fn up_flow_forwarders(&self) -> Vec<Arc<FlowForwarder>> {
        self.up.read().clone()
    }

    /// Number of registered candidates
    pub fn total_up_flow_forwarders(&self) -> usize {
        self.up.read().len()
    }

    /// Run this forwarder's checker
    pub fn accept(&self, flow: &Flow) -> bool {
        match &*self.checker.read() {
            Some(checker) => checker(flow),
            None => true,
        }
    }

    /// Run this forwarder's flow function
    pub fn process(&self, flow: &mut Flow) {
        if let Some(function) = &*self.flow_fn.read() {
            function(flow);
        }
    }

    /// Dispatch the flow's current payload to the candidate that owns it.
    ///
    /// Returns false when no enabled candidate claimed the payload.
    pub fn forward_flow(&self, flow: &mut Flow) -> bool {
        self.received.inc();
        let up = self.up.read();

        if let Some(bound) = flow.forwarder() {
            if bound.is_enabled() && up.iter().any(|x| Arc::ptr_eq(x, &bound)) {
                self.forwarded.inc();
                bound.process(flow);
                return true;
            }
            trace!(ff = self.name, from = bound.name, "flow owner disabled, dispatching again");
            if let Some(owner) = bound.protocol() {
                owner.release_flow_info(flow);
            }
            flow.set_forwarder(None);
            flow.set_l7_protocol(None);
        }

        for ff in up.iter().filter(|ff| ff.is_enabled()) {
            if ff.accept(flow) {
                flow.set_forwarder(Some(Arc::downgrade(ff)));
                flow.set_l7_protocol(Some(ff.name));
                self.forwarded.inc();
                ff.process(flow);
                return true;
            }
        }

        self.failed.inc();
        false
    }

    /// Fail assembly when this forwarder or a candidate has no decoder
    pub fn validate(&self) -> DpiResult<()> {
        if self.protocol().is_none() {
            return Err(DpiError::Assembly(format!(
                "flow forwarder {} has no protocol",
                self.name
            )));
        }
        for ff in self.up.read().iter() {
            if ff.flow_fn.read().is_none() {
                return Err(DpiError::Assembly(format!(
                    "flow forwarder {} has no flow function",
                    ff.name
                )));
            }
            ff.validate()?;
        }
        Ok(())
    }

    /// Payloads offered to this forwarder's chain
    pub fn total_received_flows(&self) -> u64 {
        self.received.get()
    }

    /// Payloads claimed by a candidate
    pub fn total_forward_flows(&self) -> u64 {
        self.forwarded.get()
    }

    /// Payloads no candidate claimed
    pub fn total_fail_flows(&self) -> u64 {
        self.failed.get()
    }

    /// Counter map
    pub fn counters(&self) -> CounterMap {
        CounterMap::new()
            .with("received flows", self.total_received_flows())
            .with("forward flows", self.total_forward_flows())
            .with("fail flows", self.total_fail_flows())
    }

    /// Human readable statistics
    pub fn statistics(&self, out: &mut dyn Write) -> io::Result<()> {
        writeln!(out, "FlowForwarder({}) statistics", self.name)?;
        for (key, value) in self.counters().iter() {
            writeln!(out, "\t{:<24}{:>12}", format!("Total {}:", key), value)?;
        }
        for ff in self.up.read().iter() {
            let state = if ff.is_enabled() { "enabled" } else { "disabled" };
            writeln!(out, "\tUp forwarder {} ({})", ff.name, state)?;
        }
        Ok(())
    }
}
