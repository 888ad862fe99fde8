//! Packet-scoped layer routing
//!
//! A [`Multiplexer`] is one node of the layer graph. It owns one decoder
//! (through the checker and packet function bound to it) and routes the
//! remaining payload to the child registered under the identifier the
//! decoder selected.
//!
//! # Design
//!
//! - Children are owned by their parent (`Arc`), the parent link is `Weak`
//! - The graph is a forest: one parent per node, unique sibling identifiers
//! - Nothing on the packet path returns an error; drops are counted

use crate::protocol::{PacketDecoder, Protocol};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::io::{self, Write};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use tessera_common::{AtomicCounter, CounterMap, DpiError, DpiResult, Packet};
use tracing::trace;

/// Structural check bound to a node
pub type PacketChecker = Box<dyn Fn(&Packet) -> bool + Send + Sync>;

/// Header decode bound to a node
pub type PacketFunction = Box<dyn Fn(&mut Packet) + Send + Sync>;

/// No child selected for the current packet
pub const NO_PROTOCOL: u32 = u32::MAX;

/// Layer graph node
pub struct Multiplexer {
    name: &'static str,
    protocol: RwLock<Option<Weak<dyn Protocol>>>,
    protocol_id: AtomicU32,
    header_size: AtomicUsize,
    checker: RwLock<Option<PacketChecker>>,
    packet_fn: RwLock<Option<PacketFunction>>,
    up: RwLock<HashMap<u32, Arc<Multiplexer>>>,
    down: RwLock<Option<Weak<Multiplexer>>>,
    next_protocol: AtomicU32,
    received: AtomicCounter,
    forwarded: AtomicCounter,
    failed: AtomicCounter,
}

impl Multiplexer {
    /// Create a node with no decoder bound
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            protocol: RwLock::new(None),
            protocol_id: AtomicU32::new(NO_PROTOCOL),
            header_size: AtomicUsize::new(0),
            checker: RwLock::new(None),
            packet_fn: RwLock::new(None),
            up: RwLock::new(HashMap::new()),
            down: RwLock::new(None),
            next_protocol: AtomicU32::new(NO_PROTOCOL),
            received: AtomicCounter::new(0),
            forwarded: AtomicCounter::new(0),
            failed: AtomicCounter::new(0),
        }
    }

    /// Node name
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Bind `decoder` to this node: protocol, header size, checker and
    /// packet function, plus the decoder's back-reference to the node.
    pub fn bind_decoder<D>(self: &Arc<Self>, decoder: &Arc<D>)
    where
        D: PacketDecoder + 'static,
    {
        let protocol: Weak<dyn Protocol> = Arc::<D>::downgrade(decoder);
        self.set_protocol(protocol);
        self.set_header_size(decoder.header_size());

        let d = Arc::downgrade(decoder);
        self.add_checker(move |packet| d.upgrade().is_some_and(|d| d.check_packet(packet)));
        let d = Arc::downgrade(decoder);
        self.add_packet_function(move |packet| {
            if let Some(d) = d.upgrade() {
                d.process_packet(packet);
            }
        });
        decoder.set_multiplexer(Arc::downgrade(self));
    }

    /// Decoder owned by this node
    pub fn set_protocol(&self, protocol: Weak<dyn Protocol>) {
        *self.protocol.write() = Some(protocol);
    }

    /// Decoder owned by this node, if still alive
    pub fn protocol(&self) -> Option<Arc<dyn Protocol>> {
        self.protocol.read().as_ref().and_then(Weak::upgrade)
    }

    /// Identifier this node is registered under in its parent
    pub fn set_protocol_identifier(&self, id: u32) {
        self.protocol_id.store(id, Ordering::Relaxed);
    }

    /// Identifier this node is registered under in its parent
    pub fn protocol_identifier(&self) -> u32 {
        self.protocol_id.load(Ordering::Relaxed)
    }

    /// Bytes stripped before the payload is handed to a child
    pub fn set_header_size(&self, size: usize) {
        self.header_size.store(size, Ordering::Relaxed);
    }

    /// Bytes stripped before the payload is handed to a child
    pub fn header_size(&self) -> usize {
        self.header_size.load(Ordering::Relaxed)
    }

    /// Structural check for packets entering this node
    pub fn add_checker<F>(&self, checker: F)
    where
        F: Fn(&Packet) -> bool + Send + Sync + 'static,
    {
        *self.checker.write() = Some(Box::new(checker));
    }

    /// Header decode for packets entering this node
    pub fn add_packet_function<F>(&self, function: F)
    where
        F: Fn(&mut Packet) + Send + Sync + 'static,
    {
        *self.packet_fn.write() = Some(Box::new(function));
    }

    /// Register `child` under `id`.
    ///
    /// Fails when `id` is taken by another child, when `child` already has a
    /// different parent, or when the edge would close a cycle.
    pub fn add_up_multiplexer(self: &Arc<Self>, child: Arc<Multiplexer>, id: u32) -> DpiResult<()> {
        if Arc::ptr_eq(self, &child) || self.has_ancestor(&child) {
            return Err(DpiError::Assembly(format!(
                "multiplexer {} -> {} would create a cycle",
                self.name, child.name
            )));
        }
        {
            let up = self.up.read();
            if let Some(existing) = up.get(&id) {
                if !Arc::ptr_eq(existing, &child) {
                    return Err(DpiError::Assembly(format!(
                        "multiplexer {} already routes id {:#x} to {}",
                        self.name, id, existing.name
                    )));
                }
            }
            let other = up
                .iter()
                .find(|(routed, mux)| **routed != id && Arc::ptr_eq(mux, &child));
            if let Some((other, _)) = other {
                return Err(DpiError::Assembly(format!(
                    "multiplexer {} already routes id {:#x} to {}",
                    self.name, other, child.name
                )));
            }
        }
        child.add_down_multiplexer(self)?;
        child.set_protocol_identifier(id);
        self.up.write().insert(id, child);
        Ok(())
    }

    /// Record the single parent of this node
    pub fn add_down_multiplexer(&self, parent: &Arc<Multiplexer>) -> DpiResult<()> {
        let mut down = self.down.write();
        if let Some(current) = down.as_ref().and_then(Weak::upgrade) {
            if !Arc::ptr_eq(&current, parent) {
                return Err(DpiError::Assembly(format!(
                    "multiplexer {} already has parent {}",
                    self.name, current.name
                )));
            }
        }
        *down = Some(Arc::downgrade(parent));
        Ok(())
    }

    /// Parent node
    pub fn down_multiplexer(&self) -> Option<Arc<Multiplexer>> {
        self.down.read().as_ref().and_then(Weak::upgrade)
    }

    /// Child registered under `id`
    pub fn up_multiplexer(&self, id: u32) -> Option<Arc<Multiplexer>> {
        self.up.read().get(&id).cloned()
    }

    /// Number of children
    pub fn total_up_multiplexers(&self) -> usize {
        self.up.read().len()
    }

    fn has_ancestor(&self, node: &Arc<Multiplexer>) -> bool {
        let mut current = self.down_multiplexer();
        while let Some(parent) = current {
            if Arc::ptr_eq(&parent, node) {
                return true;
            }
            current = parent.down_multiplexer();
        }
        false
    }

    /// Select the child the current payload goes to
    #[inline]
    pub fn set_next_protocol_identifier(&self, id: u32) {
        self.next_protocol.store(id, Ordering::Relaxed);
    }

    /// Child selected for the current payload
    pub fn next_protocol_identifier(&self) -> u32 {
        self.next_protocol.load(Ordering::Relaxed)
    }

    /// Run this node on a packet: check, decode, then forward.
    ///
    /// Returns false when the checker rejected the packet.
    pub fn process_packet(&self, packet: &mut Packet) -> bool {
        self.received.inc();
        let accepted = match &*self.checker.read() {
            Some(checker) => checker(packet),
            None => true,
        };
        if !accepted {
            self.failed.inc();
            trace!(mux = self.name, len = packet.len(), "checker rejected packet");
            return false;
        }
        if let Some(function) = &*self.packet_fn.read() {
            function(packet);
        }
        self.forward_packet(packet);
        true
    }

    /// Hand the payload after this node's header to the selected child.
    ///
    /// No selection ends the chain quietly. An identifier with no child, or
    /// a header larger than the packet, counts as a failure. Evidence raised
    /// by the child is copied back onto `packet`.
    pub fn forward_packet(&self, packet: &mut Packet) {
        let id = self.next_protocol.swap(NO_PROTOCOL, Ordering::Relaxed);
        if id == NO_PROTOCOL {
            return;
        }
        let Some(child) = self.up_multiplexer(id) else {
            self.failed.inc();
            metrics::counter!("tessera_mux_unknown_protocol_total").increment(1);
            trace!(mux = self.name, id, "unknown protocol identifier");
            return;
        };
        let Some(mut payload) = packet.child(self.header_size()) else {
            self.failed.inc();
            trace!(mux = self.name, id, len = packet.len(), "header exceeds packet");
            return;
        };

        self.forwarded.inc();
        child.process_packet(&mut payload);
        if payload.have_evidence() {
            packet.set_evidence(true);
        }
    }

    /// Fail assembly when no decoder is bound to this node or its subtree
    pub fn validate(&self) -> DpiResult<()> {
        if self.protocol().is_none() {
            return Err(DpiError::Assembly(format!(
                "multiplexer {} has no protocol",
                self.name
            )));
        }
        let children: Vec<Arc<Multiplexer>> = self.up.read().values().cloned().collect();
        children.iter().try_for_each(|child| child.validate())
    }

    /// Packets that entered this node
    pub fn total_received_packets(&self) -> u64 {
        self.received.get()
    }

    /// Packets handed to a child
    pub fn total_forward_packets(&self) -> u64 {
        self.forwarded.get()
    }

    /// Packets rejected or not routable
    pub fn total_failed_packets(&self) -> u64 {
        self.failed.get()
    }

    /// Counter map
    pub fn counters(&self) -> CounterMap {
        CounterMap::new()
            .with("received packets", self.total_received_packets())
            .with("forward packets", self.total_forward_packets())
            .with("failed packets", self.total_failed_packets())
    }

    /// Human readable statistics
    pub fn statistics(&self, out: &mut dyn Write) -> io::Result<()> {
        writeln!(out, "Multiplexer({}) statistics", self.name)?;
        writeln!(out, "\tPlugged to object({})", self.header_size())?;
        for (key, value) in self.counters().iter() {
            writeln!(out, "\t{:<24}{:>12}", format!("Total {}:", key), value)?;
        }
        Ok(())
    }
}
