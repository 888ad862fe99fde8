//! Flow attachment shared by the TCP and UDP decoders
//!
//! The transport layer is where packets become flows: it looks the
//! connection up in its [`FlowManager`], sweeps idle flows lazily (once per
//! distinct packet second), stamps new flows with the attached engines and
//! hands payloads to its [`FlowForwarder`].

use super::Link;
use crate::engines::{AddressSetEngine, SignatureEngine};
use crate::flow::{Flow, FlowManager, SharedFlow};
use crate::forwarder::FlowForwarder;
use crate::protocol::PacketDecoder;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tessera_common::{AtomicCounter, FlowDirection, FlowKey, Packet};
use tracing::trace;

/// Packet decoder that turns packets into flows
pub trait TransportDecoder: PacketDecoder {
    /// Flow state shared with the stack wiring
    fn flow_layer(&self) -> &FlowLayer;
}

/// Flow state of one transport decoder
#[derive(Default)]
pub struct FlowLayer {
    manager: Link<FlowManager>,
    forwarder: Link<FlowForwarder>,
    current: Mutex<Weak<Mutex<Flow>>>,
    signatures: RwLock<Option<Arc<dyn SignatureEngine>>>,
    address_set: RwLock<Option<Arc<dyn AddressSetEngine>>>,
    last_sweep: AtomicU64,
    no_flow: AtomicCounter,
}

impl FlowLayer {
    /// Manager that owns this layer's flows
    pub fn set_flow_manager(&self, manager: Weak<FlowManager>) {
        self.manager.set(manager);
    }

    /// Manager that owns this layer's flows
    pub fn flow_manager(&self) -> Option<Arc<FlowManager>> {
        self.manager.get()
    }

    /// Forwarder receiving this layer's payloads
    pub fn set_flow_forwarder(&self, ff: Weak<FlowForwarder>) {
        self.forwarder.set(ff);
    }

    /// Signature engine assigned to new flows
    pub fn set_signature_engine(&self, engine: Option<Arc<dyn SignatureEngine>>) {
        *self.signatures.write() = engine;
    }

    /// Address set consulted for new flows
    pub fn set_address_set(&self, engine: Option<Arc<dyn AddressSetEngine>>) {
        *self.address_set.write() = engine;
    }

    /// Packets dropped because no flow record was available
    pub fn total_dropped(&self) -> u64 {
        self.no_flow.get()
    }

    /// Flow of the last packet seen by this layer
    pub fn current_flow(&self) -> Option<SharedFlow> {
        self.current.lock().upgrade()
    }

    /// Find or open the flow for `key`, sweeping idle flows first.
    ///
    /// `None` means the packet is dropped: no manager, or cache exhausted.
    pub fn attach(&self, key: FlowKey, now: u64) -> Option<(SharedFlow, FlowDirection, bool)> {
        let Some(manager) = self.manager.get() else {
            self.no_flow.inc();
            return None;
        };
        if self.last_sweep.swap(now, Ordering::Relaxed) != now {
            manager.update_timers(now);
        }
        match manager.lookup_or_create(key, now) {
            Ok(found) => Some(found),
            Err(err) => {
                self.no_flow.inc();
                trace!(manager = manager.name(), %key, error = %err, "packet dropped");
                None
            }
        }
    }

    /// Stamp a flow seen for the first time
    pub fn on_new_flow(&self, flow: &mut Flow, packet: &Packet) {
        flow.set_tag(packet.tag());
        flow.set_signature_engine(self.signatures.read().clone());

        if let Some(set) = &*self.address_set.read() {
            let addrs = [packet.src_addr(), packet.dst_addr()];
            if let Some(hit) = addrs.into_iter().flatten().find_map(|addr| set.lookup(addr)) {
                if hit.evidence {
                    flow.set_evidence(true);
                }
                flow.set_address_set(hit.name);
            }
        }
    }

    /// Dispatch the flow's current payload
    pub fn forward(&self, flow: &mut Flow) {
        if let Some(ff) = self.forwarder.get() {
            ff.forward_flow(flow);
        }
    }

    /// Remember the flow of the packet being processed
    pub fn set_current(&self, flow: &SharedFlow) {
        *self.current.lock() = Arc::downgrade(flow);
    }

    /// Close a flow explicitly
    pub fn close(&self, key: &FlowKey) {
        *self.current.lock() = Weak::new();
        if let Some(manager) = self.manager.get() {
            manager.remove_flow(key);
        }
    }
}
