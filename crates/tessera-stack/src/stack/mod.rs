//! Stack assembly and runtime controls
//!
//! A stack is the composition root: it owns every decoder, multiplexer,
//! forwarder, flow manager and flow cache of a physical pipeline, a tunnel
//! decoder and the virtual pipeline the tunnel feeds. Everything is wired
//! once in the constructor and validated before the stack is handed out.

pub mod classifiers;
pub mod openflow;
pub mod pipeline;
pub mod vxlan;

pub use classifiers::ClassifierChain;
pub use openflow::StackOpenFlow;
pub use pipeline::{NetworkLayers, TransportLayer, VirtualPipeline};
pub use vxlan::StackVirtual;

use crate::anomaly::AnomalyManager;
use crate::config::{CacheShares, StackConfig};
use crate::engines::{AddressSetEngine, SignatureEngine};
use crate::flow::{FlowManager, SharedFlow};
use std::io::{self, Write};
use std::sync::Arc;
use tessera_common::{DpiResult, Packet};

/// Inspection modes of a stack
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StackModes {
    /// Byte-frequency analysis replaces classification
    pub frequency: bool,
    /// Only the generic signature decoders classify
    pub nids: bool,
}

/// Grow or shrink a pool from `current` to `target` records
pub(crate) fn resize(
    current: usize,
    target: usize,
    grow: impl FnOnce(usize),
    shrink: impl FnOnce(usize),
) {
    if target > current {
        grow(target - current);
    } else if target < current {
        shrink(current - target);
    }
}

/// Runtime controls of an assembled stack
pub trait NetworkStack: Send + Sync {
    /// Stack name
    fn name(&self) -> &'static str;

    /// Pipeline the tunnel decoder feeds
    fn pipeline(&self) -> &VirtualPipeline;

    /// Anomaly collector shared by every decoder of the stack
    fn anomalies(&self) -> &Arc<AnomalyManager>;

    /// Flow table of the physical transport carrying the tunnel
    fn physical_flows(&self) -> &Arc<FlowManager>;

    /// Run one captured frame through the physical pipeline.
    ///
    /// Returns false when the root decoder rejected the frame.
    fn process_packet(&self, packet: &mut Packet) -> bool;

    /// Size the TCP pools for `total` expected concurrent inner flows
    fn set_total_tcp_flows(&self, total: usize);

    /// Size the UDP pools for `total` expected concurrent inner flows
    fn set_total_udp_flows(&self, total: usize);

    /// Idle timeout of the tunnel-carrying physical flows
    fn set_physical_flows_timeout(&self, seconds: u64);

    /// (outer, inner) flows of the last processed packet
    fn current_flows(&self) -> (Option<SharedFlow>, Option<SharedFlow>);

    /// Statistics of every component, `level` 0 prints nothing
    fn statistics(&self, out: &mut dyn Write, level: u8) -> io::Result<()>;

    /// Live inner TCP flows
    fn total_tcp_flows(&self) -> usize {
        self.pipeline().tcp.total_flows()
    }

    /// Live inner UDP flows
    fn total_udp_flows(&self) -> usize {
        self.pipeline().udp.total_flows()
    }

    /// Sizing weights used by the next `set_total_*_flows`
    fn set_cache_shares(&self, shares: CacheShares) {
        self.pipeline().set_cache_shares(shares);
    }

    /// Idle timeout of the inner flows
    fn set_flows_timeout(&self, seconds: u64) {
        self.pipeline().set_flows_timeout(seconds);
    }

    /// Idle timeout of the inner flows
    fn flows_timeout(&self) -> u64 {
        self.pipeline().flows_timeout()
    }

    /// Frequency analysis on or off
    fn enable_frequency_engine(&self, enable: bool) {
        self.pipeline().enable_frequency_engine(enable);
    }

    /// Whether frequency analysis is on
    fn is_frequency_engine_enabled(&self) -> bool {
        self.pipeline().modes().frequency
    }

    /// NIDS mode on or off
    fn enable_nids_engine(&self, enable: bool) {
        self.pipeline().enable_nids_engine(enable);
    }

    /// Whether NIDS mode is on
    fn is_nids_engine_enabled(&self) -> bool {
        self.pipeline().modes().nids
    }

    /// Signature engine for new inner TCP flows
    fn set_tcp_signature_engine(&self, engine: Option<Arc<dyn SignatureEngine>>) {
        self.pipeline().set_tcp_signature_engine(engine);
    }

    /// Signature engine for new inner UDP flows
    fn set_udp_signature_engine(&self, engine: Option<Arc<dyn SignatureEngine>>) {
        self.pipeline().set_udp_signature_engine(engine);
    }

    /// Address set for new inner TCP flows
    fn set_tcp_address_set(&self, engine: Option<Arc<dyn AddressSetEngine>>) {
        self.pipeline().set_tcp_address_set(engine);
    }

    /// Address set for new inner UDP flows
    fn set_udp_address_set(&self, engine: Option<Arc<dyn AddressSetEngine>>) {
        self.pipeline().set_udp_address_set(engine);
    }

    /// Print the number of live flows, then up to `limit` flows of the
    /// physical table followed by the inner ones, optionally only those
    /// claimed by the decoder named `protocol`
    fn show_flows(
        &self,
        out: &mut dyn Write,
        protocol: Option<&str>,
        limit: usize,
    ) -> io::Result<usize> {
        let physical = self.physical_flows();
        let total = physical.total_flows() + self.total_tcp_flows() + self.total_udp_flows();
        writeln!(out, "Flows on memory {}", total)?;

        let shown = physical.show_flows(out, protocol, limit)?;
        let rest = limit.saturating_sub(shown);
        Ok(shown + self.pipeline().show_flows(out, protocol, rest)?)
    }

    /// Apply every field of `config` through the runtime controls
    fn apply_config(&self, config: &StackConfig) -> DpiResult<()> {
        config.validate()?;
        self.set_cache_shares(config.cache_shares.clone());
        self.set_flows_timeout(config.flows_timeout);
        self.set_physical_flows_timeout(config.physical_flows_timeout);
        self.set_total_tcp_flows(config.total_tcp_flows);
        self.set_total_udp_flows(config.total_udp_flows);
        self.enable_frequency_engine(config.frequency_engine);
        self.enable_nids_engine(config.nids_engine);
        Ok(())
    }
}
