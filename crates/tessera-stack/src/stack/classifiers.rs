//! Flow-scoped decoder set hanging off one transport forwarder
//!
//! The specific classifiers come first in dispatch order, the generic
//! catch-all last. The frequency decoder is only registered while frequency
//! mode is on, and then in front of everything else.

use super::{resize, StackModes};
use crate::config::CacheShares;
use crate::flow::FlowManager;
use crate::forwarder::FlowForwarder;
use crate::protocol::{FlowDecoder, Protocol};
use crate::protocols::{FrequencyProtocol, GenericProtocol, L7Kind, L7Protocol};
use std::io::{self, Write};
use std::sync::Arc;
use tracing::debug;

fn bound<D>(decoder: D) -> (Arc<D>, Arc<FlowForwarder>)
where
    D: FlowDecoder + 'static,
{
    let decoder = Arc::new(decoder);
    let ff = Arc::new(FlowForwarder::new(decoder.short_name()));
    ff.bind_decoder(&decoder);
    (decoder, ff)
}

/// Classifiers competing for the flows of one transport protocol
pub struct ClassifierChain {
    specific: Vec<(Arc<L7Protocol>, Arc<FlowForwarder>)>,
    generic: (Arc<GenericProtocol>, Arc<FlowForwarder>),
    frequency: (Arc<FrequencyProtocol>, Arc<FlowForwarder>),
}

impl ClassifierChain {
    /// Build the decoders and their forwarders
    pub fn new(kinds: &[L7Kind], generic: GenericProtocol, frequency: FrequencyProtocol) -> Self {
        Self {
            specific: kinds.iter().map(|kind| bound(L7Protocol::new(*kind))).collect(),
            generic: bound(generic),
            frequency: bound(frequency),
        }
    }

    /// Register the classifiers under `root` in dispatch order
    pub fn attach(&self, root: &FlowForwarder) {
        for ff in self.forwarders() {
            root.add_up_flow_forwarder(ff);
        }
    }

    /// Specific classifiers followed by the generic one
    pub fn forwarders(&self) -> Vec<Arc<FlowForwarder>> {
        let mut all = self.specific_forwarders();
        all.push(self.generic.1.clone());
        all
    }

    /// Specific classifiers only
    pub fn specific_forwarders(&self) -> Vec<Arc<FlowForwarder>> {
        self.specific.iter().map(|(_, ff)| ff.clone()).collect()
    }

    /// Classifier for `kind`
    pub fn classifier(&self, kind: L7Kind) -> Option<&Arc<L7Protocol>> {
        self.specific.iter().map(|(p, _)| p).find(|p| p.kind() == kind)
    }

    /// Generic catch-all decoder
    pub fn generic(&self) -> &Arc<GenericProtocol> {
        &self.generic.0
    }

    /// Forwarder of the generic catch-all decoder
    pub fn generic_forwarder(&self) -> &Arc<FlowForwarder> {
        &self.generic.1
    }

    /// Frequency analysis decoder
    pub fn frequency(&self) -> &Arc<FrequencyProtocol> {
        &self.frequency.0
    }

    /// Forwarder of the frequency analysis decoder
    pub fn frequency_forwarder(&self) -> &Arc<FlowForwarder> {
        &self.frequency.1
    }

    /// Every decoder of the chain
    pub fn protocols(&self) -> Vec<Arc<dyn Protocol>> {
        let mut all: Vec<Arc<dyn Protocol>> = Vec::with_capacity(self.specific.len() + 2);
        for (p, _) in &self.specific {
            all.push(p.clone());
        }
        all.push(self.generic.0.clone());
        all.push(self.frequency.0.clone());
        all
    }

    /// Size each classifier's per-flow records from its share of `total`
    pub fn resize(&self, total: usize, shares: &CacheShares) {
        for (p, _) in &self.specific {
            let target = shares.records(p.kind(), total);
            resize(
                p.total_infos(),
                target,
                |n| p.increase_allocated_memory(n),
                |n| p.decrease_allocated_memory(n),
            );
        }
    }

    /// Switch `root` to the forwarder set required by `modes`.
    ///
    /// Frequency mode disables every classifier and puts the frequency
    /// forwarder first; NIDS mode leaves only the generic catch-all enabled;
    /// otherwise everything but the frequency forwarder is enabled. Flows
    /// stay in their managers; a flow whose forwarder got disabled is
    /// dispatched again on its next payload.
    pub fn apply(&self, root: &FlowForwarder, modes: StackModes) {
        let freq = &self.frequency.1;
        if modes.frequency {
            root.disable_flow_forwarders(&self.forwarders());
            root.insert_up_flow_forwarder(freq.clone());
            freq.set_enabled(true);
            self.frequency.0.set_active(true);
        } else {
            self.frequency.0.set_active(false);
            root.remove_up_flow_forwarder(freq);
            root.enable_flow_forwarders(&self.forwarders());
            if modes.nids {
                root.disable_flow_forwarders(&self.specific_forwarders());
            }
        }
        debug!(
            root = root.name(),
            frequency = modes.frequency,
            nids = modes.nids,
            candidates = root.total_up_flow_forwarders(),
            "classifier chain switched"
        );
    }

    /// Grow or shrink the histogram pool to `n`; attached histograms stay
    pub fn resize_frequencies(&self, n: usize) {
        let freqs = &self.frequency.0;
        resize(
            freqs.total_frequencies(),
            n,
            |n| freqs.create_frequencies(n),
            |n| {
                freqs.destroy_frequencies(n);
            },
        );
    }

    /// Take back the histograms attached to live flows, then free the pool
    pub fn destroy_frequencies(&self, manager: &FlowManager) {
        let (freqs, ff) = &self.frequency;
        for flow in manager.flows() {
            let mut f = flow.lock();
            let owned = f.forwarder().is_some_and(|owner| Arc::ptr_eq(&owner, ff));
            if owned {
                freqs.release_flow_info(&mut f);
                f.set_forwarder(None);
                f.set_l7_protocol(None);
            }
        }
        freqs.destroy_frequencies(freqs.total_frequencies());
    }

    /// Statistics of every decoder of the chain
    pub fn statistics(&self, out: &mut dyn Write, level: u8) -> io::Result<()> {
        for protocol in self.protocols() {
            protocol.statistics(out, level)?;
        }
        Ok(())
    }
}
