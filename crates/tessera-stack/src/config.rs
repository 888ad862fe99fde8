//! Stack configuration
//!
//! Every field maps onto one of the runtime controls of
//! [`NetworkStack`](crate::stack::NetworkStack); applying a configuration is
//! the same as calling those controls one by one.

use crate::flow::DEFAULT_FLOW_TIMEOUT;
use crate::protocols::l7::{L7Kind, TCP_KINDS, UDP_KINDS};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tessera_common::{DpiError, DpiResult};

/// Idle timeout of the physical TCP flows carrying OpenFlow sessions
pub const PHYSICAL_FLOWS_TIMEOUT: u64 = 86400;

/// Stack configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StackConfig {
    /// Expected concurrent TCP flows
    pub total_tcp_flows: usize,
    /// Expected concurrent UDP flows
    pub total_udp_flows: usize,
    /// Idle timeout of the virtual pipeline flows, in seconds
    pub flows_timeout: u64,
    /// Idle timeout of the physical flows, in seconds
    pub physical_flows_timeout: u64,
    /// Frequency analysis instead of L7 classification
    pub frequency_engine: bool,
    /// Generic signature inspection instead of L7 classification
    pub nids_engine: bool,
    /// Proportional sizing weights
    pub cache_shares: CacheShares,
}

impl Default for StackConfig {
    fn default() -> Self {
        Self {
            total_tcp_flows: 0,
            total_udp_flows: 0,
            flows_timeout: DEFAULT_FLOW_TIMEOUT,
            physical_flows_timeout: PHYSICAL_FLOWS_TIMEOUT,
            frequency_engine: false,
            nids_engine: false,
            cache_shares: CacheShares::default(),
        }
    }
}

impl StackConfig {
    /// Load from a JSON file
    pub fn load(path: impl AsRef<Path>) -> DpiResult<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Save to a JSON file
    pub fn save(&self, path: impl AsRef<Path>) -> DpiResult<()> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Reject values the sizing logic cannot use
    pub fn validate(&self) -> DpiResult<()> {
        if self.flows_timeout == 0 || self.physical_flows_timeout == 0 {
            return Err(DpiError::Config("flow timeouts must be positive".into()));
        }
        self.cache_shares.validate()
    }
}

/// Traffic-mix weights used to size per-protocol record caches.
///
/// Each L7 share is the fraction of the expected flow count for which that
/// classifier pre-allocates per-flow records. Physical flow caches get the
/// expected count divided by `physical_divisor`, since one tunnel flow
/// carries many inner flows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheShares {
    /// Physical flows = total / divisor
    pub physical_divisor: usize,
    /// HTTP share of TCP flows
    pub http: f64,
    /// SSL share of TCP flows
    pub ssl: f64,
    /// SMTP share of TCP flows
    pub smtp: f64,
    /// IMAP share of TCP flows
    pub imap: f64,
    /// POP share of TCP flows
    pub pop: f64,
    /// Bitcoin share of TCP flows
    pub bitcoin: f64,
    /// DNS share of UDP flows
    pub dns: f64,
    /// SIP share of UDP flows
    pub sip: f64,
    /// SSDP share of UDP flows
    pub ssdp: f64,
    /// DHCP share of UDP flows
    pub dhcp: f64,
    /// NTP share of UDP flows
    pub ntp: f64,
    /// SNMP share of UDP flows
    pub snmp: f64,
    /// RTP share of UDP flows
    pub rtp: f64,
    /// QUIC share of UDP flows
    pub quic: f64,
}

impl Default for CacheShares {
    fn default() -> Self {
        Self {
            physical_divisor: 8,
            http: 0.75,
            ssl: 0.40,
            smtp: 0.05,
            imap: 0.05,
            pop: 0.05,
            bitcoin: 0.05,
            dns: 0.5,
            sip: 0.2,
            ssdp: 0.2,
            dhcp: 0.0,
            ntp: 0.0,
            snmp: 0.0,
            rtp: 0.0,
            quic: 0.0,
        }
    }
}

impl CacheShares {
    /// Weight of one classifier
    pub fn share(&self, kind: L7Kind) -> f64 {
        match kind {
            L7Kind::Http => self.http,
            L7Kind::Ssl => self.ssl,
            L7Kind::Smtp => self.smtp,
            L7Kind::Imap => self.imap,
            L7Kind::Pop => self.pop,
            L7Kind::Bitcoin => self.bitcoin,
            L7Kind::Dns => self.dns,
            L7Kind::Sip => self.sip,
            L7Kind::Ssdp => self.ssdp,
            L7Kind::Dhcp => self.dhcp,
            L7Kind::Ntp => self.ntp,
            L7Kind::Snmp => self.snmp,
            L7Kind::Rtp => self.rtp,
            L7Kind::Quic => self.quic,
        }
    }

    /// Records for `kind` out of `total` expected flows, never more than
    /// `total`
    pub fn records(&self, kind: L7Kind, total: usize) -> usize {
        let share = self.share(kind).clamp(0.0, 1.0);
        ((total as f64 * share) as usize).min(total)
    }

    /// Physical flows for `total` expected inner flows
    pub fn physical(&self, total: usize) -> usize {
        total / self.physical_divisor.max(1)
    }

    /// Reject weights outside `0.0..=1.0` and a zero divisor
    pub fn validate(&self) -> DpiResult<()> {
        if self.physical_divisor == 0 {
            return Err(DpiError::Config("physical_divisor must be positive".into()));
        }
        for kind in TCP_KINDS.iter().chain(UDP_KINDS.iter()) {
            let share = self.share(*kind);
            if !(0.0..=1.0).contains(&share) {
                return Err(DpiError::Config(format!(
                    "invalid {} share: {}",
                    kind.short_name(),
                    share
                )));
            }
        }
        Ok(())
    }
}
