//! Application layer classifiers
//!
//! One [`L7Protocol`] per application. Each one only recognises its
//! protocol from cheap structural markers (method tokens, record headers,
//! magic numbers, well known ports) and keeps a small per-flow record drawn
//! from its own cache. Grammar-level parsing is left to dedicated decoders.

use crate::cache::Cache;
use crate::flow::Flow;
use crate::protocol::{FlowDecoder, Protocol, ProtocolCounters};
use std::mem;
use std::sync::atomic::{AtomicBool, Ordering};
use tessera_common::{AtomicCounter, CounterMap, FlowDirection};

/// Applications with a classifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum L7Kind {
    /// HTTP/1.x
    Http,
    /// SSL/TLS records
    Ssl,
    /// SMTP
    Smtp,
    /// IMAP
    Imap,
    /// POP3
    Pop,
    /// Bitcoin P2P
    Bitcoin,
    /// DNS
    Dns,
    /// SIP
    Sip,
    /// DHCP
    Dhcp,
    /// NTP
    Ntp,
    /// SNMP
    Snmp,
    /// SSDP
    Ssdp,
    /// RTP
    Rtp,
    /// QUIC
    Quic,
}

/// Classifiers chained on TCP flows, in dispatch order
pub const TCP_KINDS: [L7Kind; 6] = [
    L7Kind::Http,
    L7Kind::Ssl,
    L7Kind::Smtp,
    L7Kind::Imap,
    L7Kind::Pop,
    L7Kind::Bitcoin,
];

/// Classifiers chained on UDP flows, in dispatch order
pub const UDP_KINDS: [L7Kind; 8] = [
    L7Kind::Dns,
    L7Kind::Sip,
    L7Kind::Dhcp,
    L7Kind::Ntp,
    L7Kind::Snmp,
    L7Kind::Ssdp,
    L7Kind::Rtp,
    L7Kind::Quic,
];

const HTTP_METHODS: [&[u8]; 8] = [
    b"GET ",
    b"POST ",
    b"HEAD ",
    b"PUT ",
    b"DELETE ",
    b"OPTIONS ",
    b"CONNECT ",
    b"HTTP/1.",
];

const SIP_METHODS: [&[u8]; 7] = [
    b"SIP/2.0 ",
    b"INVITE ",
    b"REGISTER ",
    b"ACK ",
    b"BYE ",
    b"CANCEL ",
    b"OPTIONS sip:",
];

const BITCOIN_MAGIC: [[u8; 4]; 2] = [[0xf9, 0xbe, 0xb4, 0xd9], [0x0b, 0x11, 0x09, 0x07]];

impl L7Kind {
    /// Long name
    pub fn name(&self) -> &'static str {
        match self {
            Self::Http => "HTTPProtocol",
            Self::Ssl => "SSLProtocol",
            Self::Smtp => "SMTPProtocol",
            Self::Imap => "IMAPProtocol",
            Self::Pop => "POPProtocol",
            Self::Bitcoin => "BitcoinProtocol",
            Self::Dns => "DNSProtocol",
            Self::Sip => "SIPProtocol",
            Self::Dhcp => "DHCPProtocol",
            Self::Ntp => "NTPProtocol",
            Self::Snmp => "SNMPProtocol",
            Self::Ssdp => "SSDPProtocol",
            Self::Rtp => "RTPProtocol",
            Self::Quic => "QuicProtocol",
        }
    }

    /// Short name used for flow filtering
    pub fn short_name(&self) -> &'static str {
        match self {
            Self::Http => "http",
            Self::Ssl => "ssl",
            Self::Smtp => "smtp",
            Self::Imap => "imap",
            Self::Pop => "pop",
            Self::Bitcoin => "bitcoin",
            Self::Dns => "dns",
            Self::Sip => "sip",
            Self::Dhcp => "dhcp",
            Self::Ntp => "ntp",
            Self::Snmp => "snmp",
            Self::Ssdp => "ssdp",
            Self::Rtp => "rtp",
            Self::Quic => "quic",
        }
    }

    /// Whether the flow's current payload looks like this application
    pub fn matches(&self, flow: &Flow) -> bool {
        let p = flow.payload();
        let key = flow.key();
        let port = |n: u16| key.src_port == n || key.dst_port == n;
        let text = p.first().is_some_and(|b| b.is_ascii_graphic());

        match self {
            Self::Http => HTTP_METHODS.iter().any(|m| p.starts_with(m)),
            Self::Ssl => p.len() >= 5 && (0x14..=0x17).contains(&p[0]) && p[1] == 0x03 && p[2] <= 0x04,
            Self::Smtp => (port(25) || port(587)) && text,
            Self::Imap => port(143) && text,
            Self::Pop => port(110) && text,
            Self::Bitcoin => p.len() >= 24 && BITCOIN_MAGIC.iter().any(|m| p.starts_with(m)),
            Self::Dns => port(53) && p.len() >= 12,
            Self::Sip => SIP_METHODS.iter().any(|m| p.starts_with(m)),
            Self::Dhcp => (port(67) || port(68)) && p.len() >= 236,
            Self::Ntp => port(123) && p.len() >= 48,
            Self::Snmp => (port(161) || port(162)) && p.first() == Some(&0x30),
            Self::Ssdp => port(1900) && text,
            Self::Rtp => {
                p.len() >= 12
                    && p[0] >> 6 == 2
                    && !(72..=76).contains(&(p[1] & 0x7f))
                    && key.src_port >= 1024
                    && key.dst_port >= 1024
            }
            Self::Quic => port(443) && p.len() >= 20 && p[0] & 0x40 != 0,
        }
    }
}

/// Per-flow record kept by an L7 classifier
#[derive(Debug, Clone, Default)]
pub struct L7Info {
    /// Payloads seen
    pub packets: u64,
    /// Payload bytes seen
    pub bytes: u64,
    /// Payloads in the reply direction
    pub replies: u64,
}

/// Structural classifier for one application
pub struct L7Protocol {
    kind: L7Kind,
    active: AtomicBool,
    infos: Cache<Box<L7Info>>,
    counters: ProtocolCounters,
    flows: AtomicCounter,
}

impl L7Protocol {
    /// Create a classifier
    pub fn new(kind: L7Kind) -> Self {
        Self {
            kind,
            active: AtomicBool::new(true),
            infos: Cache::new(kind.short_name()),
            counters: ProtocolCounters::default(),
            flows: AtomicCounter::new(0),
        }
    }

    /// Application this classifier recognises
    pub fn kind(&self) -> L7Kind {
        self.kind
    }

    /// Free per-flow records
    pub fn total_free_infos(&self) -> usize {
        self.infos.free_count()
    }

    /// Per-flow records owned, free or attached
    pub fn total_infos(&self) -> usize {
        self.infos.allocated()
    }
}

impl Protocol for L7Protocol {
    fn name(&self) -> &'static str {
        self.kind.name()
    }

    fn short_name(&self) -> &'static str {
        self.kind.short_name()
    }

    fn header_size(&self) -> usize {
        0
    }

    fn counters(&self) -> CounterMap {
        self.counters
            .to_map()
            .with("flows", self.flows.get())
            .with("allocated infos", self.infos.allocated() as u64)
            .with("info misses", self.infos.total_fails())
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
        match info.downcast::<L7Info>() {
            Ok(mut info) => {
                *info = L7Info::default();
                self.infos.release(info);
            }
            // Not ours: put it back for its owner
            Err(other) => flow.set_l7_info(other),
        }
    }

    fn allocated_memory(&self) -> usize {
        self.infos.allocated() * mem::size_of::<L7Info>()
    }

    fn increase_allocated_memory(&self, records: usize) {
        self.infos.create(records);
    }

    fn decrease_allocated_memory(&self, records: usize) {
        self.infos.destroy(records);
    }
}

impl FlowDecoder for L7Protocol {
    fn check_flow(&self, flow: &Flow) -> bool {
        self.counters.verdict(self.kind.matches(flow))
    }

    fn process_flow(&self, flow: &mut Flow) {
        let len = flow.payload().len();
        self.counters.record(len);

        if !flow.has_l7_info() {
            if let Some(info) = self.infos.acquire() {
                self.flows.inc();
                flow.set_l7_info(info);
            }
        }
        let reply = flow.direction() == FlowDirection::Downstream;
        if let Some(info) = flow.l7_info_mut::<L7Info>() {
            info.packets += 1;
            info.bytes += len as u64;
            if reply {
                info.replies += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::flow_on_ports;

    #[test]
    fn test_structural_markers() {
        let http = flow_on_ports(40000, 8080, b"GET /index.html HTTP/1.1\r\n");
        assert!(L7Kind::Http.matches(&http));
        assert!(!L7Kind::Ssl.matches(&http));

        let tls = flow_on_ports(40000, 443, &[0x16, 0x03, 0x01, 0x00, 0x2e, 0x01]);
        assert!(L7Kind::Ssl.matches(&tls));

        let dns = flow_on_ports(5353, 53, &[0u8; 12]);
        assert!(L7Kind::Dns.matches(&dns));
        assert!(!L7Kind::Dns.matches(&flow_on_ports(5353, 53, &[0u8; 4])));

        let mut btc = vec![0xf9, 0xbe, 0xb4, 0xd9];
        btc.extend_from_slice(&[0u8; 20]);
        assert!(L7Kind::Bitcoin.matches(&flow_on_ports(40000, 8333, &btc)));

        let sip = flow_on_ports(5060, 5060, b"INVITE sip:bob@example.com SIP/2.0\r\n");
        assert!(L7Kind::Sip.matches(&sip));
        assert!(!L7Kind::Http.matches(&sip));
    }

    #[test]
    fn test_info_lifecycle() {
        let http = L7Protocol::new(L7Kind::Http);
        http.increase_allocated_memory(1);
        let mut flow = flow_on_ports(40000, 80, b"GET / HTTP/1.1\r\n");

        assert!(http.check_flow(&flow));
        http.process_flow(&mut flow);
        http.process_flow(&mut flow);
        assert_eq!(flow.l7_info::<L7Info>().unwrap().packets, 2);
        assert_eq!(http.total_free_infos(), 0);

        http.release_flow_info(&mut flow);
        assert!(!flow.has_l7_info());
        assert_eq!(http.total_free_infos(), 1);
        assert_eq!(http.counters().get("flows"), Some(1));
    }

    #[test]
    fn test_runs_without_records() {
        let ssl = L7Protocol::new(L7Kind::Ssl);
        let mut flow = flow_on_ports(40000, 443, &[0x17, 0x03, 0x03, 0x00, 0x10]);
        ssl.process_flow(&mut flow);
        assert!(!flow.has_l7_info());
        assert_eq!(ssl.counters().get("info misses"), Some(1));
    }
}
