//! External engine contracts consumed by the transport and generic layers
//!
//! The stack only needs two answers from its collaborators: "does this
//! payload match a signature" and "is this address in a watched set". Both
//! are traits; the regex and CIDR implementations here are the defaults.

use ipnetwork::IpNetwork;
use regex::bytes::Regex;
use std::io::{self, Write};
use std::net::IpAddr;
use tessera_common::{AtomicCounter, DpiError, DpiResult};

/// Answer from an engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineMatch {
    /// Name of the signature or address set that matched
    pub name: String,
    /// Whether the match should mark the flow as evidence
    pub evidence: bool,
}

/// Payload signature matcher
pub trait SignatureEngine: Send + Sync {
    /// Engine name
    fn name(&self) -> &str;

    /// First signature matching `payload`
    fn evaluate(&self, payload: &[u8]) -> Option<EngineMatch>;

    /// Human readable statistics
    fn statistics(&self, _out: &mut dyn Write) -> io::Result<()> {
        Ok(())
    }
}

/// Address membership matcher
pub trait AddressSetEngine: Send + Sync {
    /// Engine name
    fn name(&self) -> &str;

    /// Set containing `addr`
    fn lookup(&self, addr: IpAddr) -> Option<EngineMatch>;

    /// Human readable statistics
    fn statistics(&self, _out: &mut dyn Write) -> io::Result<()> {
        Ok(())
    }
}

/// One compiled signature
pub struct Signature {
    name: String,
    regex: Regex,
    evidence: bool,
    matches: AtomicCounter,
}

impl Signature {
    /// Signature name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Source pattern
    pub fn pattern(&self) -> &str {
        self.regex.as_str()
    }

    /// Times this signature matched
    pub fn total_matches(&self) -> u64 {
        self.matches.get()
    }
}

/// Ordered list of regular expression signatures; the first match wins
pub struct RegexSignatures {
    name: String,
    signatures: Vec<Signature>,
    evaluations: AtomicCounter,
}

impl RegexSignatures {
    /// Create an empty list
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            signatures: Vec::new(),
            evaluations: AtomicCounter::new(0),
        }
    }

    /// Compile and append a signature
    pub fn add_signature(&mut self, name: &str, pattern: &str, evidence: bool) -> DpiResult<()> {
        let regex = Regex::new(pattern)
            .map_err(|e| DpiError::Config(format!("signature {}: {}", name, e)))?;
        self.signatures.push(Signature {
            name: name.to_string(),
            regex,
            evidence,
            matches: AtomicCounter::new(0),
        });
        Ok(())
    }

    /// Compiled signatures in evaluation order
    pub fn signatures(&self) -> &[Signature] {
        &self.signatures
    }

    /// Payloads evaluated
    pub fn total_evaluations(&self) -> u64 {
        self.evaluations.get()
    }
}

impl SignatureEngine for RegexSignatures {
    fn name(&self) -> &str {
        &self.name
    }

    fn evaluate(&self, payload: &[u8]) -> Option<EngineMatch> {
        self.evaluations.inc();
        let sig = self.signatures.iter().find(|s| s.regex.is_match(payload))?;
        sig.matches.inc();
        Some(EngineMatch {
            name: sig.name.clone(),
            evidence: sig.evidence,
        })
    }

    fn statistics(&self, out: &mut dyn Write) -> io::Result<()> {
        writeln!(out, "RegexSignatures({}) statistics", self.name)?;
        writeln!(out, "\tTotal evaluations:      {:>12}", self.total_evaluations())?;
        for sig in &self.signatures {
            writeln!(out, "\tSignature:{} matches:{}", sig.name, sig.total_matches())?;
        }
        Ok(())
    }
}

/// Named set of networks
pub struct AddressSet {
    name: String,
    networks: Vec<IpNetwork>,
    evidence: bool,
    lookups: AtomicCounter,
    hits: AtomicCounter,
}

impl AddressSet {
    /// Create an empty set; `evidence` marks matching flows
    pub fn new(name: impl Into<String>, evidence: bool) -> Self {
        Self {
            name: name.into(),
            networks: Vec::new(),
            evidence,
            lookups: AtomicCounter::new(0),
            hits: AtomicCounter::new(0),
        }
    }

    /// Add an address or CIDR block ("10.0.0.0/8", "192.168.1.7")
    pub fn add_network(&mut self, cidr: &str) -> DpiResult<()> {
        let net: IpNetwork = cidr
            .parse()
            .map_err(|e| DpiError::Config(format!("address set {}: {}: {}", self.name, cidr, e)))?;
        self.networks.push(net);
        Ok(())
    }

    /// Number of networks
    pub fn len(&self) -> usize {
        self.networks.len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.networks.is_empty()
    }

    /// Lookups that matched
    pub fn total_hits(&self) -> u64 {
        self.hits.get()
    }
}

impl AddressSetEngine for AddressSet {
    fn name(&self) -> &str {
        &self.name
    }

    fn lookup(&self, addr: IpAddr) -> Option<EngineMatch> {
        self.lookups.inc();
        if !self.networks.iter().any(|net| net.contains(addr)) {
            return None;
        }
        self.hits.inc();
        Some(EngineMatch {
            name: self.name.clone(),
            evidence: self.evidence,
        })
    }

    fn statistics(&self, out: &mut dyn Write) -> io::Result<()> {
        writeln!(out, "AddressSet({}) statistics", self.name)?;
        writeln!(out, "\tTotal networks:         {:>12}", self.networks.len())?;
        writeln!(out, "\tTotal lookups:          {:>12}", self.lookups.get())?;
        writeln!(out, "\tTotal hits:             {:>12}", self.total_hits())
    }
}
