use std::collections::HashSet;
use std::fmt;
use std::net::IpAddr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PortProtocol {
    Tcp,
    Udp,
}

impl fmt::Display for PortProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PortProtocol::Tcp => write!(f, "tcp"),
            PortProtocol::Udp => write!(f, "udp"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PortRule {
    pub protocol: PortProtocol,
    pub relay_port: u16,
    pub agent_port: u16,
}

impl fmt::Display for PortRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}->{}", self.protocol, self.relay_port, self.agent_port)
    }
}

/// Forwarding rules for one relayed lease.
///
/// Two mappings are the same mapping when they belong to the same lease.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortMapping {
    pub lease_id: String,
    pub agent_ip: IpAddr,
    pub ports: Vec<PortRule>,
    /// Empty means any source may connect
    pub allowed_source_ips: Vec<IpAddr>,
    pub created_at: DateTime<Utc>,
}

impl PartialEq for PortMapping {
    fn eq(&self, other: &Self) -> bool {
        self.lease_id == other.lease_id
    }
}

impl Eq for PortMapping {}

impl PortMapping {
    pub fn new(lease_id: impl Into<String>, agent_ip: IpAddr, created_at: DateTime<Utc>) -> Self {
        Self {
            lease_id: lease_id.into(),
            agent_ip,
            ports: Vec::new(),
            allowed_source_ips: Vec::new(),
            created_at,
        }
    }

    pub fn with_port(mut self, protocol: PortProtocol, relay_port: u16, agent_port: u16) -> Self {
        self.ports.push(PortRule {
            protocol,
            relay_port,
            agent_port,
        });
        self
    }

    pub fn with_source(mut self, ip: IpAddr) -> Self {
        self.allowed_source_ips.push(ip);
        self
    }

    pub fn port_summary(&self) -> String {
        let ports: Vec<String> = self.ports.iter().map(ToString::to_string).collect();
        format!("[{}]", ports.join(", "))
    }

    pub fn source_summary(&self) -> String {
        if self.allowed_source_ips.is_empty() {
            return "any".to_string();
        }
        let ips: Vec<String> = self.allowed_source_ips.iter().map(ToString::to_string).collect();
        ips.join(", ")
    }

    /// One-line human readable summary, as logged by relay agents.
    pub fn describe(&self, now: DateTime<Utc>) -> String {
        let age = (now - self.created_at).num_seconds().max(0);
        format!(
            "{} agent={} ports={} sources={} age={}s",
            self.lease_id,
            self.agent_ip,
            self.port_summary(),
            self.source_summary(),
            age
        )
    }
}

/// Changes between two mapping sets, keyed by lease id.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MappingDiff {
    pub added: Vec<PortMapping>,
    pub removed: Vec<PortMapping>,
}

impl MappingDiff {
    pub fn between(old: &[PortMapping], new: &[PortMapping]) -> Self {
        let old_ids: HashSet<&str> = old.iter().map(|m| m.lease_id.as_str()).collect();
        let new_ids: HashSet<&str> = new.iter().map(|m| m.lease_id.as_str()).collect();

        Self {
            added: new
                .iter()
                .filter(|m| !old_ids.contains(m.lease_id.as_str()))
                .cloned()
                .collect(),
            removed: old
                .iter()
                .filter(|m| !new_ids.contains(m.lease_id.as_str()))
                .cloned()
                .collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}
