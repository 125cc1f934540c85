use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::net::IpAddr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::compute::condition::PropertySource;
use crate::lease::{Lease, LeaseId};
use crate::session::Session;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AgentId(String);

impl AgentId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for AgentId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for AgentId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Ok,
    Stopping,
    Stopped,
}

impl fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AgentStatus::Ok => write!(f, "ok"),
            AgentStatus::Stopping => write!(f, "stopping"),
            AgentStatus::Stopped => write!(f, "stopped"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentMode {
    /// Machine owned by the fleet; may be restarted and upgraded at will
    Dedicated,
    /// Someone's desk machine lending spare capacity
    Workstation,
}

/// What an agent announces about itself when it opens a session.
#[derive(Debug, Clone)]
pub struct AgentRegistration {
    pub agent_id: AgentId,
    pub mode: AgentMode,
    pub version: String,
    pub pools: Vec<String>,
    pub properties: Vec<String>,
    pub resources: HashMap<String, i32>,
    pub compute_cluster: Option<String>,
    pub ip_address: Option<IpAddr>,
    pub public_ip_address: Option<IpAddr>,
    pub auto_update: bool,
}

impl AgentRegistration {
    pub fn new(agent_id: impl Into<AgentId>, version: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            mode: AgentMode::Dedicated,
            version: version.into(),
            pools: Vec::new(),
            properties: Vec::new(),
            resources: HashMap::new(),
            compute_cluster: None,
            ip_address: None,
            public_ip_address: None,
            auto_update: true,
        }
    }

    pub fn with_mode(mut self, mode: AgentMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_pool(mut self, pool: impl Into<String>) -> Self {
        self.pools.push(pool.into());
        self
    }

    pub fn with_property(mut self, property: impl Into<String>) -> Self {
        self.properties.push(property.into());
        self
    }

    pub fn with_resource(mut self, name: impl Into<String>, amount: i32) -> Self {
        self.resources.insert(name.into(), amount);
        self
    }

    pub fn with_cluster(mut self, cluster: impl Into<String>) -> Self {
        self.compute_cluster = Some(cluster.into());
        self
    }

    pub fn with_ip(mut self, ip: IpAddr) -> Self {
        self.ip_address = Some(ip);
        self
    }

    pub fn with_public_ip(mut self, ip: IpAddr) -> Self {
        self.public_ip_address = Some(ip);
        self
    }

    pub fn with_auto_update(mut self, auto_update: bool) -> Self {
        self.auto_update = auto_update;
        self
    }
}

/// The agent's view of a lease it is running.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseSummary {
    pub task_type: String,
    pub exclusive: bool,
    pub resources: HashMap<String, i32>,
}

#[derive(Debug, Clone)]
pub struct Agent {
    pub id: AgentId,
    pub session: Option<Session>,
    pub status: AgentStatus,
    pub mode: AgentMode,
    pub enabled: bool,
    pub version: String,
    pub pools: Vec<String>,
    pub properties: Vec<String>,
    pub resources: HashMap<String, i32>,
    pub compute_cluster: Option<String>,
    pub ip_address: Option<IpAddr>,
    pub public_ip_address: Option<IpAddr>,
    pub request_restart: bool,
    pub request_force_restart: bool,
    pub request_shutdown: bool,
    pub auto_update: bool,
    pub last_upgrade_time: Option<DateTime<Utc>>,
    pub last_upgrade_version: Option<String>,
    pub leases: BTreeMap<LeaseId, LeaseSummary>,
    /// Task type waiting for the running leases to finish
    pub pending_drain: Option<String>,
}

impl Agent {
    pub fn new(id: AgentId) -> Self {
        Self {
            id,
            session: None,
            status: AgentStatus::Ok,
            mode: AgentMode::Dedicated,
            enabled: true,
            version: String::new(),
            pools: Vec::new(),
            properties: Vec::new(),
            resources: HashMap::new(),
            compute_cluster: None,
            ip_address: None,
            public_ip_address: None,
            request_restart: false,
            request_force_restart: false,
            request_shutdown: false,
            auto_update: true,
            last_upgrade_time: None,
            last_upgrade_version: None,
            leases: BTreeMap::new(),
            pending_drain: None,
        }
    }

    /// Refresh the self-reported fields. Administrative flags and upgrade
    /// bookkeeping survive reconnects.
    pub fn apply_registration(&mut self, registration: &AgentRegistration) {
        self.mode = registration.mode;
        self.version = registration.version.clone();
        self.pools = registration.pools.clone();
        self.properties = registration.properties.clone();
        self.resources = registration.resources.clone();
        self.compute_cluster = registration.compute_cluster.clone();
        self.ip_address = registration.ip_address;
        self.public_ip_address = registration.public_ip_address;
        self.auto_update = registration.auto_update;
        self.status = AgentStatus::Ok;
    }

    pub fn is_workstation(&self) -> bool {
        self.mode == AgentMode::Workstation
    }

    pub fn is_busy(&self) -> bool {
        !self.leases.is_empty()
    }

    pub fn has_exclusive_lease(&self) -> bool {
        self.leases.values().any(|l| l.exclusive)
    }

    pub fn in_pool(&self, pool: &str) -> bool {
        self.pools.iter().any(|p| p == pool)
    }

    /// Whether the agent currently holds a session that can accept work.
    pub fn is_online(&self) -> bool {
        self.session.as_ref().is_some_and(|s| s.is_active())
    }

    /// Capacity not reserved by running leases.
    pub fn free_resources(&self) -> HashMap<String, i32> {
        let mut free = self.resources.clone();
        for lease in self.leases.values() {
            for (name, amount) in &lease.resources {
                if let Some(available) = free.get_mut(name) {
                    *available -= amount;
                }
            }
        }
        free
    }

    pub fn attach_lease(&mut self, lease: &Lease) {
        self.leases.insert(
            lease.id,
            LeaseSummary {
                task_type: lease.task_type.clone(),
                exclusive: lease.exclusive,
                resources: lease.resources.clone(),
            },
        );
    }

    pub fn detach_lease(&mut self, id: &LeaseId) -> Option<LeaseSummary> {
        self.leases.remove(id)
    }
}

impl PropertySource for Agent {
    fn property_values(&self, key: &str) -> Vec<&str> {
        let mut values: Vec<&str> = self
            .properties
            .iter()
            .filter_map(|p| {
                let (k, v) = p.split_once('=')?;
                k.trim().eq_ignore_ascii_case(key).then(|| v.trim())
            })
            .collect();

        // Built-in properties
        if key.eq_ignore_ascii_case("pool") {
            values.extend(self.pools.iter().map(String::as_str));
        } else if key.eq_ignore_ascii_case("id") {
            values.push(self.id.as_str());
        } else if key.eq_ignore_ascii_case("version") {
            values.push(self.version.as_str());
        }
        values
    }
}
