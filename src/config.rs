use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use ipnet::{IpNet, Ipv4Net, Ipv6Net};
use serde::{Deserialize, Serialize};

use crate::agent::AgentId;
use crate::error::{HerdError, Result};

/// Session liveness settings.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// How long a session stays alive after its last update
    pub grace_period: Duration,
    /// How often the expiry monitor scans for dead sessions
    pub expiry_check_interval: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            grace_period: Duration::from_secs(5 * 60),
            expiry_check_interval: Duration::from_secs(1),
        }
    }
}

/// Settings for the agent software upgrade task source.
#[derive(Debug, Clone)]
pub struct UpgradeConfig {
    /// Global switch. When false no upgrade leases are ever offered.
    pub enabled: bool,
    /// Minimum time between two upgrade attempts to the same version
    pub cooldown: Duration,
}

impl Default for UpgradeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            cooldown: Duration::from_secs(5 * 60),
        }
    }
}

/// Who may allocate compute resources from a cluster.
///
/// An empty policy denies everyone.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AccessPolicy {
    #[serde(default)]
    pub allowed_networks: Vec<IpNet>,
}

impl AccessPolicy {
    pub fn allow_all() -> Self {
        Self {
            allowed_networks: vec![
                IpNet::V4(Ipv4Net::default()),
                IpNet::V6(Ipv6Net::default()),
            ],
        }
    }

    pub fn authorizes(&self, ip: IpAddr) -> bool {
        self.allowed_networks.iter().any(|net| net.contains(&ip))
    }
}

/// NAT relay fronting the agents of a cluster.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Address requesters connect to
    pub public_address: IpAddr,
    /// First relay port handed out (inclusive)
    pub port_range_start: u16,
    /// Last relay port handed out (inclusive)
    pub port_range_end: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComputeClusterConfig {
    pub id: String,
    /// Requester networks served by this cluster, in addition to its priority
    /// position in [`ComputeConfig::clusters`]
    #[serde(default)]
    pub networks: Vec<IpNet>,
    #[serde(default)]
    pub access: AccessPolicy,
    #[serde(default)]
    pub relay: Option<RelayConfig>,
    /// Host:port of a tunnel endpoint, when the cluster offers one
    #[serde(default)]
    pub tunnel_address: Option<String>,
}

impl ComputeClusterConfig {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            networks: Vec::new(),
            access: AccessPolicy::default(),
            relay: None,
            tunnel_address: None,
        }
    }

    pub fn with_network(mut self, network: IpNet) -> Self {
        self.networks.push(network);
        self
    }

    pub fn with_access(mut self, access: AccessPolicy) -> Self {
        self.access = access;
        self
    }

    pub fn with_relay(mut self, relay: RelayConfig) -> Self {
        self.relay = Some(relay);
        self
    }

    pub fn with_tunnel(mut self, address: impl Into<String>) -> Self {
        self.tunnel_address = Some(address.into());
        self
    }
}

fn default_compute_port() -> u16 {
    7000
}

fn default_allocation_wait_ms() -> u64 {
    0
}

fn default_retry_interval_ms() -> u64 {
    250
}

/// Compute allocation settings, loadable from a JSON file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComputeConfig {
    /// Clusters in priority order
    #[serde(default)]
    pub clusters: Vec<ComputeClusterConfig>,
    /// Honour the first `x-forwarded-for` entry as the requester address
    #[serde(default)]
    pub trust_forwarded_for: bool,
    /// Honour a requester-supplied public IP when it asks for one
    #[serde(default)]
    pub trust_client_public_ip: bool,
    /// Agent port of the reserved `compute` channel
    #[serde(default = "default_compute_port")]
    pub compute_port: u16,
    /// How long an allocation waits for capacity before giving up
    #[serde(default = "default_allocation_wait_ms")]
    pub allocation_wait_ms: u64,
    /// Rescan interval while waiting for capacity
    #[serde(default = "default_retry_interval_ms")]
    pub retry_interval_ms: u64,
}

impl Default for ComputeConfig {
    fn default() -> Self {
        Self {
            clusters: Vec::new(),
            trust_forwarded_for: false,
            trust_client_public_ip: false,
            compute_port: default_compute_port(),
            allocation_wait_ms: default_allocation_wait_ms(),
            retry_interval_ms: default_retry_interval_ms(),
        }
    }
}

impl ComputeConfig {
    pub fn with_cluster(mut self, cluster: ComputeClusterConfig) -> Self {
        self.clusters.push(cluster);
        self
    }

    pub fn cluster(&self, id: &str) -> Option<&ComputeClusterConfig> {
        self.clusters.iter().find(|c| c.id == id)
    }

    pub fn allocation_wait(&self) -> Duration {
        Duration::from_millis(self.allocation_wait_ms)
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms.max(1))
    }

    /// Load and validate a compute configuration from a JSON file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)?;
        let config: ComputeConfig = serde_json::from_str(&data)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        for (i, cluster) in self.clusters.iter().enumerate() {
            if cluster.id.trim().is_empty() {
                return Err(HerdError::Config(format!("cluster #{} has an empty id", i)));
            }
            if self.clusters[..i].iter().any(|c| c.id == cluster.id) {
                return Err(HerdError::Config(format!(
                    "duplicate cluster id '{}'",
                    cluster.id
                )));
            }
            if let Some(ref relay) = cluster.relay {
                if relay.port_range_start > relay.port_range_end {
                    return Err(HerdError::Config(format!(
                        "cluster '{}' has an empty relay port range",
                        cluster.id
                    )));
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    pub http_addr: Option<SocketAddr>,
    pub session: SessionConfig,
    pub upgrade: UpgradeConfig,
    pub compute: ComputeConfig,
    pub job_queue_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            // SAFETY: This is a hardcoded valid address that will always parse
            listen_addr: "127.0.0.1:50051"
                .parse()
                .expect("default listen address is valid"),
            http_addr: None,
            session: SessionConfig::default(),
            upgrade: UpgradeConfig::default(),
            compute: ComputeConfig::default(),
            job_queue_capacity: 10_000,
        }
    }
}

impl ServerConfig {
    pub fn new(listen_addr: SocketAddr) -> Self {
        Self {
            listen_addr,
            ..Default::default()
        }
    }

    pub fn with_compute(mut self, compute: ComputeConfig) -> Self {
        self.compute = compute;
        self
    }

    pub fn with_http(mut self, addr: SocketAddr) -> Self {
        self.http_addr = Some(addr);
        self
    }
}

/// Settings for an agent running the NAT relay reconciliation loop.
#[derive(Debug, Clone)]
pub struct RelayClientConfig {
    pub agent_id: AgentId,
    pub cluster_id: String,
    pub ip_addresses: Vec<IpAddr>,
    /// Pause before reconnecting after a failure
    pub reconnect_cooldown: Duration,
}

impl RelayClientConfig {
    pub fn new(agent_id: AgentId, cluster_id: impl Into<String>) -> Self {
        Self {
            agent_id,
            cluster_id: cluster_id.into(),
            ip_addresses: Vec::new(),
            reconnect_cooldown: Duration::from_secs(5),
        }
    }

    pub fn with_ip(mut self, ip: IpAddr) -> Self {
        self.ip_addresses.push(ip);
        self
    }

    pub fn with_cooldown(mut self, cooldown: Duration) -> Self {
        self.reconnect_cooldown = cooldown;
        self
    }
}
