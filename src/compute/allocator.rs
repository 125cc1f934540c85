use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;

use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::agent::{AgentId, AgentStatus, AgentTable};
use crate::compute::cluster::find_best_compute_cluster_id;
use crate::compute::{ComputeError, Requirements};
use crate::config::{ComputeClusterConfig, ComputeConfig};
use crate::lease::{LeaseId, LeaseOptions, LeaseRegistry};
use crate::relay::{PortProtocol, RelayError, RelayStore};

pub const COMPUTE_TASK_TYPE: &str = "compute";
/// Channel every compute resource exposes
pub const COMPUTE_PORT_NAME: &str = "compute";
/// Cluster of agents that did not name one
pub const DEFAULT_COMPUTE_CLUSTER: &str = "default";

const AES_KEY_LEN: usize = 32;
const AES_NONCE_LEN: usize = 12;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionMode {
    #[default]
    Direct,
    Tunnel,
    Relay,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Encryption {
    #[default]
    None,
    Ssl,
    Aes,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConnectionPreferences {
    pub prefer_public_ip: bool,
    pub client_public_ip: Option<IpAddr>,
    /// Extra named channels and the agent port each one listens on
    pub ports: HashMap<String, u16>,
    pub encryption: Encryption,
    pub inactivity_timeout_ms: u32,
    pub mode: Option<ConnectionMode>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ComputeRequest {
    pub requirements: Requirements,
    pub connection: ConnectionPreferences,
    pub request_id: Option<String>,
}

/// Where an allocation request came from.
#[derive(Debug, Clone, PartialEq)]
pub struct Requester {
    pub addr: IpAddr,
    /// Raw `x-forwarded-for` header, if any
    pub forwarded_for: Option<String>,
}

impl Requester {
    pub fn new(addr: IpAddr) -> Self {
        Self {
            addr,
            forwarded_for: None,
        }
    }

    pub fn with_forwarded_for(mut self, header: impl Into<String>) -> Self {
        self.forwarded_for = Some(header.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortInfo {
    /// Port the requester connects to
    pub port: u16,
    /// Port the agent listens on
    pub agent_port: u16,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ComputeResource {
    pub agent_id: AgentId,
    pub agent_version: String,
    pub ip: IpAddr,
    pub port: u16,
    pub ports: HashMap<String, PortInfo>,
    pub connection_mode: ConnectionMode,
    pub connection_address: Option<String>,
    pub encryption: Encryption,
    pub key: Vec<u8>,
    pub nonce: Vec<u8>,
    pub certificate: Vec<u8>,
    pub cluster_id: String,
    pub properties: Vec<String>,
    pub assigned_resources: HashMap<String, i32>,
    pub lease_id: LeaseId,
}

/// Payload of a compute lease.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComputeTask {
    pub ports: HashMap<String, u16>,
    pub encryption: Encryption,
    pub key: String,
    pub nonce: String,
    pub certificate: String,
    pub inactivity_timeout_ms: u32,
    pub request_id: Option<String>,
}

#[derive(Debug, Clone, Default)]
struct KeyMaterial {
    key: Vec<u8>,
    nonce: Vec<u8>,
    certificate: Vec<u8>,
}

fn generate_key_material(encryption: Encryption) -> Result<KeyMaterial, ComputeError> {
    match encryption {
        Encryption::None => Ok(KeyMaterial::default()),
        Encryption::Aes => {
            let mut key = vec![0u8; AES_KEY_LEN];
            let mut nonce = vec![0u8; AES_NONCE_LEN];
            OsRng.fill_bytes(&mut key);
            OsRng.fill_bytes(&mut nonce);
            Ok(KeyMaterial {
                key,
                nonce,
                certificate: Vec::new(),
            })
        }
        Encryption::Ssl => {
            let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()])
                .map_err(|e| {
                    ComputeError::service(format!("certificate generation failed: {}", e))
                })?;
            let certificate = cert.serialize_der().map_err(|e| {
                ComputeError::service(format!("certificate encoding failed: {}", e))
            })?;
            Ok(KeyMaterial {
                key: cert.serialize_private_key_der(),
                nonce: Vec::new(),
                certificate,
            })
        }
    }
}

/// Resolve the address the request should be attributed to.
pub fn resolve_requester_ip(
    config: &ComputeConfig,
    requester: &Requester,
    connection: &ConnectionPreferences,
) -> IpAddr {
    let mut ip = requester.addr;
    if config.trust_forwarded_for {
        let forwarded = requester
            .forwarded_for
            .as_deref()
            .and_then(|h| h.split(',').next())
            .and_then(|first| first.trim().parse::<IpAddr>().ok());
        if let Some(forwarded) = forwarded {
            ip = forwarded;
        }
    }
    if connection.prefer_public_ip && config.trust_client_public_ip {
        if let Some(public) = connection.client_public_ip {
            ip = public;
        }
    }
    ip.to_canonical()
}

/// Connection mode plus the address the requester should dial.
fn choose_connection(
    connection: &ConnectionPreferences,
    cluster: &ComputeClusterConfig,
    agent_ip: IpAddr,
    agent_public_ip: Option<IpAddr>,
) -> (ConnectionMode, IpAddr) {
    let has_relay = cluster.relay.is_some();
    match connection.mode {
        Some(ConnectionMode::Relay) if has_relay => return (ConnectionMode::Relay, agent_ip),
        Some(ConnectionMode::Tunnel) if cluster.tunnel_address.is_some() => {
            return (ConnectionMode::Tunnel, agent_ip)
        }
        _ => {}
    }
    if connection.prefer_public_ip {
        if let Some(public) = agent_public_ip {
            return (ConnectionMode::Direct, public);
        }
        if has_relay {
            return (ConnectionMode::Relay, agent_ip);
        }
    }
    (ConnectionMode::Direct, agent_ip)
}

/// Places `compute` leases on agents for ad hoc requesters.
#[derive(Debug)]
pub struct ComputeAllocator {
    config: ComputeConfig,
    agents: Arc<AgentTable>,
    registry: Arc<LeaseRegistry>,
    relay: Arc<RelayStore>,
}

impl ComputeAllocator {
    pub fn new(
        config: ComputeConfig,
        agents: Arc<AgentTable>,
        registry: Arc<LeaseRegistry>,
        relay: Arc<RelayStore>,
    ) -> Self {
        Self {
            config,
            agents,
            registry,
            relay,
        }
    }

    pub fn config(&self) -> &ComputeConfig {
        &self.config
    }

    pub fn get_compute_cluster_id(
        &self,
        connection: &ConnectionPreferences,
        requester: &Requester,
    ) -> Result<String, ComputeError> {
        let ip = resolve_requester_ip(&self.config, requester, connection);
        find_best_compute_cluster_id(&self.config.clusters, ip)
    }

    /// Allocate a compute resource, waiting for capacity up to the configured
    /// allocation wait.
    pub async fn try_allocate(
        &self,
        request: &ComputeRequest,
        requester: &Requester,
        cancel: &CancellationToken,
    ) -> Result<ComputeResource, ComputeError> {
        let ip = resolve_requester_ip(&self.config, requester, &request.connection);
        let cluster_id = find_best_compute_cluster_id(&self.config.clusters, ip)?;
        let cluster = self
            .config
            .cluster(&cluster_id)
            .ok_or_else(|| ComputeError::NoMatchingCluster(ip.to_string()))?;

        if !cluster.access.authorizes(ip) {
            tracing::warn!(
                requester = %ip,
                cluster_id = %cluster_id,
                "Compute request denied by access policy"
            );
            return Err(ComputeError::Forbidden(ip.to_string()));
        }

        let deadline = Instant::now() + self.config.allocation_wait();
        loop {
            if cancel.is_cancelled() {
                return Err(ComputeError::Cancelled);
            }
            if let Some(resource) = self.try_place(request, cluster, ip).await? {
                tracing::info!(
                    requester = %ip,
                    cluster_id = %cluster_id,
                    agent_id = %resource.agent_id,
                    lease_id = %resource.lease_id,
                    mode = ?resource.connection_mode,
                    "Compute resource allocated"
                );
                return Ok(resource);
            }
            if Instant::now() >= deadline {
                tracing::debug!(
                    requester = %ip,
                    cluster_id = %cluster_id,
                    "No compute resources available"
                );
                return Err(ComputeError::no_resources(format!(
                    "no agent in cluster '{}' can satisfy the request",
                    cluster_id
                )));
            }

            let wait = self.config.retry_interval();
            tokio::select! {
                _ = cancel.cancelled() => return Err(ComputeError::Cancelled),
                _ = self.agents.capacity_changed() => {}
                _ = tokio::time::sleep_until(deadline.min(Instant::now() + wait)) => {}
            }
        }
    }

    /// One scan over the cluster's agents.
    async fn try_place(
        &self,
        request: &ComputeRequest,
        cluster: &ComputeClusterConfig,
        requester_ip: IpAddr,
    ) -> Result<Option<ComputeResource>, ComputeError> {
        for entry in self.agents.all().await {
            let mut agent = entry.lock().await;

            let agent_cluster = agent
                .compute_cluster
                .as_deref()
                .unwrap_or(DEFAULT_COMPUTE_CLUSTER);
            if agent_cluster != cluster.id
                || !agent.is_online()
                || agent.status != AgentStatus::Ok
                || !agent.enabled
                || !request.requirements.matches(&agent)
            {
                continue;
            }
            let Some(agent_ip) = agent.ip_address else {
                tracing::debug!(agent_id = %agent.id, "Skipping agent without an address");
                continue;
            };
            let Some(session_id) = agent.session.as_ref().map(|s| s.id) else {
                continue;
            };
            let Some(assigned) = request.requirements.allocate(&agent) else {
                continue;
            };

            let connection = &request.connection;
            let (mode, ip) =
                choose_connection(connection, cluster, agent_ip, agent.public_ip_address);

            let mut agent_ports = connection.ports.clone();
            agent_ports
                .entry(COMPUTE_PORT_NAME.to_string())
                .or_insert(self.config.compute_port);

            let keys = generate_key_material(connection.encryption)?;
            let task = ComputeTask {
                ports: agent_ports.clone(),
                encryption: connection.encryption,
                key: hex::encode(&keys.key),
                nonce: hex::encode(&keys.nonce),
                certificate: hex::encode(&keys.certificate),
                inactivity_timeout_ms: connection.inactivity_timeout_ms,
                request_id: request.request_id.clone(),
            };
            let payload = serde_json::to_vec(&task).map_err(|e| {
                ComputeError::service(format!("failed to encode compute task: {}", e))
            })?;

            let options = LeaseOptions::new(format!("Compute for {}", requester_ip), payload)
                .with_exclusive(request.requirements.exclusive)
                .with_resources(assigned.clone());
            let lease = self
                .registry
                .create(agent.id.clone(), session_id, COMPUTE_TASK_TYPE, options)
                .await;

            let (resource_ip, ports, connection_address) = match mode {
                ConnectionMode::Relay => {
                    let published = self
                        .publish_relay(&cluster.id, &lease.id, agent_ip, &agent_ports, requester_ip)
                        .await;
                    match published {
                        Ok(published) => published,
                        Err(e) => {
                            // Undo the reservation; the agent never saw the lease
                            if self.registry.cancel(&lease.id).await.is_ok() {
                                self.registry.retire(&lease.id).await;
                            }
                            return Err(match e {
                                RelayError::PortsExhausted(_) => {
                                    ComputeError::no_resources(e.to_string())
                                }
                                other => ComputeError::service(other.to_string()),
                            });
                        }
                    }
                }
                ConnectionMode::Tunnel => (
                    ip,
                    direct_ports(&agent_ports),
                    cluster.tunnel_address.clone(),
                ),
                ConnectionMode::Direct => (ip, direct_ports(&agent_ports), None),
            };

            agent.attach_lease(&lease);
            let resource = ComputeResource {
                agent_id: agent.id.clone(),
                agent_version: agent.version.clone(),
                ip: resource_ip,
                port: ports
                    .get(COMPUTE_PORT_NAME)
                    .map(|p| p.port)
                    .unwrap_or(self.config.compute_port),
                ports,
                connection_mode: mode,
                connection_address,
                encryption: connection.encryption,
                key: keys.key,
                nonce: keys.nonce,
                certificate: keys.certificate,
                cluster_id: cluster.id.clone(),
                properties: agent.properties.clone(),
                assigned_resources: assigned,
                lease_id: lease.id,
            };
            drop(agent);

            // Push the new lease down the agent's session stream
            entry.notify_leases_changed();
            return Ok(Some(resource));
        }
        Ok(None)
    }

    async fn publish_relay(
        &self,
        cluster_id: &str,
        lease_id: &LeaseId,
        agent_ip: IpAddr,
        agent_ports: &HashMap<String, u16>,
        requester_ip: IpAddr,
    ) -> Result<(IpAddr, HashMap<String, PortInfo>, Option<String>), RelayError> {
        let relay_ip = self
            .relay
            .relay_address(cluster_id)
            .await
            .ok_or_else(|| RelayError::UnknownCluster(cluster_id.to_string()))?;

        // Stable order so names line up with the published rules
        let mut named: Vec<(&String, &u16)> = agent_ports.iter().collect();
        named.sort();
        let rules: Vec<(PortProtocol, u16)> =
            named.iter().map(|(_, p)| (PortProtocol::Tcp, **p)).collect();

        let mapping = self
            .relay
            .publish(cluster_id, lease_id.to_string(), agent_ip, &rules, vec![requester_ip])
            .await?;

        let ports = named
            .iter()
            .zip(&mapping.ports)
            .map(|((name, _), rule)| {
                (
                    name.to_string(),
                    PortInfo {
                        port: rule.relay_port,
                        agent_port: rule.agent_port,
                    },
                )
            })
            .collect::<HashMap<_, _>>();
        let address = ports
            .get(COMPUTE_PORT_NAME)
            .map(|p| format!("{}:{}", relay_ip, p.port));
        Ok((relay_ip, ports, address))
    }
}

fn direct_ports(agent_ports: &HashMap<String, u16>) -> HashMap<String, PortInfo> {
    agent_ports
        .iter()
        .map(|(name, &port)| {
            (
                name.clone(),
                PortInfo {
                    port,
                    agent_port: port,
                },
            )
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RelayConfig;

    fn config() -> ComputeConfig {
        ComputeConfig::default()
    }

    #[test]
    fn requester_ip_defaults_to_socket_address() {
        let requester = Requester::new("10.0.0.1".parse().unwrap()).with_forwarded_for("1.2.3.4");
        let connection = ConnectionPreferences {
            prefer_public_ip: true,
            client_public_ip: Some("5.6.7.8".parse().unwrap()),
            ..Default::default()
        };
        let ip = resolve_requester_ip(&config(), &requester, &connection);
        assert_eq!(ip, "10.0.0.1".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn mapped_ipv4_requester_is_canonical() {
        let requester = Requester::new("::ffff:10.0.0.1".parse().unwrap());
        let ip = resolve_requester_ip(&config(), &requester, &ConnectionPreferences::default());
        assert_eq!(ip, "10.0.0.1".parse::<IpAddr>().unwrap());
        assert!(ip.is_ipv4());

        let native = Requester::new("2001:db8::1".parse().unwrap());
        let ip = resolve_requester_ip(&config(), &native, &ConnectionPreferences::default());
        assert_eq!(ip, "2001:db8::1".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn trusted_forwarded_for_uses_first_entry() {
        let mut cfg = config();
        cfg.trust_forwarded_for = true;
        let requester =
            Requester::new("10.0.0.1".parse().unwrap()).with_forwarded_for(" 1.2.3.4 , 9.9.9.9");
        let ip = resolve_requester_ip(&cfg, &requester, &ConnectionPreferences::default());
        assert_eq!(ip, "1.2.3.4".parse::<IpAddr>().unwrap());

        // Garbage is ignored
        let requester = Requester::new("10.0.0.1".parse().unwrap()).with_forwarded_for("nope");
        let ip = resolve_requester_ip(&cfg, &requester, &ConnectionPreferences::default());
        assert_eq!(ip, "10.0.0.1".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn client_public_ip_needs_preference_and_trust() {
        let mut cfg = config();
        cfg.trust_client_public_ip = true;
        let requester = Requester::new("10.0.0.1".parse().unwrap());
        let mut connection = ConnectionPreferences {
            client_public_ip: Some("5.6.7.8".parse().unwrap()),
            ..Default::default()
        };
        assert_eq!(
            resolve_requester_ip(&cfg, &requester, &connection),
            "10.0.0.1".parse::<IpAddr>().unwrap()
        );
        connection.prefer_public_ip = true;
        assert_eq!(
            resolve_requester_ip(&cfg, &requester, &connection),
            "5.6.7.8".parse::<IpAddr>().unwrap()
        );
    }

    #[test]
    fn connection_mode_rules() {
        let agent_ip: IpAddr = "10.0.0.5".parse().unwrap();
        let public: IpAddr = "203.0.113.9".parse().unwrap();
        let plain = ComputeClusterConfig::new("plain");
        let relayed = ComputeClusterConfig::new("edge").with_relay(RelayConfig {
            public_address: "203.0.113.5".parse().unwrap(),
            port_range_start: 10000,
            port_range_end: 10010,
        });
        let tunneled = ComputeClusterConfig::new("tun").with_tunnel("tunnel.internal:443");

        let relay_pref = ConnectionPreferences {
            mode: Some(ConnectionMode::Relay),
            ..Default::default()
        };
        assert_eq!(
            choose_connection(&relay_pref, &relayed, agent_ip, None).0,
            ConnectionMode::Relay
        );
        // Not honoured without a relay
        assert_eq!(
            choose_connection(&relay_pref, &plain, agent_ip, None).0,
            ConnectionMode::Direct
        );

        let tunnel_pref = ConnectionPreferences {
            mode: Some(ConnectionMode::Tunnel),
            ..Default::default()
        };
        assert_eq!(
            choose_connection(&tunnel_pref, &tunneled, agent_ip, None).0,
            ConnectionMode::Tunnel
        );

        let public_pref = ConnectionPreferences {
            prefer_public_ip: true,
            ..Default::default()
        };
        assert_eq!(
            choose_connection(&public_pref, &plain, agent_ip, Some(public)),
            (ConnectionMode::Direct, public)
        );
        assert_eq!(
            choose_connection(&public_pref, &relayed, agent_ip, None).0,
            ConnectionMode::Relay
        );
        assert_eq!(
            choose_connection(&ConnectionPreferences::default(), &relayed, agent_ip, Some(public)),
            (ConnectionMode::Direct, agent_ip)
        );
    }

    #[test]
    fn key_material_sizes() {
        let aes = generate_key_material(Encryption::Aes).unwrap();
        assert_eq!(aes.key.len(), 32);
        assert_eq!(aes.nonce.len(), 12);
        assert!(aes.certificate.is_empty());

        let again = generate_key_material(Encryption::Aes).unwrap();
        assert_ne!(aes.key, again.key);

        let ssl = generate_key_material(Encryption::Ssl).unwrap();
        assert!(!ssl.certificate.is_empty());
        assert!(!ssl.key.is_empty());

        let none = generate_key_material(Encryption::None).unwrap();
        assert!(none.key.is_empty() && none.nonce.is_empty());
    }
}
