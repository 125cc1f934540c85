use std::collections::{BTreeMap, HashMap, HashSet};
use std::net::IpAddr;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{watch, RwLock};

use crate::config::{ComputeConfig, RelayConfig};
use crate::relay::{PortMapping, PortProtocol, RelayError};

#[derive(Debug)]
struct ClusterRelay {
    config: RelayConfig,
    mappings: BTreeMap<String, PortMapping>,
    revision: watch::Sender<u64>,
}

impl ClusterRelay {
    fn new(config: RelayConfig) -> Self {
        // Start at 1 so a client that has seen nothing gets an answer at once
        let (revision, _) = watch::channel(1);
        Self {
            config,
            mappings: BTreeMap::new(),
            revision,
        }
    }

    fn snapshot(&self) -> (Vec<PortMapping>, u64) {
        (
            self.mappings.values().cloned().collect(),
            *self.revision.borrow(),
        )
    }

    fn bump(&self) {
        self.revision.send_modify(|r| *r += 1);
    }

    fn allocate_ports(&self, count: usize) -> Option<Vec<u16>> {
        let used: HashSet<u16> = self
            .mappings
            .values()
            .flat_map(|m| m.ports.iter().map(|p| p.relay_port))
            .collect();
        let free: Vec<u16> = (self.config.port_range_start..=self.config.port_range_end)
            .filter(|p| !used.contains(p))
            .take(count)
            .collect();
        (free.len() == count).then_some(free)
    }
}

/// Port mappings published for each cluster with a relay.
///
/// Every change bumps the cluster's revision; relay agents long poll on it.
#[derive(Debug, Default)]
pub struct RelayStore {
    clusters: RwLock<HashMap<String, ClusterRelay>>,
}

impl RelayStore {
    pub fn new(config: &ComputeConfig) -> Self {
        let clusters = config
            .clusters
            .iter()
            .filter_map(|c| {
                c.relay
                    .clone()
                    .map(|relay| (c.id.clone(), ClusterRelay::new(relay)))
            })
            .collect();
        Self {
            clusters: RwLock::new(clusters),
        }
    }

    pub async fn has_relay(&self, cluster_id: &str) -> bool {
        self.clusters.read().await.contains_key(cluster_id)
    }

    pub async fn relay_address(&self, cluster_id: &str) -> Option<IpAddr> {
        self.clusters
            .read()
            .await
            .get(cluster_id)
            .map(|c| c.config.public_address)
    }

    /// Reserve relay ports for `agent_ports` and publish the mapping.
    pub async fn publish(
        &self,
        cluster_id: &str,
        lease_id: impl Into<String>,
        agent_ip: IpAddr,
        agent_ports: &[(PortProtocol, u16)],
        allowed_source_ips: Vec<IpAddr>,
    ) -> Result<PortMapping, RelayError> {
        let lease_id = lease_id.into();
        let mut clusters = self.clusters.write().await;
        let cluster = clusters
            .get_mut(cluster_id)
            .ok_or_else(|| RelayError::UnknownCluster(cluster_id.to_string()))?;
        if cluster.mappings.contains_key(&lease_id) {
            return Err(RelayError::InvalidMapping(format!(
                "lease {} is already mapped",
                lease_id
            )));
        }

        let relay_ports = cluster
            .allocate_ports(agent_ports.len())
            .ok_or_else(|| RelayError::PortsExhausted(cluster_id.to_string()))?;

        let mut mapping = PortMapping::new(lease_id.clone(), agent_ip, Utc::now());
        mapping.allowed_source_ips = allowed_source_ips;
        for (&(protocol, agent_port), relay_port) in agent_ports.iter().zip(relay_ports) {
            mapping = mapping.with_port(protocol, relay_port, agent_port);
        }

        cluster.mappings.insert(lease_id, mapping.clone());
        cluster.bump();
        tracing::info!(
            cluster_id,
            lease_id = %mapping.lease_id,
            ports = %mapping.port_summary(),
            "Port mapping published"
        );
        Ok(mapping)
    }

    /// Withdraw the mapping of a lease, wherever it lives.
    pub async fn remove_lease(&self, lease_id: &str) -> bool {
        let mut clusters = self.clusters.write().await;
        for (cluster_id, cluster) in clusters.iter_mut() {
            if cluster.mappings.remove(lease_id).is_some() {
                cluster.bump();
                tracing::info!(cluster_id = %cluster_id, lease_id, "Port mapping removed");
                return true;
            }
        }
        false
    }

    pub async fn snapshot(&self, cluster_id: &str) -> Result<(Vec<PortMapping>, u64), RelayError> {
        self.clusters
            .read()
            .await
            .get(cluster_id)
            .map(ClusterRelay::snapshot)
            .ok_or_else(|| RelayError::UnknownCluster(cluster_id.to_string()))
    }

    /// Wait until the cluster's revision differs from `revision` or `timeout`
    /// passes, then return the current mappings and revision.
    pub async fn wait_for_change(
        &self,
        cluster_id: &str,
        revision: u64,
        timeout: Duration,
    ) -> Result<(Vec<PortMapping>, u64), RelayError> {
        let mut rx = {
            let clusters = self.clusters.read().await;
            let cluster = clusters
                .get(cluster_id)
                .ok_or_else(|| RelayError::UnknownCluster(cluster_id.to_string()))?;
            cluster.revision.subscribe()
        };

        // Timing out just means no change
        let _ = tokio::time::timeout(timeout, rx.wait_for(|r| *r != revision)).await;
        self.snapshot(cluster_id).await
    }
}
