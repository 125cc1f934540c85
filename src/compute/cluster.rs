use std::net::IpAddr;

use crate::compute::ComputeError;
use crate::config::ComputeClusterConfig;

/// The first cluster, in configuration order, with a network containing `ip`.
pub fn find_best_compute_cluster_id(
    clusters: &[ComputeClusterConfig],
    ip: IpAddr,
) -> Result<String, ComputeError> {
    clusters
        .iter()
        .find(|c| c.networks.iter().any(|net| net.contains(&ip)))
        .map(|c| c.id.clone())
        .ok_or_else(|| ComputeError::NoMatchingCluster(ip.to_string()))
}
