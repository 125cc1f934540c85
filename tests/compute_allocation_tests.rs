//! Compute allocation against a wired node, without the gRPC layer.

use std::net::IpAddr;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use herd_lite::agent::{AgentId, AgentRegistration, AgentStatus};
use herd_lite::compute::{
    ComputeError, ComputeRequest, ComputeTask, ConnectionMode, ConnectionPreferences, Encryption,
    Requester, Requirements, ResourceRange, COMPUTE_PORT_NAME,
};
use herd_lite::config::{AccessPolicy, ComputeClusterConfig, ComputeConfig, ServerConfig};
use herd_lite::node::Node;
use herd_lite::session::SessionUpdate;

fn compute_config(allocation_wait_ms: u64) -> ComputeConfig {
    let mut config = ComputeConfig::default().with_cluster(
        ComputeClusterConfig::new("lab")
            .with_network("10.1.0.0/16".parse().unwrap())
            .with_access(AccessPolicy::allow_all()),
    );
    config.allocation_wait_ms = allocation_wait_ms;
    config.retry_interval_ms = 20;
    config
}

fn node(allocation_wait_ms: u64) -> Node {
    Node::new(ServerConfig::default().with_compute(compute_config(allocation_wait_ms)))
}

fn requester() -> Requester {
    Requester::new("10.1.2.3".parse().unwrap())
}

/// Register an agent in the `lab` cluster and bring its session online.
async fn online_agent(node: &Node, id: &str, cpus: i32) {
    let ip: IpAddr = "10.1.0.50".parse().unwrap();
    let registration = AgentRegistration::new(id, "1.0")
        .with_cluster("lab")
        .with_ip(ip)
        .with_resource("cpu", cpus);
    let session = node.handler.create_session(registration).await.unwrap();
    node.handler
        .update_session(SessionUpdate::new(
            AgentId::new(id),
            session.id,
            AgentStatus::Ok,
        ))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_allocation_reserves_resources_on_agent() {
    let node = node(0);
    online_agent(&node, "a1", 8).await;

    let request = ComputeRequest {
        requirements: Requirements::default().with_resource("cpu", ResourceRange::between(2, 4)),
        connection: ConnectionPreferences {
            encryption: Encryption::Aes,
            inactivity_timeout_ms: 30_000,
            ..Default::default()
        },
        request_id: Some("req-1".to_string()),
    };
    let resource = node
        .allocator
        .try_allocate(&request, &requester(), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(resource.agent_id, AgentId::new("a1"));
    assert_eq!(resource.cluster_id, "lab");
    assert_eq!(resource.connection_mode, ConnectionMode::Direct);
    assert_eq!(resource.port, 7000);
    assert_eq!(resource.ports[COMPUTE_PORT_NAME].agent_port, 7000);
    assert_eq!(resource.assigned_resources["cpu"], 4);
    assert_eq!(resource.key.len(), 32);
    assert_eq!(resource.nonce.len(), 12);

    let lease = node.registry.get(&resource.lease_id).await.unwrap();
    assert_eq!(lease.task_type, "compute");
    let task: ComputeTask = serde_json::from_slice(&lease.payload).unwrap();
    assert_eq!(task.key, hex::encode(&resource.key));
    assert_eq!(task.request_id.as_deref(), Some("req-1"));
    assert_eq!(task.inactivity_timeout_ms, 30_000);

    // Only 4 CPUs left, so a request for 6 cannot land
    let greedy = ComputeRequest {
        requirements: Requirements::default().with_resource("cpu", ResourceRange::exactly(6)),
        ..Default::default()
    };
    let err = node
        .allocator
        .try_allocate(&greedy, &requester(), &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, ComputeError::NoComputeResources { .. }));
}

#[tokio::test]
async fn test_exclusive_allocation_blocks_the_agent() {
    let node = node(0);
    online_agent(&node, "a1", 4).await;

    let exclusive = ComputeRequest {
        requirements: Requirements::default().with_exclusive(true),
        ..Default::default()
    };
    let resource = node
        .allocator
        .try_allocate(&exclusive, &requester(), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(resource.assigned_resources["cpu"], 4);

    let err = node
        .allocator
        .try_allocate(&ComputeRequest::default(), &requester(), &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(err.is_retryable());
}

#[tokio::test]
async fn test_allocation_waits_for_an_agent() {
    let node = node(2_000);

    let allocator = node.allocator.clone();
    let pending = tokio::spawn(async move {
        allocator
            .try_allocate(&ComputeRequest::default(), &requester(), &CancellationToken::new())
            .await
    });

    tokio::time::sleep(Duration::from_millis(50)).await;
    online_agent(&node, "late", 2).await;

    let resource = tokio::time::timeout(Duration::from_secs(2), pending)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(resource.agent_id, AgentId::new("late"));
}

#[tokio::test]
async fn test_waiting_allocation_is_cancelled() {
    let node = node(10_000);
    let cancel = CancellationToken::new();

    let allocator = node.allocator.clone();
    let token = cancel.clone();
    let pending = tokio::spawn(async move {
        allocator
            .try_allocate(&ComputeRequest::default(), &requester(), &token)
            .await
    });

    tokio::time::sleep(Duration::from_millis(50)).await;
    cancel.cancel();

    let result = tokio::time::timeout(Duration::from_secs(1), pending)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(result.unwrap_err(), ComputeError::Cancelled);
}

#[tokio::test]
async fn test_denied_and_unmatched_requesters() {
    let mut config = compute_config(0);
    config
        .clusters
        .push(ComputeClusterConfig::new("closed").with_network("10.2.0.0/16".parse().unwrap()));
    let node = Node::new(ServerConfig::default().with_compute(config));
    online_agent(&node, "a1", 4).await;

    let closed = Requester::new("10.2.0.9".parse().unwrap());
    let err = node
        .allocator
        .try_allocate(&ComputeRequest::default(), &closed, &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, ComputeError::Forbidden(_)));

    let stranger = Requester::new("192.0.2.1".parse().unwrap());
    let err = node
        .allocator
        .get_compute_cluster_id(&ConnectionPreferences::default(), &stranger)
        .unwrap_err();
    assert!(matches!(err, ComputeError::NoMatchingCluster(_)));

    assert_eq!(
        node.allocator
            .get_compute_cluster_id(&ConnectionPreferences::default(), &requester())
            .unwrap(),
        "lab"
    );
}

/// IPv4 peers seen through a dual-stack listener still match IPv4 clusters.
#[tokio::test]
async fn test_mapped_ipv4_requester_matches_cluster() {
    let node = node(0);
    online_agent(&node, "a1", 4).await;

    let mapped = Requester::new("::ffff:10.1.2.3".parse().unwrap());
    assert_eq!(
        node.allocator
            .get_compute_cluster_id(&ConnectionPreferences::default(), &mapped)
            .unwrap(),
        "lab"
    );
    let resource = node
        .allocator
        .try_allocate(&ComputeRequest::default(), &mapped, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(resource.cluster_id, "lab");
}
