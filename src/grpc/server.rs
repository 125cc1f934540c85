use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tonic::transport::Server;

use crate::compute::ComputeAllocator;
use crate::grpc::agent_service::AgentServiceImpl;
use crate::grpc::compute_service::ComputeServiceImpl;
use crate::grpc::relay_service::RelayServiceImpl;
use crate::proto::agent_service_server::AgentServiceServer;
use crate::proto::compute_service_server::ComputeServiceServer;
use crate::proto::relay_service_server::RelayServiceServer;
use crate::relay::RelayStore;
use crate::session::SessionHandler;

/// How long a relay long poll waits before sending a keepalive
const RELAY_POLL_TIMEOUT: Duration = Duration::from_secs(30);

pub struct GrpcServer {
    addr: SocketAddr,
    handler: Arc<SessionHandler>,
    allocator: Arc<ComputeAllocator>,
    relay: Arc<RelayStore>,
    relay_poll_timeout: Duration,
}

impl GrpcServer {
    pub fn new(
        addr: SocketAddr,
        handler: Arc<SessionHandler>,
        allocator: Arc<ComputeAllocator>,
        relay: Arc<RelayStore>,
    ) -> Self {
        Self {
            addr,
            handler,
            allocator,
            relay,
            relay_poll_timeout: RELAY_POLL_TIMEOUT,
        }
    }

    pub fn with_relay_poll_timeout(mut self, timeout: Duration) -> Self {
        self.relay_poll_timeout = timeout;
        self
    }

    /// Serve until `shutdown` is cancelled.
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), tonic::transport::Error> {
        let agent_service = AgentServiceImpl::new(self.handler.clone());
        let compute_service = ComputeServiceImpl::new(self.allocator.clone(), shutdown.clone());
        let relay_service =
            RelayServiceImpl::new(self.relay.clone(), self.relay_poll_timeout, shutdown.clone());

        tracing::info!(addr = %self.addr, "Starting gRPC server");

        Server::builder()
            .add_service(AgentServiceServer::new(agent_service))
            .add_service(ComputeServiceServer::new(compute_service))
            .add_service(RelayServiceServer::new(relay_service))
            .serve_with_shutdown(self.addr, async move { shutdown.cancelled().await })
            .await
    }
}
