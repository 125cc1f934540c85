use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::agent::AgentTable;
use crate::compute::{ComputeAllocator, ResourceNeedsTracker};
use crate::config::ServerConfig;
use crate::error::Result;
use crate::grpc::GrpcServer;
use crate::http::{run_http, ApiState};
use crate::lease::LeaseRegistry;
use crate::relay::RelayStore;
use crate::session::SessionHandler;
use crate::task_source::{
    JobSource, RestartTaskSource, ShutdownTaskSource, TaskSourceChain, UpgradeTaskSource,
};

/// Server process wiring
pub struct Node {
    pub config: ServerConfig,
    pub agents: Arc<AgentTable>,
    pub registry: Arc<LeaseRegistry>,
    pub relay: Arc<RelayStore>,
    pub jobs: Arc<JobSource>,
    pub upgrades: Arc<UpgradeTaskSource>,
    pub handler: Arc<SessionHandler>,
    pub allocator: Arc<ComputeAllocator>,
}

impl Node {
    pub fn new(config: ServerConfig) -> Self {
        let agents = Arc::new(AgentTable::new());
        let registry = Arc::new(LeaseRegistry::new());
        let relay = Arc::new(RelayStore::new(&config.compute));
        let jobs = Arc::new(JobSource::new(config.job_queue_capacity));
        let upgrades = Arc::new(UpgradeTaskSource::new(config.upgrade.clone()));

        // Administrative work first, generic jobs last
        let chain = TaskSourceChain::default()
            .with_source(Arc::new(RestartTaskSource::new()))
            .with_source(Arc::new(ShutdownTaskSource::new()))
            .with_source(upgrades.clone())
            .with_source(jobs.clone());

        let handler = Arc::new(SessionHandler::new(
            config.session.clone(),
            agents.clone(),
            registry.clone(),
            Arc::new(chain),
            relay.clone(),
            Arc::new(ResourceNeedsTracker::new()),
        ));
        let allocator = Arc::new(ComputeAllocator::new(
            config.compute.clone(),
            agents.clone(),
            registry.clone(),
            relay.clone(),
        ));

        Self {
            config,
            agents,
            registry,
            relay,
            jobs,
            upgrades,
            handler,
            allocator,
        }
    }

    pub fn api_state(&self) -> ApiState {
        ApiState {
            handler: self.handler.clone(),
            jobs: self.jobs.clone(),
            upgrades: self.upgrades.clone(),
        }
    }

    /// Run every subsystem until `shutdown` is cancelled.
    ///
    /// The session expiry monitor and the optional HTTP API run as spawned
    /// tasks; the gRPC server runs on the calling task.
    ///
    /// # Errors
    ///
    /// Returns an error if the gRPC server fails to start or encounters a fatal error.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let handler = self.handler.clone();
        let monitor_shutdown = shutdown.clone();
        tokio::spawn(async move {
            handler.run_expiry_monitor(monitor_shutdown).await;
        });

        if let Some(http_addr) = self.config.http_addr {
            let state = self.api_state();
            let http_shutdown = shutdown.clone();
            tokio::spawn(async move {
                run_http(http_addr, state, http_shutdown).await;
            });
        }

        let server = GrpcServer::new(
            self.config.listen_addr,
            self.handler.clone(),
            self.allocator.clone(),
            self.relay.clone(),
        );
        server.run(shutdown).await?;
        tracing::info!("Server stopped");
        Ok(())
    }
}
