use std::net::IpAddr;
use std::pin::Pin;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::Mutex;
use tokio_stream::{Stream, StreamExt};
use tokio_util::sync::CancellationToken;

use crate::agent::AgentId;
use crate::config::RelayClientConfig;
use crate::relay::{Firewall, MappingDiff, PortMapping, RelayError};

#[derive(Debug, Clone, PartialEq)]
pub struct PortMappingRequest {
    pub agent_id: AgentId,
    pub cluster_id: String,
    pub ip_addresses: Vec<IpAddr>,
    /// Last revision applied; the server only answers once it moves on
    pub revision: u64,
}

#[derive(Debug, Clone)]
pub struct PortMappingUpdate {
    pub mappings: Vec<PortMapping>,
    pub revision: u64,
}

pub type PortMappingStream =
    Pin<Box<dyn Stream<Item = Result<PortMappingUpdate, RelayError>> + Send>>;

/// Where relay agents get their mapping updates from.
#[tonic::async_trait]
pub trait PortMappingSource: Send + Sync {
    async fn open(&self, request: PortMappingRequest) -> Result<PortMappingStream, RelayError>;
}

#[derive(Debug, Default)]
struct AppliedState {
    revision: u64,
    mappings: Vec<PortMapping>,
}

/// Keeps a relay agent's firewall in step with the server's mappings.
pub struct AgentRelayClient {
    config: RelayClientConfig,
    source: Arc<dyn PortMappingSource>,
    firewall: Arc<dyn Firewall>,
    state: Mutex<AppliedState>,
}

impl AgentRelayClient {
    pub fn new(
        config: RelayClientConfig,
        source: Arc<dyn PortMappingSource>,
        firewall: Arc<dyn Firewall>,
    ) -> Self {
        Self {
            config,
            source,
            firewall,
            state: Mutex::new(AppliedState::default()),
        }
    }

    pub async fn revision(&self) -> u64 {
        self.state.lock().await.revision
    }

    pub async fn applied(&self) -> Vec<PortMapping> {
        self.state.lock().await.mappings.clone()
    }

    /// Run until `cancel` fires.
    pub async fn run(&self, cancel: CancellationToken) {
        tracing::info!(
            agent_id = %self.config.agent_id,
            cluster_id = %self.config.cluster_id,
            "Relay client started"
        );

        while !cancel.is_cancelled() {
            match self.follow(&cancel).await {
                Ok(()) => {
                    tracing::debug!("Port mapping stream ended, reconnecting");
                }
                Err(RelayError::Cancelled) => {
                    if cancel.is_cancelled() {
                        break;
                    }
                    tracing::debug!("Port mapping stream cancelled by peer, reconnecting");
                }
                Err(e) => {
                    tracing::warn!(
                        error = %e,
                        cooldown_ms = self.config.reconnect_cooldown.as_millis() as u64,
                        "Relay update failed, retrying after cooldown"
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(self.config.reconnect_cooldown) => {}
                    }
                }
            }
        }

        tracing::info!(agent_id = %self.config.agent_id, "Relay client stopped");
    }

    /// Follow one stream until it ends or fails.
    async fn follow(&self, cancel: &CancellationToken) -> Result<(), RelayError> {
        let request = PortMappingRequest {
            agent_id: self.config.agent_id.clone(),
            cluster_id: self.config.cluster_id.clone(),
            ip_addresses: self.config.ip_addresses.clone(),
            revision: self.revision().await,
        };

        let mut stream = tokio::select! {
            _ = cancel.cancelled() => return Err(RelayError::Cancelled),
            opened = self.source.open(request) => opened?,
        };

        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => return Err(RelayError::Cancelled),
                next = stream.next() => next,
            };
            match next {
                None => return Ok(()),
                Some(update) => self.apply(update?).await?,
            }
        }
    }

    async fn apply(&self, update: PortMappingUpdate) -> Result<(), RelayError> {
        let mut state = self.state.lock().await;
        if update.revision == state.revision {
            return Ok(());
        }

        let diff = MappingDiff::between(&state.mappings, &update.mappings);
        if !diff.is_empty() {
            self.firewall.apply(&diff.removed, &diff.added).await?;
        }

        let now = Utc::now();
        for mapping in &diff.removed {
            tracing::info!(revision = update.revision, "Removed: {}", mapping.describe(now));
        }
        for mapping in &diff.added {
            tracing::info!(revision = update.revision, "Added: {}", mapping.describe(now));
        }

        state.revision = update.revision;
        state.mappings = update.mappings;
        Ok(())
    }
}
