use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::Stream;
use tokio_util::sync::CancellationToken;
use tonic::{Request, Response, Status};

use crate::grpc::convert;
use crate::proto::relay_service_server::RelayService;
use crate::proto::{GetPortMappingsRequest, GetPortMappingsResponse};
use crate::relay::{RelayError, RelayStore};

/// Publishes port mappings to relay agents.
///
/// Each stream long polls the store. A response whose revision equals the
/// previous one is a keepalive and carries no mappings.
pub struct RelayServiceImpl {
    store: Arc<RelayStore>,
    poll_timeout: Duration,
    shutdown: CancellationToken,
}

impl RelayServiceImpl {
    pub fn new(
        store: Arc<RelayStore>,
        poll_timeout: Duration,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            store,
            poll_timeout,
            shutdown,
        }
    }
}

type MappingStream = Pin<Box<dyn Stream<Item = Result<GetPortMappingsResponse, Status>> + Send>>;

fn revision_to_proto(revision: u64) -> i32 {
    i32::try_from(revision).unwrap_or(i32::MAX)
}

#[tonic::async_trait]
impl RelayService for RelayServiceImpl {
    type GetPortMappingsStream = MappingStream;

    async fn get_port_mappings(
        &self,
        request: Request<GetPortMappingsRequest>,
    ) -> Result<Response<Self::GetPortMappingsStream>, Status> {
        let req = request.into_inner();
        if !self.store.has_relay(&req.cluster_id).await {
            return Err(RelayError::UnknownCluster(req.cluster_id).into());
        }

        tracing::info!(
            agent_id = %req.agent_id,
            cluster_id = %req.cluster_id,
            revision = req.revision_count,
            ips = ?req.ip_addresses,
            "Relay agent connected"
        );

        let store = self.store.clone();
        let shutdown = self.shutdown.clone();
        let poll_timeout = self.poll_timeout;
        let cluster_id = req.cluster_id;
        let mut revision = u64::try_from(req.revision_count).unwrap_or(0);
        let (tx, rx) = mpsc::channel(4);

        tokio::spawn(async move {
            loop {
                let result = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tx.closed() => break,
                    result = store.wait_for_change(&cluster_id, revision, poll_timeout) => result,
                };

                let response = match result {
                    Ok((_, current)) if current == revision => GetPortMappingsResponse {
                        port_mappings: Vec::new(),
                        revision_count: revision_to_proto(revision),
                    },
                    Ok((mappings, current)) => {
                        tracing::debug!(
                            cluster_id = %cluster_id,
                            revision = current,
                            mappings = mappings.len(),
                            "Sending port mappings"
                        );
                        revision = current;
                        GetPortMappingsResponse {
                            port_mappings: mappings
                                .iter()
                                .map(convert::port_mapping_to_proto)
                                .collect(),
                            revision_count: revision_to_proto(current),
                        }
                    }
                    Err(e) => {
                        let _ = tx.send(Err(e.into())).await;
                        break;
                    }
                };

                if tx.send(Ok(response)).await.is_err() {
                    break;
                }
            }
            tracing::debug!(cluster_id = %cluster_id, "Relay stream closed");
        });

        Ok(Response::new(
            Box::pin(ReceiverStream::new(rx)) as Self::GetPortMappingsStream
        ))
    }
}
