use std::time::Duration;

use tokio_stream::StreamExt;
use tonic::transport::Endpoint;

use crate::grpc::convert;
use crate::proto::relay_service_client::RelayServiceClient;
use crate::proto::GetPortMappingsRequest;
use crate::relay::client::PortMappingStream;
use crate::relay::{PortMappingRequest, PortMappingSource, PortMappingUpdate, RelayError};

/// Follows the server's `GetPortMappings` stream.
#[derive(Debug, Clone)]
pub struct GrpcPortMappingSource {
    server_addr: String,
    connect_timeout: Duration,
}

impl GrpcPortMappingSource {
    pub fn new(server_addr: impl Into<String>) -> Self {
        Self {
            server_addr: server_addr.into(),
            connect_timeout: Duration::from_secs(5),
        }
    }

    fn uri(&self) -> String {
        if self.server_addr.starts_with("http://") || self.server_addr.starts_with("https://") {
            self.server_addr.clone()
        } else {
            format!("http://{}", self.server_addr)
        }
    }
}

#[tonic::async_trait]
impl PortMappingSource for GrpcPortMappingSource {
    async fn open(&self, request: PortMappingRequest) -> Result<PortMappingStream, RelayError> {
        let endpoint = Endpoint::from_shared(self.uri())
            .map_err(|e| RelayError::Transport(format!("Invalid endpoint: {}", e)))?
            .connect_timeout(self.connect_timeout);
        let channel = endpoint.connect().await.map_err(|e| {
            RelayError::Transport(format!("Failed to connect to {}: {}", self.server_addr, e))
        })?;
        let mut client = RelayServiceClient::new(channel);

        let stream = client
            .get_port_mappings(GetPortMappingsRequest {
                agent_id: request.agent_id.to_string(),
                cluster_id: request.cluster_id,
                ip_addresses: request.ip_addresses.iter().map(ToString::to_string).collect(),
                revision_count: i32::try_from(request.revision).unwrap_or(i32::MAX),
            })
            .await?
            .into_inner();

        let updates = stream.map(|item| -> Result<PortMappingUpdate, RelayError> {
            let response = item?;
            let mappings = response
                .port_mappings
                .into_iter()
                .map(convert::port_mapping_from_proto)
                .collect::<Result<Vec<_>, _>>()?;
            Ok(PortMappingUpdate {
                mappings,
                revision: u64::try_from(response.revision_count).unwrap_or(0),
            })
        });
        Ok(Box::pin(updates))
    }
}
