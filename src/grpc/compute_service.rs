use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tonic::{Request, Response, Status};

use crate::compute::{ComputeAllocator, Requester};
use crate::grpc::convert;
use crate::proto::compute_service_server::ComputeService;
use crate::proto::{
    AllocateComputeRequest, AllocateComputeResponse, GetComputeClusterIdRequest,
    GetComputeClusterIdResponse,
};

const FORWARDED_FOR: &str = "x-forwarded-for";

/// Requester-facing compute allocation API
pub struct ComputeServiceImpl {
    allocator: Arc<ComputeAllocator>,
    shutdown: CancellationToken,
}

impl ComputeServiceImpl {
    pub fn new(allocator: Arc<ComputeAllocator>, shutdown: CancellationToken) -> Self {
        Self {
            allocator,
            shutdown,
        }
    }
}

fn requester_of<T>(request: &Request<T>) -> Result<Requester, Status> {
    let addr = request
        .remote_addr()
        .map(|a| a.ip())
        .ok_or_else(|| Status::internal("Peer address unavailable"))?;
    let mut requester = Requester::new(addr);
    if let Some(forwarded) = request
        .metadata()
        .get(FORWARDED_FOR)
        .and_then(|v| v.to_str().ok())
    {
        requester = requester.with_forwarded_for(forwarded);
    }
    Ok(requester)
}

#[tonic::async_trait]
impl ComputeService for ComputeServiceImpl {
    async fn allocate_compute(
        &self,
        request: Request<AllocateComputeRequest>,
    ) -> Result<Response<AllocateComputeResponse>, Status> {
        let requester = requester_of(&request)?;
        let req = convert::compute_request_from_proto(request.into_inner())?;

        // Dropped requests cancel the future; the token covers server shutdown
        let cancel = self.shutdown.child_token();
        let resource = self
            .allocator
            .try_allocate(&req, &requester, &cancel)
            .await?;
        Ok(Response::new(convert::resource_to_proto(resource)))
    }

    async fn get_compute_cluster_id(
        &self,
        request: Request<GetComputeClusterIdRequest>,
    ) -> Result<Response<GetComputeClusterIdResponse>, Status> {
        let requester = requester_of(&request)?;
        let connection = convert::connection_from_proto(request.into_inner().connection)?;
        let cluster_id = self
            .allocator
            .get_compute_cluster_id(&connection, &requester)?;
        Ok(Response::new(GetComputeClusterIdResponse { cluster_id }))
    }
}
