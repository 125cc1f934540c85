use std::pin::Pin;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::{Stream, StreamExt};
use tonic::{Request, Response, Status, Streaming};

use crate::agent::{AgentEntry, AgentId};
use crate::grpc::convert;
use crate::proto::agent_service_server::AgentService;
use crate::proto::{
    CreateSessionRequest, CreateSessionResponse, UpdateSessionRequest, UpdateSessionResponse,
};
use crate::session::{SessionHandler, SessionId};

/// Agent-facing control plane
pub struct AgentServiceImpl {
    handler: Arc<SessionHandler>,
}

impl AgentServiceImpl {
    pub fn new(handler: Arc<SessionHandler>) -> Self {
        Self { handler }
    }
}

type UpdateStream = Pin<Box<dyn Stream<Item = Result<UpdateSessionResponse, Status>> + Send>>;

/// The session a stream is bound to after its first accepted update.
struct BoundSession {
    agent_id: AgentId,
    session_id: SessionId,
    entry: Arc<AgentEntry>,
}

async fn wait_for_leases(entry: Option<Arc<AgentEntry>>) {
    match entry {
        Some(entry) => entry.leases_changed().await,
        None => std::future::pending().await,
    }
}

#[tonic::async_trait]
impl AgentService for AgentServiceImpl {
    type UpdateSessionStream = UpdateStream;

    async fn create_session(
        &self,
        request: Request<CreateSessionRequest>,
    ) -> Result<Response<CreateSessionResponse>, Status> {
        let registration = convert::registration_from_proto(request.into_inner())?;
        let session = self.handler.create_session(registration).await?;

        Ok(Response::new(CreateSessionResponse {
            agent_id: session.agent_id.to_string(),
            session_id: session.id.to_string(),
            expiry_time_ms: session.expiry_time.timestamp_millis(),
        }))
    }

    async fn update_session(
        &self,
        request: Request<Streaming<UpdateSessionRequest>>,
    ) -> Result<Response<Self::UpdateSessionStream>, Status> {
        let mut inbound = request.into_inner();
        let handler = self.handler.clone();
        let (tx, rx) = mpsc::channel(16);

        tokio::spawn(async move {
            let mut bound: Option<BoundSession> = None;

            loop {
                let entry = bound.as_ref().map(|b| b.entry.clone());
                tokio::select! {
                    message = inbound.next() => {
                        let req = match message {
                            Some(Ok(req)) => req,
                            Some(Err(status)) => {
                                tracing::debug!(error = %status, "Session stream failed");
                                break;
                            }
                            None => break,
                        };

                        let update = match convert::update_from_proto(req) {
                            Ok(update) => update,
                            Err(status) => {
                                let _ = tx.send(Err(status)).await;
                                break;
                            }
                        };
                        let agent_id = update.agent_id.clone();
                        let session_id = update.session_id;

                        match handler.update_session(update).await {
                            Ok(response) => {
                                if bound.as_ref().map(|b| b.session_id) != Some(session_id) {
                                    if let Some(entry) = handler.agents().get(&agent_id).await {
                                        bound = Some(BoundSession { agent_id, session_id, entry });
                                    }
                                }
                                let message = convert::response_to_proto(&response);
                                if tx.send(Ok(message)).await.is_err() {
                                    break;
                                }
                            }
                            Err(e) => {
                                tracing::warn!(
                                    agent_id = %agent_id,
                                    session_id = %session_id,
                                    error = %e,
                                    "Rejected session update"
                                );
                                let _ = tx.send(Err(e.into())).await;
                                break;
                            }
                        }
                    }

                    _ = wait_for_leases(entry) => {
                        let Some(ref session) = bound else { continue };
                        match handler.snapshot(&session.agent_id, &session.session_id).await {
                            Ok(response) => {
                                let message = convert::response_to_proto(&response);
                                if tx.send(Ok(message)).await.is_err() {
                                    break;
                                }
                            }
                            Err(e) => {
                                let _ = tx.send(Err(e.into())).await;
                                break;
                            }
                        }
                    }
                }
            }

            if let Some(session) = bound {
                tracing::debug!(
                    agent_id = %session.agent_id,
                    session_id = %session.session_id,
                    "Session stream closed"
                );
            }
        });

        Ok(Response::new(
            Box::pin(ReceiverStream::new(rx)) as Self::UpdateSessionStream
        ))
    }
}
