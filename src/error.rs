use thiserror::Error;

use crate::agent::AgentId;
use crate::compute::ComputeError;
use crate::lease::LeaseError;
use crate::relay::RelayError;
use crate::transport::TransportError;

#[derive(Error, Debug)]
pub enum HerdError {
    #[error("Agent not found: {0}")]
    AgentNotFound(AgentId),

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Session {got} does not match the live session of agent {agent_id}")]
    SessionMismatch { agent_id: AgentId, got: String },

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Job queue is at capacity")]
    QueueFull,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Lease(#[from] LeaseError),

    #[error(transparent)]
    Compute(#[from] ComputeError),

    #[error(transparent)]
    Relay(#[from] RelayError),

    #[error(transparent)]
    SecureTransport(#[from] TransportError),

    #[error("gRPC error: {0}")]
    GrpcError(#[from] tonic::Status),

    #[error("Transport error: {0}")]
    TransportError(#[from] tonic::transport::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, HerdError>;

impl From<HerdError> for tonic::Status {
    fn from(err: HerdError) -> Self {
        match err {
            HerdError::AgentNotFound(_) | HerdError::SessionNotFound(_) => {
                tonic::Status::not_found(err.to_string())
            }
            HerdError::SessionMismatch { .. } => {
                tonic::Status::failed_precondition(err.to_string())
            }
            HerdError::InvalidArgument(_) => tonic::Status::invalid_argument(err.to_string()),
            HerdError::QueueFull => tonic::Status::resource_exhausted(err.to_string()),
            HerdError::Lease(LeaseError::NotFound(_)) => tonic::Status::not_found(err.to_string()),
            HerdError::Lease(_) => tonic::Status::failed_precondition(err.to_string()),
            HerdError::Compute(e) => e.into(),
            HerdError::GrpcError(status) => status,
            other => tonic::Status::internal(other.to_string()),
        }
    }
}
