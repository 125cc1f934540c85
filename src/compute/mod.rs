//! Ad hoc compute allocation.
//!
//! A requester describes what it needs; the [`ComputeAllocator`] picks the
//! requester's cluster, finds a suitable online agent, places a `compute`
//! lease on it and returns how to reach it.

pub mod allocator;
pub mod cluster;
pub mod condition;
pub mod requirements;
pub mod resource_needs;

use thiserror::Error;

pub use allocator::{
    resolve_requester_ip, ComputeAllocator, ComputeRequest, ComputeResource, ComputeTask,
    ConnectionMode, ConnectionPreferences, Encryption, PortInfo, Requester, COMPUTE_PORT_NAME,
    COMPUTE_TASK_TYPE, DEFAULT_COMPUTE_CLUSTER,
};
pub use cluster::find_best_compute_cluster_id;
pub use condition::{Condition, ConditionError, PropertySource};
pub use requirements::{Requirements, ResourceRange};
pub use resource_needs::{ResourceNeeds, ResourceNeedsTracker};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ComputeError {
    /// Capacity may free up; the requester should retry later
    #[error("No compute resources available: {message}")]
    NoComputeResources { message: String, show_to_user: bool },

    #[error("Compute service error: {message}")]
    Service { message: String, show_to_user: bool },

    #[error("Requester {0} is not allowed to use this cluster")]
    Forbidden(String),

    #[error("No compute cluster serves {0}")]
    NoMatchingCluster(String),

    #[error("Compute allocation cancelled")]
    Cancelled,
}

impl ComputeError {
    pub fn no_resources(message: impl Into<String>) -> Self {
        ComputeError::NoComputeResources {
            message: message.into(),
            show_to_user: true,
        }
    }

    pub fn service(message: impl Into<String>) -> Self {
        ComputeError::Service {
            message: message.into(),
            show_to_user: false,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, ComputeError::NoComputeResources { .. })
    }

    pub fn show_to_user(&self) -> bool {
        match self {
            ComputeError::NoComputeResources { show_to_user, .. }
            | ComputeError::Service { show_to_user, .. } => *show_to_user,
            _ => true,
        }
    }
}

impl From<ComputeError> for tonic::Status {
    fn from(err: ComputeError) -> Self {
        match err {
            ComputeError::NoComputeResources { .. } => tonic::Status::unavailable(err.to_string()),
            ComputeError::Service { .. } => tonic::Status::failed_precondition(err.to_string()),
            ComputeError::Forbidden(_) => tonic::Status::permission_denied(err.to_string()),
            ComputeError::NoMatchingCluster(_) => tonic::Status::not_found(err.to_string()),
            ComputeError::Cancelled => tonic::Status::cancelled(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_capacity_errors_are_retryable() {
        assert!(ComputeError::no_resources("busy").is_retryable());
        assert!(!ComputeError::service("broken").is_retryable());
        assert!(!ComputeError::Forbidden("10.0.0.1".to_string()).is_retryable());
    }

    #[test]
    fn grpc_codes() {
        let cases = [
            (ComputeError::no_resources("busy"), tonic::Code::Unavailable),
            (ComputeError::service("broken"), tonic::Code::FailedPrecondition),
            (ComputeError::Forbidden("x".to_string()), tonic::Code::PermissionDenied),
            (ComputeError::NoMatchingCluster("x".to_string()), tonic::Code::NotFound),
            (ComputeError::Cancelled, tonic::Code::Cancelled),
        ];
        for (err, code) in cases {
            assert_eq!(tonic::Status::from(err).code(), code);
        }
    }
}
