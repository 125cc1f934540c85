//! NAT relay port mappings.
//!
//! The server publishes one [`PortMapping`] per relayed compute lease in the
//! [`RelayStore`]; relay agents follow the store through a long poll and
//! program their firewall with the differences.

pub mod client;
pub mod firewall;
pub mod port_mapping;
pub mod store;

use thiserror::Error;

pub use client::{AgentRelayClient, PortMappingRequest, PortMappingSource, PortMappingUpdate};
pub use firewall::{Firewall, IptablesFirewall, LoggingFirewall};
pub use port_mapping::{MappingDiff, PortMapping, PortProtocol, PortRule};
pub use store::RelayStore;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum RelayError {
    #[error("Port mapping stream cancelled")]
    Cancelled,

    #[error("Relay transport error: {0}")]
    Transport(String),

    #[error("Firewall update failed: {0}")]
    Firewall(String),

    #[error("Cluster '{0}' has no relay")]
    UnknownCluster(String),

    #[error("No free relay ports left in cluster '{0}'")]
    PortsExhausted(String),

    #[error("Invalid port mapping: {0}")]
    InvalidMapping(String),
}

impl From<RelayError> for tonic::Status {
    fn from(err: RelayError) -> Self {
        match err {
            RelayError::Cancelled => tonic::Status::cancelled(err.to_string()),
            RelayError::UnknownCluster(_) => tonic::Status::not_found(err.to_string()),
            RelayError::PortsExhausted(_) => tonic::Status::resource_exhausted(err.to_string()),
            RelayError::InvalidMapping(_) => tonic::Status::invalid_argument(err.to_string()),
            RelayError::Transport(_) | RelayError::Firewall(_) => {
                tonic::Status::internal(err.to_string())
            }
        }
    }
}

impl From<tonic::Status> for RelayError {
    fn from(status: tonic::Status) -> Self {
        match status.code() {
            tonic::Code::Cancelled => RelayError::Cancelled,
            _ => RelayError::Transport(status.to_string()),
        }
    }
}
