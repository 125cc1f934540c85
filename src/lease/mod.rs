//! Lease identity, state and the authoritative registry.

pub mod model;
pub mod registry;

use thiserror::Error;

pub use model::{Lease, LeaseId, LeaseOptions, LeaseOutcome, LeaseState};
pub use registry::LeaseRegistry;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum LeaseError {
    #[error("Lease not found: {0}")]
    NotFound(LeaseId),

    #[error("Lease {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: LeaseId,
        from: LeaseState,
        to: LeaseState,
    },
}
