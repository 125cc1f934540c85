//! Agent sessions and the update protocol that delivers leases.

pub mod handler;
pub mod model;

pub use handler::{ReportedLease, SessionHandler, SessionResponse, SessionUpdate};
pub use model::{Session, SessionId, SessionState};
