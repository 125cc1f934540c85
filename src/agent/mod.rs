//! Agents known to the server.
//!
//! An [`Agent`] is owned by the server for as long as it stays registered.
//! Each agent lives behind its own lock in the [`AgentTable`] so that
//! sessions of unrelated agents never serialize on each other.

pub mod model;
pub mod table;

pub use model::{Agent, AgentId, AgentMode, AgentRegistration, AgentStatus, LeaseSummary};
pub use table::{AgentEntry, AgentTable};
