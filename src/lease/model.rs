use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::agent::AgentId;
use crate::lease::LeaseError;
use crate::session::SessionId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LeaseId(Uuid);

impl LeaseId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for LeaseId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for LeaseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for LeaseId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LeaseState {
    Pending,
    Active,
    Completed,
    Cancelled,
}

impl LeaseState {
    pub fn is_terminal(self) -> bool {
        matches!(self, LeaseState::Completed | LeaseState::Cancelled)
    }

    /// Transitions only move forward.
    pub fn can_transition_to(self, next: LeaseState) -> bool {
        use LeaseState::*;
        matches!(
            (self, next),
            (Pending, Active)
                | (Pending, Completed)
                | (Pending, Cancelled)
                | (Active, Completed)
                | (Active, Cancelled)
        )
    }
}

impl fmt::Display for LeaseState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LeaseState::Pending => write!(f, "pending"),
            LeaseState::Active => write!(f, "active"),
            LeaseState::Completed => write!(f, "completed"),
            LeaseState::Cancelled => write!(f, "cancelled"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LeaseOutcome {
    #[default]
    Unspecified,
    Success,
    Failure,
}

impl fmt::Display for LeaseOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LeaseOutcome::Unspecified => write!(f, "unspecified"),
            LeaseOutcome::Success => write!(f, "success"),
            LeaseOutcome::Failure => write!(f, "failure"),
        }
    }
}

/// What a task source wants a new lease to look like.
#[derive(Debug, Clone, PartialEq)]
pub struct LeaseOptions {
    /// Human-readable display name
    pub name: String,
    /// Task-type specific payload handed to the agent untouched
    pub payload: Vec<u8>,
    /// No other lease may run on the agent at the same time
    pub exclusive: bool,
    pub resources: HashMap<String, i32>,
    pub parent_id: Option<LeaseId>,
    /// Opaque reference the creating source uses to find its own work item
    pub source_key: Option<String>,
}

impl LeaseOptions {
    pub fn new(name: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            payload,
            exclusive: false,
            resources: HashMap::new(),
            parent_id: None,
            source_key: None,
        }
    }

    pub fn with_exclusive(mut self, exclusive: bool) -> Self {
        self.exclusive = exclusive;
        self
    }

    pub fn with_resource(mut self, name: impl Into<String>, amount: i32) -> Self {
        self.resources.insert(name.into(), amount);
        self
    }

    pub fn with_resources(mut self, resources: HashMap<String, i32>) -> Self {
        self.resources = resources;
        self
    }

    pub fn with_source_key(mut self, key: impl Into<String>) -> Self {
        self.source_key = Some(key.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Lease {
    pub id: LeaseId,
    pub parent_id: Option<LeaseId>,
    pub agent_id: AgentId,
    pub session_id: SessionId,
    pub task_type: String,
    pub name: String,
    pub state: LeaseState,
    pub outcome: LeaseOutcome,
    pub payload: Vec<u8>,
    pub output: Vec<u8>,
    pub resources: HashMap<String, i32>,
    pub exclusive: bool,
    pub source_key: Option<String>,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Lease {
    pub fn new(
        id: LeaseId,
        agent_id: AgentId,
        session_id: SessionId,
        task_type: impl Into<String>,
        options: LeaseOptions,
    ) -> Self {
        Self {
            id,
            parent_id: options.parent_id,
            agent_id,
            session_id,
            task_type: task_type.into(),
            name: options.name,
            state: LeaseState::Pending,
            outcome: LeaseOutcome::Unspecified,
            payload: options.payload,
            output: Vec::new(),
            resources: options.resources,
            exclusive: options.exclusive,
            source_key: options.source_key,
            created_at: Utc::now(),
            finished_at: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    pub fn transition(&mut self, next: LeaseState) -> Result<(), LeaseError> {
        if !self.state.can_transition_to(next) {
            return Err(LeaseError::InvalidTransition {
                id: self.id,
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        if next.is_terminal() {
            self.finished_at = Some(Utc::now());
        }
        Ok(())
    }
}
