use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::agent::{AgentId, AgentStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for SessionId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// `Connecting → Active → (Stopping → Stopped) | Expired`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Connecting,
    Active,
    Stopping,
    Stopped,
    Expired,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Connecting => write!(f, "connecting"),
            SessionState::Active => write!(f, "active"),
            SessionState::Stopping => write!(f, "stopping"),
            SessionState::Stopped => write!(f, "stopped"),
            SessionState::Expired => write!(f, "expired"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Session {
    pub id: SessionId,
    pub agent_id: AgentId,
    pub state: SessionState,
    /// Status the server wants the agent to be in. Once `Stopped` it stays.
    pub target_status: AgentStatus,
    pub created_at: DateTime<Utc>,
    pub last_update: DateTime<Utc>,
    pub expiry_time: DateTime<Utc>,
}

impl Session {
    pub fn new(agent_id: AgentId, now: DateTime<Utc>, grace: Duration) -> Self {
        Self {
            id: SessionId::new(),
            agent_id,
            state: SessionState::Connecting,
            target_status: AgentStatus::Ok,
            created_at: now,
            last_update: now,
            expiry_time: now + grace,
        }
    }

    pub fn is_active(&self) -> bool {
        self.state == SessionState::Active && self.target_status == AgentStatus::Ok
    }

    pub fn is_live(&self) -> bool {
        self.state != SessionState::Expired
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expiry_time
    }

    /// Apply an agent status report received at `now`.
    pub fn record_update(&mut self, reported: AgentStatus, now: DateTime<Utc>, grace: Duration) {
        match reported {
            AgentStatus::Ok => {
                if self.state == SessionState::Connecting {
                    self.state = SessionState::Active;
                }
            }
            AgentStatus::Stopping => {
                self.target_status = AgentStatus::Stopped;
                if self.state != SessionState::Stopped {
                    self.state = SessionState::Stopping;
                }
            }
            AgentStatus::Stopped => {
                self.target_status = AgentStatus::Stopped;
                self.state = SessionState::Stopped;
            }
        }

        self.last_update = now;
        // A stopped agent is on its way out; don't keep it alive
        if reported != AgentStatus::Stopped {
            self.expiry_time = now + grace;
        }
    }

    pub fn expire(&mut self) {
        self.state = SessionState::Expired;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(now: DateTime<Utc>) -> Session {
        Session::new(AgentId::new("a1"), now, Duration::minutes(5))
    }

    #[test]
    fn first_ok_update_activates() {
        let now = Utc::now();
        let mut s = session(now);
        assert_eq!(s.state, SessionState::Connecting);
        assert!(!s.is_active());

        s.record_update(AgentStatus::Ok, now, Duration::minutes(5));
        assert_eq!(s.state, SessionState::Active);
        assert!(s.is_active());
    }

    #[test]
    fn update_extends_expiry() {
        let now = Utc::now();
        let mut s = session(now);
        let later = now + Duration::minutes(3);
        s.record_update(AgentStatus::Ok, later, Duration::minutes(5));
        assert_eq!(s.expiry_time, later + Duration::minutes(5));
        assert!(!s.is_expired_at(later + Duration::minutes(4)));
        assert!(s.is_expired_at(later + Duration::minutes(5)));
    }

    #[test]
    fn stopping_latches_target_status() {
        let now = Utc::now();
        let mut s = session(now);
        s.record_update(AgentStatus::Ok, now, Duration::minutes(5));
        s.record_update(AgentStatus::Stopping, now, Duration::minutes(5));
        assert_eq!(s.target_status, AgentStatus::Stopped);
        assert_eq!(s.state, SessionState::Stopping);

        // Reporting Ok afterwards does not revert the latch
        s.record_update(AgentStatus::Ok, now, Duration::minutes(5));
        assert_eq!(s.target_status, AgentStatus::Stopped);
        assert_eq!(s.state, SessionState::Stopping);
        assert!(!s.is_active());
    }

    #[test]
    fn stopped_agent_does_not_extend_expiry() {
        let now = Utc::now();
        let mut s = session(now);
        let original = s.expiry_time;
        s.record_update(AgentStatus::Stopped, now + Duration::minutes(1), Duration::minutes(5));
        assert_eq!(s.state, SessionState::Stopped);
        assert_eq!(s.expiry_time, original);
    }
}
