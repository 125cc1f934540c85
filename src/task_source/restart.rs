use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::agent::Agent;
use crate::lease::{Lease, LeaseOptions};
use crate::task_source::{encode_payload, Decision, TaskSource, TaskSourceFlags};

pub const RESTART_TASK_TYPE: &str = "restart";

/// Payload of a restart lease.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestartTask {
    /// Restart without waiting for running leases
    pub force: bool,
}

/// Restarts the agent machine once an administrator asked for it.
#[derive(Debug, Default)]
pub struct RestartTaskSource;

impl RestartTaskSource {
    pub fn new() -> Self {
        Self
    }
}

#[tonic::async_trait]
impl TaskSource for RestartTaskSource {
    fn task_type(&self) -> &str {
        RESTART_TASK_TYPE
    }

    fn flags(&self) -> TaskSourceFlags {
        TaskSourceFlags::ALLOW_WHEN_DISABLED | TaskSourceFlags::ALLOW_DURING_DOWNTIME
    }

    async fn assign_lease(&self, agent: &Agent, _now: DateTime<Utc>) -> Decision {
        if agent.is_workstation() {
            return Decision::Skip;
        }
        if !agent.request_restart && !agent.request_force_restart {
            return Decision::Skip;
        }

        let force = agent.request_force_restart;
        if agent.is_busy() && !force {
            return Decision::Drain;
        }

        let Some(payload) = encode_payload(RESTART_TASK_TYPE, agent, &RestartTask { force }) else {
            return Decision::Skip;
        };
        Decision::Lease(LeaseOptions::new("Restart", payload).with_exclusive(true))
    }

    async fn lease_created(&self, agent: &mut Agent, _lease: &Lease) {
        agent.request_restart = false;
        agent.request_force_restart = false;
    }
}
