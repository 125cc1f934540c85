use chrono::{DateTime, Utc};

use crate::agent::Agent;
use crate::lease::{Lease, LeaseOptions};
use crate::task_source::{Decision, TaskSource, TaskSourceFlags};

pub const SHUTDOWN_TASK_TYPE: &str = "shutdown";

/// Powers the agent machine down once an administrator asked for it.
#[derive(Debug, Default)]
pub struct ShutdownTaskSource;

impl ShutdownTaskSource {
    pub fn new() -> Self {
        Self
    }
}

#[tonic::async_trait]
impl TaskSource for ShutdownTaskSource {
    fn task_type(&self) -> &str {
        SHUTDOWN_TASK_TYPE
    }

    fn flags(&self) -> TaskSourceFlags {
        TaskSourceFlags::ALLOW_WHEN_DISABLED | TaskSourceFlags::ALLOW_DURING_DOWNTIME
    }

    async fn assign_lease(&self, agent: &Agent, _now: DateTime<Utc>) -> Decision {
        if agent.is_workstation() || !agent.request_shutdown {
            return Decision::Skip;
        }
        if agent.is_busy() {
            return Decision::Drain;
        }
        Decision::Lease(LeaseOptions::new("Shutdown", b"{}".to_vec()).with_exclusive(true))
    }

    async fn lease_created(&self, agent: &mut Agent, _lease: &Lease) {
        agent.request_shutdown = false;
    }
}
