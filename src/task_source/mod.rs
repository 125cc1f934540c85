//! Pluggable producers of leases.
//!
//! Every session update asks the [`TaskSourceChain`] whether the agent should
//! receive new work. Sources are consulted in priority order and the first
//! one that does not skip decides the outcome for that tick.

pub mod job;
pub mod queue;
pub mod restart;
pub mod shutdown;
pub mod upgrade;

use std::ops::BitOr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::agent::Agent;
use crate::lease::{Lease, LeaseOptions, LeaseRegistry};

pub use job::{Job, JobRequirements, JobSource, JobStatus};
pub use queue::JobQueue;
pub use restart::RestartTaskSource;
pub use shutdown::ShutdownTaskSource;
pub use upgrade::{Deployment, UpgradeTaskSource};

/// Agent states in which a source may still be consulted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TaskSourceFlags(u8);

impl TaskSourceFlags {
    pub const NONE: Self = Self(0);
    pub const ALLOW_WHEN_DISABLED: Self = Self(1);
    pub const ALLOW_DURING_DOWNTIME: Self = Self(1 << 1);

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for TaskSourceFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// What a source wants to do with an agent on this tick.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    /// Nothing to offer; ask the next source
    Skip,
    /// Mint a lease with these options
    Lease(LeaseOptions),
    /// Work is due but must wait for the running leases to finish
    Drain,
}

#[tonic::async_trait]
pub trait TaskSource: Send + Sync {
    fn task_type(&self) -> &str;

    fn flags(&self) -> TaskSourceFlags {
        TaskSourceFlags::NONE
    }

    async fn assign_lease(&self, agent: &Agent, now: DateTime<Utc>) -> Decision;

    /// Called with the agent still locked once the lease has been minted.
    async fn lease_created(&self, _agent: &mut Agent, _lease: &Lease) {}

    /// Called after a lease of this source's type reached a terminal state.
    async fn lease_finished(&self, _lease: &Lease) {}

    /// Called when a `Lease` decision could not be turned into a lease.
    async fn assignment_failed(&self, _agent: &Agent, _options: &LeaseOptions) {}
}

/// JSON lease payload for `task`. Logs and returns `None` if it cannot be
/// encoded.
pub(crate) fn encode_payload<T: Serialize>(
    task_type: &str,
    agent: &Agent,
    task: &T,
) -> Option<Vec<u8>> {
    match serde_json::to_vec(task) {
        Ok(payload) => Some(payload),
        Err(e) => {
            tracing::error!(
                agent_id = %agent.id,
                task_type,
                error = %e,
                "Failed to encode lease payload"
            );
            None
        }
    }
}

/// Result of consulting the chain for one agent.
#[derive(Debug, Clone, PartialEq)]
pub enum ChainOutcome {
    Idle,
    Drain { task_type: String },
    Lease(Lease),
}

/// Sources in fixed priority order.
#[derive(Default)]
pub struct TaskSourceChain {
    sources: Vec<Arc<dyn TaskSource>>,
}

impl std::fmt::Debug for TaskSourceChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.sources.iter().map(|s| s.task_type()))
            .finish()
    }
}

fn fits(options: &LeaseOptions, agent: &Agent) -> bool {
    let free = agent.free_resources();
    options
        .resources
        .iter()
        .all(|(name, amount)| free.get(name).copied().unwrap_or(0) >= *amount)
}

impl TaskSourceChain {
    pub fn new(sources: Vec<Arc<dyn TaskSource>>) -> Self {
        Self { sources }
    }

    pub fn with_source(mut self, source: Arc<dyn TaskSource>) -> Self {
        self.sources.push(source);
        self
    }

    pub fn task_types(&self) -> Vec<&str> {
        self.sources.iter().map(|s| s.task_type()).collect()
    }

    fn source_for(&self, task_type: &str) -> Option<&Arc<dyn TaskSource>> {
        self.sources.iter().find(|s| s.task_type() == task_type)
    }

    /// Offer at most one new lease to `agent`.
    ///
    /// The caller holds the agent lock; the minted lease is already attached
    /// to the agent and stored in the registry when this returns.
    pub async fn evaluate(
        &self,
        agent: &mut Agent,
        registry: &LeaseRegistry,
        downtime: bool,
        now: DateTime<Utc>,
    ) -> ChainOutcome {
        let Some(session_id) = agent.session.as_ref().map(|s| s.id) else {
            return ChainOutcome::Idle;
        };

        for source in &self.sources {
            let flags = source.flags();
            if !agent.enabled && !flags.contains(TaskSourceFlags::ALLOW_WHEN_DISABLED) {
                continue;
            }
            if downtime && !flags.contains(TaskSourceFlags::ALLOW_DURING_DOWNTIME) {
                continue;
            }

            match source.assign_lease(agent, now).await {
                Decision::Skip => continue,
                Decision::Drain => {
                    let task_type = source.task_type().to_string();
                    if agent.pending_drain.as_deref() != Some(task_type.as_str()) {
                        tracing::info!(
                            agent_id = %agent.id,
                            task_type = %task_type,
                            "Draining agent"
                        );
                        agent.pending_drain = Some(task_type.clone());
                    }
                    return ChainOutcome::Drain { task_type };
                }
                Decision::Lease(options) => {
                    if !fits(&options, agent) {
                        tracing::warn!(
                            agent_id = %agent.id,
                            task_type = source.task_type(),
                            "Lease does not fit the agent's free resources"
                        );
                        source.assignment_failed(agent, &options).await;
                        continue;
                    }

                    let lease = registry
                        .create(agent.id.clone(), session_id, source.task_type(), options)
                        .await;
                    agent.attach_lease(&lease);
                    agent.pending_drain = None;
                    source.lease_created(agent, &lease).await;
                    tracing::info!(
                        agent_id = %agent.id,
                        lease_id = %lease.id,
                        task_type = %lease.task_type,
                        name = %lease.name,
                        "Assigned lease"
                    );
                    return ChainOutcome::Lease(lease);
                }
            }
        }

        agent.pending_drain = None;
        ChainOutcome::Idle
    }

    /// Route a terminal lease back to the source that created it.
    pub async fn lease_finished(&self, lease: &Lease) {
        if let Some(source) = self.source_for(&lease.task_type) {
            source.lease_finished(lease).await;
        }
    }
}
