use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::agent::{Agent, AgentId};
use crate::compute::condition::Condition;
use crate::error::{HerdError, Result};
use crate::lease::{Lease, LeaseId, LeaseOptions, LeaseOutcome, LeaseState};
use crate::task_source::queue::JobQueue;
use crate::task_source::{encode_payload, Decision, TaskSource};

pub const JOB_TASK_TYPE: &str = "job";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Assigned,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_finished(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Pending => write!(f, "pending"),
            JobStatus::Assigned => write!(f, "assigned"),
            JobStatus::Completed => write!(f, "completed"),
            JobStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Which agents may run a job.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobRequirements {
    pub pool: Option<String>,
    pub condition: Option<Condition>,
    pub exclusive: bool,
    pub resources: HashMap<String, i32>,
}

impl JobRequirements {
    pub fn with_pool(mut self, pool: impl Into<String>) -> Self {
        self.pool = Some(pool.into());
        self
    }

    pub fn with_condition(mut self, condition: Condition) -> Self {
        self.condition = Some(condition);
        self
    }

    pub fn with_exclusive(mut self, exclusive: bool) -> Self {
        self.exclusive = exclusive;
        self
    }

    pub fn with_resource(mut self, name: impl Into<String>, amount: i32) -> Self {
        self.resources.insert(name.into(), amount);
        self
    }

    pub fn matches(&self, agent: &Agent) -> bool {
        if let Some(ref pool) = self.pool {
            if !agent.in_pool(pool) {
                return false;
            }
        }
        if let Some(ref condition) = self.condition {
            if !condition.evaluate(agent) {
                return false;
            }
        }
        if agent.has_exclusive_lease() || (self.exclusive && agent.is_busy()) {
            return false;
        }
        let free = agent.free_resources();
        self.resources
            .iter()
            .all(|(name, amount)| free.get(name).copied().unwrap_or(0) >= *amount)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub name: String,
    pub command: String,
    pub requirements: JobRequirements,
    pub status: JobStatus,
    pub agent_id: Option<AgentId>,
    pub lease_id: Option<LeaseId>,
    /// Times the job was handed to an agent
    pub attempts: u32,
    pub output: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn new(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            command: command.into(),
            requirements: JobRequirements::default(),
            status: JobStatus::Pending,
            agent_id: None,
            lease_id: None,
            attempts: 0,
            output: None,
            created_at: Utc::now(),
            completed_at: None,
        }
    }

    pub fn with_requirements(mut self, requirements: JobRequirements) -> Self {
        self.requirements = requirements;
        self
    }
}

/// Payload of a job lease.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobTask {
    pub job_id: Uuid,
    pub command: String,
}

fn job_id_of(key: Option<&str>) -> Option<Uuid> {
    key.and_then(|k| Uuid::parse_str(k).ok())
}

/// Hands queued jobs to agents that satisfy their requirements.
#[derive(Debug)]
pub struct JobSource {
    queue: Mutex<JobQueue>,
}

impl JobSource {
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: Mutex::new(JobQueue::with_capacity(capacity)),
        }
    }

    pub async fn submit(&self, job: Job) -> Result<Job> {
        let mut queue = self.queue.lock().await;
        if !queue.add_job(job.clone()) {
            return Err(HerdError::QueueFull);
        }
        tracing::info!(job_id = %job.id, name = %job.name, "Job submitted");
        Ok(job)
    }

    pub async fn get(&self, id: &Uuid) -> Option<Job> {
        self.queue.lock().await.get_job(id).cloned()
    }

    pub async fn jobs(&self) -> Vec<Job> {
        self.queue
            .lock()
            .await
            .all_jobs()
            .into_iter()
            .cloned()
            .collect()
    }
}

#[tonic::async_trait]
impl TaskSource for JobSource {
    fn task_type(&self) -> &str {
        JOB_TASK_TYPE
    }

    async fn assign_lease(&self, agent: &Agent, _now: DateTime<Utc>) -> Decision {
        let Some(job) = self.queue.lock().await.claim_next(agent) else {
            return Decision::Skip;
        };

        let task = JobTask {
            job_id: job.id,
            command: job.command.clone(),
        };
        let Some(payload) = encode_payload(JOB_TASK_TYPE, agent, &task) else {
            self.queue.lock().await.requeue(&job.id);
            return Decision::Skip;
        };
        Decision::Lease(
            LeaseOptions::new(job.name, payload)
                .with_exclusive(job.requirements.exclusive)
                .with_resources(job.requirements.resources)
                .with_source_key(job.id.to_string()),
        )
    }

    async fn lease_created(&self, _agent: &mut Agent, lease: &Lease) {
        if let Some(job_id) = job_id_of(lease.source_key.as_deref()) {
            self.queue.lock().await.attach_lease(&job_id, lease.id);
        }
    }

    async fn lease_finished(&self, lease: &Lease) {
        let Some(job_id) = job_id_of(lease.source_key.as_deref()) else {
            return;
        };
        let mut queue = self.queue.lock().await;
        match lease.state {
            LeaseState::Cancelled => {
                if queue.requeue(&job_id) {
                    tracing::info!(
                        job_id = %job_id,
                        lease_id = %lease.id,
                        "Job requeued after lease cancellation"
                    );
                }
            }
            LeaseState::Completed => {
                let status = if lease.outcome == LeaseOutcome::Success {
                    JobStatus::Completed
                } else {
                    JobStatus::Failed
                };
                let output = (!lease.output.is_empty())
                    .then(|| String::from_utf8_lossy(&lease.output).into_owned());
                let completed_at = lease.finished_at.unwrap_or_else(Utc::now);
                if queue.finish(&job_id, status, output, completed_at) {
                    tracing::info!(job_id = %job_id, status = %status, "Job finished");
                }
            }
            _ => {}
        }
    }

    async fn assignment_failed(&self, _agent: &Agent, options: &LeaseOptions) {
        if let Some(job_id) = job_id_of(options.source_key.as_deref()) {
            self.queue.lock().await.requeue(&job_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionId;

    fn agent() -> Agent {
        let mut agent = Agent::new(AgentId::new("a1"));
        agent.pools.push("linux".to_string());
        agent.properties.push("RAM=64".to_string());
        agent
    }

    async fn minted(source: &JobSource, agent: &mut Agent) -> Lease {
        let Decision::Lease(options) = source.assign_lease(agent, Utc::now()).await else {
            panic!("expected a job lease");
        };
        let lease = Lease::new(
            LeaseId::new(),
            agent.id.clone(),
            SessionId::new(),
            JOB_TASK_TYPE,
            options,
        );
        source.lease_created(agent, &lease).await;
        lease
    }

    #[tokio::test]
    async fn submit_respects_capacity() {
        let source = JobSource::new(1);
        source.submit(Job::new("a", "true")).await.unwrap();
        let err = source.submit(Job::new("b", "true")).await.unwrap_err();
        assert!(matches!(err, HerdError::QueueFull));
    }

    #[tokio::test]
    async fn finished_jobs_do_not_fill_the_queue() {
        let source = JobSource::new(2);
        let mut a = agent();
        for name in ["a", "b"] {
            source.submit(Job::new(name, "true")).await.unwrap();
            let mut lease = minted(&source, &mut a).await;
            lease.transition(LeaseState::Completed).unwrap();
            lease.outcome = LeaseOutcome::Success;
            source.lease_finished(&lease).await;
        }

        let third = source.submit(Job::new("c", "true")).await.unwrap();
        assert_eq!(source.get(&third.id).await.unwrap().status, JobStatus::Pending);
        assert_eq!(source.jobs().await.len(), 2);
    }

    #[tokio::test]
    async fn requirements_filter_agents() {
        let requirements = JobRequirements::default()
            .with_pool("linux")
            .with_condition(Condition::parse("RAM >= 32").unwrap());
        assert!(requirements.matches(&agent()));

        let too_big =
            JobRequirements::default().with_condition(Condition::parse("RAM > 64").unwrap());
        assert!(!too_big.matches(&agent()));
        assert!(!JobRequirements::default().with_pool("windows").matches(&agent()));
    }

    #[tokio::test]
    async fn completed_lease_finishes_job() {
        let source = JobSource::new(10);
        let job = source.submit(Job::new("build", "make")).await.unwrap();
        let mut a = agent();
        let mut lease = minted(&source, &mut a).await;

        let task: JobTask = serde_json::from_slice(&lease.payload).unwrap();
        assert_eq!(task.job_id, job.id);
        assert_eq!(source.get(&job.id).await.unwrap().lease_id, Some(lease.id));
        // Nothing else to hand out
        assert_eq!(source.assign_lease(&a, Utc::now()).await, Decision::Skip);

        lease.transition(LeaseState::Completed).unwrap();
        lease.outcome = LeaseOutcome::Failure;
        lease.output = b"exit 2".to_vec();
        source.lease_finished(&lease).await;

        let job = source.get(&job.id).await.unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.output.as_deref(), Some("exit 2"));
    }

    #[tokio::test]
    async fn cancelled_lease_requeues_job() {
        let source = JobSource::new(10);
        let job = source.submit(Job::new("build", "make")).await.unwrap();
        let mut a = agent();
        let mut lease = minted(&source, &mut a).await;

        lease.transition(LeaseState::Cancelled).unwrap();
        source.lease_finished(&lease).await;
        assert_eq!(source.get(&job.id).await.unwrap().status, JobStatus::Pending);

        // Another agent may now pick it up
        let mut other = Agent::new(AgentId::new("a2"));
        let again = minted(&source, &mut other).await;
        let job = source.get(&job.id).await.unwrap();
        assert_eq!(job.agent_id, Some(AgentId::new("a2")));
        assert_eq!(job.lease_id, Some(again.id));
        assert_eq!(job.attempts, 2);
    }

    #[tokio::test]
    async fn assignment_failure_unclaims_job() {
        let source = JobSource::new(10);
        let job = source.submit(Job::new("build", "make")).await.unwrap();
        let a = agent();
        let Decision::Lease(options) = source.assign_lease(&a, Utc::now()).await else {
            panic!("expected a job lease");
        };
        source.assignment_failed(&a, &options).await;
        assert_eq!(source.get(&job.id).await.unwrap().status, JobStatus::Pending);
    }
}
