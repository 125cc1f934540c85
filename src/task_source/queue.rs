use std::collections::HashMap;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::agent::Agent;
use crate::lease::LeaseId;
use crate::task_source::job::{Job, JobStatus};

const DEFAULT_MAX_JOBS: usize = 10_000;

/// Submitted jobs and their assignment state
#[derive(Debug)]
pub struct JobQueue {
    jobs: HashMap<Uuid, Job>,
    max_jobs: usize,
}

impl Default for JobQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl JobQueue {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_MAX_JOBS)
    }

    pub fn with_capacity(max_jobs: usize) -> Self {
        Self {
            jobs: HashMap::new(),
            max_jobs,
        }
    }

    /// Add a new job to the queue. Returns false if `max_jobs` jobs are
    /// still unfinished. Otherwise the oldest finished jobs make room.
    pub fn add_job(&mut self, job: Job) -> bool {
        if self.is_full() {
            return false;
        }
        while self.jobs.len() >= self.max_jobs {
            if self.evict_oldest_finished().is_none() {
                return false;
            }
        }
        self.jobs.insert(job.id, job);
        true
    }

    fn evict_oldest_finished(&mut self) -> Option<Job> {
        let id = self
            .jobs
            .values()
            .filter(|j| j.status.is_finished())
            .min_by_key(|j| (j.completed_at, j.id))
            .map(|j| j.id)?;
        self.jobs.remove(&id)
    }

    pub fn get_job(&self, id: &Uuid) -> Option<&Job> {
        self.jobs.get(id)
    }

    /// Claim the oldest pending job `agent` can run.
    pub fn claim_next(&mut self, agent: &Agent) -> Option<Job> {
        let id = self
            .jobs
            .values()
            .filter(|j| j.status == JobStatus::Pending && j.requirements.matches(agent))
            .min_by_key(|j| (j.created_at, j.id))
            .map(|j| j.id)?;

        let job = self.jobs.get_mut(&id)?;
        job.status = JobStatus::Assigned;
        job.agent_id = Some(agent.id.clone());
        job.attempts += 1;
        Some(job.clone())
    }

    pub fn attach_lease(&mut self, id: &Uuid, lease_id: LeaseId) -> bool {
        match self.jobs.get_mut(id) {
            Some(job) if job.status == JobStatus::Assigned => {
                job.lease_id = Some(lease_id);
                true
            }
            _ => false,
        }
    }

    /// Put an assigned job back in line. Finished jobs stay finished.
    pub fn requeue(&mut self, id: &Uuid) -> bool {
        match self.jobs.get_mut(id) {
            Some(job) if job.status == JobStatus::Assigned => {
                job.status = JobStatus::Pending;
                job.agent_id = None;
                job.lease_id = None;
                true
            }
            _ => false,
        }
    }

    pub fn finish(
        &mut self,
        id: &Uuid,
        status: JobStatus,
        output: Option<String>,
        completed_at: DateTime<Utc>,
    ) -> bool {
        match self.jobs.get_mut(id) {
            Some(job) if job.status == JobStatus::Assigned => {
                job.status = status;
                job.output = output;
                job.completed_at = Some(completed_at);
                true
            }
            _ => false,
        }
    }

    /// Get all jobs sorted chronologically by creation time
    pub fn all_jobs(&self) -> Vec<&Job> {
        let mut jobs: Vec<&Job> = self.jobs.values().collect();
        jobs.sort_by_key(|j| j.created_at);
        jobs
    }

    /// Jobs that are pending or assigned
    pub fn active_jobs(&self) -> usize {
        self.jobs
            .values()
            .filter(|j| !j.status.is_finished())
            .count()
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.active_jobs() >= self.max_jobs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::AgentId;
    use crate::task_source::job::JobRequirements;

    fn agent_in(pool: &str) -> Agent {
        let mut agent = Agent::new(AgentId::new("a1"));
        agent.pools.push(pool.to_string());
        agent
    }

    #[test]
    fn capacity_is_enforced() {
        let mut queue = JobQueue::with_capacity(1);
        assert!(queue.add_job(Job::new("one", "echo 1")));
        assert!(queue.is_full());
        assert!(!queue.add_job(Job::new("two", "echo 2")));
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn claims_oldest_matching_job() {
        let mut queue = JobQueue::new();
        let mut first = Job::new("first", "echo 1")
            .with_requirements(JobRequirements::default().with_pool("linux"));
        first.created_at = Utc::now() - chrono::Duration::seconds(10);
        let second = Job::new("second", "echo 2");
        let wanted = second.id;
        queue.add_job(first);
        queue.add_job(second);

        // First job needs a pool the agent isn't in
        let claimed = queue.claim_next(&agent_in("windows")).unwrap();
        assert_eq!(claimed.id, wanted);
        assert_eq!(claimed.status, JobStatus::Assigned);
        assert_eq!(claimed.attempts, 1);
        assert!(queue.claim_next(&agent_in("windows")).is_none());
        assert_eq!(queue.active_jobs(), 2);
    }

    #[test]
    fn requeue_and_finish() {
        let mut queue = JobQueue::new();
        let job = Job::new("build", "make");
        let id = job.id;
        queue.add_job(job);

        queue.claim_next(&agent_in("any")).unwrap();
        assert!(queue.attach_lease(&id, LeaseId::new()));
        assert!(queue.requeue(&id));
        let job = queue.get_job(&id).unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert!(job.lease_id.is_none());

        queue.claim_next(&agent_in("any")).unwrap();
        assert!(queue.finish(&id, JobStatus::Completed, Some("ok".to_string()), Utc::now()));
        // Finished jobs cannot be put back
        assert!(!queue.requeue(&id));
        assert_eq!(queue.active_jobs(), 0);
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn finished_jobs_make_room() {
        let mut queue = JobQueue::with_capacity(2);
        let mut finished = Vec::new();
        for name in ["one", "two"] {
            let job = Job::new(name, "true");
            finished.push(job.id);
            queue.add_job(job);
            let claimed = queue.claim_next(&agent_in("any")).unwrap();
            let completed_at = Utc::now() + chrono::Duration::seconds(finished.len() as i64);
            assert!(queue.finish(&claimed.id, JobStatus::Completed, None, completed_at));
        }
        assert_eq!(queue.len(), 2);
        assert!(!queue.is_full());

        // The job that finished first is evicted
        assert!(queue.add_job(Job::new("three", "true")));
        assert_eq!(queue.len(), 2);
        assert!(queue.get_job(&finished[0]).is_none());
        assert!(queue.get_job(&finished[1]).is_some());

        assert!(queue.add_job(Job::new("four", "true")));
        assert!(queue.is_full());
        assert!(!queue.add_job(Job::new("five", "true")));
        assert_eq!(queue.len(), 2);
    }
}
