//! End-to-end session flows through a fully wired server node.

use chrono::{Duration, Utc};

use herd_lite::agent::{AgentId, AgentRegistration, AgentStatus};
use herd_lite::config::ServerConfig;
use herd_lite::lease::{LeaseOutcome, LeaseState};
use herd_lite::node::Node;
use herd_lite::session::{ReportedLease, Session, SessionUpdate};
use herd_lite::task_source::{Deployment, Job, JobStatus};

fn node() -> Node {
    Node::new(ServerConfig::default())
}

fn ok(agent: &str, session: &Session) -> SessionUpdate {
    SessionUpdate::new(AgentId::new(agent), session.id, AgentStatus::Ok)
}

/// Upgrade lease is handed out, completed, and not offered again once the
/// agent reports the new version.
#[tokio::test]
async fn test_upgrade_rollout_end_to_end() {
    let node = node();
    node.upgrades
        .set_deployment(Deployment::new("2.0", Utc::now() - Duration::seconds(1)))
        .await;

    let session = node
        .handler
        .create_session(AgentRegistration::new("a1", "1.0"))
        .await
        .unwrap();

    let response = node.handler.update_session(ok("a1", &session)).await.unwrap();
    assert_eq!(response.leases.len(), 1);
    let lease = &response.leases[0];
    assert_eq!(lease.task_type, "upgrade");
    assert!(lease.exclusive);
    let payload: serde_json::Value = serde_json::from_slice(&lease.payload).unwrap();
    assert_eq!(payload["version"], "2.0");
    let lease_id = lease.id;

    let done = ok("a1", &session)
        .with_version("2.0")
        .with_lease(ReportedLease::completed(lease_id, LeaseOutcome::Success, Vec::new()));
    let response = node.handler.update_session(done).await.unwrap();
    assert!(response.leases.is_empty());
    assert!(node.registry.is_retired(&lease_id).await);

    let entry = node.agents.get(&AgentId::new("a1")).await.unwrap();
    assert_eq!(entry.lock().await.version, "2.0");
}

/// Administrative restarts outrank queued jobs.
#[tokio::test]
async fn test_restart_request_preempts_jobs() {
    let node = node();
    node.jobs.submit(Job::new("build", "make")).await.unwrap();

    let session = node
        .handler
        .create_session(AgentRegistration::new("a1", "1.0"))
        .await
        .unwrap();
    node.agents
        .request_restart(&AgentId::new("a1"), false)
        .await
        .unwrap();

    let response = node.handler.update_session(ok("a1", &session)).await.unwrap();
    assert_eq!(response.leases.len(), 1);
    assert_eq!(response.leases[0].task_type, "restart");

    let entry = node.agents.get(&AgentId::new("a1")).await.unwrap();
    let agent = entry.lock().await;
    assert!(!agent.request_restart, "Request flag should be consumed");
}

/// A job whose agent went silent is requeued and picked up by another agent.
#[tokio::test]
async fn test_expired_session_job_is_reissued() {
    let node = node();
    let job = node.jobs.submit(Job::new("build", "make")).await.unwrap();
    let t0 = Utc::now();

    let first = node
        .handler
        .create_session_at(AgentRegistration::new("a1", "1.0"), t0)
        .await
        .unwrap();
    let response = node
        .handler
        .update_session_at(ok("a1", &first), t0)
        .await
        .unwrap();
    assert_eq!(response.leases.len(), 1);
    let abandoned = response.leases[0].id;
    assert_eq!(node.jobs.get(&job.id).await.unwrap().status, JobStatus::Assigned);

    let later = t0 + Duration::minutes(10);
    let expired = node.handler.expire_sessions(later).await;
    assert_eq!(expired, vec![first.id]);
    assert!(node.registry.is_retired(&abandoned).await);
    assert_eq!(node.jobs.get(&job.id).await.unwrap().status, JobStatus::Pending);

    let second = node
        .handler
        .create_session_at(AgentRegistration::new("a2", "1.0"), later)
        .await
        .unwrap();
    let response = node
        .handler
        .update_session_at(ok("a2", &second), later)
        .await
        .unwrap();
    assert_eq!(response.leases.len(), 1);
    assert_ne!(response.leases[0].id, abandoned);
    assert_eq!(response.leases[0].agent_id, AgentId::new("a2"));
    assert_eq!(response.leases[0].source_key.as_deref(), Some(job.id.to_string().as_str()));

    // The stale agent can no longer report on its old session
    let stale = ok("a1", &first).with_lease(ReportedLease::new(abandoned, LeaseState::Active));
    assert!(node.handler.update_session_at(stale, later).await.is_err());
}

/// Server-side cancellation reaches the agent and the lease leaves once the
/// agent stops reporting it.
#[tokio::test]
async fn test_cancelled_lease_round_trip() {
    let node = node();
    let job = node.jobs.submit(Job::new("build", "make")).await.unwrap();
    let session = node
        .handler
        .create_session(AgentRegistration::new("a1", "1.0"))
        .await
        .unwrap();
    let response = node.handler.update_session(ok("a1", &session)).await.unwrap();
    let lease_id = response.leases[0].id;

    let running = ok("a1", &session).with_lease(ReportedLease::new(lease_id, LeaseState::Active));
    node.handler.update_session(running).await.unwrap();

    let cancelled = node.handler.cancel_lease(&lease_id).await.unwrap();
    assert_eq!(cancelled.state, LeaseState::Cancelled);
    // The job goes back to the queue straight away
    assert_eq!(node.jobs.get(&job.id).await.unwrap().status, JobStatus::Pending);

    let still_running =
        ok("a1", &session).with_lease(ReportedLease::new(lease_id, LeaseState::Active));
    let response = node.handler.update_session(still_running).await.unwrap();
    assert!(response
        .leases
        .iter()
        .any(|l| l.id == lease_id && l.state == LeaseState::Cancelled));

    let dropped =
        ok("a1", &session).with_lease(ReportedLease::new(lease_id, LeaseState::Cancelled));
    node.handler.update_session(dropped).await.unwrap();
    assert!(node.registry.is_retired(&lease_id).await);
}

/// Stopping agents never receive new work, even with jobs queued.
#[tokio::test]
async fn test_stopping_agent_gets_no_work() {
    let node = node();
    node.jobs.submit(Job::new("build", "make")).await.unwrap();
    let session = node
        .handler
        .create_session(AgentRegistration::new("a1", "1.0"))
        .await
        .unwrap();

    let stopping = SessionUpdate::new(AgentId::new("a1"), session.id, AgentStatus::Stopping);
    let response = node.handler.update_session(stopping).await.unwrap();
    assert!(response.leases.is_empty());
    assert_eq!(response.status, AgentStatus::Stopped);

    // Reporting Ok afterwards does not reopen the session
    let response = node.handler.update_session(ok("a1", &session)).await.unwrap();
    assert!(response.leases.is_empty());
}

/// Jobs that ran to completion stop counting against the queue capacity.
#[tokio::test]
async fn test_completed_jobs_free_queue_capacity() {
    let mut config = ServerConfig::default();
    config.job_queue_capacity = 2;
    let node = Node::new(config);
    let session = node
        .handler
        .create_session(AgentRegistration::new("a1", "1.0"))
        .await
        .unwrap();

    for name in ["first", "second"] {
        node.jobs.submit(Job::new(name, "true")).await.unwrap();
        let response = node.handler.update_session(ok("a1", &session)).await.unwrap();
        let lease_id = response.leases[0].id;
        let done = ok("a1", &session)
            .with_lease(ReportedLease::completed(lease_id, LeaseOutcome::Success, Vec::new()));
        node.handler.update_session(done).await.unwrap();
    }
    assert!(node
        .jobs
        .jobs()
        .await
        .iter()
        .all(|j| j.status == JobStatus::Completed));

    let third = node.jobs.submit(Job::new("third", "true")).await.unwrap();
    let response = node.handler.update_session(ok("a1", &session)).await.unwrap();
    assert_eq!(response.leases.len(), 1);
    assert_eq!(
        node.jobs.get(&third.id).await.unwrap().status,
        JobStatus::Assigned
    );
}
