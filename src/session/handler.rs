use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::agent::{Agent, AgentId, AgentRegistration, AgentStatus, AgentTable};
use crate::compute::{ResourceNeeds, ResourceNeedsTracker, DEFAULT_COMPUTE_CLUSTER};
use crate::config::SessionConfig;
use crate::error::{HerdError, Result};
use crate::lease::{Lease, LeaseError, LeaseId, LeaseOutcome, LeaseRegistry, LeaseState};
use crate::relay::RelayStore;
use crate::session::{Session, SessionId};
use crate::task_source::{ChainOutcome, TaskSourceChain};

/// A lease as the agent last saw it.
#[derive(Debug, Clone, PartialEq)]
pub struct ReportedLease {
    pub id: LeaseId,
    pub state: LeaseState,
    pub outcome: LeaseOutcome,
    pub output: Vec<u8>,
}

impl ReportedLease {
    pub fn new(id: LeaseId, state: LeaseState) -> Self {
        Self {
            id,
            state,
            outcome: LeaseOutcome::Unspecified,
            output: Vec::new(),
        }
    }

    pub fn completed(id: LeaseId, outcome: LeaseOutcome, output: impl Into<Vec<u8>>) -> Self {
        Self {
            id,
            state: LeaseState::Completed,
            outcome,
            output: output.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SessionUpdate {
    pub agent_id: AgentId,
    pub session_id: SessionId,
    pub status: AgentStatus,
    pub leases: Vec<ReportedLease>,
    /// Installed software version, when the agent reports one
    pub version: Option<String>,
}

impl SessionUpdate {
    pub fn new(agent_id: AgentId, session_id: SessionId, status: AgentStatus) -> Self {
        Self {
            agent_id,
            session_id,
            status,
            leases: Vec::new(),
            version: None,
        }
    }

    pub fn with_lease(mut self, lease: ReportedLease) -> Self {
        self.leases.push(lease);
        self
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }
}

/// What the server sends back after each update.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionResponse {
    /// Status the agent should move to
    pub status: AgentStatus,
    pub expiry_time: DateTime<Utc>,
    /// Pending and active leases, plus cancelled ones the agent must abort
    pub leases: Vec<Lease>,
}

/// Owns the session lifecycle and reconciles agent lease reports.
///
/// Lock order is agent, then registry, then relay store. The session index
/// is only touched after the agent lock is released or while holding it.
#[derive(Debug)]
pub struct SessionHandler {
    config: SessionConfig,
    agents: Arc<AgentTable>,
    registry: Arc<LeaseRegistry>,
    chain: Arc<TaskSourceChain>,
    relay: Arc<RelayStore>,
    resource_needs: Arc<ResourceNeedsTracker>,
    sessions: RwLock<HashMap<SessionId, AgentId>>,
    downtime: AtomicBool,
}

impl SessionHandler {
    pub fn new(
        config: SessionConfig,
        agents: Arc<AgentTable>,
        registry: Arc<LeaseRegistry>,
        chain: Arc<TaskSourceChain>,
        relay: Arc<RelayStore>,
        resource_needs: Arc<ResourceNeedsTracker>,
    ) -> Self {
        Self {
            config,
            agents,
            registry,
            chain,
            relay,
            resource_needs,
            sessions: RwLock::new(HashMap::new()),
            downtime: AtomicBool::new(false),
        }
    }

    pub fn agents(&self) -> &Arc<AgentTable> {
        &self.agents
    }

    pub fn registry(&self) -> &Arc<LeaseRegistry> {
        &self.registry
    }

    pub fn resource_needs(&self) -> &Arc<ResourceNeedsTracker> {
        &self.resource_needs
    }

    pub fn set_downtime(&self, downtime: bool) {
        let previous = self.downtime.swap(downtime, Ordering::SeqCst);
        if previous != downtime {
            tracing::info!(downtime, "Scheduled downtime changed");
            if !downtime {
                self.agents.notify_capacity_changed();
            }
        }
    }

    pub fn is_downtime(&self) -> bool {
        self.downtime.load(Ordering::SeqCst)
    }

    fn grace(&self) -> Duration {
        Duration::from_std(self.config.grace_period).unwrap_or_else(|_| Duration::minutes(5))
    }

    pub async fn create_session(&self, registration: AgentRegistration) -> Result<Session> {
        self.create_session_at(registration, Utc::now()).await
    }

    /// Register or refresh an agent and open a new session for it. Any live
    /// session the agent still had is expired first.
    pub async fn create_session_at(
        &self,
        registration: AgentRegistration,
        now: DateTime<Utc>,
    ) -> Result<Session> {
        if registration.agent_id.as_str().trim().is_empty() {
            return Err(HerdError::InvalidArgument(
                "agent id cannot be empty".to_string(),
            ));
        }

        let entry = self.agents.get_or_insert(&registration.agent_id).await;
        let mut agent = entry.lock().await;

        let replaced = self.expire_locked(&mut agent).await;
        if let Some(ref previous) = replaced {
            tracing::info!(
                agent_id = %agent.id,
                session_id = %previous,
                "Replacing existing session"
            );
        }

        agent.apply_registration(&registration);
        let session = Session::new(agent.id.clone(), now, self.grace());
        agent.session = Some(session.clone());
        drop(agent);

        if let Some(previous) = replaced {
            self.forget(&previous).await;
            entry.notify_leases_changed();
        }
        self.sessions
            .write()
            .await
            .insert(session.id, registration.agent_id.clone());

        tracing::info!(
            agent_id = %session.agent_id,
            session_id = %session.id,
            version = %registration.version,
            "Session created"
        );
        Ok(session)
    }

    pub async fn update_session(&self, update: SessionUpdate) -> Result<SessionResponse> {
        self.update_session_at(update, Utc::now()).await
    }

    /// Apply one agent update and hand out at most one new lease.
    pub async fn update_session_at(
        &self,
        update: SessionUpdate,
        now: DateTime<Utc>,
    ) -> Result<SessionResponse> {
        let entry = self
            .agents
            .get(&update.agent_id)
            .await
            .ok_or_else(|| HerdError::SessionNotFound(update.session_id.to_string()))?;
        let mut agent = entry.lock().await;
        let session_id = validate_session(&agent, &update.session_id)?;

        let expired = agent
            .session
            .as_ref()
            .is_some_and(|s| s.is_expired_at(now));
        if expired {
            self.expire_locked(&mut agent).await;
            drop(agent);
            self.forget(&session_id).await;
            self.agents.notify_capacity_changed();
            tracing::info!(
                agent_id = %update.agent_id,
                session_id = %session_id,
                "Session expired"
            );
            return Err(HerdError::SessionNotFound(session_id.to_string()));
        }

        if let Some(version) = update.version.as_deref().filter(|v| !v.is_empty()) {
            if agent.version != version {
                tracing::info!(
                    agent_id = %agent.id,
                    from = %agent.version,
                    to = %version,
                    "Agent version changed"
                );
                agent.version = version.to_string();
            }
        }

        self.reconcile(&mut agent, session_id, &update.leases).await;

        let grace = self.grace();
        let mut became_active = false;
        if let Some(session) = agent.session.as_mut() {
            let was_active = session.is_active();
            session.record_update(update.status, now, grace);
            became_active = !was_active && session.is_active();
        }
        agent.status = update.status;

        if agent.session.as_ref().is_some_and(|s| s.is_active()) {
            let outcome = self
                .chain
                .evaluate(&mut agent, &self.registry, self.is_downtime(), now)
                .await;
            if let ChainOutcome::Drain { task_type } = outcome {
                tracing::debug!(agent_id = %agent.id, task_type = %task_type, "Agent draining");
            }
        }

        let response = self.response_for(&agent, session_id).await;
        drop(agent);

        if became_active {
            self.agents.notify_capacity_changed();
        }
        Ok(response)
    }

    /// Current authoritative view of a session without applying an update.
    pub async fn snapshot(
        &self,
        agent_id: &AgentId,
        session_id: &SessionId,
    ) -> Result<SessionResponse> {
        let entry = self
            .agents
            .get(agent_id)
            .await
            .ok_or_else(|| HerdError::SessionNotFound(session_id.to_string()))?;
        let agent = entry.lock().await;
        let session_id = validate_session(&agent, session_id)?;
        Ok(self.response_for(&agent, session_id).await)
    }

    /// Live leases handed out under a session, oldest first.
    pub async fn current_leases(&self, session_id: &SessionId) -> Vec<Lease> {
        self.registry.leases_for_session(session_id).await
    }

    pub async fn agent_for_session(&self, session_id: &SessionId) -> Option<AgentId> {
        self.sessions.read().await.get(session_id).cloned()
    }

    /// Cancel a lease on the server side. It stays visible to the agent
    /// until the agent stops reporting it.
    pub async fn cancel_lease(&self, lease_id: &LeaseId) -> Result<Lease> {
        let lease = self
            .registry
            .get(lease_id)
            .await
            .ok_or(LeaseError::NotFound(*lease_id))?;
        let entry = self
            .agents
            .get(&lease.agent_id)
            .await
            .ok_or_else(|| HerdError::AgentNotFound(lease.agent_id.clone()))?;

        let mut agent = entry.lock().await;
        let cancelled = self.registry.cancel(lease_id).await?;
        self.release(&mut agent, &cancelled).await;
        drop(agent);

        entry.notify_leases_changed();
        Ok(cancelled)
    }

    /// Expire every live session whose deadline has passed.
    pub async fn expire_sessions(&self, now: DateTime<Utc>) -> Vec<SessionId> {
        let mut expired = Vec::new();
        for entry in self.agents.all().await {
            let mut agent = entry.lock().await;
            let due = agent
                .session
                .as_ref()
                .is_some_and(|s| s.is_live() && s.is_expired_at(now));
            if !due {
                continue;
            }
            if let Some(session_id) = self.expire_locked(&mut agent).await {
                tracing::info!(agent_id = %agent.id, session_id = %session_id, "Session expired");
                expired.push(session_id);
            }
            drop(agent);
            entry.notify_leases_changed();
        }

        for session_id in &expired {
            self.forget(session_id).await;
        }
        if !expired.is_empty() {
            self.agents.notify_capacity_changed();
        }
        expired
    }

    /// Periodically expire dead sessions until `cancel` fires.
    pub async fn run_expiry_monitor(&self, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.config.expiry_check_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {
                    self.expire_sessions(Utc::now()).await;
                }
            }
        }
        tracing::info!("Session expiry monitor stopped");
    }

    /// Record what a session could use. The entry is tagged with the
    /// cluster of the session's agent.
    pub async fn report_resource_needs(
        &self,
        session_id: &SessionId,
        pool: impl Into<String>,
        resource_needs: HashMap<String, i32>,
    ) -> Result<ResourceNeeds> {
        let agent_id = self
            .agent_for_session(session_id)
            .await
            .ok_or_else(|| HerdError::SessionNotFound(session_id.to_string()))?;
        let entry = self
            .agents
            .get(&agent_id)
            .await
            .ok_or_else(|| HerdError::SessionNotFound(session_id.to_string()))?;
        let cluster_id = entry
            .lock()
            .await
            .compute_cluster
            .clone()
            .unwrap_or_else(|| DEFAULT_COMPUTE_CLUSTER.to_string());

        let needs = ResourceNeeds {
            session_id: *session_id,
            cluster_id,
            pool: pool.into(),
            resource_needs,
            timestamp: Utc::now(),
        };
        self.resource_needs.report(needs.clone()).await;
        Ok(needs)
    }

    async fn forget(&self, session_id: &SessionId) {
        self.sessions.write().await.remove(session_id);
        self.resource_needs.remove_session(session_id).await;
    }

    async fn response_for(&self, agent: &Agent, session_id: SessionId) -> SessionResponse {
        let (status, expiry_time) = agent
            .session
            .as_ref()
            .map(|s| (s.target_status, s.expiry_time))
            .unwrap_or((AgentStatus::Stopped, Utc::now()));
        SessionResponse {
            status,
            expiry_time,
            leases: self.registry.leases_for_session(&session_id).await,
        }
    }

    /// Expire the agent's live session, cancelling and retiring its leases.
    async fn expire_locked(&self, agent: &mut Agent) -> Option<SessionId> {
        let session = agent.session.as_mut().filter(|s| s.is_live())?;
        session.expire();
        let session_id = session.id;

        for lease in self.registry.leases_for_session(&session_id).await {
            if !lease.is_terminal() {
                match self.registry.cancel(&lease.id).await {
                    Ok(cancelled) => self.release(agent, &cancelled).await,
                    Err(e) => {
                        tracing::warn!(lease_id = %lease.id, error = %e, "Failed to cancel lease")
                    }
                }
            }
            self.registry.retire(&lease.id).await;
        }
        Some(session_id)
    }

    /// Undo a terminal lease's effects on the agent and notify its source.
    async fn release(&self, agent: &mut Agent, lease: &Lease) {
        agent.detach_lease(&lease.id);
        if self.relay.remove_lease(&lease.id.to_string()).await {
            tracing::debug!(lease_id = %lease.id, "Relay mapping removed");
        }
        self.chain.lease_finished(lease).await;
        self.agents.notify_capacity_changed();
    }

    async fn reconcile(
        &self,
        agent: &mut Agent,
        session_id: SessionId,
        reported: &[ReportedLease],
    ) {
        let mut seen = HashSet::new();

        for report in reported {
            seen.insert(report.id);
            let Some(lease) = self.registry.get(&report.id).await else {
                if self.registry.is_retired(&report.id).await {
                    tracing::debug!(
                        agent_id = %agent.id,
                        lease_id = %report.id,
                        "Agent reported a retired lease"
                    );
                } else {
                    tracing::warn!(
                        agent_id = %agent.id,
                        lease_id = %report.id,
                        "Agent reported an unknown lease"
                    );
                }
                continue;
            };
            if lease.agent_id != agent.id || lease.session_id != session_id {
                tracing::warn!(
                    agent_id = %agent.id,
                    lease_id = %lease.id,
                    owner = %lease.agent_id,
                    "Agent reported a lease it does not own"
                );
                continue;
            }

            match (lease.state, report.state) {
                (LeaseState::Pending, LeaseState::Active) => {
                    if let Err(e) = self.registry.activate(&lease.id).await {
                        tracing::warn!(
                            lease_id = %lease.id,
                            error = %e,
                            "Failed to activate lease"
                        );
                    }
                }
                (LeaseState::Pending | LeaseState::Active, LeaseState::Completed) => {
                    match self
                        .registry
                        .complete(&lease.id, report.outcome, report.output.clone())
                        .await
                    {
                        Ok(done) => {
                            self.release(agent, &done).await;
                            self.registry.retire(&done.id).await;
                        }
                        Err(e) => tracing::warn!(
                            lease_id = %lease.id,
                            error = %e,
                            "Failed to complete lease"
                        ),
                    }
                }
                (LeaseState::Pending | LeaseState::Active, LeaseState::Cancelled) => {
                    tracing::info!(
                        agent_id = %agent.id,
                        lease_id = %lease.id,
                        "Agent abandoned lease"
                    );
                    if let Ok(cancelled) = self.registry.cancel(&lease.id).await {
                        self.release(agent, &cancelled).await;
                        self.registry.retire(&cancelled.id).await;
                    }
                }
                (LeaseState::Cancelled, LeaseState::Completed | LeaseState::Cancelled) => {
                    tracing::debug!(lease_id = %lease.id, "Cancellation acknowledged");
                    self.registry.retire(&lease.id).await;
                }
                (LeaseState::Cancelled, _) => {
                    tracing::debug!(lease_id = %lease.id, "Waiting for agent to abort lease");
                }
                (server, agent_state) if server == agent_state => {}
                (server, agent_state) => {
                    tracing::warn!(
                        agent_id = %agent.id,
                        lease_id = %lease.id,
                        server = %server,
                        reported = %agent_state,
                        "Lease state diverged"
                    );
                }
            }
        }

        for lease in self.registry.leases_for_session(&session_id).await {
            if seen.contains(&lease.id) {
                continue;
            }
            match lease.state {
                LeaseState::Cancelled => {
                    self.registry.retire(&lease.id).await;
                }
                LeaseState::Active => {
                    tracing::warn!(
                        agent_id = %agent.id,
                        lease_id = %lease.id,
                        "Agent no longer reports an active lease"
                    );
                }
                _ => {}
            }
        }
    }
}

fn validate_session(agent: &Agent, session_id: &SessionId) -> Result<SessionId> {
    let session = agent
        .session
        .as_ref()
        .filter(|s| s.is_live())
        .ok_or_else(|| HerdError::SessionNotFound(session_id.to_string()))?;
    if &session.id != session_id {
        return Err(HerdError::SessionMismatch {
            agent_id: agent.id.clone(),
            got: session_id.to_string(),
        });
    }
    Ok(session.id)
}
