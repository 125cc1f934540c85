use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, MutexGuard, Notify, RwLock};

use crate::agent::{Agent, AgentId};
use crate::error::{HerdError, Result};

/// One registered agent plus the signal used to wake its session stream.
#[derive(Debug)]
pub struct AgentEntry {
    pub id: AgentId,
    state: Mutex<Agent>,
    leases_changed: Notify,
}

impl AgentEntry {
    fn new(id: AgentId) -> Self {
        Self {
            state: Mutex::new(Agent::new(id.clone())),
            id,
            leases_changed: Notify::new(),
        }
    }

    pub async fn lock(&self) -> MutexGuard<'_, Agent> {
        self.state.lock().await
    }

    /// Signal the session stream that the lease set changed out of band.
    /// The permit is kept if nobody is waiting yet.
    pub fn notify_leases_changed(&self) {
        self.leases_changed.notify_one();
    }

    pub async fn leases_changed(&self) {
        self.leases_changed.notified().await;
    }
}

/// All agents known to the server.
///
/// The outer lock only guards membership; per-agent state sits behind the
/// entry's own mutex.
#[derive(Debug, Default)]
pub struct AgentTable {
    agents: RwLock<HashMap<AgentId, Arc<AgentEntry>>>,
    capacity_changed: Notify,
}

impl AgentTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, id: &AgentId) -> Option<Arc<AgentEntry>> {
        self.agents.read().await.get(id).cloned()
    }

    pub async fn get_or_insert(&self, id: &AgentId) -> Arc<AgentEntry> {
        if let Some(entry) = self.get(id).await {
            return entry;
        }
        let mut agents = self.agents.write().await;
        agents
            .entry(id.clone())
            .or_insert_with(|| {
                tracing::info!(agent_id = %id, "Agent registered");
                Arc::new(AgentEntry::new(id.clone()))
            })
            .clone()
    }

    /// Snapshot of all entries, sorted by id for stable iteration.
    pub async fn all(&self) -> Vec<Arc<AgentEntry>> {
        let mut entries: Vec<_> = self.agents.read().await.values().cloned().collect();
        entries.sort_by(|a, b| a.id.cmp(&b.id));
        entries
    }

    pub async fn len(&self) -> usize {
        self.agents.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.agents.read().await.is_empty()
    }

    /// Wake allocations waiting for an agent to become available.
    pub fn notify_capacity_changed(&self) {
        self.capacity_changed.notify_waiters();
    }

    pub async fn capacity_changed(&self) {
        self.capacity_changed.notified().await;
    }

    async fn entry(&self, id: &AgentId) -> Result<Arc<AgentEntry>> {
        self.get(id)
            .await
            .ok_or_else(|| HerdError::AgentNotFound(id.clone()))
    }

    pub async fn request_restart(&self, id: &AgentId, force: bool) -> Result<()> {
        let entry = self.entry(id).await?;
        let mut agent = entry.lock().await;
        if force {
            agent.request_force_restart = true;
        } else {
            agent.request_restart = true;
        }
        tracing::info!(agent_id = %id, force, "Restart requested");
        Ok(())
    }

    pub async fn request_shutdown(&self, id: &AgentId) -> Result<()> {
        let entry = self.entry(id).await?;
        entry.lock().await.request_shutdown = true;
        tracing::info!(agent_id = %id, "Shutdown requested");
        Ok(())
    }

    pub async fn set_enabled(&self, id: &AgentId, enabled: bool) -> Result<()> {
        let entry = self.entry(id).await?;
        entry.lock().await.enabled = enabled;
        tracing::info!(agent_id = %id, enabled, "Agent enablement changed");
        if enabled {
            self.notify_capacity_changed();
        }
        Ok(())
    }
}
