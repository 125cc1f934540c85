use std::collections::{HashSet, VecDeque};
use std::hash::Hash;

use dashmap::{mapref::entry::Entry, DashMap};
use parking_lot::Mutex;

use crate::agent::AgentId;
use crate::lease::{Lease, LeaseError, LeaseId, LeaseOptions, LeaseOutcome, LeaseState};
use crate::session::SessionId;

/// Retired ids remembered for diagnostics.
const RETIRED_HISTORY: usize = 4096;

/// The most recently retired lease ids, oldest first.
#[derive(Debug, Default)]
struct RetiredIds {
    order: VecDeque<LeaseId>,
    ids: HashSet<LeaseId>,
}

impl RetiredIds {
    fn push(&mut self, id: LeaseId) {
        if !self.ids.insert(id) {
            return;
        }
        self.order.push_back(id);
        while self.order.len() > RETIRED_HISTORY {
            if let Some(oldest) = self.order.pop_front() {
                self.ids.remove(&oldest);
            }
        }
    }
}

fn index_insert<K: Eq + Hash>(index: &DashMap<K, HashSet<LeaseId>>, key: K, id: LeaseId) {
    index.entry(key).or_default().insert(id);
}

fn index_remove<K: Eq + Hash>(index: &DashMap<K, HashSet<LeaseId>>, key: &K, id: &LeaseId) {
    if let Some(mut ids) = index.get_mut(key) {
        ids.remove(id);
    }
    index.remove_if(key, |_, ids| ids.is_empty());
}

/// Authoritative bookkeeping of every live lease.
///
/// Leases live in a sharded map with per-session and per-agent id indexes,
/// so updates for different agents do not contend. No guard is held across
/// an await point or while touching a second map.
#[derive(Debug, Default)]
pub struct LeaseRegistry {
    leases: DashMap<LeaseId, Lease>,
    by_session: DashMap<SessionId, HashSet<LeaseId>>,
    by_agent: DashMap<AgentId, HashSet<LeaseId>>,
    retired: Mutex<RetiredIds>,
}

impl LeaseRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mint a lease with a fresh id.
    pub async fn create(
        &self,
        agent_id: AgentId,
        session_id: SessionId,
        task_type: &str,
        options: LeaseOptions,
    ) -> Lease {
        let lease = loop {
            let id = LeaseId::new();
            if let Entry::Vacant(entry) = self.leases.entry(id) {
                let lease = Lease::new(id, agent_id, session_id, task_type, options);
                entry.insert(lease.clone());
                break lease;
            }
        };
        index_insert(&self.by_session, session_id, lease.id);
        index_insert(&self.by_agent, lease.agent_id.clone(), lease.id);
        tracing::debug!(lease_id = %lease.id, agent_id = %lease.agent_id, task_type, "Lease created");
        lease
    }

    pub async fn get(&self, id: &LeaseId) -> Option<Lease> {
        self.leases.get(id).map(|l| l.value().clone())
    }

    /// Whether `id` was retired recently enough to still be remembered.
    pub async fn is_retired(&self, id: &LeaseId) -> bool {
        self.retired.lock().ids.contains(id)
    }

    fn update<F>(&self, id: &LeaseId, f: F) -> Result<Lease, LeaseError>
    where
        F: FnOnce(&mut Lease) -> Result<(), LeaseError>,
    {
        let mut lease = self
            .leases
            .get_mut(id)
            .ok_or(LeaseError::NotFound(*id))?;
        f(lease.value_mut())?;
        Ok(lease.value().clone())
    }

    pub async fn activate(&self, id: &LeaseId) -> Result<Lease, LeaseError> {
        self.update(id, |lease| lease.transition(LeaseState::Active))
    }

    pub async fn complete(
        &self,
        id: &LeaseId,
        outcome: LeaseOutcome,
        output: Vec<u8>,
    ) -> Result<Lease, LeaseError> {
        let lease = self.update(id, |lease| {
            lease.transition(LeaseState::Completed)?;
            lease.outcome = outcome;
            lease.output = output;
            Ok(())
        })?;
        tracing::info!(
            lease_id = %id,
            agent_id = %lease.agent_id,
            outcome = %outcome,
            "Lease completed"
        );
        Ok(lease)
    }

    pub async fn cancel(&self, id: &LeaseId) -> Result<Lease, LeaseError> {
        let lease = self.update(id, |lease| lease.transition(LeaseState::Cancelled))?;
        tracing::info!(lease_id = %id, agent_id = %lease.agent_id, "Lease cancelled");
        Ok(lease)
    }

    /// Drop a terminal lease from the live set.
    pub async fn retire(&self, id: &LeaseId) -> Option<Lease> {
        let (_, lease) = self.leases.remove_if(id, |_, lease| lease.is_terminal())?;
        index_remove(&self.by_session, &lease.session_id, id);
        index_remove(&self.by_agent, &lease.agent_id, id);
        self.retired.lock().push(*id);
        tracing::debug!(lease_id = %id, "Lease retired");
        Some(lease)
    }

    fn collect(&self, ids: Option<Vec<LeaseId>>) -> Vec<Lease> {
        let mut leases: Vec<Lease> = ids
            .unwrap_or_default()
            .iter()
            .filter_map(|id| self.leases.get(id).map(|l| l.value().clone()))
            .collect();
        leases.sort_by_key(|l| (l.created_at, l.id));
        leases
    }

    /// Live leases owned by an agent, oldest first.
    pub async fn leases_for_agent(&self, agent_id: &AgentId) -> Vec<Lease> {
        let ids = self
            .by_agent
            .get(agent_id)
            .map(|ids| ids.iter().copied().collect());
        self.collect(ids)
    }

    pub async fn leases_for_session(&self, session_id: &SessionId) -> Vec<Lease> {
        let ids = self
            .by_session
            .get(session_id)
            .map(|ids| ids.iter().copied().collect());
        self.collect(ids)
    }

    pub async fn len(&self) -> usize {
        self.leases.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.leases.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn create(registry: &LeaseRegistry, agent: &str) -> Lease {
        registry
            .create(
                AgentId::new(agent),
                SessionId::new(),
                "job",
                LeaseOptions::new("build", Vec::new()),
            )
            .await
    }

    #[tokio::test]
    async fn create_assigns_unique_ids() {
        let registry = LeaseRegistry::new();
        let a = create(&registry, "a1").await;
        let b = create(&registry, "a1").await;
        assert_ne!(a.id, b.id);
        assert_eq!(registry.len().await, 2);
    }

    #[tokio::test]
    async fn retire_drops_lease_from_indexes() {
        let registry = LeaseRegistry::new();
        let lease = create(&registry, "a1").await;
        registry
            .complete(&lease.id, LeaseOutcome::Success, Vec::new())
            .await
            .unwrap();
        assert!(registry.retire(&lease.id).await.is_some());
        assert!(registry.is_retired(&lease.id).await);
        assert!(registry.get(&lease.id).await.is_none());
        assert!(registry.leases_for_session(&lease.session_id).await.is_empty());
        assert!(registry.leases_for_agent(&AgentId::new("a1")).await.is_empty());
        assert!(registry.by_session.is_empty());
        assert!(registry.by_agent.is_empty());

        // A second retire is a no-op
        assert!(registry.retire(&lease.id).await.is_none());
    }

    #[tokio::test]
    async fn retired_history_is_bounded() {
        let registry = LeaseRegistry::new();
        let mut first = None;
        for _ in 0..RETIRED_HISTORY + 10 {
            let lease = create(&registry, "a1").await;
            registry.cancel(&lease.id).await.unwrap();
            registry.retire(&lease.id).await.unwrap();
            first.get_or_insert(lease.id);
        }
        let retired = registry.retired.lock();
        assert_eq!(retired.ids.len(), RETIRED_HISTORY);
        assert_eq!(retired.order.len(), RETIRED_HISTORY);
        assert!(!retired.ids.contains(&first.unwrap()));
    }

    #[tokio::test]
    async fn sessions_are_indexed_separately() {
        let registry = LeaseRegistry::new();
        let session = SessionId::new();
        let mut mine = Vec::new();
        for _ in 0..3 {
            let lease = registry
                .create(
                    AgentId::new("a1"),
                    session,
                    "job",
                    LeaseOptions::new("build", Vec::new()),
                )
                .await;
            mine.push(lease.id);
        }
        create(&registry, "a1").await;

        let listed: Vec<LeaseId> = registry
            .leases_for_session(&session)
            .await
            .iter()
            .map(|l| l.id)
            .collect();
        assert_eq!(listed.len(), 3);
        assert!(mine.iter().all(|id| listed.contains(id)));
        assert_eq!(registry.leases_for_agent(&AgentId::new("a1")).await.len(), 4);
    }

    #[tokio::test]
    async fn concurrent_agents_do_not_interfere() {
        let registry = std::sync::Arc::new(LeaseRegistry::new());
        let mut tasks = Vec::new();
        for n in 0..8 {
            let registry = registry.clone();
            tasks.push(tokio::spawn(async move {
                let agent = format!("a{}", n);
                for _ in 0..50 {
                    let lease = create(&registry, &agent).await;
                    registry.activate(&lease.id).await.unwrap();
                    registry
                        .complete(&lease.id, LeaseOutcome::Success, Vec::new())
                        .await
                        .unwrap();
                    registry.retire(&lease.id).await.unwrap();
                }
                create(&registry, &agent).await;
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(registry.len().await, 8);
        for n in 0..8 {
            let agent = AgentId::new(format!("a{}", n));
            assert_eq!(registry.leases_for_agent(&agent).await.len(), 1);
        }
    }

    #[tokio::test]
    async fn retire_ignores_live_leases() {
        let registry = LeaseRegistry::new();
        let lease = create(&registry, "a1").await;
        assert!(registry.retire(&lease.id).await.is_none());
        assert!(registry.get(&lease.id).await.is_some());
    }

    #[tokio::test]
    async fn complete_records_outcome_and_output() {
        let registry = LeaseRegistry::new();
        let lease = create(&registry, "a1").await;
        registry.activate(&lease.id).await.unwrap();
        let done = registry
            .complete(&lease.id, LeaseOutcome::Failure, b"exit 1".to_vec())
            .await
            .unwrap();
        assert_eq!(done.state, LeaseState::Completed);
        assert_eq!(done.outcome, LeaseOutcome::Failure);
        assert_eq!(done.output, b"exit 1");
    }

    #[tokio::test]
    async fn cancelled_lease_cannot_complete() {
        let registry = LeaseRegistry::new();
        let lease = create(&registry, "a1").await;
        registry.cancel(&lease.id).await.unwrap();
        let err = registry
            .complete(&lease.id, LeaseOutcome::Success, Vec::new())
            .await
            .unwrap_err();
        assert!(matches!(err, LeaseError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn leases_for_agent_filters_by_owner() {
        let registry = LeaseRegistry::new();
        create(&registry, "a1").await;
        create(&registry, "a1").await;
        create(&registry, "a2").await;

        assert_eq!(registry.leases_for_agent(&AgentId::new("a1")).await.len(), 2);
        assert_eq!(registry.leases_for_agent(&AgentId::new("a2")).await.len(), 1);
        assert!(registry.leases_for_agent(&AgentId::new("a3")).await.is_empty());
    }

    #[tokio::test]
    async fn unknown_lease_operations_fail() {
        let registry = LeaseRegistry::new();
        let id = LeaseId::new();
        assert_eq!(registry.activate(&id).await.unwrap_err(), LeaseError::NotFound(id));
        assert_eq!(registry.cancel(&id).await.unwrap_err(), LeaseError::NotFound(id));
    }
}
