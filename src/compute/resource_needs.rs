use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::session::SessionId;

/// Resources a session says it could use, for capacity planning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceNeeds {
    pub session_id: SessionId,
    pub cluster_id: String,
    pub pool: String,
    pub resource_needs: HashMap<String, i32>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Default)]
pub struct ResourceNeedsTracker {
    entries: RwLock<HashMap<SessionId, ResourceNeeds>>,
}

impl ResourceNeedsTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace whatever the session reported before.
    pub async fn report(&self, needs: ResourceNeeds) {
        tracing::debug!(
            session_id = %needs.session_id,
            cluster_id = %needs.cluster_id,
            pool = %needs.pool,
            "Resource needs reported"
        );
        self.entries.write().await.insert(needs.session_id, needs);
    }

    pub async fn remove_session(&self, session_id: &SessionId) -> bool {
        self.entries.write().await.remove(session_id).is_some()
    }

    /// Needs reported for a cluster, oldest first.
    pub async fn for_cluster(&self, cluster_id: &str) -> Vec<ResourceNeeds> {
        let entries = self.entries.read().await;
        let mut needs: Vec<ResourceNeeds> = entries
            .values()
            .filter(|n| n.cluster_id == cluster_id)
            .cloned()
            .collect();
        needs.sort_by_key(|n| n.timestamp);
        needs
    }
}
