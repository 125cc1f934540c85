use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::RwLock;

use crate::agent::{Agent, AgentId};
use crate::config::UpgradeConfig;
use crate::lease::{Lease, LeaseOptions};
use crate::task_source::{encode_payload, Decision, TaskSource, TaskSourceFlags};

pub const UPGRADE_TASK_TYPE: &str = "upgrade";

const ROLLOUT_BUCKETS: u64 = 10_000;

/// A software version being rolled out to the fleet over a time window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Deployment {
    pub version: String,
    pub start_time: DateTime<Utc>,
    /// Time until every agent is admitted; zero admits everyone at once
    #[serde(default)]
    pub rollout_duration_secs: u64,
}

impl Deployment {
    pub fn new(version: impl Into<String>, start_time: DateTime<Utc>) -> Self {
        Self {
            version: version.into(),
            start_time,
            rollout_duration_secs: 0,
        }
    }

    pub fn with_rollout(mut self, duration: std::time::Duration) -> Self {
        self.rollout_duration_secs = duration.as_secs();
        self
    }

    /// Fraction of the fleet admitted at `now`, in `[0, 1]`.
    pub fn progress(&self, now: DateTime<Utc>) -> f64 {
        if now < self.start_time {
            return 0.0;
        }
        if self.rollout_duration_secs == 0 {
            return 1.0;
        }
        let elapsed = (now - self.start_time).num_milliseconds() as f64;
        let total = self.rollout_duration_secs as f64 * 1000.0;
        (elapsed / total).clamp(0.0, 1.0)
    }
}

/// Payload of an upgrade lease.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpgradeTask {
    pub version: String,
}

/// Stable position of an agent in every rollout, in `[0, 1)`.
pub fn rollout_phase(agent_id: &AgentId) -> f64 {
    let digest = Sha256::digest(agent_id.as_str().as_bytes());
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    (u64::from_be_bytes(prefix) % ROLLOUT_BUCKETS) as f64 / ROLLOUT_BUCKETS as f64
}

/// Rolls new agent software out to the fleet.
#[derive(Debug)]
pub struct UpgradeTaskSource {
    config: UpgradeConfig,
    deployment: RwLock<Option<Deployment>>,
}

impl UpgradeTaskSource {
    pub fn new(config: UpgradeConfig) -> Self {
        Self {
            config,
            deployment: RwLock::new(None),
        }
    }

    pub async fn set_deployment(&self, deployment: Deployment) {
        tracing::info!(
            version = %deployment.version,
            start_time = %deployment.start_time,
            rollout_secs = deployment.rollout_duration_secs,
            "Deployment scheduled"
        );
        *self.deployment.write().await = Some(deployment);
    }

    pub async fn clear_deployment(&self) {
        *self.deployment.write().await = None;
    }

    pub async fn deployment(&self) -> Option<Deployment> {
        self.deployment.read().await.clone()
    }

    /// The deployment due at `now` and its rollout progress.
    pub async fn current_deployment(&self, now: DateTime<Utc>) -> Option<(Deployment, f64)> {
        let deployment = self.deployment.read().await.clone()?;
        if deployment.start_time > now {
            return None;
        }
        let progress = deployment.progress(now);
        Some((deployment, progress))
    }

    fn cooldown(&self) -> Duration {
        Duration::from_std(self.config.cooldown).unwrap_or_else(|_| Duration::minutes(5))
    }
}

#[tonic::async_trait]
impl TaskSource for UpgradeTaskSource {
    fn task_type(&self) -> &str {
        UPGRADE_TASK_TYPE
    }

    fn flags(&self) -> TaskSourceFlags {
        TaskSourceFlags::ALLOW_WHEN_DISABLED | TaskSourceFlags::ALLOW_DURING_DOWNTIME
    }

    async fn assign_lease(&self, agent: &Agent, now: DateTime<Utc>) -> Decision {
        if !self.config.enabled || !agent.auto_update {
            return Decision::Skip;
        }
        let Some((deployment, progress)) = self.current_deployment(now).await else {
            return Decision::Skip;
        };

        let phase = rollout_phase(&agent.id);
        if phase > progress {
            tracing::debug!(
                agent_id = %agent.id,
                phase,
                progress,
                "Agent not yet admitted to rollout"
            );
            return Decision::Skip;
        }
        if agent.version == deployment.version {
            return Decision::Skip;
        }

        let recently_attempted = agent.last_upgrade_version.as_deref()
            == Some(deployment.version.as_str())
            && agent
                .last_upgrade_time
                .is_some_and(|t| now - t < self.cooldown());
        if agent.is_busy() || recently_attempted {
            return Decision::Drain;
        }

        let task = UpgradeTask {
            version: deployment.version.clone(),
        };
        let Some(payload) = encode_payload(UPGRADE_TASK_TYPE, agent, &task) else {
            return Decision::Skip;
        };
        Decision::Lease(
            LeaseOptions::new(format!("Upgrade to {}", deployment.version), payload)
                .with_exclusive(true),
        )
    }

    async fn lease_created(&self, agent: &mut Agent, lease: &Lease) {
        if let Ok(task) = serde_json::from_slice::<UpgradeTask>(&lease.payload) {
            agent.last_upgrade_time = Some(lease.created_at);
            agent.last_upgrade_version = Some(task.version);
        }
    }
}
