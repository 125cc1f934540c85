use std::process::Stdio;

use tokio::process::Command;

use crate::relay::{PortMapping, RelayError};

/// Programs packet forwarding for relayed leases.
#[tonic::async_trait]
pub trait Firewall: Send + Sync {
    /// Apply one reconciliation step. Removals are applied before additions.
    async fn apply(&self, removed: &[PortMapping], added: &[PortMapping]) -> Result<(), RelayError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RuleAction {
    Check,
    Append,
    Delete,
}

impl RuleAction {
    fn flag(self) -> &'static str {
        match self {
            RuleAction::Check => "-C",
            RuleAction::Append => "-A",
            RuleAction::Delete => "-D",
        }
    }
}

/// Forwards relay ports with `iptables` DNAT rules.
#[derive(Debug, Clone)]
pub struct IptablesFirewall {
    binary: String,
}

impl Default for IptablesFirewall {
    fn default() -> Self {
        Self::new("iptables")
    }
}

impl IptablesFirewall {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    /// Argument lists for every rule backing `mapping`.
    fn rules(mapping: &PortMapping, action: RuleAction) -> Vec<Vec<String>> {
        let sources: Vec<Option<String>> = if mapping.allowed_source_ips.is_empty() {
            vec![None]
        } else {
            mapping
                .allowed_source_ips
                .iter()
                .map(|ip| Some(ip.to_string()))
                .collect()
        };

        let mut rules = Vec::new();
        for port in &mapping.ports {
            let destination = format!("{}:{}", mapping.agent_ip, port.agent_port);
            for source in &sources {
                let mut dnat = vec![
                    "-t".to_string(),
                    "nat".to_string(),
                    action.flag().to_string(),
                    "PREROUTING".to_string(),
                    "-p".to_string(),
                    port.protocol.to_string(),
                ];
                if let Some(ref ip) = source {
                    dnat.extend(["-s".to_string(), ip.clone()]);
                }
                dnat.extend([
                    "--dport".to_string(),
                    port.relay_port.to_string(),
                    "-j".to_string(),
                    "DNAT".to_string(),
                    "--to-destination".to_string(),
                    destination.clone(),
                ]);
                rules.push(dnat);
            }

            rules.push(vec![
                action.flag().to_string(),
                "FORWARD".to_string(),
                "-p".to_string(),
                port.protocol.to_string(),
                "-d".to_string(),
                mapping.agent_ip.to_string(),
                "--dport".to_string(),
                port.agent_port.to_string(),
                "-j".to_string(),
                "ACCEPT".to_string(),
            ]);
        }
        rules
    }

    async fn run(&self, args: &[String]) -> Result<(), RelayError> {
        let output = Command::new(&self.binary)
            .args(args)
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| RelayError::Firewall(format!("failed to run {}: {}", self.binary, e)))?;

        if output.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        Err(RelayError::Firewall(if stderr.is_empty() {
            format!("{} exited with {:?}", self.binary, output.status.code())
        } else {
            stderr
        }))
    }

    /// Append the rules of `mapping` that are not installed yet. On failure
    /// the rules appended by this call are deleted again.
    async fn add(&self, mapping: &PortMapping) -> Result<(), RelayError> {
        let checks = Self::rules(mapping, RuleAction::Check);
        let appends = Self::rules(mapping, RuleAction::Append);
        let deletes = Self::rules(mapping, RuleAction::Delete);

        let mut appended: Vec<&Vec<String>> = Vec::new();
        for ((check, append), delete) in checks.iter().zip(&appends).zip(&deletes) {
            if self.run(check).await.is_ok() {
                continue;
            }
            if let Err(e) = self.run(append).await {
                for rule in appended.iter().rev() {
                    if let Err(undo) = self.run(rule).await {
                        tracing::warn!(
                            lease_id = %mapping.lease_id,
                            error = %undo,
                            "Failed to roll back firewall rule"
                        );
                    }
                }
                return Err(e);
            }
            appended.push(delete);
        }
        Ok(())
    }
}

#[tonic::async_trait]
impl Firewall for IptablesFirewall {
    async fn apply(
        &self,
        removed: &[PortMapping],
        added: &[PortMapping],
    ) -> Result<(), RelayError> {
        for mapping in removed {
            for rule in Self::rules(mapping, RuleAction::Delete) {
                // The rule may already be gone after a restart
                if let Err(e) = self.run(&rule).await {
                    tracing::warn!(
                        lease_id = %mapping.lease_id,
                        error = %e,
                        "Failed to delete firewall rule"
                    );
                }
            }
        }
        for mapping in added {
            self.add(mapping).await?;
        }
        Ok(())
    }
}

/// Dry-run back-end that only logs what it would change.
#[derive(Debug, Clone, Default)]
pub struct LoggingFirewall;

#[tonic::async_trait]
impl Firewall for LoggingFirewall {
    async fn apply(
        &self,
        removed: &[PortMapping],
        added: &[PortMapping],
    ) -> Result<(), RelayError> {
        tracing::debug!(
            removed = removed.len(),
            added = added.len(),
            "Dry run firewall update"
        );
        Ok(())
    }
}
