use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::agent::Agent;
use crate::compute::condition::Condition;

/// How much of a named resource a request wants. `max` of `None` means
/// exactly `min`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRange {
    pub min: i32,
    #[serde(default)]
    pub max: Option<i32>,
}

impl ResourceRange {
    pub fn exactly(amount: i32) -> Self {
        Self {
            min: amount,
            max: None,
        }
    }

    pub fn between(min: i32, max: i32) -> Self {
        Self {
            min,
            max: Some(max),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Requirements {
    pub pool: Option<String>,
    pub condition: Option<Condition>,
    pub resources: HashMap<String, ResourceRange>,
    /// Take the whole agent
    pub exclusive: bool,
}

impl Requirements {
    pub fn with_pool(mut self, pool: impl Into<String>) -> Self {
        self.pool = Some(pool.into());
        self
    }

    pub fn with_condition(mut self, condition: Condition) -> Self {
        self.condition = Some(condition);
        self
    }

    pub fn with_resource(mut self, name: impl Into<String>, range: ResourceRange) -> Self {
        self.resources.insert(name.into(), range);
        self
    }

    pub fn with_exclusive(mut self, exclusive: bool) -> Self {
        self.exclusive = exclusive;
        self
    }

    /// Whether the agent's static attributes satisfy the request.
    pub fn matches(&self, agent: &Agent) -> bool {
        if let Some(ref pool) = self.pool {
            if !agent.in_pool(pool) {
                return false;
            }
        }
        self.condition
            .as_ref()
            .map_or(true, |condition| condition.evaluate(agent))
    }

    /// Resources to reserve on `agent`, or `None` if it cannot host the
    /// request right now.
    pub fn allocate(&self, agent: &Agent) -> Option<HashMap<String, i32>> {
        if agent.has_exclusive_lease() {
            return None;
        }
        let free = agent.free_resources();

        if self.exclusive {
            if agent.is_busy() {
                return None;
            }
            for (name, range) in &self.resources {
                if free.get(name).copied().unwrap_or(0) < range.min {
                    return None;
                }
            }
            return Some(free);
        }

        let mut assigned = HashMap::new();
        for (name, range) in &self.resources {
            let available = free.get(name).copied().unwrap_or(0);
            if available < range.min {
                return None;
            }
            let amount = match range.max {
                Some(max) => available.min(max).max(range.min),
                None => range.min,
            };
            assigned.insert(name.clone(), amount);
        }
        Some(assigned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::AgentId;
    use crate::lease::{Lease, LeaseId, LeaseOptions};
    use crate::session::SessionId;

    fn agent() -> Agent {
        let mut agent = Agent::new(AgentId::new("a1"));
        agent.pools.push("ue".to_string());
        agent.properties.push("OSFamily=Linux".to_string());
        agent.resources.insert("cpu".to_string(), 16);
        agent.resources.insert("ram".to_string(), 64);
        agent
    }

    fn occupy(agent: &mut Agent, cpu: i32, exclusive: bool) {
        let options = LeaseOptions::new("busy", Vec::new())
            .with_resource("cpu", cpu)
            .with_exclusive(exclusive);
        let lease = Lease::new(LeaseId::new(), agent.id.clone(), SessionId::new(), "job", options);
        agent.attach_lease(&lease);
    }

    #[test]
    fn pool_and_condition_filter() {
        let agent = agent();
        assert!(Requirements::default().matches(&agent));
        assert!(Requirements::default().with_pool("ue").matches(&agent));
        assert!(!Requirements::default().with_pool("other").matches(&agent));
        let windows = Condition::parse("OSFamily == Windows").unwrap();
        assert!(!Requirements::default().with_condition(windows).matches(&agent));
    }

    #[test]
    fn ranges_take_what_is_free_up_to_max() {
        let mut agent = agent();
        occupy(&mut agent, 10, false);

        let req = Requirements::default()
            .with_resource("cpu", ResourceRange::between(2, 8))
            .with_resource("ram", ResourceRange::exactly(4));
        let assigned = req.allocate(&agent).unwrap();
        assert_eq!(assigned["cpu"], 6);
        assert_eq!(assigned["ram"], 4);

        let greedy = Requirements::default().with_resource("cpu", ResourceRange::exactly(8));
        assert!(greedy.allocate(&agent).is_none());
    }

    #[test]
    fn exclusive_needs_an_idle_agent_and_takes_everything() {
        let mut agent = agent();
        let req = Requirements::default()
            .with_exclusive(true)
            .with_resource("cpu", ResourceRange::exactly(1));
        let assigned = req.allocate(&agent).unwrap();
        assert_eq!(assigned["cpu"], 16);
        assert_eq!(assigned["ram"], 64);

        occupy(&mut agent, 1, false);
        assert!(req.allocate(&agent).is_none());
    }

    #[test]
    fn exclusive_lease_blocks_everything() {
        let mut agent = agent();
        occupy(&mut agent, 0, true);
        assert!(Requirements::default().allocate(&agent).is_none());
    }
}
