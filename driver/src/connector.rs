use std::{collections::HashMap, sync::Arc};

use common::{AgentApi, AgentConnector, AgentId, FlowError, Result};

/// Conector con un conjunto fijo de agentes ya construidos (cluster en
/// proceso).
#[derive(Clone, Default)]
pub struct StaticConnector {
    agents: HashMap<AgentId, Arc<dyn AgentApi>>,
}

impl StaticConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, id: impl Into<AgentId>, agent: Arc<dyn AgentApi>) -> Self {
        self.agents.insert(id.into(), agent);
        self
    }
}

impl AgentConnector for StaticConnector {
    fn connect(&self, agent: &str) -> Result<Arc<dyn AgentApi>> {
        self.agents
            .get(agent)
            .cloned()
            .ok_or_else(|| FlowError::AgentUnavailable(agent.to_string()))
    }
}
