use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use common::{AgentId, DatasetId, FlowError, Record, Result, StageId};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FlowState {
    Planning,
    ResourceRequesting,
    Scheduling,
    Running,
    Succeeded,
    Failed,
}

impl FlowState {
    pub fn is_terminal(self) -> bool {
        matches!(self, FlowState::Succeeded | FlowState::Failed)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum FlowEvent {
    State {
        state: FlowState,
    },
    StageScheduled {
        stage: StageId,
        partitions: Vec<u32>,
    },
    /// Particiones de un stage ya completo que se vuelven a correr porque
    /// sus shards se perdieron.
    StageRecomputed {
        stage: StageId,
        partitions: Vec<u32>,
    },
    PartitionStarted {
        stage: StageId,
        partition: u32,
        attempt: u32,
        agent: AgentId,
    },
    PartitionCompleted {
        stage: StageId,
        partition: u32,
        attempt: u32,
        agent: AgentId,
    },
    PartitionFailed {
        stage: StageId,
        partition: u32,
        attempt: u32,
        agent: AgentId,
        error: String,
    },
    ResourceBackoff {
        stage: StageId,
        retry: u32,
        delay_ms: u64,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct EventRecord {
    pub at: DateTime<Utc>,
    #[serde(flatten)]
    pub event: FlowEvent,
}

/// Resultado de correr un flow.
#[derive(Debug)]
pub struct FlowOutcome {
    pub flow_id: String,
    pub state: FlowState,
    /// Registros de los datasets finales (sin consumidores ni sink).
    pub outputs: BTreeMap<DatasetId, Vec<Record>>,
    /// Primer error irrecuperable, con su cadena causal.
    pub error: Option<FlowError>,
    pub events: Vec<EventRecord>,
}

impl FlowOutcome {
    pub fn succeeded(&self) -> bool {
        self.state == FlowState::Succeeded
    }

    pub fn events(&self) -> impl Iterator<Item = &FlowEvent> {
        self.events.iter().map(|r| &r.event)
    }

    pub fn into_result(self) -> Result<BTreeMap<DatasetId, Vec<Record>>> {
        match self.error {
            Some(e) => Err(e),
            None => Ok(self.outputs),
        }
    }
}
