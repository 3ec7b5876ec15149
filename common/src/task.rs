use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::planner::Stage;
use crate::shard::{ShardKey, ShardMeta};
use crate::{AgentId, AssignmentId, FlowId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionMode {
    /// Todo el working set en memoria; pasarse del presupuesto es un error.
    InMemory,
    /// Runs ordenados a disco + merge (sort externo).
    OnDisk,
}

/// Un shard de entrada y dónde encontrarlo.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputShard {
    pub meta: ShardMeta,
    pub agent: AgentId,
    /// Lo completa el agente cuando el shard está en disco en la misma máquina.
    #[serde(default)]
    pub local_path: Option<PathBuf>,
}

/// Una partición de un stage en un intento: lo que corre un executor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorTask {
    pub assignment_id: AssignmentId,
    pub flow_id: FlowId,
    pub stage: Stage,
    pub partition: u32,
    pub attempt: u32,
    /// Una lista por entrada del head (en un join: izquierda y derecha).
    pub inputs: Vec<Vec<InputShard>>,
    pub mode: ExecutionMode,
    pub memory_budget: u64,
    /// Raíz del Shard Store del agente; la fija el agente al aceptar la tarea.
    #[serde(default)]
    pub store_root: PathBuf,
}

impl ExecutorTask {
    pub fn output_keys(&self) -> Vec<ShardKey> {
        self.stage
            .output_keys(&self.flow_id, self.partition, self.attempt)
    }

    pub fn input_bytes(&self) -> u64 {
        self.inputs.iter().flatten().map(|i| i.meta.bytes).sum()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorReport {
    pub assignment_id: AssignmentId,
    pub outputs: Vec<ShardMeta>,
    pub records_in: u64,
    pub records_out: u64,
}
