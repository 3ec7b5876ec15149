pub mod client;
pub mod config;
pub mod engine;
pub mod error;
pub mod fetch;
pub mod flow;
pub mod logic;
pub mod planner;
pub mod protocol;
pub mod shard;
pub mod source;
pub mod store;
pub mod task;

pub use error::{FlowError, PlanningError, Result};
pub use flow::{Dataset, Flow, Step, StepKind};
pub use logic::LogicRegistry;
pub use planner::{plan, ExecutionGraph, Operator, ShuffleWrite, Stage, StageHead, StageInput};
pub use protocol::*;
pub use shard::{ShardKey, ShardMeta, ShardState};
pub use source::{SinkSpec, SourceSpec};
pub use store::{ShardHandle, ShardStore, StoreConfig};
pub use task::{ExecutionMode, ExecutorReport, ExecutorTask, InputShard};

/// Tipo genérico de registro (fila de datos).
/// Usamos JSON para poder representar texto, CSV, JSONL, etc.
pub type Record = serde_json::Value;

pub type FlowId = String;
pub type DatasetId = u32;
pub type StepId = u32;
pub type StageId = u32;
/// Un agente se identifica por su dirección base, ej: "http://10.0.0.5:9090".
pub type AgentId = String;
pub type GrantId = String;
pub type AssignmentId = String;
