//! Mensajes entre driver, coordinador y agentes, y los traits que los exponen.
//!
//! Cada trait tiene una implementación HTTP (`crate::client`) y una en
//! proceso (el `Coordinator` del master y el `Agent` del agente), así el
//! driver no sabe si habla con un cluster real o con uno armado en un test.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::shard::{ShardBody, ShardKey, ShardMeta};
use crate::task::ExecutorTask;
use crate::{AgentId, AssignmentId, FlowId, GrantId};

/* =========================
   Agente -> coordinador
   ========================= */

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatRequest {
    pub agent: AgentId,
    pub total_slots: u32,
    pub free_slots: u32,
    #[serde(default)]
    pub slot_memory: u64,
    #[serde(default)]
    pub resident_bytes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatAck {
    pub ok: bool,
    /// Intervalo sugerido hasta el próximo heartbeat.
    pub interval_ms: u64,
}

/* =========================
   Driver -> coordinador
   ========================= */

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlotRequest {
    pub flow_id: FlowId,
    pub slots: u32,
    /// Mínimo aceptable; igual a `slots` => todo o nada (gang scheduling).
    #[serde(default)]
    pub min_slots: u32,
    /// Agentes a evitar si hay alternativa (reintentos).
    #[serde(default)]
    pub avoid: Vec<AgentId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlotGrant {
    pub grant_id: GrantId,
    pub agent: AgentId,
    pub lease_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GrantStatus {
    Leased,
    Confirmed,
    Released,
    Expired,
    AgentLost,
    Unknown,
}

impl GrantStatus {
    /// El slot ya no está reservado para quien lo pidió.
    pub fn is_invalid(self) -> bool {
        matches!(
            self,
            GrantStatus::Expired | GrantStatus::AgentLost | GrantStatus::Unknown
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentView {
    pub agent: AgentId,
    pub total_slots: u32,
    pub free_slots: u32,
    /// Slots disponibles descontando los grants activos.
    pub available_slots: u32,
    pub active_grants: u32,
    pub resident_bytes: u64,
    pub last_heartbeat: DateTime<Utc>,
}

/* =========================
   Driver -> agente
   ========================= */

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartExecutorRequest {
    pub grant_id: GrantId,
    pub task: ExecutorTask,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorHandle {
    pub assignment_id: AssignmentId,
    pub agent: AgentId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutorState {
    Pending,
    Running,
    Complete,
    Failed,
}

impl ExecutorState {
    pub fn is_terminal(self) -> bool {
        matches!(self, ExecutorState::Complete | ExecutorState::Failed)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorStatus {
    pub assignment_id: AssignmentId,
    pub state: ExecutorState,
    #[serde(default)]
    pub outputs: Vec<ShardMeta>,
    #[serde(default)]
    pub error: Option<String>,
    /// El fallo vino de una entrada corrupta o truncada: hay que recomputarla.
    #[serde(default)]
    pub input_corrupted: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterReadersRequest {
    pub key: ShardKey,
    pub readers: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AckReadRequest {
    pub keys: Vec<ShardKey>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReleaseFlowRequest {
    #[serde(default)]
    pub include_persistent: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentStatus {
    pub agent: AgentId,
    pub total_slots: u32,
    pub running: u32,
    pub free_slots: u32,
    pub resident_bytes: u64,
    pub memory_quota: u64,
    pub shards: usize,
}

/* =========================
   Traits
   ========================= */

#[async_trait]
pub trait CoordinatorApi: Send + Sync {
    async fn heartbeat(&self, req: HeartbeatRequest) -> Result<HeartbeatAck>;
    async fn request_slots(&self, req: SlotRequest) -> Result<Vec<SlotGrant>>;
    async fn confirm_grant(&self, grant: &str) -> Result<GrantStatus>;
    async fn release_grant(&self, grant: &str) -> Result<GrantStatus>;
    async fn grant_status(&self, grant: &str) -> Result<GrantStatus>;
    async fn agents(&self) -> Result<Vec<AgentView>>;
}

#[async_trait]
pub trait AgentApi: Send + Sync {
    async fn start_executor(&self, req: StartExecutorRequest) -> Result<ExecutorHandle>;
    async fn executor_status(&self, assignment: &str) -> Result<ExecutorStatus>;
    async fn cancel_executor(&self, assignment: &str) -> Result<()>;
    async fn register_readers(&self, req: RegisterReadersRequest) -> Result<()>;
    async fn ack_reads(&self, req: AckReadRequest) -> Result<()>;
    async fn release_flow(&self, flow_id: &str, include_persistent: bool) -> Result<usize>;
    /// Cuerpo JSONL de un shard completo, sin cargarlo entero. Repetirlo
    /// devuelve lo mismo.
    async fn fetch_shard(&self, key: &ShardKey) -> Result<ShardBody>;
    async fn status(&self) -> Result<AgentStatus>;
}

/// Cómo llega el driver a un agente a partir de su id (dirección).
pub trait AgentConnector: Send + Sync {
    fn connect(&self, agent: &str) -> Result<Arc<dyn AgentApi>>;
}
