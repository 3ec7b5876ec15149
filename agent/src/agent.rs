//! Agente: slots de ejecución, executors en curso y el Shard Store local.

use std::{
    collections::HashMap,
    io::Cursor,
    sync::{Arc, Mutex, MutexGuard},
};

use async_trait::async_trait;
use common::{
    shard::ShardBody, AckReadRequest, AgentApi, AgentStatus, ExecutorHandle, ExecutorReport,
    ExecutorState, ExecutorStatus, FlowError, HeartbeatRequest, RegisterReadersRequest, Result,
    ShardHandle, ShardKey, ShardStore, StartExecutorRequest,
};
use tokio::io::BufReader;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::AgentConfig;
use crate::launcher::ExecutorLauncher;

struct Execution {
    flow_id: String,
    status: ExecutorStatus,
    cancel: CancellationToken,
}

#[derive(Default)]
struct Executions {
    by_id: HashMap<String, Execution>,
    running: u32,
}

#[derive(Clone)]
pub struct Agent {
    config: Arc<AgentConfig>,
    store: ShardStore,
    launcher: Arc<dyn ExecutorLauncher>,
    executions: Arc<Mutex<Executions>>,
}

impl Agent {
    pub fn new(config: AgentConfig, store: ShardStore, launcher: Arc<dyn ExecutorLauncher>) -> Self {
        Self {
            config: Arc::new(config),
            store,
            launcher,
            executions: Arc::new(Mutex::new(Executions::default())),
        }
    }

    pub fn id(&self) -> &str {
        &self.config.id
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn store(&self) -> &ShardStore {
        &self.store
    }

    fn lock(&self) -> MutexGuard<'_, Executions> {
        self.executions.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Slots libres: los que no corren nada y además tienen memoria
    /// disponible después de contar los shards residentes.
    fn free_slots_with(&self, running: u32) -> u32 {
        let by_count = self.config.total_slots.saturating_sub(running);
        let slot_memory = self.config.slot_memory;
        if slot_memory == 0 {
            return by_count;
        }
        let used = self.store.resident_bytes() + running as u64 * slot_memory;
        let by_memory = self.store.config().memory_quota.saturating_sub(used) / slot_memory;
        by_count.min(by_memory.min(u32::MAX as u64) as u32)
    }

    pub fn free_slots(&self) -> u32 {
        let running = self.lock().running;
        self.free_slots_with(running)
    }

    pub fn running(&self) -> u32 {
        self.lock().running
    }

    pub fn heartbeat_request(&self) -> HeartbeatRequest {
        HeartbeatRequest {
            agent: self.config.id.clone(),
            total_slots: self.config.total_slots,
            free_slots: self.free_slots(),
            slot_memory: self.config.slot_memory,
            resident_bytes: self.store.resident_bytes(),
        }
    }

    pub fn start(&self, req: StartExecutorRequest) -> Result<ExecutorHandle> {
        let mut task = req.task;
        let assignment = task.assignment_id.clone();
        let handle = ExecutorHandle {
            assignment_id: assignment.clone(),
            agent: self.config.id.clone(),
        };
        let cancel = CancellationToken::new();

        {
            let mut ex = self.lock();
            if ex.by_id.contains_key(&assignment) {
                return Ok(handle);
            }
            if self.free_slots_with(ex.running) == 0 {
                warn!(
                    "rechazo {} (grant {}): sin slots libres ({} corriendo)",
                    assignment, req.grant_id, ex.running
                );
                return Err(FlowError::NoFreeSlots);
            }
            ex.running += 1;
            ex.by_id.insert(
                assignment.clone(),
                Execution {
                    flow_id: task.flow_id.clone(),
                    status: ExecutorStatus {
                        assignment_id: assignment.clone(),
                        state: ExecutorState::Running,
                        outputs: vec![],
                        error: None,
                        input_corrupted: false,
                    },
                    cancel: cancel.clone(),
                },
            );
        }

        task.store_root = self.store.layout().root().to_path_buf();
        if self.config.slot_memory > 0 {
            task.memory_budget = match task.memory_budget {
                0 => self.config.slot_memory,
                b => b.min(self.config.slot_memory),
            };
        }
        for input in task.inputs.iter_mut().flatten() {
            if input.agent != self.config.id {
                continue;
            }
            if let Ok((ShardHandle::Disk(path), _)) = self.store.locate(&input.meta.key) {
                input.local_path = Some(path);
            }
        }

        let keys = task.output_keys();
        self.store.reserve(&keys);
        self.store.begin_write(&keys);
        info!(
            "executor {} (stage {}, partición {}, intento {}) arrancando",
            assignment, task.stage.id, task.partition, task.attempt
        );

        let agent = self.clone();
        tokio::spawn(async move {
            let result = agent.launcher.run(task, cancel).await;
            agent.finish(&assignment, &keys, result);
        });
        Ok(handle)
    }

    /// Publica las salidas de un executor exitoso o descarta todo lo que
    /// escribió uno fallido; sólo después cambia el estado visible.
    fn finish(&self, assignment: &str, keys: &[ShardKey], result: Result<ExecutorReport>) {
        let outcome = result.and_then(|report| {
            for meta in &report.outputs {
                self.store.publish(meta.clone())?;
            }
            Ok(report)
        });
        if outcome.is_err() {
            self.store.discard(keys);
        }

        let mut ex = self.lock();
        ex.running = ex.running.saturating_sub(1);
        let Some(execution) = ex.by_id.get_mut(assignment) else {
            return;
        };
        let status = &mut execution.status;
        match outcome {
            Ok(report) => {
                info!(
                    "executor {} completo: {} registros leídos, {} escritos",
                    assignment, report.records_in, report.records_out
                );
                status.state = ExecutorState::Complete;
                status.outputs = report.outputs;
            }
            Err(e) => {
                warn!("executor {} falló: {}", assignment, e);
                status.state = ExecutorState::Failed;
                status.input_corrupted = matches!(
                    e.root(),
                    FlowError::ShardCorruption { .. }
                        | FlowError::ShardNotFound(_)
                        | FlowError::AgentUnavailable(_)
                );
                status.error = Some(e.to_string());
            }
        }
    }

    pub fn executor_status(&self, assignment: &str) -> Result<ExecutorStatus> {
        self.lock()
            .by_id
            .get(assignment)
            .map(|e| e.status.clone())
            .ok_or_else(|| FlowError::ExecutorFailure(format!("assignment {assignment} desconocido")))
    }

    pub fn cancel(&self, assignment: &str) {
        if let Some(execution) = self.lock().by_id.get(assignment) {
            debug!("cancelando executor {}", assignment);
            execution.cancel.cancel();
        }
    }

    pub fn register_readers(&self, key: &ShardKey, readers: u32) {
        self.store.register_readers(key, readers);
    }

    pub fn ack_reads(&self, keys: &[ShardKey]) {
        for key in keys {
            self.store.ack_read(key);
        }
    }

    /// Libera los shards del flow y olvida sus executors; los que sigan
    /// corriendo se cancelan.
    pub fn release_flow(&self, flow_id: &str, include_persistent: bool) -> usize {
        {
            let mut ex = self.lock();
            ex.by_id.retain(|_, e| {
                if e.flow_id != flow_id {
                    return true;
                }
                if !e.status.state.is_terminal() {
                    e.cancel.cancel();
                    return true;
                }
                false
            });
        }
        self.store.release_flow(flow_id, include_persistent)
    }

    /// Abre un shard completo para leerlo de a trozos; los de disco no se
    /// cargan enteros.
    pub async fn open_shard(&self, key: &ShardKey) -> Result<ShardBody> {
        match self.store.locate(key)?.0 {
            ShardHandle::Memory(bytes) => Ok(Box::pin(Cursor::new(bytes))),
            ShardHandle::Disk(path) => {
                let file = tokio::fs::File::open(path).await?;
                Ok(Box::pin(BufReader::new(file)))
            }
        }
    }

    pub fn status(&self) -> AgentStatus {
        let running = self.running();
        AgentStatus {
            agent: self.config.id.clone(),
            total_slots: self.config.total_slots,
            running,
            free_slots: self.free_slots_with(running),
            resident_bytes: self.store.resident_bytes(),
            memory_quota: self.store.config().memory_quota,
            shards: self.store.len(),
        }
    }
}

#[async_trait]
impl AgentApi for Agent {
    async fn start_executor(&self, req: StartExecutorRequest) -> Result<ExecutorHandle> {
        self.start(req)
    }

    async fn executor_status(&self, assignment: &str) -> Result<ExecutorStatus> {
        Agent::executor_status(self, assignment)
    }

    async fn cancel_executor(&self, assignment: &str) -> Result<()> {
        self.cancel(assignment);
        Ok(())
    }

    async fn register_readers(&self, req: RegisterReadersRequest) -> Result<()> {
        Agent::register_readers(self, &req.key, req.readers);
        Ok(())
    }

    async fn ack_reads(&self, req: AckReadRequest) -> Result<()> {
        Agent::ack_reads(self, &req.keys);
        Ok(())
    }

    async fn release_flow(&self, flow_id: &str, include_persistent: bool) -> Result<usize> {
        Ok(Agent::release_flow(self, flow_id, include_persistent))
    }

    async fn fetch_shard(&self, key: &ShardKey) -> Result<ShardBody> {
        self.open_shard(key).await
    }

    async fn status(&self) -> Result<AgentStatus> {
        Ok(Agent::status(self))
    }
}
