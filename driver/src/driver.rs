//! Orquestación de un flow: planificación, pedido de slots, arranque de
//! executors, reintentos por partición y recomputación de linaje.

use std::{
    collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque},
    sync::Arc,
};

use chrono::Utc;
use common::{
    plan, shard::read_verified, AgentApi, AgentConnector, AgentId, CoordinatorApi,
    ExecutionGraph, ExecutorState, ExecutorTask, Flow, FlowError, GrantStatus, InputShard,
    Record, Result, ShardKey, ShardMeta, SlotGrant, SlotRequest, Stage, StageId,
    StartExecutorRequest, StepId,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::DriverConfig;
use crate::outcome::{EventRecord, FlowEvent, FlowOutcome, FlowState};

/// Salida confirmada de una partición.
#[derive(Debug, Clone)]
struct PartitionOutput {
    agent: AgentId,
    outputs: Vec<ShardMeta>,
}

/// Un shard que alguna partición necesita leer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Need {
    stage: StageId,
    partition: u32,
    /// `Some((shuffle, bucket))` para un bucket de shuffle.
    bucket: Option<(StepId, u32)>,
}

impl Need {
    fn matches(&self, key: &ShardKey) -> bool {
        match self.bucket {
            Some((shuffle, bucket)) => key.shuffle == Some(shuffle) && key.bucket == Some(bucket),
            None => key.shuffle.is_none(),
        }
    }
}

/// Shards que lee la partición `partition` de `stage`.
fn needs_of(graph: &ExecutionGraph, stage: &Stage, partition: u32) -> Vec<Vec<Need>> {
    stage
        .head
        .inputs()
        .iter()
        .map(|input| match input.shuffle {
            Some(shuffle) => {
                let producers = graph.stage(input.stage).map(|s| s.partitions).unwrap_or(0);
                (0..producers)
                    .map(|q| Need {
                        stage: input.stage,
                        partition: q,
                        bucket: Some((shuffle, partition)),
                    })
                    .collect()
            }
            None => vec![Need {
                stage: input.stage,
                partition,
                bucket: None,
            }],
        })
        .collect()
}

/// Una partición de un stage.
type PartKey = (StageId, u32);

struct InFlight {
    stage: StageId,
    partition: u32,
    attempt: u32,
    agent: AgentId,
    api: Arc<dyn AgentApi>,
    grant: String,
    assignment: String,
    inputs: Vec<InputShard>,
    poll_errors: u32,
}

enum Poll {
    Running,
    Done(Vec<ShardMeta>),
    Failed { error: FlowError, input_lost: bool },
}

enum Launch {
    Started(InFlight),
    /// El grant venció o se perdió antes de confirmarlo: la partición vuelve
    /// a la cola sin contar como intento.
    GrantLost,
    Refused { agent: AgentId, error: FlowError },
}

/// Estado mutable de una ejecución.
struct Run {
    flow_id: String,
    graph: ExecutionGraph,
    done: HashMap<StageId, BTreeMap<u32, PartitionOutput>>,
    next_attempt: HashMap<(StageId, u32), u32>,
    failures: HashMap<(StageId, u32), u32>,
    avoid: HashMap<(StageId, u32), Vec<AgentId>>,
    readers: HashMap<ShardKey, u32>,
    acks: HashMap<ShardKey, u32>,
    evicted: HashSet<ShardKey>,
    agents_used: BTreeSet<AgentId>,
    state: FlowState,
    events: Vec<EventRecord>,
}

impl Run {
    fn event(&mut self, event: FlowEvent) {
        self.events.push(EventRecord {
            at: Utc::now(),
            event,
        });
    }

    /// Los estados sólo avanzan.
    fn advance(&mut self, state: FlowState) {
        if state > self.state {
            info!("flow {}: {:?} -> {:?}", self.flow_id, self.state, state);
            self.state = state;
            self.event(FlowEvent::State { state });
        }
    }

    fn stage(&self, id: StageId) -> Result<Stage> {
        self.graph
            .stage(id)
            .cloned()
            .ok_or_else(|| FlowError::ExecutorFailure(format!("stage {id} inexistente")))
    }

    fn is_done(&self, stage: StageId, partition: u32) -> bool {
        self.done
            .get(&stage)
            .is_some_and(|parts| parts.contains_key(&partition))
    }

    fn take_attempt(&mut self, stage: StageId, partition: u32) -> u32 {
        let next = self.next_attempt.entry((stage, partition)).or_insert(0);
        let attempt = *next;
        *next += 1;
        attempt
    }

    fn record_failure(&mut self, stage: StageId, partition: u32, agent: &str) -> u32 {
        self.avoid
            .entry((stage, partition))
            .or_default()
            .push(agent.to_string());
        let failures = self.failures.entry((stage, partition)).or_insert(0);
        *failures += 1;
        *failures
    }

    fn find(&self, need: &Need) -> Option<(&PartitionOutput, &ShardMeta)> {
        let out = self.done.get(&need.stage)?.get(&need.partition)?;
        let meta = out.outputs.iter().find(|m| need.matches(&m.key))?;
        Some((out, meta))
    }

    fn available(&self, need: &Need, alive: &HashSet<AgentId>) -> bool {
        match self.find(need) {
            Some((out, meta)) => alive.contains(&out.agent) && !self.evicted.contains(&meta.key),
            None => false,
        }
    }

    fn all_done(&self) -> bool {
        self.graph
            .stages
            .iter()
            .all(|s| (0..s.partitions).all(|p| self.is_done(s.id, p)))
    }

    fn inputs_ready(&self, stage: &Stage, partition: u32, alive: &HashSet<AgentId>) -> bool {
        needs_of(&self.graph, stage, partition)
            .iter()
            .flatten()
            .all(|need| self.available(need, alive))
    }

    /// Olvida salidas ya confirmadas para que se vuelvan a producir.
    fn forget(&mut self, parts: BTreeMap<StageId, BTreeSet<u32>>) {
        for (stage, parts) in parts {
            let Some(done) = self.done.get_mut(&stage) else {
                continue;
            };
            let removed: Vec<u32> = parts.into_iter().filter(|p| done.remove(p).is_some()).collect();
            if removed.is_empty() {
                continue;
            }
            info!(
                "flow {}: recomputando stage {} particiones {:?}",
                self.flow_id, stage, removed
            );
            self.event(FlowEvent::StageRecomputed {
                stage,
                partitions: removed,
            });
        }
    }

    fn task_inputs(&self, stage: &Stage, partition: u32) -> Result<Vec<Vec<InputShard>>> {
        needs_of(&self.graph, stage, partition)
            .into_iter()
            .map(|needs| {
                needs
                    .iter()
                    .map(|need| {
                        let (out, meta) = self.find(need).ok_or_else(|| {
                            FlowError::ShardNotFound(format!(
                                "salida de stage {} partición {}",
                                need.stage, need.partition
                            ))
                        })?;
                        Ok(InputShard {
                            meta: meta.clone(),
                            agent: out.agent.clone(),
                            local_path: None,
                        })
                    })
                    .collect()
            })
            .collect()
    }

    /// Cuántas particiones consumidoras leen un shard. Los finales y los
    /// persistentes no se cuentan: no se liberan por lectura.
    fn readers_of(&self, stage: StageId, meta: &ShardMeta) -> u32 {
        if meta.persistent {
            return 0;
        }
        if meta.key.shuffle.is_some() {
            return 1;
        }
        self.graph
            .downstream(stage)
            .into_iter()
            .flat_map(|s| s.head.inputs())
            .filter(|i| i.stage == stage && i.shuffle.is_none())
            .count() as u32
    }
}

pub struct Driver {
    coordinator: Arc<dyn CoordinatorApi>,
    agents: Arc<dyn AgentConnector>,
    config: DriverConfig,
}

async fn sleep_or_cancel(delay: std::time::Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}

fn flow_id_for(name: &str) -> String {
    let clean: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '-' })
        .collect();
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{}-{}", clean, &suffix[..8])
}

impl Driver {
    pub fn new(
        coordinator: Arc<dyn CoordinatorApi>,
        agents: Arc<dyn AgentConnector>,
        config: DriverConfig,
    ) -> Self {
        Self {
            coordinator,
            agents,
            config,
        }
    }

    pub fn config(&self) -> &DriverConfig {
        &self.config
    }

    /// Corre el flow hasta un estado terminal. Un DAG inválido falla en
    /// `Planning` sin pedir recursos.
    pub async fn run(&self, flow: &Flow, cancel: CancellationToken) -> FlowOutcome {
        let flow_id = flow_id_for(&flow.name);
        let mut events = vec![EventRecord {
            at: Utc::now(),
            event: FlowEvent::State {
                state: FlowState::Planning,
            },
        }];

        let graph = match plan(flow) {
            Ok(graph) => graph,
            Err(e) => {
                warn!("flow {}: plan inválido: {}", flow_id, e);
                events.push(EventRecord {
                    at: Utc::now(),
                    event: FlowEvent::State {
                        state: FlowState::Failed,
                    },
                });
                return FlowOutcome {
                    flow_id,
                    state: FlowState::Failed,
                    outputs: BTreeMap::new(),
                    error: Some(FlowError::from(e).context("planificación")),
                    events,
                };
            }
        };
        info!(
            "flow {}: {} stages, salidas {:?}",
            flow_id,
            graph.stages.len(),
            graph.outputs
        );

        let mut run = Run {
            flow_id: flow_id.clone(),
            graph,
            done: HashMap::new(),
            next_attempt: HashMap::new(),
            failures: HashMap::new(),
            avoid: HashMap::new(),
            readers: HashMap::new(),
            acks: HashMap::new(),
            evicted: HashSet::new(),
            agents_used: BTreeSet::new(),
            state: FlowState::Planning,
            events,
        };

        let result = self.collect_outputs(&mut run, &cancel).await;
        self.release(&run).await;

        match result {
            Ok(outputs) => {
                run.advance(FlowState::Succeeded);
                FlowOutcome {
                    flow_id,
                    state: FlowState::Succeeded,
                    outputs,
                    error: None,
                    events: run.events,
                }
            }
            Err(e) => {
                warn!("flow {} falló: {}", flow_id, e);
                run.advance(FlowState::Failed);
                FlowOutcome {
                    flow_id,
                    state: FlowState::Failed,
                    outputs: BTreeMap::new(),
                    error: Some(e),
                    events: run.events,
                }
            }
        }
    }

    async fn alive_agents(&self) -> Result<HashSet<AgentId>> {
        Ok(self
            .coordinator
            .agents()
            .await?
            .into_iter()
            .map(|a| a.agent)
            .collect())
    }

    async fn release_grant(&self, grant: &str) {
        if let Err(e) = self.coordinator.release_grant(grant).await {
            warn!("no se pudo liberar el grant {}: {}", grant, e);
        }
    }

    /// Encola las particiones cuyas entradas están disponibles y olvida las
    /// salidas que ya no se pueden leer, para que se vuelvan a producir.
    async fn refresh(&self, run: &mut Run, pending: &mut VecDeque<PartKey>, inflight: &[InFlight]) -> Result<()> {
        let alive = self.alive_agents().await?;
        pending.retain(|(stage, p)| {
            run.graph
                .stage(*stage)
                .is_some_and(|s| run.inputs_ready(s, *p, &alive))
        });

        let busy: HashSet<PartKey> = pending
            .iter()
            .copied()
            .chain(inflight.iter().map(|f| (f.stage, f.partition)))
            .collect();
        let mut ready: BTreeMap<StageId, Vec<u32>> = BTreeMap::new();
        let mut lost: BTreeMap<StageId, BTreeSet<u32>> = BTreeMap::new();
        for stage in &run.graph.stages {
            for p in 0..stage.partitions {
                if run.is_done(stage.id, p) || busy.contains(&(stage.id, p)) {
                    continue;
                }
                let missing: Vec<Need> = needs_of(&run.graph, stage, p)
                    .into_iter()
                    .flatten()
                    .filter(|need| !run.available(need, &alive))
                    .collect();
                if missing.is_empty() {
                    ready.entry(stage.id).or_default().push(p);
                }
                for need in missing {
                    if run.is_done(need.stage, need.partition) {
                        lost.entry(need.stage).or_default().insert(need.partition);
                    }
                }
            }
        }
        run.forget(lost);

        for (stage, parts) in ready {
            debug!("flow {}: stage {} particiones {:?}", run.flow_id, stage, parts);
            run.event(FlowEvent::StageScheduled {
                stage,
                partitions: parts.clone(),
            });
            pending.extend(parts.into_iter().map(|p| (stage, p)));
        }
        Ok(())
    }

    /// Cuenta un rechazo por falta de recursos y espera; pasado
    /// `resource_retries` devuelve el error.
    async fn back_off(
        &self,
        run: &mut Run,
        stage: StageId,
        exhausted: &mut u32,
        cause: FlowError,
        cancel: &CancellationToken,
    ) -> Result<()> {
        *exhausted += 1;
        if *exhausted > self.config.resource_retries {
            return Err(cause.context(format!(
                "sin recursos para el stage {} después de {} reintentos",
                stage, self.config.resource_retries
            )));
        }
        let delay = self.config.backoff_for(*exhausted);
        info!(
            "flow {}: sin slots ({}), reintento {} en {:?}",
            run.flow_id, cause, exhausted, delay
        );
        run.event(FlowEvent::ResourceBackoff {
            stage,
            retry: *exhausted,
            delay_ms: delay.as_millis() as u64,
        });
        sleep_or_cancel(delay, cancel).await;
        Ok(())
    }

    /// Un solo lazo para todo el DAG: cualquier partición con sus entradas
    /// listas compite por slots, sea del stage que sea.
    async fn execute(&self, run: &mut Run, cancel: &CancellationToken) -> Result<()> {
        let mut pending: VecDeque<PartKey> = VecDeque::new();
        let mut inflight: Vec<InFlight> = Vec::new();
        let result = self.schedule(run, &mut pending, &mut inflight, cancel).await;
        if result.is_err() {
            self.abort(&mut inflight).await;
        }
        result
    }

    async fn schedule(
        &self,
        run: &mut Run,
        pending: &mut VecDeque<PartKey>,
        inflight: &mut Vec<InFlight>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let mut exhausted = 0u32;

        loop {
            if cancel.is_cancelled() {
                return Err(FlowError::Cancelled);
            }
            self.refresh(run, pending, inflight).await?;
            if pending.is_empty() && inflight.is_empty() {
                if run.all_done() {
                    return Ok(());
                }
                // se olvidaron salidas perdidas: el próximo refresh encola a sus productores
                sleep_or_cancel(self.config.poll_interval, cancel).await;
                continue;
            }

            if let Some(&(first_stage, _)) = pending.front() {
                run.advance(FlowState::ResourceRequesting);
                let avoid: BTreeSet<AgentId> = pending
                    .iter()
                    .filter_map(|key| run.avoid.get(key))
                    .flatten()
                    .cloned()
                    .collect();
                let slots = pending.len() as u32;
                let req = SlotRequest {
                    flow_id: run.flow_id.clone(),
                    slots,
                    min_slots: if self.config.gang && inflight.is_empty() { slots } else { 1 },
                    avoid: avoid.into_iter().collect(),
                };

                match self.coordinator.request_slots(req).await {
                    Ok(grants) => {
                        let mut busy_agent = None;
                        for grant in grants {
                            let Some(key) = pick_partition(pending, run, &grant.agent) else {
                                self.release_grant(&grant.grant_id).await;
                                continue;
                            };
                            match self.launch(run, key, grant).await {
                                Launch::Started(f) => {
                                    exhausted = 0;
                                    inflight.push(f);
                                }
                                Launch::GrantLost => pending.push_front(key),
                                Launch::Refused { agent, error } if matches!(error.root(), FlowError::NoFreeSlots) => {
                                    debug!("{} no tiene slots todavía, stage {} partición {} vuelve a la cola", agent, key.0, key.1);
                                    pending.push_back(key);
                                    busy_agent = Some((key.0, error));
                                }
                                Launch::Refused { agent, error } => {
                                    self.on_failure(run, key, None, &agent, error)?;
                                    pending.push_back(key);
                                }
                            }
                        }
                        if let Some((stage, error)) = busy_agent {
                            self.back_off(run, stage, &mut exhausted, error, cancel).await?;
                        }
                    }
                    Err(e) if inflight.is_empty() => {
                        self.back_off(run, first_stage, &mut exhausted, e, cancel).await?;
                        continue;
                    }
                    Err(e) => debug!("sin slots extra ({}), esperando a las particiones en curso", e),
                }
            }

            if inflight.is_empty() {
                continue;
            }
            if !sleep_or_cancel(self.config.poll_interval, cancel).await {
                continue;
            }

            let mut i = 0;
            while i < inflight.len() {
                match self.poll(&mut inflight[i]).await {
                    Poll::Running => i += 1,
                    Poll::Done(outputs) => {
                        let f = inflight.swap_remove(i);
                        self.complete(run, f, outputs).await;
                    }
                    Poll::Failed { error, input_lost } => {
                        let f = inflight.swap_remove(i);
                        self.release_grant(&f.grant).await;
                        self.on_failure(run, (f.stage, f.partition), Some(f.attempt), &f.agent, error)?;
                        if input_lost {
                            // la partición vuelve sola cuando sus entradas estén otra vez
                            self.invalidate_inputs(run, &f).await;
                        } else {
                            pending.push_back((f.stage, f.partition));
                        }
                    }
                }
            }
        }
    }

    async fn launch(&self, run: &mut Run, (stage_id, partition): PartKey, grant: SlotGrant) -> Launch {
        match self.coordinator.confirm_grant(&grant.grant_id).await {
            Ok(GrantStatus::Confirmed) => {}
            Ok(status) => {
                debug!("grant {} no confirmado: {:?}", grant.grant_id, status);
                return Launch::GrantLost;
            }
            Err(e) => {
                warn!("no se pudo confirmar el grant {}: {}", grant.grant_id, e);
                self.release_grant(&grant.grant_id).await;
                return Launch::GrantLost;
            }
        }
        let stage = match run.stage(stage_id) {
            Ok(stage) => stage,
            Err(e) => {
                self.release_grant(&grant.grant_id).await;
                return Launch::Refused {
                    agent: grant.agent,
                    error: e,
                };
            }
        };

        let refuse = |error: FlowError| Launch::Refused {
            agent: grant.agent.clone(),
            error,
        };
        let api = match self.agents.connect(&grant.agent) {
            Ok(api) => api,
            Err(e) => {
                self.release_grant(&grant.grant_id).await;
                return refuse(e);
            }
        };
        let inputs = match run.task_inputs(&stage, partition) {
            Ok(inputs) => inputs,
            Err(e) => {
                self.release_grant(&grant.grant_id).await;
                return refuse(e);
            }
        };

        let attempt = run.take_attempt(stage.id, partition);
        let assignment = format!("{}-s{}-p{}-a{}", run.flow_id, stage.id, partition, attempt);
        let input_bytes: u64 = inputs.iter().flatten().map(|i| i.meta.bytes).sum();
        let task = ExecutorTask {
            assignment_id: assignment.clone(),
            flow_id: run.flow_id.clone(),
            stage: stage.clone(),
            partition,
            attempt,
            inputs: inputs.clone(),
            mode: self.config.mode.pick(input_bytes),
            memory_budget: self.config.memory_budget,
            store_root: Default::default(),
        };

        run.advance(FlowState::Scheduling);
        let req = StartExecutorRequest {
            grant_id: grant.grant_id.clone(),
            task,
        };
        // aunque el arranque falle, el agente puede haber registrado algo del flow
        run.agents_used.insert(grant.agent.clone());
        if let Err(e) = api.start_executor(req).await {
            self.release_grant(&grant.grant_id).await;
            return refuse(e);
        }

        run.advance(FlowState::Running);
        debug!("{} en {} ({:?})", assignment, grant.agent, self.config.mode.pick(input_bytes));
        run.event(FlowEvent::PartitionStarted {
            stage: stage.id,
            partition,
            attempt,
            agent: grant.agent.clone(),
        });
        Launch::Started(InFlight {
            stage: stage.id,
            partition,
            attempt,
            agent: grant.agent,
            api,
            grant: grant.grant_id,
            assignment,
            inputs: inputs.into_iter().flatten().collect(),
            poll_errors: 0,
        })
    }

    async fn poll(&self, f: &mut InFlight) -> Poll {
        if let Ok(GrantStatus::AgentLost) = self.coordinator.grant_status(&f.grant).await {
            return Poll::Failed {
                error: FlowError::AgentUnavailable(f.agent.clone()),
                input_lost: false,
            };
        }

        match f.api.executor_status(&f.assignment).await {
            Ok(status) => {
                f.poll_errors = 0;
                match status.state {
                    ExecutorState::Complete => Poll::Done(status.outputs),
                    ExecutorState::Failed => Poll::Failed {
                        error: FlowError::ExecutorFailure(
                            status.error.unwrap_or_else(|| "sin detalle".into()),
                        ),
                        input_lost: status.input_corrupted,
                    },
                    ExecutorState::Pending | ExecutorState::Running => Poll::Running,
                }
            }
            Err(e) => {
                f.poll_errors += 1;
                if f.poll_errors >= self.config.max_poll_errors {
                    Poll::Failed {
                        error: e,
                        input_lost: false,
                    }
                } else {
                    debug!("estado de {} no disponible: {}", f.assignment, e);
                    Poll::Running
                }
            }
        }
    }

    /// Cuenta el intento fallido; si se agotaron, devuelve el error final.
    fn on_failure(
        &self,
        run: &mut Run,
        (stage, partition): PartKey,
        attempt: Option<u32>,
        agent: &str,
        error: FlowError,
    ) -> Result<()> {
        let failures = run.record_failure(stage, partition, agent);
        warn!(
            "flow {}: stage {} partición {} falló en {} (fallo {}/{}): {}",
            run.flow_id, stage, partition, agent, failures, self.config.max_attempts, error
        );
        run.event(FlowEvent::PartitionFailed {
            stage,
            partition,
            attempt: attempt.unwrap_or(0),
            agent: agent.to_string(),
            error: error.to_string(),
        });
        if failures >= self.config.max_attempts {
            return Err(error
                .context(format!("partición {partition} agotó {failures} intentos"))
                .context(format!("stage {stage} falló")));
        }
        Ok(())
    }

    async fn complete(&self, run: &mut Run, f: InFlight, outputs: Vec<ShardMeta>) {
        self.release_grant(&f.grant).await;
        let stage = f.stage;
        info!(
            "flow {}: stage {} partición {} completa en {} ({} shards)",
            run.flow_id,
            stage,
            f.partition,
            f.agent,
            outputs.len()
        );

        for meta in &outputs {
            let readers = run.readers_of(stage, meta);
            if readers == 0 {
                continue;
            }
            run.readers.insert(meta.key.clone(), readers);
            let req = common::RegisterReadersRequest {
                key: meta.key.clone(),
                readers,
            };
            if let Err(e) = f.api.register_readers(req).await {
                warn!("no se pudieron registrar lectores de {}: {}", meta.key, e);
            }
        }

        let mut by_agent: BTreeMap<AgentId, Vec<ShardKey>> = BTreeMap::new();
        for input in &f.inputs {
            by_agent
                .entry(input.agent.clone())
                .or_default()
                .push(input.meta.key.clone());
        }
        for (agent, keys) in by_agent {
            for key in &keys {
                let acks = run.acks.entry(key.clone()).or_insert(0);
                *acks += 1;
                if run.readers.get(key).is_some_and(|r| *acks >= *r) {
                    run.evicted.insert(key.clone());
                }
            }
            let acked = match self.agents.connect(&agent) {
                Ok(api) => api.ack_reads(common::AckReadRequest { keys }).await,
                Err(e) => Err(e),
            };
            if let Err(e) = acked {
                debug!("ack de lecturas a {} falló: {}", agent, e);
            }
        }

        run.event(FlowEvent::PartitionCompleted {
            stage,
            partition: f.partition,
            attempt: f.attempt,
            agent: f.agent.clone(),
        });
        run.done.entry(stage).or_default().insert(
            f.partition,
            PartitionOutput {
                agent: f.agent,
                outputs,
            },
        );
    }

    /// Olvida las salidas de las que leyó un intento con entrada perdida o
    /// corrupta: las de agentes caídos, o todas si ninguno cayó.
    async fn invalidate_inputs(&self, run: &mut Run, f: &InFlight) {
        let alive = self.alive_agents().await.unwrap_or_default();
        let lost: Vec<&InputShard> = f.inputs.iter().filter(|i| !alive.contains(&i.agent)).collect();
        let suspects = if lost.is_empty() {
            f.inputs.iter().collect()
        } else {
            lost
        };
        let mut parts: BTreeMap<StageId, BTreeSet<u32>> = BTreeMap::new();
        for input in suspects {
            let key = &input.meta.key;
            if let Some(producer) = run.graph.producer_stage(key.dataset) {
                parts.entry(producer.id).or_default().insert(key.partition);
            }
        }
        run.forget(parts);
    }

    async fn abort(&self, inflight: &mut Vec<InFlight>) {
        for f in inflight.drain(..) {
            info!("cancelando {} en {}", f.assignment, f.agent);
            if let Err(e) = f.api.cancel_executor(&f.assignment).await {
                debug!("no se pudo cancelar {}: {}", f.assignment, e);
            }
            self.release_grant(&f.grant).await;
        }
    }

    /// Corre el DAG hasta que las salidas finales se puedan leer y trae sus
    /// registros. Si alguna se perdió al terminar, vuelve a correr lo que
    /// falte.
    async fn collect_outputs(
        &self,
        run: &mut Run,
        cancel: &CancellationToken,
    ) -> Result<BTreeMap<common::DatasetId, Vec<Record>>> {
        let finals: Vec<(common::DatasetId, StageId, u32)> = run
            .graph
            .outputs
            .iter()
            .filter_map(|ds| run.graph.producer_stage(*ds).map(|s| (*ds, s.id, s.partitions)))
            .collect();
        let needs: Vec<Need> = finals
            .iter()
            .flat_map(|(_, stage, parts)| {
                (0..*parts).map(|partition| Need {
                    stage: *stage,
                    partition,
                    bucket: None,
                })
            })
            .collect();

        let mut rounds = 0;
        loop {
            self.execute(run, cancel).await?;
            let alive = self.alive_agents().await?;
            let mut lost: BTreeMap<StageId, BTreeSet<u32>> = BTreeMap::new();
            for need in needs.iter().filter(|n| !run.available(n, &alive)) {
                lost.entry(need.stage).or_default().insert(need.partition);
            }
            if lost.is_empty() {
                break;
            }
            rounds += 1;
            if rounds >= self.config.max_attempts {
                return Err(FlowError::ShardNotFound("salidas finales".into()));
            }
            run.forget(lost);
        }

        let mut outputs = BTreeMap::new();
        for (dataset, stage, parts) in finals {
            let mut records = Vec::new();
            for partition in 0..parts {
                let need = Need {
                    stage,
                    partition,
                    bucket: None,
                };
                let (agent, meta) = run
                    .find(&need)
                    .map(|(out, meta)| (out.agent.clone(), meta.clone()))
                    .ok_or_else(|| FlowError::ShardNotFound(format!("dataset {dataset} partición {partition}")))?;
                let body = self.agents.connect(&agent)?.fetch_shard(&meta.key).await?;
                read_verified(body, &meta, |rec| records.push(rec)).await?;
            }
            outputs.insert(dataset, records);
        }
        Ok(outputs)
    }

    /// Libera los shards y executors del flow en cada agente al que se le
    /// pidió arrancar algo, aunque haya fallado. Los persistentes quedan
    /// hasta su TTL.
    async fn release(&self, run: &Run) {
        for agent in &run.agents_used {
            let released = match self.agents.connect(agent) {
                Ok(api) => api.release_flow(&run.flow_id, false).await,
                Err(e) => Err(e),
            };
            match released {
                Ok(n) => debug!("{}: {} shards liberados", agent, n),
                Err(e) => warn!("no se pudo liberar el flow en {}: {}", agent, e),
            }
        }
    }
}

/// Elige la partición pendiente para un grant, prefiriendo una que no haya
/// fallado ya en ese agente.
fn pick_partition(pending: &mut VecDeque<PartKey>, run: &Run, agent: &str) -> Option<PartKey> {
    let idx = pending
        .iter()
        .position(|key| {
            !run.avoid
                .get(key)
                .is_some_and(|avoid| avoid.iter().any(|a| a == agent))
        })
        .unwrap_or(0);
    pending.remove(idx)
}
