//! Flow Planner: valida el DAG y lo reescribe en stages físicos.
//!
//! `plan` es una función pura sobre el `Flow`: no lo muta y, dado el mismo
//! flow, produce siempre el mismo `ExecutionGraph`. Los stages salen en orden
//! topológico, así que un stage sólo lee de stages con id menor.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::error::PlanningError;
use crate::flow::{Flow, Step, StepKind};
use crate::shard::ShardKey;
use crate::source::{SinkSpec, Source, SourceSpec};
use crate::{DatasetId, StageId, StepId};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Operator {
    Map { logic: String },
    FlatMap { logic: String },
    Filter { logic: String },
}

/// Dataset que un stage lee de otro stage. Con `shuffle` presente se leen
/// los buckets que el productor escribió para ese paso; si no, el shard entero.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageInput {
    pub dataset: DatasetId,
    pub stage: StageId,
    #[serde(default)]
    pub shuffle: Option<StepId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StageHead {
    Source {
        source: SourceSpec,
    },
    Read {
        input: StageInput,
    },
    Pipe {
        input: StageInput,
        command: String,
        args: Vec<String>,
    },
    ReduceBy {
        input: StageInput,
        key: String,
        logic: String,
    },
    Sort {
        input: StageInput,
        key: String,
        descending: bool,
    },
    Join {
        left: StageInput,
        right: StageInput,
        key: String,
    },
}

impl StageHead {
    pub fn inputs(&self) -> Vec<&StageInput> {
        match self {
            StageHead::Source { .. } => vec![],
            StageHead::Read { input }
            | StageHead::Pipe { input, .. }
            | StageHead::ReduceBy { input, .. }
            | StageHead::Sort { input, .. } => vec![input],
            StageHead::Join { left, right, .. } => vec![left, right],
        }
    }
}

/// Escritura del lado map de un shuffle: la salida se reparte por hash de
/// `key` en `buckets` shards, uno por partición del paso consumidor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShuffleWrite {
    pub shuffle: StepId,
    pub key: String,
    pub buckets: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stage {
    pub id: StageId,
    /// Pasos del flow fusionados en este stage, en orden.
    pub steps: Vec<StepId>,
    pub head: StageHead,
    pub ops: Vec<Operator>,
    pub partitions: u32,
    /// `None` cuando el stage termina en un sink.
    pub output: Option<DatasetId>,
    pub persistent: bool,
    /// Escribe la salida completa (además de los buckets de shuffle).
    pub write_whole: bool,
    pub shuffle_writes: Vec<ShuffleWrite>,
    pub sink: Option<SinkSpec>,
}

impl Stage {
    /// Stages de los que lee, sin repetidos.
    pub fn upstream(&self) -> Vec<StageId> {
        let set: BTreeSet<StageId> = self.head.inputs().iter().map(|i| i.stage).collect();
        set.into_iter().collect()
    }

    /// Shards que produce una partición de este stage en un intento.
    pub fn output_keys(&self, flow_id: &str, partition: u32, attempt: u32) -> Vec<ShardKey> {
        let Some(dataset) = self.output else {
            return vec![];
        };
        let mut keys = Vec::new();
        if self.write_whole {
            keys.push(ShardKey::whole(flow_id, dataset, partition, attempt));
        }
        for sw in &self.shuffle_writes {
            for bucket in 0..sw.buckets {
                keys.push(ShardKey::bucketed(
                    flow_id, dataset, partition, attempt, sw.shuffle, bucket,
                ));
            }
        }
        keys
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionGraph {
    pub flow_name: String,
    pub stages: Vec<Stage>,
    /// Datasets finales (sin consumidores) que el driver devuelve.
    pub outputs: Vec<DatasetId>,
    pub partitions: BTreeMap<DatasetId, u32>,
}

impl ExecutionGraph {
    pub fn stage(&self, id: StageId) -> Option<&Stage> {
        self.stages.get(id as usize)
    }

    /// Stage cuya salida materializada es `dataset`.
    pub fn producer_stage(&self, dataset: DatasetId) -> Option<&Stage> {
        self.stages.iter().find(|s| s.output == Some(dataset))
    }

    /// Stages que leen la salida de `stage`.
    pub fn downstream(&self, stage: StageId) -> Vec<&Stage> {
        self.stages
            .iter()
            .filter(|s| s.upstream().contains(&stage))
            .collect()
    }
}

pub fn plan(flow: &Flow) -> Result<ExecutionGraph, PlanningError> {
    if flow.steps.is_empty() {
        return Err(PlanningError::EmptyFlow);
    }
    validate(flow)?;
    let order = topological_order(flow)?;
    let partitions = assign_partitions(flow, &order)?;
    let stages = fuse(flow, &order, &partitions);

    let outputs = stages
        .iter()
        .filter_map(|s| s.output)
        .filter(|d| flow.consumers(*d).is_empty())
        .collect();

    Ok(ExecutionGraph {
        flow_name: flow.name.clone(),
        stages,
        outputs,
        partitions,
    })
}

fn validate(flow: &Flow) -> Result<(), PlanningError> {
    let mut dataset_ids = HashSet::new();
    for ds in &flow.datasets {
        if !dataset_ids.insert(ds.id) {
            return Err(PlanningError::DuplicateId(format!("dataset {}", ds.id)));
        }
    }

    let mut step_ids = HashSet::new();
    let mut produced: HashMap<DatasetId, StepId> = HashMap::new();
    for step in &flow.steps {
        if !step_ids.insert(step.id) {
            return Err(PlanningError::DuplicateId(format!("paso {}", step.id)));
        }

        let is_sink = matches!(step.kind, StepKind::Sink { .. });
        match step.output {
            // un sink no produce dataset; cualquier otro paso sí
            Some(_) if is_sink => {
                return Err(PlanningError::InvalidOutput {
                    step: step.id,
                    kind: step.kind.name(),
                });
            }
            None if !is_sink => {
                return Err(PlanningError::InvalidOutput {
                    step: step.id,
                    kind: step.kind.name(),
                });
            }
            Some(out) => {
                if !dataset_ids.contains(&out) {
                    return Err(PlanningError::UnboundInput {
                        step: step.id,
                        dataset: out,
                    });
                }
                if produced.insert(out, step.id).is_some() {
                    return Err(PlanningError::DuplicateId(format!(
                        "dataset {out} tiene más de un productor"
                    )));
                }
            }
            None => {}
        }

        let expected = step.kind.expected_inputs();
        if step.inputs.len() != expected {
            return Err(PlanningError::Arity {
                step: step.id,
                kind: step.kind.name(),
                expected,
                got: step.inputs.len(),
            });
        }

        if let Some(0) = step.kind.requested_partitions() {
            return Err(PlanningError::InvalidPartitionCount {
                step: step.id,
                count: 0,
            });
        }
        if let StepKind::Source { source } = &step.kind {
            if source.partitions() == 0 {
                return Err(PlanningError::InvalidPartitionCount {
                    step: step.id,
                    count: 0,
                });
            }
        }
    }

    for step in &flow.steps {
        for &input in &step.inputs {
            if !produced.contains_key(&input) {
                return Err(PlanningError::UnboundInput {
                    step: step.id,
                    dataset: input,
                });
            }
        }
    }
    Ok(())
}

/// Kahn con desempate por id de paso: el orden es determinista.
fn topological_order<'a>(flow: &'a Flow) -> Result<Vec<&'a Step>, PlanningError> {
    let mut indegree: BTreeMap<StepId, usize> = BTreeMap::new();
    let mut dependents: HashMap<StepId, Vec<StepId>> = HashMap::new();

    for step in &flow.steps {
        indegree.entry(step.id).or_insert(0);
        for &input in &step.inputs {
            if let Some(producer) = flow.producer(input) {
                *indegree.entry(step.id).or_insert(0) += 1;
                dependents.entry(producer.id).or_default().push(step.id);
            }
        }
    }

    let mut ready: BTreeSet<StepId> = indegree
        .iter()
        .filter(|(_, d)| **d == 0)
        .map(|(id, _)| *id)
        .collect();
    let mut order = Vec::with_capacity(flow.steps.len());

    while let Some(id) = ready.pop_first() {
        if let Some(step) = flow.step(id) {
            order.push(step);
        }
        for dep in dependents.get(&id).into_iter().flatten() {
            if let Some(d) = indegree.get_mut(dep) {
                *d -= 1;
                if *d == 0 {
                    ready.insert(*dep);
                }
            }
        }
    }

    if order.len() < flow.steps.len() {
        let done: HashSet<StepId> = order.iter().map(|s| s.id).collect();
        let mut steps: Vec<StepId> = flow
            .steps
            .iter()
            .map(|s| s.id)
            .filter(|id| !done.contains(id))
            .collect();
        steps.sort_unstable();
        return Err(PlanningError::Cycle { steps });
    }
    Ok(order)
}

fn assign_partitions(
    flow: &Flow,
    order: &[&Step],
) -> Result<BTreeMap<DatasetId, u32>, PlanningError> {
    let mut parts: BTreeMap<DatasetId, u32> = BTreeMap::new();

    for step in order {
        let Some(out) = step.output else { continue };
        let input_parts = |i: usize| -> u32 {
            step.inputs
                .get(i)
                .and_then(|d| parts.get(d))
                .copied()
                .unwrap_or(0)
        };
        let n = match &step.kind {
            StepKind::Source { source } => source.partitions(),
            StepKind::Join { partitions, .. } => {
                partitions.unwrap_or_else(|| input_parts(0).max(input_parts(1)))
            }
            kind => kind.requested_partitions().unwrap_or_else(|| input_parts(0)),
        };
        if n == 0 {
            return Err(PlanningError::InvalidPartitionCount {
                step: step.id,
                count: n,
            });
        }
        parts.insert(out, n);
    }
    Ok(parts)
}

fn fuse(flow: &Flow, order: &[&Step], parts: &BTreeMap<DatasetId, u32>) -> Vec<Stage> {
    let mut stages: Vec<Stage> = Vec::new();
    // dataset -> stage que lo produce (materializado o fusionado)
    let mut stage_of: HashMap<DatasetId, usize> = HashMap::new();

    let persistent = |d: DatasetId| flow.dataset(d).map(|ds| ds.persistent).unwrap_or(false);
    let partitions_of = |d: DatasetId| parts.get(&d).copied().unwrap_or(1);

    for step in order {
        let input_of = |i: usize, shuffle: Option<StepId>| -> StageInput {
            let dataset = step.inputs[i];
            StageInput {
                dataset,
                stage: stage_of.get(&dataset).copied().unwrap_or_default() as StageId,
                shuffle,
            }
        };

        let fused_into = if step.kind.is_narrow() {
            let input = step.inputs[0];
            stage_of.get(&input).copied().filter(|&idx| {
                let stage = &stages[idx];
                flow.consumers(input).len() == 1
                    && !persistent(input)
                    && stage.output == Some(input)
                    && !matches!(stage.head, StageHead::Pipe { .. })
            })
        } else {
            None
        };

        let idx = match fused_into {
            Some(idx) => idx,
            None => {
                let head = match &step.kind {
                    StepKind::Source { source } => StageHead::Source {
                        source: source.clone(),
                    },
                    StepKind::Pipe { command, args } => StageHead::Pipe {
                        input: input_of(0, None),
                        command: command.clone(),
                        args: args.clone(),
                    },
                    StepKind::ReduceBy { key, logic, .. } => StageHead::ReduceBy {
                        input: input_of(0, Some(step.id)),
                        key: key.clone(),
                        logic: logic.clone(),
                    },
                    StepKind::Sort {
                        key, descending, ..
                    } => StageHead::Sort {
                        input: input_of(0, Some(step.id)),
                        key: key.clone(),
                        descending: *descending,
                    },
                    StepKind::Join { key, .. } => StageHead::Join {
                        left: input_of(0, Some(step.id)),
                        right: input_of(1, Some(step.id)),
                        key: key.clone(),
                    },
                    // narrow sin fusionar: lee el shard entero de su entrada
                    _ => StageHead::Read {
                        input: input_of(0, None),
                    },
                };
                let partitions = match step.output {
                    Some(out) => partitions_of(out),
                    None => partitions_of(step.inputs[0]),
                };
                stages.push(Stage {
                    id: stages.len() as StageId,
                    steps: vec![],
                    head,
                    ops: vec![],
                    partitions,
                    output: None,
                    persistent: false,
                    write_whole: false,
                    shuffle_writes: vec![],
                    sink: None,
                });
                stages.len() - 1
            }
        };

        let stage = &mut stages[idx];
        stage.steps.push(step.id);
        match &step.kind {
            StepKind::Map { logic } => stage.ops.push(Operator::Map {
                logic: logic.clone(),
            }),
            StepKind::FlatMap { logic } => stage.ops.push(Operator::FlatMap {
                logic: logic.clone(),
            }),
            StepKind::Filter { logic } => stage.ops.push(Operator::Filter {
                logic: logic.clone(),
            }),
            StepKind::Sink { sink } => stage.sink = Some(sink.clone()),
            _ => {}
        }
        stage.output = step.output;
        if let Some(out) = step.output {
            stage_of.insert(out, idx);
        }
    }

    // qué escribe cada stage depende de quién consume su salida
    for stage in &mut stages {
        let Some(out) = stage.output else { continue };
        let consumers = flow.consumers(out);
        stage.persistent = persistent(out);
        stage.write_whole = stage.persistent
            || consumers.is_empty()
            || consumers.iter().any(|c| !c.kind.is_shuffle());
        stage.shuffle_writes = consumers
            .iter()
            .filter_map(|c| {
                let key = match &c.kind {
                    StepKind::ReduceBy { key, .. }
                    | StepKind::Sort { key, .. }
                    | StepKind::Join { key, .. } => key.clone(),
                    _ => return None,
                };
                let buckets = c.output.map(partitions_of).unwrap_or(1);
                Some(ShuffleWrite {
                    shuffle: c.id,
                    key,
                    buckets,
                })
            })
            .collect();
    }

    stages
}
