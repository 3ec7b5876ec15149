use serde::{Deserialize, Serialize};

use crate::error::PlanningError;
use crate::source::{SinkSpec, Source, SourceSpec};
use crate::{DatasetId, StepId};

/// DAG de datasets (nodos) y pasos (aristas).
///
/// Se construye incrementalmente: cada paso sólo puede leer datasets que ya
/// existen en el flow, así que un flow armado con estos métodos es acíclico
/// por construcción. Un flow deserializado desde JSON no tiene esa garantía;
/// el planner lo vuelve a validar entero.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Flow {
    pub name: String,
    pub datasets: Vec<Dataset>,
    pub steps: Vec<Step>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Dataset {
    pub id: DatasetId,

    /// Fijo para datasets de fuentes; para el resto lo deriva el planner.
    #[serde(default)]
    pub partitions: Option<u32>,

    /// Los shards persistentes sobreviven al final del flow.
    #[serde(default)]
    pub persistent: bool,

    /// Campo por el que está agrupado/ordenado, si se conoce.
    #[serde(default)]
    pub key_hint: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub id: StepId,
    pub kind: StepKind,
    pub inputs: Vec<DatasetId>,
    /// `None` sólo para sinks.
    pub output: Option<DatasetId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum StepKind {
    Source {
        source: SourceSpec,
    },
    Map {
        #[serde(rename = "fn")]
        logic: String,
    },
    FlatMap {
        #[serde(rename = "fn")]
        logic: String,
    },
    Filter {
        #[serde(rename = "fn")]
        logic: String,
    },
    ReduceBy {
        key: String,
        #[serde(rename = "fn")]
        logic: String,
        #[serde(default)]
        partitions: Option<u32>,
    },
    Join {
        key: String,
        #[serde(default)]
        partitions: Option<u32>,
    },
    Sort {
        key: String,
        #[serde(default)]
        descending: bool,
        #[serde(default)]
        partitions: Option<u32>,
    },
    Pipe {
        command: String,
        #[serde(default)]
        args: Vec<String>,
    },
    Sink {
        sink: SinkSpec,
    },
}

impl StepKind {
    pub fn name(&self) -> &'static str {
        match self {
            StepKind::Source { .. } => "source",
            StepKind::Map { .. } => "map",
            StepKind::FlatMap { .. } => "flat_map",
            StepKind::Filter { .. } => "filter",
            StepKind::ReduceBy { .. } => "reduce_by",
            StepKind::Join { .. } => "join",
            StepKind::Sort { .. } => "sort",
            StepKind::Pipe { .. } => "pipe",
            StepKind::Sink { .. } => "sink",
        }
    }

    /// Map/FlatMap/Filter/Sink no reparticionan: se pueden fusionar.
    pub fn is_narrow(&self) -> bool {
        matches!(
            self,
            StepKind::Map { .. }
                | StepKind::FlatMap { .. }
                | StepKind::Filter { .. }
                | StepKind::Sink { .. }
        )
    }

    /// Reduce/Join/Sort introducen un shuffle.
    pub fn is_shuffle(&self) -> bool {
        matches!(
            self,
            StepKind::ReduceBy { .. } | StepKind::Join { .. } | StepKind::Sort { .. }
        )
    }

    pub fn expected_inputs(&self) -> usize {
        match self {
            StepKind::Source { .. } => 0,
            StepKind::Join { .. } => 2,
            _ => 1,
        }
    }

    /// Particiones pedidas explícitamente por el paso, si las hay.
    pub fn requested_partitions(&self) -> Option<u32> {
        match self {
            StepKind::ReduceBy { partitions, .. }
            | StepKind::Join { partitions, .. }
            | StepKind::Sort { partitions, .. } => *partitions,
            _ => None,
        }
    }
}

impl Flow {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            datasets: Vec::new(),
            steps: Vec::new(),
        }
    }

    pub fn dataset(&self, id: DatasetId) -> Option<&Dataset> {
        self.datasets.iter().find(|d| d.id == id)
    }

    pub fn step(&self, id: StepId) -> Option<&Step> {
        self.steps.iter().find(|s| s.id == id)
    }

    /// Paso que produce `dataset`.
    pub fn producer(&self, dataset: DatasetId) -> Option<&Step> {
        self.steps.iter().find(|s| s.output == Some(dataset))
    }

    /// Pasos que leen `dataset`, en orden de declaración.
    pub fn consumers(&self, dataset: DatasetId) -> Vec<&Step> {
        self.steps
            .iter()
            .filter(|s| s.inputs.contains(&dataset))
            .collect()
    }

    pub fn source(&mut self, source: SourceSpec) -> Result<DatasetId, PlanningError> {
        let partitions = source.partitions();
        let step = self.next_step_id();
        if partitions == 0 {
            return Err(PlanningError::InvalidPartitionCount {
                step,
                count: partitions,
            });
        }
        let out = self.new_dataset(Some(partitions), None);
        self.push_step(StepKind::Source { source }, vec![], Some(out));
        Ok(out)
    }

    pub fn map(&mut self, input: DatasetId, logic: &str) -> Result<DatasetId, PlanningError> {
        let logic = logic.to_string();
        self.narrow(input, StepKind::Map { logic })
    }

    pub fn flat_map(&mut self, input: DatasetId, logic: &str) -> Result<DatasetId, PlanningError> {
        let logic = logic.to_string();
        self.narrow(input, StepKind::FlatMap { logic })
    }

    pub fn filter(&mut self, input: DatasetId, logic: &str) -> Result<DatasetId, PlanningError> {
        let logic = logic.to_string();
        self.narrow(input, StepKind::Filter { logic })
    }

    pub fn reduce_by(
        &mut self,
        input: DatasetId,
        key: &str,
        logic: &str,
        partitions: Option<u32>,
    ) -> Result<DatasetId, PlanningError> {
        let kind = StepKind::ReduceBy {
            key: key.to_string(),
            logic: logic.to_string(),
            partitions,
        };
        self.keyed(vec![input], kind, key)
    }

    pub fn join(
        &mut self,
        left: DatasetId,
        right: DatasetId,
        key: &str,
        partitions: Option<u32>,
    ) -> Result<DatasetId, PlanningError> {
        let kind = StepKind::Join {
            key: key.to_string(),
            partitions,
        };
        self.keyed(vec![left, right], kind, key)
    }

    pub fn sort(
        &mut self,
        input: DatasetId,
        key: &str,
        descending: bool,
        partitions: Option<u32>,
    ) -> Result<DatasetId, PlanningError> {
        let kind = StepKind::Sort {
            key: key.to_string(),
            descending,
            partitions,
        };
        self.keyed(vec![input], kind, key)
    }

    pub fn pipe(
        &mut self,
        input: DatasetId,
        command: &str,
        args: &[&str],
    ) -> Result<DatasetId, PlanningError> {
        let kind = StepKind::Pipe {
            command: command.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
        };
        self.narrow(input, kind)
    }

    pub fn sink(&mut self, input: DatasetId, sink: SinkSpec) -> Result<StepId, PlanningError> {
        self.check_bound(input)?;
        Ok(self.push_step(StepKind::Sink { sink }, vec![input], None))
    }

    /// Marca el dataset como persistente (sus shards van a disco y sobreviven al flow).
    pub fn persist(&mut self, dataset: DatasetId) -> Result<(), PlanningError> {
        let step = self.next_step_id();
        let ds = self
            .datasets
            .iter_mut()
            .find(|d| d.id == dataset)
            .ok_or(PlanningError::UnboundInput { step, dataset })?;
        ds.persistent = true;
        Ok(())
    }

    fn narrow(&mut self, input: DatasetId, kind: StepKind) -> Result<DatasetId, PlanningError> {
        self.check_bound(input)?;
        let out = self.new_dataset(None, None);
        self.push_step(kind, vec![input], Some(out));
        Ok(out)
    }

    fn keyed(
        &mut self,
        inputs: Vec<DatasetId>,
        kind: StepKind,
        key: &str,
    ) -> Result<DatasetId, PlanningError> {
        for &input in &inputs {
            self.check_bound(input)?;
        }
        if let Some(0) = kind.requested_partitions() {
            return Err(PlanningError::InvalidPartitionCount {
                step: self.next_step_id(),
                count: 0,
            });
        }
        let out = self.new_dataset(None, Some(key.to_string()));
        self.push_step(kind, inputs, Some(out));
        Ok(out)
    }

    fn check_bound(&self, dataset: DatasetId) -> Result<(), PlanningError> {
        if self.dataset(dataset).is_some() {
            Ok(())
        } else {
            Err(PlanningError::UnboundInput {
                step: self.next_step_id(),
                dataset,
            })
        }
    }

    fn new_dataset(&mut self, partitions: Option<u32>, key_hint: Option<String>) -> DatasetId {
        let id = self.datasets.iter().map(|d| d.id + 1).max().unwrap_or(0);
        self.datasets.push(Dataset {
            id,
            partitions,
            persistent: false,
            key_hint,
        });
        id
    }

    fn next_step_id(&self) -> StepId {
        self.steps.iter().map(|s| s.id + 1).max().unwrap_or(0)
    }

    fn push_step(
        &mut self,
        kind: StepKind,
        inputs: Vec<DatasetId>,
        output: Option<DatasetId>,
    ) -> StepId {
        let id = self.next_step_id();
        self.steps.push(Step {
            id,
            kind,
            inputs,
            output,
        });
        id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn inline(parts: usize) -> SourceSpec {
        SourceSpec::Inline {
            partitions: (0..parts).map(|i| vec![json!({ "i": i })]).collect(),
        }
    }

    #[test]
    fn builder_asigna_ids_y_particiones_de_la_fuente() {
        let mut flow = Flow::new("t");
        let src = flow.source(inline(3)).unwrap();
        let mapped = flow.map(src, "identity").unwrap();

        assert_eq!(src, 0);
        assert_eq!(mapped, 1);
        assert_eq!(flow.dataset(src).unwrap().partitions, Some(3));
        assert_eq!(flow.dataset(mapped).unwrap().partitions, None);
        assert_eq!(flow.producer(mapped).unwrap().kind.name(), "map");
        assert_eq!(flow.consumers(src).len(), 1);
    }

    #[test]
    fn builder_rechaza_referencias_hacia_adelante() {
        let mut flow = Flow::new("t");
        let err = flow.map(7, "identity").unwrap_err();
        assert_eq!(err, PlanningError::UnboundInput { step: 0, dataset: 7 });
    }

    #[test]
    fn builder_rechaza_cero_particiones() {
        let mut flow = Flow::new("t");
        assert!(matches!(
            flow.source(inline(0)),
            Err(PlanningError::InvalidPartitionCount { count: 0, .. })
        ));

        let src = flow.source(inline(1)).unwrap();
        assert!(matches!(
            flow.reduce_by(src, "k", "sum", Some(0)),
            Err(PlanningError::InvalidPartitionCount { count: 0, .. })
        ));
    }

    #[test]
    fn keyed_deja_key_hint_en_la_salida() {
        let mut flow = Flow::new("t");
        let src = flow.source(inline(1)).unwrap();
        let out = flow.reduce_by(src, "token", "sum", None).unwrap();
        assert_eq!(flow.dataset(out).unwrap().key_hint.as_deref(), Some("token"));
    }

    #[test]
    fn flow_se_serializa_con_op_y_fn() {
        let mut flow = Flow::new("t");
        let src = flow.source(inline(1)).unwrap();
        flow.map(src, "to_lower").unwrap();

        let v = serde_json::to_value(&flow).unwrap();
        assert_eq!(v["steps"][1]["kind"]["op"], json!("map"));
        assert_eq!(v["steps"][1]["kind"]["fn"], json!("to_lower"));

        let back: Flow = serde_json::from_value(v).unwrap();
        assert_eq!(back.steps.len(), 2);
    }
}
