//! Taxonomía de errores del motor.

use thiserror::Error;

use crate::{AgentId, DatasetId, StepId};

pub type Result<T> = std::result::Result<T, FlowError>;

/// Errores de un DAG mal formado. Son fatales: nunca se reintentan.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlanningError {
    #[error("el flow no tiene pasos")]
    EmptyFlow,

    #[error("el paso {step} lee el dataset {dataset}, que no está declarado o no tiene productor")]
    UnboundInput { step: StepId, dataset: DatasetId },

    #[error("referencia cíclica entre los pasos {steps:?}")]
    Cycle { steps: Vec<StepId> },

    #[error("número de particiones inválido ({count}) en el paso {step}")]
    InvalidPartitionCount { step: StepId, count: u32 },

    #[error("el paso {step} ({kind}) espera {expected} entradas y recibió {got}")]
    Arity {
        step: StepId,
        kind: &'static str,
        expected: usize,
        got: usize,
    },

    #[error("el paso {step} ({kind}) tiene una salida inválida")]
    InvalidOutput { step: StepId, kind: &'static str },

    #[error("identificador duplicado: {0}")]
    DuplicateId(String),
}

#[derive(Debug, Error)]
pub enum FlowError {
    #[error("error de planificación: {0}")]
    Planning(#[from] PlanningError),

    #[error("recursos insuficientes: se pidieron {requested} slots (mínimo {required}), hay {available} disponibles")]
    ResourceExhaustion {
        requested: u32,
        required: u32,
        available: u32,
    },

    #[error("agente {0} no disponible")]
    AgentUnavailable(AgentId),

    #[error("fallo del executor: {0}")]
    ExecutorFailure(String),

    #[error("shard {shard} corrupto o truncado: {reason}")]
    ShardCorruption { shard: String, reason: String },

    #[error("logic id desconocido `{0}`")]
    UnknownLogic(String),

    #[error("shard {0} todavía no está completo")]
    ShardNotReady(String),

    #[error("shard {0} no encontrado")]
    ShardNotFound(String),

    #[error("presupuesto de memoria excedido ({used} > {budget} bytes) en modo en memoria")]
    MemoryBudgetExceeded { used: u64, budget: u64 },

    #[error("el agente no tiene slots libres")]
    NoFreeSlots,

    #[error("ejecución cancelada")]
    Cancelled,

    #[error("error de transporte: {0}")]
    Transport(String),

    #[error("error de E/S: {0}")]
    Io(#[from] std::io::Error),

    #[error("error de serialización: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{context}: {source}")]
    Context {
        context: String,
        #[source]
        source: Box<FlowError>,
    },
}

impl FlowError {
    /// Envuelve el error con un eslabón más de la cadena causal.
    pub fn context(self, context: impl Into<String>) -> Self {
        FlowError::Context {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// Error más interno de la cadena.
    pub fn root(&self) -> &FlowError {
        match self {
            FlowError::Context { source, .. } => source.root(),
            other => other,
        }
    }

    pub fn is_resource_exhaustion(&self) -> bool {
        matches!(self.root(), FlowError::ResourceExhaustion { .. })
    }
}

impl From<reqwest::Error> for FlowError {
    fn from(e: reqwest::Error) -> Self {
        FlowError::Transport(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_arma_la_cadena_causal() {
        let err = FlowError::ExecutorFailure("exit code 1".into())
            .context("partición 1 agotó 3 intentos")
            .context("stage 0 falló");

        assert_eq!(
            err.to_string(),
            "stage 0 falló: partición 1 agotó 3 intentos: fallo del executor: exit code 1"
        );
        assert!(matches!(err.root(), FlowError::ExecutorFailure(_)));
    }

    #[test]
    fn is_resource_exhaustion_mira_la_raiz() {
        let err = FlowError::ResourceExhaustion {
            requested: 3,
            required: 3,
            available: 2,
        }
        .context("stage 0");
        assert!(err.is_resource_exhaustion());
        assert!(!FlowError::Cancelled.is_resource_exhaustion());
    }
}
