use std::time::Duration;

use common::{
    config::{env_flag, env_millis, env_or, env_string},
    ExecutionMode,
};

/// Cómo elige el driver el modo de ejecución de cada partición.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModeSelection {
    InMemory,
    OnDisk,
    /// `OnDisk` cuando los bytes de entrada de la partición superan el umbral.
    Auto { threshold_bytes: u64 },
}

impl ModeSelection {
    pub fn pick(&self, input_bytes: u64) -> ExecutionMode {
        match *self {
            ModeSelection::InMemory => ExecutionMode::InMemory,
            ModeSelection::OnDisk => ExecutionMode::OnDisk,
            ModeSelection::Auto { threshold_bytes } if input_bytes > threshold_bytes => {
                ExecutionMode::OnDisk
            }
            ModeSelection::Auto { .. } => ExecutionMode::InMemory,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DriverConfig {
    /// Intentos por partición antes de dar por fallado el stage.
    pub max_attempts: u32,
    pub poll_interval: Duration,
    /// Reintentos de un pedido de slots rechazado por falta de recursos.
    pub resource_retries: u32,
    pub backoff: Duration,
    pub max_backoff: Duration,
    /// Pedir todos los slots del stage de una vez o ninguno.
    pub gang: bool,
    pub mode: ModeSelection,
    pub memory_budget: u64,
    /// Consultas de estado fallidas seguidas antes de dar al agente por caído.
    pub max_poll_errors: u32,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            poll_interval: Duration::from_millis(200),
            resource_retries: 5,
            backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(10),
            gang: false,
            mode: ModeSelection::Auto {
                threshold_bytes: 64 << 20,
            },
            memory_budget: 256 << 20,
            max_poll_errors: 3,
        }
    }
}

impl DriverConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        let threshold = env_or("DRIVER_AUTO_THRESHOLD", 64u64 << 20);
        Self {
            max_attempts: env_or("DRIVER_MAX_ATTEMPTS", d.max_attempts).max(1),
            poll_interval: env_millis("DRIVER_POLL_MS", d.poll_interval.as_millis() as u64),
            resource_retries: env_or("DRIVER_RESOURCE_RETRIES", d.resource_retries),
            backoff: env_millis("DRIVER_BACKOFF_MS", d.backoff.as_millis() as u64),
            max_backoff: d.max_backoff,
            gang: env_flag("DRIVER_GANG", d.gang),
            mode: match env_string("DRIVER_MODE", "auto").as_str() {
                "memory" => ModeSelection::InMemory,
                "disk" => ModeSelection::OnDisk,
                _ => ModeSelection::Auto {
                    threshold_bytes: threshold,
                },
            },
            memory_budget: env_or("DRIVER_MEMORY_BUDGET", d.memory_budget),
            max_poll_errors: d.max_poll_errors,
        }
    }

    /// Espera antes del reintento `retry` (1, 2, ...): exponencial con tope.
    pub fn backoff_for(&self, retry: u32) -> Duration {
        let factor = 1u32 << retry.saturating_sub(1).min(16);
        self.backoff.saturating_mul(factor).min(self.max_backoff)
    }
}
