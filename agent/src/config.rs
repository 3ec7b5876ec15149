use std::{path::PathBuf, time::Duration};

use common::{
    config::{env_flag, env_millis, env_or, env_string},
    AgentId, StoreConfig,
};
use sysinfo::{System, SystemExt};

/// Cómo corre el agente sus executors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchMode {
    /// Un proceso `executor` por tarea (aislamiento real).
    Process,
    /// Un hilo bloqueante dentro del agente.
    InProcess,
}

#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Dirección con la que el agente se anuncia; es también su id.
    pub id: AgentId,
    pub bind: String,
    pub master_url: String,
    pub total_slots: u32,
    /// Memoria reservada por slot; 0 => sólo cuenta slots.
    pub slot_memory: u64,
    pub heartbeat_interval: Duration,
    pub gc_interval: Duration,
    pub launch_mode: LaunchMode,
    pub executor_bin: PathBuf,
    /// Margen de espacio de direcciones sobre el presupuesto de la tarea.
    pub executor_memory_slack: u64,
    pub store: StoreConfig,
}

impl AgentConfig {
    pub fn from_env() -> Self {
        let mut sys = System::new();
        sys.refresh_memory();
        sys.refresh_cpu();

        let cpus = sys.cpus().len().max(1) as u32;
        let bind = env_string("AGENT_BIND", "0.0.0.0:9090");
        let port = bind.rsplit(':').next().unwrap_or("9090").to_string();
        let host = hostname::get()
            .unwrap_or_default()
            .to_string_lossy()
            .to_string();

        let total_slots = env_or("AGENT_SLOTS", cpus);
        let memory_quota = env_or("AGENT_MEMORY_BYTES", sys.total_memory() / 2);
        let ttl = Duration::from_secs(env_or("PERSISTENT_TTL_SECS", 0u64));

        let executor_bin = std::env::var("EXECUTOR_BIN")
            .map(PathBuf::from)
            .unwrap_or_else(|_| default_executor_bin());

        Self {
            id: env_string("AGENT_ADDR", &format!("http://{host}:{port}")),
            bind,
            master_url: env_string("MASTER_URL", "http://localhost:8080"),
            total_slots,
            slot_memory: env_or("SLOT_MEMORY", memory_quota / total_slots.max(1) as u64),
            heartbeat_interval: env_millis("HEARTBEAT_INTERVAL_MS", 2000),
            gc_interval: env_millis("GC_INTERVAL_MS", 30_000),
            launch_mode: match env_string("AGENT_LAUNCHER", "process").as_str() {
                "local" => LaunchMode::InProcess,
                _ => LaunchMode::Process,
            },
            executor_bin,
            executor_memory_slack: env_or("EXECUTOR_MEMORY_SLACK", 1u64 << 30),
            store: StoreConfig {
                root: PathBuf::from(env_string("AGENT_STORE_DIR", "/data/shards")),
                memory_quota,
                spill_to_disk: env_flag("AGENT_SPILL", true),
                persistent_ttl: (!ttl.is_zero()).then_some(ttl),
            },
        }
    }
}

/// `executor` vive junto al binario del agente.
fn default_executor_bin() -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|p| p.parent().map(|d| d.join("executor")))
        .unwrap_or_else(|| PathBuf::from("executor"))
}
