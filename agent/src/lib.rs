//! Agente de ejecución: anuncia slots al coordinador, lanza executors y
//! sirve los shards de su Shard Store.

pub mod agent;
pub mod config;
pub mod handlers;
pub mod heartbeat;
pub mod launcher;

pub use agent::Agent;
pub use config::{AgentConfig, LaunchMode};
pub use launcher::{ExecutorLauncher, InProcessLauncher, ProcessLauncher};
