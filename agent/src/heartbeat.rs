use std::{sync::Arc, time::Duration};

use chrono::Utc;
use common::CoordinatorApi;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::Agent;

/// Reporta capacidad al coordinador. El coordinador puede ajustar el
/// intervalo en su respuesta.
pub async fn run_heartbeats(
    agent: Agent,
    coordinator: Arc<dyn CoordinatorApi>,
    shutdown: CancellationToken,
) {
    let mut interval = agent.config().heartbeat_interval;
    let mut connected = false;
    loop {
        let req = agent.heartbeat_request();
        match coordinator.heartbeat(req).await {
            Ok(ack) => {
                if !connected {
                    info!("agente {} conectado al coordinador", agent.id());
                    connected = true;
                }
                if ack.interval_ms > 0 {
                    interval = Duration::from_millis(ack.interval_ms);
                }
            }
            Err(e) => {
                if connected {
                    warn!("heartbeat falló: {}", e);
                }
                connected = false;
            }
        }

        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }
    }
}

/// Vence shards persistentes con TTL cumplido.
pub async fn run_gc(agent: Agent, interval: Duration, shutdown: CancellationToken) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }
        let expired = agent.store().sweep_expired(Utc::now());
        if expired > 0 {
            info!("gc: {} shards persistentes vencidos", expired);
        } else {
            debug!("gc: nada para vencer");
        }
    }
}
