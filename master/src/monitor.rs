use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::Coordinator;

/// Reaper: cada `interval` expulsa agentes sin heartbeat y vence leases.
pub async fn run_reaper(coordinator: Coordinator, interval: Duration, shutdown: CancellationToken) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }

        let dead = coordinator.reap();
        if !dead.is_empty() {
            info!("reaper: {} agente(s) fuera del pool: {:?}", dead.len(), dead);
        }
    }
}
