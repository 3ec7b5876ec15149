use std::sync::Arc;

use agent::{handlers, heartbeat, Agent, AgentConfig, InProcessLauncher, LaunchMode, ProcessLauncher};
use anyhow::Context;
use common::{client::HttpCoordinator, fetch::HttpFetcher, CoordinatorApi, LogicRegistry, ShardStore};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("agent=debug,common=info,tower_http=info")),
        )
        .init();

    let config = AgentConfig::from_env();

    let store = ShardStore::open(config.store.clone())
        .with_context(|| format!("no se pudo abrir {}", config.store.root.display()))?;
    let recovered = store.recover()?;
    if recovered > 0 {
        info!("recuperados {} shards persistentes", recovered);
    }

    let launcher: Arc<dyn agent::ExecutorLauncher> = match config.launch_mode {
        LaunchMode::Process => Arc::new(ProcessLauncher::new(
            config.executor_bin.clone(),
            config.store.root.join("tasks"),
            config.executor_memory_slack,
        )),
        LaunchMode::InProcess => Arc::new(InProcessLauncher::new(
            LogicRegistry::with_builtins(),
            Arc::new(HttpFetcher::new()?),
        )),
    };

    let agent = Agent::new(config.clone(), store, launcher);
    let coordinator: Arc<dyn CoordinatorApi> = Arc::new(HttpCoordinator::new(&config.master_url)?);

    let shutdown = CancellationToken::new();
    tokio::spawn(heartbeat::run_heartbeats(
        agent.clone(),
        coordinator,
        shutdown.clone(),
    ));
    tokio::spawn(heartbeat::run_gc(
        agent.clone(),
        config.gc_interval,
        shutdown.clone(),
    ));

    let app = handlers::build_router(agent.clone());
    let listener = TcpListener::bind(&config.bind)
        .await
        .with_context(|| format!("no se pudo abrir {}", config.bind))?;
    info!(
        "agente {} escuchando en {} ({} slots, cuota {} bytes, coordinador {})",
        config.id,
        listener.local_addr()?,
        config.total_slots,
        config.store.memory_quota,
        config.master_url
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            shutdown.cancel();
        })
        .await?;
    Ok(())
}
