use anyhow::Context;
use master::{handlers, monitor, Coordinator, CoordinatorConfig};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("master=debug,tower_http=info,axum=info")),
        )
        .init();

    let config = CoordinatorConfig::from_env();
    let coordinator = Coordinator::new(config.clone());

    // router HTTP
    let app = handlers::build_router(coordinator.clone());

    // reaper de agentes y leases en segundo plano
    let shutdown = CancellationToken::new();
    tokio::spawn(monitor::run_reaper(
        coordinator.clone(),
        config.reaper_interval,
        shutdown.clone(),
    ));

    let listener = TcpListener::bind(&config.bind)
        .await
        .with_context(|| format!("no se pudo abrir {}", config.bind))?;
    info!(
        "master escuchando en {} (timeout heartbeat {:?}, lease {:?})",
        listener.local_addr()?,
        config.heartbeat_timeout,
        config.grant_lease
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            shutdown.cancel();
        })
        .await?;
    Ok(())
}
