//! Proceso executor: corre una tarea y termina.
//!
//! Lee la tarea (JSON) de la ruta recibida, escribe sus shards bajo la raíz
//! del store del agente e imprime por stdout una línea JSON con el reporte
//! o con el error. Los logs van a stderr.

use std::{path::PathBuf, process::ExitCode, sync::atomic::AtomicBool};

use clap::Parser;
use common::{client::ErrorBody, engine, fetch::HttpFetcher, ExecutorReport, LogicRegistry, Result};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "executor", about = "Corre una partición de un stage")]
struct Args {
    /// Ruta al JSON de la tarea.
    task: PathBuf,
}

fn run(args: &Args) -> Result<ExecutorReport> {
    let task = engine::read_task(&args.task)?;
    info!(
        "tarea {}: stage {} partición {} intento {} ({:?})",
        task.assignment_id, task.stage.id, task.partition, task.attempt, task.mode
    );
    let fetcher = HttpFetcher::new()?;
    let registry = LogicRegistry::with_builtins();
    // la cancelación llega como SIGKILL del agente
    let cancel = AtomicBool::new(false);
    engine::run_task(&task, &registry, &fetcher, &cancel)
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("executor=info,common=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let (line, code) = match run(&args) {
        Ok(report) => (serde_json::to_string(&report), ExitCode::SUCCESS),
        Err(e) => {
            error!("tarea fallida: {}", e);
            (serde_json::to_string(&ErrorBody::from_error(&e)), ExitCode::FAILURE)
        }
    };
    match line {
        Ok(line) => {
            println!("{line}");
            code
        }
        Err(e) => {
            error!("no se pudo serializar la salida: {}", e);
            ExitCode::FAILURE
        }
    }
}
