use std::{collections::BTreeMap, env, path::PathBuf, sync::Arc};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use common::{
    client::{HttpAgentConnector, HttpCoordinator},
    CoordinatorApi, DatasetId, Flow, Record, SinkSpec, SourceSpec,
};
use driver::{Driver, DriverConfig, FlowOutcome};
use tokio_util::sync::CancellationToken;
use tracing::info;

/// - En Docker: MASTER_URL=http://master:8080
/// - Local: default http://localhost:8080
fn master_base_url() -> String {
    env::var("MASTER_URL").unwrap_or_else(|_| "http://localhost:8080".to_string())
}

#[derive(Parser)]
#[command(name = "driver")]
#[command(about = "Corre flows de datos sobre el cluster")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Corre un flow descrito en JSON
    Run {
        #[arg(value_name = "FLOW_JSON")]
        flow: PathBuf,

        /// Imprime también los eventos de la ejecución
        #[arg(long)]
        events: bool,
    },

    /// WordCount: tokenize -> to_lower -> non_empty_token -> reduce(sum)
    Wordcount {
        /// Patrón de archivos de texto (una partición por archivo)
        #[arg(value_name = "GLOB")]
        input: String,

        /// Particiones del reduce
        #[arg(long, default_value_t = 4)]
        partitions: u32,

        /// Directorio de salida CSV (token,count); sin él se imprime el resultado
        #[arg(long)]
        output: Option<String>,
    },

    /// Lista los agentes vivos y sus slots
    Agents,
}

fn wordcount_flow(input: &str, partitions: u32, output: Option<String>) -> Result<Flow> {
    let mut flow = Flow::new("wordcount");
    let lines = flow.source(SourceSpec::text_glob(input)?)?;
    let tokens = flow.flat_map(lines, "tokenize")?;
    let lower = flow.map(tokens, "to_lower")?;
    let words = flow.filter(lower, "non_empty_token")?;
    let counts = flow.reduce_by(words, "token", "sum", Some(partitions))?;
    if let Some(dir) = output {
        flow.sink(
            counts,
            SinkSpec::CsvDir {
                dir,
                fields: vec!["token".into(), "count".into()],
            },
        )?;
    }
    Ok(flow)
}

fn print_outputs(outputs: &BTreeMap<DatasetId, Vec<Record>>) -> Result<()> {
    for (dataset, records) in outputs {
        println!("# dataset {} ({} registros)", dataset, records.len());
        for rec in records {
            println!("{}", serde_json::to_string(rec)?);
        }
    }
    Ok(())
}

async fn run_flow(flow: &Flow, events: bool) -> Result<()> {
    let coordinator = Arc::new(HttpCoordinator::new(&master_base_url())?);
    let agents = Arc::new(HttpAgentConnector::new()?);
    let driver = Driver::new(coordinator, agents, DriverConfig::from_env());

    let cancel = CancellationToken::new();
    let on_ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("ctrl-c: cancelando el flow");
            on_ctrl_c.cancel();
        }
    });

    let outcome: FlowOutcome = driver.run(flow, cancel).await;
    if events {
        for ev in &outcome.events {
            eprintln!("{}", serde_json::to_string(ev)?);
        }
    }
    eprintln!("flow {}: {:?}", outcome.flow_id, outcome.state);

    let outputs = outcome.into_result()?;
    print_outputs(&outputs)
}

pub async fn run() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { flow: path, events } => {
            let text = std::fs::read_to_string(&path)
                .with_context(|| format!("no se pudo leer {}", path.display()))?;
            let flow: Flow = serde_json::from_str(&text)
                .with_context(|| format!("flow inválido en {}", path.display()))?;
            run_flow(&flow, events).await?;
        }

        Commands::Wordcount {
            input,
            partitions,
            output,
        } => {
            if partitions == 0 {
                bail!("--partitions tiene que ser mayor que 0");
            }
            let flow = wordcount_flow(&input, partitions, output)?;
            run_flow(&flow, false).await?;
        }

        Commands::Agents => {
            let coordinator = HttpCoordinator::new(&master_base_url())?;
            let agents = coordinator.agents().await?;
            if agents.is_empty() {
                println!("No hay agentes registrados.");
            }
            for a in agents {
                println!("Agente {}", a.agent);
                println!(
                    "  slots          : total={}, libres={}, disponibles={}",
                    a.total_slots, a.free_slots, a.available_slots
                );
                println!("  grants activos : {}", a.active_grants);
                println!("  bytes en store : {}", a.resident_bytes);
                println!("  last_heartbeat : {}", a.last_heartbeat);
                println!();
            }
        }
    }

    Ok(())
}
