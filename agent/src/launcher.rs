//! Lanzadores de executors.
//!
//! `ProcessLauncher` corre cada tarea en un proceso `executor` propio: un
//! crash o un exceso de memoria mata sólo esa tarea. `InProcessLauncher` usa
//! un hilo bloqueante y sirve para el modo local y los tests.

use std::{
    io,
    path::PathBuf,
    process::{ExitStatus, Stdio},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use async_trait::async_trait;
use common::{
    client::ErrorBody, engine, fetch::ShardFetcher, ExecutorReport, ExecutorTask, FlowError,
    LogicRegistry, Result,
};
use tokio::{
    io::AsyncReadExt,
    process::{Child, ChildStdout, Command},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[async_trait]
pub trait ExecutorLauncher: Send + Sync {
    /// Corre la tarea hasta el final o hasta que se cancele `cancel`.
    async fn run(&self, task: ExecutorTask, cancel: CancellationToken) -> Result<ExecutorReport>;
}

pub struct ProcessLauncher {
    executor_bin: PathBuf,
    tasks_dir: PathBuf,
    memory_slack: u64,
}

impl ProcessLauncher {
    pub fn new(executor_bin: PathBuf, tasks_dir: PathBuf, memory_slack: u64) -> Self {
        Self {
            executor_bin,
            tasks_dir,
            memory_slack,
        }
    }

    fn address_space_limit(&self, task: &ExecutorTask) -> Option<u64> {
        (task.memory_budget > 0).then(|| task.memory_budget.saturating_add(self.memory_slack))
    }
}

async fn wait_output(child: &mut Child, mut stdout: ChildStdout) -> io::Result<(ExitStatus, Vec<u8>)> {
    let mut out = Vec::new();
    stdout.read_to_end(&mut out).await?;
    let status = child.wait().await?;
    Ok((status, out))
}

/// El executor imprime una sola línea JSON: el reporte o el error.
fn parse_output(status: ExitStatus, out: &[u8]) -> Result<ExecutorReport> {
    let text = String::from_utf8_lossy(out);
    let last = text.lines().rev().find(|l| !l.trim().is_empty()).unwrap_or("");
    if status.success() {
        return Ok(serde_json::from_str(last)?);
    }
    match serde_json::from_str::<ErrorBody>(last) {
        Ok(body) => Err(body.into_error()),
        Err(_) => Err(FlowError::ExecutorFailure(format!("executor terminó con {status}"))),
    }
}

#[async_trait]
impl ExecutorLauncher for ProcessLauncher {
    async fn run(&self, task: ExecutorTask, cancel: CancellationToken) -> Result<ExecutorReport> {
        tokio::fs::create_dir_all(&self.tasks_dir).await?;
        let task_path = self.tasks_dir.join(format!("{}.json", task.assignment_id));
        tokio::fs::write(&task_path, serde_json::to_vec(&task)?).await?;

        let mut cmd = Command::new(&self.executor_bin);
        cmd.arg(&task_path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);

        #[cfg(unix)]
        {
            if let Some(limit) = self.address_space_limit(&task) {
                // SAFETY: sólo llama a setrlimit, que es async-signal-safe.
                unsafe {
                    cmd.pre_exec(move || {
                        let rl = libc::rlimit {
                            rlim_cur: limit as libc::rlim_t,
                            rlim_max: limit as libc::rlim_t,
                        };
                        if libc::setrlimit(libc::RLIMIT_AS, &rl) == -1 {
                            return Err(io::Error::last_os_error());
                        }
                        Ok(())
                    });
                }
            }
        }

        let mut child = cmd.spawn().map_err(|e| {
            FlowError::ExecutorFailure(format!(
                "no se pudo lanzar {}: {e}",
                self.executor_bin.display()
            ))
        })?;
        debug!("executor {} lanzado (pid {:?})", task.assignment_id, child.id());

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| FlowError::ExecutorFailure("executor sin stdout".into()))?;

        let outcome = tokio::select! {
            _ = cancel.cancelled() => None,
            res = wait_output(&mut child, stdout) => Some(res),
        };
        let result = match outcome {
            Some(Ok((status, out))) => parse_output(status, &out),
            Some(Err(e)) => Err(e.into()),
            None => {
                if let Err(e) = child.kill().await {
                    warn!("no se pudo matar el executor {}: {}", task.assignment_id, e);
                }
                Err(FlowError::Cancelled)
            }
        };
        let _ = tokio::fs::remove_file(&task_path).await;
        result
    }
}

pub struct InProcessLauncher {
    registry: LogicRegistry,
    fetcher: Arc<dyn ShardFetcher>,
}

impl InProcessLauncher {
    pub fn new(registry: LogicRegistry, fetcher: Arc<dyn ShardFetcher>) -> Self {
        Self { registry, fetcher }
    }
}

#[async_trait]
impl ExecutorLauncher for InProcessLauncher {
    async fn run(&self, task: ExecutorTask, cancel: CancellationToken) -> Result<ExecutorReport> {
        let flag = Arc::new(AtomicBool::new(false));
        let watcher = {
            let flag = flag.clone();
            tokio::spawn(async move {
                cancel.cancelled().await;
                flag.store(true, Ordering::SeqCst);
            })
        };

        let registry = self.registry.clone();
        let fetcher = self.fetcher.clone();
        let joined = tokio::task::spawn_blocking(move || {
            engine::run_task(&task, &registry, fetcher.as_ref(), &flag)
        })
        .await;
        watcher.abort();

        match joined {
            Ok(result) => result,
            Err(e) => Err(FlowError::ExecutorFailure(format!("executor abortado: {e}"))),
        }
    }
}
