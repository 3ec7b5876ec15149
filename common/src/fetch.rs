//! Acceso a los shards de entrada de un executor.
//!
//! El executor no sabe si un shard es local o remoto: le pide los bytes a un
//! `ShardFetcher` y los lee como JSONL verificado contra `ShardMeta`.

use std::{
    collections::HashMap,
    fs::File,
    io::{BufRead, BufReader},
    time::Duration,
};

use reqwest::{blocking::Client, StatusCode};
use tracing::debug;

use crate::error::{FlowError, Result};
use crate::shard::{RecordIter, VerifiedRecords};
use crate::store::ShardStore;
use crate::task::InputShard;
use crate::AgentId;

pub trait ShardFetcher: Send + Sync {
    fn fetch(&self, input: &InputShard) -> Result<Box<dyn BufRead + Send>>;
}

/// Abre un shard como secuencia perezosa verificada.
pub fn open_verified(fetcher: &dyn ShardFetcher, input: &InputShard) -> Result<RecordIter<'static>> {
    let reader = fetcher.fetch(input)?;
    Ok(Box::new(VerifiedRecords::new(reader, input.meta.clone())))
}

/// Lee directo del disco si el shard es local; si no, lo pide por HTTP al
/// agente que lo tiene (`GET /api/v1/shards`), sin cargarlo entero en memoria.
pub struct HttpFetcher {
    client: Client,
}

impl HttpFetcher {
    pub fn new() -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .build()?;
        Ok(Self { client })
    }
}

impl ShardFetcher for HttpFetcher {
    fn fetch(&self, input: &InputShard) -> Result<Box<dyn BufRead + Send>> {
        if let Some(path) = &input.local_path {
            if path.exists() {
                debug!("shard {} leído localmente", input.meta.key);
                return Ok(Box::new(BufReader::new(File::open(path)?)));
            }
        }

        let url = format!("{}/api/v1/shards", input.agent.trim_end_matches('/'));
        let resp = self
            .client
            .get(&url)
            .query(&input.meta.key)
            .send()
            .map_err(|e| FlowError::AgentUnavailable(format!("{} ({e})", input.agent)))?;

        match resp.status() {
            s if s.is_success() => Ok(Box::new(BufReader::new(resp))),
            StatusCode::CONFLICT => Err(FlowError::ShardNotReady(input.meta.key.to_string())),
            StatusCode::NOT_FOUND => Err(FlowError::ShardNotFound(input.meta.key.to_string())),
            other => Err(FlowError::Transport(format!(
                "GET {url} respondió {other}"
            ))),
        }
    }
}

/// Lee de los Shard Stores de agentes del mismo proceso (modo local y tests).
#[derive(Clone, Default)]
pub struct StoreFetcher {
    stores: HashMap<AgentId, ShardStore>,
}

impl StoreFetcher {
    pub fn new(stores: HashMap<AgentId, ShardStore>) -> Self {
        Self { stores }
    }
}

impl ShardFetcher for StoreFetcher {
    fn fetch(&self, input: &InputShard) -> Result<Box<dyn BufRead + Send>> {
        let store = self
            .stores
            .get(&input.agent)
            .ok_or_else(|| FlowError::AgentUnavailable(input.agent.clone()))?;
        let (handle, _) = store.locate(&input.meta.key)?;
        Ok(handle.open()?)
    }
}
