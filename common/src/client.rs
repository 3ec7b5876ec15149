//! Clientes HTTP (reqwest) de los traits de `protocol`.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use futures::TryStreamExt;
use reqwest::{Client, Response};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tokio_util::io::StreamReader;

use crate::error::{FlowError, Result};
use crate::protocol::*;
use crate::shard::{ShardBody, ShardKey};

/// Cuerpo de error de las APIs HTTP. Lleva el tipo de error para que el
/// cliente reconstruya el mismo `FlowError` que devolvió el servidor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub kind: String,
    pub message: String,
    #[serde(default)]
    pub requested: u32,
    #[serde(default)]
    pub required: u32,
    #[serde(default)]
    pub available: u32,
}

impl ErrorBody {
    pub fn from_error(err: &FlowError) -> Self {
        let mut body = ErrorBody {
            kind: "internal".into(),
            message: err.to_string(),
            requested: 0,
            required: 0,
            available: 0,
        };
        body.kind = match err.root() {
            FlowError::ResourceExhaustion {
                requested,
                required,
                available,
            } => {
                body.requested = *requested;
                body.required = *required;
                body.available = *available;
                "resource_exhaustion"
            }
            FlowError::NoFreeSlots => "no_free_slots",
            FlowError::ShardNotReady(_) => "shard_not_ready",
            FlowError::ShardNotFound(_) => "shard_not_found",
            FlowError::AgentUnavailable(_) => "agent_unavailable",
            FlowError::ExecutorFailure(_) => "executor_failure",
            FlowError::UnknownLogic(_) => "unknown_logic",
            FlowError::ShardCorruption { .. } => "shard_corruption",
            FlowError::MemoryBudgetExceeded { .. } => "memory_budget_exceeded",
            FlowError::Cancelled => "cancelled",
            FlowError::Planning(_) => "planning",
            _ => "internal",
        }
        .into();
        body
    }

    /// Código HTTP con el que responde el servidor.
    pub fn status(&self) -> u16 {
        match self.kind.as_str() {
            "resource_exhaustion" | "no_free_slots" => 503,
            "shard_not_ready" => 409,
            "shard_not_found" => 404,
            "planning" | "unknown_logic" => 400,
            _ => 500,
        }
    }

    pub fn into_error(self) -> FlowError {
        match self.kind.as_str() {
            "resource_exhaustion" => FlowError::ResourceExhaustion {
                requested: self.requested,
                required: self.required,
                available: self.available,
            },
            "no_free_slots" => FlowError::NoFreeSlots,
            "shard_not_ready" => FlowError::ShardNotReady(self.message),
            "shard_not_found" => FlowError::ShardNotFound(self.message),
            "agent_unavailable" => FlowError::AgentUnavailable(self.message),
            "executor_failure" => FlowError::ExecutorFailure(self.message),
            "unknown_logic" => FlowError::UnknownLogic(self.message),
            "shard_corruption" => FlowError::ShardCorruption {
                shard: String::new(),
                reason: self.message,
            },
            "cancelled" => FlowError::Cancelled,
            "memory_budget_exceeded" => FlowError::ExecutorFailure(self.message),
            _ => FlowError::Transport(self.message),
        }
    }
}

fn http_client() -> Result<Client> {
    Ok(Client::builder()
        .connect_timeout(Duration::from_secs(5))
        .timeout(Duration::from_secs(60))
        .build()?)
}

async fn check(resp: Response) -> Result<Response> {
    if resp.status().is_success() {
        return Ok(resp);
    }
    let status = resp.status();
    match resp.json::<ErrorBody>().await {
        Ok(body) => Err(body.into_error()),
        Err(_) => Err(FlowError::Transport(format!("respuesta {status}"))),
    }
}

async fn json<T: DeserializeOwned>(resp: Response) -> Result<T> {
    Ok(check(resp).await?.json::<T>().await?)
}

/// Coordinador remoto (`master`).
#[derive(Clone)]
pub struct HttpCoordinator {
    base_url: String,
    client: Client,
}

impl HttpCoordinator {
    pub fn new(base_url: &str) -> Result<Self> {
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client: http_client()?,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

#[async_trait]
impl CoordinatorApi for HttpCoordinator {
    async fn heartbeat(&self, req: HeartbeatRequest) -> Result<HeartbeatAck> {
        let url = self.url("/api/v1/agents/heartbeat");
        json(self.client.post(url).json(&req).send().await?).await
    }

    async fn request_slots(&self, req: SlotRequest) -> Result<Vec<SlotGrant>> {
        let url = self.url("/api/v1/slots/request");
        json(self.client.post(url).json(&req).send().await?).await
    }

    async fn confirm_grant(&self, grant: &str) -> Result<GrantStatus> {
        let url = self.url(&format!("/api/v1/grants/{grant}/confirm"));
        json(self.client.post(url).send().await?).await
    }

    async fn release_grant(&self, grant: &str) -> Result<GrantStatus> {
        let url = self.url(&format!("/api/v1/grants/{grant}/release"));
        json(self.client.post(url).send().await?).await
    }

    async fn grant_status(&self, grant: &str) -> Result<GrantStatus> {
        let url = self.url(&format!("/api/v1/grants/{grant}"));
        json(self.client.get(url).send().await?).await
    }

    async fn agents(&self) -> Result<Vec<AgentView>> {
        json(self.client.get(self.url("/api/v1/agents")).send().await?).await
    }
}

/// Agente remoto. Un error de conexión es `AgentUnavailable`.
#[derive(Clone)]
pub struct HttpAgent {
    addr: String,
    client: Client,
}

impl HttpAgent {
    pub fn new(addr: &str, client: Client) -> Self {
        Self {
            addr: addr.trim_end_matches('/').to_string(),
            client,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.addr, path)
    }

    async fn send(&self, req: reqwest::RequestBuilder) -> Result<Response> {
        req.send()
            .await
            .map_err(|e| FlowError::AgentUnavailable(format!("{} ({e})", self.addr)))
    }
}

#[async_trait]
impl AgentApi for HttpAgent {
    async fn start_executor(&self, req: StartExecutorRequest) -> Result<ExecutorHandle> {
        let url = self.url("/api/v1/executors");
        json(self.send(self.client.post(url).json(&req)).await?).await
    }

    async fn executor_status(&self, assignment: &str) -> Result<ExecutorStatus> {
        let url = self.url(&format!("/api/v1/executors/{assignment}"));
        json(self.send(self.client.get(url)).await?).await
    }

    async fn cancel_executor(&self, assignment: &str) -> Result<()> {
        let url = self.url(&format!("/api/v1/executors/{assignment}/cancel"));
        check(self.send(self.client.post(url)).await?).await?;
        Ok(())
    }

    async fn register_readers(&self, req: RegisterReadersRequest) -> Result<()> {
        let url = self.url("/api/v1/shards/readers");
        check(self.send(self.client.post(url).json(&req)).await?).await?;
        Ok(())
    }

    async fn ack_reads(&self, req: AckReadRequest) -> Result<()> {
        let url = self.url("/api/v1/shards/ack");
        check(self.send(self.client.post(url).json(&req)).await?).await?;
        Ok(())
    }

    async fn release_flow(&self, flow_id: &str, include_persistent: bool) -> Result<usize> {
        let url = self.url(&format!("/api/v1/flows/{flow_id}/release"));
        let body = ReleaseFlowRequest { include_persistent };
        json(self.send(self.client.post(url).json(&body)).await?).await
    }

    async fn fetch_shard(&self, key: &ShardKey) -> Result<ShardBody> {
        let url = self.url("/api/v1/shards");
        let resp = check(self.send(self.client.get(url).query(key)).await?).await?;
        let chunks = resp.bytes_stream().map_err(std::io::Error::other);
        Ok(Box::pin(StreamReader::new(chunks)))
    }

    async fn status(&self) -> Result<AgentStatus> {
        json(self.send(self.client.get(self.url("/api/v1/status"))).await?).await
    }
}

/// Conecta con agentes por HTTP; todos comparten el mismo pool de conexiones.
#[derive(Clone)]
pub struct HttpAgentConnector {
    client: Client,
}

impl HttpAgentConnector {
    pub fn new() -> Result<Self> {
        Ok(Self {
            client: http_client()?,
        })
    }
}

impl AgentConnector for HttpAgentConnector {
    fn connect(&self, agent: &str) -> Result<Arc<dyn AgentApi>> {
        Ok(Arc::new(HttpAgent::new(agent, self.client.clone())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_body_conserva_el_tipo_de_error() {
        let err = FlowError::ResourceExhaustion {
            requested: 3,
            required: 3,
            available: 2,
        }
        .context("pedido de slots");
        let body = ErrorBody::from_error(&err);
        assert_eq!(body.status(), 503);
        assert!(matches!(
            body.into_error(),
            FlowError::ResourceExhaustion {
                requested: 3,
                required: 3,
                available: 2
            }
        ));

        let body = ErrorBody::from_error(&FlowError::ShardNotReady("f/0/0".into()));
        assert_eq!(body.status(), 409);
        assert!(matches!(body.into_error(), FlowError::ShardNotReady(_)));

        let err = FlowError::ShardCorruption {
            shard: "f/d1/p0".into(),
            reason: "faltan 3 registros".into(),
        };
        let body = ErrorBody::from_error(&err);
        assert!(matches!(body.into_error(), FlowError::ShardCorruption { .. }));
    }
}
