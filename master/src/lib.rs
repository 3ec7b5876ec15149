//! Coordinador de recursos: tabla de slots, grants con lease y reaper.

pub mod handlers;
pub mod monitor;
pub mod state;

use std::time::Instant;

use async_trait::async_trait;
use common::{
    AgentId, AgentView, CoordinatorApi, GrantStatus, HeartbeatAck, HeartbeatRequest, Result,
    SlotGrant, SlotRequest,
};

pub use state::{AppState, CoordinatorConfig, ResourcePool};

/// Coordinador en proceso. El servidor HTTP y los tests lo usan igual.
#[derive(Clone)]
pub struct Coordinator {
    state: AppState,
}

impl Coordinator {
    pub fn new(config: CoordinatorConfig) -> Self {
        Self {
            state: AppState::new(config),
        }
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    pub fn reap(&self) -> Vec<AgentId> {
        self.state.pool().reap_at(Instant::now())
    }
}

#[async_trait]
impl CoordinatorApi for Coordinator {
    async fn heartbeat(&self, req: HeartbeatRequest) -> Result<HeartbeatAck> {
        Ok(self.state.pool().heartbeat_at(req, Instant::now()))
    }

    async fn request_slots(&self, req: SlotRequest) -> Result<Vec<SlotGrant>> {
        self.state.pool().request_slots_at(&req, Instant::now())
    }

    async fn confirm_grant(&self, grant: &str) -> Result<GrantStatus> {
        Ok(self.state.pool().confirm_at(grant, Instant::now()))
    }

    async fn release_grant(&self, grant: &str) -> Result<GrantStatus> {
        Ok(self.state.pool().release_at(grant, Instant::now()))
    }

    async fn grant_status(&self, grant: &str) -> Result<GrantStatus> {
        Ok(self.state.pool().status_at(grant, Instant::now()))
    }

    async fn agents(&self) -> Result<Vec<AgentView>> {
        Ok(self.state.pool().agents())
    }
}
