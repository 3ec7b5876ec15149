// master/src/state.rs

use common::{
    config::{env_millis, env_string},
    AgentId, AgentView, FlowError, GrantId, GrantStatus, HeartbeatAck, HeartbeatRequest,
    SlotGrant, SlotRequest,
};
use chrono::{DateTime, Utc};
use std::{
    collections::{BTreeMap, HashMap},
    sync::{Arc, Mutex, MutexGuard},
    time::{Duration, Instant},
};
use tracing::{debug, info, warn};

/// Cuánto se conservan los grants terminados para responder consultas tardías.
const GRANT_RETENTION: Duration = Duration::from_secs(600);

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub bind: String,
    /// Un agente sin heartbeat por más de esto sale del pool.
    pub heartbeat_timeout: Duration,
    pub reaper_interval: Duration,
    /// Vida de un grant sin confirmar.
    pub grant_lease: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:8080".into(),
            heartbeat_timeout: Duration::from_secs(20),
            reaper_interval: Duration::from_secs(5),
            grant_lease: Duration::from_secs(10),
        }
    }
}

impl CoordinatorConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            bind: env_string("MASTER_BIND", &d.bind),
            heartbeat_timeout: env_millis("HEARTBEAT_TIMEOUT_MS", d.heartbeat_timeout.as_millis() as u64),
            reaper_interval: env_millis("REAPER_INTERVAL_MS", d.reaper_interval.as_millis() as u64),
            grant_lease: env_millis("GRANT_LEASE_MS", d.grant_lease.as_millis() as u64),
        }
    }

    /// Intervalo de heartbeat que se sugiere a los agentes.
    pub fn heartbeat_interval(&self) -> Duration {
        self.heartbeat_timeout / 4
    }
}

#[derive(Debug, Clone)]
pub struct AgentRow {
    pub total_slots: u32,
    pub free_slots: u32,
    pub slot_memory: u64,
    pub resident_bytes: u64,
    pub last_heartbeat: Instant,
    pub last_heartbeat_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct Grant {
    pub flow_id: String,
    pub agent: AgentId,
    pub status: GrantStatus,
    pub expires_at: Instant,
    pub retired_at: Option<Instant>,
}

impl Grant {
    fn is_active(&self) -> bool {
        matches!(self.status, GrantStatus::Leased | GrantStatus::Confirmed)
    }

    fn retire(&mut self, status: GrantStatus, now: Instant) {
        self.status = status;
        self.retired_at = Some(now);
    }
}

/// Tabla de slots del cluster. Sólo memoria: se reconstruye con los
/// heartbeats de los agentes después de un reinicio.
#[derive(Debug)]
pub struct ResourcePool {
    config: CoordinatorConfig,
    agents: BTreeMap<AgentId, AgentRow>,
    grants: HashMap<GrantId, Grant>,
}

impl ResourcePool {
    pub fn new(config: CoordinatorConfig) -> Self {
        Self {
            config,
            agents: BTreeMap::new(),
            grants: HashMap::new(),
        }
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    pub fn heartbeat_at(&mut self, req: HeartbeatRequest, now: Instant) -> HeartbeatAck {
        let row = AgentRow {
            total_slots: req.total_slots,
            free_slots: req.free_slots.min(req.total_slots),
            slot_memory: req.slot_memory,
            resident_bytes: req.resident_bytes,
            last_heartbeat: now,
            last_heartbeat_at: Utc::now(),
        };
        if self.agents.insert(req.agent.clone(), row).is_none() {
            info!("agente {} registrado ({} slots)", req.agent, req.total_slots);
        }
        HeartbeatAck {
            ok: true,
            interval_ms: self.config.heartbeat_interval().as_millis() as u64,
        }
    }

    fn active_grants(&self, agent: &str) -> u32 {
        self.grants
            .values()
            .filter(|g| g.agent == agent && g.is_active())
            .count() as u32
    }

    /// Slots que se pueden prometer: lo que el agente reporta libre, sin
    /// pasar lo que queda después de los grants vigentes.
    fn available(&self, agent: &str, row: &AgentRow) -> u32 {
        let granted = self.active_grants(agent);
        row.free_slots.min(row.total_slots.saturating_sub(granted))
    }

    pub fn request_slots_at(
        &mut self,
        req: &SlotRequest,
        now: Instant,
    ) -> Result<Vec<SlotGrant>, FlowError> {
        self.expire_leases(now);
        if req.slots == 0 {
            return Ok(vec![]);
        }

        let mut avail: BTreeMap<AgentId, u32> = self
            .agents
            .iter()
            .map(|(id, row)| (id.clone(), self.available(id, row)))
            .collect();
        let total: u32 = avail.values().sum();
        let required = req.min_slots.clamp(1, req.slots);
        if total < required {
            return Err(FlowError::ResourceExhaustion {
                requested: req.slots,
                required,
                available: total,
            });
        }

        let mut grants = Vec::new();
        while (grants.len() as u32) < req.slots {
            // el agente con más slots libres primero; empate => menor dirección
            let pick = |avoid: bool| {
                avail
                    .iter()
                    .filter(|(id, n)| **n > 0 && req.avoid.contains(id) == avoid)
                    .max_by(|a, b| a.1.cmp(b.1).then_with(|| b.0.cmp(a.0)))
                    .map(|(id, _)| id.clone())
            };
            let Some(agent) = pick(false).or_else(|| pick(true)) else {
                break;
            };
            if let Some(n) = avail.get_mut(&agent) {
                *n -= 1;
            }

            let grant_id = uuid::Uuid::new_v4().to_string();
            self.grants.insert(
                grant_id.clone(),
                Grant {
                    flow_id: req.flow_id.clone(),
                    agent: agent.clone(),
                    status: GrantStatus::Leased,
                    expires_at: now + self.config.grant_lease,
                    retired_at: None,
                },
            );
            grants.push(SlotGrant {
                grant_id,
                agent,
                lease_ms: self.config.grant_lease.as_millis() as u64,
            });
        }
        debug!(
            "flow {}: {} de {} slots otorgados",
            req.flow_id,
            grants.len(),
            req.slots
        );
        Ok(grants)
    }

    pub fn confirm_at(&mut self, grant_id: &str, now: Instant) -> GrantStatus {
        self.expire_leases(now);
        match self.grants.get_mut(grant_id) {
            Some(grant) if grant.status == GrantStatus::Leased => {
                grant.status = GrantStatus::Confirmed;
                GrantStatus::Confirmed
            }
            Some(grant) => grant.status,
            None => GrantStatus::Unknown,
        }
    }

    pub fn release_at(&mut self, grant_id: &str, now: Instant) -> GrantStatus {
        match self.grants.get_mut(grant_id) {
            Some(grant) if grant.is_active() => {
                grant.retire(GrantStatus::Released, now);
                GrantStatus::Released
            }
            Some(grant) => grant.status,
            None => GrantStatus::Unknown,
        }
    }

    pub fn status_at(&mut self, grant_id: &str, now: Instant) -> GrantStatus {
        self.expire_leases(now);
        self.grants
            .get(grant_id)
            .map(|g| g.status)
            .unwrap_or(GrantStatus::Unknown)
    }

    /// Grants sin confirmar cuyo lease venció vuelven al pool.
    pub fn expire_leases(&mut self, now: Instant) -> usize {
        let mut expired = 0;
        for (id, grant) in self.grants.iter_mut() {
            if grant.status == GrantStatus::Leased && grant.expires_at <= now {
                debug!("grant {} de {} expiró sin confirmar", id, grant.flow_id);
                grant.retire(GrantStatus::Expired, now);
                expired += 1;
            }
        }
        expired
    }

    /// Saca del pool a los agentes silenciosos y marca sus grants como
    /// `AgentLost`. Devuelve los agentes expulsados.
    pub fn reap_at(&mut self, now: Instant) -> Vec<AgentId> {
        let timeout = self.config.heartbeat_timeout;
        let dead: Vec<AgentId> = self
            .agents
            .iter()
            .filter(|(_, row)| now.saturating_duration_since(row.last_heartbeat) > timeout)
            .map(|(id, _)| id.clone())
            .collect();

        for agent in &dead {
            warn!("agente {} sin heartbeat por más de {:?}: fuera del pool", agent, timeout);
            self.agents.remove(agent);
            for grant in self.grants.values_mut() {
                if &grant.agent == agent && grant.is_active() {
                    grant.retire(GrantStatus::AgentLost, now);
                }
            }
        }

        self.expire_leases(now);
        self.grants.retain(|_, g| match g.retired_at {
            Some(at) => now.saturating_duration_since(at) < GRANT_RETENTION,
            None => true,
        });
        dead
    }

    pub fn agents(&self) -> Vec<AgentView> {
        self.agents
            .iter()
            .map(|(id, row)| AgentView {
                agent: id.clone(),
                total_slots: row.total_slots,
                free_slots: row.free_slots,
                available_slots: self.available(id, row),
                active_grants: self.active_grants(id),
                resident_bytes: row.resident_bytes,
                last_heartbeat: row.last_heartbeat_at,
            })
            .collect()
    }
}

#[derive(Clone)]
pub struct AppState {
    pub pool: Arc<Mutex<ResourcePool>>,
}

impl AppState {
    pub fn new(config: CoordinatorConfig) -> Self {
        Self {
            pool: Arc::new(Mutex::new(ResourcePool::new(config))),
        }
    }

    pub fn pool(&self) -> MutexGuard<'_, ResourcePool> {
        self.pool.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool() -> ResourcePool {
        ResourcePool::new(CoordinatorConfig {
            heartbeat_timeout: Duration::from_secs(20),
            grant_lease: Duration::from_secs(10),
            ..CoordinatorConfig::default()
        })
    }

    fn hb(agent: &str, total: u32, free: u32) -> HeartbeatRequest {
        HeartbeatRequest {
            agent: agent.into(),
            total_slots: total,
            free_slots: free,
            slot_memory: 0,
            resident_bytes: 0,
        }
    }

    fn req(slots: u32, min_slots: u32, avoid: &[&str]) -> SlotRequest {
        SlotRequest {
            flow_id: "f".into(),
            slots,
            min_slots,
            avoid: avoid.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn heartbeat_es_idempotente_y_acota_free() {
        let mut p = pool();
        let now = Instant::now();
        p.heartbeat_at(hb("a", 2, 5), now);
        p.heartbeat_at(hb("a", 2, 5), now);
        let agents = p.agents();
        assert_eq!(agents.len(), 1);
        assert_eq!(agents[0].free_slots, 2);
    }

    #[test]
    fn reparte_primero_desde_el_agente_con_mas_slots() {
        let mut p = pool();
        let now = Instant::now();
        p.heartbeat_at(hb("a", 2, 2), now);
        p.heartbeat_at(hb("b", 4, 4), now);

        let grants = p.request_slots_at(&req(3, 1, &[]), now).unwrap();
        let agents: Vec<&str> = grants.iter().map(|g| g.agent.as_str()).collect();
        // b(4) -> b(3) -> a(2)=b(2) empate, gana "a"
        assert_eq!(agents, vec!["b", "b", "a"]);

        let views = p.agents();
        assert_eq!(views[0].available_slots, 1);
        assert_eq!(views[1].available_slots, 2);
    }

    #[test]
    fn avoid_es_preferencia_no_prohibicion() {
        let mut p = pool();
        let now = Instant::now();
        p.heartbeat_at(hb("a", 1, 1), now);
        p.heartbeat_at(hb("b", 1, 1), now);

        let g = p.request_slots_at(&req(1, 1, &["a"]), now).unwrap();
        assert_eq!(g[0].agent, "b");
        let g = p.request_slots_at(&req(1, 1, &["a"]), now).unwrap();
        assert_eq!(g[0].agent, "a");
    }

    #[test]
    fn gang_scheduling_es_todo_o_nada() {
        let mut p = pool();
        let now = Instant::now();
        p.heartbeat_at(hb("a", 1, 1), now);
        p.heartbeat_at(hb("b", 1, 1), now);

        let err = p.request_slots_at(&req(3, 3, &[]), now).unwrap_err();
        assert!(matches!(
            err,
            FlowError::ResourceExhaustion { requested: 3, required: 3, available: 2 }
        ));
        // nada quedó reservado
        assert!(p.agents().iter().all(|a| a.active_grants == 0));

        // sin gang: se otorga lo que hay
        assert_eq!(p.request_slots_at(&req(3, 1, &[]), now).unwrap().len(), 2);
    }

    #[test]
    fn sin_agentes_es_resource_exhaustion() {
        let mut p = pool();
        assert!(matches!(
            p.request_slots_at(&req(1, 1, &[]), Instant::now()),
            Err(FlowError::ResourceExhaustion { available: 0, .. })
        ));
    }

    #[test]
    fn lease_sin_confirmar_expira_y_libera_el_slot() {
        let mut p = pool();
        let now = Instant::now();
        p.heartbeat_at(hb("a", 1, 1), now);
        let g = p.request_slots_at(&req(1, 1, &[]), now).unwrap().remove(0);
        assert!(p.request_slots_at(&req(1, 1, &[]), now).is_err());

        let later = now + Duration::from_secs(11);
        assert_eq!(p.confirm_at(&g.grant_id, later), GrantStatus::Expired);
        assert_eq!(p.request_slots_at(&req(1, 1, &[]), later).unwrap().len(), 1);
    }

    #[test]
    fn confirmado_no_expira_y_release_lo_devuelve() {
        let mut p = pool();
        let now = Instant::now();
        p.heartbeat_at(hb("a", 1, 1), now);
        let g = p.request_slots_at(&req(1, 1, &[]), now).unwrap().remove(0);
        assert_eq!(p.confirm_at(&g.grant_id, now), GrantStatus::Confirmed);

        let later = now + Duration::from_secs(11);
        assert_eq!(p.status_at(&g.grant_id, later), GrantStatus::Confirmed);
        assert_eq!(p.release_at(&g.grant_id, later), GrantStatus::Released);
        assert_eq!(p.agents()[0].available_slots, 1);
        assert_eq!(p.status_at("no-existe", later), GrantStatus::Unknown);
    }

    #[test]
    fn reaper_expulsa_agentes_silenciosos_y_marca_sus_grants() {
        let mut p = pool();
        let now = Instant::now();
        p.heartbeat_at(hb("a", 1, 1), now);
        p.heartbeat_at(hb("b", 1, 1), now);
        let grants = p.request_slots_at(&req(2, 2, &[]), now).unwrap();
        for g in &grants {
            p.confirm_at(&g.grant_id, now);
        }

        let later = now + Duration::from_secs(15);
        p.heartbeat_at(hb("b", 1, 0), later);
        let dead = p.reap_at(now + Duration::from_secs(21));
        assert_eq!(dead, vec!["a".to_string()]);

        for g in &grants {
            let expected = if g.agent == "a" { GrantStatus::AgentLost } else { GrantStatus::Confirmed };
            assert_eq!(p.status_at(&g.grant_id, later), expected);
        }
        assert_eq!(p.agents().len(), 1);

        // vuelve a registrarse con el próximo heartbeat
        p.heartbeat_at(hb("a", 1, 1), later);
        assert_eq!(p.agents().len(), 2);
    }

    #[test]
    fn free_reportado_limita_aunque_no_haya_grants() {
        let mut p = pool();
        let now = Instant::now();
        // memoria ocupada por shards residentes: el agente reporta 0 libres
        p.heartbeat_at(hb("a", 4, 0), now);
        assert!(p.request_slots_at(&req(1, 1, &[]), now).is_err());
    }
}
