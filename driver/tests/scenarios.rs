//! Flows completos contra un cluster armado en el proceso: coordinador real,
//! agentes reales con executors en hilos y un reaper con tiempos cortos.

use std::{
    collections::{BTreeMap, HashMap},
    env, fs,
    io::BufRead,
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, AtomicU32, Ordering},
        Arc,
    },
    time::Duration,
};

use agent::{heartbeat, Agent, AgentConfig, InProcessLauncher, LaunchMode};
use async_trait::async_trait;
use common::{
    fetch::{ShardFetcher, StoreFetcher},
    shard::ShardBody,
    AckReadRequest, AgentApi, AgentStatus, AgentView, CoordinatorApi, ExecutorHandle,
    ExecutorStatus, Flow, FlowError, GrantStatus, HeartbeatAck, HeartbeatRequest,
    InputShard, LogicRegistry, Record, RegisterReadersRequest, Result, ShardKey, ShardStore,
    SlotGrant, SlotRequest, SourceSpec, StartExecutorRequest, StoreConfig,
};
use driver::{Driver, DriverConfig, FlowEvent, FlowOutcome, FlowState, ModeSelection, StaticConnector};
use master::{monitor, Coordinator, CoordinatorConfig};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

fn temp_dir(sub: &str) -> PathBuf {
    let base = env::temp_dir().join("driver_tests").join(sub);
    let _ = fs::remove_dir_all(&base);
    fs::create_dir_all(&base).unwrap();
    base
}

/* =========================
   Agentes que se pueden "matar"
   ========================= */

/// Un agente caído: deja de responder y sus shards dejan de ser legibles.
/// Mientras `busy` sea mayor que cero rechaza arranques por falta de slots,
/// como un agente cuyo último heartbeat quedó viejo.
struct Killable {
    agent: Agent,
    killed: Arc<AtomicBool>,
    busy: Arc<AtomicU32>,
}

impl Killable {
    fn check(&self) -> Result<()> {
        if self.killed.load(Ordering::SeqCst) {
            return Err(FlowError::AgentUnavailable(self.agent.id().to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl AgentApi for Killable {
    async fn start_executor(&self, req: StartExecutorRequest) -> Result<ExecutorHandle> {
        self.check()?;
        if self
            .busy
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(FlowError::NoFreeSlots);
        }
        self.agent.start_executor(req).await
    }

    async fn executor_status(&self, assignment: &str) -> Result<ExecutorStatus> {
        self.check()?;
        AgentApi::executor_status(&self.agent, assignment).await
    }

    async fn cancel_executor(&self, assignment: &str) -> Result<()> {
        self.check()?;
        self.agent.cancel_executor(assignment).await
    }

    async fn register_readers(&self, req: RegisterReadersRequest) -> Result<()> {
        self.check()?;
        AgentApi::register_readers(&self.agent, req).await
    }

    async fn ack_reads(&self, req: AckReadRequest) -> Result<()> {
        self.check()?;
        AgentApi::ack_reads(&self.agent, req).await
    }

    async fn release_flow(&self, flow_id: &str, include_persistent: bool) -> Result<usize> {
        self.check()?;
        AgentApi::release_flow(&self.agent, flow_id, include_persistent).await
    }

    async fn fetch_shard(&self, key: &ShardKey) -> Result<ShardBody> {
        self.check()?;
        self.agent.fetch_shard(key).await
    }

    async fn status(&self) -> Result<AgentStatus> {
        self.check()?;
        AgentApi::status(&self.agent).await
    }
}

struct KillableFetcher {
    inner: StoreFetcher,
    killed: HashMap<String, Arc<AtomicBool>>,
}

impl ShardFetcher for KillableFetcher {
    fn fetch(&self, input: &InputShard) -> Result<Box<dyn BufRead + Send>> {
        if self
            .killed
            .get(&input.agent)
            .is_some_and(|k| k.load(Ordering::SeqCst))
        {
            return Err(FlowError::AgentUnavailable(input.agent.clone()));
        }
        self.inner.fetch(input)
    }
}

/// Cuenta los pedidos de slots que pasan por el coordinador.
struct Counting {
    inner: Coordinator,
    requests: AtomicU32,
}

#[async_trait]
impl CoordinatorApi for Counting {
    async fn heartbeat(&self, req: HeartbeatRequest) -> Result<HeartbeatAck> {
        self.inner.heartbeat(req).await
    }

    async fn request_slots(&self, req: SlotRequest) -> Result<Vec<SlotGrant>> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        self.inner.request_slots(req).await
    }

    async fn confirm_grant(&self, grant: &str) -> Result<GrantStatus> {
        self.inner.confirm_grant(grant).await
    }

    async fn release_grant(&self, grant: &str) -> Result<GrantStatus> {
        self.inner.release_grant(grant).await
    }

    async fn grant_status(&self, grant: &str) -> Result<GrantStatus> {
        self.inner.grant_status(grant).await
    }

    async fn agents(&self) -> Result<Vec<AgentView>> {
        self.inner.agents().await
    }
}

/* =========================
   Cluster de prueba
   ========================= */

fn suma_v(acc: Record, next: &Record) -> Record {
    let mut acc = acc;
    let v = acc["v"].as_i64().unwrap_or(0) + next["v"].as_i64().unwrap_or(0);
    acc["v"] = json!(v);
    acc
}

/// Builtins más la lógica de los escenarios. `tripped` se comparte entre
/// todos los agentes: cada falla inyectada ocurre una sola vez por cluster.
fn registry(tripped: Arc<AtomicBool>) -> LogicRegistry {
    let mut reg = LogicRegistry::with_builtins();
    reg.register_map("lento", |r| {
        std::thread::sleep(Duration::from_millis(100));
        Ok(r.clone())
    });
    let once = tripped.clone();
    reg.register_map("falla_una_vez", move |r| {
        if !once.swap(true, Ordering::SeqCst) {
            return Err(FlowError::ExecutorFailure("falla inyectada".into()));
        }
        Ok(r.clone())
    });
    reg.register_reduce("suma_v", |_, acc, next| Ok(suma_v(acc, next)));
    let once = tripped;
    reg.register_reduce("suma_v_corrupta_una_vez", move |_, acc, next| {
        if !once.swap(true, Ordering::SeqCst) {
            return Err(FlowError::ShardCorruption {
                shard: "entrada".into(),
                reason: "falla inyectada".into(),
            });
        }
        Ok(suma_v(acc, next))
    });
    reg
}

struct Node {
    agent: Agent,
    killed: Arc<AtomicBool>,
    busy: Arc<AtomicU32>,
    heartbeat: CancellationToken,
}

struct Cluster {
    coordinator: Coordinator,
    connector: StaticConnector,
    nodes: Vec<Node>,
    shutdown: CancellationToken,
}

impl Cluster {
    async fn start(name: &str, agents: usize, slots: u32) -> Cluster {
        let root = temp_dir(name);
        let config = CoordinatorConfig {
            bind: "127.0.0.1:0".into(),
            heartbeat_timeout: Duration::from_millis(300),
            reaper_interval: Duration::from_millis(50),
            grant_lease: Duration::from_secs(2),
        };
        let coordinator = Coordinator::new(config.clone());
        let shutdown = CancellationToken::new();
        tokio::spawn(monitor::run_reaper(
            coordinator.clone(),
            config.reaper_interval,
            shutdown.clone(),
        ));

        let configs: Vec<AgentConfig> = (0..agents)
            .map(|i| agent_config(&root, &format!("agente-{i}"), slots))
            .collect();
        let mut stores = HashMap::new();
        let mut killed = HashMap::new();
        for c in &configs {
            stores.insert(c.id.clone(), ShardStore::open(c.store.clone()).unwrap());
            killed.insert(c.id.clone(), Arc::new(AtomicBool::new(false)));
        }
        let fetcher = Arc::new(KillableFetcher {
            inner: StoreFetcher::new(stores.clone()),
            killed: killed.clone(),
        });
        let registry = registry(Arc::new(AtomicBool::new(false)));

        let mut connector = StaticConnector::new();
        let mut nodes = Vec::new();
        for c in configs {
            let id = c.id.clone();
            let launcher = Arc::new(InProcessLauncher::new(registry.clone(), fetcher.clone()));
            let agent = Agent::new(c, stores[&id].clone(), launcher);
            let hb = shutdown.child_token();
            tokio::spawn(heartbeat::run_heartbeats(
                agent.clone(),
                Arc::new(coordinator.clone()),
                hb.clone(),
            ));
            let killed = killed[&id].clone();
            let busy = Arc::new(AtomicU32::new(0));
            connector = connector.with(
                id,
                Arc::new(Killable {
                    agent: agent.clone(),
                    killed: killed.clone(),
                    busy: busy.clone(),
                }),
            );
            nodes.push(Node {
                agent,
                killed,
                busy,
                heartbeat: hb,
            });
        }

        let cluster = Cluster {
            coordinator,
            connector,
            nodes,
            shutdown,
        };
        for _ in 0..100 {
            if cluster.coordinator.agents().await.unwrap().len() == agents {
                return cluster;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("los agentes no se registraron");
    }

    fn driver(&self, config: DriverConfig) -> Driver {
        Driver::new(
            Arc::new(self.coordinator.clone()),
            Arc::new(self.connector.clone()),
            config,
        )
    }

    fn kill(&self, i: usize) {
        self.nodes[i].killed.store(true, Ordering::SeqCst);
        self.nodes[i].heartbeat.cancel();
    }
}

impl Drop for Cluster {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

fn agent_config(root: &PathBuf, id: &str, slots: u32) -> AgentConfig {
    AgentConfig {
        id: id.into(),
        bind: "127.0.0.1:0".into(),
        master_url: "http://localhost:8080".into(),
        total_slots: slots,
        slot_memory: 0,
        heartbeat_interval: Duration::from_millis(50),
        gc_interval: Duration::from_secs(30),
        launch_mode: LaunchMode::InProcess,
        executor_bin: PathBuf::from("executor"),
        executor_memory_slack: 0,
        store: StoreConfig {
            root: root.join(id),
            memory_quota: 64 << 20,
            spill_to_disk: true,
            persistent_ttl: None,
        },
    }
}

fn fast_config() -> DriverConfig {
    DriverConfig {
        max_attempts: 3,
        poll_interval: Duration::from_millis(20),
        resource_retries: 100,
        backoff: Duration::from_millis(20),
        max_backoff: Duration::from_millis(100),
        gang: false,
        mode: ModeSelection::InMemory,
        memory_budget: 16 << 20,
        max_poll_errors: 3,
    }
}

/// source(2 particiones) -> map(logic) -> reduce_by("k", reducer, 2)
fn sum_flow(map_logic: &str, reducer: &str) -> Flow {
    let mut flow = Flow::new("sumas");
    let src = flow
        .source(SourceSpec::Inline {
            partitions: vec![
                vec![json!({"k": "a", "v": 1}), json!({"k": "b", "v": 2}), json!({"k": "a", "v": 5})],
                vec![json!({"k": "a", "v": 3}), json!({"k": "c", "v": 4}), json!({"k": "b", "v": 1})],
            ],
        })
        .unwrap();
    let mapped = flow.map(src, map_logic).unwrap();
    flow.reduce_by(mapped, "k", reducer, Some(2)).unwrap();
    flow
}

fn sums(outcome: &FlowOutcome) -> BTreeMap<String, i64> {
    outcome
        .outputs
        .values()
        .flatten()
        .map(|r| {
            let k = r["k"].as_str().unwrap().to_string();
            (k, r["v"].as_i64().unwrap())
        })
        .collect()
}

fn expected_sums() -> BTreeMap<String, i64> {
    BTreeMap::from([("a".into(), 9), ("b".into(), 3), ("c".into(), 4)])
}

fn sorted_records(outcome: &FlowOutcome) -> Vec<String> {
    let mut recs: Vec<String> = outcome
        .outputs
        .values()
        .flatten()
        .map(Value::to_string)
        .collect();
    recs.sort();
    recs
}

/* =========================
   Escenarios
   ========================= */

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn reduce_espera_a_todo_el_stage_anterior() {
    let cluster = Cluster::start("barrera", 2, 1).await;
    let driver = cluster.driver(fast_config());

    let outcome = driver.run(&sum_flow("identity", "sum"), CancellationToken::new()).await;
    assert!(outcome.succeeded(), "error: {:?}", outcome.error);
    assert_eq!(sums(&outcome), expected_sums());

    let events: Vec<&FlowEvent> = outcome.events().collect();
    let reduce_start = events
        .iter()
        .position(|e| matches!(e, FlowEvent::StageScheduled { stage: 1, .. }))
        .unwrap();
    let map_done: Vec<usize> = events
        .iter()
        .enumerate()
        .filter(|(_, e)| matches!(e, FlowEvent::PartitionCompleted { stage: 0, .. }))
        .map(|(i, _)| i)
        .collect();
    assert_eq!(map_done.len(), 2);
    assert!(map_done.iter().all(|i| *i < reduce_start));

    // estados en orden y terminando en SUCCEEDED
    let states: Vec<FlowState> = events
        .iter()
        .filter_map(|e| match e {
            FlowEvent::State { state } => Some(*state),
            _ => None,
        })
        .collect();
    assert_eq!(states.first(), Some(&FlowState::Planning));
    assert_eq!(states.last(), Some(&FlowState::Succeeded));
    assert!(states.windows(2).all(|w| w[0] < w[1]));

    // el flow liberó sus shards intermedios y finales
    for node in &cluster.nodes {
        assert_eq!(node.agent.running(), 0);
        assert!(node.agent.store().is_empty());
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn sobrevive_a_la_caida_de_un_agente() {
    let cluster = Cluster::start("caida", 2, 1).await;
    let driver = cluster.driver(DriverConfig {
        max_poll_errors: 1000,
        ..fast_config()
    });
    let flow = sum_flow("lento", "sum");

    let killer = async {
        for _ in 0..300 {
            if cluster.nodes[1].agent.running() > 0 {
                cluster.kill(1);
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("agente-1 nunca recibió trabajo");
    };
    let (outcome, _) = tokio::join!(driver.run(&flow, CancellationToken::new()), killer);

    assert!(outcome.succeeded(), "error: {:?}", outcome.error);
    assert_eq!(sums(&outcome), expected_sums());
    assert!(outcome.events().any(|e| matches!(
        e,
        FlowEvent::PartitionFailed { agent, .. } if agent == "agente-1"
    )));

    // el coordinador ya lo sacó del pool
    let alive = cluster.coordinator.agents().await.unwrap();
    assert_eq!(alive.len(), 1);
    assert_eq!(alive[0].agent, "agente-0");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn gang_sin_capacidad_falla_sin_dejar_recursos_tomados() {
    let cluster = Cluster::start("gang", 2, 1).await;
    let driver = cluster.driver(DriverConfig {
        gang: true,
        resource_retries: 2,
        ..fast_config()
    });

    let mut flow = Flow::new("ancho");
    let src = flow
        .source(SourceSpec::Inline {
            partitions: vec![vec![json!(1)], vec![json!(2)], vec![json!(3)]],
        })
        .unwrap();
    flow.map(src, "identity").unwrap();

    let outcome = driver.run(&flow, CancellationToken::new()).await;
    assert_eq!(outcome.state, FlowState::Failed);
    let error = outcome.error.as_ref().unwrap();
    assert!(error.is_resource_exhaustion(), "error: {error}");

    let backoffs = outcome
        .events()
        .filter(|e| matches!(e, FlowEvent::ResourceBackoff { .. }))
        .count();
    assert_eq!(backoffs, 2);
    assert!(!outcome
        .events()
        .any(|e| matches!(e, FlowEvent::PartitionStarted { .. })));

    for node in &cluster.nodes {
        assert_eq!(node.agent.running(), 0);
    }
    for view in cluster.coordinator.agents().await.unwrap() {
        assert_eq!(view.active_grants, 0);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn un_reintento_da_el_mismo_resultado() {
    let limpio = Cluster::start("reintento_limpio", 2, 1).await;
    let esperado = limpio
        .driver(fast_config())
        .run(&sum_flow("identity", "sum"), CancellationToken::new())
        .await;
    assert!(esperado.succeeded());

    let flaky = Cluster::start("reintento_falla", 2, 1).await;
    let outcome = flaky
        .driver(fast_config())
        .run(&sum_flow("falla_una_vez", "sum"), CancellationToken::new())
        .await;
    assert!(outcome.succeeded(), "error: {:?}", outcome.error);
    assert!(outcome
        .events()
        .any(|e| matches!(e, FlowEvent::PartitionFailed { stage: 0, .. })));
    assert_eq!(sorted_records(&outcome), sorted_records(&esperado));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn entrada_corrupta_recomputa_el_stage_productor() {
    let limpio = Cluster::start("linaje_limpio", 2, 1).await;
    let esperado = limpio
        .driver(fast_config())
        .run(&sum_flow("identity", "suma_v"), CancellationToken::new())
        .await;
    assert!(esperado.succeeded());

    let corrupto = Cluster::start("linaje_corrupto", 2, 1).await;
    let outcome = corrupto
        .driver(fast_config())
        .run(&sum_flow("identity", "suma_v_corrupta_una_vez"), CancellationToken::new())
        .await;
    assert!(outcome.succeeded(), "error: {:?}", outcome.error);
    assert!(outcome
        .events()
        .any(|e| matches!(e, FlowEvent::StageRecomputed { stage: 0, .. })));
    assert_eq!(sorted_records(&outcome), sorted_records(&esperado));
    assert_eq!(sums(&outcome), expected_sums());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn agota_los_intentos_y_propaga_la_causa() {
    let cluster = Cluster::start("agotado", 1, 1).await;
    let driver = cluster.driver(fast_config());

    let mut flow = Flow::new("roto");
    let src = flow
        .source(SourceSpec::Inline {
            partitions: vec![vec![json!({"x": 1})]],
        })
        .unwrap();
    flow.map(src, "no_registrada").unwrap();

    let outcome = driver.run(&flow, CancellationToken::new()).await;
    assert_eq!(outcome.state, FlowState::Failed);
    let error = outcome.error.unwrap();
    let text = error.to_string();
    assert!(text.starts_with("stage 0 falló: partición 0 agotó 3 intentos"), "{text}");
    assert!(text.contains("no_registrada"), "{text}");
    let failures = outcome
        .events
        .iter()
        .filter(|r| matches!(r.event, FlowEvent::PartitionFailed { .. }))
        .count();
    assert_eq!(failures, 3);

    // el agente sólo corrió intentos fallidos y aun así se le liberó el flow
    let agent = &cluster.nodes[0].agent;
    for attempt in 0..3 {
        let assignment = format!("{}-s0-p0-a{attempt}", outcome.flow_id);
        assert!(agent.executor_status(&assignment).is_err(), "{assignment} sigue registrado");
    }
    assert!(agent.store().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cancelar_detiene_los_executors() {
    let cluster = Cluster::start("cancelar", 2, 1).await;
    let driver = cluster.driver(fast_config());
    let flow = sum_flow("lento", "sum");

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    let canceller = async {
        for _ in 0..300 {
            if cluster.nodes.iter().any(|n| n.agent.running() > 0) {
                trigger.cancel();
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("ningún executor arrancó");
    };
    let (outcome, _) = tokio::join!(driver.run(&flow, cancel), canceller);

    assert_eq!(outcome.state, FlowState::Failed);
    assert!(matches!(outcome.error.as_ref().map(|e| e.root()), Some(FlowError::Cancelled)));
    for view in cluster.coordinator.agents().await.unwrap() {
        assert_eq!(view.active_grants, 0);
    }
}

#[tokio::test]
async fn un_dag_invalido_no_pide_recursos() {
    let counting = Arc::new(Counting {
        inner: Coordinator::new(CoordinatorConfig::default()),
        requests: AtomicU32::new(0),
    });
    let driver = Driver::new(counting.clone(), Arc::new(StaticConnector::new()), fast_config());

    let outcome = driver.run(&Flow::new("vacío"), CancellationToken::new()).await;
    assert_eq!(outcome.state, FlowState::Failed);
    assert!(matches!(
        outcome.error.as_ref().map(|e| e.root()),
        Some(FlowError::Planning(_))
    ));
    assert_eq!(counting.requests.load(Ordering::SeqCst), 0);
    assert!(!outcome
        .events()
        .any(|e| matches!(e, FlowEvent::StageScheduled { .. })));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn modo_en_disco_da_el_mismo_resultado() {
    let cluster = Cluster::start("en_disco", 2, 1).await;
    let driver = cluster.driver(DriverConfig {
        mode: ModeSelection::OnDisk,
        ..fast_config()
    });
    let outcome = driver.run(&sum_flow("identity", "sum"), CancellationToken::new()).await;
    assert!(outcome.succeeded(), "error: {:?}", outcome.error);
    assert_eq!(sums(&outcome), expected_sums());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn agente_sin_slots_no_consume_intentos() {
    let cluster = Cluster::start("sin_slots", 1, 1).await;
    cluster.nodes[0].busy.store(5, Ordering::SeqCst);
    let driver = cluster.driver(fast_config());

    let outcome = driver.run(&sum_flow("identity", "sum"), CancellationToken::new()).await;
    assert!(outcome.succeeded(), "error: {:?}", outcome.error);
    assert_eq!(sums(&outcome), expected_sums());
    assert_eq!(cluster.nodes[0].busy.load(Ordering::SeqCst), 0);

    assert!(!outcome
        .events()
        .any(|e| matches!(e, FlowEvent::PartitionFailed { .. })));
    let backoffs = outcome
        .events()
        .filter(|e| matches!(e, FlowEvent::ResourceBackoff { .. }))
        .count();
    assert!(backoffs >= 5, "{backoffs} esperas");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn fuentes_independientes_corren_a_la_vez() {
    let cluster = Cluster::start("join", 2, 1).await;
    let driver = cluster.driver(fast_config());

    let mut flow = Flow::new("cruce");
    let users = flow
        .source(SourceSpec::Inline {
            partitions: vec![vec![
                json!({"id": 1, "nombre": "ana"}),
                json!({"id": 2, "nombre": "beto"}),
                json!({"id": 3, "nombre": "caro"}),
            ]],
        })
        .unwrap();
    let orders = flow
        .source(SourceSpec::Inline {
            partitions: vec![vec![
                json!({"id": 1, "total": 10}),
                json!({"id": 3, "total": 7}),
                json!({"id": 3, "total": 2}),
            ]],
        })
        .unwrap();
    let users = flow.map(users, "lento").unwrap();
    let orders = flow.map(orders, "lento").unwrap();
    flow.join(users, orders, "id", Some(1)).unwrap();

    let outcome = driver.run(&flow, CancellationToken::new()).await;
    assert!(outcome.succeeded(), "error: {:?}", outcome.error);
    assert_eq!(outcome.outputs.values().flatten().count(), 3);

    // los dos stages de origen arrancan antes de que termine cualquiera
    let events: Vec<&FlowEvent> = outcome.events().collect();
    let started: Vec<usize> = events
        .iter()
        .enumerate()
        .filter(|(_, e)| matches!(e, FlowEvent::PartitionStarted { stage: 0 | 1, .. }))
        .map(|(i, _)| i)
        .collect();
    let first_done = events
        .iter()
        .position(|e| matches!(e, FlowEvent::PartitionCompleted { .. }))
        .unwrap();
    assert_eq!(started.len(), 2);
    assert!(started.iter().all(|i| *i < first_done));
}
