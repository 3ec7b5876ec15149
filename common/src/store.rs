//! Shard Store: el gestor local de shards de un agente.
//!
//! Es la única estructura mutable compartida entre executors de la misma
//! máquina. Cada shard tiene un solo escritor (su executor) y cualquier número
//! de lectores; los lectores sólo ven shards en estado `Complete`.

use std::{
    collections::HashMap,
    fs::{self, File},
    io::{self, BufRead, BufReader, Cursor},
    path::{Path, PathBuf},
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::error::{FlowError, Result};
use crate::shard::{scan_meta, RecordIter, ShardKey, ShardLayout, ShardMeta, ShardState, VerifiedRecords};

#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub root: PathBuf,
    /// Cuota de memoria del agente para shards residentes.
    pub memory_quota: u64,
    /// Si está activo, los shards que no entran en la cuota quedan en disco.
    pub spill_to_disk: bool,
    /// Vida de los shards persistentes; `None` => hasta que se liberen.
    pub persistent_ttl: Option<Duration>,
}

#[derive(Debug, Clone)]
pub enum ShardHandle {
    Memory(Bytes),
    Disk(PathBuf),
}

impl ShardHandle {
    /// Los shards en disco se pueden releer; los de memoria se consideran de
    /// una sola pasada y ante un fallo se recomputan.
    pub fn replayable(&self) -> bool {
        matches!(self, ShardHandle::Disk(_))
    }

    pub fn open(&self) -> io::Result<Box<dyn BufRead + Send>> {
        match self {
            ShardHandle::Memory(bytes) => Ok(Box::new(Cursor::new(bytes.clone()))),
            ShardHandle::Disk(path) => Ok(Box::new(BufReader::new(File::open(path)?))),
        }
    }
}

struct ShardEntry {
    state: ShardState,
    persistent: bool,
    meta: Option<ShardMeta>,
    handle: Option<ShardHandle>,
    readers: u32,
    acks: u32,
    published_at: Option<DateTime<Utc>>,
}

impl ShardEntry {
    fn new(state: ShardState) -> Self {
        Self {
            state,
            persistent: false,
            meta: None,
            handle: None,
            readers: 0,
            acks: 0,
            published_at: None,
        }
    }

    fn resident_bytes(&self) -> u64 {
        match (&self.handle, &self.meta) {
            (Some(ShardHandle::Memory(_)), Some(meta)) => meta.bytes,
            _ => 0,
        }
    }
}

#[derive(Default)]
struct StoreInner {
    shards: HashMap<ShardKey, ShardEntry>,
    resident_bytes: u64,
}

#[derive(Clone)]
pub struct ShardStore {
    layout: ShardLayout,
    config: Arc<StoreConfig>,
    inner: Arc<Mutex<StoreInner>>,
}

impl ShardStore {
    pub fn open(config: StoreConfig) -> io::Result<Self> {
        let layout = ShardLayout::new(&config.root);
        fs::create_dir_all(layout.root())?;
        Ok(Self {
            layout,
            config: Arc::new(config),
            inner: Arc::new(Mutex::new(StoreInner::default())),
        })
    }

    pub fn layout(&self) -> &ShardLayout {
        &self.layout
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, StoreInner> {
        // un panic con el lock tomado no deja el mapa a medias: seguimos
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn resident_bytes(&self) -> u64 {
        self.lock().resident_bytes
    }

    pub fn state(&self, key: &ShardKey) -> Option<ShardState> {
        self.lock().shards.get(key).map(|e| e.state)
    }

    pub fn len(&self) -> usize {
        self.lock().shards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Reserva los shards que va a producir una asignación (Pending).
    pub fn reserve(&self, keys: &[ShardKey]) {
        let mut inner = self.lock();
        for key in keys {
            inner
                .shards
                .insert(key.clone(), ShardEntry::new(ShardState::Pending));
        }
    }

    /// Pending -> Writing: el executor empezó a escribir.
    pub fn begin_write(&self, keys: &[ShardKey]) {
        let mut inner = self.lock();
        for key in keys {
            let entry = inner
                .shards
                .entry(key.clone())
                .or_insert_with(|| ShardEntry::new(ShardState::Pending));
            if entry.state == ShardState::Pending {
                entry.state = ShardState::Writing;
            }
        }
    }

    /// Writing -> Complete. El archivo ya fue confirmado por el writer; acá se
    /// decide si el shard queda residente en memoria o en disco.
    pub fn publish(&self, meta: ShardMeta) -> Result<()> {
        let path = self.layout.path(&meta.key, meta.persistent);
        let keep_in_memory = match self.admit(&meta) {
            Ok(in_memory) => in_memory,
            Err(e) => {
                let _ = fs::remove_file(&path);
                return Err(e);
            }
        };

        let handle = if keep_in_memory {
            match fs::read(&path) {
                Ok(data) => {
                    let _ = fs::remove_file(&path);
                    ShardHandle::Memory(Bytes::from(data))
                }
                Err(e) => {
                    let mut inner = self.lock();
                    inner.resident_bytes = inner.resident_bytes.saturating_sub(meta.bytes);
                    if let Some(entry) = inner.shards.get_mut(&meta.key) {
                        entry.state = ShardState::Failed;
                    }
                    return Err(e.into());
                }
            }
        } else {
            ShardHandle::Disk(path)
        };

        self.install(meta, handle)
    }

    /// Decide dónde vive el shard y reserva su memoria. Sin spill, un shard
    /// que no entra en la cuota se rechaza y su entrada queda Failed.
    fn admit(&self, meta: &ShardMeta) -> Result<bool> {
        let mut inner = self.lock();
        let state = inner.shards.get(&meta.key).map(|e| e.state);
        if !matches!(state, Some(ShardState::Writing) | Some(ShardState::Pending)) {
            return Err(FlowError::ShardNotFound(meta.key.to_string()));
        }
        if meta.persistent {
            return Ok(false);
        }
        let used = inner.resident_bytes + meta.bytes;
        if used <= self.config.memory_quota {
            // reservamos antes de leer para que el conteo nunca se quede corto
            inner.resident_bytes = used;
            return Ok(true);
        }
        if self.config.spill_to_disk {
            return Ok(false);
        }
        warn!(
            "shard {} no cabe en memoria ({} de {} bytes) y el spill está desactivado",
            meta.key, used, self.config.memory_quota
        );
        if let Some(entry) = inner.shards.get_mut(&meta.key) {
            entry.state = ShardState::Failed;
        }
        Err(FlowError::MemoryBudgetExceeded {
            used,
            budget: self.config.memory_quota,
        })
    }

    /// Instala el handle solo si la entrada sigue viva; si entre medias la
    /// liberaron o descartaron, devuelve la reserva y borra el fichero.
    fn install(&self, meta: ShardMeta, handle: ShardHandle) -> Result<()> {
        let mut inner = self.lock();
        let live = matches!(
            inner.shards.get(&meta.key).map(|e| e.state),
            Some(ShardState::Writing) | Some(ShardState::Pending)
        );
        if !live {
            if let ShardHandle::Memory(_) = handle {
                inner.resident_bytes = inner.resident_bytes.saturating_sub(meta.bytes);
            }
            drop(inner);
            if let ShardHandle::Disk(path) = &handle {
                let _ = fs::remove_file(path);
            }
            debug!("shard {} retirado antes de publicarse", meta.key);
            return Err(FlowError::ShardNotFound(meta.key.to_string()));
        }

        let in_memory = matches!(handle, ShardHandle::Memory(_));
        debug!(
            "shard {} completo ({} registros, {} bytes, {})",
            meta.key,
            meta.records,
            meta.bytes,
            if in_memory { "memoria" } else { "disco" }
        );
        let Some(entry) = inner.shards.get_mut(&meta.key) else {
            return Err(FlowError::ShardNotFound(meta.key.to_string()));
        };
        entry.state = ShardState::Complete;
        entry.persistent = meta.persistent;
        entry.handle = Some(handle);
        entry.meta = Some(meta);
        entry.published_at = Some(Utc::now());
        Ok(())
    }

    /// Marca los shards como Failed y borra cualquier salida parcial.
    pub fn discard(&self, keys: &[ShardKey]) {
        let mut inner = self.lock();
        for key in keys {
            let freed = inner.shards.get(key).map(|e| e.resident_bytes()).unwrap_or(0);
            inner.resident_bytes = inner.resident_bytes.saturating_sub(freed);
            if let Some(entry) = inner.shards.get_mut(key) {
                entry.state = ShardState::Failed;
                entry.handle = None;
                entry.meta = None;
            }
            for persistent in [false, true] {
                let path = self.layout.path(key, persistent);
                let _ = fs::remove_file(path.with_extension("jsonl.tmp"));
                let _ = fs::remove_file(&path);
            }
        }
    }

    /// Handle y metadatos de un shard completo. Cualquier otro estado es error:
    /// un lector nunca ve un shard a medio escribir.
    pub fn locate(&self, key: &ShardKey) -> Result<(ShardHandle, ShardMeta)> {
        let inner = self.lock();
        match inner.shards.get(key) {
            Some(ShardEntry {
                state: ShardState::Complete,
                handle: Some(handle),
                meta: Some(meta),
                ..
            }) => Ok((handle.clone(), meta.clone())),
            Some(entry) if entry.state == ShardState::Failed => {
                Err(FlowError::ShardNotFound(key.to_string()))
            }
            Some(_) => Err(FlowError::ShardNotReady(key.to_string())),
            None => Err(FlowError::ShardNotFound(key.to_string())),
        }
    }

    /// Lectura local verificada contra los metadatos del productor.
    pub fn read(&self, key: &ShardKey) -> Result<RecordIter<'static>> {
        let (handle, meta) = self.locate(key)?;
        Ok(Box::new(VerifiedRecords::new(handle.open()?, meta)))
    }

    pub fn register_readers(&self, key: &ShardKey, readers: u32) {
        if let Some(entry) = self.lock().shards.get_mut(key) {
            entry.readers += readers;
        }
    }

    /// Un lector registrado terminó con el shard. Devuelve `true` si el shard
    /// se liberó (todos los lectores terminaron y no es persistente).
    pub fn ack_read(&self, key: &ShardKey) -> bool {
        let evict = {
            let mut inner = self.lock();
            match inner.shards.get_mut(key) {
                Some(entry) => {
                    entry.acks += 1;
                    !entry.persistent && entry.readers > 0 && entry.acks >= entry.readers
                }
                None => false,
            }
        };
        if evict {
            self.evict(key);
        }
        evict
    }

    /// Liberación explícita (por ejemplo, de un shard persistente).
    pub fn release(&self, key: &ShardKey) -> bool {
        self.evict(key)
    }

    /// Libera los shards de un flow terminado. Los persistentes sólo si se pide.
    pub fn release_flow(&self, flow_id: &str, include_persistent: bool) -> usize {
        let keys: Vec<ShardKey> = {
            let inner = self.lock();
            inner
                .shards
                .iter()
                .filter(|(k, e)| k.flow_id == flow_id && (include_persistent || !e.persistent))
                .map(|(k, _)| k.clone())
                .collect()
        };
        for key in &keys {
            self.evict(key);
        }
        let _ = fs::remove_dir_all(self.layout.flow_tmp_dir(flow_id));
        if include_persistent {
            let _ = fs::remove_dir_all(self.layout.persistent_root().join(flow_id));
        }
        if !keys.is_empty() {
            info!("flow {}: liberados {} shards", flow_id, keys.len());
        }
        keys.len()
    }

    /// Borra los shards persistentes cuyo TTL venció.
    pub fn sweep_expired(&self, now: DateTime<Utc>) -> usize {
        let Some(ttl) = self.config.persistent_ttl else {
            return 0;
        };
        let Ok(ttl) = chrono::Duration::from_std(ttl) else {
            return 0;
        };
        let expired: Vec<ShardKey> = {
            let inner = self.lock();
            inner
                .shards
                .iter()
                .filter(|(_, e)| {
                    e.persistent && e.published_at.is_some_and(|t| t + ttl <= now)
                })
                .map(|(k, _)| k.clone())
                .collect()
        };
        for key in &expired {
            self.evict(key);
        }
        expired.len()
    }

    fn evict(&self, key: &ShardKey) -> bool {
        let removed = {
            let mut inner = self.lock();
            let removed = inner.shards.remove(key);
            if let Some(entry) = &removed {
                inner.resident_bytes = inner.resident_bytes.saturating_sub(entry.resident_bytes());
            }
            removed
        };
        match removed {
            Some(entry) => {
                if let Some(ShardHandle::Disk(path)) = entry.handle {
                    let _ = fs::remove_file(path);
                }
                debug!("shard {} liberado", key);
                true
            }
            None => false,
        }
    }

    /// Vuelve a registrar los shards persistentes que quedaron en disco de una
    /// ejecución anterior del agente. Los `.tmp` huérfanos se borran.
    pub fn recover(&self) -> io::Result<usize> {
        let mut files = Vec::new();
        collect_files(&self.layout.persistent_root(), &mut files)?;

        let mut recovered = 0;
        for path in files {
            if path.extension().is_some_and(|e| e == "tmp") {
                let _ = fs::remove_file(&path);
                continue;
            }
            let Some(key) = self.layout.parse_persistent(&path) else {
                continue;
            };
            match scan_meta(&path, key.clone(), true) {
                Ok(meta) => {
                    let mut inner = self.lock();
                    let mut entry = ShardEntry::new(ShardState::Complete);
                    entry.persistent = true;
                    entry.handle = Some(ShardHandle::Disk(path));
                    entry.meta = Some(meta);
                    entry.published_at = Some(Utc::now());
                    inner.shards.insert(key, entry);
                    recovered += 1;
                }
                Err(e) => warn!("no se pudo recuperar {}: {}", path.display(), e),
            }
        }
        Ok(recovered)
    }
}

fn collect_files(dir: &Path, out: &mut Vec<PathBuf>) -> io::Result<()> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e),
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            collect_files(&path, out)?;
        } else {
            out.push(path);
        }
    }
    Ok(())
}
