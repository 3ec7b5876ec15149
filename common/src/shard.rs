//! Shards: la realización física de una partición de un dataset.
//!
//! Formato: JSON Lines, un registro por línea. Un writer escribe a
//! `<ruta>.tmp` y sólo renombra al confirmar, así que nadie puede leer un
//! shard a medio escribir desde su ruta final.

use std::{
    fmt,
    fs::{self, File},
    io::{self, BufRead, BufWriter, Write},
    path::{Path, PathBuf},
    pin::Pin,
};

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufRead, AsyncBufReadExt};

use crate::error::{FlowError, Result};
use crate::{DatasetId, FlowId, Record, StepId};

/// Secuencia perezosa, finita y de una sola pasada.
pub type RecordIter<'a> = Box<dyn Iterator<Item = Result<Record>> + Send + 'a>;

/// Bytes JSONL de un shard que llegan de a trozos, del disco o de la red.
pub type ShardBody = Pin<Box<dyn AsyncBufRead + Send>>;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ShardKey {
    pub flow_id: FlowId,
    pub dataset: DatasetId,
    pub partition: u32,
    pub attempt: u32,
    /// Paso que consume este bucket (sólo en salidas de shuffle).
    #[serde(default)]
    pub shuffle: Option<StepId>,
    #[serde(default)]
    pub bucket: Option<u32>,
}

impl ShardKey {
    pub fn whole(flow_id: &str, dataset: DatasetId, partition: u32, attempt: u32) -> Self {
        Self {
            flow_id: flow_id.to_string(),
            dataset,
            partition,
            attempt,
            shuffle: None,
            bucket: None,
        }
    }

    pub fn bucketed(
        flow_id: &str,
        dataset: DatasetId,
        partition: u32,
        attempt: u32,
        shuffle: StepId,
        bucket: u32,
    ) -> Self {
        Self {
            shuffle: Some(shuffle),
            bucket: Some(bucket),
            ..Self::whole(flow_id, dataset, partition, attempt)
        }
    }

    fn split_name(&self) -> String {
        match (self.shuffle, self.bucket) {
            (Some(s), Some(b)) => format!("s{s}-b{b}"),
            _ => "whole".to_string(),
        }
    }

    fn file_name(&self) -> String {
        format!("{}.a{}.jsonl", self.split_name(), self.attempt)
    }
}

impl fmt::Display for ShardKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}/{}",
            self.flow_id,
            self.dataset,
            self.partition,
            self.file_name()
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ShardState {
    Pending,
    Writing,
    Complete,
    Failed,
}

/// Lo que el productor sabe de un shard confirmado. Los lectores lo usan
/// para detectar lecturas truncadas.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardMeta {
    pub key: ShardKey,
    pub records: u64,
    pub bytes: u64,
    #[serde(default)]
    pub persistent: bool,
}

/// Layout en disco: `<root>/{tmp|persistent}/<flow>/<dataset>/<partition>/<archivo>`.
#[derive(Debug, Clone)]
pub struct ShardLayout {
    root: PathBuf,
}

impl ShardLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path(&self, key: &ShardKey, persistent: bool) -> PathBuf {
        let area = if persistent { "persistent" } else { "tmp" };
        self.root
            .join(area)
            .join(&key.flow_id)
            .join(key.dataset.to_string())
            .join(key.partition.to_string())
            .join(key.file_name())
    }

    pub fn persistent_root(&self) -> PathBuf {
        self.root.join("persistent")
    }

    pub fn flow_tmp_dir(&self, flow_id: &str) -> PathBuf {
        self.root.join("tmp").join(flow_id)
    }

    pub fn spill_dir(&self, assignment_id: &str) -> PathBuf {
        self.root.join("spill").join(assignment_id)
    }

    /// Inversa de `path` para shards persistentes; `None` si no es un shard.
    pub fn parse_persistent(&self, path: &Path) -> Option<ShardKey> {
        let rel = path.strip_prefix(self.persistent_root()).ok()?;
        let parts: Vec<&str> = rel.iter().filter_map(|c| c.to_str()).collect();
        let [flow_id, dataset, partition, file] = parts.as_slice() else {
            return None;
        };
        let stem = file.strip_suffix(".jsonl")?;
        let (split, attempt) = stem.rsplit_once(".a")?;
        let mut key = ShardKey::whole(
            flow_id,
            dataset.parse().ok()?,
            partition.parse().ok()?,
            attempt.parse().ok()?,
        );
        if split != "whole" {
            let (s, b) = split.strip_prefix('s')?.split_once("-b")?;
            key.shuffle = Some(s.parse().ok()?);
            key.bucket = Some(b.parse().ok()?);
        }
        Some(key)
    }
}

/// Writer de un único shard. Un solo escritor por shard.
pub struct ShardWriter {
    key: ShardKey,
    persistent: bool,
    tmp_path: PathBuf,
    final_path: PathBuf,
    writer: Option<BufWriter<File>>,
    records: u64,
    bytes: u64,
}

impl ShardWriter {
    pub fn create(layout: &ShardLayout, key: ShardKey, persistent: bool) -> Result<Self> {
        let final_path = layout.path(&key, persistent);
        if let Some(parent) = final_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp_path = final_path.with_extension("jsonl.tmp");
        let writer = BufWriter::new(File::create(&tmp_path)?);
        Ok(Self {
            key,
            persistent,
            tmp_path,
            final_path,
            writer: Some(writer),
            records: 0,
            bytes: 0,
        })
    }

    pub fn key(&self) -> &ShardKey {
        &self.key
    }

    pub fn write(&mut self, record: &Record) -> Result<()> {
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| FlowError::ExecutorFailure(format!("writer de {} cerrado", self.key)))?;
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');
        writer.write_all(&line)?;
        self.records += 1;
        self.bytes += line.len() as u64;
        Ok(())
    }

    /// Flush + fsync + rename. Recién después el shard existe en su ruta final.
    pub fn commit(mut self) -> Result<ShardMeta> {
        if let Some(mut writer) = self.writer.take() {
            writer.flush()?;
            writer.get_ref().sync_all()?;
        }
        fs::rename(&self.tmp_path, &self.final_path)?;
        Ok(ShardMeta {
            key: self.key.clone(),
            records: self.records,
            bytes: self.bytes,
            persistent: self.persistent,
        })
    }
}

impl Drop for ShardWriter {
    fn drop(&mut self) {
        // writer sin confirmar: la salida parcial se descarta
        if self.writer.take().is_some() {
            let _ = fs::remove_file(&self.tmp_path);
        }
    }
}

/// Registros JSONL leídos de forma perezosa. Salta líneas vacías.
pub struct JsonlRecords<R> {
    reader: R,
    line: String,
    records: u64,
    bytes: u64,
    failed: bool,
}

impl<R: BufRead> JsonlRecords<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            line: String::new(),
            records: 0,
            bytes: 0,
            failed: false,
        }
    }

    pub fn records_read(&self) -> u64 {
        self.records
    }

    pub fn bytes_read(&self) -> u64 {
        self.bytes
    }
}

impl<R: BufRead> Iterator for JsonlRecords<R> {
    type Item = Result<Record>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        loop {
            self.line.clear();
            match self.reader.read_line(&mut self.line) {
                Ok(0) => return None,
                Ok(n) => {
                    self.bytes += n as u64;
                    if self.line.trim().is_empty() {
                        continue;
                    }
                    self.records += 1;
                    return Some(serde_json::from_str(self.line.trim_end()).map_err(|e| {
                        self.failed = true;
                        FlowError::from(e)
                    }));
                }
                Err(e) => {
                    self.failed = true;
                    return Some(Err(e.into()));
                }
            }
        }
    }
}

/// Lectura de un shard remoto o local que verifica, al llegar al final, que
/// se leyeron exactamente los registros y bytes que publicó el productor.
pub struct VerifiedRecords<R> {
    inner: JsonlRecords<R>,
    expected: ShardMeta,
    finished: bool,
}

impl<R: BufRead> VerifiedRecords<R> {
    pub fn new(reader: R, expected: ShardMeta) -> Self {
        Self {
            inner: JsonlRecords::new(reader),
            expected,
            finished: false,
        }
    }

    fn corruption(&self, reason: String) -> FlowError {
        FlowError::ShardCorruption {
            shard: self.expected.key.to_string(),
            reason,
        }
    }
}

impl<R: BufRead> Iterator for VerifiedRecords<R> {
    type Item = Result<Record>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        match self.inner.next() {
            Some(Ok(rec)) => Some(Ok(rec)),
            Some(Err(e)) => {
                self.finished = true;
                Some(Err(self.corruption(e.to_string())))
            }
            None => {
                self.finished = true;
                let (records, bytes) = (self.inner.records_read(), self.inner.bytes_read());
                if records != self.expected.records || bytes != self.expected.bytes {
                    Some(Err(self.corruption(format!(
                        "se leyeron {records} registros/{bytes} bytes, se esperaban {}/{}",
                        self.expected.records, self.expected.bytes
                    ))))
                } else {
                    None
                }
            }
        }
    }
}

/// Como `VerifiedRecords` pero sobre un cuerpo async: entrega cada registro
/// a `f` apenas se lee la línea y, al final, exige los registros y bytes
/// publicados.
pub async fn read_verified(
    mut body: ShardBody,
    expected: &ShardMeta,
    mut f: impl FnMut(Record),
) -> Result<()> {
    let corruption = |reason: String| FlowError::ShardCorruption {
        shard: expected.key.to_string(),
        reason,
    };
    let (mut records, mut bytes) = (0u64, 0u64);
    let mut line = String::new();
    loop {
        line.clear();
        let n = body
            .read_line(&mut line)
            .await
            .map_err(|e| corruption(e.to_string()))?;
        if n == 0 {
            break;
        }
        bytes += n as u64;
        if line.trim().is_empty() {
            continue;
        }
        records += 1;
        f(serde_json::from_str(line.trim_end()).map_err(|e| corruption(e.to_string()))?);
    }
    if records != expected.records || bytes != expected.bytes {
        return Err(corruption(format!(
            "se leyeron {records} registros/{bytes} bytes, se esperaban {}/{}",
            expected.records, expected.bytes
        )));
    }
    Ok(())
}

/// Cuenta registros y bytes de un archivo JSONL ya escrito (recuperación).
pub fn scan_meta(path: &Path, key: ShardKey, persistent: bool) -> io::Result<ShardMeta> {
    let reader = io::BufReader::new(File::open(path)?);
    let mut it = JsonlRecords::new(reader);
    for rec in it.by_ref() {
        rec.map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
    }
    Ok(ShardMeta {
        key,
        records: it.records_read(),
        bytes: it.bytes_read(),
        persistent,
    })
}
