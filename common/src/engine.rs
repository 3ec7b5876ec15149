//! Motor del executor: corre una partición de un stage.
//!
//! El flujo es siempre el mismo: se resuelve toda la lógica del stage, el head
//! produce registros (fuente, shard de entrada, shuffle o proceso externo), se
//! aplican los operadores fusionados y cada registro termina en las salidas
//! del stage. Nada queda visible hasta que todas las salidas se confirman.

use std::{
    cmp::Ordering,
    collections::{hash_map::DefaultHasher, BinaryHeap},
    fs::{self, File},
    hash::{Hash, Hasher},
    io::{self, BufReader, BufWriter, Write},
    path::{Path, PathBuf},
    process::{Command, Stdio},
    sync::atomic::{AtomicBool, Ordering as AtomicOrdering},
    thread,
};

use serde_json::{json, Value};
use tracing::{debug, info};

use crate::error::{FlowError, Result};
use crate::fetch::{open_verified, ShardFetcher};
use crate::logic::{FilterFn, FlatMapFn, LogicRegistry, MapFn, ReduceFn};
use crate::planner::{Operator, StageHead};
use crate::shard::{JsonlRecords, RecordIter, ShardLayout, ShardMeta, ShardWriter};
use crate::source::{Sink, Source};
use crate::task::{ExecutionMode, ExecutorReport, ExecutorTask, InputShard};
use crate::Record;

pub fn run_task(
    task: &ExecutorTask,
    registry: &LogicRegistry,
    fetcher: &dyn ShardFetcher,
    cancel: &AtomicBool,
) -> Result<ExecutorReport> {
    // primero la lógica: un id desconocido falla antes de leer nada
    let ops = compile_ops(&task.stage.ops, registry)?;
    let reducer = match &task.stage.head {
        StageHead::ReduceBy { logic, .. } => Some(registry.reducer(logic)?),
        _ => None,
    };

    let layout = ShardLayout::new(&task.store_root);
    let spill = SpillDir::new(layout.spill_dir(&task.assignment_id));
    let mut outputs = Outputs::open(task, &layout)?;
    let mut records_in = 0u64;
    let mut records_out = 0u64;

    {
        let mut emit = |rec: Record| -> Result<()> {
            apply_ops(&ops, rec, &mut |out| {
                records_out += 1;
                outputs.write(out)
            })
        };

        let input = |i: usize| chain_inputs(input_shards(task, i), fetcher);

        match &task.stage.head {
            StageHead::Source { source } => {
                let records = source.open_partition(task.partition)?;
                for rec in guarded(records, cancel, &mut records_in) {
                    emit(rec?)?;
                }
            }
            StageHead::Read { .. } => {
                for rec in guarded(input(0), cancel, &mut records_in) {
                    emit(rec?)?;
                }
            }
            StageHead::Pipe { command, args, .. } => {
                let records = guarded(input(0), cancel, &mut records_in);
                run_pipe(command, args, records, &mut emit)?;
            }
            StageHead::Sort {
                key, descending, ..
            } => {
                let mut sorter = ExternalSorter::new(task.mode, task.memory_budget, spill.path("sort"), *descending);
                for rec in guarded(input(0), cancel, &mut records_in) {
                    let rec = rec?;
                    let k = rec.get(key.as_str()).cloned().unwrap_or(Value::Null);
                    sorter.push(k, rec)?;
                }
                for item in sorter.finish()? {
                    let (_, rec) = item?;
                    check_cancel(cancel)?;
                    emit(rec)?;
                }
            }
            StageHead::ReduceBy { key, .. } => {
                let reducer = reducer
                    .as_ref()
                    .ok_or_else(|| FlowError::ExecutorFailure("reduce sin reducer".into()))?;
                let mut sorter = ExternalSorter::new(task.mode, task.memory_budget, spill.path("reduce"), false);
                for rec in guarded(input(0), cancel, &mut records_in) {
                    let rec = rec?;
                    // registros sin clave no participan del reduce
                    if let Some(k) = rec.get(key.as_str()).cloned() {
                        sorter.push(k, rec)?;
                    }
                }
                reduce_sorted(sorter.finish()?, key, reducer, &mut emit)?;
            }
            StageHead::Join { key, .. } => {
                let budget = task.memory_budget / 2;
                let mut left = ExternalSorter::new(task.mode, budget, spill.path("left"), false);
                let mut right = ExternalSorter::new(task.mode, budget, spill.path("right"), false);
                for (side, sorter) in [(0, &mut left), (1, &mut right)] {
                    for rec in guarded(input(side), cancel, &mut records_in) {
                        let rec = rec?;
                        if let Some(k) = rec.get(key.as_str()).cloned() {
                            sorter.push(k, rec)?;
                        }
                    }
                }
                merge_join(left.finish()?, right.finish()?, key, &mut emit)?;
            }
        }
    }

    check_cancel(cancel)?;
    let metas = outputs.commit()?;
    info!(
        "executor {}: stage {} partición {} ok ({} registros in, {} out)",
        task.assignment_id, task.stage.id, task.partition, records_in, records_out
    );
    Ok(ExecutorReport {
        assignment_id: task.assignment_id.clone(),
        outputs: metas,
        records_in,
        records_out,
    })
}

/* =========================
   Operadores fusionados
   ========================= */

enum CompiledOp {
    Map(MapFn),
    FlatMap(FlatMapFn),
    Filter(FilterFn),
}

fn compile_ops(ops: &[Operator], registry: &LogicRegistry) -> Result<Vec<CompiledOp>> {
    ops.iter()
        .map(|op| {
            Ok(match op {
                Operator::Map { logic } => CompiledOp::Map(registry.map(logic)?),
                Operator::FlatMap { logic } => CompiledOp::FlatMap(registry.flat_map(logic)?),
                Operator::Filter { logic } => CompiledOp::Filter(registry.filter(logic)?),
            })
        })
        .collect()
}

/// Aplica la cadena de operadores a un registro; cada resultado va a `out`.
fn apply_ops(
    ops: &[CompiledOp],
    rec: Record,
    out: &mut dyn FnMut(Record) -> Result<()>,
) -> Result<()> {
    let Some((first, rest)) = ops.split_first() else {
        return out(rec);
    };
    match first {
        CompiledOp::Map(f) => apply_ops(rest, f(&rec)?, out),
        CompiledOp::Filter(f) => {
            if f(&rec) {
                apply_ops(rest, rec, out)
            } else {
                Ok(())
            }
        }
        CompiledOp::FlatMap(f) => {
            for r in f(&rec)? {
                apply_ops(rest, r, out)?;
            }
            Ok(())
        }
    }
}

/* =========================
   Entradas
   ========================= */

fn input_shards(task: &ExecutorTask, i: usize) -> &[InputShard] {
    task.inputs.get(i).map(Vec::as_slice).unwrap_or(&[])
}

/// Concatena los shards de una entrada, abriendo cada uno recién cuando el
/// anterior se terminó.
fn chain_inputs<'a>(shards: &'a [InputShard], fetcher: &'a dyn ShardFetcher) -> RecordIter<'a> {
    Box::new(shards.iter().flat_map(move |input| -> RecordIter<'a> {
        match open_verified(fetcher, input) {
            Ok(records) => records,
            Err(e) => Box::new(std::iter::once(Err(e))),
        }
    }))
}

/// Cuenta los registros leídos y corta con `Cancelled` si se pidió cancelar.
fn guarded<'a>(
    records: RecordIter<'a>,
    cancel: &'a AtomicBool,
    count: &'a mut u64,
) -> impl Iterator<Item = Result<Record>> + Send + 'a {
    records.map(move |rec| {
        check_cancel(cancel)?;
        *count += 1;
        rec
    })
}

fn check_cancel(cancel: &AtomicBool) -> Result<()> {
    if cancel.load(AtomicOrdering::Relaxed) {
        Err(FlowError::Cancelled)
    } else {
        Ok(())
    }
}

/* =========================
   Salidas
   ========================= */

struct BucketWriters {
    key: String,
    writers: Vec<ShardWriter>,
}

struct Outputs {
    whole: Option<ShardWriter>,
    buckets: Vec<BucketWriters>,
    sink: Option<Box<dyn Sink>>,
}

impl Outputs {
    fn open(task: &ExecutorTask, layout: &ShardLayout) -> Result<Self> {
        let stage = &task.stage;
        let persistent = stage.persistent;
        let mut whole = None;
        let mut buckets = Vec::new();

        if let Some(dataset) = stage.output {
            let key = |bucket: Option<(u32, u32)>| {
                let mut k = crate::ShardKey::whole(&task.flow_id, dataset, task.partition, task.attempt);
                if let Some((shuffle, b)) = bucket {
                    k.shuffle = Some(shuffle);
                    k.bucket = Some(b);
                }
                k
            };
            if stage.write_whole {
                whole = Some(ShardWriter::create(layout, key(None), persistent)?);
            }
            for sw in &stage.shuffle_writes {
                let writers = (0..sw.buckets)
                    .map(|b| ShardWriter::create(layout, key(Some((sw.shuffle, b))), persistent))
                    .collect::<Result<Vec<_>>>()?;
                buckets.push(BucketWriters {
                    key: sw.key.clone(),
                    writers,
                });
            }
        }

        let sink = match &stage.sink {
            Some(spec) => Some(spec.open(task.partition, task.attempt)?),
            None => None,
        };
        Ok(Self {
            whole,
            buckets,
            sink,
        })
    }

    fn write(&mut self, rec: Record) -> Result<()> {
        if let Some(w) = self.whole.as_mut() {
            w.write(&rec)?;
        }
        for group in &mut self.buckets {
            let key = rec.get(group.key.as_str()).map(key_text).unwrap_or_default();
            let idx = hash_key_to_partition(&key, group.writers.len() as u32) as usize;
            group.writers[idx].write(&rec)?;
        }
        if let Some(sink) = self.sink.as_mut() {
            sink.write_record(&rec)?;
        }
        Ok(())
    }

    /// Confirma todas las salidas. Si algo falla, lo que no se confirmó se
    /// descarta al soltar los writers y el agente descarta el resto.
    fn commit(self) -> Result<Vec<ShardMeta>> {
        let mut metas = Vec::new();
        if let Some(w) = self.whole {
            metas.push(w.commit()?);
        }
        for group in self.buckets {
            for w in group.writers {
                metas.push(w.commit()?);
            }
        }
        if let Some(sink) = self.sink {
            sink.close()?;
        }
        Ok(metas)
    }
}

/// Texto con el que se hashea una clave: los strings tal cual, el resto en
/// forma canónica. Dos claves iguales según `compare_values` dan el mismo texto.
fn key_text(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => {
            let mut out = String::new();
            canonical_text(other, &mut out);
            out
        }
    }
}

fn canonical_text(v: &Value, out: &mut String) {
    match v {
        Value::Number(n) => match canonical_number(n) {
            Num::Int(i) => out.push_str(&i.to_string()),
            Num::Float(f) => out.push_str(&f.to_string()),
        },
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                canonical_text(item, out);
            }
            out.push(']');
        }
        Value::Object(map) => {
            out.push('{');
            for (i, (k, item)) in map.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(k.clone()).to_string());
                out.push(':');
                canonical_text(item, out);
            }
            out.push('}');
        }
        other => out.push_str(&other.to_string()),
    }
}

/// Forma canónica de un número JSON: todo valor entero (aunque venga como
/// `1.0` o no quepa en i64) es `Int`; el resto, `Float`.
#[derive(Debug, Clone, Copy, PartialEq)]
enum Num {
    Int(i128),
    Float(f64),
}

const I128_LIMIT: f64 = 1.7014118346046923e38; // 2^127

fn canonical_number(n: &serde_json::Number) -> Num {
    if let Some(i) = n.as_i64() {
        return Num::Int(i as i128);
    }
    if let Some(u) = n.as_u64() {
        return Num::Int(u as i128);
    }
    let f = n.as_f64().unwrap_or(0.0);
    if f.fract() == 0.0 && f.abs() < I128_LIMIT {
        Num::Int(f as i128)
    } else {
        Num::Float(f)
    }
}

fn compare_numbers(a: Num, b: Num) -> Ordering {
    match (a, b) {
        (Num::Int(x), Num::Int(y)) => x.cmp(&y),
        (Num::Float(x), Num::Float(y)) => x.partial_cmp(&y).unwrap_or(Ordering::Equal),
        (Num::Int(x), Num::Float(y)) => int_vs_float(x, y),
        (Num::Float(x), Num::Int(y)) => int_vs_float(y, x).reverse(),
    }
}

// `f` nunca es entero representable en i128, así que no hay empate
fn int_vs_float(i: i128, f: f64) -> Ordering {
    if f >= I128_LIMIT {
        Ordering::Less
    } else if f <= -I128_LIMIT {
        Ordering::Greater
    } else if i <= f.floor() as i128 {
        Ordering::Less
    } else {
        Ordering::Greater
    }
}

pub fn hash_key_to_partition(key: &str, num_partitions: u32) -> u32 {
    let mut h = DefaultHasher::new();
    key.hash(&mut h);
    (h.finish() % num_partitions.max(1) as u64) as u32
}

/* =========================
   Orden total sobre valores JSON
   ========================= */

fn type_rank(v: &Value) -> u8 {
    match v {
        Value::Null => 0,
        Value::Bool(_) => 1,
        Value::Number(_) => 2,
        Value::String(_) => 3,
        Value::Array(_) => 4,
        Value::Object(_) => 5,
    }
}

/// null < bool < número < string < array < objeto; dentro de cada tipo, el
/// orden natural.
pub fn compare_values(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Number(x), Value::Number(y)) => {
            compare_numbers(canonical_number(x), canonical_number(y))
        }
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Array(x), Value::Array(y)) => {
            for (l, r) in x.iter().zip(y) {
                let ord = compare_values(l, r);
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            x.len().cmp(&y.len())
        }
        (Value::Object(x), Value::Object(y)) => {
            for ((lk, lv), (rk, rv)) in x.iter().zip(y) {
                let ord = lk.cmp(rk).then_with(|| compare_values(lv, rv));
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            x.len().cmp(&y.len())
        }
        _ => type_rank(a).cmp(&type_rank(b)),
    }
}

/* =========================
   Sort externo
   ========================= */

type SortedIter = Box<dyn Iterator<Item = Result<(Value, Record)>> + Send>;

/// Ordena pares (clave, registro) con un working set acotado en bytes.
///
/// En `InMemory` pasarse del presupuesto es `MemoryBudgetExceeded`; en
/// `OnDisk` el buffer se ordena y se vuelca como run, y al final los runs se
/// mezclan (k-way). El orden es estable: a igual clave, orden de llegada.
struct ExternalSorter {
    mode: ExecutionMode,
    budget: u64,
    dir: PathBuf,
    descending: bool,
    buffer: Vec<(Value, u64, Record)>,
    used: u64,
    seq: u64,
    runs: Vec<PathBuf>,
}

impl ExternalSorter {
    fn new(mode: ExecutionMode, budget: u64, dir: PathBuf, descending: bool) -> Self {
        Self {
            mode,
            budget,
            dir,
            descending,
            buffer: Vec::new(),
            used: 0,
            seq: 0,
            runs: Vec::new(),
        }
    }

    fn push(&mut self, key: Value, rec: Record) -> Result<()> {
        let size = (serde_json::to_vec(&rec)?.len() + serde_json::to_vec(&key)?.len()) as u64;
        if self.used + size > self.budget {
            match self.mode {
                ExecutionMode::InMemory => {
                    return Err(FlowError::MemoryBudgetExceeded {
                        used: self.used + size,
                        budget: self.budget,
                    })
                }
                ExecutionMode::OnDisk => self.spill_run()?,
            }
        }
        self.buffer.push((key, self.seq, rec));
        self.seq += 1;
        self.used += size;
        Ok(())
    }

    fn sort_buffer(&mut self) {
        let descending = self.descending;
        self.buffer.sort_by(|a, b| {
            let ord = compare_values(&a.0, &b.0);
            let ord = if descending { ord.reverse() } else { ord };
            ord.then(a.1.cmp(&b.1))
        });
    }

    fn spill_run(&mut self) -> Result<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        self.sort_buffer();
        fs::create_dir_all(&self.dir)?;
        let path = self.dir.join(format!("run-{}.jsonl", self.runs.len()));
        let mut writer = BufWriter::new(File::create(&path)?);
        for (k, seq, r) in self.buffer.drain(..) {
            serde_json::to_writer(&mut writer, &json!({ "k": k, "s": seq, "r": r }))?;
            writer.write_all(b"\n")?;
        }
        writer.flush()?;
        debug!("spill de run {} ({} bytes)", path.display(), self.used);
        self.runs.push(path);
        self.used = 0;
        Ok(())
    }

    fn finish(mut self) -> Result<SortedIter> {
        if self.runs.is_empty() {
            self.sort_buffer();
            return Ok(Box::new(self.buffer.into_iter().map(|(k, _, r)| Ok((k, r)))));
        }
        self.spill_run()?;
        let runs = self
            .runs
            .iter()
            .map(|p| Ok(JsonlRecords::new(BufReader::new(File::open(p)?))))
            .collect::<io::Result<Vec<_>>>()?;
        RunMerger::new(runs, self.descending)
    }
}

struct HeapItem {
    key: Value,
    seq: u64,
    rec: Record,
    run: usize,
    descending: bool,
}

impl HeapItem {
    fn order(&self, other: &Self) -> Ordering {
        let ord = compare_values(&self.key, &other.key);
        let ord = if self.descending { ord.reverse() } else { ord };
        ord.then(self.seq.cmp(&other.seq))
    }
}

impl PartialEq for HeapItem {
    fn eq(&self, other: &Self) -> bool {
        self.order(other) == Ordering::Equal
    }
}

impl Eq for HeapItem {}

impl PartialOrd for HeapItem {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapItem {
    // BinaryHeap es de máximos: invertimos para sacar siempre el menor
    fn cmp(&self, other: &Self) -> Ordering {
        other.order(self)
    }
}

type RunReader = JsonlRecords<BufReader<File>>;

struct RunMerger {
    runs: Vec<RunReader>,
    heap: BinaryHeap<HeapItem>,
    descending: bool,
    failed: bool,
}

impl RunMerger {
    fn new(runs: Vec<RunReader>, descending: bool) -> Result<SortedIter> {
        let mut merger = Self {
            runs,
            heap: BinaryHeap::new(),
            descending,
            failed: false,
        };
        for run in 0..merger.runs.len() {
            merger.refill(run)?;
        }
        Ok(Box::new(merger))
    }

    fn refill(&mut self, run: usize) -> Result<()> {
        let Some(line) = self.runs[run].next() else {
            return Ok(());
        };
        let mut line = line?;
        let seq = line.get("s").and_then(Value::as_u64).unwrap_or(0);
        self.heap.push(HeapItem {
            key: line.get_mut("k").map(Value::take).unwrap_or(Value::Null),
            seq,
            rec: line.get_mut("r").map(Value::take).unwrap_or(Value::Null),
            run,
            descending: self.descending,
        });
        Ok(())
    }
}

impl Iterator for RunMerger {
    type Item = Result<(Value, Record)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        let item = self.heap.pop()?;
        if let Err(e) = self.refill(item.run) {
            self.failed = true;
            return Some(Err(e));
        }
        Some(Ok((item.key, item.rec)))
    }
}

/// Directorio de spill de una asignación; se borra al terminar, falle o no.
struct SpillDir {
    root: PathBuf,
}

impl SpillDir {
    fn new(root: PathBuf) -> Self {
        Self { root }
    }

    fn path(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }
}

impl Drop for SpillDir {
    fn drop(&mut self) {
        let _ = fs::remove_dir_all(&self.root);
    }
}

/* =========================
   Reduce y join sobre entradas ordenadas
   ========================= */

fn reduce_sorted(
    sorted: SortedIter,
    key_field: &str,
    reducer: &ReduceFn,
    emit: &mut dyn FnMut(Record) -> Result<()>,
) -> Result<()> {
    let mut current: Option<(Value, Record)> = None;
    for item in sorted {
        let (k, rec) = item?;
        current = match current.take() {
            Some((ck, acc)) if compare_values(&ck, &k) == Ordering::Equal => {
                Some((ck, reducer(key_field, acc, &rec)?))
            }
            Some((_, acc)) => {
                emit(acc)?;
                Some((k, rec))
            }
            None => Some((k, rec)),
        };
    }
    if let Some((_, acc)) = current {
        emit(acc)?;
    }
    Ok(())
}

/// Siguiente grupo de registros con la misma clave de una entrada ordenada.
struct Groups {
    sorted: std::iter::Peekable<SortedIter>,
}

impl Groups {
    fn next_group(&mut self) -> Result<Option<(Value, Vec<Record>)>> {
        let Some(first) = self.sorted.next() else {
            return Ok(None);
        };
        let (key, rec) = first?;
        let mut group = vec![rec];
        while let Some(Ok((k, _))) = self.sorted.peek() {
            if compare_values(k, &key) != Ordering::Equal {
                break;
            }
            if let Some(Ok((_, rec))) = self.sorted.next() {
                group.push(rec);
            }
        }
        Ok(Some((key, group)))
    }
}

/// Inner join sort-merge. Con N registros a izquierda y M a derecha para la
/// misma clave salen N*M registros combinados.
fn merge_join(
    left: SortedIter,
    right: SortedIter,
    key_field: &str,
    emit: &mut dyn FnMut(Record) -> Result<()>,
) -> Result<()> {
    let mut left = Groups {
        sorted: left.peekable(),
    };
    let mut right = Groups {
        sorted: right.peekable(),
    };
    let mut l = left.next_group()?;
    let mut r = right.next_group()?;

    loop {
        let ord = match (&l, &r) {
            (Some((lk, _)), Some((rk, _))) => compare_values(lk, rk),
            _ => return Ok(()),
        };
        match ord {
            Ordering::Less => l = left.next_group()?,
            Ordering::Greater => r = right.next_group()?,
            Ordering::Equal => {
                if let (Some((_, lrecs)), Some((_, rrecs))) = (&l, &r) {
                    for lrec in lrecs {
                        for rrec in rrecs {
                            emit(merge_records(lrec, rrec, key_field))?;
                        }
                    }
                }
                l = left.next_group()?;
                r = right.next_group()?;
            }
        }
    }
}

/// Fusiona dos registros JSON en uno solo.
/// - el campo `key_field` se mantiene una sola vez
/// - si un campo existe en ambos lados, se respeta el del lado izquierdo
///   y el del derecho se guarda con prefijo `right_`.
fn merge_records(left: &Record, right: &Record, key_field: &str) -> Record {
    let mut obj = serde_json::Map::new();

    if let Some(lobj) = left.as_object() {
        for (k, v) in lobj {
            obj.insert(k.clone(), v.clone());
        }
    }

    if let Some(robj) = right.as_object() {
        for (k, v) in robj {
            if k == key_field {
                continue;
            }
            if obj.contains_key(k) {
                obj.insert(format!("right_{}", k), v.clone());
            } else {
                obj.insert(k.clone(), v.clone());
            }
        }
    }

    Value::Object(obj)
}

/* =========================
   Pipe a proceso externo
   ========================= */

/// Los registros van como JSONL al stdin del comando; cada línea de su stdout
/// es un registro de salida. Un exit code distinto de cero es un fallo.
fn run_pipe<I>(
    command: &str,
    args: &[String],
    input: I,
    emit: &mut dyn FnMut(Record) -> Result<()>,
) -> Result<()>
where
    I: Iterator<Item = Result<Record>> + Send,
{
    let mut child = Command::new(command)
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .spawn()
        .map_err(|e| FlowError::ExecutorFailure(format!("no se pudo lanzar `{command}`: {e}")))?;

    let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
        let _ = child.kill();
        return Err(FlowError::ExecutorFailure(format!("`{command}` sin stdin/stdout")));
    };

    let (read_result, feed_result) = thread::scope(|s| {
        let feeder = s.spawn(move || -> Result<()> {
            let mut writer = BufWriter::new(stdin);
            for rec in input {
                serde_json::to_writer(&mut writer, &rec?)?;
                writer.write_all(b"\n")?;
            }
            writer.flush()?;
            Ok(())
        });

        let read = || -> Result<()> {
            for rec in JsonlRecords::new(BufReader::new(stdout)) {
                emit(rec?)?;
            }
            Ok(())
        };
        let read_result = read();
        if read_result.is_err() {
            // que el feeder no quede bloqueado escribiendo a un proceso que nadie lee
            let _ = child.kill();
        }
        let feed_result = feeder
            .join()
            .unwrap_or_else(|_| Err(FlowError::ExecutorFailure("el hilo de entrada del pipe abortó".into())));
        (read_result, feed_result)
    });

    let status = child.wait()?;
    read_result?;
    match feed_result {
        // el comando puede terminar sin leer toda su entrada
        Err(FlowError::Io(e)) if e.kind() == io::ErrorKind::BrokenPipe => {}
        other => other?,
    }
    if !status.success() {
        return Err(FlowError::ExecutorFailure(format!("`{command}` terminó con {status}")));
    }
    Ok(())
}

/// Lee el JSON de una tarea desde disco (lo usa el binario `executor`).
pub fn read_task(path: &Path) -> Result<ExecutorTask> {
    let file = File::open(path)?;
    Ok(serde_json::from_reader(BufReader::new(file))?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch::StoreFetcher;
    use crate::planner::{plan, Stage};
    use crate::shard::ShardKey;
    use crate::source::{SinkSpec, SourceSpec};
    use crate::store::{ShardStore, StoreConfig};
    use crate::Flow;
    use std::{collections::HashMap, env};

    fn temp_dir(sub: &str) -> PathBuf {
        let base = env::temp_dir().join("engine_tests").join(sub);
        let _ = fs::remove_dir_all(&base);
        fs::create_dir_all(&base).unwrap();
        base
    }

    fn task(stage: Stage, partition: u32, inputs: Vec<Vec<InputShard>>, root: &Path) -> ExecutorTask {
        ExecutorTask {
            assignment_id: format!("t-{}-{}", stage.id, partition),
            flow_id: "f".into(),
            stage,
            partition,
            attempt: 0,
            inputs,
            mode: ExecutionMode::InMemory,
            memory_budget: 1 << 20,
            store_root: root.to_path_buf(),
        }
    }

    fn read_shard(root: &Path, meta: &ShardMeta) -> Vec<Record> {
        let path = ShardLayout::new(root).path(&meta.key, meta.persistent);
        JsonlRecords::new(BufReader::new(File::open(path).unwrap()))
            .map(|r| r.unwrap())
            .collect()
    }

    /// Guarda registros como un shard completo del store y devuelve la entrada.
    fn stored_input(store: &ShardStore, key: ShardKey, recs: &[Record]) -> InputShard {
        store.reserve(std::slice::from_ref(&key));
        store.begin_write(std::slice::from_ref(&key));
        let mut w = ShardWriter::create(store.layout(), key, false).unwrap();
        for r in recs {
            w.write(r).unwrap();
        }
        let meta = w.commit().unwrap();
        store.publish(meta.clone()).unwrap();
        InputShard {
            meta,
            agent: "a".into(),
            local_path: None,
        }
    }

    fn store(root: &Path) -> (ShardStore, StoreFetcher) {
        let store = ShardStore::open(StoreConfig {
            root: root.join("store"),
            memory_quota: 1 << 20,
            spill_to_disk: true,
            persistent_ttl: None,
        })
        .unwrap();
        let fetcher = StoreFetcher::new(HashMap::from([("a".to_string(), store.clone())]));
        (store, fetcher)
    }

    fn wordcount_graph(text: &[&str], reducers: u32) -> crate::ExecutionGraph {
        let mut flow = Flow::new("wc");
        let src = flow
            .source(SourceSpec::Inline {
                partitions: vec![text.iter().map(|t| json!({ "text": t })).collect()],
            })
            .unwrap();
        let tokens = flow.flat_map(src, "tokenize").unwrap();
        let clean = flow.filter(tokens, "non_empty_token").unwrap();
        flow.reduce_by(clean, "token", "sum", Some(reducers)).unwrap();
        plan(&flow).unwrap()
    }

    #[test]
    fn map_side_reparte_por_hash_de_la_clave() {
        let tmp = temp_dir("map_side");
        let graph = wordcount_graph(&["hola mundo", "hola"], 2);
        let t = task(graph.stages[0].clone(), 0, vec![], &tmp);

        let report = run_task(&t, &LogicRegistry::with_builtins(), &StoreFetcher::default(), &AtomicBool::new(false)).unwrap();
        assert_eq!(report.records_in, 2);
        assert_eq!(report.records_out, 3);
        assert_eq!(report.outputs.len(), 2);

        for meta in &report.outputs {
            for rec in read_shard(&tmp, meta) {
                let token = rec["token"].as_str().unwrap();
                assert_eq!(Some(hash_key_to_partition(token, 2)), meta.key.bucket);
            }
        }
        let total: u64 = report.outputs.iter().map(|m| m.records).sum();
        assert_eq!(total, 3);
    }

    #[test]
    fn reduce_by_suma_por_clave() {
        let tmp = temp_dir("reduce");
        let (store, fetcher) = store(&tmp);
        let graph = wordcount_graph(&[], 1);

        let a = stored_input(&store, ShardKey::bucketed("f", 2, 0, 0, 3, 0), &[
            json!({"token": "b", "count": 1}),
            json!({"token": "a", "count": 1}),
        ]);
        let b = stored_input(&store, ShardKey::bucketed("f", 2, 1, 0, 3, 0), &[
            json!({"token": "a", "count": 2}),
            json!({"count": 9}),
        ]);

        let t = task(graph.stages[1].clone(), 0, vec![vec![a, b]], &tmp);
        let report = run_task(&t, &LogicRegistry::with_builtins(), &fetcher, &AtomicBool::new(false)).unwrap();
        assert_eq!(report.records_in, 4);

        let out = read_shard(&tmp, &report.outputs[0]);
        assert_eq!(
            out,
            vec![json!({"token": "a", "count": 3}), json!({"token": "b", "count": 1})]
        );
    }

    #[test]
    fn sort_en_disco_es_igual_al_de_memoria_y_estable() {
        let tmp = temp_dir("sorter");
        let recs: Vec<Record> = (0..200)
            .map(|i| json!({ "k": (i * 7919) % 13, "i": i }))
            .collect();

        let sort_with = |mode, budget, sub: &str| -> Vec<Record> {
            let mut sorter = ExternalSorter::new(mode, budget, tmp.join(sub), true);
            for r in &recs {
                sorter.push(r["k"].clone(), r.clone()).unwrap();
            }
            sorter.finish().unwrap().map(|x| x.unwrap().1).collect()
        };

        let in_memory = sort_with(ExecutionMode::InMemory, 1 << 20, "mem");
        let on_disk = sort_with(ExecutionMode::OnDisk, 512, "disk");
        assert!(tmp.join("disk").join("run-1.jsonl").exists());
        assert_eq!(in_memory, on_disk);

        // descendente por clave y, a igual clave, en orden de llegada
        for pair in in_memory.windows(2) {
            let (a, b) = (&pair[0], &pair[1]);
            let (ka, kb) = (a["k"].as_i64().unwrap(), b["k"].as_i64().unwrap());
            assert!(ka > kb || (ka == kb && a["i"].as_i64() < b["i"].as_i64()));
        }
    }

    #[test]
    fn en_memoria_sin_presupuesto_falla() {
        let tmp = temp_dir("budget");
        let mut sorter = ExternalSorter::new(ExecutionMode::InMemory, 64, tmp.join("s"), false);
        let err = (0..10)
            .map(|i| sorter.push(json!(i), json!({ "padding": "xxxxxxxxxxxxxxxx", "i": i })))
            .find_map(|r| r.err())
            .unwrap();
        assert!(matches!(err, FlowError::MemoryBudgetExceeded { budget: 64, .. }));
    }

    #[test]
    fn join_combina_y_prefija_campos_del_lado_derecho() {
        let tmp = temp_dir("join");
        let (store, fetcher) = store(&tmp);

        let mut flow = Flow::new("j");
        let users = flow.source(SourceSpec::Inline { partitions: vec![vec![]] }).unwrap();
        let orders = flow.source(SourceSpec::Inline { partitions: vec![vec![]] }).unwrap();
        flow.join(users, orders, "id", Some(1)).unwrap();
        let graph = plan(&flow).unwrap();
        let join_stage = graph.stages[2].clone();

        let left = stored_input(&store, ShardKey::bucketed("f", 0, 0, 0, 2, 0), &[
            json!({"id": 1, "name": "ana"}),
            json!({"id": 2, "name": "beto"}),
        ]);
        let right = stored_input(&store, ShardKey::bucketed("f", 1, 0, 0, 2, 0), &[
            json!({"id": 1, "name": "pedido-a"}),
            json!({"id": 1, "total": 5}),
            json!({"id": 3, "total": 7}),
        ]);

        let t = task(join_stage, 0, vec![vec![left], vec![right]], &tmp);
        let report = run_task(&t, &LogicRegistry::with_builtins(), &fetcher, &AtomicBool::new(false)).unwrap();
        let out = read_shard(&tmp, &report.outputs[0]);
        assert_eq!(
            out,
            vec![
                json!({"id": 1, "name": "ana", "right_name": "pedido-a"}),
                json!({"id": 1, "name": "ana", "total": 5}),
            ]
        );
    }

    #[test]
    fn logica_desconocida_falla_antes_de_leer_entradas() {
        let tmp = temp_dir("unknown_logic");
        let mut flow = Flow::new("u");
        let src = flow.source(SourceSpec::Inline { partitions: vec![vec![json!({})]] }).unwrap();
        flow.map(src, "no_registrada").unwrap();
        let graph = plan(&flow).unwrap();

        let t = task(graph.stages[0].clone(), 0, vec![], &tmp);
        let err = run_task(&t, &LogicRegistry::with_builtins(), &StoreFetcher::default(), &AtomicBool::new(false)).unwrap_err();
        assert!(matches!(err, FlowError::UnknownLogic(id) if id == "no_registrada"));
        assert!(!tmp.join("tmp").exists());
    }

    #[test]
    fn entrada_truncada_es_shard_corruption() {
        let tmp = temp_dir("corrupt");
        let (store, fetcher) = store(&tmp);
        let graph = wordcount_graph(&[], 1);
        let mut input = stored_input(&store, ShardKey::bucketed("f", 2, 0, 0, 3, 0), &[
            json!({"token": "a", "count": 1}),
        ]);
        input.meta.records += 1;

        let t = task(graph.stages[1].clone(), 0, vec![vec![input]], &tmp);
        let err = run_task(&t, &LogicRegistry::with_builtins(), &fetcher, &AtomicBool::new(false)).unwrap_err();
        assert!(matches!(err, FlowError::ShardCorruption { .. }));
    }

    #[test]
    fn cancelacion_no_deja_salidas() {
        let tmp = temp_dir("cancel");
        let graph = wordcount_graph(&["a b c"], 1);
        let t = task(graph.stages[0].clone(), 0, vec![], &tmp);

        let err = run_task(&t, &LogicRegistry::with_builtins(), &StoreFetcher::default(), &AtomicBool::new(true)).unwrap_err();
        assert!(matches!(err, FlowError::Cancelled));
        let leftovers = fs::read_dir(tmp.join("tmp/f/2/0")).map(|d| d.count()).unwrap_or(0);
        assert_eq!(leftovers, 0);
    }

    #[test]
    fn sink_csv_escribe_token_count() {
        let tmp = temp_dir("sink");
        let out_dir = tmp.join("out");
        let mut flow = Flow::new("s");
        let src = flow
            .source(SourceSpec::Inline {
                partitions: vec![vec![json!({"text": "Hola hola"})]],
            })
            .unwrap();
        let tokens = flow.flat_map(src, "tokenize").unwrap();
        flow.sink(tokens, SinkSpec::CsvDir {
            dir: out_dir.to_string_lossy().to_string(),
            fields: vec!["token".into(), "count".into()],
        })
        .unwrap();
        let graph = plan(&flow).unwrap();

        let t = task(graph.stages[0].clone(), 0, vec![], &tmp);
        let report = run_task(&t, &LogicRegistry::with_builtins(), &StoreFetcher::default(), &AtomicBool::new(false)).unwrap();
        assert!(report.outputs.is_empty());
        assert_eq!(fs::read_to_string(out_dir.join("part-0.csv")).unwrap(), "hola,1\nhola,1\n");
    }

    #[cfg(unix)]
    #[test]
    fn pipe_pasa_registros_por_un_proceso_externo() {
        let tmp = temp_dir("pipe");
        let (store, fetcher) = store(&tmp);
        let mut flow = Flow::new("p");
        let src = flow.source(SourceSpec::Inline { partitions: vec![vec![]] }).unwrap();
        flow.pipe(src, "cat", &[]).unwrap();
        let graph = plan(&flow).unwrap();

        let recs = [json!({"x": 1}), json!({"x": 2})];
        let input = stored_input(&store, ShardKey::whole("f", 0, 0, 0), &recs);
        let t = task(graph.stages[1].clone(), 0, vec![vec![input.clone()]], &tmp);
        let report = run_task(&t, &LogicRegistry::with_builtins(), &fetcher, &AtomicBool::new(false)).unwrap();
        assert_eq!(read_shard(&tmp, &report.outputs[0]), recs.to_vec());

        let mut failing = graph.stages[1].clone();
        failing.head = StageHead::Pipe {
            input: graph.stages[1].head.inputs()[0].clone(),
            command: "sh".into(),
            args: vec!["-c".into(), "cat > /dev/null; exit 3".into()],
        };
        let t = task(failing, 0, vec![vec![input]], &tmp);
        let err = run_task(&t, &LogicRegistry::with_builtins(), &fetcher, &AtomicBool::new(false)).unwrap_err();
        assert!(matches!(err, FlowError::ExecutorFailure(_)));
    }

    #[test]
    fn compare_values_es_un_orden_total_por_tipo() {
        let mut vals = vec![json!("b"), json!(2.5), json!(null), json!(true), json!(10), json!("a"), json!([1])];
        vals.sort_by(compare_values);
        assert_eq!(
            vals,
            vec![json!(null), json!(true), json!(2.5), json!(10), json!("a"), json!("b"), json!([1])]
        );
    }

    #[test]
    fn claves_numericas_iguales_caen_en_el_mismo_bucket() {
        let pares = [
            (json!(1), json!(1.0)),
            (json!(-0.0), json!(0)),
            (json!([1, {"x": 2}]), json!([1.0, {"x": 2.0}])),
        ];
        for (a, b) in pares {
            assert_eq!(compare_values(&a, &b), Ordering::Equal, "{a} vs {b}");
            assert_eq!(key_text(&a), key_text(&b));
            assert_eq!(
                hash_key_to_partition(&key_text(&a), 7),
                hash_key_to_partition(&key_text(&b), 7)
            );
        }
    }

    #[test]
    fn enteros_grandes_no_se_confunden() {
        let a = json!(u64::MAX);
        let b = json!(u64::MAX - 1);
        assert_eq!(compare_values(&b, &a), Ordering::Less);
        assert_ne!(key_text(&a), key_text(&b));

        assert_eq!(compare_values(&json!(i64::MAX), &json!(u64::MAX)), Ordering::Less);
        assert_eq!(compare_values(&json!(2), &json!(2.5)), Ordering::Less);
        assert_eq!(compare_values(&json!(3), &json!(2.5)), Ordering::Greater);
        assert_eq!(compare_values(&json!(-3), &json!(-2.5)), Ordering::Less);
    }
}
