//! Contrato de fuentes y sinks, más las implementaciones incluidas.
//!
//! Una fuente reporta un número fijo de particiones y abre cada una como una
//! secuencia perezosa de registros. Un sink recibe registros y en `close`
//! confirma (o falla); si se descarta sin cerrar, no deja rastro visible.

use std::{
    fs::{self, File},
    io::{BufRead, BufReader, BufWriter, Write},
    path::{Path, PathBuf},
};

use glob::glob;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::error::{FlowError, Result};
use crate::shard::{JsonlRecords, RecordIter};
use crate::Record;

pub trait Source {
    fn partitions(&self) -> u32;
    fn open_partition(&self, partition: u32) -> Result<RecordIter<'static>>;
}

pub trait Sink: Send {
    fn write_record(&mut self, record: &Record) -> Result<()>;
    /// Confirma todo lo escrito. Si falla, no queda salida parcial publicada.
    fn close(self: Box<Self>) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SourceSpec {
    /// Registros embebidos en el flow, una lista por partición.
    Inline { partitions: Vec<Vec<Record>> },
    /// Un archivo de texto por partición; cada línea es `{"text": <línea>}`.
    TextFiles { files: Vec<String> },
    /// Un archivo JSONL por partición.
    JsonlFiles { files: Vec<String> },
}

impl SourceSpec {
    pub fn text_glob(pattern: &str) -> Result<Self> {
        Ok(SourceSpec::TextFiles {
            files: expand_glob(pattern)?,
        })
    }

    pub fn jsonl_glob(pattern: &str) -> Result<Self> {
        Ok(SourceSpec::JsonlFiles {
            files: expand_glob(pattern)?,
        })
    }
}

/// Archivos que hacen match con el patrón, ordenados para que el número y
/// el orden de particiones sean deterministas.
fn expand_glob(pattern: &str) -> Result<Vec<String>> {
    let entries = glob(pattern).map_err(|e| {
        FlowError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("patrón inválido {pattern}: {e}"),
        ))
    })?;

    let mut files: Vec<String> = entries
        .flatten()
        .filter(|p| p.is_file())
        .map(|p| p.to_string_lossy().to_string())
        .collect();
    files.sort();
    Ok(files)
}

impl Source for SourceSpec {
    fn partitions(&self) -> u32 {
        match self {
            SourceSpec::Inline { partitions } => partitions.len() as u32,
            SourceSpec::TextFiles { files } | SourceSpec::JsonlFiles { files } => {
                files.len() as u32
            }
        }
    }

    fn open_partition(&self, partition: u32) -> Result<RecordIter<'static>> {
        let idx = partition as usize;
        match self {
            SourceSpec::Inline { partitions } => {
                let recs = partitions
                    .get(idx)
                    .cloned()
                    .ok_or_else(|| missing_partition(partition))?;
                Ok(Box::new(recs.into_iter().map(Ok)))
            }
            SourceSpec::TextFiles { files } => {
                let path = files.get(idx).ok_or_else(|| missing_partition(partition))?;
                let reader = BufReader::new(File::open(path)?);
                Ok(Box::new(reader.lines().map(|line| {
                    let line = line?;
                    Ok(json!({ "text": line }))
                })))
            }
            SourceSpec::JsonlFiles { files } => {
                let path = files.get(idx).ok_or_else(|| missing_partition(partition))?;
                let reader = BufReader::new(File::open(path)?);
                Ok(Box::new(JsonlRecords::new(reader)))
            }
        }
    }
}

fn missing_partition(partition: u32) -> FlowError {
    FlowError::Io(std::io::Error::new(
        std::io::ErrorKind::NotFound,
        format!("la fuente no tiene partición {partition}"),
    ))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SinkSpec {
    /// `<dir>/part-<p>.jsonl`
    JsonlDir { dir: String },
    /// `<dir>/part-<p>.csv`, líneas "campo1,campo2" sin encabezado.
    CsvDir { dir: String, fields: Vec<String> },
}

impl SinkSpec {
    pub fn open(&self, partition: u32, attempt: u32) -> Result<Box<dyn Sink>> {
        let (dir, ext, fields) = match self {
            SinkSpec::JsonlDir { dir } => (dir, "jsonl", None),
            SinkSpec::CsvDir { dir, fields } => (dir, "csv", Some(fields.clone())),
        };
        fs::create_dir_all(dir)?;
        let final_path = Path::new(dir).join(format!("part-{partition}.{ext}"));
        // cada intento escribe su propio tmp: un intento viejo no pisa al nuevo
        let tmp_path = Path::new(dir).join(format!(".part-{partition}.a{attempt}.tmp"));
        let writer = BufWriter::new(File::create(&tmp_path)?);
        Ok(Box::new(FileSink {
            writer: Some(writer),
            tmp_path,
            final_path,
            fields,
        }))
    }
}

struct FileSink {
    writer: Option<BufWriter<File>>,
    tmp_path: PathBuf,
    final_path: PathBuf,
    /// `Some` => CSV con estas columnas; `None` => JSONL.
    fields: Option<Vec<String>>,
}

impl Sink for FileSink {
    fn write_record(&mut self, record: &Record) -> Result<()> {
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| FlowError::ExecutorFailure("sink ya cerrado".into()))?;
        match &self.fields {
            None => serde_json::to_writer(&mut *writer, record)?,
            Some(fields) => {
                let cols: Vec<String> = fields.iter().map(|f| csv_cell(record.get(f))).collect();
                writer.write_all(cols.join(",").as_bytes())?;
            }
        }
        writer.write_all(b"\n")?;
        Ok(())
    }

    fn close(mut self: Box<Self>) -> Result<()> {
        if let Some(mut writer) = self.writer.take() {
            writer.flush()?;
            writer.get_ref().sync_all()?;
        }
        fs::rename(&self.tmp_path, &self.final_path)?;
        Ok(())
    }
}

impl Drop for FileSink {
    fn drop(&mut self) {
        // sin close: se descarta lo escrito
        if self.writer.take().is_some() {
            let _ = fs::remove_file(&self.tmp_path);
        }
    }
}

fn csv_cell(v: Option<&Record>) -> String {
    match v {
        None | Some(Record::Null) => String::new(),
        Some(Record::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{env, path::PathBuf};

    fn temp_dir(sub: &str) -> PathBuf {
        let base = env::temp_dir().join("source_tests").join(sub);
        let _ = fs::remove_dir_all(&base);
        fs::create_dir_all(&base).unwrap();
        base
    }

    #[test]
    fn inline_abre_cada_particion() {
        let spec = SourceSpec::Inline {
            partitions: vec![vec![json!({"x": 1}), json!({"x": 2})], vec![json!({"x": 3})]],
        };
        assert_eq!(spec.partitions(), 2);

        let p0: Vec<Record> = spec.open_partition(0).unwrap().map(|r| r.unwrap()).collect();
        assert_eq!(p0, vec![json!({"x": 1}), json!({"x": 2})]);
        assert!(spec.open_partition(2).is_err());
    }

    #[test]
    fn text_glob_ordena_archivos_y_lee_lineas() {
        let tmp = temp_dir("text_glob");
        fs::write(tmp.join("b.txt"), "tercera\n").unwrap();
        fs::write(tmp.join("a.txt"), "primera\nsegunda\n").unwrap();

        let pattern = format!("{}/*.txt", tmp.display());
        let spec = SourceSpec::text_glob(&pattern).unwrap();
        assert_eq!(spec.partitions(), 2);

        let p0: Vec<Record> = spec.open_partition(0).unwrap().map(|r| r.unwrap()).collect();
        assert_eq!(p0, vec![json!({"text": "primera"}), json!({"text": "segunda"})]);
    }

    #[test]
    fn jsonl_files_salta_lineas_vacias() {
        let tmp = temp_dir("jsonl");
        let path = tmp.join("data.jsonl");
        fs::write(&path, "{\"x\":1}\n\n{\"x\":2}\n").unwrap();

        let spec = SourceSpec::JsonlFiles {
            files: vec![path.to_string_lossy().to_string()],
        };
        let recs: Vec<Record> = spec.open_partition(0).unwrap().map(|r| r.unwrap()).collect();
        assert_eq!(recs, vec![json!({"x": 1}), json!({"x": 2})]);
    }

    #[test]
    fn csv_sink_publica_solo_al_cerrar() {
        let tmp = temp_dir("csv_sink");
        let spec = SinkSpec::CsvDir {
            dir: tmp.to_string_lossy().to_string(),
            fields: vec!["token".into(), "count".into()],
        };

        let mut sink = spec.open(0, 0).unwrap();
        sink.write_record(&json!({"token": "hola", "count": 2})).unwrap();
        sink.write_record(&json!({"token": "mundo"})).unwrap();
        assert!(!tmp.join("part-0.csv").exists());

        sink.close().unwrap();
        let content = fs::read_to_string(tmp.join("part-0.csv")).unwrap();
        assert_eq!(content, "hola,2\nmundo,\n");
    }

    #[test]
    fn sink_descartado_sin_close_no_deja_archivos() {
        let tmp = temp_dir("sink_drop");
        let spec = SinkSpec::JsonlDir {
            dir: tmp.to_string_lossy().to_string(),
        };
        {
            let mut sink = spec.open(1, 0).unwrap();
            sink.write_record(&json!({"x": 1})).unwrap();
        }
        let leftovers: Vec<_> = fs::read_dir(&tmp).unwrap().flatten().collect();
        assert!(leftovers.is_empty());
    }
}
