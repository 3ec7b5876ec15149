//! Registro de lógica de usuario por identificador.
//!
//! Los pasos del flow sólo guardan el id (`"fn": "tokenize"`); el executor lo
//! resuelve al arrancar y falla con `UnknownLogic` si no está registrado.

use std::{collections::HashMap, sync::Arc};

use serde_json::{json, Value};

use crate::error::{FlowError, Result};
use crate::Record;

pub type MapFn = Arc<dyn Fn(&Record) -> Result<Record> + Send + Sync>;
pub type FlatMapFn = Arc<dyn Fn(&Record) -> Result<Vec<Record>> + Send + Sync>;
pub type FilterFn = Arc<dyn Fn(&Record) -> bool + Send + Sync>;
/// `(campo clave, acumulado, siguiente) -> acumulado`.
pub type ReduceFn = Arc<dyn Fn(&str, Record, &Record) -> Result<Record> + Send + Sync>;

#[derive(Clone, Default)]
pub struct LogicRegistry {
    maps: HashMap<String, MapFn>,
    flat_maps: HashMap<String, FlatMapFn>,
    filters: HashMap<String, FilterFn>,
    reducers: HashMap<String, ReduceFn>,
}

impl LogicRegistry {
    /// Registro vacío (sin ninguna función incluida).
    pub fn new() -> Self {
        Self::default()
    }

    /// Registro con las funciones incluidas: identity, to_lower, tokenize,
    /// non_empty_token, sum, max y min.
    pub fn with_builtins() -> Self {
        let mut reg = Self::new();
        reg.register_map("identity", |r| Ok(r.clone()));
        reg.register_map("to_lower", |r| Ok(to_lower(r)));
        reg.register_flat_map("tokenize", |r| Ok(tokenize(r)));
        reg.register_filter("non_empty_token", non_empty_token);
        reg.register_reduce("sum", |key, acc, next| {
            Ok(combine_numeric(key, acc, next, |a, b| a + b))
        });
        reg.register_reduce("max", |key, acc, next| {
            Ok(combine_numeric(key, acc, next, f64::max))
        });
        reg.register_reduce("min", |key, acc, next| {
            Ok(combine_numeric(key, acc, next, f64::min))
        });
        reg
    }

    pub fn register_map<F>(&mut self, id: &str, f: F) -> &mut Self
    where
        F: Fn(&Record) -> Result<Record> + Send + Sync + 'static,
    {
        self.maps.insert(id.to_string(), Arc::new(f));
        self
    }

    pub fn register_flat_map<F>(&mut self, id: &str, f: F) -> &mut Self
    where
        F: Fn(&Record) -> Result<Vec<Record>> + Send + Sync + 'static,
    {
        self.flat_maps.insert(id.to_string(), Arc::new(f));
        self
    }

    pub fn register_filter<F>(&mut self, id: &str, f: F) -> &mut Self
    where
        F: Fn(&Record) -> bool + Send + Sync + 'static,
    {
        self.filters.insert(id.to_string(), Arc::new(f));
        self
    }

    pub fn register_reduce<F>(&mut self, id: &str, f: F) -> &mut Self
    where
        F: Fn(&str, Record, &Record) -> Result<Record> + Send + Sync + 'static,
    {
        self.reducers.insert(id.to_string(), Arc::new(f));
        self
    }

    pub fn map(&self, id: &str) -> Result<MapFn> {
        self.maps.get(id).cloned().ok_or_else(|| unknown(id))
    }

    pub fn flat_map(&self, id: &str) -> Result<FlatMapFn> {
        self.flat_maps.get(id).cloned().ok_or_else(|| unknown(id))
    }

    pub fn filter(&self, id: &str) -> Result<FilterFn> {
        self.filters.get(id).cloned().ok_or_else(|| unknown(id))
    }

    pub fn reducer(&self, id: &str) -> Result<ReduceFn> {
        self.reducers.get(id).cloned().ok_or_else(|| unknown(id))
    }
}

fn unknown(id: &str) -> FlowError {
    FlowError::UnknownLogic(id.to_string())
}

fn to_lower(rec: &Record) -> Record {
    match rec {
        Value::String(s) => Value::String(s.to_lowercase()),
        Value::Object(obj) => Value::Object(
            obj.iter()
                .map(|(k, v)| {
                    let v = match v {
                        Value::String(s) => Value::String(s.to_lowercase()),
                        other => other.clone(),
                    };
                    (k.clone(), v)
                })
                .collect(),
        ),
        other => other.clone(),
    }
}

/// {"text": "..."} -> varios {"token": <palabra>, "count": 1}
fn tokenize(rec: &Record) -> Vec<Record> {
    let text = rec.get("text").and_then(|v| v.as_str()).unwrap_or("");

    text.split_whitespace()
        .filter_map(|raw| {
            // limpiar: solo alfanumérico y '_', en minúscula
            let cleaned: String = raw
                .chars()
                .filter(|c| c.is_alphanumeric() || *c == '_')
                .collect::<String>()
                .to_lowercase();
            (!cleaned.is_empty()).then(|| json!({ "token": cleaned, "count": 1_u64 }))
        })
        .collect()
}

fn non_empty_token(rec: &Record) -> bool {
    rec.get("token")
        .and_then(|v| v.as_str())
        .map(|s| !s.trim().is_empty())
        .unwrap_or(false)
}

/// Combina campo a campo los valores numéricos (salvo la clave). Los campos
/// no numéricos conservan el valor del acumulado.
fn combine_numeric(key: &str, acc: Record, next: &Record, op: impl Fn(f64, f64) -> f64) -> Record {
    let Value::Object(mut acc) = acc else {
        return acc;
    };
    let Some(next) = next.as_object() else {
        return Value::Object(acc);
    };

    for (field, value) in next {
        if field == key {
            continue;
        }
        match acc.get_mut(field) {
            Some(current) => {
                if let Some(combined) = combine_numbers(current, value, &op) {
                    *current = combined;
                }
            }
            None => {
                acc.insert(field.clone(), value.clone());
            }
        }
    }
    Value::Object(acc)
}

fn combine_numbers(a: &Value, b: &Value, op: &impl Fn(f64, f64) -> f64) -> Option<Value> {
    // enteros se mantienen enteros mientras se pueda
    if let (Some(x), Some(y)) = (a.as_i64(), b.as_i64()) {
        let r = op(x as f64, y as f64);
        if r.fract() == 0.0 && r.abs() < i64::MAX as f64 {
            return Some(json!(r as i64));
        }
    }
    let (x, y) = (a.as_f64()?, b.as_f64()?);
    serde_json::Number::from_f64(op(x, y)).map(Value::Number)
}
