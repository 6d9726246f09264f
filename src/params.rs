//! Runtime-tunable detector parameters
//!
//! Every detector keeps a typed config struct. `TunableConfig` maps the
//! struct's named fields onto a string-keyed view for `get_parameter` /
//! `set_parameter`, profile persistence and the manager's tuning passthrough.

use std::collections::BTreeMap;
use std::fmt;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::ParameterError;

/// Dynamically typed parameter value
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Bool(bool),
    Int(i64),
    Float(f64),
}

impl ParamValue {
    pub fn as_f64(&self) -> Option<f64> {
        match *self {
            ParamValue::Int(v) => Some(v as f64),
            ParamValue::Float(v) => Some(v),
            ParamValue::Bool(_) => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match *self {
            ParamValue::Int(v) => Some(v),
            ParamValue::Float(v) if v.fract() == 0.0 => Some(v as i64),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match *self {
            ParamValue::Bool(v) => Some(v),
            _ => None,
        }
    }
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamValue::Bool(v) => write!(f, "{}", v),
            ParamValue::Int(v) => write!(f, "{}", v),
            ParamValue::Float(v) => write!(f, "{}", v),
        }
    }
}

impl From<bool> for ParamValue {
    fn from(v: bool) -> Self {
        ParamValue::Bool(v)
    }
}

impl From<i64> for ParamValue {
    fn from(v: i64) -> Self {
        ParamValue::Int(v)
    }
}

impl From<u32> for ParamValue {
    fn from(v: u32) -> Self {
        ParamValue::Int(v as i64)
    }
}

impl From<usize> for ParamValue {
    fn from(v: usize) -> Self {
        ParamValue::Int(v as i64)
    }
}

impl From<f64> for ParamValue {
    fn from(v: f64) -> Self {
        ParamValue::Float(v)
    }
}

/// A typed config whose fields can be addressed by name
pub trait TunableConfig: Clone {
    /// Names accepted by `get` / `set`
    fn parameter_names(&self) -> &'static [&'static str];

    fn get(&self, name: &str) -> Option<ParamValue>;

    fn set(&mut self, name: &str, value: ParamValue) -> Result<(), ParameterError>;

    /// Snapshot of every parameter
    fn to_map(&self) -> BTreeMap<String, ParamValue> {
        self.parameter_names()
            .iter()
            .filter_map(|name| self.get(name).map(|v| (name.to_string(), v)))
            .collect()
    }

    /// Apply a whole map, all-or-nothing
    fn apply_map(&mut self, values: &BTreeMap<String, ParamValue>) -> Result<(), ParameterError> {
        let mut staged = self.clone();
        for (name, value) in values {
            staged.set(name, *value)?;
        }
        *self = staged;
        Ok(())
    }
}

/// A detector's live config behind a lock
///
/// Writers (tuning calls, the adaptation timer) take the write lock for one
/// field or one staged map at a time; each detection call works on a
/// snapshot, so it never sees a torn value.
#[derive(Debug, Default)]
pub struct SharedConfig<C: TunableConfig> {
    inner: RwLock<C>,
}

impl<C: TunableConfig> SharedConfig<C> {
    pub fn new(config: C) -> Self {
        Self {
            inner: RwLock::new(config),
        }
    }

    pub fn snapshot(&self) -> C {
        self.inner.read().clone()
    }

    pub fn get(&self, name: &str) -> Option<ParamValue> {
        self.inner.read().get(name)
    }

    pub fn set(&self, name: &str, value: ParamValue) -> Result<(), ParameterError> {
        self.inner.write().set(name, value)
    }

    pub fn to_map(&self) -> BTreeMap<String, ParamValue> {
        self.inner.read().to_map()
    }

    pub fn apply_map(&self, values: &BTreeMap<String, ParamValue>) -> Result<(), ParameterError> {
        self.inner.write().apply_map(values)
    }

    /// Mutate under the write lock
    pub fn update<R>(&self, f: impl FnOnce(&mut C) -> R) -> R {
        f(&mut self.inner.write())
    }
}

pub(crate) fn unknown(name: &str) -> ParameterError {
    ParameterError::Unknown {
        name: name.to_string(),
    }
}

pub(crate) fn expect_f64(
    name: &str,
    value: ParamValue,
    min: f64,
    max: f64,
) -> Result<f64, ParameterError> {
    let v = value.as_f64().ok_or_else(|| ParameterError::TypeMismatch {
        name: name.to_string(),
        expected: "number",
    })?;
    if !v.is_finite() || v < min || v > max {
        return Err(ParameterError::OutOfRange {
            name: name.to_string(),
            value: v.to_string(),
        });
    }
    Ok(v)
}

pub(crate) fn expect_u32(
    name: &str,
    value: ParamValue,
    min: u32,
    max: u32,
) -> Result<u32, ParameterError> {
    let v = value.as_i64().ok_or_else(|| ParameterError::TypeMismatch {
        name: name.to_string(),
        expected: "integer",
    })?;
    if v < min as i64 || v > max as i64 {
        return Err(ParameterError::OutOfRange {
            name: name.to_string(),
            value: v.to_string(),
        });
    }
    Ok(v as u32)
}

pub(crate) fn expect_bool(name: &str, value: ParamValue) -> Result<bool, ParameterError> {
    value.as_bool().ok_or_else(|| ParameterError::TypeMismatch {
        name: name.to_string(),
        expected: "boolean",
    })
}
