use std::sync::RwLock;

use serde::{Deserialize, Serialize};

use crate::core::{Error, ParamId, Result};
use crate::protocol::frame::MAX_TABLE_LEN;

/// Bounds and default of one parameter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParamSpec {
    /// Smallest accepted value
    pub min: i32,
    /// Largest accepted value
    pub max: i32,
    /// Value after a reset
    pub default: i32,
}

impl ParamSpec {
    /// Creates a new parameter spec
    pub fn new(min: i32, max: i32, default: i32) -> Self {
        ParamSpec { min, max, default }
    }

    /// Returns whether `value` lies within the bounds
    pub fn contains(&self, value: i32) -> bool {
        (self.min..=self.max).contains(&value)
    }
}

/// Table of bounded parameters mirrored across the link
pub trait ParameterStore: Send + Sync + 'static {
    /// Bounds of `id`, if the table has it
    fn spec(&self, id: ParamId) -> Option<ParamSpec>;

    /// Current value of `id`
    fn get(&self, id: ParamId) -> Option<i32>;

    /// Stores `value` under `id` after a bounds check
    fn set(&self, id: ParamId, value: i32) -> Result<()>;

    /// All values in id order
    fn table(&self) -> Vec<i32>;

    /// Checks `value` against the bounds of `id` without storing it
    fn check(&self, id: ParamId, value: i32) -> Result<()> {
        let spec = self.spec(id).ok_or(Error::UnknownParameter(id.0))?;
        if !spec.contains(value) {
            return Err(Error::OutOfRange {
                id: id.0,
                value,
                min: spec.min,
                max: spec.max,
            });
        }
        Ok(())
    }
}

/// In-memory parameter table
#[derive(Debug)]
pub struct MemoryStore {
    specs: Vec<ParamSpec>,
    values: RwLock<Vec<i32>>,
}

impl MemoryStore {
    /// Creates a table holding the defaults of `specs`; id `n` is `specs[n]`
    pub fn new(specs: Vec<ParamSpec>) -> Result<Self> {
        if specs.len() > MAX_TABLE_LEN {
            return Err(Error::config(format!(
                "{} parameters exceed the {} that fit one frame",
                specs.len(),
                MAX_TABLE_LEN
            )));
        }
        if let Some((id, spec)) = specs.iter().enumerate().find(|(_, s)| !s.contains(s.default)) {
            return Err(Error::config(format!(
                "default {} of parameter {} outside [{}, {}]",
                spec.default, id, spec.min, spec.max
            )));
        }
        let values = specs.iter().map(|s| s.default).collect();
        Ok(MemoryStore {
            specs,
            values: RwLock::new(values),
        })
    }

    /// Puts every parameter back to its default
    pub fn reset_to_defaults(&self) {
        let mut values = self.values.write().unwrap_or_else(|e| e.into_inner());
        for (value, spec) in values.iter_mut().zip(&self.specs) {
            *value = spec.default;
        }
    }
}

impl ParameterStore for MemoryStore {
    fn spec(&self, id: ParamId) -> Option<ParamSpec> {
        self.specs.get(id.index()).copied()
    }

    fn get(&self, id: ParamId) -> Option<i32> {
        let values = self.values.read().unwrap_or_else(|e| e.into_inner());
        values.get(id.index()).copied()
    }

    fn set(&self, id: ParamId, value: i32) -> Result<()> {
        self.check(id, value)?;
        let mut values = self.values.write().unwrap_or_else(|e| e.into_inner());
        values[id.index()] = value;
        Ok(())
    }

    fn table(&self) -> Vec<i32> {
        self.values.read().unwrap_or_else(|e| e.into_inner()).clone()
    }
}
