//! Shared run state threaded through every step
//!
//! `data` holds the primary item payloads and is mutated in place.
//! `metadata` holds one namespace per step; a step writes only under its own
//! name, which is what lets parallel group members run without locks.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::error::PipelineError;

/// Output record owned by exactly one step
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StepOutput {
    entries: BTreeMap<String, Value>,
}

impl StepOutput {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert
    pub fn with(mut self, key: impl Into<String>, value: Value) -> Self {
        self.entries.insert(key.into(), value);
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: Value) {
        self.entries.insert(key.into(), value);
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries.get(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Context for one run (one assessment of one document collection)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Context {
    /// Run identifier, also the checkpoint key prefix
    pub run_id: String,
    /// Optional business-level identifier (assessment, job, ...)
    pub assessment_id: Option<String>,
    /// Item key -> payload
    pub data: BTreeMap<String, Value>,
    /// Step name -> that step's output namespace
    metadata: BTreeMap<String, StepOutput>,
}

impl Context {
    pub fn new(run_id: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            ..Default::default()
        }
    }

    pub fn with_assessment(mut self, assessment_id: impl Into<String>) -> Self {
        self.assessment_id = Some(assessment_id.into());
        self
    }

    pub fn with_data(mut self, key: impl Into<String>, value: Value) -> Self {
        self.data.insert(key.into(), value);
        self
    }

    pub fn set_data(&mut self, key: impl Into<String>, value: Value) {
        self.data.insert(key.into(), value);
    }

    /// Fetch a data key that `step` cannot run without
    pub fn require(&self, step: &str, key: &str) -> Result<&Value, PipelineError> {
        self.data
            .get(key)
            .ok_or_else(|| PipelineError::MissingContextKey {
                step: step.to_string(),
                key: key.to_string(),
            })
    }

    /// Fetch and deserialize a required data key
    pub fn require_as<T: DeserializeOwned>(
        &self,
        step: &str,
        key: &str,
    ) -> Result<T, PipelineError> {
        let value = self.require(step, key)?;
        serde_json::from_value(value.clone()).map_err(|e| PipelineError::InvalidContextValue {
            key: key.to_string(),
            reason: e.to_string(),
        })
    }

    /// Write one entry into `step`'s own namespace
    pub fn record(&mut self, step: &str, key: impl Into<String>, value: Value) {
        self.metadata
            .entry(step.to_string())
            .or_default()
            .insert(key, value);
    }

    /// Install a whole namespace produced by `step`.
    ///
    /// Entries already recorded by the same step are kept unless the new
    /// output overwrites them.
    pub fn install_output(&mut self, step: &str, output: StepOutput) {
        let namespace = self.metadata.entry(step.to_string()).or_default();
        for (key, value) in output.entries {
            namespace.entries.insert(key, value);
        }
    }

    pub fn output(&self, step: &str) -> Option<&StepOutput> {
        self.metadata.get(step)
    }

    /// Look up `key` inside `step`'s namespace
    pub fn output_value(&self, step: &str, key: &str) -> Option<&Value> {
        self.metadata.get(step).and_then(|o| o.get(key))
    }

    /// All namespaces, ordered by step name
    pub fn metadata(&self) -> &BTreeMap<String, StepOutput> {
        &self.metadata
    }
}
