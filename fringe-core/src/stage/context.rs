//! Immutable stage context and its tagged value type.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::config::PipelineConfig;
use crate::error::{PipelineError, Result};
use crate::resources::ResourceManager;
use crate::store::{JobLogWriter, StoreSet};

use super::observer::{NoopStageObserver, StageObserver};

/// Small tagged value carried through context maps.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Value {
    Str(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    Path(PathBuf),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
}

impl Value {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            Value::Int(n) => Some(*n as f64),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_path(&self) -> Option<&Path> {
        match self {
            Value::Path(p) => Some(p),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(items) => Some(items),
            _ => None,
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Int(n)
    }
}

impl From<u32> for Value {
    fn from(n: u32) -> Self {
        Value::Int(n as i64)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<PathBuf> for Value {
    fn from(p: PathBuf) -> Self {
        Value::Path(p)
    }
}

impl From<&Path> for Value {
    fn from(p: &Path) -> Self {
        Value::Path(p.to_path_buf())
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(items: Vec<T>) -> Self {
        Value::List(items.into_iter().map(Into::into).collect())
    }
}

/// String-keyed context map.
pub type ValueMap = BTreeMap<String, Value>;

/// The serialisable data portion of a context: everything except the
/// injected runtime handles.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ContextData {
    pub job_id: Option<i64>,
    pub inputs: ValueMap,
    pub outputs: ValueMap,
    pub metadata: ValueMap,
}

/// Immutable stage context.
///
/// Stages derive new contexts through the `with_*` constructors instead of
/// mutating in place; the orchestrator merges the outputs of each
/// completed stage into the running context. Store handles, resources, the
/// observer, and the job log writer are injected by the runner and do not
/// participate in serialisation or equality.
#[derive(Clone)]
pub struct Context {
    config: Arc<PipelineConfig>,
    data: ContextData,
    stores: Option<StoreSet>,
    resources: Option<Arc<ResourceManager>>,
    observer: Arc<dyn StageObserver>,
    log: Option<Arc<JobLogWriter>>,
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("job_id", &self.data.job_id)
            .field("inputs", &self.data.inputs.len())
            .field("outputs", &self.data.outputs.len())
            .field("metadata", &self.data.metadata.len())
            .finish()
    }
}

impl PartialEq for Context {
    fn eq(&self, other: &Self) -> bool {
        self.data == other.data
    }
}

impl Context {
    pub fn new(config: Arc<PipelineConfig>) -> Self {
        Self {
            config,
            data: ContextData::default(),
            stores: None,
            resources: None,
            observer: Arc::new(NoopStageObserver),
            log: None,
        }
    }

    /// Rebuild a context from its serialised data portion.
    pub fn from_data(config: Arc<PipelineConfig>, data: ContextData) -> Self {
        Self {
            config,
            data,
            stores: None,
            resources: None,
            observer: Arc::new(NoopStageObserver),
            log: None,
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn job_id(&self) -> Option<i64> {
        self.data.job_id
    }

    pub fn inputs(&self) -> &ValueMap {
        &self.data.inputs
    }

    pub fn outputs(&self) -> &ValueMap {
        &self.data.outputs
    }

    pub fn metadata(&self) -> &ValueMap {
        &self.data.metadata
    }

    /// The serialisable data portion.
    pub fn data(&self) -> &ContextData {
        &self.data
    }

    /// Stage-visible lookup: outputs supersede inputs.
    pub fn value(&self, key: &str) -> Option<&Value> {
        self.data
            .outputs
            .get(key)
            .or_else(|| self.data.inputs.get(key))
    }

    pub fn require_str(&self, key: &str) -> Result<&str> {
        self.value(key)
            .and_then(Value::as_str)
            .ok_or_else(|| missing(key, "string"))
    }

    pub fn require_path(&self, key: &str) -> Result<&Path> {
        self.value(key)
            .and_then(Value::as_path)
            .ok_or_else(|| missing(key, "path"))
    }

    pub fn require_float(&self, key: &str) -> Result<f64> {
        self.value(key)
            .and_then(Value::as_float)
            .ok_or_else(|| missing(key, "float"))
    }

    pub fn stores(&self) -> Result<&StoreSet> {
        self.stores
            .as_ref()
            .ok_or_else(|| PipelineError::Fatal("context has no store handles".to_string()))
    }

    pub fn resources(&self) -> Option<&Arc<ResourceManager>> {
        self.resources.as_ref()
    }

    pub fn observer(&self) -> &Arc<dyn StageObserver> {
        &self.observer
    }

    pub fn log(&self) -> Option<&Arc<JobLogWriter>> {
        self.log.as_ref()
    }

    pub fn with_job_id(mut self, job_id: i64) -> Self {
        self.data.job_id = Some(job_id);
        self
    }

    pub fn with_input(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.data.inputs.insert(key.into(), value.into());
        self
    }

    pub fn with_inputs(mut self, inputs: ValueMap) -> Self {
        self.data.inputs.extend(inputs);
        self
    }

    /// Derive a context with one more output.
    pub fn with_output(&self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        let mut next = self.clone();
        next.data.outputs.insert(key.into(), value.into());
        next
    }

    /// Derive a context with a batch of outputs merged in.
    pub fn with_outputs(&self, outputs: ValueMap) -> Self {
        let mut next = self.clone();
        next.data.outputs.extend(outputs);
        next
    }

    pub fn with_metadata(&self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        let mut next = self.clone();
        next.data.metadata.insert(key.into(), value.into());
        next
    }

    pub fn with_stores(mut self, stores: StoreSet) -> Self {
        self.stores = Some(stores);
        self
    }

    pub fn with_resources(mut self, resources: Arc<ResourceManager>) -> Self {
        self.resources = Some(resources);
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn StageObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn with_log(mut self, log: Arc<JobLogWriter>) -> Self {
        self.log = Some(log);
        self
    }

    /// JSON snapshot of the data portion with secret-looking values
    /// masked; captured into DLQ items.
    pub fn redacted_snapshot(&self) -> JsonValue {
        let mut data = self.data.clone();
        redact_map(&mut data.inputs);
        redact_map(&mut data.outputs);
        redact_map(&mut data.metadata);
        serde_json::to_value(&data).unwrap_or(JsonValue::Null)
    }
}

fn missing(key: &str, kind: &str) -> PipelineError {
    PipelineError::Fatal(format!("missing required {kind} context value `{key}`"))
}

const SECRET_MARKERS: [&str; 5] = ["secret", "password", "token", "credential", "api_key"];

fn is_secret_key(key: &str) -> bool {
    let lower = key.to_ascii_lowercase();
    SECRET_MARKERS.iter().any(|m| lower.contains(m))
}

fn redact_map(map: &mut ValueMap) {
    for (key, value) in map.iter_mut() {
        if is_secret_key(key) {
            *value = Value::Str("<redacted>".to_string());
        } else if let Value::Map(inner) = value {
            redact_map(inner);
        }
    }
}
