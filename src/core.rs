use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};

use crate::data::{Dataset, Record};
use crate::error::ConfigError;

/// A type-erased, thread-safe container for task outputs.
pub(crate) type Dynamic = Arc<dyn Any + Send + Sync>;

/// Where the data of a task comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    /// Computed from the prerequisites or raw station files.
    #[default]
    Scratch,
    /// Read from the cached delimited file in the parameter directory.
    File,
    /// Read from the configured relational store.
    #[serde(alias = "db")]
    Database,
}

/// How station arguments are interpreted by tasks reading raw cloud data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArgsType {
    /// GHCN identifiers, mapped to cloud stations through the lookup table.
    #[default]
    Ghcn,
    /// Cloud station identifiers.
    Eecra,
    /// Paths to raw cloud station files.
    Files,
}

/// Per task configuration.
///
/// Every known field is optional so that two partial configurations can be
/// combined. Unknown keys land in `extra` and are passed through untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<Source>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to_csv: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to_db: Option<bool>,
    /// Threshold in mm separating the gamma body from the pareto tail.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thresh: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub threshs2compute: Option<Vec<f64>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args_type: Option<ArgsType>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

static EMPTY: TaskConfig = TaskConfig {
    source: None,
    to_csv: None,
    to_db: None,
    thresh: None,
    threshs2compute: None,
    args_type: None,
    extra: BTreeMap::new(),
};

fn pick<T>(field: &str, a: &Option<T>, b: &Option<T>) -> Result<Option<T>, ConfigError>
where
    T: PartialEq + Clone,
{
    match (a, b) {
        (Some(x), Some(y)) if x != y => Err(ConfigError::Conflict {
            field: field.to_string(),
        }),
        (Some(x), _) | (None, Some(x)) => Ok(Some(x.clone())),
        (None, None) => Ok(None),
    }
}

impl TaskConfig {
    pub const DEFAULT_THRESH: f64 = 15.0;
    pub const DEFAULT_THRESHS: [f64; 7] = [5.0, 7.5, 10.0, 12.5, 15.0, 17.5, 20.0];

    /// Merges two configurations. A field set on both sides to different
    /// values is a conflict.
    pub fn combine(&self, other: &TaskConfig) -> Result<TaskConfig, ConfigError> {
        let mut extra = self.extra.clone();
        for (key, value) in &other.extra {
            match extra.get(key) {
                Some(existing) if existing != value => {
                    return Err(ConfigError::Conflict { field: key.clone() });
                }
                _ => {
                    extra.insert(key.clone(), value.clone());
                }
            }
        }

        Ok(TaskConfig {
            source: pick("source", &self.source, &other.source)?,
            to_csv: pick("to_csv", &self.to_csv, &other.to_csv)?,
            to_db: pick("to_db", &self.to_db, &other.to_db)?,
            thresh: pick("thresh", &self.thresh, &other.thresh)?,
            threshs2compute: pick(
                "threshs2compute",
                &self.threshs2compute,
                &other.threshs2compute,
            )?,
            args_type: pick("args_type", &self.args_type, &other.args_type)?,
            extra,
        })
    }

    pub fn thresh(&self) -> f64 {
        self.thresh.unwrap_or(Self::DEFAULT_THRESH)
    }

    /// Thresholds to evaluate, always including [`TaskConfig::thresh`].
    pub fn thresholds(&self) -> Vec<f64> {
        let mut threshs = self
            .threshs2compute
            .clone()
            .unwrap_or_else(|| Self::DEFAULT_THRESHS.to_vec());
        threshs.push(self.thresh());
        threshs.sort_by(f64::total_cmp);
        threshs.dedup();
        threshs
    }

    pub fn to_csv(&self) -> bool {
        self.to_csv.unwrap_or(false)
    }

    pub fn to_db(&self) -> bool {
        self.to_db.unwrap_or(false)
    }

    pub fn args_type(&self) -> ArgsType {
        self.args_type.unwrap_or_default()
    }
}

/// Location of the relational store. The store is a SQLite database file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub path: Utf8PathBuf,
}

/// Everything a run needs to know about its surroundings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Environment {
    /// Directory holding cached task files.
    pub param_dir: Utf8PathBuf,
    /// Directory holding the raw station data.
    pub data_dir: Utf8PathBuf,
    #[serde(default)]
    pub database: Option<DatabaseConfig>,
    /// Source used by tasks that don't configure one.
    #[serde(default)]
    pub source: Source,
    #[serde(default)]
    pub tasks: BTreeMap<String, TaskConfig>,
}

impl Environment {
    pub fn new(param_dir: impl Into<Utf8PathBuf>, data_dir: impl Into<Utf8PathBuf>) -> Self {
        Self {
            param_dir: param_dir.into(),
            data_dir: data_dir.into(),
            ..Default::default()
        }
    }

    pub fn with_database(mut self, path: impl Into<Utf8PathBuf>) -> Self {
        self.database = Some(DatabaseConfig { path: path.into() });
        self
    }

    pub fn with_source(mut self, source: Source) -> Self {
        self.source = source;
        self
    }

    /// Adds configuration for a task, combining it with what is already set.
    pub fn with_task(
        mut self,
        name: impl Into<String>,
        config: TaskConfig,
    ) -> Result<Self, ConfigError> {
        let name = name.into();
        let combined = match self.tasks.get(&name) {
            Some(existing) => existing.combine(&config)?,
            None => config,
        };
        self.tasks.insert(name, combined);
        Ok(self)
    }

    pub fn config(&self, task: &str) -> &TaskConfig {
        self.tasks.get(task).unwrap_or(&EMPTY)
    }

    pub fn param_path(&self, file: &str) -> Utf8PathBuf {
        self.param_dir.join(file)
    }

    pub fn data_path(&self, file: impl AsRef<Utf8Path>) -> Utf8PathBuf {
        self.data_dir.join(file)
    }
}

/// How the station list is split into chunks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Policy {
    /// All stations in a single chunk on the calling thread.
    Serial,
    /// Chunks executed on a pool of `workers` threads.
    Parallel {
        max_chunk_size: usize,
        workers: usize,
    },
}

impl Default for Policy {
    fn default() -> Self {
        Policy::Parallel {
            max_chunk_size: Self::MAX_CHUNK_SIZE,
            workers: std::thread::available_parallelism()
                .map(usize::from)
                .unwrap_or(1),
        }
    }
}

impl Policy {
    pub const MAX_CHUNK_SIZE: usize = 500;

    pub fn parallel(workers: usize) -> Self {
        Policy::Parallel {
            max_chunk_size: Self::MAX_CHUNK_SIZE,
            workers: workers.max(1),
        }
    }

    pub fn workers(&self) -> usize {
        match self {
            Policy::Serial => 1,
            Policy::Parallel { workers, .. } => (*workers).max(1),
        }
    }

    /// Number of stations per chunk for `n` stations.
    pub fn chunk_size(&self, n: usize) -> usize {
        match self {
            Policy::Serial => n.max(1),
            Policy::Parallel {
                max_chunk_size,
                workers,
            } => n
                .div_ceil((*workers).max(1))
                .min(*max_chunk_size)
                .max(1),
        }
    }

    /// Splits the ordered station list into contiguous chunks.
    pub fn partition(&self, stations: &[String]) -> Vec<Vec<String>> {
        if stations.is_empty() || matches!(self, Policy::Serial) {
            return vec![stations.to_vec()];
        }
        stations
            .chunks(self.chunk_size(stations.len()))
            .map(<[String]>::to_vec)
            .collect()
    }
}

/// Outputs of the prerequisites, looked up by task name.
#[derive(Clone, Default)]
pub struct Inputs {
    map: HashMap<&'static str, Dynamic>,
}

impl Inputs {
    pub(crate) fn insert(&mut self, name: &'static str, data: Dynamic) {
        self.map.insert(name, data);
    }

    /// Typed access to the output of prerequisite `name`.
    pub fn get<R: Record>(&self, name: &str) -> anyhow::Result<&Dataset<R>> {
        let data = self
            .map
            .get(name)
            .ok_or_else(|| anyhow::anyhow!("Prerequisite '{name}' is not available"))?;

        data.downcast_ref::<Dataset<R>>().ok_or_else(|| {
            anyhow::anyhow!(
                "Prerequisite '{name}' is not a dataset of {}",
                std::any::type_name::<R>()
            )
        })
    }
}

/// The context passed to each task body.
pub struct TaskContext<'a> {
    pub env: &'a Environment,
    /// Configuration of the running task.
    pub config: &'a TaskConfig,
    /// Stations handled by this invocation.
    pub stations: &'a [String],
    pub(crate) span: tracing::Span,
}

impl<'a> TaskContext<'a> {
    pub(crate) fn new(env: &'a Environment, task: &str, stations: &'a [String]) -> Self {
        Self {
            env,
            config: env.config(task),
            stations,
            span: tracing::Span::current(),
        }
    }

    pub fn span(&self) -> &tracing::Span {
        &self.span
    }
}
