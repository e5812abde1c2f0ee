use thiserror::Error;

/// Top level error returned by [`crate::Engine`].
#[derive(Debug, Error)]
pub enum ParamError {
    #[error(transparent)]
    Resolve(#[from] ResolveError),

    #[error(transparent)]
    Materialize(#[from] MaterializeError),

    #[error(transparent)]
    Chunk(#[from] ChunkExecutionError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Emit(#[from] EmitError),

    #[error("Task '{task}':\n{cause}")]
    Task { task: String, cause: anyhow::Error },

    #[error("Couldn't build the worker pool.\n{0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ResolveError {
    #[error("Task '{name}' is not registered (required by {})", required_by.as_deref().unwrap_or("the request"))]
    UnknownTask {
        name: String,
        required_by: Option<String>,
    },

    #[error("Cyclic dependency between tasks: {}", tasks.join(" -> "))]
    CyclicDependency { tasks: Vec<String> },

    #[error("Task '{task}' runs per chunk but depends on the deferred task '{prerequisite}'")]
    DeferredPrerequisite { task: String, prerequisite: String },
}

#[derive(Debug, Error)]
pub enum MaterializeError {
    #[error("Task '{task}': no data source at {location}")]
    MissingDataSource { task: String, location: String },

    #[error("Task '{task}': none of the {requested} requested stations are present in {location}")]
    MissingStations {
        task: String,
        requested: usize,
        location: String,
    },

    #[error("Couldn't access data.\n{0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed delimited file.\n{0}")]
    Csv(#[from] csv::Error),

    #[error("Database error.\n{0}")]
    Sql(#[from] rusqlite::Error),

    #[error(transparent)]
    Data(#[from] DataError),
}

/// A single cell or row could not be converted into a typed record.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DataError {
    #[error("Column '{column}': {reason}")]
    Cell { column: &'static str, reason: String },

    #[error("Column '{0}' is missing")]
    MissingColumn(&'static str),
}

#[derive(Debug, Error)]
#[error("Chunk {chunk} ({stations} stations, {first}..{last}) failed:\n{cause}")]
pub struct ChunkExecutionError {
    pub chunk: usize,
    pub stations: usize,
    pub first: String,
    pub last: String,
    pub cause: anyhow::Error,
}

/// `M0` is not invertible, or the innovation covariance is not positive
/// semi-definite.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("Task '{task}': {matrix} is not usable for the decomposition")]
pub struct SingularCovarianceError {
    pub task: String,
    pub matrix: &'static str,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Conflicting values for configuration field '{field}'")]
    Conflict { field: String },
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EmitError {
    #[error("Key '{key}' in section '{section}' set by '{first}' conflicts with '{second}'")]
    ConflictingKey {
        section: String,
        key: String,
        first: String,
        second: String,
    },
}
