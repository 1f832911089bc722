use std::path::PathBuf;

use thiserror::Error;

use crate::core::repository::ArtifactKey;
use crate::models::{Direction, Space};
use crate::steps::TaskKind;

/// Repository lookup errors
#[derive(Debug, Clone, Error)]
pub enum RepositoryError {
    #[error("artifact not found: {0}")]
    NotFound(ArtifactKey),
}

/// A step's required data is absent
#[derive(Debug, Clone, Error)]
pub enum DataError {
    #[error("no input data: the patient has no volumes")]
    NoInputData,

    #[error("missing input: {0}")]
    MissingInput(ArtifactKey),

    #[error("unknown space {0}")]
    UnknownSpace(Space),
}

impl From<RepositoryError> for DataError {
    fn from(err: RepositoryError) -> Self {
        match err {
            RepositoryError::NotFound(key) => DataError::MissingInput(key),
        }
    }
}

/// Model lookup or inference failed
#[derive(Debug, Clone, Error)]
pub enum ModelError {
    #[error("model '{name}' not found in {}", .dir.display())]
    NotFound { name: String, dir: PathBuf },

    #[error("model '{name}' failed: {message}")]
    Execution { name: String, message: String },
}

/// A step referenced the output of a step that never ran
#[derive(Debug, Clone, Error)]
pub enum DependencyError {
    #[error("no {direction} transform from {moving} to {fixed} was produced by an earlier registration step")]
    TransformNotFound {
        moving: Space,
        fixed: Space,
        direction: Direction,
    },
}

/// Everything a single step can fail with
#[derive(Debug, Clone, Error)]
pub enum StepError {
    #[error(transparent)]
    Data(#[from] DataError),

    #[error(transparent)]
    Model(#[from] ModelError),

    #[error(transparent)]
    Dependency(#[from] DependencyError),

    #[error("failed to write artifacts: {0}")]
    Output(String),
}

impl StepError {
    /// Error kind as reported to the user
    pub fn kind(&self) -> &'static str {
        match self {
            StepError::Data(DataError::NoInputData) => "NoInputData",
            StepError::Data(DataError::MissingInput(_)) => "MissingInput",
            StepError::Data(DataError::UnknownSpace(_)) => "UnknownSpace",
            StepError::Model(ModelError::NotFound { .. }) => "ModelNotFound",
            StepError::Model(ModelError::Execution { .. }) => "ModelExecutionError",
            StepError::Dependency(DependencyError::TransformNotFound { .. }) => "TransformNotFound",
            StepError::Output(_) => "OutputError",
        }
    }

    /// Error family: DataError, ModelError, DependencyError or OutputError
    pub fn category(&self) -> &'static str {
        match self {
            StepError::Data(_) => "DataError",
            StepError::Model(_) => "ModelError",
            StepError::Dependency(_) => "DependencyError",
            StepError::Output(_) => "OutputError",
        }
    }
}

impl From<RepositoryError> for StepError {
    fn from(err: RepositoryError) -> Self {
        StepError::Data(err.into())
    }
}

/// Malformed pipeline description, detected before anything runs
#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("could not read pipeline description {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("pipeline description is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("pipeline description must be an object keyed by step index")]
    NotAnObject,

    #[error("pipeline description has no steps")]
    Empty,

    #[error("step key '{0}' is not an integer index")]
    BadIndex(String),

    #[error("step key '{0}' is used more than once")]
    DuplicateIndex(u32),

    #[error("step {index}: missing required field 'task'")]
    MissingTask { index: u32 },

    #[error("step {index}: unknown task '{task}'")]
    UnknownTask { index: u32, task: String },

    #[error("step {index} ({task}): {message}")]
    InvalidStep {
        index: u32,
        task: TaskKind,
        message: String,
    },
}

/// Why a pipeline run stopped
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Schema(#[from] SchemaError),

    #[error("step {index} ({task}) \"{description}\" failed with {}: {source}", .source.kind())]
    Step {
        index: u32,
        task: TaskKind,
        description: String,
        #[source]
        source: StepError,
    },

    #[error("run cancelled before step {index}")]
    Cancelled { index: u32 },
}

impl PipelineError {
    /// Error kind as reported to the user
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineError::Schema(_) => "SchemaError",
            PipelineError::Step { source, .. } => source.kind(),
            PipelineError::Cancelled { .. } => "Cancelled",
        }
    }

    /// Index of the step the run stopped at, if any
    pub fn step_index(&self) -> Option<u32> {
        match self {
            PipelineError::Schema(_) => None,
            PipelineError::Step { index, .. } | PipelineError::Cancelled { index } => Some(*index),
        }
    }

    /// Underlying step error, if the run failed inside or before a step
    pub fn step_error(&self) -> Option<&StepError> {
        match self {
            PipelineError::Step { source, .. } => Some(source),
            _ => None,
        }
    }
}
