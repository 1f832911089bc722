pub mod config;
pub mod core;
pub mod error;
pub mod inference;
pub mod models;
pub mod pipeline;
pub mod schema;
pub mod steps;

use std::path::Path;

pub use config::Config;
pub use error::{DataError, DependencyError, ModelError, PipelineError, SchemaError, StepError};
pub use models::{Annotation, Direction, Geometry, Patient, Space, Transform, Volume};
pub use pipeline::{Pipeline, PipelineExecutor, RunReport, RunResult, check_dependencies};
pub use schema::{PipelineDescription, Step};
pub use steps::{PipelineStep, Task, TaskKind};

/// Load the configuration at `config_path` and run its pipeline
pub fn run(config_path: &Path) -> anyhow::Result<RunResult> {
    let config = Config::from_file(config_path)?;
    config.validate()?;
    Pipeline::from_config(config).run()
}
