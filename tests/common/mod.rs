#![allow(dead_code)]

mod fixtures;
pub use fixtures::*;

// Re-export commonly used types from scanflow for tests
pub use scanflow::core::repository::{Artifact, ArtifactKey, ImageRepository, KeyFilter};
pub use scanflow::models::{Direction, Geometry, LabelData, Patient, Space, Volume};
pub use scanflow::{PipelineDescription, PipelineError, StepError, TaskKind};
