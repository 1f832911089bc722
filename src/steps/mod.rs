pub mod apply_registration;
pub mod classification;
pub mod registration;
pub mod segmentation;

use std::collections::BTreeSet;
use std::fmt;

use serde::Serialize;

use crate::config::RuntimeConfig;
use crate::core::repository::{Artifact, ArtifactKey, ArtifactKind, ImageRepository};
use crate::core::space::SpaceResolver;
use crate::error::{DataError, StepError};
use crate::inference::ModelInvoker;
use crate::models::{Direction, Space};

pub use apply_registration::ApplyRegistrationStep;
pub use classification::{ClassificationStep, InputSelection};
pub use registration::{MomentsRegistration, RegistrationBackend, RegistrationStep};
pub use segmentation::{SegmentationInput, SegmentationStep};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum TaskKind {
    Classification,
    Segmentation,
    Registration,
    #[serde(rename = "Apply registration")]
    ApplyRegistration,
}

impl TaskKind {
    /// Name used in pipeline descriptions
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::Classification => "Classification",
            TaskKind::Segmentation => "Segmentation",
            TaskKind::Registration => "Registration",
            TaskKind::ApplyRegistration => "Apply registration",
        }
    }

    pub fn parse(task: &str) -> Option<Self> {
        match task {
            "Classification" => Some(TaskKind::Classification),
            "Segmentation" => Some(TaskKind::Segmentation),
            "Registration" => Some(TaskKind::Registration),
            "Apply registration" => Some(TaskKind::ApplyRegistration),
            _ => None,
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// Artifacts produced by one step, committed only once the step succeeds
pub type StepOutput = Vec<(ArtifactKey, Artifact)>;

/// Read-only view a step runs against
pub struct StepContext<'a> {
    pub repository: &'a ImageRepository,
    pub invoker: &'a ModelInvoker,
    pub registrar: &'a dyn RegistrationBackend,
    pub runtime: &'a RuntimeConfig,
}

impl<'a> StepContext<'a> {
    pub fn spaces(&self) -> SpaceResolver<'a> {
        SpaceResolver::new(self.repository)
    }
}

/// Trait that all pipeline steps must implement
pub trait PipelineStep {
    /// Compute this step's artifacts from what earlier steps produced
    fn execute(&self, context: &StepContext<'_>) -> Result<StepOutput, StepError>;

    /// Check this step's references against `plan` without running
    /// anything, then record the keys it will produce
    fn plan(&self, plan: &mut DependencyPlan) -> Result<(), StepError>;

    fn kind(&self) -> TaskKind;

    /// Human-readable name for this step (used in logs and preview folders)
    fn name(&self) -> &str {
        self.kind().as_str()
    }
}

/// One declarative task, tagged by kind
#[derive(Debug, Clone, PartialEq)]
pub enum Task {
    Classification(ClassificationStep),
    Segmentation(SegmentationStep),
    Registration(RegistrationStep),
    ApplyRegistration(ApplyRegistrationStep),
}

impl Task {
    pub fn kind(&self) -> TaskKind {
        self.as_step().kind()
    }

    pub fn as_step(&self) -> &dyn PipelineStep {
        match self {
            Task::Classification(step) => step,
            Task::Segmentation(step) => step,
            Task::Registration(step) => step,
            Task::ApplyRegistration(step) => step,
        }
    }
}

/// Keys that will exist at some point of a run, used to check references
/// before anything executes
#[derive(Debug, Clone, Default)]
pub struct DependencyPlan {
    keys: BTreeSet<ArtifactKey>,
}

impl DependencyPlan {
    pub fn from_repository(repository: &ImageRepository) -> Self {
        Self {
            keys: repository.keys().cloned().collect(),
        }
    }

    pub fn insert(&mut self, key: ArtifactKey) {
        self.keys.insert(key);
    }

    pub fn contains(&self, key: &ArtifactKey) -> bool {
        self.keys.contains(key)
    }

    pub fn raw_volumes(&self) -> impl Iterator<Item = &Space> {
        self.keys.iter().filter(|k| k.is_raw_volume()).map(|k| k.source())
    }

    /// Some grid is known for `space`
    pub fn require_space(&self, space: &Space) -> Result<(), DataError> {
        let known = self.keys.iter().any(|key| {
            matches!(key.kind(), ArtifactKind::Volume | ArtifactKind::Annotation) && key.space() == Some(space)
        });
        if known {
            Ok(())
        } else {
            Err(DataError::UnknownSpace(space.clone()))
        }
    }

    pub fn require_volume(&self, source: &Space, space: &Space) -> Result<(), DataError> {
        self.require_any(|direction| ArtifactKey::Volume {
            source: source.clone(),
            space: space.clone(),
            direction,
        }, source == space)
    }

    pub fn require_annotation(&self, source: &Space, class: &str, space: &Space) -> Result<(), DataError> {
        self.require_any(|direction| ArtifactKey::Annotation {
            source: source.clone(),
            class: class.to_string(),
            space: space.clone(),
            direction,
        }, source == space)
    }

    fn require_any(&self, key: impl Fn(Option<Direction>) -> ArtifactKey, native: bool) -> Result<(), DataError> {
        let candidates = [None, Some(Direction::Forward), Some(Direction::Inverse)];
        if candidates.iter().any(|d| self.keys.contains(&key(*d))) {
            return Ok(());
        }
        let preferred = if native { None } else { Some(Direction::Forward) };
        Err(DataError::MissingInput(key(preferred)))
    }
}
