use std::sync::Arc;

use tracing::info;

use crate::core::repository::{Artifact, ArtifactKey};
use crate::error::{DataError, ModelError, StepError};
use crate::inference::{OutputKind, TypedOutput};
use crate::models::{ClassificationTag, Space, Volume};
use crate::steps::{DependencyPlan, PipelineStep, StepContext, StepOutput, TaskKind};

/// Which volumes a classification runs on
#[derive(Debug, Clone, PartialEq)]
pub enum InputSelection {
    /// Every raw volume the patient has when the step runs
    AllAvailable,
    Explicit(Vec<Space>),
}

/// Tag each selected volume with the class the model predicts
#[derive(Debug, Clone, PartialEq)]
pub struct ClassificationStep {
    pub model: String,
    pub inputs: InputSelection,
}

impl ClassificationStep {
    fn selected(&self, context: &StepContext<'_>) -> Result<Vec<Arc<Volume>>, StepError> {
        match &self.inputs {
            InputSelection::AllAvailable => {
                let volumes: Vec<Arc<Volume>> = context.repository.raw_volumes().cloned().collect();
                if volumes.is_empty() {
                    return Err(DataError::NoInputData.into());
                }
                Ok(volumes)
            }
            InputSelection::Explicit(spaces) => spaces
                .iter()
                .map(|space| {
                    context
                        .repository
                        .volume(&ArtifactKey::raw_volume(space.clone()))
                        .map_err(StepError::from)
                })
                .collect(),
        }
    }
}

impl PipelineStep for ClassificationStep {
    fn execute(&self, context: &StepContext<'_>) -> Result<StepOutput, StepError> {
        let volumes = self.selected(context)?;
        let mut result = Vec::with_capacity(volumes.len());

        for volume in volumes {
            let output = context
                .invoker
                .invoke(&self.model, &[&*volume], OutputKind::ClassLabel)?;
            let TypedOutput::ClassLabel { label, scores } = output else {
                return Err(ModelError::Execution {
                    name: self.model.clone(),
                    message: "model did not return a class label".to_string(),
                }
                .into());
            };
            info!("  {} classified as {}", volume.source, label);

            let tag = ClassificationTag {
                source: volume.source.clone(),
                model: self.model.clone(),
                label,
                scores,
            };
            result.push((
                ArtifactKey::Classification {
                    source: volume.source.clone(),
                },
                Artifact::Classification(Arc::new(tag)),
            ));
        }

        Ok(result)
    }

    fn plan(&self, plan: &mut DependencyPlan) -> Result<(), StepError> {
        let sources: Vec<Space> = match &self.inputs {
            InputSelection::AllAvailable => {
                let all: Vec<Space> = plan.raw_volumes().cloned().collect();
                if all.is_empty() {
                    return Err(DataError::NoInputData.into());
                }
                all
            }
            InputSelection::Explicit(spaces) => {
                for space in spaces {
                    let key = ArtifactKey::raw_volume(space.clone());
                    if !plan.contains(&key) {
                        return Err(DataError::MissingInput(key).into());
                    }
                }
                spaces.clone()
            }
        };
        for source in sources {
            plan.insert(ArtifactKey::Classification { source });
        }
        Ok(())
    }

    fn kind(&self) -> TaskKind {
        TaskKind::Classification
    }
}
