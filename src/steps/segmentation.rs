use std::sync::Arc;

use tracing::info;

use crate::config::ReconstructionMethod;
use crate::core::repository::{Artifact, ArtifactKey};
use crate::error::{DataError, ModelError, StepError};
use crate::inference::{OutputKind, TypedOutput};
use crate::models::{Annotation, LabelData, Space, Volume};
use crate::steps::{DependencyPlan, PipelineStep, StepContext, StepOutput, TaskKind};

/// One model input channel
#[derive(Debug, Clone, PartialEq)]
pub struct SegmentationInput {
    /// Acquisition the channel comes from
    pub source: Space,
    /// Use this annotation class of `source` instead of its intensities
    pub labels: Option<String>,
    /// Space the channel is read in; the same for every input of a step
    pub space: Space,
}

impl SegmentationInput {
    /// Intensities of `source` in its own grid
    pub fn native(source: Space) -> Self {
        Self {
            space: source.clone(),
            source,
            labels: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SegmentationStep {
    pub model: String,
    /// Class name of the produced annotation
    pub target: String,
    /// Non-empty, all read in one space, which is also the output space
    pub inputs: Vec<SegmentationInput>,
    /// Falls back to the run's reconstruction method
    pub format: Option<ReconstructionMethod>,
    /// Falls back to the run's threshold
    pub threshold: Option<f32>,
}

impl SegmentationStep {
    fn output_key(&self) -> Option<ArtifactKey> {
        let first = self.inputs.first()?;
        Some(ArtifactKey::annotation(
            first.source.clone(),
            self.target.clone(),
            first.space.clone(),
        ))
    }
}

fn read_channel(context: &StepContext<'_>, input: &SegmentationInput, space: &Space) -> Result<Volume, StepError> {
    let Some(class) = &input.labels else {
        let volume = context.repository.volume_in_space(&input.source, space)?;
        return Ok(Volume::clone(&volume));
    };
    let annotation = context
        .repository
        .annotation_in_space(&input.source, class, space)?;
    Ok(Volume {
        source: input.source.clone(),
        geometry: annotation.geometry.clone(),
        voxels: annotation.data.to_f32(),
    })
}

impl PipelineStep for SegmentationStep {
    fn execute(&self, context: &StepContext<'_>) -> Result<StepOutput, StepError> {
        let (Some(first), Some(key)) = (self.inputs.first(), self.output_key()) else {
            return Err(DataError::NoInputData.into());
        };
        let space = &first.space;

        let channels = self
            .inputs
            .iter()
            .map(|input| read_channel(context, input, space))
            .collect::<Result<Vec<_>, _>>()?;
        let geometry = channels[0].geometry.clone();

        let method = self.format.unwrap_or(context.runtime.reconstruction_method);
        let kind = match method {
            ReconstructionMethod::Thresholding => OutputKind::ThresholdedMask {
                threshold: self.threshold.unwrap_or(context.runtime.threshold),
            },
            ReconstructionMethod::Probabilities => OutputKind::ProbabilityMap,
        };

        let inputs: Vec<&Volume> = channels.iter().collect();
        let data = match context.invoker.invoke(&self.model, &inputs, kind)? {
            TypedOutput::Mask(mask) => LabelData::Mask(mask),
            TypedOutput::ProbabilityMap(map) => LabelData::Probabilities(map),
            TypedOutput::ClassLabel { .. } => {
                return Err(ModelError::Execution {
                    name: self.model.clone(),
                    message: "model returned a class label instead of a volume".to_string(),
                }
                .into());
            }
        };
        if let LabelData::Mask(mask) = &data {
            let foreground = mask.iter().filter(|v| **v > 0).count();
            info!("  {} in {}: {} foreground voxels", self.target, space, foreground);
        }

        let annotation = Annotation {
            source: first.source.clone(),
            class: self.target.clone(),
            space: space.clone(),
            geometry,
            data,
        };
        Ok(vec![(key, Artifact::Annotation(Arc::new(annotation)))])
    }

    fn plan(&self, plan: &mut DependencyPlan) -> Result<(), StepError> {
        let (Some(first), Some(key)) = (self.inputs.first(), self.output_key()) else {
            return Err(DataError::NoInputData.into());
        };
        for input in &self.inputs {
            match &input.labels {
                Some(class) => plan.require_annotation(&input.source, class, &first.space)?,
                None => plan.require_volume(&input.source, &first.space)?,
            }
        }
        plan.insert(key);
        Ok(())
    }

    fn kind(&self) -> TaskKind {
        TaskKind::Segmentation
    }
}
