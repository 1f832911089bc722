use std::sync::Arc;

use tracing::info;

use crate::core::repository::{Artifact, ArtifactKey};
use crate::core::resample::{Interpolation, resample};
use crate::error::{DependencyError, StepError};
use crate::models::{Annotation, Direction, Geometry, LabelData, Space, Transform, Volume};
use crate::steps::{DependencyPlan, PipelineStep, StepContext, StepOutput, TaskKind};

/// Move data between the two spaces of an earlier registration.
///
/// `forward` brings the moving volume (and its listed annotations) into the
/// fixed space; `inverse` brings the fixed volume and its annotations into
/// the moving space.
#[derive(Debug, Clone, PartialEq)]
pub struct ApplyRegistrationStep {
    pub moving: Space,
    pub fixed: Space,
    pub direction: Direction,
    /// Annotation classes carried along with the volume
    pub annotations: Vec<String>,
}

impl ApplyRegistrationStep {
    fn transform_key(&self) -> ArtifactKey {
        ArtifactKey::transform(self.moving.clone(), self.fixed.clone(), self.direction)
    }

    fn not_found(&self) -> StepError {
        DependencyError::TransformNotFound {
            moving: self.moving.clone(),
            fixed: self.fixed.clone(),
            direction: self.direction,
        }
        .into()
    }

    /// (source, destination) of the data being moved
    fn endpoints(&self) -> (&Space, &Space) {
        match self.direction {
            Direction::Forward => (&self.moving, &self.fixed),
            Direction::Inverse => (&self.fixed, &self.moving),
        }
    }

    fn volume_key(&self) -> ArtifactKey {
        let (source, destination) = self.endpoints();
        ArtifactKey::Volume {
            source: source.clone(),
            space: destination.clone(),
            direction: Some(self.direction),
        }
    }

    fn annotation_key(&self, class: &str) -> ArtifactKey {
        let (source, destination) = self.endpoints();
        ArtifactKey::Annotation {
            source: source.clone(),
            class: class.to_string(),
            space: destination.clone(),
            direction: Some(self.direction),
        }
    }
}

fn move_annotation(annotation: &Annotation, transform: &Transform, to: &Geometry) -> Annotation {
    let mapping = transform.pull_mapping();
    let data = match &annotation.data {
        LabelData::Mask(mask) => LabelData::Mask(resample(
            mask,
            &annotation.geometry,
            to,
            &mapping,
            Interpolation::Nearest,
            0,
        )),
        LabelData::Probabilities(map) => LabelData::Probabilities(resample(
            map,
            &annotation.geometry,
            to,
            &mapping,
            Interpolation::Linear,
            0.0,
        )),
    };
    Annotation {
        source: annotation.source.clone(),
        class: annotation.class.clone(),
        space: transform.destination_space().clone(),
        geometry: to.clone(),
        data,
    }
}

impl PipelineStep for ApplyRegistrationStep {
    fn execute(&self, context: &StepContext<'_>) -> Result<StepOutput, StepError> {
        let transform = context
            .repository
            .transform(&self.transform_key())
            .map_err(|_| self.not_found())?;
        let (source, destination) = self.endpoints();
        let target = context.spaces().resolve_space(destination)?;

        let volume = context.repository.volume_in_space(source, source)?;
        // identity between matching grids leaves the voxels untouched
        let voxels = if transform.is_identity() && !context.spaces().needs_resample(source, destination)? {
            volume.voxels.clone()
        } else {
            resample(
                &volume.voxels,
                &volume.geometry,
                &target,
                &transform.pull_mapping(),
                Interpolation::Linear,
                0.0,
            )
        };
        let moved = Volume {
            source: source.clone(),
            geometry: target.clone(),
            voxels,
        };
        info!("  moved {} into {} ({})", source, destination, self.direction);

        let mut result = vec![(self.volume_key(), Artifact::Volume(Arc::new(moved)))];
        for class in &self.annotations {
            let annotation = context.repository.annotation_in_space(source, class, source)?;
            let moved = move_annotation(&annotation, &transform, &target);
            result.push((self.annotation_key(class), Artifact::Annotation(Arc::new(moved))));
        }
        Ok(result)
    }

    fn plan(&self, plan: &mut DependencyPlan) -> Result<(), StepError> {
        if !plan.contains(&self.transform_key()) {
            return Err(self.not_found());
        }
        let (source, destination) = self.endpoints();
        plan.require_space(destination)?;
        plan.require_volume(source, source)?;
        for class in &self.annotations {
            plan.require_annotation(source, class, source)?;
        }

        plan.insert(self.volume_key());
        for class in &self.annotations {
            plan.insert(self.annotation_key(class));
        }
        Ok(())
    }

    fn kind(&self) -> TaskKind {
        TaskKind::ApplyRegistration
    }
}
