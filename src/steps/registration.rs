use std::sync::Arc;

use tracing::{debug, info};

use crate::core::affine::AffineTransform;
use crate::core::repository::{Artifact, ArtifactKey};
use crate::error::{ModelError, StepError};
use crate::models::{Direction, Geometry, Space, Transform, TransformKind, Volume};
use crate::steps::{DependencyPlan, PipelineStep, StepContext, StepOutput, TaskKind};

/// Computes the transform aligning one volume onto another
pub trait RegistrationBackend: Send + Sync {
    fn name(&self) -> &str;

    /// Mapping from physical points of `fixed` to physical points of `moving`
    fn register(&self, moving: &Volume, fixed: &Volume) -> Result<AffineTransform, ModelError>;
}

/// Aligns intensity centres of mass with a translation
#[derive(Debug, Clone, Copy, Default)]
pub struct MomentsRegistration;

impl MomentsRegistration {
    /// Intensity-weighted centroid in physical coordinates; the grid centre
    /// for constant volumes
    pub fn centroid(volume: &Volume) -> [f64; 3] {
        let min = volume.voxels.iter().copied().fold(f32::INFINITY, f32::min);
        let mut weighted = [0.0f64; 3];
        let mut total = 0.0f64;
        for ((i, j, k), value) in volume.voxels.indexed_iter() {
            let weight = f64::from((value - min).max(0.0));
            if weight > 0.0 {
                weighted[0] += weight * i as f64;
                weighted[1] += weight * j as f64;
                weighted[2] += weight * k as f64;
                total += weight;
            }
        }

        let index = if total > 0.0 {
            weighted.map(|w| w / total)
        } else {
            grid_centre(&volume.geometry)
        };
        volume.geometry.index_to_physical(index)
    }
}

fn grid_centre(geometry: &Geometry) -> [f64; 3] {
    geometry.dims.map(|d| d.saturating_sub(1) as f64 / 2.0)
}

impl RegistrationBackend for MomentsRegistration {
    fn name(&self) -> &str {
        "moments"
    }

    fn register(&self, moving: &Volume, fixed: &Volume) -> Result<AffineTransform, ModelError> {
        if moving.voxels.is_empty() || fixed.voxels.is_empty() {
            return Err(ModelError::Execution {
                name: self.name().to_string(),
                message: "cannot register an empty volume".to_string(),
            });
        }
        let moving_centre = Self::centroid(moving);
        let fixed_centre = Self::centroid(fixed);
        let offset = [
            moving_centre[0] - fixed_centre[0],
            moving_centre[1] - fixed_centre[1],
            moving_centre[2] - fixed_centre[2],
        ];
        debug!("moments registration offset {:?}", offset);
        Ok(AffineTransform::translation(offset))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RegistrationStep {
    pub moving: Space,
    pub fixed: Space,
}

impl RegistrationStep {
    fn key(&self, direction: Direction) -> ArtifactKey {
        ArtifactKey::transform(self.moving.clone(), self.fixed.clone(), direction)
    }

    fn transform(&self, direction: Direction, kind: TransformKind) -> (ArtifactKey, Artifact) {
        let transform = Transform {
            moving: self.moving.clone(),
            fixed: self.fixed.clone(),
            direction,
            kind,
        };
        (self.key(direction), Artifact::Transform(Arc::new(transform)))
    }
}

impl PipelineStep for RegistrationStep {
    fn execute(&self, context: &StepContext<'_>) -> Result<StepOutput, StepError> {
        let spaces = context.spaces();
        spaces.resolve_space(&self.moving)?;
        spaces.resolve_space(&self.fixed)?;

        if self.moving == self.fixed {
            info!("  {} registered onto itself, using identity", self.moving);
            return Ok(vec![
                self.transform(Direction::Forward, TransformKind::Identity),
                self.transform(Direction::Inverse, TransformKind::Identity),
            ]);
        }

        let moving = context.repository.volume_in_space(&self.moving, &self.moving)?;
        let fixed = context.repository.volume_in_space(&self.fixed, &self.fixed)?;
        let forward = context.registrar.register(&moving, &fixed)?;
        let Some(inverse) = forward.inverse() else {
            return Err(ModelError::Execution {
                name: context.registrar.name().to_string(),
                message: "registration produced a singular transform".to_string(),
            }
            .into());
        };
        info!(
            "  registered {} onto {} with {}",
            self.moving,
            self.fixed,
            context.registrar.name()
        );

        Ok(vec![
            self.transform(Direction::Forward, TransformKind::Affine(forward)),
            self.transform(Direction::Inverse, TransformKind::Affine(inverse)),
        ])
    }

    fn plan(&self, plan: &mut DependencyPlan) -> Result<(), StepError> {
        plan.require_space(&self.moving)?;
        plan.require_space(&self.fixed)?;
        if self.moving != self.fixed {
            plan.require_volume(&self.moving, &self.moving)?;
            plan.require_volume(&self.fixed, &self.fixed)?;
        }
        plan.insert(self.key(Direction::Forward));
        plan.insert(self.key(Direction::Inverse));
        Ok(())
    }

    fn kind(&self) -> TaskKind {
        TaskKind::Registration
    }
}

#[cfg(test)]
mod tests {
    use ndarray::Array3;

    use super::*;

    fn blob(origin: [f64; 3], at: (usize, usize, usize)) -> Volume {
        let geometry = Geometry::new([8, 8, 8], [1.0, 1.0, 1.0]).with_origin(origin);
        let mut voxels = Array3::zeros((8, 8, 8));
        voxels[at] = 10.0;
        Volume::new(Space::new(0, "T1"), geometry, voxels).unwrap()
    }

    #[test]
    fn centroid_of_single_voxel() {
        let volume = blob([10.0, 0.0, 0.0], (2, 3, 4));
        assert_eq!(MomentsRegistration::centroid(&volume), [12.0, 3.0, 4.0]);
    }

    #[test]
    fn constant_volume_uses_grid_centre() {
        let geometry = Geometry::new([5, 5, 3], [2.0, 2.0, 2.0]);
        let volume = Volume::new(Space::new(0, "T1"), geometry, Array3::from_elem((5, 5, 3), 7.0)).unwrap();
        assert_eq!(MomentsRegistration::centroid(&volume), [4.0, 4.0, 2.0]);
    }

    #[test]
    fn translation_maps_fixed_centre_onto_moving_centre() {
        let moving = blob([0.0; 3], (5, 5, 5));
        let fixed = blob([0.0; 3], (2, 3, 4));
        let forward = MomentsRegistration.register(&moving, &fixed).unwrap();
        assert_eq!(forward.apply([2.0, 3.0, 4.0]), [5.0, 5.0, 5.0]);
    }
}
