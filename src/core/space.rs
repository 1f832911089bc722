//! Maps a space name to the grid that defines it.

use crate::core::repository::{ArtifactKey, ArtifactKind, ImageRepository, KeyFilter};
use crate::error::DataError;
use crate::models::{GEOMETRY_TOLERANCE, Geometry, Space};

pub struct SpaceResolver<'a> {
    repository: &'a ImageRepository,
}

impl<'a> SpaceResolver<'a> {
    pub fn new(repository: &'a ImageRepository) -> Self {
        Self { repository }
    }

    /// Grid of `space`: the raw volume of that acquisition when present,
    /// otherwise any artifact already laid out in it
    pub fn resolve_space(&self, space: &Space) -> Result<Geometry, DataError> {
        if let Ok(volume) = self.repository.volume(&ArtifactKey::raw_volume(space.clone())) {
            return Ok(volume.geometry.clone());
        }

        let filter = KeyFilter::any().in_space(space.clone());
        self.repository
            .list(&filter)
            .find_map(|(key, artifact)| match key.kind() {
                ArtifactKind::Volume => artifact.as_volume().map(|v| v.geometry.clone()),
                ArtifactKind::Annotation => artifact.as_annotation().map(|a| a.geometry.clone()),
                _ => None,
            })
            .ok_or_else(|| DataError::UnknownSpace(space.clone()))
    }

    /// Whether data laid out in `source` has to be resampled to sit in
    /// `target`. Identical spaces never need it.
    pub fn needs_resample(&self, source: &Space, target: &Space) -> Result<bool, DataError> {
        if source == target {
            return Ok(false);
        }
        let source_geometry = self.resolve_space(source)?;
        let target_geometry = self.resolve_space(target)?;
        Ok(!source_geometry.approx_eq(&target_geometry, GEOMETRY_TOLERANCE))
    }
}
