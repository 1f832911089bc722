//! Writes run artifacts to the output folder, one file per artifact.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use image::{GrayImage, Luma};
use ndarray::{Array3, Axis};
use serde::Serialize;
use tracing::debug;

use crate::core::affine::AffineTransform;
use crate::core::io::{VoxelBuffer, write_volume};
use crate::core::repository::{Artifact, ArtifactKey};
use crate::models::{Direction, LabelData, Space, Transform, sanitize};

/// File name of the run summary in the output folder
pub const REPORT_FILE: &str = "pipeline_report.json";

/// On-disk form of a transform
#[derive(Debug, Serialize)]
struct TransformFile<'a> {
    moving: &'a Space,
    fixed: &'a Space,
    direction: Direction,
    identity: bool,
    /// Maps points of the destination grid to points of the source grid
    matrix: AffineTransform,
}

impl<'a> From<&'a Transform> for TransformFile<'a> {
    fn from(transform: &'a Transform) -> Self {
        Self {
            moving: &transform.moving,
            fixed: &transform.fixed,
            direction: transform.direction,
            identity: transform.is_identity(),
            matrix: transform.pull_mapping(),
        }
    }
}

/// Deterministic path of an artifact relative to the output folder
pub fn artifact_path(key: &ArtifactKey) -> PathBuf {
    let folder = |space: &Space| PathBuf::from(format!("T{}", space.timestamp));
    let placement = |source: &Space, space: &Space, direction: &Option<Direction>| {
        let mut suffix = String::new();
        if source != space {
            suffix.push_str(&format!("_in_{}", space.tag()));
        }
        if let Some(direction) = direction {
            suffix.push_str(&format!("_{}", direction));
        }
        suffix
    };

    match key {
        ArtifactKey::Volume {
            source,
            space,
            direction,
        } => {
            let stem = match direction {
                Some(direction) => format!("{}_{}_in_{}", sanitize(&source.sequence), direction, space.tag()),
                None => format!("{}{}", sanitize(&source.sequence), placement(source, space, direction)),
            };
            folder(source).join(format!("{}.mhd", stem))
        }
        ArtifactKey::Annotation {
            source,
            class,
            space,
            direction,
        } => folder(source).join(format!(
            "{}_label_{}{}.mhd",
            sanitize(&source.sequence),
            sanitize(class),
            placement(source, space, direction)
        )),
        ArtifactKey::Classification { source } => {
            folder(source).join(format!("{}_classification.json", sanitize(&source.sequence)))
        }
        ArtifactKey::Transform {
            moving,
            fixed,
            direction,
        } => PathBuf::from("transforms").join(format!("{}_to_{}_{}.json", moving.tag(), fixed.tag(), direction)),
    }
}

pub struct ArtifactWriter {
    root: PathBuf,
    previews: Option<PathBuf>,
}

impl ArtifactWriter {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)
            .with_context(|| format!("Failed to create output folder {}", root.display()))?;
        Ok(Self { root, previews: None })
    }

    /// Also save a mid-axial PNG per image artifact under `dir`
    pub fn with_previews(mut self, dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        self.previews = Some(dir);
        Ok(self)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Write one artifact; raw input volumes are never rewritten
    pub fn write(&self, key: &ArtifactKey, artifact: &Artifact) -> Result<Vec<PathBuf>> {
        if key.is_raw_volume() {
            return Ok(vec![]);
        }
        let path = self.root.join(artifact_path(key));
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let written = match artifact {
            Artifact::Volume(volume) => write_volume(&path, &volume.geometry, VoxelBuffer::Float(&volume.voxels))?,
            Artifact::Annotation(annotation) => {
                let buffer = match &annotation.data {
                    LabelData::Mask(mask) => VoxelBuffer::Mask(mask),
                    LabelData::Probabilities(map) => VoxelBuffer::Float(map),
                };
                write_volume(&path, &annotation.geometry, buffer)?
            }
            Artifact::Classification(tag) => {
                write_json(&path, &**tag)?;
                vec![path]
            }
            Artifact::Transform(transform) => {
                write_json(&path, &TransformFile::from(&**transform))?;
                vec![path]
            }
        };
        Ok(written)
    }

    /// Save a preview under `<previews>/<NN>_<step name>/`
    pub fn write_preview(
        &self,
        step_index: u32,
        step_name: &str,
        key: &ArtifactKey,
        artifact: &Artifact,
    ) -> Result<Option<PathBuf>> {
        let Some(previews) = &self.previews else {
            return Ok(None);
        };
        let image = match artifact {
            Artifact::Volume(volume) => middle_slice(&volume.voxels),
            Artifact::Annotation(annotation) => match &annotation.data {
                LabelData::Mask(mask) => middle_slice(&mask.mapv(f32::from)),
                LabelData::Probabilities(map) => middle_slice(map),
            },
            _ => return Ok(None),
        };
        let Some(image) = image else {
            return Ok(None);
        };

        let step_dir_name = format!("{:02}_{}", step_index, step_name.to_lowercase().replace(' ', "_"));
        let step_dir = previews.join(&step_dir_name);
        fs::create_dir_all(&step_dir)?;
        let file_name = artifact_path(key)
            .file_stem()
            .and_then(|s| s.to_str())
            .map(|s| format!("T{}_{}.png", key.source().timestamp, s))
            .context("artifact has no file stem")?;
        let output_path = step_dir.join(file_name);
        image
            .save(&output_path)
            .map_err(|e| anyhow::anyhow!("Failed to save preview image: {}", e))?;
        debug!("saved preview {}", output_path.display());
        Ok(Some(output_path))
    }

    pub fn write_report<T: Serialize>(&self, report: &T) -> Result<PathBuf> {
        let path = self.root.join(REPORT_FILE);
        write_json(&path, report)?;
        Ok(path)
    }
}

fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value)?;
    fs::write(path, json).with_context(|| format!("Failed to write {}", path.display()))?;
    debug!("wrote {}", path.display());
    Ok(())
}

/// Mid-axial slice stretched to 0..255
fn middle_slice(data: &Array3<f32>) -> Option<GrayImage> {
    let (width, height, depth) = data.dim();
    if width == 0 || height == 0 || depth == 0 {
        return None;
    }
    let slice = data.index_axis(Axis(2), depth / 2);
    let (min, max) = slice
        .iter()
        .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), v| (lo.min(*v), hi.max(*v)));
    let range = if max > min { max - min } else { 1.0 };

    Some(GrayImage::from_fn(width as u32, height as u32, |x, y| {
        let value = (slice[[x as usize, y as usize]] - min) / range;
        Luma([(value * 255.0).round().clamp(0.0, 255.0) as u8])
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn artifact_names_are_deterministic() {
        let t1ce = Space::new(0, "T1-CE");
        let flair = Space::new(1, "FLAIR");

        assert_eq!(
            artifact_path(&ArtifactKey::annotation(t1ce.clone(), "Brain", t1ce.clone())),
            PathBuf::from("T0/T1-CE_label_Brain.mhd")
        );
        assert_eq!(
            artifact_path(&ArtifactKey::Annotation {
                source: flair.clone(),
                class: "Tumor".into(),
                space: t1ce.clone(),
                direction: Some(Direction::Forward),
            }),
            PathBuf::from("T1/FLAIR_label_Tumor_in_T0-T1-CE_forward.mhd")
        );
        assert_eq!(
            artifact_path(&ArtifactKey::Volume {
                source: t1ce.clone(),
                space: t1ce.clone(),
                direction: Some(Direction::Forward),
            }),
            PathBuf::from("T0/T1-CE_forward_in_T0-T1-CE.mhd")
        );
        assert_eq!(
            artifact_path(&ArtifactKey::Classification { source: flair.clone() }),
            PathBuf::from("T1/FLAIR_classification.json")
        );
        assert_eq!(
            artifact_path(&ArtifactKey::transform(flair, t1ce, Direction::Inverse)),
            PathBuf::from("transforms/T1-FLAIR_to_T0-T1-CE_inverse.json")
        );
    }

    #[test]
    fn middle_slice_stretches_contrast() {
        let data = Array3::from_shape_fn((2, 2, 3), |(x, _, z)| (x + z) as f32);
        let image = middle_slice(&data).unwrap();
        assert_eq!(image.dimensions(), (2, 2));
        assert_eq!(image.get_pixel(0, 0)[0], 0);
        assert_eq!(image.get_pixel(1, 0)[0], 255);
    }
}
