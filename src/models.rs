use std::collections::BTreeMap;
use std::fmt;

use anyhow::Result;
use ndarray::Array3;
use serde::{Deserialize, Serialize};

use crate::core::affine::AffineTransform;

/// Tolerance (in millimetres) used when comparing geometries.
pub const GEOMETRY_TOLERANCE: f64 = 1e-4;

/// A reference frame, named after the (timestamp, sequence) of the volume
/// whose grid defines it
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Space {
    pub timestamp: u32,
    pub sequence: String,
}

impl Space {
    pub fn new(timestamp: u32, sequence: impl Into<String>) -> Self {
        Self {
            timestamp,
            sequence: sequence.into(),
        }
    }

    /// Filesystem-safe tag, e.g. "T0-T1-CE"
    pub fn tag(&self) -> String {
        format!("T{}-{}", self.timestamp, sanitize(&self.sequence))
    }
}

impl fmt::Display for Space {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(T{})", self.sequence, self.timestamp)
    }
}

/// Replace characters that do not belong in a file name
pub fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_whitespace() => '_',
            c => c,
        })
        .collect()
}

/// Voxel grid description: what makes two volumes share a space.
///
/// `direction[r][c]` is component `r` of the physical unit vector of index
/// axis `c`. Directions are assumed orthonormal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Geometry {
    pub dims: [usize; 3],
    pub spacing: [f64; 3],
    pub origin: [f64; 3],
    pub direction: [[f64; 3]; 3],
}

impl Geometry {
    /// Axis-aligned grid anchored at the physical origin
    pub fn new(dims: [usize; 3], spacing: [f64; 3]) -> Self {
        Self {
            dims,
            spacing,
            origin: [0.0; 3],
            direction: [[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]],
        }
    }

    pub fn with_origin(mut self, origin: [f64; 3]) -> Self {
        self.origin = origin;
        self
    }

    pub fn with_direction(mut self, direction: [[f64; 3]; 3]) -> Self {
        self.direction = direction;
        self
    }

    /// Continuous index to physical point
    pub fn index_to_physical(&self, index: [f64; 3]) -> [f64; 3] {
        let mut point = self.origin;
        for (r, p) in point.iter_mut().enumerate() {
            for c in 0..3 {
                *p += self.direction[r][c] * self.spacing[c] * index[c];
            }
        }
        point
    }

    /// Physical point to continuous index
    pub fn physical_to_index(&self, point: [f64; 3]) -> [f64; 3] {
        let delta = [
            point[0] - self.origin[0],
            point[1] - self.origin[1],
            point[2] - self.origin[2],
        ];
        let mut index = [0.0; 3];
        for (c, i) in index.iter_mut().enumerate() {
            let projected: f64 = (0..3).map(|r| self.direction[r][c] * delta[r]).sum();
            *i = projected / self.spacing[c];
        }
        index
    }

    /// Same dims, and spacing/origin/direction equal within `tolerance`
    pub fn approx_eq(&self, other: &Geometry, tolerance: f64) -> bool {
        let close = |a: f64, b: f64| (a - b).abs() <= tolerance;
        self.dims == other.dims
            && self.spacing.iter().zip(&other.spacing).all(|(a, b)| close(*a, *b))
            && self.origin.iter().zip(&other.origin).all(|(a, b)| close(*a, *b))
            && self
                .direction
                .iter()
                .flatten()
                .zip(other.direction.iter().flatten())
                .all(|(a, b)| close(*a, *b))
    }

    /// Array shape for voxel buffers on this grid
    pub fn shape(&self) -> (usize, usize, usize) {
        (self.dims[0], self.dims[1], self.dims[2])
    }
}

/// An intensity volume belonging to one (timestamp, sequence)
#[derive(Debug, Clone)]
pub struct Volume {
    /// The acquisition this data comes from
    pub source: Space,
    pub geometry: Geometry,
    pub voxels: Array3<f32>,
}

impl Volume {
    pub fn new(source: Space, geometry: Geometry, voxels: Array3<f32>) -> Result<Self> {
        anyhow::ensure!(
            voxels.dim() == geometry.shape(),
            "voxel buffer {:?} does not match grid {:?} for {}",
            voxels.dim(),
            geometry.dims,
            source
        );
        Ok(Self {
            source,
            geometry,
            voxels,
        })
    }
}

/// Direction a transform is applied in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Forward,
    Inverse,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Forward => "forward",
            Direction::Inverse => "inverse",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Voxel payload of an annotation
#[derive(Debug, Clone)]
pub enum LabelData {
    Mask(Array3<u8>),
    Probabilities(Array3<f32>),
}

impl LabelData {
    pub fn dim(&self) -> (usize, usize, usize) {
        match self {
            LabelData::Mask(mask) => mask.dim(),
            LabelData::Probabilities(map) => map.dim(),
        }
    }

    /// Values as floats, for use as a model input channel
    pub fn to_f32(&self) -> Array3<f32> {
        match self {
            LabelData::Mask(mask) => mask.mapv(f32::from),
            LabelData::Probabilities(map) => map.clone(),
        }
    }
}

/// A label map for one class, derived from `source` and laid out in `space`
#[derive(Debug, Clone)]
pub struct Annotation {
    pub source: Space,
    pub class: String,
    pub space: Space,
    pub geometry: Geometry,
    pub data: LabelData,
}

/// Per-volume classification result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassificationTag {
    pub source: Space,
    pub model: String,
    pub label: String,
    pub scores: Vec<(String, f32)>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TransformKind {
    Identity,
    Affine(AffineTransform),
}

/// Registration result for the ordered pair (moving, fixed).
///
/// The stored mapping is the one used to pull data: a `forward` transform
/// maps fixed-space points to moving-space points (used to resample moving
/// data onto the fixed grid), the `inverse` maps moving-space points to
/// fixed-space points.
#[derive(Debug, Clone, PartialEq)]
pub struct Transform {
    pub moving: Space,
    pub fixed: Space,
    pub direction: Direction,
    pub kind: TransformKind,
}

impl Transform {
    pub fn is_identity(&self) -> bool {
        matches!(self.kind, TransformKind::Identity)
    }

    /// Point mapping from the destination grid into the source grid
    pub fn pull_mapping(&self) -> AffineTransform {
        match &self.kind {
            TransformKind::Identity => AffineTransform::identity(),
            TransformKind::Affine(affine) => affine.clone(),
        }
    }

    /// Space the data lands in when applying this transform
    pub fn destination_space(&self) -> &Space {
        match self.direction {
            Direction::Forward => &self.fixed,
            Direction::Inverse => &self.moving,
        }
    }
}

/// All raw volumes of one patient, unique per (timestamp, sequence)
#[derive(Debug, Clone, Default)]
pub struct Patient {
    pub id: String,
    volumes: BTreeMap<Space, Volume>,
}

impl Patient {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            volumes: BTreeMap::new(),
        }
    }

    pub fn add_volume(&mut self, volume: Volume) -> Result<()> {
        if self.volumes.contains_key(&volume.source) {
            anyhow::bail!("patient {} already has a volume for {}", self.id, volume.source);
        }
        self.volumes.insert(volume.source.clone(), volume);
        Ok(())
    }

    pub fn with_volume(mut self, volume: Volume) -> Result<Self> {
        self.add_volume(volume)?;
        Ok(self)
    }

    pub fn volumes(&self) -> impl Iterator<Item = &Volume> {
        self.volumes.values()
    }

    pub fn volume(&self, space: &Space) -> Option<&Volume> {
        self.volumes.get(space)
    }

    /// Distinct timestamps, ascending
    pub fn timestamps(&self) -> Vec<u32> {
        let mut timestamps: Vec<u32> = self.volumes.keys().map(|s| s.timestamp).collect();
        timestamps.dedup();
        timestamps
    }

    pub fn sequences(&self, timestamp: u32) -> Vec<&str> {
        self.volumes
            .keys()
            .filter(|s| s.timestamp == timestamp)
            .map(|s| s.sequence.as_str())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.volumes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.volumes.is_empty()
    }

    pub fn into_volumes(self) -> impl Iterator<Item = Volume> {
        self.volumes.into_values()
    }
}
