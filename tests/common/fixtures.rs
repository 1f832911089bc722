use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use ndarray::{Array3, ArrayD, Axis, IxDyn, Slice};
use scanflow::core::affine::AffineTransform;
use scanflow::core::io::{VoxelBuffer, write_volume};
use scanflow::core::output::REPORT_FILE;
use scanflow::inference::{Model, ModelInvoker, ModelMetadata, Normalization};
use scanflow::steps::{MomentsRegistration, RegistrationBackend};
use scanflow::{Geometry, ModelError, Patient, Space, Volume};
use tempfile::TempDir;

pub const CLASSIFIER: &str = "MRI_Sequence_Classifier";
pub const BRAIN_MODEL: &str = "MRI_Brain";

/// Grid used by most tests: 12x12x8 voxels, anisotropic spacing
pub fn test_geometry() -> Geometry {
    Geometry::new([12, 12, 8], [1.0, 1.0, 2.0]).with_origin([-6.0, -6.0, -8.0])
}

/// A bright ball (100) on a dark background (0), centred at `centre` (voxel
/// indices)
pub fn sphere_volume(source: Space, geometry: Geometry, centre: [f64; 3], radius: f64) -> Volume {
    let voxels = Array3::from_shape_fn(geometry.shape(), |(i, j, k)| {
        let d = [i as f64 - centre[0], j as f64 - centre[1], k as f64 - centre[2]];
        if (d[0] * d[0] + d[1] * d[1] + d[2] * d[2]).sqrt() <= radius {
            100.0
        } else {
            0.0
        }
    });
    Volume::new(source, geometry, voxels).expect("sphere matches its grid")
}

/// Sphere in the middle of `test_geometry()`
pub fn brain_volume(timestamp: u32, sequence: &str) -> Volume {
    sphere_volume(Space::new(timestamp, sequence), test_geometry(), [6.0, 6.0, 4.0], 3.0)
}

/// One T1-CE acquisition at T0
pub fn single_volume_patient() -> Patient {
    Patient::new("patient")
        .with_volume(brain_volume(0, "T1-CE"))
        .expect("single volume")
}

/// Writes volumes as `<root>/patient/T<n>/<sequence>.mhd`.
/// Returns the temp dir (keep alive) and the patient folder.
pub fn create_patient_dir(volumes: &[Volume]) -> anyhow::Result<(TempDir, PathBuf)> {
    let dir = TempDir::new()?;
    let patient_dir = dir.path().join("patient");
    std::fs::create_dir_all(&patient_dir)?;
    for volume in volumes {
        let path = patient_dir
            .join(format!("T{}", volume.source.timestamp))
            .join(format!("{}.mhd", volume.source.sequence));
        write_volume(&path, &volume.geometry, VoxelBuffer::Float(&volume.voxels))?;
    }
    Ok((dir, patient_dir))
}

/// Write `volume` as an uncompressed single-file NIfTI-1 image with an sform
/// of `spacing` along the RAS axes, translated by `origin`
pub fn write_nifti(path: &Path, volume: &Array3<f32>, spacing: [f32; 3], origin: [f32; 3]) -> anyhow::Result<()> {
    let mut header = vec![0u8; 352];
    let mut put = |offset: usize, bytes: &[u8]| header[offset..offset + bytes.len()].copy_from_slice(bytes);

    put(0, &348i32.to_le_bytes());
    let (x, y, z) = volume.dim();
    for (i, dim) in [3, x, y, z, 1, 1, 1, 1].into_iter().enumerate() {
        put(40 + 2 * i, &u16::try_from(dim)?.to_le_bytes());
    }
    put(70, &16i16.to_le_bytes()); // float32
    put(72, &32i16.to_le_bytes());
    for (i, value) in [1.0, spacing[0], spacing[1], spacing[2]].into_iter().enumerate() {
        put(76 + 4 * i, &value.to_le_bytes());
    }
    put(108, &352f32.to_le_bytes());
    put(112, &1f32.to_le_bytes());
    put(254, &1i16.to_le_bytes()); // sform_code
    for axis in 0..3 {
        let mut row = [0f32; 4];
        row[axis] = spacing[axis];
        row[3] = origin[axis];
        for (i, value) in row.into_iter().enumerate() {
            put(280 + 16 * axis + 4 * i, &value.to_le_bytes());
        }
    }
    put(344, b"n+1\0");

    // x fastest
    header.extend(volume.t().iter().flat_map(|v| v.to_le_bytes()));
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, header)?;
    Ok(())
}

/// Always predicts the same scores
pub struct FixedClassifier {
    pub scores: Vec<f32>,
}

impl Model for FixedClassifier {
    fn run(&self, _input: ArrayD<f32>) -> anyhow::Result<ArrayD<f32>> {
        Ok(ArrayD::from_shape_vec(IxDyn(&[1, self.scores.len()]), self.scores.clone())?)
    }
}

/// Returns its first input channel as the foreground probability
pub struct EchoSegmenter;

impl Model for EchoSegmenter {
    fn run(&self, input: ArrayD<f32>) -> anyhow::Result<ArrayD<f32>> {
        anyhow::ensure!(input.ndim() == 5, "expected [1, C, x, y, z], got {:?}", input.shape());
        Ok(input.slice_axis(Axis(1), Slice::from(0..1)).to_owned())
    }
}

pub struct FailingModel;

impl Model for FailingModel {
    fn run(&self, _input: ArrayD<f32>) -> anyhow::Result<ArrayD<f32>> {
        anyhow::bail!("out of memory")
    }
}

/// Counts how often it is asked to register, delegating to the moments
/// backend
#[derive(Default)]
pub struct CountingRegistration {
    calls: AtomicUsize,
}

impl CountingRegistration {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl RegistrationBackend for CountingRegistration {
    fn name(&self) -> &str {
        "counting"
    }

    fn register(&self, moving: &Volume, fixed: &Volume) -> Result<AffineTransform, ModelError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        MomentsRegistration.register(moving, fixed)
    }
}

/// Register the classifier and brain segmenter used by the test pipelines
pub fn register_test_models(invoker: &ModelInvoker) {
    invoker.register(
        CLASSIFIER,
        Arc::new(FixedClassifier {
            scores: vec![0.1, 0.8, 0.1],
        }),
        ModelMetadata {
            labels: vec!["T1-w".into(), "T1-CE".into(), "FLAIR".into()],
            ..Default::default()
        },
    );
    invoker.register(
        BRAIN_MODEL,
        Arc::new(EchoSegmenter),
        ModelMetadata {
            normalization: Normalization::MinMax,
            ..Default::default()
        },
    );
}

/// Invoker with the test models and an empty model folder
pub fn test_invoker(model_dir: &Path) -> ModelInvoker {
    let invoker = ModelInvoker::new(model_dir);
    register_test_models(&invoker);
    invoker
}

/// classify all, segment Brain in T1-CE(T0), register T1-CE(T0) onto itself,
/// apply forward
pub const END_TO_END_PIPELINE: &str = r#"{
    "1": {
        "task": "Classification",
        "inputs": {},
        "model": "MRI_Sequence_Classifier",
        "description": "Classification of the MRI sequence type for all input scans."
    },
    "2": {
        "task": "Segmentation",
        "inputs": {
            "0": {
                "timestamp": 0,
                "sequence": "T1-CE",
                "labels": null,
                "space": { "timestamp": 0, "sequence": "T1-CE" }
            }
        },
        "target": "Brain",
        "model": "MRI_Brain",
        "format": "thresholding",
        "description": "Brain segmentation in T1-CE (T0)."
    },
    "3": {
        "task": "Registration",
        "moving": { "timestamp": 0, "sequence": "T1-CE" },
        "fixed": { "timestamp": 0, "sequence": "T1-CE" },
        "description": "Registration from T1CE (T0) to T1CE (T0)."
    },
    "4": {
        "task": "Apply registration",
        "moving": { "timestamp": 0, "sequence": "T1-CE" },
        "fixed": { "timestamp": 0, "sequence": "T1-CE" },
        "direction": "forward",
        "description": "Apply registration from T1CE (T0) to T1CE (T0)."
    }
}"#;

/// Identity registration of T1-CE(T0) and its forward application; runs
/// without any model
pub const REGISTRATION_ONLY: &str = r#"{
    "1": { "task": "Registration",
           "moving": { "timestamp": 0, "sequence": "T1-CE" },
           "fixed": { "timestamp": 0, "sequence": "T1-CE" } },
    "2": { "task": "Apply registration",
           "moving": { "timestamp": 0, "sequence": "T1-CE" },
           "fixed": { "timestamp": 0, "sequence": "T1-CE" },
           "direction": "forward" }
}"#;

/// Every file below `root` (except the run report) with its contents
pub fn snapshot(root: &Path) -> anyhow::Result<BTreeMap<PathBuf, Vec<u8>>> {
    let mut files = BTreeMap::new();
    let mut pending = vec![root.to_path_buf()];
    while let Some(dir) = pending.pop() {
        for entry in std::fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.is_dir() {
                pending.push(path);
            } else if path.file_name().is_some_and(|n| n != REPORT_FILE) {
                files.insert(path.strip_prefix(root)?.to_path_buf(), std::fs::read(&path)?);
            }
        }
    }
    Ok(files)
}

/// Write a YAML run configuration next to a pipeline file; returns the
/// config path
pub fn write_config(root: &Path, patient_dir: &Path, pipeline_json: &str) -> anyhow::Result<PathBuf> {
    let models = root.join("models");
    std::fs::create_dir_all(&models)?;
    let pipeline = root.join("test_pipeline.json");
    std::fs::write(&pipeline, pipeline_json)?;

    let config = format!(
        "system:\n  input_folder: {}\n  output_folder: {}\n  model_folder: {}\n  pipeline_filename: {}\n  gpu_id: -1\n\
runtime:\n  reconstruction_method: thresholding\n  reconstruction_order: resample_first\n",
        patient_dir.display(),
        root.join("results").display(),
        models.display(),
        pipeline.display()
    );
    let path = root.join("config.yaml");
    std::fs::write(&path, config)?;
    Ok(path)
}
