pub mod postprocess;
pub mod rten_model;

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::Context;
use ndarray::{Array3, ArrayD, Axis, IxDyn};
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::config::ReconstructionOrder;
use crate::core::resample::{Interpolation, resize};
use crate::error::ModelError;
use crate::models::Volume;
use rten_model::RtenModel;

/// Weights file expected in every model folder
pub const MODEL_FILE: &str = "model.rten";
/// Optional description of a model's pre/post-processing
pub const METADATA_FILE: &str = "model.json";

/// A pretrained network that maps one tensor to another.
///
/// Inputs are shaped `[1, channels, x, y, z]`, one channel per input volume.
pub trait Model: Send + Sync {
    fn run(&self, input: ArrayD<f32>) -> anyhow::Result<ArrayD<f32>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Normalization {
    None,
    MinMax,
    #[default]
    ZScore,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Activation {
    #[default]
    None,
    Sigmoid,
    Softmax,
}

/// Contents of `model.json`
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ModelMetadata {
    /// Grid the model expects; inputs are resized to it
    pub input_shape: Option<[usize; 3]>,
    /// Class names, in output order, for classifiers
    pub labels: Vec<String>,
    pub normalization: Normalization,
    pub activation: Activation,
    /// Channel holding the foreground probability; defaults to 1 for
    /// multi-channel outputs and 0 otherwise
    pub foreground_channel: Option<usize>,
}

/// How raw model output is wrapped
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OutputKind {
    ClassLabel,
    ProbabilityMap,
    ThresholdedMask { threshold: f32 },
}

#[derive(Debug, Clone)]
pub enum TypedOutput {
    ClassLabel { label: String, scores: Vec<(String, f32)> },
    /// On the grid of the first input
    ProbabilityMap(Array3<f32>),
    /// On the grid of the first input
    Mask(Array3<u8>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Device {
    Cpu,
    Gpu(u32),
}

impl Device {
    /// `-1` (or any negative id) selects the CPU
    pub fn from_gpu_id(gpu_id: i32) -> Self {
        u32::try_from(gpu_id).map(Device::Gpu).unwrap_or(Device::Cpu)
    }
}

struct LoadedModel {
    model: Arc<dyn Model>,
    metadata: ModelMetadata,
}

/// Runs named models from a model folder. Loaded models are cached; each
/// call is otherwise independent.
pub struct ModelInvoker {
    model_dir: PathBuf,
    device: Device,
    order: ReconstructionOrder,
    fill_holes: bool,
    loaded: Mutex<HashMap<String, Arc<LoadedModel>>>,
}

impl ModelInvoker {
    pub fn new(model_dir: impl Into<PathBuf>) -> Self {
        Self {
            model_dir: model_dir.into(),
            device: Device::Cpu,
            order: ReconstructionOrder::default(),
            fill_holes: false,
            loaded: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_device(mut self, device: Device) -> Self {
        if let Device::Gpu(id) = device {
            warn!("GPU {} requested but inference runs on the CPU", id);
        }
        self.device = device;
        self
    }

    pub fn with_reconstruction(mut self, order: ReconstructionOrder, fill_holes: bool) -> Self {
        self.order = order;
        self.fill_holes = fill_holes;
        self
    }

    /// Make an in-memory model available under `name`, shadowing the folder
    pub fn register(&self, name: impl Into<String>, model: Arc<dyn Model>, metadata: ModelMetadata) {
        let mut loaded = self.loaded.lock().unwrap_or_else(|e| e.into_inner());
        loaded.insert(name.into(), Arc::new(LoadedModel { model, metadata }));
    }

    fn load(&self, name: &str) -> Result<Arc<LoadedModel>, ModelError> {
        {
            let loaded = self.loaded.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(model) = loaded.get(name) {
                return Ok(model.clone());
            }
        }

        let folder = self.model_dir.join(name);
        let weights = folder.join(MODEL_FILE);
        if !weights.is_file() {
            return Err(ModelError::NotFound {
                name: name.to_string(),
                dir: self.model_dir.clone(),
            });
        }

        info!("Loading model {} from {} ({:?})", name, folder.display(), self.device);
        let execution = |e: anyhow::Error| ModelError::Execution {
            name: name.to_string(),
            message: format!("{:#}", e),
        };
        let metadata = read_metadata(&folder.join(METADATA_FILE)).map_err(execution)?;
        let model: Arc<dyn Model> = Arc::new(RtenModel::load(&weights).map_err(execution)?);

        let entry = Arc::new(LoadedModel { model, metadata });
        let mut loaded = self.loaded.lock().unwrap_or_else(|e| e.into_inner());
        Ok(loaded.entry(name.to_string()).or_insert(entry).clone())
    }

    /// Run `name` on `inputs` (one channel each, all on the same grid)
    pub fn invoke(&self, name: &str, inputs: &[&Volume], kind: OutputKind) -> Result<TypedOutput, ModelError> {
        let loaded = self.load(name)?;
        let execution = |message: String| ModelError::Execution {
            name: name.to_string(),
            message,
        };

        let Some(first) = inputs.first() else {
            return Err(execution("no input volumes".to_string()));
        };
        let native_shape = first.voxels.dim();
        if inputs.iter().any(|v| v.voxels.dim() != native_shape) {
            return Err(execution("input volumes must share one grid".to_string()));
        }

        let model_shape = loaded
            .metadata
            .input_shape
            .map(|s| (s[0], s[1], s[2]))
            .unwrap_or(native_shape);
        let tensor = build_input(inputs, &loaded.metadata, model_shape).map_err(|e| execution(e.to_string()))?;
        debug!("invoking {} on {} input(s), tensor {:?}", name, inputs.len(), tensor.shape());

        let output = loaded
            .model
            .run(tensor)
            .map_err(|e| execution(format!("{:#}", e)))?;

        match kind {
            OutputKind::ClassLabel => classify(&output, &loaded.metadata).map_err(execution),
            OutputKind::ProbabilityMap => {
                let map = foreground(&output, &loaded.metadata).map_err(execution)?;
                let map = resize(&map, native_shape, Interpolation::Linear).mapv(|p| p.clamp(0.0, 1.0));
                Ok(TypedOutput::ProbabilityMap(map))
            }
            OutputKind::ThresholdedMask { threshold } => {
                let map = foreground(&output, &loaded.metadata).map_err(execution)?;
                let mut mask = match self.order {
                    ReconstructionOrder::ResampleFirst => {
                        postprocess::threshold(&resize(&map, native_shape, Interpolation::Linear), threshold)
                    }
                    ReconstructionOrder::ResampleSecond => {
                        resize(&postprocess::threshold(&map, threshold), native_shape, Interpolation::Nearest)
                    }
                };
                if self.fill_holes {
                    postprocess::fill_holes(&mut mask);
                }
                Ok(TypedOutput::Mask(mask))
            }
        }
    }
}

fn read_metadata(path: &Path) -> anyhow::Result<ModelMetadata> {
    if !path.is_file() {
        return Ok(ModelMetadata::default());
    }
    let contents = fs::read_to_string(path)?;
    serde_json::from_str(&contents).with_context(|| format!("Invalid model metadata {}", path.display()))
}

fn normalize(data: &Array3<f32>, normalization: Normalization) -> Array3<f32> {
    match normalization {
        Normalization::None => data.clone(),
        Normalization::MinMax => {
            let min = data.iter().copied().fold(f32::INFINITY, f32::min);
            let max = data.iter().copied().fold(f32::NEG_INFINITY, f32::max);
            let range = if max > min { max - min } else { 1.0 };
            data.mapv(|v| (v - min) / range)
        }
        Normalization::ZScore => {
            let mean = data.mean().unwrap_or(0.0);
            let std = data.std(0.0);
            let std = if std > 0.0 { std } else { 1.0 };
            data.mapv(|v| (v - mean) / std)
        }
    }
}

fn build_input(
    inputs: &[&Volume],
    metadata: &ModelMetadata,
    shape: (usize, usize, usize),
) -> Result<ArrayD<f32>, ndarray::ShapeError> {
    let mut values = Vec::with_capacity(inputs.len() * shape.0 * shape.1 * shape.2);
    for volume in inputs {
        let channel = resize(
            &normalize(&volume.voxels, metadata.normalization),
            shape,
            Interpolation::Linear,
        );
        values.extend(channel.iter().copied());
    }
    ArrayD::from_shape_vec(IxDyn(&[1, inputs.len(), shape.0, shape.1, shape.2]), values)
}

fn activate(values: &[f32], activation: Activation) -> Vec<f32> {
    match activation {
        Activation::None => values.to_vec(),
        Activation::Sigmoid => values.iter().map(|v| postprocess::sigmoid(*v)).collect(),
        Activation::Softmax => postprocess::softmax(values),
    }
}

fn classify(output: &ArrayD<f32>, metadata: &ModelMetadata) -> Result<TypedOutput, String> {
    if output.is_empty() {
        return Err("classifier produced an empty output".to_string());
    }
    let values: Vec<f32> = output.iter().copied().collect();
    let scores = activate(&values, metadata.activation);
    let best = scores
        .iter()
        .enumerate()
        .fold(0, |best, (i, s)| if *s > scores[best] { i } else { best });

    let name = |i: usize| {
        metadata
            .labels
            .get(i)
            .cloned()
            .unwrap_or_else(|| format!("class_{}", i))
    };
    Ok(TypedOutput::ClassLabel {
        label: name(best),
        scores: scores.iter().enumerate().map(|(i, s)| (name(i), *s)).collect(),
    })
}

/// Foreground channel of a `[.., channels, x, y, z]` output
fn foreground(output: &ArrayD<f32>, metadata: &ModelMetadata) -> Result<Array3<f32>, String> {
    let shape = output.shape();
    let dims = shape.len();
    if dims < 3 || output.is_empty() {
        return Err(format!("expected a volumetric output, got shape {:?}", shape));
    }
    let spatial = (shape[dims - 3], shape[dims - 2], shape[dims - 1]);
    let channels: usize = shape[..dims - 3].iter().product();
    let output = output
        .to_shape((channels, spatial.0, spatial.1, spatial.2))
        .map_err(|e| e.to_string())?;

    let channel = metadata
        .foreground_channel
        .unwrap_or(if channels > 1 { 1 } else { 0 });
    if channel >= channels {
        return Err(format!("foreground channel {} out of range ({} channels)", channel, channels));
    }

    Ok(match metadata.activation {
        Activation::Softmax => output.map_axis(Axis(0), |per_voxel| {
            postprocess::softmax(&per_voxel.to_vec())[channel]
        }),
        Activation::Sigmoid => output.index_axis(Axis(0), channel).mapv(postprocess::sigmoid),
        Activation::None => output.index_axis(Axis(0), channel).to_owned(),
    })
}
