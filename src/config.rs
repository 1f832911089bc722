//! Run configuration.

use std::path::{Path, PathBuf};

use anyhow::Context;
use ini::{Ini, ParseOption, Properties};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Main configuration for one patient run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Folders and device
    pub system: SystemConfig,

    /// Post-processing defaults
    #[serde(default)]
    pub runtime: RuntimeConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemConfig {
    /// Patient folder holding `T<n>/<sequence>.mhd` volumes
    pub input_folder: PathBuf,

    /// Where artifacts and the run report are written
    pub output_folder: PathBuf,

    /// Folder with one sub-folder per model
    pub model_folder: PathBuf,

    /// JSON pipeline description
    pub pipeline_filename: PathBuf,

    /// GPU index; negative selects the CPU
    #[serde(default = "default_gpu_id")]
    pub gpu_id: i32,
}

/// How segmentation output is turned into annotations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconstructionMethod {
    /// Binarize at a threshold
    #[default]
    Thresholding,
    /// Keep the probability map
    Probabilities,
}

/// Whether model output is resized back to the volume grid before or
/// after binarization
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconstructionOrder {
    #[default]
    ResampleFirst,
    ResampleSecond,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Default for segmentation steps without a `format`
    #[serde(default)]
    pub reconstruction_method: ReconstructionMethod,

    #[serde(default)]
    pub reconstruction_order: ReconstructionOrder,

    /// Default binarization threshold
    #[serde(default = "default_threshold")]
    pub threshold: f32,

    /// Fill enclosed holes in thresholded masks
    #[serde(default = "default_fill_holes")]
    pub fill_holes: bool,

    /// Save mid-slice PNG previews under `<output>/previews`
    #[serde(default)]
    pub previews: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            reconstruction_method: ReconstructionMethod::default(),
            reconstruction_order: ReconstructionOrder::default(),
            threshold: default_threshold(),
            fill_holes: default_fill_holes(),
            previews: false,
        }
    }
}

impl Config {
    /// Load configuration from an INI, YAML or JSON file.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config {}: {}", path.display(), e))?;
        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");

        let config: Config = match ext {
            "json" => serde_json::from_str(&contents)?,
            "ini" | "cfg" => Self::from_ini(&contents)?,
            _ => serde_yaml::from_str(&contents)?,
        };
        Ok(config)
    }

    /// Load configuration from `[System]` and `[Runtime]` INI sections.
    /// Other sections and keys are ignored.
    pub fn from_ini(contents: &str) -> anyhow::Result<Self> {
        // backslashes in Windows paths are not escapes
        let options = ParseOption {
            enabled_escape: false,
            ..ParseOption::default()
        };
        let ini = Ini::load_from_str_opt(contents, options)?;

        let system = ini.section(Some("System")).context("Config has no [System] section")?;
        let folder = |key: &str| -> anyhow::Result<PathBuf> {
            let value = system
                .get(key)
                .with_context(|| format!("[System] has no '{}'", key))?;
            Ok(PathBuf::from(value.trim()))
        };
        let system_config = SystemConfig {
            input_folder: folder("input_folder")?,
            output_folder: folder("output_folder")?,
            model_folder: folder("model_folder")?,
            pipeline_filename: folder("pipeline_filename")?,
            gpu_id: ini_value(system, "gpu_id", |v| v.parse().ok())?.unwrap_or_else(default_gpu_id),
        };

        let mut runtime = RuntimeConfig::default();
        if let Some(section) = ini.section(Some("Runtime")) {
            if let Some(method) = ini_value(section, "reconstruction_method", ini_enum)? {
                runtime.reconstruction_method = method;
            }
            if let Some(order) = ini_value(section, "reconstruction_order", ini_enum)? {
                runtime.reconstruction_order = order;
            }
            if let Some(threshold) = ini_value(section, "threshold", |v| v.parse().ok())? {
                runtime.threshold = threshold;
            }
            if let Some(fill_holes) = ini_value(section, "fill_holes", ini_flag)? {
                runtime.fill_holes = fill_holes;
            }
            if let Some(previews) = ini_value(section, "previews", ini_flag)? {
                runtime.previews = previews;
            }
        }

        Ok(Config {
            system: system_config,
            runtime,
        })
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> anyhow::Result<Self> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    /// Serialize to YAML, e.g. to write a sample configuration.
    pub fn to_yaml(&self) -> anyhow::Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> anyhow::Result<()> {
        if !self.system.input_folder.is_dir() {
            anyhow::bail!("Input folder does not exist: {}", self.system.input_folder.display());
        }
        if !self.system.model_folder.is_dir() {
            anyhow::bail!("Model folder does not exist: {}", self.system.model_folder.display());
        }
        if !self.system.pipeline_filename.is_file() {
            anyhow::bail!(
                "Pipeline description not found: {}",
                self.system.pipeline_filename.display()
            );
        }
        if !(self.runtime.threshold > 0.0 && self.runtime.threshold < 1.0) {
            anyhow::bail!("Threshold must be within (0, 1), got {}", self.runtime.threshold);
        }
        Ok(())
    }
}

/// Optional INI value; present but unparsable is an error
fn ini_value<T>(section: &Properties, key: &str, parse: impl Fn(&str) -> Option<T>) -> anyhow::Result<Option<T>> {
    let Some(value) = section.get(key) else {
        return Ok(None);
    };
    match parse(value.trim()) {
        Some(parsed) => Ok(Some(parsed)),
        None => anyhow::bail!("Invalid value for '{}': {}", key, value),
    }
}

/// Enum value spelled as in the YAML/JSON configs
fn ini_enum<T: DeserializeOwned>(value: &str) -> Option<T> {
    serde_json::from_value(serde_json::Value::String(value.to_lowercase())).ok()
}

fn ini_flag(value: &str) -> Option<bool> {
    match value.to_lowercase().as_str() {
        "true" | "yes" | "on" | "1" => Some(true),
        "false" | "no" | "off" | "0" => Some(false),
        _ => None,
    }
}

// Default value functions for serde
fn default_gpu_id() -> i32 { -1 }
fn default_threshold() -> f32 { 0.5 }
fn default_fill_holes() -> bool { true }
