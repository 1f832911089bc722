//! Declarative pipeline descriptions.
//!
//! A description is a JSON object mapping step indices (as strings) to step
//! objects:
//!
//! ```json
//! {
//!   "1": { "task": "Classification", "inputs": {}, "model": "MRI_Sequence_Classifier" },
//!   "2": { "task": "Registration",
//!          "moving": { "timestamp": 0, "sequence": "T1-CE" },
//!          "fixed": { "timestamp": 0, "sequence": "T1-CE" } }
//! }
//! ```
//!
//! Everything is checked here, before any step runs.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

use crate::config::ReconstructionMethod;
use crate::error::SchemaError;
use crate::models::{Direction, Space};
use crate::steps::{
    ApplyRegistrationStep, ClassificationStep, InputSelection, RegistrationStep, SegmentationInput,
    SegmentationStep, Task, TaskKind,
};

/// One step of a pipeline
#[derive(Debug, Clone, PartialEq)]
pub struct Step {
    pub index: u32,
    pub description: String,
    pub task: Task,
}

impl Step {
    pub fn new(index: u32, description: impl Into<String>, task: Task) -> Self {
        Self {
            index,
            description: description.into(),
            task,
        }
    }
}

/// Steps in execution order (ascending index)
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PipelineDescription {
    steps: Vec<Step>,
}

impl PipelineDescription {
    /// Build from already-typed steps; fails on repeated indices
    pub fn new(mut steps: Vec<Step>) -> Result<Self, SchemaError> {
        steps.sort_by_key(|step| step.index);
        if let Some(pair) = steps.windows(2).find(|pair| pair[0].index == pair[1].index) {
            return Err(SchemaError::DuplicateIndex(pair[0].index));
        }
        Ok(Self { steps })
    }

    pub fn from_file(path: &Path) -> Result<Self, SchemaError> {
        let contents = fs::read_to_string(path).map_err(|source| SchemaError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&contents)
    }

    pub fn from_json(json: &str) -> Result<Self, SchemaError> {
        let value: Value = serde_json::from_str(json)?;
        Self::from_value(value)
    }

    pub fn from_value(value: Value) -> Result<Self, SchemaError> {
        let Value::Object(entries) = value else {
            return Err(SchemaError::NotAnObject);
        };
        if entries.is_empty() {
            return Err(SchemaError::Empty);
        }

        let mut steps = BTreeMap::new();
        for (key, body) in entries {
            let index: u32 = key.trim().parse().map_err(|_| SchemaError::BadIndex(key.clone()))?;
            if steps.contains_key(&index) {
                return Err(SchemaError::DuplicateIndex(index));
            }
            steps.insert(index, parse_step(index, body)?);
        }
        Ok(Self {
            steps: steps.into_values().collect(),
        })
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    pub fn iter(&self) -> impl Iterator<Item = &Step> {
        self.steps.iter()
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct SpaceDef {
    timestamp: u32,
    sequence: String,
}

impl From<SpaceDef> for Space {
    fn from(def: SpaceDef) -> Self {
        Space::new(def.timestamp, def.sequence)
    }
}

/// `inputs` may be an object keyed by position or a plain list
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum InputsDef<T> {
    Keyed(BTreeMap<String, T>),
    Listed(Vec<T>),
}

impl<T> InputsDef<T> {
    fn into_ordered(self) -> Result<Vec<T>, String> {
        match self {
            InputsDef::Listed(items) => Ok(items),
            InputsDef::Keyed(items) => {
                let mut keyed = Vec::with_capacity(items.len());
                for (key, item) in items {
                    let position: u32 = key
                        .trim()
                        .parse()
                        .map_err(|_| format!("input key '{}' is not an integer", key))?;
                    keyed.push((position, item));
                }
                keyed.sort_by_key(|(position, _)| *position);
                Ok(keyed.into_iter().map(|(_, item)| item).collect())
            }
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ClassificationDef {
    model: String,
    #[serde(default)]
    inputs: Option<InputsDef<SpaceDef>>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct SegmentationInputDef {
    timestamp: u32,
    sequence: String,
    #[serde(default)]
    labels: Option<String>,
    /// Defaults to the input's own space for the first input and to the
    /// first input's space after that
    #[serde(default)]
    space: Option<SpaceDef>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct SegmentationDef {
    model: String,
    target: String,
    inputs: InputsDef<SegmentationInputDef>,
    #[serde(default)]
    format: Option<ReconstructionMethod>,
    #[serde(default)]
    threshold: Option<f32>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RegistrationDef {
    moving: SpaceDef,
    fixed: SpaceDef,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ApplyRegistrationDef {
    moving: SpaceDef,
    fixed: SpaceDef,
    direction: Direction,
    #[serde(default)]
    annotations: Vec<String>,
}

fn parse_step(index: u32, body: Value) -> Result<Step, SchemaError> {
    let Value::Object(mut fields) = body else {
        return Err(SchemaError::MissingTask { index });
    };
    let task_name = match fields.remove("task") {
        Some(Value::String(task)) => task,
        Some(other) => {
            return Err(SchemaError::UnknownTask {
                index,
                task: other.to_string(),
            });
        }
        None => return Err(SchemaError::MissingTask { index }),
    };
    let kind = TaskKind::parse(&task_name).ok_or(SchemaError::UnknownTask {
        index,
        task: task_name.clone(),
    })?;
    let invalid = |message: String| SchemaError::InvalidStep {
        index,
        task: kind,
        message,
    };

    let description = match fields.remove("description") {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(description)) => description,
        Some(_) => return Err(invalid("'description' must be a string".to_string())),
    };

    let task = match kind {
        TaskKind::Classification => Task::Classification(classification(parse_fields(fields, invalid)?).map_err(invalid)?),
        TaskKind::Segmentation => Task::Segmentation(segmentation(parse_fields(fields, invalid)?).map_err(invalid)?),
        TaskKind::Registration => {
            let def: RegistrationDef = parse_fields(fields, invalid)?;
            Task::Registration(RegistrationStep {
                moving: def.moving.into(),
                fixed: def.fixed.into(),
            })
        }
        TaskKind::ApplyRegistration => {
            Task::ApplyRegistration(apply_registration(parse_fields(fields, invalid)?).map_err(invalid)?)
        }
    };

    Ok(Step {
        index,
        description,
        task,
    })
}

fn parse_fields<T: DeserializeOwned>(
    fields: Map<String, Value>,
    invalid: impl Fn(String) -> SchemaError,
) -> Result<T, SchemaError> {
    serde_json::from_value(Value::Object(fields)).map_err(|e| invalid(e.to_string()))
}

fn classification(def: ClassificationDef) -> Result<ClassificationStep, String> {
    if def.model.trim().is_empty() {
        return Err("'model' must not be empty".to_string());
    }
    // An empty `inputs` object means every available volume
    let spaces: Vec<Space> = match def.inputs {
        None => vec![],
        Some(inputs) => inputs.into_ordered()?.into_iter().map(Space::from).collect(),
    };
    let inputs = if spaces.is_empty() {
        InputSelection::AllAvailable
    } else {
        InputSelection::Explicit(spaces)
    };
    Ok(ClassificationStep {
        model: def.model,
        inputs,
    })
}

fn segmentation(def: SegmentationDef) -> Result<SegmentationStep, String> {
    if def.model.trim().is_empty() {
        return Err("'model' must not be empty".to_string());
    }
    if def.target.trim().is_empty() {
        return Err("'target' must not be empty".to_string());
    }
    if let Some(threshold) = def.threshold {
        if !(threshold > 0.0 && threshold < 1.0) {
            return Err(format!("'threshold' must be within (0, 1), got {}", threshold));
        }
    }

    // the first input fixes the space every channel is read in
    let mut inputs: Vec<SegmentationInput> = Vec::new();
    for input in def.inputs.into_ordered()? {
        let source = Space::new(input.timestamp, input.sequence);
        let declared = input.space.map(Space::from);
        let space = match (inputs.first(), declared) {
            (None, declared) => declared.unwrap_or_else(|| source.clone()),
            (Some(first), None) => first.space.clone(),
            (Some(first), Some(declared)) if declared == first.space => declared,
            (Some(first), Some(declared)) => {
                return Err(format!(
                    "input {} is read in {} but the step's output space is {}",
                    source, declared, first.space
                ));
            }
        };
        inputs.push(SegmentationInput {
            source,
            labels: input.labels,
            space,
        });
    }
    if inputs.is_empty() {
        return Err("'inputs' must list at least one volume".to_string());
    }

    Ok(SegmentationStep {
        model: def.model,
        target: def.target,
        inputs,
        format: def.format,
        threshold: def.threshold,
    })
}

fn apply_registration(def: ApplyRegistrationDef) -> Result<ApplyRegistrationStep, String> {
    if def.annotations.iter().any(|class| class.trim().is_empty()) {
        return Err("'annotations' must not contain empty class names".to_string());
    }
    Ok(ApplyRegistrationStep {
        moving: def.moving.into(),
        fixed: def.fixed.into(),
        direction: def.direction,
        annotations: def.annotations,
    })
}
