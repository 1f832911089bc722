//! In-memory index of every artifact belonging to one patient run.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::error::RepositoryError;
use crate::models::{Annotation, ClassificationTag, Direction, Patient, Space, Transform, Volume};

/// Where an artifact lives in the repository.
///
/// `direction` is `None` for artifacts in the grid they were produced in and
/// `Some` for artifacts moved there by applying a registration.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ArtifactKey {
    Volume {
        source: Space,
        space: Space,
        direction: Option<Direction>,
    },
    Annotation {
        source: Space,
        class: String,
        space: Space,
        direction: Option<Direction>,
    },
    Classification {
        source: Space,
    },
    Transform {
        moving: Space,
        fixed: Space,
        direction: Direction,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactKind {
    Volume,
    Annotation,
    Classification,
    Transform,
}

impl ArtifactKey {
    /// A volume as loaded from the patient folder
    pub fn raw_volume(space: Space) -> Self {
        ArtifactKey::Volume {
            source: space.clone(),
            space,
            direction: None,
        }
    }

    pub fn annotation(source: Space, class: impl Into<String>, space: Space) -> Self {
        ArtifactKey::Annotation {
            source,
            class: class.into(),
            space,
            direction: None,
        }
    }

    pub fn transform(moving: Space, fixed: Space, direction: Direction) -> Self {
        ArtifactKey::Transform {
            moving,
            fixed,
            direction,
        }
    }

    pub fn kind(&self) -> ArtifactKind {
        match self {
            ArtifactKey::Volume { .. } => ArtifactKind::Volume,
            ArtifactKey::Annotation { .. } => ArtifactKind::Annotation,
            ArtifactKey::Classification { .. } => ArtifactKind::Classification,
            ArtifactKey::Transform { .. } => ArtifactKind::Transform,
        }
    }

    /// The acquisition the artifact derives from (the moving side for transforms)
    pub fn source(&self) -> &Space {
        match self {
            ArtifactKey::Volume { source, .. }
            | ArtifactKey::Annotation { source, .. }
            | ArtifactKey::Classification { source } => source,
            ArtifactKey::Transform { moving, .. } => moving,
        }
    }

    /// Grid the artifact is laid out in; `None` for classification tags
    pub fn space(&self) -> Option<&Space> {
        match self {
            ArtifactKey::Volume { space, .. } | ArtifactKey::Annotation { space, .. } => Some(space),
            ArtifactKey::Classification { .. } => None,
            ArtifactKey::Transform { fixed, .. } => Some(fixed),
        }
    }

    pub fn class(&self) -> Option<&str> {
        match self {
            ArtifactKey::Annotation { class, .. } => Some(class),
            _ => None,
        }
    }

    pub fn direction(&self) -> Option<Direction> {
        match self {
            ArtifactKey::Volume { direction, .. } | ArtifactKey::Annotation { direction, .. } => *direction,
            ArtifactKey::Transform { direction, .. } => Some(*direction),
            ArtifactKey::Classification { .. } => None,
        }
    }

    pub fn is_raw_volume(&self) -> bool {
        matches!(self, ArtifactKey::Volume { source, space, direction: None } if source == space)
    }
}

impl fmt::Display for ArtifactKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArtifactKey::Volume {
                source,
                space,
                direction,
            } => {
                write!(f, "volume {}", source)?;
                if source != space {
                    write!(f, " in {}", space)?;
                }
                if let Some(direction) = direction {
                    write!(f, " ({})", direction)?;
                }
                Ok(())
            }
            ArtifactKey::Annotation {
                source,
                class,
                space,
                direction,
            } => {
                write!(f, "{} annotation of {} in {}", class, source, space)?;
                if let Some(direction) = direction {
                    write!(f, " ({})", direction)?;
                }
                Ok(())
            }
            ArtifactKey::Classification { source } => write!(f, "classification of {}", source),
            ArtifactKey::Transform {
                moving,
                fixed,
                direction,
            } => write!(f, "{} transform {} -> {}", direction, moving, fixed),
        }
    }
}

#[derive(Debug, Clone)]
pub enum Artifact {
    Volume(Arc<Volume>),
    Annotation(Arc<Annotation>),
    Classification(Arc<ClassificationTag>),
    Transform(Arc<Transform>),
}

impl Artifact {
    pub fn kind(&self) -> ArtifactKind {
        match self {
            Artifact::Volume(_) => ArtifactKind::Volume,
            Artifact::Annotation(_) => ArtifactKind::Annotation,
            Artifact::Classification(_) => ArtifactKind::Classification,
            Artifact::Transform(_) => ArtifactKind::Transform,
        }
    }

    pub fn as_volume(&self) -> Option<&Arc<Volume>> {
        match self {
            Artifact::Volume(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_annotation(&self) -> Option<&Arc<Annotation>> {
        match self {
            Artifact::Annotation(a) => Some(a),
            _ => None,
        }
    }

    pub fn as_classification(&self) -> Option<&Arc<ClassificationTag>> {
        match self {
            Artifact::Classification(c) => Some(c),
            _ => None,
        }
    }

    pub fn as_transform(&self) -> Option<&Arc<Transform>> {
        match self {
            Artifact::Transform(t) => Some(t),
            _ => None,
        }
    }
}

/// Partial key; unset fields match anything
#[derive(Debug, Clone, Default)]
pub struct KeyFilter {
    timestamp: Option<u32>,
    sequence: Option<String>,
    kind: Option<ArtifactKind>,
    class: Option<String>,
    space: Option<Space>,
    derived: Option<bool>,
}

impl KeyFilter {
    pub fn any() -> Self {
        Self::default()
    }

    pub fn timestamp(mut self, timestamp: u32) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    pub fn sequence(mut self, sequence: impl Into<String>) -> Self {
        self.sequence = Some(sequence.into());
        self
    }

    pub fn kind(mut self, kind: ArtifactKind) -> Self {
        self.kind = Some(kind);
        self
    }

    pub fn class(mut self, class: impl Into<String>) -> Self {
        self.class = Some(class.into());
        self
    }

    pub fn in_space(mut self, space: Space) -> Self {
        self.space = Some(space);
        self
    }

    /// Only artifacts in the grid they were produced in
    pub fn native(mut self) -> Self {
        self.derived = Some(false);
        self
    }

    /// Only artifacts produced by applying a registration
    pub fn registered(mut self) -> Self {
        self.derived = Some(true);
        self
    }

    pub fn matches(&self, key: &ArtifactKey) -> bool {
        let source = key.source();
        if self.timestamp.is_some_and(|t| t != source.timestamp) {
            return false;
        }
        if self.sequence.as_deref().is_some_and(|s| s != source.sequence) {
            return false;
        }
        if self.kind.is_some_and(|k| k != key.kind()) {
            return false;
        }
        if let Some(class) = &self.class {
            if key.class() != Some(class.as_str()) {
                return false;
            }
        }
        if let Some(space) = &self.space {
            if key.space() != Some(space) {
                return false;
            }
        }
        if let Some(derived) = self.derived {
            let is_derived = match key {
                ArtifactKey::Volume { direction, .. } | ArtifactKey::Annotation { direction, .. } => {
                    direction.is_some()
                }
                _ => false,
            };
            if is_derived != derived {
                return false;
            }
        }
        true
    }
}

/// Every artifact of one patient run. Iteration order is the key order, so
/// listings are deterministic.
#[derive(Debug, Clone, Default)]
pub struct ImageRepository {
    patient_id: String,
    artifacts: BTreeMap<ArtifactKey, Artifact>,
}

impl ImageRepository {
    pub fn new(patient_id: impl Into<String>) -> Self {
        Self {
            patient_id: patient_id.into(),
            artifacts: BTreeMap::new(),
        }
    }

    /// Seed the repository with a patient's raw volumes
    pub fn from_patient(patient: Patient) -> Self {
        let mut repository = Self::new(patient.id.clone());
        for volume in patient.into_volumes() {
            let key = ArtifactKey::raw_volume(volume.source.clone());
            repository.put(key, Artifact::Volume(Arc::new(volume)));
        }
        repository
    }

    pub fn patient_id(&self) -> &str {
        &self.patient_id
    }

    /// Insert or overwrite; returns the previous artifact under `key`
    pub fn put(&mut self, key: ArtifactKey, artifact: Artifact) -> Option<Artifact> {
        debug_assert_eq!(key.kind(), artifact.kind(), "artifact kind must match its key");
        self.artifacts.insert(key, artifact)
    }

    pub fn get(&self, key: &ArtifactKey) -> Result<&Artifact, RepositoryError> {
        self.artifacts
            .get(key)
            .ok_or_else(|| RepositoryError::NotFound(key.clone()))
    }

    pub fn contains(&self, key: &ArtifactKey) -> bool {
        self.artifacts.contains_key(key)
    }

    /// Lazily walk artifacts matching `filter`. Each call starts over.
    pub fn list<'a>(&'a self, filter: &'a KeyFilter) -> impl Iterator<Item = (&'a ArtifactKey, &'a Artifact)> + 'a {
        self.artifacts.iter().filter(move |(key, _)| filter.matches(key))
    }

    pub fn keys(&self) -> impl Iterator<Item = &ArtifactKey> {
        self.artifacts.keys()
    }

    pub fn len(&self) -> usize {
        self.artifacts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.artifacts.is_empty()
    }

    pub fn volume(&self, key: &ArtifactKey) -> Result<Arc<Volume>, RepositoryError> {
        self.get(key)?
            .as_volume()
            .cloned()
            .ok_or_else(|| RepositoryError::NotFound(key.clone()))
    }

    pub fn annotation(&self, key: &ArtifactKey) -> Result<Arc<Annotation>, RepositoryError> {
        self.get(key)?
            .as_annotation()
            .cloned()
            .ok_or_else(|| RepositoryError::NotFound(key.clone()))
    }

    pub fn transform(&self, key: &ArtifactKey) -> Result<Arc<Transform>, RepositoryError> {
        self.get(key)?
            .as_transform()
            .cloned()
            .ok_or_else(|| RepositoryError::NotFound(key.clone()))
    }

    pub fn classification(&self, source: &Space) -> Result<Arc<ClassificationTag>, RepositoryError> {
        let key = ArtifactKey::Classification { source: source.clone() };
        self.get(&key)?
            .as_classification()
            .cloned()
            .ok_or(RepositoryError::NotFound(key))
    }

    /// Volumes exactly as loaded, in (timestamp, sequence) order
    pub fn raw_volumes(&self) -> impl Iterator<Item = &Arc<Volume>> {
        self.artifacts
            .iter()
            .filter(|(key, _)| key.is_raw_volume())
            .filter_map(|(_, artifact)| artifact.as_volume())
    }

    /// Data of `source` laid out in `space`: the raw volume when the two
    /// coincide, otherwise a registered copy (forward preferred)
    pub fn volume_in_space(&self, source: &Space, space: &Space) -> Result<Arc<Volume>, RepositoryError> {
        let key = |direction| ArtifactKey::Volume {
            source: source.clone(),
            space: space.clone(),
            direction,
        };
        self.first_placed(source == space, key, |a| a.as_volume().cloned())
    }

    /// Annotation of `class` derived from `source`, laid out in `space`
    pub fn annotation_in_space(
        &self,
        source: &Space,
        class: &str,
        space: &Space,
    ) -> Result<Arc<Annotation>, RepositoryError> {
        let key = |direction| ArtifactKey::Annotation {
            source: source.clone(),
            class: class.to_string(),
            space: space.clone(),
            direction,
        };
        self.first_placed(source == space, key, |a| a.as_annotation().cloned())
    }

    /// Try the native placement then both registered ones, reporting the
    /// preferred key when none exists
    fn first_placed<T>(
        &self,
        native_first: bool,
        key: impl Fn(Option<Direction>) -> ArtifactKey,
        extract: impl Fn(&Artifact) -> Option<T>,
    ) -> Result<T, RepositoryError> {
        let order: [Option<Direction>; 3] = if native_first {
            [None, Some(Direction::Forward), Some(Direction::Inverse)]
        } else {
            [Some(Direction::Forward), Some(Direction::Inverse), None]
        };
        for direction in order {
            if let Some(found) = self.artifacts.get(&key(direction)).and_then(&extract) {
                return Ok(found);
            }
        }
        Err(RepositoryError::NotFound(key(order[0])))
    }
}
