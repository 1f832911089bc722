//! Integration tests for the image repository and space resolution.
//!
//! Tests cover:
//! - put/get and NotFound
//! - Partial-key listing, restartable and in key order
//! - Native vs registered placement lookups
//! - Geometry resolution and resample decisions

mod common;

use std::sync::Arc;

use ndarray::Array3;
use scanflow::core::SpaceResolver;
use scanflow::core::repository::ArtifactKind;
use scanflow::error::{DataError, RepositoryError};
use scanflow::models::{Annotation, ClassificationTag};

use common::*;

fn two_timestamp_repository() -> anyhow::Result<ImageRepository> {
    let patient = Patient::new("p1")
        .with_volume(brain_volume(0, "T1-CE"))?
        .with_volume(brain_volume(0, "FLAIR"))?
        .with_volume(sphere_volume(
            Space::new(1, "T1-CE"),
            Geometry::new([10, 10, 10], [1.0, 1.0, 1.0]),
            [5.0, 5.0, 5.0],
            2.0,
        ))?;
    Ok(ImageRepository::from_patient(patient))
}

fn brain_mask(source: Space, space: Space, geometry: Geometry) -> Annotation {
    Annotation {
        source,
        class: "Brain".to_string(),
        space,
        data: LabelData::Mask(Array3::zeros(geometry.shape())),
        geometry,
    }
}

#[test]
fn test_put_get_and_not_found() -> anyhow::Result<()> {
    let mut repository = ImageRepository::new("p1");
    assert!(repository.is_empty());

    let key = ArtifactKey::Classification {
        source: Space::new(0, "T1-CE"),
    };
    let tag = ClassificationTag {
        source: Space::new(0, "T1-CE"),
        model: "m".into(),
        label: "T1-CE".into(),
        scores: vec![],
    };
    assert!(repository.put(key.clone(), Artifact::Classification(Arc::new(tag))).is_none());
    assert_eq!(repository.len(), 1);
    assert_eq!(repository.classification(&Space::new(0, "T1-CE"))?.label, "T1-CE");

    let missing = ArtifactKey::raw_volume(Space::new(3, "T2"));
    match repository.get(&missing) {
        Err(RepositoryError::NotFound(key)) => assert_eq!(key, missing),
        other => panic!("expected NotFound, got {:?}", other.map(|a| a.kind())),
    }
    Ok(())
}

#[test]
fn test_put_overwrites() -> anyhow::Result<()> {
    let mut repository = ImageRepository::new("p1");
    let key = ArtifactKey::raw_volume(Space::new(0, "T1-CE"));
    repository.put(key.clone(), Artifact::Volume(Arc::new(brain_volume(0, "T1-CE"))));
    let previous = repository.put(key.clone(), Artifact::Volume(Arc::new(brain_volume(0, "T1-CE"))));

    assert!(previous.is_some());
    assert_eq!(repository.len(), 1);
    Ok(())
}

#[test]
fn test_list_by_partial_key() -> anyhow::Result<()> {
    let repository = two_timestamp_repository()?;

    let at_t0 = KeyFilter::any().timestamp(0);
    let sequences: Vec<String> = repository
        .list(&at_t0)
        .map(|(key, _)| key.source().sequence.clone())
        .collect();
    // key order: FLAIR sorts before T1-CE
    assert_eq!(sequences, vec!["FLAIR", "T1-CE"]);

    // listing is restartable
    assert_eq!(repository.list(&at_t0).count(), 2);
    assert_eq!(repository.list(&at_t0).count(), 2);

    let t1ce = KeyFilter::any().sequence("T1-CE").kind(ArtifactKind::Volume);
    assert_eq!(repository.list(&t1ce).count(), 2);

    let annotations = KeyFilter::any().kind(ArtifactKind::Annotation);
    assert_eq!(repository.list(&annotations).count(), 0);
    Ok(())
}

#[test]
fn test_raw_volumes_in_key_order() -> anyhow::Result<()> {
    let repository = two_timestamp_repository()?;
    let sources: Vec<Space> = repository.raw_volumes().map(|v| v.source.clone()).collect();
    assert_eq!(
        sources,
        vec![Space::new(0, "FLAIR"), Space::new(0, "T1-CE"), Space::new(1, "T1-CE")]
    );
    Ok(())
}

#[test]
fn test_placement_lookups() -> anyhow::Result<()> {
    let mut repository = two_timestamp_repository()?;
    let t0 = Space::new(0, "T1-CE");
    let t1 = Space::new(1, "T1-CE");

    // native lookup finds the raw volume
    assert_eq!(repository.volume_in_space(&t0, &t0)?.source, t0);

    // no registered copy yet: report the forward key
    match repository.volume_in_space(&t1, &t0) {
        Err(RepositoryError::NotFound(ArtifactKey::Volume { direction, .. })) => {
            assert_eq!(direction, Some(Direction::Forward))
        }
        other => panic!("expected NotFound, got {:?}", other.map(|v| v.source.clone())),
    }

    let registered = Volume {
        source: t1.clone(),
        geometry: test_geometry(),
        voxels: Array3::zeros(test_geometry().shape()),
    };
    repository.put(
        ArtifactKey::Volume {
            source: t1.clone(),
            space: t0.clone(),
            direction: Some(Direction::Forward),
        },
        Artifact::Volume(Arc::new(registered)),
    );
    assert_eq!(repository.volume_in_space(&t1, &t0)?.geometry, test_geometry());

    let registered = KeyFilter::any().registered();
    assert_eq!(repository.list(&registered).count(), 1);
    let native = KeyFilter::any().native().in_space(t0.clone());
    assert_eq!(repository.list(&native).count(), 1);

    repository.put(
        ArtifactKey::annotation(t0.clone(), "Brain", t0.clone()),
        Artifact::Annotation(Arc::new(brain_mask(t0.clone(), t0.clone(), test_geometry()))),
    );
    assert_eq!(repository.annotation_in_space(&t0, "Brain", &t0)?.class, "Brain");
    assert!(repository.annotation_in_space(&t0, "Tumor", &t0).is_err());
    Ok(())
}

#[test]
fn test_resolve_space() -> anyhow::Result<()> {
    let mut repository = two_timestamp_repository()?;
    let resolver = SpaceResolver::new(&repository);

    assert_eq!(resolver.resolve_space(&Space::new(0, "T1-CE"))?, test_geometry());
    match resolver.resolve_space(&Space::new(4, "T2")) {
        Err(DataError::UnknownSpace(space)) => assert_eq!(space, Space::new(4, "T2")),
        other => panic!("expected UnknownSpace, got {:?}", other),
    }

    // a space known only through an annotation still resolves
    let atlas = Space::new(9, "Atlas");
    let geometry = Geometry::new([4, 4, 4], [2.0, 2.0, 2.0]);
    repository.put(
        ArtifactKey::annotation(atlas.clone(), "Brain", atlas.clone()),
        Artifact::Annotation(Arc::new(brain_mask(atlas.clone(), atlas.clone(), geometry.clone()))),
    );
    let resolver = SpaceResolver::new(&repository);
    assert_eq!(resolver.resolve_space(&atlas)?, geometry);
    Ok(())
}

#[test]
fn test_needs_resample() -> anyhow::Result<()> {
    let repository = two_timestamp_repository()?;
    let resolver = SpaceResolver::new(&repository);
    let t0 = Space::new(0, "T1-CE");
    let flair = Space::new(0, "FLAIR");
    let t1 = Space::new(1, "T1-CE");

    // identical spaces never need a resample
    assert!(!resolver.needs_resample(&t0, &t0)?);
    // same grid, different acquisition
    assert!(!resolver.needs_resample(&flair, &t0)?);
    assert!(resolver.needs_resample(&t1, &t0)?);
    assert!(matches!(
        resolver.needs_resample(&t0, &Space::new(5, "T2")),
        Err(DataError::UnknownSpace(_))
    ));
    Ok(())
}

#[test]
fn test_duplicate_patient_volume_is_rejected() -> anyhow::Result<()> {
    let mut patient = single_volume_patient();
    assert!(patient.add_volume(brain_volume(0, "T1-CE")).is_err());
    assert_eq!(patient.len(), 1);
    assert_eq!(patient.timestamps(), vec![0]);
    Ok(())
}
