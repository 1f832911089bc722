//! Integration tests for volume files, patient folders and artifact output.

mod common;

use std::sync::Arc;

use ndarray::Array3;
use scanflow::core::io::{VoxelBuffer, load_patient, read_volume, write_volume};
use scanflow::core::output::ArtifactWriter;
use scanflow::models::{Annotation, GEOMETRY_TOLERANCE};

use common::*;

#[test]
fn test_volume_survives_write_and_read() -> anyhow::Result<()> {
    let dir = tempfile::TempDir::new()?;
    let geometry = Geometry::new([3, 4, 5], [0.5, 0.75, 2.0])
        .with_origin([10.0, -20.0, 30.5])
        .with_direction([[0.0, -1.0, 0.0], [1.0, 0.0, 0.0], [0.0, 0.0, 1.0]]);
    let voxels = Array3::from_shape_fn((3, 4, 5), |(i, j, k)| (i + 3 * j + 12 * k) as f32 - 7.5);

    let path = dir.path().join("T0").join("T1-CE.mhd");
    let written = write_volume(&path, &geometry, VoxelBuffer::Float(&voxels))?;
    assert_eq!(written, vec![path.clone(), path.with_extension("raw")]);

    let volume = read_volume(&path, Space::new(0, "T1-CE"))?;
    assert!(volume.geometry.approx_eq(&geometry, GEOMETRY_TOLERANCE));
    assert_eq!(volume.voxels, voxels);
    Ok(())
}

#[test]
fn test_mask_is_written_as_bytes() -> anyhow::Result<()> {
    let dir = tempfile::TempDir::new()?;
    let geometry = Geometry::new([2, 2, 2], [1.0, 1.0, 1.0]);
    let mask = Array3::from_shape_fn((2, 2, 2), |(i, _, _)| i as u8);

    let path = dir.path().join("mask.mhd");
    write_volume(&path, &geometry, VoxelBuffer::Mask(&mask))?;

    let header = std::fs::read_to_string(&path)?;
    assert!(header.contains("ElementType = MET_UCHAR"));
    assert_eq!(std::fs::metadata(path.with_extension("raw"))?.len(), 8);
    let volume = read_volume(&path, Space::new(0, "mask"))?;
    assert_eq!(volume.voxels, mask.mapv(f32::from));
    Ok(())
}

#[test]
fn test_load_patient_folder() -> anyhow::Result<()> {
    let (_dir, patient_dir) = create_patient_dir(&[
        brain_volume(0, "T1-CE"),
        brain_volume(0, "FLAIR"),
        brain_volume(2, "T1-CE"),
    ])?;
    // unrelated files and folders are ignored
    std::fs::write(patient_dir.join("T0").join("notes.txt"), "not an image")?;
    std::fs::create_dir_all(patient_dir.join("reports"))?;

    let patient = load_patient(&patient_dir)?;
    assert_eq!(patient.id, "patient");
    assert_eq!(patient.len(), 3);
    assert_eq!(patient.timestamps(), vec![0, 2]);
    assert_eq!(patient.sequences(0), vec!["FLAIR", "T1-CE"]);
    let volume = patient.volume(&Space::new(2, "T1-CE")).expect("T2 follow-up loaded");
    assert_eq!(volume.voxels, brain_volume(2, "T1-CE").voxels);
    Ok(())
}

#[test]
fn test_load_patient_reads_nifti_volumes() -> anyhow::Result<()> {
    let (_dir, patient_dir) = create_patient_dir(&[brain_volume(0, "T1-CE")])?;
    let voxels = Array3::from_shape_fn((3, 4, 5), |(i, j, k)| (i + 3 * j + 12 * k) as f32 * 0.5);
    write_nifti(
        &patient_dir.join("T0").join("FLAIR.nii"),
        &voxels,
        [2.0, 1.0, 1.5],
        [10.0, 20.0, -30.0],
    )?;

    let patient = load_patient(&patient_dir)?;
    assert_eq!(patient.sequences(0), vec!["FLAIR", "T1-CE"]);

    let flair = patient.volume(&Space::new(0, "FLAIR")).expect("NIfTI volume loaded");
    assert_eq!(flair.voxels, voxels);
    // RAS header, LPS geometry
    let expected = Geometry::new([3, 4, 5], [2.0, 1.0, 1.5])
        .with_origin([-10.0, -20.0, -30.0])
        .with_direction([[-1.0, 0.0, 0.0], [0.0, -1.0, 0.0], [0.0, 0.0, 1.0]]);
    assert!(flair.geometry.approx_eq(&expected, GEOMETRY_TOLERANCE));
    Ok(())
}

#[test]
fn test_empty_patient_folder() -> anyhow::Result<()> {
    let (_dir, patient_dir) = create_patient_dir(&[])?;
    let patient = load_patient(&patient_dir)?;
    assert!(patient.is_empty());

    assert!(load_patient(&patient_dir.join("missing")).is_err());
    Ok(())
}

#[test]
fn test_writer_skips_raw_volumes_and_saves_previews() -> anyhow::Result<()> {
    let dir = tempfile::TempDir::new()?;
    let writer = ArtifactWriter::new(dir.path().join("out"))?.with_previews(dir.path().join("previews"))?;
    let t0 = Space::new(0, "T1-CE");

    let raw = Artifact::Volume(Arc::new(brain_volume(0, "T1-CE")));
    let raw_key = ArtifactKey::raw_volume(t0.clone());
    assert!(writer.write(&raw_key, &raw)?.is_empty());

    let geometry = test_geometry();
    let annotation = Annotation {
        source: t0.clone(),
        class: "Brain".into(),
        space: t0.clone(),
        data: LabelData::Mask(brain_volume(0, "T1-CE").voxels.mapv(|v| u8::from(v > 0.0))),
        geometry,
    };
    let key = ArtifactKey::annotation(t0.clone(), "Brain", t0.clone());
    let artifact = Artifact::Annotation(Arc::new(annotation));
    let files = writer.write(&key, &artifact)?;
    assert_eq!(files.len(), 2);
    assert!(files.iter().all(|f| f.is_file()));

    let preview = writer.write_preview(2, "Segmentation", &key, &artifact)?;
    let preview = preview.expect("annotations get a preview");
    assert!(preview.starts_with(dir.path().join("previews").join("02_segmentation")));
    assert_eq!(image::open(&preview)?.width(), 12);
    Ok(())
}
