//! Volume files and the patient folder layout.
//!
//! Patients may hold NIfTI (`.nii`, `.nii.gz`) or MetaImage (`.mhd` +
//! `.raw`) volumes; derived volumes are written as MetaImage.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use ndarray::{Array3, ShapeBuilder};
use nifti::{NiftiHeader, NiftiObject, NiftiVolume, RandomAccessNiftiVolume, ReaderOptions};
use tracing::debug;

use crate::models::{Geometry, Patient, Space, Volume};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElementType {
    UChar,
    Char,
    UShort,
    Short,
    UInt,
    Int,
    Float,
    Double,
}

impl ElementType {
    fn parse(value: &str) -> Result<Self> {
        Ok(match value {
            "MET_UCHAR" => ElementType::UChar,
            "MET_CHAR" => ElementType::Char,
            "MET_USHORT" => ElementType::UShort,
            "MET_SHORT" => ElementType::Short,
            "MET_UINT" => ElementType::UInt,
            "MET_INT" => ElementType::Int,
            "MET_FLOAT" => ElementType::Float,
            "MET_DOUBLE" => ElementType::Double,
            other => bail!("unsupported element type {}", other),
        })
    }

    fn name(&self) -> &'static str {
        match self {
            ElementType::UChar => "MET_UCHAR",
            ElementType::Char => "MET_CHAR",
            ElementType::UShort => "MET_USHORT",
            ElementType::Short => "MET_SHORT",
            ElementType::UInt => "MET_UINT",
            ElementType::Int => "MET_INT",
            ElementType::Float => "MET_FLOAT",
            ElementType::Double => "MET_DOUBLE",
        }
    }

    fn size(&self) -> usize {
        match self {
            ElementType::UChar | ElementType::Char => 1,
            ElementType::UShort | ElementType::Short => 2,
            ElementType::UInt | ElementType::Int | ElementType::Float => 4,
            ElementType::Double => 8,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum DataFile {
    /// Voxels follow the header in the same file
    Local,
    /// Voxels live in a sibling file
    External(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct MetaHeader {
    pub geometry: Geometry,
    pub element_type: ElementType,
    pub big_endian: bool,
    pub data_file: DataFile,
}

/// Parse header lines; returns the header and the byte offset right after
/// the `ElementDataFile` line
pub fn parse_header(bytes: &[u8]) -> Result<(MetaHeader, usize)> {
    let mut ndims = None;
    let mut dims = None;
    let mut spacing = None;
    let mut origin = None;
    let mut direction = None;
    let mut element_type = None;
    let mut big_endian = false;
    let mut data_file = None;

    let mut offset = 0;
    while offset < bytes.len() {
        let end = bytes[offset..]
            .iter()
            .position(|b| *b == b'\n')
            .map(|p| offset + p + 1)
            .unwrap_or(bytes.len());
        let line = std::str::from_utf8(&bytes[offset..end])
            .context("header is not valid UTF-8")?
            .trim();
        offset = end;

        if line.is_empty() {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            bail!("malformed header line: {}", line);
        };
        let (key, value) = (key.trim(), value.trim());

        match key {
            "NDims" => ndims = Some(value.parse::<usize>().context("bad NDims")?),
            "DimSize" => dims = Some(parse_list::<usize>(value)?),
            "ElementSpacing" | "ElementSize" => spacing = Some(parse_list::<f64>(value)?),
            "Offset" | "Position" | "Origin" => origin = Some(parse_list::<f64>(value)?),
            "TransformMatrix" | "Orientation" | "Rotation" => direction = Some(parse_list::<f64>(value)?),
            "ElementType" => element_type = Some(ElementType::parse(value)?),
            "BinaryDataByteOrderMSB" | "ElementByteOrderMSB" => big_endian = parse_bool(value),
            "CompressedData" if parse_bool(value) => bail!("compressed MetaImage data is not supported"),
            "ElementNumberOfChannels" if value != "1" => bail!("only single-channel volumes are supported"),
            "ElementDataFile" => {
                data_file = Some(if value.eq_ignore_ascii_case("LOCAL") {
                    DataFile::Local
                } else {
                    DataFile::External(value.to_string())
                });
                break;
            }
            _ => {}
        }
    }

    let ndims = ndims.context("header has no NDims")?;
    if !(2..=3).contains(&ndims) {
        bail!("only 2D and 3D images are supported, got NDims = {}", ndims);
    }
    let dims = pad(&dims.context("header has no DimSize")?, ndims, 1)?;
    let spacing = pad(&spacing.unwrap_or_else(|| vec![1.0; ndims]), ndims, 1.0)?;
    let origin = pad(&origin.unwrap_or_else(|| vec![0.0; ndims]), ndims, 0.0)?;

    let mut geometry = Geometry::new([dims[0], dims[1], dims[2]], [spacing[0], spacing[1], spacing[2]])
        .with_origin([origin[0], origin[1], origin[2]]);
    if let Some(values) = direction {
        if values.len() != ndims * ndims {
            bail!("TransformMatrix needs {} values, got {}", ndims * ndims, values.len());
        }
        // one axis vector per index axis
        let mut matrix = geometry.direction;
        for c in 0..ndims {
            for r in 0..ndims {
                matrix[r][c] = values[c * ndims + r];
            }
        }
        geometry = geometry.with_direction(matrix);
    }

    let header = MetaHeader {
        geometry,
        element_type: element_type.context("header has no ElementType")?,
        big_endian,
        data_file: data_file.context("header has no ElementDataFile")?,
    };
    Ok((header, offset))
}

fn parse_list<T: std::str::FromStr>(value: &str) -> Result<Vec<T>> {
    value
        .split_whitespace()
        .map(|v| v.parse::<T>().map_err(|_| anyhow::anyhow!("bad numeric value '{}'", v)))
        .collect()
}

fn parse_bool(value: &str) -> bool {
    value.eq_ignore_ascii_case("true") || value == "1"
}

fn pad<T: Copy>(values: &[T], ndims: usize, fill: T) -> Result<[T; 3]> {
    if values.len() != ndims {
        bail!("expected {} values, got {}", ndims, values.len());
    }
    let mut out = [fill; 3];
    out[..ndims].copy_from_slice(values);
    Ok(out)
}

fn decode(bytes: &[u8], element_type: ElementType, big_endian: bool) -> Vec<f32> {
    macro_rules! convert {
        ($t:ty, $n:expr) => {
            bytes
                .chunks_exact($n)
                .map(|chunk| {
                    let mut raw = [0u8; $n];
                    raw.copy_from_slice(chunk);
                    let value = if big_endian {
                        <$t>::from_be_bytes(raw)
                    } else {
                        <$t>::from_le_bytes(raw)
                    };
                    value as f32
                })
                .collect()
        };
    }
    match element_type {
        ElementType::UChar => bytes.iter().map(|b| *b as f32).collect(),
        ElementType::Char => bytes.iter().map(|b| *b as i8 as f32).collect(),
        ElementType::UShort => convert!(u16, 2),
        ElementType::Short => convert!(i16, 2),
        ElementType::UInt => convert!(u32, 4),
        ElementType::Int => convert!(i32, 4),
        ElementType::Float => convert!(f32, 4),
        ElementType::Double => convert!(f64, 8),
    }
}

/// On-disk volume formats
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VolumeFormat {
    Nifti,
    MetaImage,
}

/// Format and sequence name of a volume file, e.g. `T1-CE.nii.gz`
pub fn volume_file(path: &Path) -> Option<(VolumeFormat, &str)> {
    let name = path.file_name()?.to_str()?;
    let lower = name.to_ascii_lowercase();
    [
        (".nii.gz", VolumeFormat::Nifti),
        (".nii", VolumeFormat::Nifti),
        (".mhd", VolumeFormat::MetaImage),
    ]
    .into_iter()
    .find(|(suffix, _)| lower.ends_with(suffix) && lower.len() > suffix.len())
    .map(|(suffix, format)| (format, &name[..name.len() - suffix.len()]))
}

/// Read a NIfTI or MetaImage volume and bind it to `source`
pub fn read_volume(path: &Path, source: Space) -> Result<Volume> {
    match volume_file(path) {
        Some((VolumeFormat::Nifti, _)) => read_nifti(path, source),
        Some((VolumeFormat::MetaImage, _)) => read_metaimage(path, source),
        None => bail!("{} is not a NIfTI or MetaImage file", path.display()),
    }
}

fn read_metaimage(path: &Path, source: Space) -> Result<Volume> {
    let bytes = fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
    let (header, data_offset) =
        parse_header(&bytes).with_context(|| format!("Invalid MetaImage header in {}", path.display()))?;

    let data = match &header.data_file {
        DataFile::Local => bytes[data_offset..].to_vec(),
        DataFile::External(name) => {
            let data_path = path.parent().unwrap_or_else(|| Path::new(".")).join(name);
            fs::read(&data_path).with_context(|| format!("Failed to read {}", data_path.display()))?
        }
    };

    let needed = header
        .geometry
        .dims
        .iter()
        .try_fold(header.element_type.size(), |bytes, dim| bytes.checked_mul(*dim))
        .with_context(|| format!("{}: DimSize {:?} is too large", path.display(), header.geometry.dims))?;
    if data.len() < needed {
        bail!(
            "{} holds {} bytes of voxel data, {} needed",
            path.display(),
            data.len(),
            needed
        );
    }

    let values = decode(&data[..needed], header.element_type, header.big_endian);
    // MetaImage stores x fastest
    let voxels = Array3::from_shape_vec(header.geometry.shape().f(), values)?;
    Volume::new(source, header.geometry, voxels.as_standard_layout().to_owned())
}

fn read_nifti(path: &Path, source: Space) -> Result<Volume> {
    let object = ReaderOptions::new()
        .read_file(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let geometry =
        nifti_geometry(object.header()).with_context(|| format!("Invalid NIfTI header in {}", path.display()))?;

    let volume = object.volume();
    let mut coords = vec![0u16; volume.dimensionality()];
    let axes = coords.len().min(3);
    let mut voxels = Array3::<f32>::zeros(geometry.shape());
    for ((i, j, k), value) in voxels.indexed_iter_mut() {
        // indices are bounded by the u16 header dims
        let index = [i as u16, j as u16, k as u16];
        coords[..axes].copy_from_slice(&index[..axes]);
        *value = volume
            .get_f32(&coords)
            .with_context(|| format!("{}: cannot read voxel {:?}", path.display(), index))?;
    }
    Volume::new(source, geometry, voxels)
}

/// Voxel grid of a NIfTI header, converted from RAS to the LPS convention
/// used everywhere else. The sform wins over the qform; with neither only
/// the voxel sizes are kept.
fn nifti_geometry(header: &NiftiHeader) -> Result<Geometry> {
    let ndims = usize::from(header.dim[0]);
    if !(2..=7).contains(&ndims) {
        bail!("only 2D and 3D images are supported, got {} dimensions", ndims);
    }
    if header.dim.iter().skip(4).take(ndims.saturating_sub(3)).any(|d| *d > 1) {
        bail!("only single-volume images are supported, got dim {:?}", header.dim);
    }
    let dims = [
        usize::from(header.dim[1]),
        usize::from(header.dim[2]),
        if ndims >= 3 { usize::from(header.dim[3]) } else { 1 },
    ];
    let pixdim = |axis: usize| {
        let size = f64::from(header.pixdim[axis + 1]).abs();
        if size > 0.0 { size } else { 1.0 }
    };
    let mut spacing = [pixdim(0), pixdim(1), pixdim(2)];
    let mut direction = [[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]];
    let mut origin = [0.0; 3];

    if header.sform_code > 0 {
        let rows = [header.srow_x, header.srow_y, header.srow_z];
        for c in 0..3 {
            let norm = (0..3).map(|r| f64::from(rows[r][c]).powi(2)).sum::<f64>().sqrt();
            if norm > 0.0 {
                spacing[c] = norm;
                for r in 0..3 {
                    direction[r][c] = f64::from(rows[r][c]) / norm;
                }
            }
        }
        origin = [rows[0][3], rows[1][3], rows[2][3]].map(f64::from);
    } else if header.qform_code > 0 {
        let (b, c, d) = (
            f64::from(header.quatern_b),
            f64::from(header.quatern_c),
            f64::from(header.quatern_d),
        );
        let a = (1.0 - b * b - c * c - d * d).max(0.0).sqrt();
        direction = [
            [a * a + b * b - c * c - d * d, 2.0 * (b * c - a * d), 2.0 * (b * d + a * c)],
            [2.0 * (b * c + a * d), a * a + c * c - b * b - d * d, 2.0 * (c * d - a * b)],
            [2.0 * (b * d - a * c), 2.0 * (c * d + a * b), a * a + d * d - c * c - b * b],
        ];
        if header.pixdim[0] < 0.0 {
            for row in &mut direction {
                row[2] = -row[2];
            }
        }
        origin = [header.quatern_x, header.quatern_y, header.quatern_z].map(f64::from);
    }

    // RAS -> LPS
    for r in 0..2 {
        origin[r] = -origin[r];
        for c in 0..3 {
            direction[r][c] = -direction[r][c];
        }
    }
    Ok(Geometry::new(dims, spacing).with_origin(origin).with_direction(direction))
}

/// Voxel buffers that can be written out
pub enum VoxelBuffer<'a> {
    Float(&'a Array3<f32>),
    Mask(&'a Array3<u8>),
}

/// Write `data` as `<path>` (header) plus a sibling `.raw` file; returns
/// both paths
pub fn write_volume(path: &Path, geometry: &Geometry, data: VoxelBuffer<'_>) -> Result<Vec<PathBuf>> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let raw_path = path.with_extension("raw");
    let raw_name = raw_path
        .file_name()
        .and_then(|n| n.to_str())
        .context("output path has no file name")?
        .to_string();

    let (element_type, bytes): (ElementType, Vec<u8>) = match data {
        VoxelBuffer::Float(array) => (
            ElementType::Float,
            array.t().iter().flat_map(|v| v.to_le_bytes()).collect(),
        ),
        VoxelBuffer::Mask(array) => (ElementType::UChar, array.t().iter().copied().collect()),
    };

    fs::write(path, format_header(geometry, element_type, &raw_name))
        .with_context(|| format!("Failed to write {}", path.display()))?;
    fs::write(&raw_path, bytes).with_context(|| format!("Failed to write {}", raw_path.display()))?;
    debug!("wrote {}", path.display());

    Ok(vec![path.to_path_buf(), raw_path])
}

fn join<T: std::fmt::Display>(values: impl IntoIterator<Item = T>) -> String {
    values
        .into_iter()
        .map(|v| v.to_string())
        .collect::<Vec<_>>()
        .join(" ")
}

fn format_header(geometry: &Geometry, element_type: ElementType, data_file: &str) -> String {
    let axes = (0..3).flat_map(|c| (0..3).map(move |r| geometry.direction[r][c]));
    [
        "ObjectType = Image".to_string(),
        "NDims = 3".to_string(),
        "BinaryData = True".to_string(),
        "BinaryDataByteOrderMSB = False".to_string(),
        "CompressedData = False".to_string(),
        format!("TransformMatrix = {}", join(axes)),
        format!("Offset = {}", join(geometry.origin)),
        "CenterOfRotation = 0 0 0".to_string(),
        format!("ElementSpacing = {}", join(geometry.spacing)),
        format!("DimSize = {}", join(geometry.dims)),
        format!("ElementType = {}", element_type.name()),
        format!("ElementDataFile = {}", data_file),
    ]
    .join("\n")
        + "\n"
}

/// Parse a timestamp folder name such as `T0` or `t12`
fn parse_timestamp_dir(name: &str) -> Option<u32> {
    let digits = name.strip_prefix('T').or_else(|| name.strip_prefix('t'))?;
    digits.parse().ok()
}

/// Load every `T<n>/<sequence>.{nii,nii.gz,mhd}` below `dir`
pub fn load_patient(dir: &Path) -> Result<Patient> {
    if !dir.is_dir() {
        bail!("Patient folder does not exist: {}", dir.display());
    }
    let id = dir
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("patient")
        .to_string();
    let mut patient = Patient::new(id);

    let mut timestamp_dirs: Vec<(u32, PathBuf)> = fs::read_dir(dir)?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.path().is_dir())
        .filter_map(|entry| {
            let timestamp = parse_timestamp_dir(entry.file_name().to_str()?)?;
            Some((timestamp, entry.path()))
        })
        .collect();
    timestamp_dirs.sort();

    for (timestamp, ts_dir) in timestamp_dirs {
        let mut files: Vec<PathBuf> = fs::read_dir(&ts_dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| path.is_file() && volume_file(path).is_some())
            .collect();
        files.sort();

        for file in files {
            let Some((_, sequence)) = volume_file(&file) else {
                continue;
            };
            let volume = read_volume(&file, Space::new(timestamp, sequence))?;
            debug!("loaded {} from {}", volume.source, file.display());
            patient.add_volume(volume)?;
        }
    }

    Ok(patient)
}
