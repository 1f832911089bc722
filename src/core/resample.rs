//! Resampling voxel buffers between grids.

use ndarray::Array3;

use crate::core::affine::AffineTransform;
use crate::models::Geometry;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interpolation {
    Nearest,
    Linear,
}

/// Resample `data` (laid out on `from`) onto the grid `to`.
///
/// `mapping` takes physical points of `to` into physical points of `from`.
/// Samples falling outside `from` are `fill`.
pub fn resample<T>(
    data: &Array3<T>,
    from: &Geometry,
    to: &Geometry,
    mapping: &AffineTransform,
    interpolation: Interpolation,
    fill: T,
) -> Array3<T>
where
    T: Copy + Into<f64> + FromSample,
{
    Array3::from_shape_fn(to.shape(), |(i, j, k)| {
        let point = mapping.apply(to.index_to_physical([i as f64, j as f64, k as f64]));
        let index = from.physical_to_index(point);
        match interpolation {
            Interpolation::Nearest => nearest(data, index).unwrap_or(fill),
            Interpolation::Linear => trilinear(data, index).map(T::from_sample).unwrap_or(fill),
        }
    })
}

/// Resize in index space to `shape`, aligning voxel centres at the corners.
/// Used to bring volumes to and from a model's fixed input size.
pub fn resize<T>(data: &Array3<T>, shape: (usize, usize, usize), interpolation: Interpolation) -> Array3<T>
where
    T: Copy + Default + Into<f64> + FromSample,
{
    let (sx, sy, sz) = data.dim();
    if (sx, sy, sz) == shape {
        return data.clone();
    }
    let scale = |src: usize, dst: usize| {
        if dst > 1 {
            (src.saturating_sub(1)) as f64 / (dst - 1) as f64
        } else {
            0.0
        }
    };
    let factors = [scale(sx, shape.0), scale(sy, shape.1), scale(sz, shape.2)];

    Array3::from_shape_fn(shape, |(i, j, k)| {
        let index = [i as f64 * factors[0], j as f64 * factors[1], k as f64 * factors[2]];
        match interpolation {
            Interpolation::Nearest => nearest(data, index).unwrap_or_default(),
            Interpolation::Linear => trilinear(data, index).map(T::from_sample).unwrap_or_default(),
        }
    })
}

/// Conversion back from an interpolated sample
pub trait FromSample {
    fn from_sample(value: f64) -> Self;
}

impl FromSample for f32 {
    fn from_sample(value: f64) -> Self {
        value as f32
    }
}

impl FromSample for u8 {
    fn from_sample(value: f64) -> Self {
        value.round().clamp(0.0, 255.0) as u8
    }
}

const EDGE_SLACK: f64 = 1e-6;

fn nearest<T: Copy>(data: &Array3<T>, index: [f64; 3]) -> Option<T> {
    let (sx, sy, sz) = data.dim();
    let round = |v: f64, size: usize| {
        let r = v.round();
        (r >= 0.0 && r < size as f64).then_some(r as usize)
    };
    Some(data[[round(index[0], sx)?, round(index[1], sy)?, round(index[2], sz)?]])
}

fn trilinear<T: Copy + Into<f64>>(data: &Array3<T>, index: [f64; 3]) -> Option<f64> {
    let dims = data.dim();
    let dims = [dims.0, dims.1, dims.2];

    let mut base = [0usize; 3];
    let mut frac = [0.0f64; 3];
    for axis in 0..3 {
        if dims[axis] == 0 {
            return None;
        }
        let v = index[axis];
        let max = (dims[axis] - 1) as f64;
        if v < -EDGE_SLACK || v > max + EDGE_SLACK {
            return None;
        }
        let v = v.clamp(0.0, max);
        let floor = v.floor().min((dims[axis].saturating_sub(2)) as f64).max(0.0);
        base[axis] = floor as usize;
        frac[axis] = v - floor;
    }

    let sample = |dx: usize, dy: usize, dz: usize| -> f64 {
        let x = (base[0] + dx).min(dims[0] - 1);
        let y = (base[1] + dy).min(dims[1] - 1);
        let z = (base[2] + dz).min(dims[2] - 1);
        data[[x, y, z]].into()
    };

    let lerp = |a: f64, b: f64, t: f64| a + (b - a) * t;
    let c00 = lerp(sample(0, 0, 0), sample(1, 0, 0), frac[0]);
    let c10 = lerp(sample(0, 1, 0), sample(1, 1, 0), frac[0]);
    let c01 = lerp(sample(0, 0, 1), sample(1, 0, 1), frac[0]);
    let c11 = lerp(sample(0, 1, 1), sample(1, 1, 1), frac[0]);
    let c0 = lerp(c00, c10, frac[1]);
    let c1 = lerp(c01, c11, frac[1]);
    Some(lerp(c0, c1, frac[2]))
}
