use image::{GrayImage, Luma};
use imageproc::region_labelling::{Connectivity, connected_components};
use ndarray::{Array3, Axis};
use std::collections::HashSet;

/// Binarize a probability map: voxels at or above `threshold` become 1
pub fn threshold(probabilities: &Array3<f32>, threshold: f32) -> Array3<u8> {
    probabilities.mapv(|p| u8::from(p >= threshold))
}

/// Fill background regions fully enclosed by foreground, slice by slice
/// along the last (axial) axis
pub fn fill_holes(mask: &mut Array3<u8>) {
    let (width, height, _) = mask.dim();
    if width == 0 || height == 0 {
        return;
    }

    for mut slice in mask.axis_iter_mut(Axis(2)) {
        // background becomes the labelled foreground of this image
        let background = GrayImage::from_fn(width as u32, height as u32, |x, y| {
            if slice[[x as usize, y as usize]] == 0 {
                Luma([255u8])
            } else {
                Luma([0u8])
            }
        });
        let labeled = connected_components(&background, Connectivity::Four, Luma([0u8]));

        let mut touches_border = HashSet::new();
        for (x, y, label) in labeled.enumerate_pixels() {
            let on_border = x == 0 || y == 0 || x + 1 == width as u32 || y + 1 == height as u32;
            if on_border && label[0] != 0 {
                touches_border.insert(label[0]);
            }
        }

        for (x, y, label) in labeled.enumerate_pixels() {
            if label[0] != 0 && !touches_border.contains(&label[0]) {
                slice[[x as usize, y as usize]] = 1;
            }
        }
    }
}

/// Numerically stable softmax
pub fn softmax(values: &[f32]) -> Vec<f32> {
    let max = values.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = values.iter().map(|v| (v - max).exp()).collect();
    let sum: f32 = exps.iter().sum();
    if sum > 0.0 {
        exps.iter().map(|e| e / sum).collect()
    } else {
        exps
    }
}

pub fn sigmoid(value: f32) -> f32 {
    1.0 / (1.0 + (-value).exp())
}
