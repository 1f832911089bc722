//! Homogeneous 3D affine transforms over physical coordinates.

use serde::{Deserialize, Serialize};

/// Row-major 4x4 matrix acting on column vectors `[x, y, z, 1]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AffineTransform {
    pub matrix: [[f64; 4]; 4],
}

impl AffineTransform {
    pub fn identity() -> Self {
        let mut matrix = [[0.0; 4]; 4];
        for (i, row) in matrix.iter_mut().enumerate() {
            row[i] = 1.0;
        }
        Self { matrix }
    }

    pub fn translation(offset: [f64; 3]) -> Self {
        let mut affine = Self::identity();
        for (r, value) in offset.iter().enumerate() {
            affine.matrix[r][3] = *value;
        }
        affine
    }

    /// Linear part and translation
    pub fn from_parts(linear: [[f64; 3]; 3], translation: [f64; 3]) -> Self {
        let mut affine = Self::identity();
        for r in 0..3 {
            affine.matrix[r][..3].copy_from_slice(&linear[r]);
            affine.matrix[r][3] = translation[r];
        }
        affine
    }

    pub fn apply(&self, point: [f64; 3]) -> [f64; 3] {
        let m = &self.matrix;
        let mut out = [0.0; 3];
        for (r, value) in out.iter_mut().enumerate() {
            *value = m[r][0] * point[0] + m[r][1] * point[1] + m[r][2] * point[2] + m[r][3];
        }
        out
    }

    /// `self` applied after `first`
    pub fn compose(&self, first: &AffineTransform) -> Self {
        let mut matrix = [[0.0; 4]; 4];
        for (r, row) in matrix.iter_mut().enumerate() {
            for (c, value) in row.iter_mut().enumerate() {
                *value = (0..4).map(|k| self.matrix[r][k] * first.matrix[k][c]).sum();
            }
        }
        Self { matrix }
    }

    /// Inverse, or `None` when the linear part is singular
    pub fn inverse(&self) -> Option<Self> {
        let m = &self.matrix;
        let det = m[0][0] * (m[1][1] * m[2][2] - m[1][2] * m[2][1])
            - m[0][1] * (m[1][0] * m[2][2] - m[1][2] * m[2][0])
            + m[0][2] * (m[1][0] * m[2][1] - m[1][1] * m[2][0]);
        if det.abs() < 1e-12 {
            return None;
        }
        let inv_det = 1.0 / det;

        let linear = [
            [
                (m[1][1] * m[2][2] - m[1][2] * m[2][1]) * inv_det,
                (m[0][2] * m[2][1] - m[0][1] * m[2][2]) * inv_det,
                (m[0][1] * m[1][2] - m[0][2] * m[1][1]) * inv_det,
            ],
            [
                (m[1][2] * m[2][0] - m[1][0] * m[2][2]) * inv_det,
                (m[0][0] * m[2][2] - m[0][2] * m[2][0]) * inv_det,
                (m[0][2] * m[1][0] - m[0][0] * m[1][2]) * inv_det,
            ],
            [
                (m[1][0] * m[2][1] - m[1][1] * m[2][0]) * inv_det,
                (m[0][1] * m[2][0] - m[0][0] * m[2][1]) * inv_det,
                (m[0][0] * m[1][1] - m[0][1] * m[1][0]) * inv_det,
            ],
        ];

        let t = [m[0][3], m[1][3], m[2][3]];
        let mut translation = [0.0; 3];
        for (r, value) in translation.iter_mut().enumerate() {
            *value = -(linear[r][0] * t[0] + linear[r][1] * t[1] + linear[r][2] * t[2]);
        }
        Some(Self::from_parts(linear, translation))
    }

    pub fn is_identity(&self, tolerance: f64) -> bool {
        let identity = Self::identity();
        self.matrix
            .iter()
            .flatten()
            .zip(identity.matrix.iter().flatten())
            .all(|(a, b)| (a - b).abs() <= tolerance)
    }
}

impl Default for AffineTransform {
    fn default() -> Self {
        Self::identity()
    }
}
