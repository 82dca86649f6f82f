//! 4x4 Matrices

#![allow(dead_code)]
use super::{abs, Float};
use std::ops::Mul;

/// A 4x4 matrix of `Float` values in row-major order.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Matrix4x4 {
    /// The matrix elements.
    pub m: [[Float; 4]; 4],
}

/// The identity matrix.
pub const IDENTITY_MATRIX: Matrix4x4 = Matrix4x4 {
    m: [
        [1.0, 0.0, 0.0, 0.0],
        [0.0, 1.0, 0.0, 0.0],
        [0.0, 0.0, 1.0, 0.0],
        [0.0, 0.0, 0.0, 1.0],
    ],
};

impl Matrix4x4 {
    /// Creates a new matrix from 16 values in row-major order.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        t00: Float, t01: Float, t02: Float, t03: Float,
        t10: Float, t11: Float, t12: Float, t13: Float,
        t20: Float, t21: Float, t22: Float, t23: Float,
        t30: Float, t31: Float, t32: Float, t33: Float,
    ) -> Self {
        Self {
            m: [
                [t00, t01, t02, t03],
                [t10, t11, t12, t13],
                [t20, t21, t22, t23],
                [t30, t31, t32, t33],
            ],
        }
    }

    /// Returns the transpose of the matrix.
    pub fn transpose(&self) -> Self {
        let mut r = IDENTITY_MATRIX;
        for i in 0..4 {
            for j in 0..4 {
                r.m[i][j] = self.m[j][i];
            }
        }
        r
    }

    /// Returns the inverse of the matrix via Gauss-Jordan elimination with
    /// full pivoting. Panics on a singular matrix.
    pub fn inverse(&self) -> Self {
        let mut indxc = [0_usize; 4];
        let mut indxr = [0_usize; 4];
        let mut ipiv = [0_usize; 4];
        let mut minv = self.m;

        for i in 0..4 {
            let (mut irow, mut icol) = (0, 0);
            let mut big: Float = 0.0;

            // Choose pivot.
            for j in 0..4 {
                if ipiv[j] != 1 {
                    for (k, piv) in ipiv.iter().enumerate() {
                        if *piv == 0 && abs(minv[j][k]) >= big {
                            big = abs(minv[j][k]);
                            irow = j;
                            icol = k;
                        } else {
                            assert!(*piv <= 1, "singular matrix");
                        }
                    }
                }
            }
            ipiv[icol] += 1;

            // Swap rows irow and icol for pivot.
            if irow != icol {
                for k in 0..4 {
                    let tmp = minv[irow][k];
                    minv[irow][k] = minv[icol][k];
                    minv[icol][k] = tmp;
                }
            }

            indxr[i] = irow;
            indxc[i] = icol;
            assert!(minv[icol][icol] != 0.0, "singular matrix");

            // Set minv[icol][icol] to one by scaling row icol.
            let pivinv = 1.0 / minv[icol][icol];
            minv[icol][icol] = 1.0;
            for k in 0..4 {
                minv[icol][k] *= pivinv;
            }

            // Subtract this row from others to zero out their columns.
            for j in 0..4 {
                if j != icol {
                    let save = minv[j][icol];
                    minv[j][icol] = 0.0;
                    for k in 0..4 {
                        minv[j][k] -= minv[icol][k] * save;
                    }
                }
            }
        }

        // Swap columns to reflect permutation.
        for j in (0..4).rev() {
            if indxr[j] != indxc[j] {
                for row in minv.iter_mut() {
                    row.swap(indxr[j], indxc[j]);
                }
            }
        }

        Self { m: minv }
    }
}

impl Default for Matrix4x4 {
    /// Returns the identity matrix.
    fn default() -> Self {
        IDENTITY_MATRIX
    }
}

impl Mul for Matrix4x4 {
    type Output = Self;

    fn mul(self, other: Self) -> Self::Output {
        let mut r = IDENTITY_MATRIX;
        for i in 0..4 {
            for j in 0..4 {
                r.m[i][j] = self.m[i][0] * other.m[0][j]
                    + self.m[i][1] * other.m[1][j]
                    + self.m[i][2] * other.m[2][j]
                    + self.m[i][3] * other.m[3][j];
            }
        }
        r
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use float_cmp::approx_eq;

    #[test]
    fn identity_times_identity() {
        assert_eq!(IDENTITY_MATRIX * IDENTITY_MATRIX, IDENTITY_MATRIX);
    }

    #[test]
    fn inverse_of_translation() {
        let m = Matrix4x4::new(
            1.0, 0.0, 0.0, 2.0,
            0.0, 1.0, 0.0, -3.0,
            0.0, 0.0, 1.0, 4.0,
            0.0, 0.0, 0.0, 1.0,
        );
        let inv = m.inverse();
        let id = m * inv;
        for i in 0..4 {
            for j in 0..4 {
                let expected = if i == j { 1.0 } else { 0.0 };
                assert!(approx_eq!(f32, id.m[i][j], expected, epsilon = 1e-6));
            }
        }
    }
}
