//! Quaternions

#![allow(dead_code)]
use super::{Float, Matrix4x4, Transform, Vector3f, IDENTITY_MATRIX};
use std::ops::{Add, Mul, Neg, Sub};

/// A quaternion representing a rotation.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Quaternion {
    /// The imaginary part.
    pub v: Vector3f,

    /// The real part.
    pub w: Float,
}

impl Quaternion {
    /// Returns the dot product with another quaternion.
    ///
    /// * `other` - The other quaternion.
    pub fn dot(&self, other: &Self) -> Float {
        self.v.dot(&other.v) + self.w * other.w
    }

    /// Returns the unit quaternion.
    pub fn normalize(&self) -> Self {
        let l = self.dot(self).sqrt();
        Self {
            v: self.v / l,
            w: self.w / l,
        }
    }

    /// Spherical linear interpolation between two quaternions.
    ///
    /// * `t`  - Interpolation parameter in [0, 1].
    /// * `q2` - The other quaternion.
    pub fn slerp(&self, t: Float, q2: &Self) -> Self {
        let cos_theta = self.dot(q2);
        if cos_theta > 0.9995 {
            // Nearly parallel, fall back to normalized lerp.
            (*self * (1.0 - t) + *q2 * t).normalize()
        } else {
            let theta = cos_theta.clamp(-1.0, 1.0).acos();
            let thetap = theta * t;
            let qperp = (*q2 - *self * cos_theta).normalize();
            *self * thetap.cos() + qperp * thetap.sin()
        }
    }

    /// Converts the quaternion to a rotation transform.
    pub fn to_transform(&self) -> Transform {
        let xx = self.v.x * self.v.x;
        let yy = self.v.y * self.v.y;
        let zz = self.v.z * self.v.z;
        let xy = self.v.x * self.v.y;
        let xz = self.v.x * self.v.z;
        let yz = self.v.y * self.v.z;
        let wx = self.v.x * self.w;
        let wy = self.v.y * self.w;
        let wz = self.v.z * self.w;

        let mut m = IDENTITY_MATRIX;
        m.m[0][0] = 1.0 - 2.0 * (yy + zz);
        m.m[0][1] = 2.0 * (xy + wz);
        m.m[0][2] = 2.0 * (xz - wy);
        m.m[1][0] = 2.0 * (xy - wz);
        m.m[1][1] = 1.0 - 2.0 * (xx + zz);
        m.m[1][2] = 2.0 * (yz + wx);
        m.m[2][0] = 2.0 * (xz + wy);
        m.m[2][1] = 2.0 * (yz - wx);
        m.m[2][2] = 1.0 - 2.0 * (xx + yy);

        // Transpose for left-handed convention.
        Transform::from_matrices(m.transpose(), m)
    }
}

impl Default for Quaternion {
    /// Returns the identity rotation.
    fn default() -> Self {
        Self {
            v: Vector3f::zero(),
            w: 1.0,
        }
    }
}

impl From<&Matrix4x4> for Quaternion {
    /// Extracts the rotation quaternion from a rotation matrix.
    ///
    /// * `m` - The rotation matrix.
    fn from(m: &Matrix4x4) -> Self {
        let trace = m.m[0][0] + m.m[1][1] + m.m[2][2];
        if trace > 0.0 {
            let mut s = (trace + 1.0).sqrt();
            let w = s / 2.0;
            s = 0.5 / s;
            Self {
                v: Vector3f::new(
                    (m.m[2][1] - m.m[1][2]) * s,
                    (m.m[0][2] - m.m[2][0]) * s,
                    (m.m[1][0] - m.m[0][1]) * s,
                ),
                w,
            }
        } else {
            // Compute largest of x, y, or z, then remaining components.
            let nxt = [1_usize, 2, 0];
            let mut q = [0.0 as Float; 3];
            let mut i = 0;
            if m.m[1][1] > m.m[0][0] {
                i = 1;
            }
            if m.m[2][2] > m.m[i][i] {
                i = 2;
            }
            let j = nxt[i];
            let k = nxt[j];
            let mut s = ((m.m[i][i] - (m.m[j][j] + m.m[k][k])) + 1.0).sqrt();
            q[i] = s * 0.5;
            if s != 0.0 {
                s = 0.5 / s;
            }
            let w = (m.m[k][j] - m.m[j][k]) * s;
            q[j] = (m.m[j][i] + m.m[i][j]) * s;
            q[k] = (m.m[k][i] + m.m[i][k]) * s;
            Self {
                v: Vector3f::new(q[0], q[1], q[2]),
                w,
            }
        }
    }
}

impl Add for Quaternion {
    type Output = Self;

    fn add(self, other: Self) -> Self {
        Self::Output {
            v: self.v + other.v,
            w: self.w + other.w,
        }
    }
}

impl Sub for Quaternion {
    type Output = Self;

    fn sub(self, other: Self) -> Self {
        Self::Output {
            v: self.v - other.v,
            w: self.w - other.w,
        }
    }
}

impl Mul<Float> for Quaternion {
    type Output = Self;

    fn mul(self, f: Float) -> Self::Output {
        Self::Output {
            v: self.v * f,
            w: self.w * f,
        }
    }
}

impl Neg for Quaternion {
    type Output = Self;

    fn neg(self) -> Self::Output {
        Self::Output {
            v: -self.v,
            w: -self.w,
        }
    }
}
