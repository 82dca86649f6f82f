//! Transformations

#![allow(dead_code)]
use super::{
    bounds3, Bounds3f, Float, Matrix4x4, Normal3f, Point3f, Ray, Vector3f, IDENTITY_MATRIX,
};

/// A transformation from points to points and vectors to vectors, stored as
/// a matrix and its inverse.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Transform {
    /// The transformation matrix.
    pub m: Matrix4x4,

    /// The inverse transformation matrix.
    pub m_inv: Matrix4x4,
}

impl Transform {
    /// Creates a transform from a matrix; the inverse is computed.
    ///
    /// * `m` - The transformation matrix.
    pub fn new(m: Matrix4x4) -> Self {
        Self {
            m,
            m_inv: m.inverse(),
        }
    }

    /// Creates a transform from a matrix and its known inverse.
    ///
    /// * `m`     - The transformation matrix.
    /// * `m_inv` - The inverse of `m`.
    pub fn from_matrices(m: Matrix4x4, m_inv: Matrix4x4) -> Self {
        Self { m, m_inv }
    }

    /// Creates a translation transform.
    ///
    /// * `delta` - The translation vector.
    pub fn translate(delta: &Vector3f) -> Self {
        let m = Matrix4x4::new(
            1.0, 0.0, 0.0, delta.x,
            0.0, 1.0, 0.0, delta.y,
            0.0, 0.0, 1.0, delta.z,
            0.0, 0.0, 0.0, 1.0,
        );
        let m_inv = Matrix4x4::new(
            1.0, 0.0, 0.0, -delta.x,
            0.0, 1.0, 0.0, -delta.y,
            0.0, 0.0, 1.0, -delta.z,
            0.0, 0.0, 0.0, 1.0,
        );
        Self { m, m_inv }
    }

    /// Creates a scale transform.
    ///
    /// * `x` - Scale in x.
    /// * `y` - Scale in y.
    /// * `z` - Scale in z.
    pub fn scale(x: Float, y: Float, z: Float) -> Self {
        let m = Matrix4x4::new(
            x, 0.0, 0.0, 0.0,
            0.0, y, 0.0, 0.0,
            0.0, 0.0, z, 0.0,
            0.0, 0.0, 0.0, 1.0,
        );
        let m_inv = Matrix4x4::new(
            1.0 / x, 0.0, 0.0, 0.0,
            0.0, 1.0 / y, 0.0, 0.0,
            0.0, 0.0, 1.0 / z, 0.0,
            0.0, 0.0, 0.0, 1.0,
        );
        Self { m, m_inv }
    }

    /// Returns true if this is the identity transformation.
    pub fn is_identity(&self) -> bool {
        self.m == IDENTITY_MATRIX
    }

    /// Returns the inverse transformation.
    pub fn inverse(&self) -> Self {
        Self {
            m: self.m_inv,
            m_inv: self.m,
        }
    }

    /// Applies the transformation to a point.
    ///
    /// * `p` - The point.
    pub fn transform_point(&self, p: &Point3f) -> Point3f {
        let m = &self.m.m;
        let x = m[0][0] * p.x + m[0][1] * p.y + m[0][2] * p.z + m[0][3];
        let y = m[1][0] * p.x + m[1][1] * p.y + m[1][2] * p.z + m[1][3];
        let z = m[2][0] * p.x + m[2][1] * p.y + m[2][2] * p.z + m[2][3];
        let w = m[3][0] * p.x + m[3][1] * p.y + m[3][2] * p.z + m[3][3];
        if w == 1.0 {
            Point3f::new(x, y, z)
        } else {
            Point3f::new(x, y, z) / w
        }
    }

    /// Applies the transformation to a vector.
    ///
    /// * `v` - The vector.
    pub fn transform_vector(&self, v: &Vector3f) -> Vector3f {
        let m = &self.m.m;
        Vector3f::new(
            m[0][0] * v.x + m[0][1] * v.y + m[0][2] * v.z,
            m[1][0] * v.x + m[1][1] * v.y + m[1][2] * v.z,
            m[2][0] * v.x + m[2][1] * v.y + m[2][2] * v.z,
        )
    }

    /// Applies the transformation to a normal, using the inverse transpose.
    ///
    /// * `n` - The normal.
    pub fn transform_normal(&self, n: &Normal3f) -> Normal3f {
        let m = &self.m_inv.m;
        Normal3f::new(
            m[0][0] * n.x + m[1][0] * n.y + m[2][0] * n.z,
            m[0][1] * n.x + m[1][1] * n.y + m[2][1] * n.z,
            m[0][2] * n.x + m[1][2] * n.y + m[2][2] * n.z,
        )
    }

    /// Applies the transformation to a ray.
    ///
    /// * `r` - The ray.
    pub fn transform_ray(&self, r: &Ray) -> Ray {
        Ray::new(
            self.transform_point(&r.o),
            self.transform_vector(&r.d),
            r.t_max,
            r.time,
        )
    }

    /// Applies the transformation to a bounding box by transforming all
    /// eight corners.
    ///
    /// * `b` - The bounding box.
    pub fn transform_bounds(&self, b: &Bounds3f) -> Bounds3f {
        let p = self.transform_point(&Point3f::new(b.p_min.x, b.p_min.y, b.p_min.z));
        let mut ret = bounds3(p, p);
        for corner in 1..8 {
            let c = Point3f::new(
                if corner & 1 == 0 { b.p_min.x } else { b.p_max.x },
                if corner & 2 == 0 { b.p_min.y } else { b.p_max.y },
                if corner & 4 == 0 { b.p_min.z } else { b.p_max.z },
            );
            ret = ret.union_point(&self.transform_point(&c));
        }
        ret
    }

    /// Composes with another transformation.
    ///
    /// * `t` - The other transformation.
    pub fn compose(&self, t: &Transform) -> Transform {
        Transform {
            m: self.m * t.m,
            m_inv: t.m_inv * self.m_inv,
        }
    }
}

impl Default for Transform {
    /// Returns the identity transformation.
    fn default() -> Self {
        Self {
            m: IDENTITY_MATRIX,
            m_inv: IDENTITY_MATRIX,
        }
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::super::point3;
    use super::*;

    #[test]
    fn translate_point() {
        let t = Transform::translate(&Vector3f::new(1.0, 2.0, 3.0));
        assert_eq!(t.transform_point(&point3(0.0, 0.0, 0.0)), point3(1.0, 2.0, 3.0));
        assert_eq!(
            t.inverse().transform_point(&point3(1.0, 2.0, 3.0)),
            point3(0.0, 0.0, 0.0)
        );
    }

    #[test]
    fn identity_detection() {
        assert!(Transform::default().is_identity());
        assert!(!Transform::translate(&Vector3f::new(1.0, 0.0, 0.0)).is_identity());
    }

    #[test]
    fn vectors_ignore_translation() {
        let t = Transform::translate(&Vector3f::new(5.0, 5.0, 5.0));
        let v = Vector3f::new(1.0, 0.0, 0.0);
        assert_eq!(t.transform_vector(&v), v);
    }
}
