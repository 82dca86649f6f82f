//! Animated Transformations

#![allow(dead_code)]
use super::{clamp, lerp, Float, Matrix4x4, Quaternion, Transform, Vector3f, IDENTITY_MATRIX};

/// Keyframe matrix transformation for moving objects; interpolates between
/// two transformations over a time interval.
#[derive(Copy, Clone, Debug)]
pub struct AnimatedTransform {
    /// The starting transformation.
    pub start_transform: Transform,

    /// The ending transformation.
    pub end_transform: Transform,

    /// Time for the starting transformation.
    pub start_time: Float,

    /// Time for the ending transformation.
    pub end_time: Float,

    /// Whether the two transformations differ.
    actually_animated: bool,

    /// Decomposed translation components.
    t: [Vector3f; 2],

    /// Decomposed rotation components.
    r: [Quaternion; 2],

    /// Decomposed scale components.
    s: [Matrix4x4; 2],
}

impl AnimatedTransform {
    /// Creates an animated transformation between two keyframes.
    ///
    /// * `start_transform` - Starting transformation.
    /// * `start_time`      - Time for starting transformation.
    /// * `end_transform`   - Ending transformation.
    /// * `end_time`        - Time for ending transformation.
    pub fn new(
        start_transform: Transform,
        start_time: Float,
        end_transform: Transform,
        end_time: Float,
    ) -> Self {
        let actually_animated = start_transform != end_transform;

        let (t0, r0, s0) = Self::decompose(&start_transform.m);
        let (t1, mut r1, s1) = Self::decompose(&end_transform.m);

        // Flip the second rotation if needed to select the shortest path.
        if r0.dot(&r1) < 0.0 {
            r1 = -r1;
        }

        Self {
            start_transform,
            end_transform,
            start_time,
            end_time,
            actually_animated,
            t: [t0, t1],
            r: [r0, r1],
            s: [s0, s1],
        }
    }

    /// Creates a static transformation.
    ///
    /// * `t` - The transformation.
    pub fn from_transform(t: Transform) -> Self {
        Self::new(t, 0.0, t, 1.0)
    }

    /// Whether the two keyframes differ.
    pub fn is_animated(&self) -> bool {
        self.actually_animated
    }

    /// Decomposes a matrix into translation, rotation, and scale.
    ///
    /// * `m` - The matrix.
    fn decompose(m: &Matrix4x4) -> (Vector3f, Quaternion, Matrix4x4) {
        // Extract translation from transformation matrix.
        let t = Vector3f::new(m.m[0][3], m.m[1][3], m.m[2][3]);

        // Compute new transformation matrix without translation.
        let mut mm = *m;
        for i in 0..3 {
            mm.m[i][3] = 0.0;
        }
        mm.m[3] = [0.0, 0.0, 0.0, 1.0];

        // Extract rotation from transformation matrix via polar
        // decomposition.
        let mut r = mm;
        for _ in 0..100 {
            let r_next = {
                let rit = r.transpose().inverse();
                let mut n = IDENTITY_MATRIX;
                for i in 0..4 {
                    for j in 0..4 {
                        n.m[i][j] = 0.5 * (r.m[i][j] + rit.m[i][j]);
                    }
                }
                n
            };

            let mut norm: Float = 0.0;
            for i in 0..3 {
                let n = (r.m[i][0] - r_next.m[i][0]).abs()
                    + (r.m[i][1] - r_next.m[i][1]).abs()
                    + (r.m[i][2] - r_next.m[i][2]).abs();
                norm = norm.max(n);
            }
            r = r_next;

            if norm < 0.0001 {
                break;
            }
        }
        let rquat = Quaternion::from(&r);

        // Compute scale using rotation and original matrix.
        let s = r.inverse() * mm;

        (t, rquat, s)
    }

    /// Returns the interpolated transformation at the given time.
    ///
    /// * `time` - The time.
    pub fn interpolate(&self, time: Float) -> Transform {
        // Handle boundary conditions for matrix interpolation.
        if !self.actually_animated || time <= self.start_time {
            return self.start_transform;
        }
        if time >= self.end_time {
            return self.end_transform;
        }

        let dt = clamp(
            (time - self.start_time) / (self.end_time - self.start_time),
            0.0,
            1.0,
        );

        // Interpolate translation at dt.
        let trans = self.t[0] * (1.0 - dt) + self.t[1] * dt;

        // Interpolate rotation at dt.
        let rotate = self.r[0].slerp(dt, &self.r[1]);

        // Interpolate scale at dt.
        let mut scale = IDENTITY_MATRIX;
        for i in 0..3 {
            for j in 0..3 {
                scale.m[i][j] = lerp(dt, self.s[0].m[i][j], self.s[1].m[i][j]);
            }
        }

        Transform::translate(&trans)
            .compose(&rotate.to_transform())
            .compose(&Transform::new(scale))
    }
}

impl Default for AnimatedTransform {
    /// Returns a static identity transformation.
    fn default() -> Self {
        Self::from_transform(Transform::default())
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::super::point3;
    use super::*;
    use float_cmp::approx_eq;

    #[test]
    fn static_transform_is_not_animated() {
        let at = AnimatedTransform::from_transform(Transform::translate(&Vector3f::new(
            1.0, 0.0, 0.0,
        )));
        assert!(!at.is_animated());
        assert_eq!(at.interpolate(0.5), at.start_transform);
    }

    #[test]
    fn translation_interpolates_linearly() {
        let start = Transform::default();
        let end = Transform::translate(&Vector3f::new(2.0, 0.0, 0.0));
        let at = AnimatedTransform::new(start, 0.0, end, 1.0);

        let mid = at.interpolate(0.5);
        let p = mid.transform_point(&point3(0.0, 0.0, 0.0));
        assert!(approx_eq!(f32, p.x, 1.0, epsilon = 1e-5));
        assert!(approx_eq!(f32, p.y, 0.0, epsilon = 1e-5));
        assert!(approx_eq!(f32, p.z, 0.0, epsilon = 1e-5));
    }
}
