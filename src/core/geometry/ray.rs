//! Rays

#![allow(dead_code)]
use super::{Float, Point3f, Vector3f, INFINITY};

/// A ray with an origin, direction, parametric extent and time.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Ray {
    /// Origin.
    pub o: Point3f,

    /// Direction.
    pub d: Vector3f,

    /// Maximum extent of the ray.
    pub t_max: Float,

    /// Time value.
    pub time: Float,
}

impl Ray {
    /// Creates a new ray.
    ///
    /// * `o`     - Origin.
    /// * `d`     - Direction.
    /// * `t_max` - Maximum extent of the ray.
    /// * `time`  - Time value.
    pub fn new(o: Point3f, d: Vector3f, t_max: Float, time: Float) -> Self {
        Self { o, d, t_max, time }
    }

    /// Get position along the ray at given parameter.
    ///
    /// * `t` - Parameter to evaluate.
    pub fn at(&self, t: Float) -> Point3f {
        self.o + self.d * t
    }

    /// Returns true if any component is NaN.
    pub fn has_nans(&self) -> bool {
        self.o.has_nans() || self.d.has_nans() || self.t_max.is_nan()
    }
}

impl Default for Ray {
    /// Returns a ray from the origin along `+z` with unbounded extent.
    fn default() -> Self {
        Self::new(Point3f::zero(), Vector3f::new(0.0, 0.0, 1.0), INFINITY, 0.0)
    }
}

/// Returns a ray without time information.
///
/// * `o`     - Origin.
/// * `d`     - Direction.
/// * `t_max` - Maximum extent of the ray.
pub fn ray(o: Point3f, d: Vector3f, t_max: Float) -> Ray {
    Ray::new(o, d, t_max, 0.0)
}
