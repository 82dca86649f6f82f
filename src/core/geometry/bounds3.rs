//! 3-D Axis Aligned Bounding Boxes.

#![allow(dead_code)]
use super::{gamma, max, min, point3, Axis, Float, Point3, Point3f, Ray, Vector3, Vector3f};
use num_traits::bounds::Bounded;
use num_traits::Num;

/// 3-D Axis Aligned Bounding Box.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Bounds3<T> {
    /// Minimum bounds.
    pub p_min: Point3<T>,

    /// Maximum bounds.
    pub p_max: Point3<T>,
}

/// 3-D bounding box containing `Float` points.
pub type Bounds3f = Bounds3<Float>;

/// Creates a new 3-D bounding box from 2 points. The minimum and maximum
/// bounds are used for each coordinate axis.
///
/// * `p1` - First point.
/// * `p2` - Second point.
pub fn bounds3<T: Num + PartialOrd + Copy>(p1: Point3<T>, p2: Point3<T>) -> Bounds3<T> {
    Bounds3 {
        p_min: point3(min(p1.x, p2.x), min(p1.y, p2.y), min(p1.z, p2.z)),
        p_max: point3(max(p1.x, p2.x), max(p1.y, p2.y), max(p1.z, p2.z)),
    }
}

impl<T: Num + Bounded + PartialOrd + Copy> Bounds3<T> {
    /// Returns a bounding box where minimum and maximum bounds are maximum
    /// and minimum values respectively of the type's limits. This is so we
    /// can easily grow the bounding box from nothing iteratively.
    pub fn empty() -> Self {
        Self {
            p_min: point3(T::max_value(), T::max_value(), T::max_value()),
            p_max: point3(T::min_value(), T::min_value(), T::min_value()),
        }
    }
}

impl<T: Num + PartialOrd + Copy> Bounds3<T> {
    /// Returns true if the bounds describe an empty box where any component
    /// of p_max is less than p_min.
    pub fn is_empty(&self) -> bool {
        self.p_max.x < self.p_min.x || self.p_max.y < self.p_min.y || self.p_max.z < self.p_min.z
    }

    /// Returns the vector along the box diagonal from the minimum point to
    /// the maximum point.
    pub fn diagonal(&self) -> Vector3<T> {
        self.p_max - self.p_min
    }

    /// Returns the surface area of the bounding box.
    pub fn surface_area(&self) -> T {
        if self.is_empty() {
            T::zero()
        } else {
            let d = self.diagonal();
            let h = d.x * d.y + d.x * d.z + d.y * d.z;
            h + h
        }
    }

    /// Returns the index of which of the axes is longest. This is useful,
    /// for example, when deciding which axis to subdivide when building
    /// ray-intersection acceleration structures.
    pub fn maximum_extent(&self) -> Axis {
        let d = self.diagonal();
        if d.x > d.y && d.x > d.z {
            Axis::X
        } else if d.y > d.z {
            Axis::Y
        } else {
            Axis::Z
        }
    }

    /// Returns the union with a point.
    ///
    /// * `p` - The point.
    pub fn union_point(&self, p: &Point3<T>) -> Self {
        Self {
            p_min: self.p_min.min(p),
            p_max: self.p_max.max(p),
        }
    }

    /// Returns the union with another bounding box.
    ///
    /// * `other` - The other bounding box.
    pub fn union(&self, other: &Self) -> Self {
        Self {
            p_min: self.p_min.min(&other.p_min),
            p_max: self.p_max.max(&other.p_max),
        }
    }

    /// Returns true if the point is inside the bounds.
    ///
    /// * `p` - The point.
    pub fn contains(&self, p: &Point3<T>) -> bool {
        p.x >= self.p_min.x
            && p.x <= self.p_max.x
            && p.y >= self.p_min.y
            && p.y <= self.p_max.y
            && p.z >= self.p_min.z
            && p.z <= self.p_max.z
    }
}

impl<T> From<Point3<T>> for Bounds3<T>
where
    T: Copy,
{
    /// Use a 3-D point as minimum and maximum 3-D bounds.
    ///
    /// * `p` - 3-D point.
    fn from(p: Point3<T>) -> Self {
        Bounds3 { p_min: p, p_max: p }
    }
}

impl Bounds3f {
    /// Returns the continuous position of a point relative to the corners of
    /// the box, where a point at the minimum corner has offset `(0, 0, 0)`
    /// and a point at the maximum corner has offset `(1, 1, 1)`.
    ///
    /// * `p` - The point.
    pub fn offset(&self, p: &Point3f) -> Vector3f {
        let mut o = *p - self.p_min;
        if self.p_max.x > self.p_min.x {
            o.x /= self.p_max.x - self.p_min.x;
        }
        if self.p_max.y > self.p_min.y {
            o.y /= self.p_max.y - self.p_min.y;
        }
        if self.p_max.z > self.p_min.z {
            o.z /= self.p_max.z - self.p_min.z;
        }
        o
    }

    /// Returns the center of the bounding box.
    pub fn centroid(&self) -> Point3f {
        self.p_min * 0.5 + self.p_max * 0.5
    }

    /// Intersects a ray with the bounds using precomputed reciprocal
    /// direction and direction signs; returns true if the ray overlaps the
    /// box within `[0, t_max]`.
    ///
    /// * `ray`        - The ray.
    /// * `inv_dir`    - Reciprocal of the ray direction components.
    /// * `dir_is_neg` - Sign of each direction component; 1 if negative.
    pub fn intersect_p_inv(&self, ray: &Ray, inv_dir: &Vector3f, dir_is_neg: [u8; 3]) -> bool {
        let lo = |i: usize| if dir_is_neg[i] == 1 { self.p_max } else { self.p_min };
        let hi = |i: usize| if dir_is_neg[i] == 1 { self.p_min } else { self.p_max };

        // Check for ray intersection against x and y slabs.
        let mut t_min = (lo(0).x - ray.o.x) * inv_dir.x;
        let mut t_max = (hi(0).x - ray.o.x) * inv_dir.x;
        let ty_min = (lo(1).y - ray.o.y) * inv_dir.y;
        let mut ty_max = (hi(1).y - ray.o.y) * inv_dir.y;

        // Update t_max and ty_max to ensure robust bounds intersection.
        t_max *= 1.0 + 2.0 * gamma(3);
        ty_max *= 1.0 + 2.0 * gamma(3);

        if t_min > ty_max || ty_min > t_max {
            return false;
        }
        if ty_min > t_min {
            t_min = ty_min;
        }
        if ty_max < t_max {
            t_max = ty_max;
        }

        // Check for ray intersection against z slab.
        let tz_min = (lo(2).z - ray.o.z) * inv_dir.z;
        let mut tz_max = (hi(2).z - ray.o.z) * inv_dir.z;
        tz_max *= 1.0 + 2.0 * gamma(3);

        if t_min > tz_max || tz_min > t_max {
            return false;
        }
        if tz_min > t_min {
            t_min = tz_min;
        }
        if tz_max < t_max {
            t_max = tz_max;
        }

        t_min < ray.t_max && t_max > 0.0
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::super::{ray, vector3};
    use super::*;

    #[test]
    fn union_grows() {
        let b = Bounds3f::empty()
            .union_point(&point3(0.0, 0.0, 0.0))
            .union_point(&point3(1.0, 2.0, 3.0));
        assert_eq!(b.p_min, point3(0.0, 0.0, 0.0));
        assert_eq!(b.p_max, point3(1.0, 2.0, 3.0));
    }

    #[test]
    fn surface_area_unit_cube() {
        let b = bounds3(point3(0.0, 0.0, 0.0), point3(1.0, 1.0, 1.0));
        assert_eq!(b.surface_area(), 6.0);
    }

    #[test]
    fn ray_hits_box() {
        let b = bounds3(point3(-1.0, -1.0, -1.0), point3(1.0, 1.0, 1.0));
        let r = ray(point3(0.0, 0.0, -5.0), vector3(0.0, 0.0, 1.0), Float::INFINITY);
        let inv_dir = vector3(1.0 / r.d.x, 1.0 / r.d.y, 1.0 / r.d.z);
        let dir_is_neg = [0, 0, 0];
        assert!(b.intersect_p_inv(&r, &inv_dir, dir_is_neg));

        let r = ray(point3(0.0, 5.0, -5.0), vector3(0.0, 0.0, 1.0), Float::INFINITY);
        assert!(!b.intersect_p_inv(&r, &inv_dir, dir_is_neg));
    }
}
