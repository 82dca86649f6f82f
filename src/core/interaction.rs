//! Interactions

#![allow(dead_code)]
use crate::core::common::Float;
use crate::core::geometry::{Normal3f, Point2f, Point3f, Transform, Vector3f};
use crate::core::material::{ArcMaterial, MaterialKey};

/// Geometric details of a ray / surface intersection. The material slot is
/// `None` both for pure geometry and for hits whose material is still a
/// placeholder; `material_key` always identifies the material.
#[derive(Clone, Debug, Default)]
pub struct SurfaceInteraction {
    /// Point of intersection.
    pub p: Point3f,

    /// Surface normal at the point of intersection.
    pub n: Normal3f,

    /// Parametric uv-coordinates at the point of intersection.
    pub uv: Point2f,

    /// The negative ray direction at the point of intersection.
    pub wo: Vector3f,

    /// Ray parameter at the point of intersection.
    pub t: Float,

    /// Time of intersection.
    pub time: Float,

    /// Key of the material at the intersection.
    pub material_key: MaterialKey,

    /// The resolved material, when it is loaded and not a placeholder.
    pub material: Option<ArcMaterial>,

    /// Id of the area light bound to the hit primitive; 0 when the
    /// primitive is not emissive.
    pub area_light_id: u32,
}

impl SurfaceInteraction {
    /// Applies a transformation to the interaction's geometry in place.
    ///
    /// * `t` - The transformation.
    pub fn transform(&mut self, t: &Transform) {
        self.p = t.transform_point(&self.p);
        self.n = t.transform_normal(&self.n).normalize();
        self.wo = t.transform_vector(&self.wo);
    }
}
