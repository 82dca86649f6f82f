//! Accelerators

#![allow(dead_code)]
use crate::core::geometry::{AnimatedTransform, Bounds3f, Ray};
use crate::core::interaction::SurfaceInteraction;
use crate::shapes::triangle::{Triangle, TriangleMesh};
use std::sync::Arc;

pub mod bvh;
pub mod treelet;

use self::treelet::partition::DumpBvh;

/// A primitive of the scene being dumped: either a triangle of a mesh or a
/// transformed instance of a sub-BVH.
#[derive(Clone)]
pub enum ScenePrimitive {
    /// A triangle, referring to its mesh by id.
    Triangle {
        /// The mesh.
        mesh: Arc<TriangleMesh>,

        /// The mesh id.
        mesh_id: u64,

        /// The 0-based triangle index within the mesh.
        tri_number: usize,
    },

    /// A transformed instance of a sub-BVH.
    Instance {
        /// The instanced sub-BVH.
        bvh: Arc<DumpBvh>,

        /// Instance to world transformation.
        to_world: AnimatedTransform,
    },
}

impl ScenePrimitive {
    /// Returns a bounding box in the world space. For animated instances the
    /// bound is the union of the bounds under the two keyframe transforms.
    pub fn world_bound(&self) -> Bounds3f {
        match self {
            Self::Triangle { mesh, tri_number, .. } => {
                Triangle::new(Arc::clone(mesh), *tri_number).world_bound()
            }
            Self::Instance { bvh, to_world } => {
                let b = bvh.world_bound();
                to_world
                    .start_transform
                    .transform_bounds(&b)
                    .union(&to_world.end_transform.transform_bounds(&b))
            }
        }
    }

    /// Returns geometric details if a ray intersects the primitive and
    /// updates the `t_max` parameter of the ray.
    ///
    /// * `r` - The ray.
    pub fn intersect(&self, r: &mut Ray) -> Option<SurfaceInteraction> {
        match self {
            Self::Triangle { mesh, tri_number, .. } => {
                Triangle::new(Arc::clone(mesh), *tri_number).intersect(r)
            }
            Self::Instance { bvh, to_world } => {
                let txfm = to_world.interpolate(r.time);
                let mut object_ray = txfm.inverse().transform_ray(r);

                let mut si = bvh.as_bvh().intersect(&mut object_ray)?;
                r.t_max = object_ray.t_max;
                if !txfm.is_identity() {
                    si.transform(&txfm);
                }
                Some(si)
            }
        }
    }

    /// Returns true if a ray-primitive intersection succeeds.
    ///
    /// * `r` - The ray.
    pub fn intersect_p(&self, r: &Ray) -> bool {
        match self {
            Self::Triangle { mesh, tri_number, .. } => {
                Triangle::new(Arc::clone(mesh), *tri_number).intersect_p(r)
            }
            Self::Instance { bvh, to_world } => {
                let txfm = to_world.interpolate(r.time);
                let object_ray = txfm.inverse().transform_ray(r);
                bvh.as_bvh().intersect_p(&object_ray)
            }
        }
    }

    /// Returns the instanced sub-BVH for instance primitives.
    pub fn as_instance(&self) -> Option<(&Arc<DumpBvh>, &AnimatedTransform)> {
        match self {
            Self::Instance { bvh, to_world } => Some((bvh, to_world)),
            Self::Triangle { .. } => None,
        }
    }

    /// Returns the mesh reference for triangle primitives.
    pub fn as_triangle(&self) -> Option<(&Arc<TriangleMesh>, u64, usize)> {
        match self {
            Self::Triangle {
                mesh,
                mesh_id,
                tri_number,
            } => Some((mesh, *mesh_id, *tri_number)),
            Self::Instance { .. } => None,
        }
    }
}
