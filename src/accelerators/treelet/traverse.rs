//! Ray traversal over the resident treelet set.

#![allow(dead_code)]
use super::compute_idx;
use super::node::NodeData;
use super::ray_state::{RayFrame, RayState};
use super::residency::{Instance, Treelet, TreeletBvh, TreeletPrimitive};
use crate::core::error::{Error, Result};
use crate::core::geometry::{Ray, Vector3f};
use crate::core::interaction::SurfaceInteraction;
use std::sync::Arc;

/// Traversal stack depth.
const STACK_SIZE: usize = 64;

fn inv_dir_of(ray: &Ray) -> (Vector3f, [u8; 3]) {
    let inv_dir = Vector3f::new(1.0 / ray.d.x, 1.0 / ray.d.y, 1.0 / ray.d.z);
    let dir_is_neg = [
        u8::from(inv_dir.x < 0.0),
        u8::from(inv_dir.y < 0.0),
        u8::from(inv_dir.z < 0.0),
    ];
    (inv_dir, dir_is_neg)
}

impl TreeletBvh {
    /// Closest-hit query; crosses treelet boundaries by loading the
    /// referenced treelets. Updates the ray's `t_max` and returns geometric
    /// details of the closest intersection.
    ///
    /// * `ray` - The ray.
    pub fn intersect(&self, ray: &mut Ray) -> Result<Option<SurfaceInteraction>> {
        self.intersect_from(ray, self.bvh_root)
    }

    /// Closest-hit query starting at a given root treelet.
    ///
    /// * `ray`      - The ray.
    /// * `bvh_root` - Root treelet id of the (sub-)BVH to traverse.
    pub fn intersect_from(&self, ray: &mut Ray, bvh_root: u32) -> Result<Option<SurfaceInteraction>> {
        let mut si: Option<SurfaceInteraction> = None;
        let (inv_dir, dir_is_neg) = inv_dir_of(ray);

        let start_treelet = if bvh_root == 0 {
            compute_idx(&ray.d, self.directional_treelets)
        } else {
            bvh_root
        };

        let mut to_visit = [(0_u32, 0_u32); STACK_SIZE];
        let mut to_visit_offset = 0_usize;
        let mut current = (start_treelet, 0_u32);

        loop {
            let treelet = self.load_treelet(current.0)?;
            let node = treelet.nodes[current.1 as usize];

            if node.bounds.intersect_p_inv(ray, &inv_dir, dir_is_neg) {
                match node.data {
                    NodeData::Leaf {
                        primitive_offset,
                        primitive_count,
                    } => {
                        for i in primitive_offset..primitive_offset + primitive_count {
                            let prim = &treelet.primitives[i as usize];
                            if let Some(hit) = self.intersect_primitive(&treelet, prim, ray)? {
                                si = Some(hit);
                            }
                        }

                        if to_visit_offset == 0 {
                            break;
                        }
                        to_visit_offset -= 1;
                        current = to_visit[to_visit_offset];
                    }
                    NodeData::Interior {
                        child_treelet,
                        child_node,
                    } => {
                        let left = (child_treelet[0] as u32, child_node[0]);
                        let right = (child_treelet[1] as u32, child_node[1]);

                        if dir_is_neg[node.axis as usize] == 1 {
                            to_visit[to_visit_offset] = left;
                            to_visit_offset += 1;
                            current = right;
                        } else {
                            to_visit[to_visit_offset] = right;
                            to_visit_offset += 1;
                            current = left;
                        }
                    }
                }
            } else {
                if to_visit_offset == 0 {
                    break;
                }
                to_visit_offset -= 1;
                current = to_visit[to_visit_offset];
            }
        }

        Ok(si)
    }

    /// Any-hit query.
    ///
    /// * `ray` - The ray.
    pub fn intersect_p(&self, ray: &Ray) -> Result<bool> {
        self.intersect_p_from(ray, self.bvh_root)
    }

    /// Any-hit query starting at a given root treelet.
    ///
    /// * `ray`      - The ray.
    /// * `bvh_root` - Root treelet id of the (sub-)BVH to traverse.
    pub fn intersect_p_from(&self, ray: &Ray, bvh_root: u32) -> Result<bool> {
        let (inv_dir, dir_is_neg) = inv_dir_of(ray);

        let start_treelet = if bvh_root == 0 {
            compute_idx(&ray.d, self.directional_treelets)
        } else {
            bvh_root
        };

        let mut to_visit = [(0_u32, 0_u32); STACK_SIZE];
        let mut to_visit_offset = 0_usize;
        let mut current = (start_treelet, 0_u32);

        loop {
            let treelet = self.load_treelet(current.0)?;
            let node = treelet.nodes[current.1 as usize];

            if node.bounds.intersect_p_inv(ray, &inv_dir, dir_is_neg) {
                match node.data {
                    NodeData::Leaf {
                        primitive_offset,
                        primitive_count,
                    } => {
                        for i in primitive_offset..primitive_offset + primitive_count {
                            let prim = &treelet.primitives[i as usize];
                            if self.intersect_primitive_p(&treelet, prim, ray)? {
                                return Ok(true);
                            }
                        }

                        if to_visit_offset == 0 {
                            break;
                        }
                        to_visit_offset -= 1;
                        current = to_visit[to_visit_offset];
                    }
                    NodeData::Interior {
                        child_treelet,
                        child_node,
                    } => {
                        let left = (child_treelet[0] as u32, child_node[0]);
                        let right = (child_treelet[1] as u32, child_node[1]);

                        if dir_is_neg[node.axis as usize] == 1 {
                            to_visit[to_visit_offset] = left;
                            to_visit_offset += 1;
                            current = right;
                        } else {
                            to_visit[to_visit_offset] = right;
                            to_visit_offset += 1;
                            current = left;
                        }
                    }
                }
            } else {
                if to_visit_offset == 0 {
                    break;
                }
                to_visit_offset -= 1;
                current = to_visit[to_visit_offset];
            }
        }

        Ok(false)
    }

    /// Partial traversal: executes only within the treelet named by the top
    /// of the ray's stack and returns when traversal would cross into
    /// another treelet, leaving the destination frame on the stack for the
    /// scheduler to route.
    ///
    /// * `state` - The suspended ray.
    pub fn trace(&self, state: &mut RayState) -> Result<()> {
        let current_treelet = state.current_treelet()?;
        let treelet = self.load_treelet(current_treelet)?;

        let mut ray = state.ray;
        let (mut inv_dir, mut dir_is_neg) = inv_dir_of(&ray);

        let mut has_transform = false;
        let mut transform_changed = false;

        while !state.to_visit_empty() {
            if state.top().treelet != current_treelet {
                break;
            }

            let mut current = state.top();
            state.pop();

            let node = treelet.nodes[current.node as usize];

            // Re-derive the object-space ray when entering or leaving a
            // transformed instance.
            if current.transformed != has_transform || transform_changed {
                transform_changed = false;

                ray = if current.transformed {
                    state.ray_transform.inverse().transform_ray(&state.ray)
                } else {
                    state.ray
                };
                (inv_dir, dir_is_neg) = inv_dir_of(&ray);
            }
            has_transform = current.transformed;

            if !node.bounds.intersect_p_inv(&ray, &inv_dir, dir_is_neg) {
                continue;
            }

            match node.data {
                NodeData::Leaf {
                    primitive_offset,
                    primitive_count,
                } => {
                    let mut crossed = false;

                    let mut i = primitive_offset + current.primitive as u32;
                    while i < primitive_offset + primitive_count {
                        match &treelet.primitives[i as usize] {
                            TreeletPrimitive::Transformed(tp) => match tp.instance {
                                Instance::External { root } => {
                                    // Park the rest of this leaf, then hand
                                    // the ray to the instance's treelet.
                                    if (current.primitive as u32) + 1 < primitive_count {
                                        let mut next_primitive = current;
                                        next_primitive.primitive += 1;
                                        state.push(next_primitive);
                                    }

                                    let txfm = tp.to_world.interpolate(ray.time);
                                    let mut next = RayFrame {
                                        treelet: root,
                                        node: 0,
                                        primitive: 0,
                                        transformed: false,
                                    };
                                    if !txfm.is_identity() {
                                        state.ray_transform = txfm;
                                        next.transformed = true;
                                    }
                                    state.push(next);

                                    crossed = true;
                                }
                                Instance::Included { node: inst_node } => {
                                    let txfm = tp.to_world.interpolate(ray.time);
                                    let mut object_ray = txfm.inverse().transform_ray(&ray);

                                    if let Some(mut isect) = self.intersect_in_treelet(
                                        &treelet,
                                        inst_node,
                                        &mut object_ray,
                                    )? {
                                        require_placeholder(&isect)?;
                                        ray.t_max = object_ray.t_max;
                                        if !txfm.is_identity() {
                                            isect.transform(&txfm);
                                        }

                                        state.ray.t_max = ray.t_max;
                                        let material = isect.material_key;
                                        let area_light = isect.area_light_id;
                                        state.set_hit(current, isect, material, area_light);
                                    }
                                }
                            },
                            prim => {
                                if let Some(isect) =
                                    self.intersect_primitive(&treelet, prim, &mut ray)?
                                {
                                    require_placeholder(&isect)?;

                                    state.ray.t_max = ray.t_max;
                                    let material = isect.material_key;
                                    let area_light = isect.area_light_id;
                                    state.set_hit(current, isect, material, area_light);
                                }
                            }
                        }

                        if crossed {
                            break;
                        }

                        current.primitive += 1;
                        i += 1;
                    }
                }
                NodeData::Interior {
                    child_treelet,
                    child_node,
                } => {
                    let child = |side: usize| RayFrame {
                        treelet: child_treelet[side] as u32,
                        node: child_node[side],
                        primitive: 0,
                        transformed: current.transformed,
                    };

                    // Near child pushed last so it is visited first.
                    if dir_is_neg[node.axis as usize] == 1 {
                        state.push(child(0));
                        state.push(child(1));
                    } else {
                        state.push(child(1));
                        state.push(child(0));
                    }
                }
            }
        }

        Ok(())
    }

    /// Intersects the primitives reachable from a node of one treelet
    /// without leaving it; used for inlined (copyable) instances.
    ///
    /// * `treelet`    - The treelet.
    /// * `start_node` - Node index of the instance root.
    /// * `ray`        - The ray, in instance space.
    fn intersect_in_treelet(
        &self,
        treelet: &Arc<Treelet>,
        start_node: u32,
        ray: &mut Ray,
    ) -> Result<Option<SurfaceInteraction>> {
        let mut si: Option<SurfaceInteraction> = None;
        let (inv_dir, dir_is_neg) = inv_dir_of(ray);

        let mut to_visit = [0_u32; STACK_SIZE];
        let mut to_visit_offset = 0_usize;
        let mut current_node = start_node;

        loop {
            let node = treelet.nodes[current_node as usize];
            if node.bounds.intersect_p_inv(ray, &inv_dir, dir_is_neg) {
                match node.data {
                    NodeData::Leaf {
                        primitive_offset,
                        primitive_count,
                    } => {
                        for i in primitive_offset..primitive_offset + primitive_count {
                            let prim = &treelet.primitives[i as usize];
                            if let Some(hit) = self.intersect_primitive(treelet, prim, ray)? {
                                si = Some(hit);
                            }
                        }
                        if to_visit_offset == 0 {
                            break;
                        }
                        to_visit_offset -= 1;
                        current_node = to_visit[to_visit_offset];
                    }
                    NodeData::Interior { child_node, .. } => {
                        if dir_is_neg[node.axis as usize] == 1 {
                            to_visit[to_visit_offset] = child_node[0];
                            to_visit_offset += 1;
                            current_node = child_node[1];
                        } else {
                            to_visit[to_visit_offset] = child_node[1];
                            to_visit_offset += 1;
                            current_node = child_node[0];
                        }
                    }
                }
            } else {
                if to_visit_offset == 0 {
                    break;
                }
                to_visit_offset -= 1;
                current_node = to_visit[to_visit_offset];
            }
        }

        Ok(si)
    }

    /// Intersects one treelet primitive, recursing into instances.
    ///
    /// * `treelet` - The treelet owning the primitive.
    /// * `prim`    - The primitive.
    /// * `ray`     - The ray.
    fn intersect_primitive(
        &self,
        treelet: &Arc<Treelet>,
        prim: &TreeletPrimitive,
        ray: &mut Ray,
    ) -> Result<Option<SurfaceInteraction>> {
        match prim {
            TreeletPrimitive::Geometric(gp) => {
                let Some(mut si) = gp.shape.intersect(ray) else {
                    return Ok(None);
                };

                si.material_key = gp.material_key;
                si.area_light_id = gp.area_light.as_ref().map(|l| l.id).unwrap_or(0);
                // Placeholders never escape through the interaction.
                si.material = gp
                    .material
                    .as_ref()
                    .filter(|m| !m.is_placeholder())
                    .cloned();

                Ok(Some(si))
            }
            TreeletPrimitive::Transformed(tp) => {
                let txfm = tp.to_world.interpolate(ray.time);
                let mut object_ray = txfm.inverse().transform_ray(ray);

                let hit = match tp.instance {
                    Instance::Included { node } => {
                        self.intersect_in_treelet(treelet, node, &mut object_ray)?
                    }
                    Instance::External { root } => {
                        self.intersect_from(&mut object_ray, root)?
                    }
                };

                let Some(mut si) = hit else {
                    return Ok(None);
                };

                ray.t_max = object_ray.t_max;
                if !txfm.is_identity() {
                    si.transform(&txfm);
                }
                Ok(Some(si))
            }
            TreeletPrimitive::Pending => Err(Error::Integrity(String::from(
                "traversal reached an unfinalized primitive",
            ))),
        }
    }

    /// Any-hit test of one treelet primitive.
    ///
    /// * `treelet` - The treelet owning the primitive.
    /// * `prim`    - The primitive.
    /// * `ray`     - The ray.
    fn intersect_primitive_p(
        &self,
        treelet: &Arc<Treelet>,
        prim: &TreeletPrimitive,
        ray: &Ray,
    ) -> Result<bool> {
        match prim {
            TreeletPrimitive::Geometric(gp) => Ok(gp.shape.intersect_p(ray)),
            TreeletPrimitive::Transformed(tp) => {
                let txfm = tp.to_world.interpolate(ray.time);
                let object_ray = txfm.inverse().transform_ray(ray);

                match tp.instance {
                    Instance::Included { node } => {
                        let mut probe = object_ray;
                        Ok(self
                            .intersect_in_treelet(treelet, node, &mut probe)?
                            .is_some())
                    }
                    Instance::External { root } => self.intersect_p_from(&object_ray, root),
                }
            }
            TreeletPrimitive::Pending => Err(Error::Integrity(String::from(
                "traversal reached an unfinalized primitive",
            ))),
        }
    }
}

/// Partial traces run before materials are fetched; a resolved material on
/// a hit means the scene was preloaded, where partial tracing is not
/// meaningful.
fn require_placeholder(isect: &SurfaceInteraction) -> Result<()> {
    if isect.material.is_some() {
        return Err(Error::Integrity(String::from(
            "partial trace requires placeholder materials",
        )));
    }
    Ok(())
}
