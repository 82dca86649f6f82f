//! Bounding Volume Hierarchy.

#![allow(dead_code)]
use super::ScenePrimitive;
use crate::core::geometry::{Axis, Bounds3f, Float, Point3f, Ray, Vector3f};
use crate::core::interaction::SurfaceInteraction;
use order_stat::kth_by;

/// Splitting method for BVH construction.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SplitMethod {
    /// Surface area heuristic.
    SAH,

    /// Split at the midpoint of the centroid bounds.
    Middle,

    /// Split into equal sized halves.
    EqualCounts,
}

/// Node of the flattened BVH, laid out in depth-first order with the first
/// child of an interior node immediately following it.
#[derive(Copy, Clone, Debug)]
pub struct LinearBVHNode {
    /// Bounding box of the node.
    pub bounds: Bounds3f,

    /// Primitive offset for leaves, second child offset for interiors.
    pub offset: u32,

    /// Number of primitives; 0 for interior nodes.
    pub n_primitives: u16,

    /// Split axis for interior nodes.
    pub axis: u8,
}

impl Default for LinearBVHNode {
    fn default() -> Self {
        Self {
            bounds: Bounds3f::empty(),
            offset: 0,
            n_primitives: 0,
            axis: 0,
        }
    }
}

impl LinearBVHNode {
    /// Creates a leaf node.
    ///
    /// * `bounds`            - Bounding box.
    /// * `primitives_offset` - Offset of the first primitive.
    /// * `n_primitives`      - Number of primitives.
    pub fn new_leaf_node(bounds: Bounds3f, primitives_offset: u32, n_primitives: u16) -> Self {
        Self {
            bounds,
            offset: primitives_offset,
            n_primitives,
            axis: 0,
        }
    }

    /// Creates an interior node.
    ///
    /// * `bounds`              - Bounding box.
    /// * `second_child_offset` - Offset of the second child.
    /// * `axis`                - Split axis.
    pub fn new_interior_node(bounds: Bounds3f, second_child_offset: u32, axis: u8) -> Self {
        Self {
            bounds,
            offset: second_child_offset,
            n_primitives: 0,
            axis,
        }
    }

    /// Returns true for leaf nodes.
    pub fn is_leaf(&self) -> bool {
        self.n_primitives > 0
    }
}

/// Per-primitive information used during construction.
#[derive(Copy, Clone)]
struct BVHPrimitiveInfo {
    primitive_number: usize,
    bounds: Bounds3f,
    centroid: Point3f,
}

impl BVHPrimitiveInfo {
    fn new(primitive_number: usize, bounds: Bounds3f) -> Self {
        Self {
            primitive_number,
            bounds,
            centroid: bounds.centroid(),
        }
    }
}

/// Intermediate tree node used during construction.
struct BVHBuildNode {
    bounds: Bounds3f,
    children: Option<[Box<BVHBuildNode>; 2]>,
    split_axis: u8,
    first_prim_offset: usize,
    n_primitives: usize,
}

impl BVHBuildNode {
    fn leaf(first_prim_offset: usize, n_primitives: usize, bounds: Bounds3f) -> Self {
        Self {
            bounds,
            children: None,
            split_axis: 0,
            first_prim_offset,
            n_primitives,
        }
    }

    fn interior(axis: u8, c0: Box<BVHBuildNode>, c1: Box<BVHBuildNode>) -> Self {
        let bounds = c0.bounds.union(&c1.bounds);
        Self {
            bounds,
            children: Some([c0, c1]),
            split_axis: axis,
            first_prim_offset: 0,
            n_primitives: 0,
        }
    }
}

/// Number of buckets used by the SAH split search.
const N_BUCKETS: usize = 12;

/// Bounding Volume Hierarchy Accelerator over scene primitives.
pub struct BVHAccel {
    /// The primitives, reordered so each leaf's primitives are contiguous.
    pub primitives: Vec<ScenePrimitive>,

    /// Maximum number of primitives in a node.
    pub max_prims_in_node: u8,

    /// Splitting method.
    pub split_method: SplitMethod,

    /// The flattened nodes in depth-first order.
    pub nodes: Vec<LinearBVHNode>,
}

impl BVHAccel {
    /// Builds a BVH over the given primitives.
    ///
    /// * `primitives`        - The primitives.
    /// * `max_prims_in_node` - Maximum number of primitives in a node.
    /// * `split_method`      - The splitting method.
    pub fn new(
        primitives: Vec<ScenePrimitive>,
        max_prims_in_node: u8,
        split_method: SplitMethod,
    ) -> Self {
        let n_primitives = primitives.len();
        if n_primitives == 0 {
            return Self {
                primitives,
                max_prims_in_node,
                split_method,
                nodes: vec![],
            };
        }

        let mut primitive_info: Vec<BVHPrimitiveInfo> = primitives
            .iter()
            .enumerate()
            .map(|(i, p)| BVHPrimitiveInfo::new(i, p.world_bound()))
            .collect();

        let mut total_nodes = 0;
        let mut ordered: Vec<usize> = Vec::with_capacity(n_primitives);
        let root = Self::recursive_build(
            split_method,
            max_prims_in_node,
            &mut primitive_info,
            0,
            n_primitives,
            &mut total_nodes,
            &mut ordered,
        );

        info!(
            "BVH created with {} nodes for {} primitives",
            total_nodes, n_primitives
        );

        let mut nodes = vec![LinearBVHNode::default(); total_nodes];
        let mut offset = 0_u32;
        Self::flatten_bvh_tree(&root, &mut nodes, &mut offset);
        debug_assert!(total_nodes == offset as usize);

        let mut primitives = primitives;
        let mut reordered: Vec<ScenePrimitive> = Vec::with_capacity(n_primitives);
        // Drain in leaf order without cloning the mesh references twice.
        let mut slots: Vec<Option<ScenePrimitive>> = primitives.drain(..).map(Some).collect();
        for i in ordered {
            reordered.push(slots[i].take().expect("primitive used twice"));
        }

        Self {
            primitives: reordered,
            max_prims_in_node,
            split_method,
            nodes,
        }
    }

    /// Returns a bounding box of the whole tree.
    pub fn world_bound(&self) -> Bounds3f {
        if self.nodes.is_empty() {
            Bounds3f::empty()
        } else {
            self.nodes[0].bounds
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn recursive_build(
        split_method: SplitMethod,
        max_prims_in_node: u8,
        primitive_info: &mut [BVHPrimitiveInfo],
        start: usize,
        end: usize,
        total_nodes: &mut usize,
        ordered: &mut Vec<usize>,
    ) -> Box<BVHBuildNode> {
        *total_nodes += 1;

        let mut bounds = Bounds3f::empty();
        for info in &primitive_info[start..end] {
            bounds = bounds.union(&info.bounds);
        }

        let n_primitives = end - start;

        let make_leaf = |primitive_info: &mut [BVHPrimitiveInfo], ordered: &mut Vec<usize>| {
            let first_prim_offset = ordered.len();
            for info in &primitive_info[start..end] {
                ordered.push(info.primitive_number);
            }
            Box::new(BVHBuildNode::leaf(first_prim_offset, n_primitives, bounds))
        };

        if n_primitives == 1 {
            return make_leaf(primitive_info, ordered);
        }

        // Compute bound of primitive centroids, choose split dimension.
        let mut centroid_bounds = Bounds3f::empty();
        for info in &primitive_info[start..end] {
            centroid_bounds = centroid_bounds.union_point(&info.centroid);
        }
        let dim = centroid_bounds.maximum_extent();

        // Degenerate bounds; put everything in one leaf.
        if centroid_bounds.p_max[dim] == centroid_bounds.p_min[dim] {
            return make_leaf(primitive_info, ordered);
        }

        let mut mid = (start + end) / 2;
        let mut split_done = false;

        if split_method == SplitMethod::Middle {
            let pmid = (centroid_bounds.p_min[dim] + centroid_bounds.p_max[dim]) / 2.0;
            mid = start
                + itertools::partition(primitive_info[start..end].iter_mut(), |info| {
                    info.centroid[dim] < pmid
                });
            // Fall through to EqualCounts when the split is degenerate.
            split_done = mid != start && mid != end;
        }

        if !split_done && (split_method != SplitMethod::SAH || n_primitives <= 2) {
            mid = (start + end) / 2;
            kth_by(&mut primitive_info[start..end], mid - start, |a, b| {
                a.centroid[dim].partial_cmp(&b.centroid[dim]).unwrap()
            });
            split_done = true;
        }

        if !split_done {
            // Allocate primitives to SAH buckets.
            let mut bucket_counts = [0_usize; N_BUCKETS];
            let mut bucket_bounds = [Bounds3f::empty(); N_BUCKETS];
            let bucket_of = |info: &BVHPrimitiveInfo| {
                let b = (N_BUCKETS as Float * centroid_bounds.offset(&info.centroid)[dim]) as usize;
                b.min(N_BUCKETS - 1)
            };

            for info in &primitive_info[start..end] {
                let b = bucket_of(info);
                bucket_counts[b] += 1;
                bucket_bounds[b] = bucket_bounds[b].union(&info.bounds);
            }

            // Compute cost for splitting after each bucket.
            let mut costs = [0.0 as Float; N_BUCKETS - 1];
            for (i, cost) in costs.iter_mut().enumerate() {
                let mut b0 = Bounds3f::empty();
                let mut b1 = Bounds3f::empty();
                let (mut count0, mut count1) = (0, 0);
                for j in 0..=i {
                    b0 = b0.union(&bucket_bounds[j]);
                    count0 += bucket_counts[j];
                }
                for j in i + 1..N_BUCKETS {
                    b1 = b1.union(&bucket_bounds[j]);
                    count1 += bucket_counts[j];
                }
                *cost = 1.0
                    + (count0 as Float * b0.surface_area()
                        + count1 as Float * b1.surface_area())
                        / bounds.surface_area();
            }

            // Find bucket to split at that minimizes SAH metric.
            let (min_cost_bucket, min_cost) = costs
                .iter()
                .enumerate()
                .min_by(|a, b| a.1.partial_cmp(b.1).unwrap())
                .unwrap();

            let leaf_cost = n_primitives as Float;
            if n_primitives > max_prims_in_node as usize || *min_cost < leaf_cost {
                mid = start
                    + itertools::partition(primitive_info[start..end].iter_mut(), |info| {
                        bucket_of(info) <= min_cost_bucket
                    });
            } else {
                return make_leaf(primitive_info, ordered);
            }
        }

        let c0 = Self::recursive_build(
            split_method,
            max_prims_in_node,
            primitive_info,
            start,
            mid,
            total_nodes,
            ordered,
        );
        let c1 = Self::recursive_build(
            split_method,
            max_prims_in_node,
            primitive_info,
            mid,
            end,
            total_nodes,
            ordered,
        );

        Box::new(BVHBuildNode::interior(dim as u8, c0, c1))
    }

    /// Flattens the tree to the linear representation.
    ///
    /// * `node`   - The node.
    /// * `offset` - Tracks current offset into `BVHAccel::nodes`.
    fn flatten_bvh_tree(node: &BVHBuildNode, nodes: &mut [LinearBVHNode], offset: &mut u32) -> u32 {
        let my_offset = *offset;
        *offset += 1;

        if node.n_primitives > 0 {
            assert!(node.n_primitives < 65536);
            nodes[my_offset as usize] = LinearBVHNode::new_leaf_node(
                node.bounds,
                node.first_prim_offset as u32,
                node.n_primitives as u16,
            );
        } else if let Some(children) = &node.children {
            Self::flatten_bvh_tree(&children[0], nodes, offset);
            let second_child_offset = Self::flatten_bvh_tree(&children[1], nodes, offset);
            nodes[my_offset as usize] =
                LinearBVHNode::new_interior_node(node.bounds, second_child_offset, node.split_axis);
        }

        my_offset
    }

    /// Returns geometric details if a ray intersects any primitive and
    /// updates the `t_max` parameter of the ray. This is the reference
    /// traversal the treelet traverser must agree with.
    ///
    /// * `r` - The ray.
    pub fn intersect(&self, r: &mut Ray) -> Option<SurfaceInteraction> {
        if self.nodes.is_empty() {
            return None;
        }

        let mut si: Option<SurfaceInteraction> = None;
        let inv_dir = Vector3f::new(1.0 / r.d.x, 1.0 / r.d.y, 1.0 / r.d.z);
        let dir_is_neg = [
            u8::from(inv_dir.x < 0.0),
            u8::from(inv_dir.y < 0.0),
            u8::from(inv_dir.z < 0.0),
        ];

        // Follow ray through BVH nodes to find primitive intersections.
        let (mut to_visit_offset, mut current_node_index) = (0, 0_usize);
        let mut nodes_to_visit = [0_usize; 64];

        loop {
            let node = &self.nodes[current_node_index];
            if node.bounds.intersect_p_inv(r, &inv_dir, dir_is_neg) {
                if node.n_primitives > 0 {
                    // Intersect ray with primitives in leaf BVH node.
                    for i in 0..node.n_primitives {
                        let idx = node.offset as usize + i as usize;
                        if let Some(hit) = self.primitives[idx].intersect(r) {
                            si = Some(hit);
                        }
                    }
                    if to_visit_offset == 0 {
                        break;
                    }
                    to_visit_offset -= 1;
                    current_node_index = nodes_to_visit[to_visit_offset];
                } else {
                    // Put far BVH node on the stack, advance to near node.
                    if dir_is_neg[node.axis as usize] == 1 {
                        nodes_to_visit[to_visit_offset] = current_node_index + 1;
                        to_visit_offset += 1;
                        current_node_index = node.offset as usize;
                    } else {
                        nodes_to_visit[to_visit_offset] = node.offset as usize;
                        to_visit_offset += 1;
                        current_node_index += 1;
                    }
                }
            } else {
                if to_visit_offset == 0 {
                    break;
                }
                to_visit_offset -= 1;
                current_node_index = nodes_to_visit[to_visit_offset];
            }
        }

        si
    }

    /// Returns true if a ray intersects any primitive.
    ///
    /// * `r` - The ray.
    pub fn intersect_p(&self, r: &Ray) -> bool {
        if self.nodes.is_empty() {
            return false;
        }

        let inv_dir = Vector3f::new(1.0 / r.d.x, 1.0 / r.d.y, 1.0 / r.d.z);
        let dir_is_neg = [
            u8::from(inv_dir.x < 0.0),
            u8::from(inv_dir.y < 0.0),
            u8::from(inv_dir.z < 0.0),
        ];

        let (mut to_visit_offset, mut current_node_index) = (0, 0_usize);
        let mut nodes_to_visit = [0_usize; 64];

        loop {
            let node = &self.nodes[current_node_index];
            if node.bounds.intersect_p_inv(r, &inv_dir, dir_is_neg) {
                if node.n_primitives > 0 {
                    for i in 0..node.n_primitives {
                        let idx = node.offset as usize + i as usize;
                        if self.primitives[idx].intersect_p(r) {
                            return true;
                        }
                    }
                    if to_visit_offset == 0 {
                        break;
                    }
                    to_visit_offset -= 1;
                    current_node_index = nodes_to_visit[to_visit_offset];
                } else {
                    if dir_is_neg[node.axis as usize] == 1 {
                        nodes_to_visit[to_visit_offset] = current_node_index + 1;
                        to_visit_offset += 1;
                        current_node_index = node.offset as usize;
                    } else {
                        nodes_to_visit[to_visit_offset] = node.offset as usize;
                        to_visit_offset += 1;
                        current_node_index += 1;
                    }
                }
            } else {
                if to_visit_offset == 0 {
                    break;
                }
                to_visit_offset -= 1;
                current_node_index = nodes_to_visit[to_visit_offset];
            }
        }

        false
    }
}
