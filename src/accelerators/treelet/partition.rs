//! Treelet partitioner: assigns BVH node ids to treelet ids under a byte
//! budget.

#![allow(dead_code)]
use super::graph::{create_merged_graph, create_traversal_graph, TraversalGraph};
use super::node::NODE_SIZE;
use super::{compute_ray_dir, DumpConfig, PartitionAlgorithm};
use crate::accelerators::bvh::BVHAccel;
use crate::accelerators::ScenePrimitive;
use crate::core::error::{Error, Result};
use crate::core::geometry::Bounds3f;
use crate::core::scene::SceneContext;
use ordered_float::OrderedFloat;
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;

/// Fixed size estimates used by the byte accounting.
pub mod size_estimates {
    use super::NODE_SIZE;

    /// Node header bytes.
    pub const NODE: u64 = NODE_SIZE as u64;

    /// Triangle bytes: indices and bookkeeping plus, on average, two unique
    /// vertices worth of position, normal, tangent and uv data.
    pub const TRIANGLE: u64 = (4 + 4 + 8 + 3 * 4) + 2 * (12 + 12 + 12 + 8);

    /// Instance reference bytes: two transforms plus the reference.
    pub const INSTANCE: u64 = 32 * 4 + 4;
}

/// Maximum number of instanced sub-BVHs a scene may contain.
pub const MAX_INSTANCES: usize = 256;

const MASK_WORDS: usize = MAX_INSTANCES / 64;

/// Bitset with one bit per unique copyable instance.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct InstanceMask {
    bits: [u64; MASK_WORDS],
}

impl InstanceMask {
    /// Sets the bit for an instance.
    ///
    /// * `idx` - The instance id.
    pub fn set(&mut self, idx: usize) {
        self.bits[idx / 64] |= 1 << (idx % 64);
    }

    /// Returns the bit for an instance.
    ///
    /// * `idx` - The instance id.
    pub fn get(&self, idx: usize) -> bool {
        self.bits[idx / 64] & (1 << (idx % 64)) != 0
    }

    /// Returns the union with another mask.
    ///
    /// * `other` - The other mask.
    pub fn union(&self, other: &Self) -> Self {
        let mut out = *self;
        for i in 0..MASK_WORDS {
            out.bits[i] |= other.bits[i];
        }
        out
    }
}

/// Summary of one allocated treelet.
pub struct TreeletInfo {
    /// Direction index the treelet was allocated for.
    pub dir_idx: usize,

    /// Node ids of the original BVH, in serialization order after the final
    /// depth-first reordering.
    pub nodes: Vec<u64>,

    /// Copyable instances inlined into the treelet.
    pub instance_mask: InstanceMask,

    /// The inlined instances, resolved from the mask.
    pub instances: Vec<Arc<DumpBvh>>,

    /// Node plus primitive bytes, excluding inlined instances.
    pub no_instance_size: u64,

    /// Bytes of the union of inlined instances.
    pub instance_size: u64,

    /// Expected number of rays entering this treelet.
    pub total_prob: f64,
}

impl Default for TreeletInfo {
    fn default() -> Self {
        Self {
            dir_idx: 0,
            nodes: vec![],
            instance_mask: InstanceMask::default(),
            instances: vec![],
            no_instance_size: 0,
            instance_size: 0,
            total_prob: 0.0,
        }
    }
}

/// A BVH prepared for treelet dumping: the flat BVH plus per-node size and
/// instance accounting, and the treelet assignment per traversal direction.
pub struct DumpBvh {
    /// The underlying flat BVH.
    bvh: BVHAccel,

    /// Dump configuration.
    pub config: DumpConfig,

    /// Whether this BVH is the scene root.
    pub root_bvh: bool,

    /// Whether this sub-BVH is small enough to inline by value.
    pub copyable: bool,

    /// Instance id of this sub-BVH; meaningless for the root.
    pub instance_id: usize,

    /// Estimated total bytes of the whole BVH.
    pub total_bytes: u64,

    /// Estimated bytes per node (header plus primitives).
    node_sizes: Vec<u64>,

    /// Estimated bytes per subtree.
    subtree_sizes: Vec<u64>,

    /// Parent index of every node.
    node_parents: Vec<u64>,

    /// Copyable instances referenced per node.
    node_instance_masks: Vec<InstanceMask>,

    /// Copyable instances referenced per subtree.
    subtree_instance_masks: Vec<InstanceMask>,

    /// Leaves whose last primitive is a non-copyable instance; the miss
    /// edge is suppressed there.
    skip_miss_edge: Vec<bool>,

    /// Unique copyable instances by instance id.
    unique_instances: BTreeMap<usize, Arc<DumpBvh>>,

    /// Estimated bytes per copyable instance id.
    instance_sizes: BTreeMap<usize, u64>,

    /// Cache of instance byte totals keyed by mask.
    instance_size_cache: HashMap<InstanceMask, u64>,

    /// Treelet label per node, per direction; label 0 means unassigned.
    pub treelet_allocations: [Vec<u32>; 8],

    /// Expected rays entering each non-copyable instance, per direction.
    pub instance_probabilities: [BTreeMap<usize, f64>; 8],

    /// The allocated treelets.
    pub all_treelets: Vec<TreeletInfo>,
}

impl DumpBvh {
    /// Builds the flat BVH over the primitives and, for the scene root or a
    /// non-copyable instance, runs the partitioner.
    ///
    /// * `primitives` - The scene primitives.
    /// * `config`     - Dump configuration.
    /// * `ctx`        - Scene context; allocates instance ids.
    pub fn new(
        primitives: Vec<ScenePrimitive>,
        config: DumpConfig,
        ctx: &mut SceneContext,
    ) -> Result<Self> {
        let bvh = BVHAccel::new(primitives, config.max_prims_in_node, config.split_method);

        let mut this = Self {
            bvh,
            root_bvh: config.scene_accelerator,
            copyable: false,
            instance_id: 0,
            total_bytes: 0,
            node_sizes: vec![],
            subtree_sizes: vec![],
            node_parents: vec![],
            node_instance_masks: vec![],
            subtree_instance_masks: vec![],
            skip_miss_edge: vec![],
            unique_instances: BTreeMap::new(),
            instance_sizes: BTreeMap::new(),
            instance_size_cache: HashMap::new(),
            treelet_allocations: Default::default(),
            instance_probabilities: Default::default(),
            all_treelets: vec![],
            config,
        };

        if this.root_bvh {
            this.set_node_info()?;
            this.all_treelets = this.allocate_treelets()?;
        } else {
            this.instance_id = ctx.next_instance_id();
            if this.instance_id >= MAX_INSTANCES {
                return Err(Error::Config(format!(
                    "too many instanced sub-BVHs (max {MAX_INSTANCES})"
                )));
            }

            for node in &this.bvh.nodes {
                this.total_bytes += size_estimates::NODE
                    + node.n_primitives as u64 * size_estimates::TRIANGLE;
            }

            if this.total_bytes < this.config.copyable_threshold {
                this.copyable = true;
            } else {
                this.set_node_info()?;
                this.all_treelets = this.allocate_treelets()?;
            }
        }

        Ok(this)
    }

    /// Builds a `DumpBvh` from the recognised creation options.
    ///
    /// * `primitives` - The scene primitives.
    /// * `ps`         - The parameter set.
    /// * `ctx`        - Scene context; allocates instance ids.
    pub fn create(
        primitives: Vec<ScenePrimitive>,
        ps: &crate::core::paramset::ParamSet,
        ctx: &mut SceneContext,
    ) -> Result<Self> {
        Self::new(primitives, DumpConfig::from(ps), ctx)
    }

    /// Returns the underlying flat BVH.
    pub fn as_bvh(&self) -> &BVHAccel {
        &self.bvh
    }

    /// Returns a bounding box in the world space.
    pub fn world_bound(&self) -> Bounds3f {
        self.bvh.world_bound()
    }

    /// Returns the number of flat BVH nodes.
    pub fn node_count(&self) -> usize {
        self.bvh.nodes.len()
    }

    /// Computes per-node sizes, parents, instance masks and subtree
    /// aggregates.
    fn set_node_info(&mut self) -> Result<()> {
        info!("building BVH node information");
        let node_count = self.bvh.nodes.len();
        self.node_sizes = vec![0; node_count];
        self.subtree_sizes = vec![0; node_count];
        self.node_parents = vec![0; node_count];
        self.node_instance_masks = vec![InstanceMask::default(); node_count];
        self.subtree_instance_masks = vec![InstanceMask::default(); node_count];
        self.skip_miss_edge = vec![false; node_count];

        for node_idx in 0..node_count {
            let node = self.bvh.nodes[node_idx];
            let mut total_size = size_estimates::NODE;

            for prim_idx in 0..node.n_primitives as usize {
                let prim = &self.bvh.primitives[node.offset as usize + prim_idx];
                match prim {
                    ScenePrimitive::Triangle { .. } => {
                        total_size += size_estimates::TRIANGLE;
                    }
                    ScenePrimitive::Instance { bvh, .. } => {
                        total_size += size_estimates::INSTANCE;

                        if !bvh.copyable {
                            if prim_idx + 1 == node.n_primitives as usize {
                                self.skip_miss_edge[node_idx] = true;
                            }
                            continue;
                        }

                        self.unique_instances
                            .insert(bvh.instance_id, Arc::clone(bvh));
                        self.instance_sizes.insert(bvh.instance_id, bvh.total_bytes);
                        self.node_instance_masks[node_idx].set(bvh.instance_id);
                    }
                }
            }

            self.node_sizes[node_idx] = total_size;

            if node.n_primitives == 0 {
                self.node_parents[node_idx + 1] = node_idx as u64;
                self.node_parents[node.offset as usize] = node_idx as u64;
            }
        }

        for node_idx in (0..node_count).rev() {
            let node = self.bvh.nodes[node_idx];
            self.subtree_sizes[node_idx] = self.node_sizes[node_idx];
            self.subtree_instance_masks[node_idx] = self.node_instance_masks[node_idx];
            if node.n_primitives == 0 {
                self.subtree_sizes[node_idx] += self.subtree_sizes[node_idx + 1]
                    + self.subtree_sizes[node.offset as usize];
                self.subtree_instance_masks[node_idx] = self.subtree_instance_masks[node_idx]
                    .union(&self.subtree_instance_masks[node_idx + 1])
                    .union(&self.subtree_instance_masks[node.offset as usize]);
            }
        }

        info!("done building BVH node information");
        Ok(())
    }

    /// Total bytes of the instances named by a mask, cached per mask.
    fn instances_bytes(&mut self, mask: &InstanceMask) -> u64 {
        if let Some(cached) = self.instance_size_cache.get(mask) {
            return *cached;
        }

        let total: u64 = self
            .instance_sizes
            .iter()
            .filter(|(id, _)| mask.get(**id))
            .map(|(_, size)| *size)
            .sum();

        self.instance_size_cache.insert(*mask, total);
        total
    }

    /// Allocates treelets with the configured algorithm.
    fn allocate_treelets(&mut self) -> Result<Vec<TreeletInfo>> {
        match self.config.partition {
            PartitionAlgorithm::Nvidia | PartitionAlgorithm::MergedGraph => {
                self.allocate_unspecialized_treelets()
            }
            PartitionAlgorithm::OneByOne => self.allocate_directional_treelets(),
        }
    }

    /// Single-assignment allocation used by the `Nvidia` and `MergedGraph`
    /// algorithms; all eight traversal directions share one assignment.
    fn allocate_unspecialized_treelets(&mut self) -> Result<Vec<TreeletInfo>> {
        let node_count = self.bvh.nodes.len();

        let graph = if self.config.partition == PartitionAlgorithm::MergedGraph {
            create_merged_graph(
                &self.bvh.nodes,
                &self.skip_miss_edge,
                &self.node_parents,
                self.config.traversal,
            )
        } else {
            // The priority allocation pass does not consult the graph.
            TraversalGraph {
                depth_first: vec![],
                incoming_prob: vec![0.0; node_count],
                edges: vec![],
                outgoing: vec![(0, 0); node_count],
            }
        };

        self.treelet_allocations[0] = self.compute_treelets(&graph)?;
        let mut intermediate = self.merge_disjoint_treelets(0, &graph);

        let mut final_treelets = vec![];
        let root_label = intermediate
            .iter()
            .find(|(_, info)| info.nodes.first() == Some(&0))
            .map(|(label, _)| *label)
            .ok_or_else(|| Error::Integrity(String::from("no treelet contains the root node")))?;
        final_treelets.push(intermediate.remove(&root_label).unwrap());

        for (_, info) in std::mem::take(&mut intermediate) {
            final_treelets.push(info);
        }

        self.order_treelet_nodes_depth_first(1, &mut final_treelets);
        self.check_coverage(1, &final_treelets)?;

        Ok(final_treelets)
    }

    /// Per-direction allocation: eight directional graphs, eight
    /// assignments, root treelets first.
    fn allocate_directional_treelets(&mut self) -> Result<Vec<TreeletInfo>> {
        let mut intermediate: [BTreeMap<u32, TreeletInfo>; 8] = Default::default();

        for dir_idx in 0..8 {
            let dir = compute_ray_dir(dir_idx as u32);
            let graph = create_traversal_graph(
                &self.bvh.nodes,
                &self.skip_miss_edge,
                &self.node_parents,
                &dir,
                self.config.traversal,
            );

            self.treelet_allocations[dir_idx] = self.compute_treelets(&graph)?;
            intermediate[dir_idx] = self.merge_disjoint_treelets(dir_idx, &graph);
        }

        let mut final_treelets = vec![];

        // Root treelets take ids 0 to 7.
        for (dir_idx, treelets) in intermediate.iter_mut().enumerate() {
            let root_label = treelets
                .iter()
                .find(|(_, info)| info.nodes.first() == Some(&0))
                .map(|(label, _)| *label)
                .ok_or_else(|| {
                    Error::Integrity(format!("no treelet contains the root node (dir {dir_idx})"))
                })?;
            final_treelets.push(treelets.remove(&root_label).unwrap());
        }

        // The rest are numbered contiguously.
        for treelets in intermediate.iter_mut() {
            for (_, info) in std::mem::take(treelets) {
                final_treelets.push(info);
            }
        }

        self.order_treelet_nodes_depth_first(8, &mut final_treelets);
        self.check_coverage(8, &final_treelets)?;

        Ok(final_treelets)
    }

    /// Runs the configured per-direction assignment and verifies labels and
    /// budgets.
    fn compute_treelets(&mut self, graph: &TraversalGraph) -> Result<Vec<u32>> {
        let assignment = match self.config.partition {
            PartitionAlgorithm::OneByOne | PartitionAlgorithm::MergedGraph => {
                self.compute_treelets_topological(graph)?
            }
            PartitionAlgorithm::Nvidia => self.assign_treelets_priority()?,
        };

        // Every node must carry a label and every treelet must fit.
        let mut sizes: BTreeMap<u32, u64> = BTreeMap::new();
        let mut instance_tracker: HashMap<u32, InstanceMask> = HashMap::new();
        for (node_idx, label) in assignment.iter().enumerate() {
            if *label == 0 {
                return Err(Error::Integrity(format!(
                    "node {node_idx} not assigned to any treelet"
                )));
            }

            let mask = instance_tracker.entry(*label).or_default();
            *mask = mask.union(&self.node_instance_masks[node_idx]);
            *sizes.entry(*label).or_insert(0) += self.node_sizes[node_idx];
        }

        for (label, mask) in instance_tracker {
            *sizes.get_mut(&label).unwrap() += self.instances_bytes(&mask);
        }

        info!("generated {} treelets from {} nodes", sizes.len(), assignment.len());

        for (label, size) in sizes {
            if size > self.config.max_treelet_bytes {
                return Err(Error::Integrity(format!(
                    "treelet {} is {} bytes, over the {} byte budget",
                    label, size, self.config.max_treelet_bytes
                )));
            }
        }

        Ok(assignment)
    }

    /// Topological one-by-one allocation: grow a treelet from a seed along
    /// the heaviest cut edge that still fits.
    fn compute_treelets_topological(&mut self, graph: &TraversalGraph) -> Result<Vec<u32>> {
        /// Cut entries ordered by descending weight, ties by ascending
        /// destination.
        #[derive(Copy, Clone, PartialEq, Eq)]
        struct OutEdge {
            weight: OrderedFloat<f32>,
            dst: u64,
        }

        impl Ord for OutEdge {
            fn cmp(&self, other: &Self) -> Ordering {
                other
                    .weight
                    .cmp(&self.weight)
                    .then_with(|| self.dst.cmp(&other.dst))
            }
        }

        impl PartialOrd for OutEdge {
            fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
                Some(self.cmp(other))
            }
        }

        let node_count = self.bvh.nodes.len();
        let mut assignment = vec![0_u32; node_count];
        let mut depth_first: VecDeque<u64> = graph.depth_first.iter().copied().collect();

        let mut cur_treelet = 1_u32;
        loop {
            // Seed with the next unassigned node in depth-first order.
            let mut cur_node = None;
            while let Some(n) = depth_first.pop_front() {
                if assignment[n as usize] == 0 {
                    cur_node = Some(n);
                    break;
                }
            }
            let Some(mut cur_node) = cur_node else {
                break;
            };
            assignment[cur_node as usize] = cur_treelet;

            let mut cut: std::collections::BTreeSet<OutEdge> = std::collections::BTreeSet::new();
            let mut unique_lookup: HashMap<u64, OrderedFloat<f32>> = HashMap::new();
            let mut included_instances = InstanceMask::default();

            // Size of a node plus the instances it would newly pull in.
            let root_size = self.additional_size(cur_node, &included_instances);
            if root_size > self.config.max_treelet_bytes {
                return Err(Error::Budget {
                    node: cur_node,
                    required: root_size,
                    budget: self.config.max_treelet_bytes,
                });
            }

            let mut remaining_bytes = self.config.max_treelet_bytes - root_size;
            included_instances =
                included_instances.union(&self.node_instance_masks[cur_node as usize]);

            while remaining_bytes >= NODE_SIZE as u64 {
                // Add the edges leaving the node we just absorbed, merging
                // duplicate destinations by summing weights.
                for edge in graph.outgoing_edges(cur_node) {
                    let node_size = self.additional_size(edge.dst, &included_instances);
                    if node_size > remaining_bytes {
                        continue;
                    }

                    match unique_lookup.get_mut(&edge.dst) {
                        None => {
                            unique_lookup.insert(edge.dst, OrderedFloat(edge.weight));
                            cut.insert(OutEdge {
                                weight: OrderedFloat(edge.weight),
                                dst: edge.dst,
                            });
                        }
                        Some(weight) => {
                            cut.remove(&OutEdge {
                                weight: *weight,
                                dst: edge.dst,
                            });
                            *weight += edge.weight;
                            cut.insert(OutEdge {
                                weight: *weight,
                                dst: edge.dst,
                            });
                        }
                    }
                }

                // Pick the heaviest edge whose destination still fits.
                let mut best = None;
                for edge in cut.iter().copied().collect::<Vec<_>>() {
                    let dst = edge.dst;
                    let cur_bytes = self.additional_size(dst, &included_instances);

                    if assignment[dst as usize] != 0 || cur_bytes > remaining_bytes {
                        cut.remove(&edge);
                        unique_lookup.remove(&dst);
                    } else {
                        best = Some((edge, cur_bytes));
                        break;
                    }
                }

                // Treelet full.
                let Some((best_edge, used_bytes)) = best else {
                    break;
                };

                cut.remove(&best_edge);
                unique_lookup.remove(&best_edge.dst);

                cur_node = best_edge.dst;
                assignment[cur_node as usize] = cur_treelet;
                remaining_bytes -= used_bytes;
                included_instances =
                    included_instances.union(&self.node_instance_masks[cur_node as usize]);
            }

            cur_treelet += 1;
        }

        Ok(assignment)
    }

    /// Size of adding a node to a treelet in progress: the node's own bytes
    /// plus the bytes of copyable instances it pulls in that the treelet
    /// does not already carry.
    fn additional_size(&mut self, node_idx: u64, included: &InstanceMask) -> u64 {
        let with_node = self.node_instance_masks[node_idx as usize].union(included);
        self.node_sizes[node_idx as usize] + self.instances_bytes(&with_node)
            - self.instances_bytes(included)
    }

    /// Subtree-size lower bound for the priority allocation's score.
    fn additional_subtree_size(&mut self, node_idx: u64, included: &InstanceMask) -> u64 {
        let with_subtree = self.subtree_instance_masks[node_idx as usize].union(included);
        self.subtree_sizes[node_idx as usize] + self.instances_bytes(&with_subtree)
            - self.instances_bytes(included)
    }

    /// Two-pass priority / SAH allocation. Pass one computes, bottom-up, a
    /// best achievable cost for every candidate treelet root; pass two
    /// replays the greedy cut growth from the scene root and emits a
    /// treelet whenever it matches the precomputed cost.
    fn assign_treelets_priority(&mut self) -> Result<Vec<u32>> {
        let node_count = self.bvh.nodes.len();
        let mut labels = vec![0_u32; node_count];

        let max_nodes = self.config.max_treelet_bytes as f32 / NODE_SIZE as f32;
        let area_epsilon =
            self.bvh.nodes[0].bounds.surface_area() * max_nodes / (node_count as f32 * 10.0);

        let mut best_costs = vec![f32::MAX; node_count];

        /* pass one */
        for root_index in (0..node_count as u64).rev() {
            let root_sa = self.bvh.nodes[root_index as usize].bounds.surface_area();

            let mut cut: Vec<u64> = vec![root_index];
            let mut included_instances = InstanceMask::default();
            let mut cur_instance_size = 0_u64;
            let mut remaining_size = self.config.max_treelet_bytes;

            loop {
                let Some((best_pos, best_node_size, best_instance_size)) =
                    self.best_cut_entry(&cut, &included_instances, cur_instance_size, remaining_size, area_epsilon)
                else {
                    break;
                };

                let best_node_index = cut.swap_remove(best_pos);
                let best_node = self.bvh.nodes[best_node_index as usize];

                if best_node.n_primitives == 0 {
                    cut.push(best_node_index + 1);
                    cut.push(best_node.offset as u64);
                }

                let mut this_cost = root_sa + area_epsilon;
                for n in &cut {
                    this_cost += best_costs[*n as usize];
                }
                best_costs[root_index as usize] =
                    best_costs[root_index as usize].min(this_cost);

                remaining_size -= best_node_size;
                included_instances =
                    included_instances.union(&self.node_instance_masks[best_node_index as usize]);
                cur_instance_size += best_instance_size;
            }

            if best_costs[root_index as usize] == f32::MAX {
                return Err(Error::Budget {
                    node: root_index,
                    required: self.node_sizes[root_index as usize],
                    budget: self.config.max_treelet_bytes,
                });
            }
        }

        let float_equals = |a: f32, b: f32| (a - b).abs() < 1e-4;

        /* pass two */
        let mut current_treelet = 0_u32;
        let mut q: Vec<u64> = vec![0];

        while let Some(root_index) = q.pop() {
            current_treelet += 1;

            let root_sa = self.bvh.nodes[root_index as usize].bounds.surface_area();
            let best_cost = best_costs[root_index as usize];

            let mut cut: Vec<u64> = vec![root_index];
            let mut included_instances = InstanceMask::default();
            let mut cur_instance_size = 0_u64;
            let mut remaining_size = self.config.max_treelet_bytes;

            loop {
                let Some((best_pos, best_node_size, best_instance_size)) =
                    self.best_cut_entry(&cut, &included_instances, cur_instance_size, remaining_size, area_epsilon)
                else {
                    break;
                };

                let best_node_index = cut.swap_remove(best_pos);
                let best_node = self.bvh.nodes[best_node_index as usize];

                if best_node.n_primitives == 0 {
                    cut.push(best_node_index + 1);
                    cut.push(best_node.offset as u64);
                }

                labels[best_node_index as usize] = current_treelet;

                let mut this_cost = root_sa + area_epsilon;
                for n in &cut {
                    this_cost += best_costs[*n as usize];
                }

                remaining_size -= best_node_size;
                included_instances =
                    included_instances.union(&self.node_instance_masks[best_node_index as usize]);
                cur_instance_size += best_instance_size;

                if float_equals(this_cost, best_cost) {
                    break;
                }
            }

            q.extend(cut);
        }

        Ok(labels)
    }

    /// Picks the cut entry maximising `(SA + ε) / min(subtree bytes,
    /// remaining bytes)` among entries that fit; returns its position plus
    /// its incremental node and instance sizes.
    fn best_cut_entry(
        &mut self,
        cut: &[u64],
        included_instances: &InstanceMask,
        cur_instance_size: u64,
        remaining_size: u64,
        area_epsilon: f32,
    ) -> Option<(usize, u64, u64)> {
        let mut best: Option<(usize, u64, u64)> = None;
        let mut best_score = f32::MIN;

        for (pos, n) in cut.iter().enumerate() {
            let gain = self.bvh.nodes[*n as usize].bounds.surface_area() + area_epsilon;

            let node_mask = self.node_instance_masks[*n as usize].union(included_instances);
            let additional_instance_size = self.instances_bytes(&node_mask) - cur_instance_size;
            let additional_node_size = self.node_sizes[*n as usize] + additional_instance_size;

            if additional_node_size > remaining_size {
                continue;
            }

            let subtree_mask = self.subtree_instance_masks[*n as usize].union(included_instances);
            let additional_subtree_size = self.subtree_sizes[*n as usize]
                + self.instances_bytes(&subtree_mask)
                - cur_instance_size;

            let price = additional_subtree_size.min(remaining_size);
            let score = gain / price as f32;
            if score > best_score {
                best = Some((pos, additional_node_size, additional_instance_size));
                best_score = score;
            }
        }

        best
    }

    /// Collects the assignment of one direction into treelet summaries and
    /// greedily merges small treelets that fit together, smallest first.
    fn merge_disjoint_treelets(
        &mut self,
        dir_idx: usize,
        graph: &TraversalGraph,
    ) -> BTreeMap<u32, TreeletInfo> {
        let node_count = self.bvh.nodes.len();
        let mut treelets: BTreeMap<u32, TreeletInfo> = BTreeMap::new();

        for node_idx in 0..node_count as u64 {
            let cur_label = self.treelet_allocations[dir_idx][node_idx as usize];
            {
                let treelet = treelets.entry(cur_label).or_default();
                treelet.dir_idx = dir_idx;
                treelet.nodes.push(node_idx);
                treelet.no_instance_size += self.node_sizes[node_idx as usize];
            }

            let node = self.bvh.nodes[node_idx as usize];
            for prim_idx in 0..node.n_primitives as usize {
                let prim = &self.bvh.primitives[node.offset as usize + prim_idx];
                if let ScenePrimitive::Instance { bvh, .. } = prim {
                    if bvh.copyable {
                        let treelet = treelets.get_mut(&cur_label).unwrap();
                        if !treelet.instance_mask.get(bvh.instance_id) {
                            treelet.instance_mask.set(bvh.instance_id);
                            treelet.instance_size += bvh.total_bytes;
                        }
                    } else if node_idx < graph.incoming_prob.len() as u64 {
                        *self.instance_probabilities[dir_idx]
                            .entry(bvh.instance_id)
                            .or_insert(0.0) += graph.incoming_prob[node_idx as usize] as f64;
                    }
                }
            }

            // Probability of entering a treelet is the weight of the edges
            // that cross into it.
            for edge in graph.outgoing_edges(node_idx) {
                let dst_label = self.treelet_allocations[dir_idx][edge.dst as usize];
                if cur_label != dst_label {
                    treelets.entry(dst_label).or_default().total_prob += edge.weight as f64;
                }
            }
        }

        let root_label = self.treelet_allocations[dir_idx][0];
        treelets.get_mut(&root_label).unwrap().total_prob += 1.0;

        // Sort by size ascending, ties by label.
        let mut sorted: BTreeMap<(u64, u32), TreeletInfo> = BTreeMap::new();
        for (label, info) in treelets {
            debug_assert_ne!(label, 0);
            sorted.insert((info.no_instance_size + info.instance_size, label), info);
        }

        // Merge treelets together.
        let mut merged: BTreeMap<u32, TreeletInfo> = BTreeMap::new();
        while let Some(key) = sorted.keys().next().copied() {
            let mut info = sorted.remove(&key).unwrap();

            for candidate_key in sorted.keys().copied().collect::<Vec<_>>() {
                let candidate = sorted.get(&candidate_key).unwrap();

                let no_inst_size = info.no_instance_size + candidate.no_instance_size;
                if no_inst_size > self.config.max_treelet_bytes {
                    continue;
                }

                let merged_mask = info.instance_mask.union(&candidate.instance_mask);
                let union_instance_size = self.instances_bytes(&merged_mask);

                let total_size = no_inst_size + union_instance_size;
                if total_size <= self.config.max_treelet_bytes {
                    let candidate = sorted.remove(&candidate_key).unwrap();
                    if info.nodes.first() < candidate.nodes.first() {
                        info.nodes.extend(candidate.nodes);
                    } else {
                        let mut nodes = candidate.nodes;
                        nodes.extend(std::mem::take(&mut info.nodes));
                        info.nodes = nodes;
                    }
                    info.instance_mask = merged_mask;
                    info.instance_size = union_instance_size;
                    info.no_instance_size = no_inst_size;
                    info.total_prob += candidate.total_prob;
                }

                // No point searching further.
                if total_size >= self.config.max_treelet_bytes - NODE_SIZE as u64 {
                    break;
                }
            }

            merged.insert(key.1, info);
        }

        // Make final instance lists.
        for info in merged.values_mut() {
            info.instances = self
                .unique_instances
                .iter()
                .filter(|(id, _)| info.instance_mask.get(**id))
                .map(|(_, inst)| Arc::clone(inst))
                .collect();
        }

        merged
    }

    /// Rewrites the per-direction labels from the merged treelet lists and
    /// reorders each treelet's node list depth-first, descending into
    /// same-treelet children first.
    fn order_treelet_nodes_depth_first(&mut self, num_dirs: usize, treelets: &mut [TreeletInfo]) {
        for (treelet_id, treelet) in treelets.iter_mut().enumerate() {
            for node_idx in &treelet.nodes {
                self.treelet_allocations[treelet.dir_idx][*node_idx as usize] = treelet_id as u32;
            }
            treelet.nodes.clear();
        }

        for dir_idx in 0..num_dirs {
            let mut depth_first: Vec<u64> = vec![0];

            while let Some(start) = depth_first.pop() {
                let treelet_id = self.treelet_allocations[dir_idx][start as usize];

                let mut in_treelet: Vec<u64> = vec![start];
                while let Some(node_idx) = in_treelet.pop() {
                    treelets[treelet_id as usize].nodes.push(node_idx);
                    let node = self.bvh.nodes[node_idx as usize];
                    if node.n_primitives == 0 {
                        let right = node.offset as u64;
                        if self.treelet_allocations[dir_idx][right as usize] == treelet_id {
                            in_treelet.push(right);
                        } else {
                            depth_first.push(right);
                        }

                        let left = node_idx + 1;
                        if self.treelet_allocations[dir_idx][left as usize] == treelet_id {
                            in_treelet.push(left);
                        } else {
                            depth_first.push(left);
                        }
                    }
                }
            }
        }
    }

    /// Returns the allocated treelets.
    pub fn treelets(&self) -> &[TreeletInfo] {
        &self.all_treelets
    }

    /// Verifies that every node is in exactly one treelet per direction.
    fn check_coverage(&self, num_dirs: usize, treelets: &[TreeletInfo]) -> Result<()> {
        let node_count = self.bvh.nodes.len();
        let mut node_check = vec![vec![0_u32; node_count]; num_dirs];

        for treelet in treelets {
            for node_idx in &treelet.nodes {
                node_check[treelet.dir_idx][*node_idx as usize] += 1;
            }
        }

        for (dir_idx, counts) in node_check.iter().enumerate() {
            for (node_idx, count) in counts.iter().enumerate() {
                if *count != 1 {
                    return Err(Error::Integrity(format!(
                        "node {node_idx} appears in {count} treelets (dir {dir_idx})"
                    )));
                }
            }
        }

        Ok(())
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::geometry::point3;
    use crate::shapes::triangle::TriangleMesh;

    fn grid_prims(n: usize) -> Vec<ScenePrimitive> {
        let mut p = vec![];
        let mut vi = vec![];
        for i in 0..n {
            let x = i as f32 * 2.0;
            p.push(point3(x, 0.0, 0.0));
            p.push(point3(x + 1.0, 0.0, 0.0));
            p.push(point3(x, 1.0, 0.0));
            vi.extend([3 * i as u32, 3 * i as u32 + 1, 3 * i as u32 + 2]);
        }
        let mesh = Arc::new(TriangleMesh::new(vi, p, None, None, None, None));

        (0..n)
            .map(|tri_number| ScenePrimitive::Triangle {
                mesh: Arc::clone(&mesh),
                mesh_id: 1,
                tri_number,
            })
            .collect()
    }

    fn config(max_treelet_bytes: u64, partition: PartitionAlgorithm) -> DumpConfig {
        DumpConfig {
            max_treelet_bytes,
            copyable_threshold: max_treelet_bytes / 2,
            partition,
            scene_accelerator: true,
            ..DumpConfig::default()
        }
    }

    #[test]
    fn instance_mask_union() {
        let mut a = InstanceMask::default();
        a.set(3);
        let mut b = InstanceMask::default();
        b.set(200);

        let u = a.union(&b);
        assert!(u.get(3));
        assert!(u.get(200));
        assert!(!u.get(4));
    }

    #[test]
    fn small_scene_fits_one_treelet() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = crate::core::scene::SceneContext::create(dir.path()).unwrap();

        let bvh =
            DumpBvh::new(grid_prims(16), config(1_000_000, PartitionAlgorithm::Nvidia), &mut ctx)
                .unwrap();
        assert_eq!(bvh.treelets().len(), 1);
        assert_eq!(bvh.treelets()[0].nodes.len(), bvh.node_count());
        assert_eq!(bvh.treelets()[0].nodes[0], 0);
    }

    #[test]
    fn tight_budget_splits_into_treelets() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = crate::core::scene::SceneContext::create(dir.path()).unwrap();

        for algo in [
            PartitionAlgorithm::Nvidia,
            PartitionAlgorithm::OneByOne,
            PartitionAlgorithm::MergedGraph,
        ] {
            let bvh = DumpBvh::new(grid_prims(64), config(2_048, algo), &mut ctx).unwrap();
            assert!(bvh.treelets().len() > 1, "{algo:?} produced one treelet");

            for treelet in bvh.treelets() {
                assert!(
                    treelet.no_instance_size + treelet.instance_size <= 2_048,
                    "{algo:?} treelet over budget"
                );
            }
        }
    }

    #[test]
    fn impossible_budget_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = crate::core::scene::SceneContext::create(dir.path()).unwrap();

        let result = DumpBvh::new(grid_prims(16), config(64, PartitionAlgorithm::Nvidia), &mut ctx);
        assert!(matches!(result, Err(Error::Budget { .. })));
    }
}
