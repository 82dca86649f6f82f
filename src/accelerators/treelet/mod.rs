//! Treelet-partitioned BVH: offline dumping and online traversal.

#![allow(dead_code)]
use crate::accelerators::bvh::SplitMethod;
use crate::core::geometry::Vector3f;
use crate::core::paramset::ParamSet;

pub mod dump;
pub mod format;
pub mod graph;
pub mod node;
pub mod partition;
pub mod ptex;
pub mod ray_state;
pub mod residency;
pub mod traverse;

/// Edge model used when building the traversal graph.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TraversalAlgorithm {
    /// Edges only to the immediate next-hit / next-miss nodes.
    SendCheck,

    /// Edges to every node remaining on the traversal stack.
    CheckSend,
}

/// Treelet allocation algorithm.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PartitionAlgorithm {
    /// Greedy one-by-one growth along the traversal graph.
    OneByOne,

    /// Two-pass priority / SAH allocation.
    Nvidia,

    /// One-by-one growth over the merged eight-direction graph.
    MergedGraph,
}

/// Configuration of the offline dumper.
#[derive(Clone, Debug)]
pub struct DumpConfig {
    /// Per-treelet byte budget.
    pub max_treelet_bytes: u64,

    /// Sub-BVHs below this total size are inlined by value.
    pub copyable_threshold: u64,

    /// Edge model for the traversal graph.
    pub traversal: TraversalAlgorithm,

    /// Treelet allocation algorithm.
    pub partition: PartitionAlgorithm,

    /// Whether this BVH is the scene root; instance sub-BVHs set false.
    pub scene_accelerator: bool,

    /// Emit the `HEADER` record during dump.
    pub write_header: bool,

    /// Enable eight-octant directional treelets.
    pub directional_treelets: bool,

    /// Upstream BVH leaf primitive cap.
    pub max_prims_in_node: u8,

    /// Upstream BVH builder split method.
    pub split_method: SplitMethod,
}

impl Default for DumpConfig {
    fn default() -> Self {
        Self {
            max_treelet_bytes: 1_000_000_000,
            copyable_threshold: 500_000_000,
            traversal: TraversalAlgorithm::SendCheck,
            partition: PartitionAlgorithm::Nvidia,
            scene_accelerator: false,
            write_header: false,
            directional_treelets: false,
            max_prims_in_node: 4,
            split_method: SplitMethod::SAH,
        }
    }
}

impl From<&ParamSet> for DumpConfig {
    /// Builds a dump configuration from recognised options, falling back to
    /// defaults with a warning for unknown spellings.
    ///
    /// * `ps` - The parameter set.
    fn from(ps: &ParamSet) -> Self {
        let max_treelet_bytes = ps.find_one_int("maxtreeletbytes", 1_000_000_000) as u64;
        let copyable_threshold =
            ps.find_one_int("copyablethreshold", (max_treelet_bytes / 2) as i32) as u64;

        let traversal_name = ps.find_one_string("traversal", "sendcheck");
        let traversal = match &traversal_name[..] {
            "sendcheck" => TraversalAlgorithm::SendCheck,
            "checksend" => TraversalAlgorithm::CheckSend,
            other => {
                warn!("BVH traversal algorithm '{}' unknown. Using 'sendcheck'.", other);
                TraversalAlgorithm::SendCheck
            }
        };

        let partition_name = ps.find_one_string("partition", "nvidia");
        let partition = match &partition_name[..] {
            "onebyone" => PartitionAlgorithm::OneByOne,
            "nvidia" => PartitionAlgorithm::Nvidia,
            "mergedgraph" => PartitionAlgorithm::MergedGraph,
            "topohierarchical" | "greedysize" | "agglomerative" => {
                warn!(
                    "BVH partition algorithm '{}' is not maintained. Using 'onebyone'.",
                    partition_name
                );
                PartitionAlgorithm::OneByOne
            }
            other => {
                warn!("BVH partition algorithm '{}' unknown. Using 'onebyone'.", other);
                PartitionAlgorithm::OneByOne
            }
        };

        let split_method_name = ps.find_one_string("splitmethod", "sah");
        let split_method = match &split_method_name[..] {
            "sah" => SplitMethod::SAH,
            "middle" => SplitMethod::Middle,
            "equal" => SplitMethod::EqualCounts,
            "hlbvh" => {
                warn!("BVH split method 'hlbvh' is handled upstream. Using 'sah'.");
                SplitMethod::SAH
            }
            other => {
                warn!("BVH split method '{}' unknown. Using 'sah'.", other);
                SplitMethod::SAH
            }
        };

        Self {
            max_treelet_bytes,
            copyable_threshold,
            traversal,
            partition,
            scene_accelerator: ps.find_one_bool("sceneaccelerator", false),
            write_header: ps.find_one_bool("writeheader", false),
            directional_treelets: ps.find_one_bool("directionaltreelets", false),
            max_prims_in_node: ps.find_one_int("maxnodeprims", 4) as u8,
            split_method,
        }
    }
}

/// Returns the canonical diagonal ray direction of an octant index.
///
/// * `idx` - The octant index in `0..8`.
pub fn compute_ray_dir(idx: u32) -> Vector3f {
    let x = idx & (1 << 0);
    let y = idx & (1 << 1);
    let z = idx & (1 << 2);

    Vector3f::new(
        if x != 0 { 1.0 } else { -1.0 },
        if y != 0 { 1.0 } else { -1.0 },
        if z != 0 { 1.0 } else { -1.0 },
    )
}

/// Returns the octant index of a ray direction, or 0 when directional
/// treelets are disabled.
///
/// * `dir`         - The ray direction.
/// * `directional` - Whether directional treelets are enabled.
pub fn compute_idx(dir: &Vector3f, directional: bool) -> u32 {
    if directional {
        u32::from(dir.x >= 0.0)
            + (u32::from(dir.y >= 0.0) << 1)
            + (u32::from(dir.z >= 0.0) << 2)
    } else {
        0
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn octant_roundtrip() {
        for idx in 0..8 {
            let dir = compute_ray_dir(idx);
            assert_eq!(compute_idx(&dir, true), idx);
        }
    }

    #[test]
    fn octant_disabled_is_zero() {
        let dir = Vector3f::new(1.0, 1.0, 1.0);
        assert_eq!(compute_idx(&dir, false), 0);
    }

    #[test]
    fn config_from_params_recognises_options() {
        let mut ps = ParamSet::new();
        ps.add_int("maxtreeletbytes", vec![10_000]);
        ps.add_string("traversal", vec![String::from("checksend")]);
        ps.add_string("partition", vec![String::from("onebyone")]);
        ps.add_bool("sceneaccelerator", vec![true]);

        let config = DumpConfig::from(&ps);
        assert_eq!(config.max_treelet_bytes, 10_000);
        assert_eq!(config.copyable_threshold, 5_000);
        assert_eq!(config.traversal, TraversalAlgorithm::CheckSend);
        assert_eq!(config.partition, PartitionAlgorithm::OneByOne);
        assert!(config.scene_accelerator);
    }
}
