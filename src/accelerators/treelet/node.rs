//! In-memory treelet node model and its on-disk byte layout.

#![allow(dead_code)]
use crate::core::error::{Error, Result};
use crate::core::geometry::{bounds3, Bounds3f, Float, Point3f};

/// Serialized size of a node in bytes; part of the external format.
pub const NODE_SIZE: usize = 40;

/// Sentinel overlapping the first child pointer word that marks leaves.
pub const LEAF_TAG: u32 = u32::MAX;

/// Child slot indices.
pub const LEFT: usize = 0;
pub const RIGHT: usize = 1;

/// Payload of a treelet node: interior child links or a leaf primitive
/// range. On disk the two overlap in a 12-byte union discriminated by
/// `LEAF_TAG`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum NodeData {
    /// Interior node with two child links; a child in another treelet
    /// carries that treelet's id.
    Interior {
        /// Treelet id of each child.
        child_treelet: [u16; 2],

        /// Node index of each child within its treelet.
        child_node: [u32; 2],
    },

    /// Leaf node with a primitive range.
    Leaf {
        /// Offset of the first primitive.
        primitive_offset: u32,

        /// Number of primitives.
        primitive_count: u32,
    },
}

/// A node of a treelet's private BVH.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct TreeletNode {
    /// Bounding box of the node.
    pub bounds: Bounds3f,

    /// Split axis for interior nodes.
    pub axis: u8,

    /// Child links or leaf payload.
    pub data: NodeData,
}

impl TreeletNode {
    /// Creates an interior node with unset child links.
    ///
    /// * `bounds` - Bounding box.
    /// * `axis`   - Split axis.
    pub fn interior(bounds: Bounds3f, axis: u8) -> Self {
        Self {
            bounds,
            axis,
            data: NodeData::Interior {
                child_treelet: [0; 2],
                child_node: [0; 2],
            },
        }
    }

    /// Creates a leaf node.
    ///
    /// * `bounds`           - Bounding box.
    /// * `axis`             - Split axis.
    /// * `primitive_offset` - Offset of the first primitive.
    /// * `primitive_count`  - Number of primitives.
    pub fn leaf(bounds: Bounds3f, axis: u8, primitive_offset: u32, primitive_count: u32) -> Self {
        Self {
            bounds,
            axis,
            data: NodeData::Leaf {
                primitive_offset,
                primitive_count,
            },
        }
    }

    /// Returns true for leaf nodes.
    pub fn is_leaf(&self) -> bool {
        matches!(self.data, NodeData::Leaf { .. })
    }

    /// Returns the leaf primitive range, if this is a leaf.
    pub fn leaf_range(&self) -> Option<(u32, u32)> {
        match self.data {
            NodeData::Leaf {
                primitive_offset,
                primitive_count,
            } => Some((primitive_offset, primitive_count)),
            NodeData::Interior { .. } => None,
        }
    }

    /// Returns one child link `(treelet, node)` of an interior node.
    ///
    /// * `side` - `LEFT` or `RIGHT`.
    pub fn child(&self, side: usize) -> Option<(u16, u32)> {
        match self.data {
            NodeData::Interior {
                child_treelet,
                child_node,
            } => Some((child_treelet[side], child_node[side])),
            NodeData::Leaf { .. } => None,
        }
    }

    /// Sets one child link of an interior node.
    ///
    /// * `side`    - `LEFT` or `RIGHT`.
    /// * `treelet` - Treelet id of the child.
    /// * `node`    - Node index of the child within its treelet.
    pub fn set_child(&mut self, side: usize, treelet: u16, node: u32) {
        match &mut self.data {
            NodeData::Interior {
                child_treelet,
                child_node,
            } => {
                child_treelet[side] = treelet;
                child_node[side] = node;
            }
            NodeData::Leaf { .. } => panic!("set_child on a leaf node"),
        }
    }

    /// Encodes the node to its 40-byte on-disk layout.
    pub fn to_bytes(&self) -> [u8; NODE_SIZE] {
        let mut b = [0_u8; NODE_SIZE];
        write_f32(&mut b, 0, self.bounds.p_min.x);
        write_f32(&mut b, 4, self.bounds.p_min.y);
        write_f32(&mut b, 8, self.bounds.p_min.z);
        write_f32(&mut b, 12, self.bounds.p_max.x);
        write_f32(&mut b, 16, self.bounds.p_max.y);
        write_f32(&mut b, 20, self.bounds.p_max.z);
        b[24] = self.axis;

        match self.data {
            NodeData::Interior {
                child_treelet,
                child_node,
            } => {
                b[28..30].copy_from_slice(&child_treelet[0].to_le_bytes());
                b[30..32].copy_from_slice(&child_treelet[1].to_le_bytes());
                b[32..36].copy_from_slice(&child_node[0].to_le_bytes());
                b[36..40].copy_from_slice(&child_node[1].to_le_bytes());
            }
            NodeData::Leaf {
                primitive_offset,
                primitive_count,
            } => {
                b[28..32].copy_from_slice(&LEAF_TAG.to_le_bytes());
                b[32..36].copy_from_slice(&primitive_offset.to_le_bytes());
                b[36..40].copy_from_slice(&primitive_count.to_le_bytes());
            }
        }

        b
    }

    /// Decodes a node from its on-disk layout.
    ///
    /// * `b`  - The 40 node bytes.
    /// * `id` - Treelet id reported in format errors.
    pub fn from_bytes(b: &[u8], id: u32) -> Result<Self> {
        if b.len() < NODE_SIZE {
            return Err(Error::format(id, "short node record"));
        }

        let bounds = bounds3(
            Point3f::new(read_f32(b, 0), read_f32(b, 4), read_f32(b, 8)),
            Point3f::new(read_f32(b, 12), read_f32(b, 16), read_f32(b, 20)),
        );
        let axis = b[24];

        let tag = u32::from_le_bytes(b[28..32].try_into().unwrap());
        let data = if tag == LEAF_TAG {
            NodeData::Leaf {
                primitive_offset: u32::from_le_bytes(b[32..36].try_into().unwrap()),
                primitive_count: u32::from_le_bytes(b[36..40].try_into().unwrap()),
            }
        } else {
            NodeData::Interior {
                child_treelet: [
                    u16::from_le_bytes(b[28..30].try_into().unwrap()),
                    u16::from_le_bytes(b[30..32].try_into().unwrap()),
                ],
                child_node: [
                    u32::from_le_bytes(b[32..36].try_into().unwrap()),
                    u32::from_le_bytes(b[36..40].try_into().unwrap()),
                ],
            }
        };

        Ok(Self { bounds, axis, data })
    }

    /// Decodes a dense node array blob.
    ///
    /// * `blob`  - The node bytes, `count * NODE_SIZE` long.
    /// * `count` - Number of nodes.
    /// * `id`    - Treelet id reported in format errors.
    pub fn from_blob(blob: &[u8], count: usize, id: u32) -> Result<Vec<Self>> {
        if blob.len() != count * NODE_SIZE {
            return Err(Error::format(
                id,
                format!(
                    "node blob is {} bytes, expected {} nodes * {}",
                    blob.len(),
                    count,
                    NODE_SIZE
                ),
            ));
        }

        (0..count)
            .map(|i| Self::from_bytes(&blob[i * NODE_SIZE..(i + 1) * NODE_SIZE], id))
            .collect()
    }
}

fn write_f32(b: &mut [u8], off: usize, v: Float) {
    b[off..off + 4].copy_from_slice(&v.to_le_bytes());
}

fn read_f32(b: &[u8], off: usize) -> Float {
    Float::from_le_bytes(b[off..off + 4].try_into().unwrap())
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::geometry::point3;

    fn bounds() -> Bounds3f {
        bounds3(point3(-1.0, -2.0, -3.0), point3(1.0, 2.0, 3.0))
    }

    #[test]
    fn interior_roundtrip() {
        let mut node = TreeletNode::interior(bounds(), 2);
        node.set_child(LEFT, 0, 1);
        node.set_child(RIGHT, 5, 17);

        let parsed = TreeletNode::from_bytes(&node.to_bytes(), 0).unwrap();
        assert_eq!(parsed, node);
        assert!(!parsed.is_leaf());
        assert_eq!(parsed.child(RIGHT), Some((5, 17)));
    }

    #[test]
    fn leaf_roundtrip() {
        let node = TreeletNode::leaf(bounds(), 0, 12, 3);
        let encoded = node.to_bytes();

        // The sentinel must overlap the first child pointer word.
        assert_eq!(u32::from_le_bytes(encoded[28..32].try_into().unwrap()), LEAF_TAG);

        let parsed = TreeletNode::from_bytes(&encoded, 0).unwrap();
        assert_eq!(parsed, node);
        assert_eq!(parsed.leaf_range(), Some((12, 3)));
    }

    #[test]
    fn blob_size_mismatch_is_a_format_error() {
        let node = TreeletNode::leaf(bounds(), 0, 0, 1);
        let bytes = node.to_bytes();
        assert!(TreeletNode::from_blob(&bytes, 2, 9).is_err());
    }
}
