//! Face-indexed texture atlases.
//!
//! Ptex-style textures are modeled as an atlas of per-face payloads with
//! 4-neighbour adjacency. The payload bytes are opaque; the subsystem only
//! needs face sizes, the adjacency graph, and the ability to cut an atlas
//! down to a face subset with a face-id remap.

#![allow(dead_code)]
use crate::core::error::{Error, Result};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::io::Read;

/// Sentinel for a missing neighbour.
pub const NO_FACE: u32 = u32::MAX;

/// One face of an atlas.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Face {
    /// Ids of up to four neighbouring faces; `NO_FACE` when absent.
    pub adj: [u32; 4],

    /// Opaque texel payload.
    pub data: Vec<u8>,
}

impl Face {
    /// Creates a face.
    ///
    /// * `adj`  - Neighbouring face ids.
    /// * `data` - Texel payload.
    pub fn new(adj: [u32; 4], data: Vec<u8>) -> Self {
        Self { adj, data }
    }
}

/// A face-indexed texture atlas.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FaceAtlas {
    /// The faces.
    pub faces: Vec<Face>,
}

impl FaceAtlas {
    /// Creates an atlas from faces.
    ///
    /// * `faces` - The faces.
    pub fn new(faces: Vec<Face>) -> Self {
        Self { faces }
    }

    /// Returns the number of faces.
    pub fn face_count(&self) -> usize {
        self.faces.len()
    }

    /// Returns the payload size of a face in bytes.
    ///
    /// * `i` - The face id.
    pub fn face_size(&self, i: usize) -> usize {
        self.faces[i].data.len()
    }

    /// Cuts the atlas down to the used faces plus their direct neighbours
    /// (kept for filtering), renumbering faces densely. Returns the new
    /// atlas and the old-face to new-face map.
    ///
    /// Adjacency ids of used faces are fully remapped; neighbour-only faces
    /// keep only the adjacency that survived the cut.
    ///
    /// * `used_faces` - The face ids to keep.
    pub fn cut(&self, used_faces: &BTreeSet<u32>) -> (FaceAtlas, BTreeMap<u32, u32>) {
        let mut old_to_new: BTreeMap<u32, u32> = BTreeMap::new();
        let mut new_to_old: Vec<u32> = vec![];
        let mut out_face_id = 0_u32;

        for i in 0..self.faces.len() as u32 {
            if !used_faces.contains(&i) {
                continue;
            }
            new_to_old.push(i);
            old_to_new.insert(i, out_face_id);
            out_face_id += 1;

            for adj in self.faces[i as usize].adj {
                if adj != NO_FACE && !used_faces.contains(&adj) && !old_to_new.contains_key(&adj) {
                    new_to_old.push(adj);
                    old_to_new.insert(adj, out_face_id);
                    out_face_id += 1;
                }
            }
        }

        let mut faces = Vec::with_capacity(new_to_old.len());
        for old_idx in &new_to_old {
            let used = used_faces.contains(old_idx);
            let src = &self.faces[*old_idx as usize];

            let mut adj = [NO_FACE; 4];
            for (slot, old_adj) in adj.iter_mut().zip(src.adj) {
                if old_adj == NO_FACE {
                    continue;
                }
                if used {
                    // Every neighbour of a used face was carried over.
                    *slot = *old_to_new.get(&old_adj).unwrap_or(&NO_FACE);
                } else {
                    *slot = old_to_new.get(&old_adj).copied().unwrap_or(NO_FACE);
                }
            }

            faces.push(Face::new(adj, src.data.clone()));
        }

        (FaceAtlas::new(faces), old_to_new)
    }

    /// Encodes the atlas to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = vec![];
        out.write_u32::<LittleEndian>(self.faces.len() as u32).unwrap();
        for face in &self.faces {
            for adj in face.adj {
                out.write_u32::<LittleEndian>(adj).unwrap();
            }
            out.write_u32::<LittleEndian>(face.data.len() as u32).unwrap();
            out.extend_from_slice(&face.data);
        }
        out
    }

    /// Decodes an atlas from bytes.
    ///
    /// * `bytes` - The encoded atlas.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let mut r = bytes;
        let count = r.read_u32::<LittleEndian>()?;
        let mut faces = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let mut adj = [NO_FACE; 4];
            for slot in adj.iter_mut() {
                *slot = r.read_u32::<LittleEndian>()?;
            }
            let len = r.read_u32::<LittleEndian>()? as usize;
            if len > r.len() {
                return Err(Error::Integrity(String::from("face payload overruns atlas")));
            }
            let mut data = vec![0_u8; len];
            r.read_exact(&mut data)?;
            faces.push(Face::new(adj, data));
        }
        Ok(Self::new(faces))
    }
}

/// Greedy BFS partition of an atlas's face graph: grow a partition face by
/// face (counting each partition's direct neighbours against it, since they
/// are duplicated for filtering), starting a fresh partition when the size
/// budget is exceeded. Returns the face sets.
///
/// * `atlas_sizes` - Per-face byte sizes summed over all atlases of the
///                   texture group.
/// * `adjacency`   - The shared face adjacency.
/// * `max_bytes`   - Partition byte budget.
pub fn partition_faces(
    face_sizes: &[u64],
    adjacency: &[[u32; 4]],
    max_bytes: u64,
) -> Vec<BTreeSet<u32>> {
    let face_count = face_sizes.len();
    let mut partitions: Vec<BTreeSet<u32>> = vec![];

    let mut partition: BTreeSet<u32> = BTreeSet::new();
    let mut partition_size = 0_u64;
    let mut adjacent = vec![false; face_count];
    let mut partitioned = vec![false; face_count];

    let mut unpartitioned: BTreeSet<u32> = (0..face_count as u32).collect();
    let mut next_to_visit: VecDeque<u32> = VecDeque::new();

    while let Some(&seed) = unpartitioned.iter().next() {
        next_to_visit.push_back(seed);

        while let Some(n) = next_to_visit.pop_front() {
            if partition_size > max_bytes {
                partitions.push(std::mem::take(&mut partition));
                partition_size = 0;
                adjacent.iter_mut().for_each(|a| *a = false);
            }

            // Add the face and charge its unseen neighbours to the
            // partition.
            partition.insert(n);
            partition_size += face_sizes[n as usize];
            partitioned[n as usize] = true;
            unpartitioned.remove(&n);

            for adj in adjacency[n as usize] {
                if adj == NO_FACE {
                    continue;
                }
                if !partition.contains(&adj) && !adjacent[adj as usize] {
                    adjacent[adj as usize] = true;
                    partition_size += face_sizes[adj as usize];

                    if !partitioned[adj as usize] {
                        next_to_visit.push_back(adj);
                    }
                }
            }
        }
    }

    if !partition.is_empty() {
        partitions.push(partition);
    }

    partitions
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    /// Four faces in a strip: 0 - 1 - 2 - 3.
    fn strip() -> FaceAtlas {
        FaceAtlas::new(vec![
            Face::new([NO_FACE, 1, NO_FACE, NO_FACE], vec![0; 16]),
            Face::new([0, 2, NO_FACE, NO_FACE], vec![1; 16]),
            Face::new([1, 3, NO_FACE, NO_FACE], vec![2; 16]),
            Face::new([2, NO_FACE, NO_FACE, NO_FACE], vec![3; 16]),
        ])
    }

    #[test]
    fn atlas_roundtrip() {
        let atlas = strip();
        let parsed = FaceAtlas::from_bytes(&atlas.to_bytes()).unwrap();
        assert_eq!(atlas, parsed);
    }

    #[test]
    fn cut_keeps_used_faces_and_neighbours() {
        let atlas = strip();
        let used: BTreeSet<u32> = [0, 1].into_iter().collect();
        let (cut, old_to_new) = atlas.cut(&used);

        // Faces 0 and 1 kept, face 2 kept as a neighbour of 1; 3 dropped.
        assert_eq!(cut.face_count(), 3);
        assert!(old_to_new.contains_key(&2));
        assert!(!old_to_new.contains_key(&3));

        // Payloads follow their faces.
        assert_eq!(cut.faces[old_to_new[&1] as usize].data, vec![1; 16]);

        // The neighbour-only face drops adjacency that did not survive.
        let neighbour = &cut.faces[old_to_new[&2] as usize];
        assert_eq!(neighbour.adj[1], NO_FACE);
        assert_eq!(neighbour.adj[0], old_to_new[&1]);
    }

    #[test]
    fn partition_respects_budget() {
        let sizes = vec![16_u64; 4];
        let adjacency: Vec<[u32; 4]> = strip().faces.iter().map(|f| f.adj).collect();

        let partitions = partition_faces(&sizes, &adjacency, 40);
        assert!(partitions.len() >= 2);

        // Every face lands in exactly one partition.
        let mut seen = BTreeSet::new();
        for p in &partitions {
            for f in p {
                assert!(seen.insert(*f));
            }
        }
        assert_eq!(seen.len(), 4);
    }
}
