//! Triangles and triangle meshes

#![allow(dead_code)]
use crate::core::error::{Error, Result};
use crate::core::geometry::{
    bounds3, Bounds3f, Float, Normal3f, Point2f, Point3f, Ray, Vector3f,
};
use crate::core::interaction::SurfaceInteraction;
use byteorder::{LittleEndian, WriteBytesExt};
use std::collections::HashMap;
use std::sync::Arc;

/// Mesh blob flags.
const FLAG_NORMALS: u32 = 1 << 0;
const FLAG_TANGENTS: u32 = 1 << 1;
const FLAG_UV: u32 = 1 << 2;
const FLAG_FACE_INDICES: u32 = 1 << 3;

/// A triangle mesh backed by a shared byte buffer. Vertex data is stored in
/// the serialized layout and decoded on access, so a mesh loaded from a
/// treelet is a view over the treelet's single backing buffer; the buffer
/// must outlive every `Triangle` drawn from the mesh.
#[derive(Clone)]
pub struct TriangleMesh {
    /// The backing buffer; shared with the treelet and all triangles.
    storage: Arc<Vec<u8>>,

    /// Byte offset of this mesh's blob within the backing buffer.
    offset: usize,

    /// Total length of the blob.
    len: usize,

    /// The number of triangles.
    n_triangles: u32,

    /// The number of vertices.
    n_vertices: u32,

    /// Byte offset of the vertex index array.
    vi_off: usize,

    /// Byte offset of the position array.
    p_off: usize,

    /// Byte offset of the per-vertex normals, when present.
    n_off: Option<usize>,

    /// Byte offset of the per-vertex tangents, when present.
    s_off: Option<usize>,

    /// Byte offset of the per-vertex uv-coordinates, when present.
    uv_off: Option<usize>,

    /// Byte offset of the per-triangle face indices, when present.
    face_off: Option<usize>,
}

impl TriangleMesh {
    /// Creates a mesh from its vertex arrays by encoding them into a fresh
    /// backing buffer.
    ///
    /// * `vertex_indices` - Vertex indices; triangle `i` uses entries
    ///                      `3 * i .. 3 * i + 3`.
    /// * `p`              - Vertex positions.
    /// * `n`              - Optional per-vertex normals.
    /// * `s`              - Optional per-vertex tangents.
    /// * `uv`             - Optional per-vertex uv-coordinates.
    /// * `face_indices`   - Optional per-triangle face indices.
    pub fn new(
        vertex_indices: Vec<u32>,
        p: Vec<Point3f>,
        n: Option<Vec<Normal3f>>,
        s: Option<Vec<Vector3f>>,
        uv: Option<Vec<Point2f>>,
        face_indices: Option<Vec<u32>>,
    ) -> Self {
        assert!(vertex_indices.len() % 3 == 0);
        let n_triangles = (vertex_indices.len() / 3) as u32;
        let n_vertices = p.len() as u32;

        if let Some(ref v) = n {
            assert_eq!(v.len(), p.len());
        }
        if let Some(ref v) = s {
            assert_eq!(v.len(), p.len());
        }
        if let Some(ref v) = uv {
            assert_eq!(v.len(), p.len());
        }
        if let Some(ref v) = face_indices {
            assert_eq!(v.len(), n_triangles as usize);
        }

        let mut flags = 0;
        if n.is_some() {
            flags |= FLAG_NORMALS;
        }
        if s.is_some() {
            flags |= FLAG_TANGENTS;
        }
        if uv.is_some() {
            flags |= FLAG_UV;
        }
        if face_indices.is_some() {
            flags |= FLAG_FACE_INDICES;
        }

        let mut out = vec![];
        out.write_u32::<LittleEndian>(n_triangles).unwrap();
        out.write_u32::<LittleEndian>(n_vertices).unwrap();
        out.write_u32::<LittleEndian>(flags).unwrap();

        for i in &vertex_indices {
            out.write_u32::<LittleEndian>(*i).unwrap();
        }
        for v in &p {
            out.write_f32::<LittleEndian>(v.x).unwrap();
            out.write_f32::<LittleEndian>(v.y).unwrap();
            out.write_f32::<LittleEndian>(v.z).unwrap();
        }
        if let Some(ref values) = n {
            for v in values {
                out.write_f32::<LittleEndian>(v.x).unwrap();
                out.write_f32::<LittleEndian>(v.y).unwrap();
                out.write_f32::<LittleEndian>(v.z).unwrap();
            }
        }
        if let Some(ref values) = s {
            for v in values {
                out.write_f32::<LittleEndian>(v.x).unwrap();
                out.write_f32::<LittleEndian>(v.y).unwrap();
                out.write_f32::<LittleEndian>(v.z).unwrap();
            }
        }
        if let Some(ref values) = uv {
            for v in values {
                out.write_f32::<LittleEndian>(v.x).unwrap();
                out.write_f32::<LittleEndian>(v.y).unwrap();
            }
        }
        if let Some(ref values) = face_indices {
            for v in values {
                out.write_u32::<LittleEndian>(*v).unwrap();
            }
        }

        Self::from_storage(Arc::new(out), 0).expect("freshly encoded mesh must parse")
    }

    /// Creates a mesh view over a backing buffer.
    ///
    /// * `storage` - The backing buffer.
    /// * `offset`  - Byte offset of the mesh blob within the buffer.
    pub fn from_storage(storage: Arc<Vec<u8>>, offset: usize) -> Result<Self> {
        let err = || Error::Integrity(String::from("mesh blob out of range"));

        let header_end = offset.checked_add(12).ok_or_else(err)?;
        if header_end > storage.len() {
            return Err(err());
        }

        let n_triangles = read_u32(&storage, offset);
        let n_vertices = read_u32(&storage, offset + 4);
        let flags = read_u32(&storage, offset + 8);

        let mut cursor = offset + 12;
        let vi_off = cursor;
        cursor += 3 * n_triangles as usize * 4;
        let p_off = cursor;
        cursor += 3 * n_vertices as usize * 4;

        let n_off = if flags & FLAG_NORMALS != 0 {
            let o = cursor;
            cursor += 3 * n_vertices as usize * 4;
            Some(o)
        } else {
            None
        };
        let s_off = if flags & FLAG_TANGENTS != 0 {
            let o = cursor;
            cursor += 3 * n_vertices as usize * 4;
            Some(o)
        } else {
            None
        };
        let uv_off = if flags & FLAG_UV != 0 {
            let o = cursor;
            cursor += 2 * n_vertices as usize * 4;
            Some(o)
        } else {
            None
        };
        let face_off = if flags & FLAG_FACE_INDICES != 0 {
            let o = cursor;
            cursor += n_triangles as usize * 4;
            Some(o)
        } else {
            None
        };

        if cursor > storage.len() {
            return Err(err());
        }

        Ok(Self {
            storage,
            offset,
            len: cursor - offset,
            n_triangles,
            n_vertices,
            vi_off,
            p_off,
            n_off,
            s_off,
            uv_off,
            face_off,
        })
    }

    /// Returns the serialized mesh blob.
    pub fn serialized(&self) -> &[u8] {
        &self.storage[self.offset..self.offset + self.len]
    }

    /// Returns the length of the serialized mesh blob.
    pub fn serialized_len(&self) -> usize {
        self.len
    }

    /// Returns the number of triangles.
    pub fn n_triangles(&self) -> usize {
        self.n_triangles as usize
    }

    /// Returns the number of vertices.
    pub fn n_vertices(&self) -> usize {
        self.n_vertices as usize
    }

    /// Returns a vertex index.
    ///
    /// * `i` - Index into the vertex index array.
    pub fn vertex_index(&self, i: usize) -> usize {
        read_u32(&self.storage, self.vi_off + i * 4) as usize
    }

    /// Returns a vertex position.
    ///
    /// * `i` - The vertex number.
    pub fn p(&self, i: usize) -> Point3f {
        let o = self.p_off + i * 12;
        Point3f::new(
            read_f32(&self.storage, o),
            read_f32(&self.storage, o + 4),
            read_f32(&self.storage, o + 8),
        )
    }

    /// Returns true when per-vertex normals are present.
    pub fn has_normals(&self) -> bool {
        self.n_off.is_some()
    }

    /// Returns a vertex normal.
    ///
    /// * `i` - The vertex number.
    pub fn n(&self, i: usize) -> Normal3f {
        let o = self.n_off.expect("mesh has no normals") + i * 12;
        Normal3f::new(
            read_f32(&self.storage, o),
            read_f32(&self.storage, o + 4),
            read_f32(&self.storage, o + 8),
        )
    }

    /// Returns true when per-vertex tangents are present.
    pub fn has_tangents(&self) -> bool {
        self.s_off.is_some()
    }

    /// Returns a vertex tangent.
    ///
    /// * `i` - The vertex number.
    pub fn s(&self, i: usize) -> Vector3f {
        let o = self.s_off.expect("mesh has no tangents") + i * 12;
        Vector3f::new(
            read_f32(&self.storage, o),
            read_f32(&self.storage, o + 4),
            read_f32(&self.storage, o + 8),
        )
    }

    /// Returns true when per-vertex uv-coordinates are present.
    pub fn has_uv(&self) -> bool {
        self.uv_off.is_some()
    }

    /// Returns a vertex uv-coordinate.
    ///
    /// * `i` - The vertex number.
    pub fn uv(&self, i: usize) -> Point2f {
        let o = self.uv_off.expect("mesh has no uv") + i * 8;
        Point2f::new(read_f32(&self.storage, o), read_f32(&self.storage, o + 4))
    }

    /// Returns true when per-triangle face indices are present.
    pub fn has_face_indices(&self) -> bool {
        self.face_off.is_some()
    }

    /// Returns a triangle's face index.
    ///
    /// * `i` - The triangle number.
    pub fn face_index(&self, i: usize) -> u32 {
        read_u32(&self.storage, self.face_off.expect("mesh has no face indices") + i * 4)
    }
}

/// A single triangle of a mesh.
#[derive(Clone)]
pub struct Triangle {
    /// The mesh.
    pub mesh: Arc<TriangleMesh>,

    /// The triangle number within the mesh.
    pub tri_number: usize,
}

impl Triangle {
    /// Creates a new triangle.
    ///
    /// * `mesh`       - The mesh.
    /// * `tri_number` - The triangle number within the mesh.
    pub fn new(mesh: Arc<TriangleMesh>, tri_number: usize) -> Self {
        Self { mesh, tri_number }
    }

    /// Returns the triangle's three vertex positions.
    fn vertices(&self) -> [Point3f; 3] {
        let i0 = self.mesh.vertex_index(self.tri_number * 3);
        let i1 = self.mesh.vertex_index(self.tri_number * 3 + 1);
        let i2 = self.mesh.vertex_index(self.tri_number * 3 + 2);
        [self.mesh.p(i0), self.mesh.p(i1), self.mesh.p(i2)]
    }

    /// Returns a bounding box of the triangle.
    pub fn world_bound(&self) -> Bounds3f {
        let [p0, p1, p2] = self.vertices();
        bounds3(p0, p1).union_point(&p2)
    }

    /// Returns geometric details if the ray intersects the triangle within
    /// `[0, t_max]` and updates the ray's `t_max`.
    ///
    /// * `r` - The ray.
    pub fn intersect(&self, r: &mut Ray) -> Option<SurfaceInteraction> {
        let (t, b0, b1, b2) = self.intersect_core(r)?;

        let [p0, p1, p2] = self.vertices();
        let i0 = self.mesh.vertex_index(self.tri_number * 3);
        let i1 = self.mesh.vertex_index(self.tri_number * 3 + 1);
        let i2 = self.mesh.vertex_index(self.tri_number * 3 + 2);

        let dp02 = p0 - p2;
        let dp12 = p1 - p2;
        let mut n = Normal3f::from(dp02.cross(&dp12)).normalize();

        // Use shading normals to orient the geometric normal when present.
        if self.mesh.has_normals() {
            let ns = self.mesh.n(i0) * b0 + self.mesh.n(i1) * b1 + self.mesh.n(i2) * b2;
            if n.dot(&Vector3f::from(ns)) < 0.0 {
                n = -n;
            }
        }

        let uv = if self.mesh.has_uv() {
            self.mesh.uv(i0) * b0 + self.mesh.uv(i1) * b1 + self.mesh.uv(i2) * b2
        } else {
            Point2f::new(b0, b1)
        };

        r.t_max = t;

        Some(SurfaceInteraction {
            p: p0 * b0 + p1 * b1 + p2 * b2,
            n,
            uv,
            wo: -r.d,
            t,
            time: r.time,
            ..Default::default()
        })
    }

    /// Returns true if the ray intersects the triangle within `[0, t_max]`.
    ///
    /// * `r` - The ray.
    pub fn intersect_p(&self, r: &Ray) -> bool {
        self.intersect_core(r).is_some()
    }

    /// Möller-Trumbore intersection; returns the ray parameter and
    /// barycentric coordinates.
    fn intersect_core(&self, r: &Ray) -> Option<(Float, Float, Float, Float)> {
        let [p0, p1, p2] = self.vertices();

        let e1 = p1 - p0;
        let e2 = p2 - p0;
        let pvec = r.d.cross(&e2);
        let det = e1.dot(&pvec);
        if det.abs() < 1e-12 {
            return None;
        }

        let inv_det = 1.0 / det;
        let tvec = r.o - p0;
        let u = tvec.dot(&pvec) * inv_det;
        if !(0.0..=1.0).contains(&u) {
            return None;
        }

        let qvec = tvec.cross(&e1);
        let v = r.d.dot(&qvec) * inv_det;
        if v < 0.0 || u + v > 1.0 {
            return None;
        }

        let t = e2.dot(&qvec) * inv_det;
        if t <= 0.0 || t >= r.t_max {
            return None;
        }

        // Barycentric weights for p0, p1, p2.
        Some((t, 1.0 - u - v, u, v))
    }
}

/// Builds a cut of `mesh` containing only the given triangles, with vertex
/// indices renumbered densely and optional attributes carried through iff
/// present on the source. Records `(orig_tri) -> (new_mesh, new_tri)` into
/// `tri_num_remap`.
///
/// * `new_mesh_id`   - Id assigned to the cut mesh.
/// * `mesh`          - The source mesh.
/// * `tri_nums`      - Triangle numbers to keep.
/// * `tri_num_remap` - Receives the triangle renumbering.
/// * `face_remap`    - Face id remap applied to kept face indices.
pub fn cut_mesh<F>(
    new_mesh_id: u64,
    mesh: &TriangleMesh,
    tri_nums: &[usize],
    tri_num_remap: &mut HashMap<usize, (u64, usize)>,
    face_remap: F,
) -> TriangleMesh
where
    F: Fn(u32) -> u32,
{
    let mut vertex_remap: HashMap<usize, usize> = HashMap::new();
    let mut new_to_old: Vec<usize> = vec![];

    for (new_tri, tri_num) in tri_nums.iter().enumerate() {
        for i in 0..3 {
            let idx = mesh.vertex_index(tri_num * 3 + i);
            vertex_remap.entry(idx).or_insert_with(|| {
                new_to_old.push(idx);
                new_to_old.len() - 1
            });
        }
        tri_num_remap.insert(*tri_num, (new_mesh_id, new_tri));
    }

    let mut vertex_indices = Vec::with_capacity(tri_nums.len() * 3);
    let mut face_indices = Vec::with_capacity(tri_nums.len());
    for tri_num in tri_nums {
        for i in 0..3 {
            let orig = mesh.vertex_index(tri_num * 3 + i);
            vertex_indices.push(vertex_remap[&orig] as u32);
        }
        if mesh.has_face_indices() {
            face_indices.push(face_remap(mesh.face_index(*tri_num)));
        }
    }

    let p: Vec<Point3f> = new_to_old.iter().map(|i| mesh.p(*i)).collect();
    let n = mesh
        .has_normals()
        .then(|| new_to_old.iter().map(|i| mesh.n(*i)).collect());
    let s = mesh
        .has_tangents()
        .then(|| new_to_old.iter().map(|i| mesh.s(*i)).collect());
    let uv = mesh
        .has_uv()
        .then(|| new_to_old.iter().map(|i| mesh.uv(*i)).collect());
    let faces = mesh.has_face_indices().then_some(face_indices);

    TriangleMesh::new(vertex_indices, p, n, s, uv, faces)
}

/// Returns the triangle numbers of a mesh whose face index appears in the
/// face map.
///
/// * `mesh`     - The mesh.
/// * `face_map` - Old face to new face remap.
pub fn face_ids_to_tri_nums(
    mesh: &TriangleMesh,
    face_map: &std::collections::BTreeMap<u32, u32>,
) -> Result<Vec<usize>> {
    if !mesh.has_face_indices() {
        return Err(Error::Integrity(String::from(
            "mesh doesn't have any face indices",
        )));
    }

    Ok((0..mesh.n_triangles())
        .filter(|i| face_map.contains_key(&mesh.face_index(*i)))
        .collect())
}

fn read_u32(buf: &[u8], off: usize) -> u32 {
    u32::from_le_bytes(buf[off..off + 4].try_into().unwrap())
}

fn read_f32(buf: &[u8], off: usize) -> Float {
    Float::from_le_bytes(buf[off..off + 4].try_into().unwrap())
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::geometry::{point3, ray, vector3};

    /// A unit quad in the z = 0 plane, two triangles.
    fn quad() -> TriangleMesh {
        TriangleMesh::new(
            vec![0, 1, 2, 0, 2, 3],
            vec![
                point3(-1.0, -1.0, 0.0),
                point3(1.0, -1.0, 0.0),
                point3(1.0, 1.0, 0.0),
                point3(-1.0, 1.0, 0.0),
            ],
            None,
            None,
            Some(vec![
                Point2f::new(0.0, 0.0),
                Point2f::new(1.0, 0.0),
                Point2f::new(1.0, 1.0),
                Point2f::new(0.0, 1.0),
            ]),
            Some(vec![0, 1]),
        )
    }

    #[test]
    fn storage_roundtrip() {
        let mesh = quad();
        let bytes = mesh.serialized().to_vec();
        let view = TriangleMesh::from_storage(Arc::new(bytes), 0).unwrap();

        assert_eq!(view.n_triangles(), 2);
        assert_eq!(view.n_vertices(), 4);
        assert_eq!(view.p(2), point3(1.0, 1.0, 0.0));
        assert!(view.has_uv());
        assert!(!view.has_normals());
        assert_eq!(view.face_index(1), 1);
    }

    #[test]
    fn ray_hits_quad() {
        let mesh = Arc::new(quad());
        let tri = Triangle::new(Arc::clone(&mesh), 0);
        let mut r = ray(point3(-0.5, -0.5, -5.0), vector3(0.0, 0.0, 1.0), Float::INFINITY);

        let isect = tri.intersect(&mut r).expect("should hit");
        assert_eq!(r.t_max, 5.0);
        assert_eq!(isect.p.z, 0.0);
        assert!(tri.intersect_p(&ray(
            point3(-0.5, -0.5, -5.0),
            vector3(0.0, 0.0, 1.0),
            Float::INFINITY
        )));
    }

    #[test]
    fn cut_keeps_only_selected_triangles() {
        let mesh = quad();
        let mut remap = HashMap::new();
        let cut = cut_mesh(7, &mesh, &[1], &mut remap, |f| f);

        assert_eq!(cut.n_triangles(), 1);
        assert_eq!(cut.n_vertices(), 3);
        assert_eq!(remap[&1], (7, 0));
        assert_eq!(cut.face_index(0), 1);

        // World-space triangle is unchanged.
        let orig = Triangle::new(Arc::new(mesh), 1).world_bound();
        let new = Triangle::new(Arc::new(cut), 0).world_bound();
        assert_eq!(orig, new);
    }
}
