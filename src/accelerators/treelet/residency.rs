//! Treelet residency: lazy loading, preloading, and finalization.

#![allow(dead_code)]
use super::format::RecordReader;
use super::node::TreeletNode;
use crate::core::error::{Error, Result};
use crate::core::geometry::{AnimatedTransform, Matrix4x4, Transform};
use crate::core::light::{ArcAreaLight, DiffuseAreaLight};
use crate::core::material::{
    ArcMaterial, LoadedMaterial, Material, MaterialKey, MaterialRecord, TextureRecord,
};
use crate::core::scene::{ObjectType, SceneContext};
use crate::shapes::triangle::{Triangle, TriangleMesh};
use byteorder::{LittleEndian, ReadBytesExt};
use rayon::prelude::*;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::sync::{Arc, RwLock};

/// Reference to an instanced sub-BVH held by a transformed primitive.
#[derive(Copy, Clone, Debug)]
pub enum Instance {
    /// Copyable instance inlined into the same treelet; traversal starts at
    /// the stored node index.
    Included {
        /// Node index of the instance root within the treelet.
        node: u32,
    },

    /// Non-copyable instance living in its own treelets; traversal starts
    /// at node 0 of the root treelet.
    External {
        /// Root treelet id of the instanced sub-BVH.
        root: u32,
    },
}

/// A primitive wrapping an instanced sub-BVH with a transformation.
#[derive(Clone, Debug)]
pub struct TransformedPrimitive {
    /// The instance.
    pub instance: Instance,

    /// Instance to world transformation.
    pub to_world: AnimatedTransform,
}

/// A triangle bound to its material and, when emissive, its area light.
#[derive(Clone)]
pub struct GeometricPrimitive {
    /// The triangle.
    pub shape: Triangle,

    /// Key of the triangle's material.
    pub material_key: MaterialKey,

    /// The material; `None` until finalization, and stays `None` for
    /// material id 0.
    pub material: Option<ArcMaterial>,

    /// The bound area light for emissive triangles.
    pub area_light: Option<ArcAreaLight>,
}

/// A slot of a treelet's primitive array.
pub enum TreeletPrimitive {
    /// A resolved triangle.
    Geometric(GeometricPrimitive),

    /// A resolved instance reference.
    Transformed(TransformedPrimitive),

    /// Placeholder awaiting finalization.
    Pending,
}

struct UnfinishedTransformed {
    primitive_index: usize,
    instance_ref: u64,
    to_world: AnimatedTransform,
}

struct UnfinishedGeometric {
    primitive_index: usize,
    material_key: MaterialKey,
    area_light_id: u32,
    triangle_idx: usize,
}

/// One loaded treelet: its private node array, primitive array, meshes and
/// the materials it carries. Read-only once finalized.
#[derive(Default)]
pub struct Treelet {
    /// The nodes; node 0 is the local root.
    pub nodes: Vec<TreeletNode>,

    /// The primitives referenced by leaf ranges.
    pub primitives: Vec<TreeletPrimitive>,

    /// Meshes owned by the treelet, views over one backing buffer.
    pub meshes: BTreeMap<u64, Arc<TriangleMesh>>,

    /// Materials carried by this treelet (material treelets only).
    pub included_material: BTreeMap<u32, ArcMaterial>,

    /// Materials this treelet's triangles need.
    required_materials: BTreeSet<MaterialKey>,

    /// External instances this treelet references.
    required_instances: BTreeSet<u64>,

    unfinished_transformed: Vec<UnfinishedTransformed>,
    unfinished_geometric: Vec<UnfinishedGeometric>,
}

impl Default for TreeletPrimitive {
    fn default() -> Self {
        Self::Pending
    }
}

/// Residency options.
#[derive(Clone, Debug)]
pub struct LoadOptions {
    /// Root treelet id; 0 for the scene accelerator.
    pub bvh_root: u32,

    /// Load every treelet at construction. Required for multi-threaded
    /// traversal.
    pub preload: bool,

    /// Number of traversal threads the caller will run.
    pub threads: usize,

    /// Select the starting root treelet by ray-direction octant.
    pub directional_treelets: bool,
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self {
            bvh_root: 0,
            preload: false,
            threads: 1,
            directional_treelets: false,
        }
    }
}

/// A scene loaded as a sparse collection of treelets, loaded on demand or
/// preloaded up front and shared between traversal threads.
pub struct TreeletBvh {
    /// Root treelet id.
    pub bvh_root: u32,

    /// Whether every treelet was loaded and finalized at construction.
    preloading_done: bool,

    /// Whether traversal picks the root treelet by direction octant.
    pub directional_treelets: bool,

    /// The scene context (area lights, file naming, texture registry).
    ctx: Arc<SceneContext>,

    /// The treelet table.
    treelets: RwLock<Vec<Option<Arc<Treelet>>>>,

    /// Materials by id: real materials in preload mode, placeholders in
    /// lazy mode.
    materials: RwLock<BTreeMap<u32, ArcMaterial>>,
}

impl TreeletBvh {
    /// Opens a dumped scene.
    ///
    /// Lazy loading is only legal for single-threaded traversal; asking for
    /// it with more than one thread is a configuration error.
    ///
    /// * `ctx`     - The scene context.
    /// * `options` - Residency options.
    pub fn new(ctx: Arc<SceneContext>, options: LoadOptions) -> Result<Self> {
        if options.threads > 1 && !options.preload {
            return Err(Error::Config(String::from(
                "cannot use a lazy-loading treelet BVH with multiple threads",
            )));
        }

        let this = Self {
            bvh_root: options.bvh_root,
            preloading_done: false,
            directional_treelets: options.directional_treelets,
            ctx,
            treelets: RwLock::new(vec![]),
            materials: RwLock::new(BTreeMap::new()),
        };

        if options.preload {
            this.preload_all()
        } else {
            Ok(this)
        }
    }

    /// Loads and finalizes every treelet: base-load in parallel, resolve
    /// the shared material table, then finalize in parallel.
    fn preload_all(mut self) -> Result<Self> {
        let treelet_count = self.ctx.treelet_count()?;

        let ctx = Arc::clone(&self.ctx);
        let mut bases: Vec<Treelet> = (0..treelet_count as u32)
            .into_par_iter()
            .map(|id| load_treelet_base(&ctx, id))
            .collect::<Result<Vec<_>>>()?;

        // Resolve every required material from the treelet that carries it.
        let mut required: BTreeSet<MaterialKey> = BTreeSet::new();
        for base in &bases {
            required.extend(base.required_materials.iter().copied());
        }

        {
            let mut materials = self.materials.write().unwrap();
            for key in required {
                if key.id == 0 {
                    continue;
                }

                let carrier = bases.get(key.treelet as usize).ok_or_else(|| {
                    Error::format(key.treelet, "material treelet out of range")
                })?;
                let material = carrier.included_material.get(&key.id).ok_or_else(|| {
                    Error::format(key.treelet, format!("material {} not carried", key.id))
                })?;
                materials.insert(key.id, Arc::clone(material));
            }
        }

        let materials = self.materials.read().unwrap().clone();
        let ctx = Arc::clone(&self.ctx);
        bases
            .par_iter_mut()
            .map(|base| finalize_treelet(base, &ctx, |key| materials.get(&key.id).cloned()))
            .collect::<Result<Vec<_>>>()?;

        *self.treelets.write().unwrap() = bases.into_iter().map(|b| Some(Arc::new(b))).collect();
        self.preloading_done = true;
        Ok(self)
    }

    /// Returns the scene context.
    pub fn context(&self) -> &Arc<SceneContext> {
        &self.ctx
    }

    /// Returns a treelet, loading and finalizing it on first access.
    /// Idempotent; after preloading no I/O ever happens here.
    ///
    /// * `root_id` - The treelet id.
    pub fn load_treelet(&self, root_id: u32) -> Result<Arc<Treelet>> {
        {
            let treelets = self.treelets.read().unwrap();
            if let Some(Some(treelet)) = treelets.get(root_id as usize) {
                return Ok(Arc::clone(treelet));
            }
        }

        if self.preloading_done {
            return Err(Error::format(root_id, "treelet missing after preload"));
        }

        let mut base = load_treelet_base(&self.ctx, root_id)?;

        // Lazy mode: material slots become placeholders carrying the key,
        // so hits can report the key before the material treelet is
        // fetched.
        {
            let mut materials = self.materials.write().unwrap();
            for key in &base.required_materials {
                materials.insert(key.id, Arc::new(Material::Placeholder(*key)));
            }
        }

        {
            let materials = self.materials.read().unwrap();
            finalize_treelet(&mut base, &self.ctx, |key| materials.get(&key.id).cloned())?;
        }

        let treelet = Arc::new(base);
        let mut treelets = self.treelets.write().unwrap();
        if treelets.len() <= root_id as usize {
            treelets.resize(root_id as usize + 1, None);
        }
        treelets[root_id as usize] = Some(Arc::clone(&treelet));

        Ok(treelet)
    }

    /// Returns a material carried by the root treelet.
    ///
    /// * `material_id` - The material id; 0 has no material.
    pub fn get_material(&self, material_id: u32) -> Result<Option<ArcMaterial>> {
        if material_id == 0 {
            return Ok(None);
        }

        let root = self.load_treelet(self.bvh_root)?;
        Ok(root.included_material.get(&material_id).cloned())
    }

    /// Returns the scene bounds. Only valid on the scene root.
    pub fn world_bound(&self) -> Result<crate::core::geometry::Bounds3f> {
        debug_assert_eq!(self.bvh_root, 0);

        let root = self.load_treelet(self.bvh_root)?;
        Ok(root.nodes[0].bounds)
    }

    /// Sums the surface area of the maximal bounds of the root treelet's
    /// nodes under a transformation; overlap between roots is ignored.
    ///
    /// * `txfm` - The transformation.
    pub fn root_surface_areas(&self, txfm: &Transform) -> Result<crate::core::geometry::Float> {
        let treelet = self.load_treelet(self.bvh_root)?;

        let mut area = 0.0;
        let mut roots: Vec<crate::core::geometry::Bounds3f> = vec![];

        for node in &treelet.nodes {
            let cur = txfm.transform_bounds(&node.bounds);

            let mut new_root = true;
            for root in &roots {
                if root.union(&cur) == *root {
                    new_root = false;
                    break;
                }
            }

            if new_root {
                roots.push(cur);
                area += cur.surface_area();
            }
        }

        Ok(area)
    }

    /// Surface area of the union bound of the root treelet's nodes.
    pub fn surface_area_union(&self) -> Result<crate::core::geometry::Float> {
        let treelet = self.load_treelet(self.bvh_root)?;

        let mut bound = crate::core::geometry::Bounds3f::empty();
        for node in &treelet.nodes {
            bound = bound.union(&node.bounds);
        }

        Ok(bound.surface_area())
    }
}

/// Parses a treelet file into its in-memory form; materials stay
/// unresolved and external instances stay pending.
///
/// * `ctx`     - The scene context.
/// * `root_id` - The treelet id.
fn load_treelet_base(ctx: &SceneContext, root_id: u32) -> Result<Treelet> {
    let buffer = fs::read(ctx.file_path(ObjectType::Treelet, root_id))?;
    let mut reader = RecordReader::new(&buffer, root_id);

    let mut treelet = Treelet::default();

    // Image partitions are published to the context.
    let image_partition_count = reader.read_u32()?;
    for _ in 0..image_partition_count {
        let pid = reader.read_u32()?;
        let blob = reader.read_bytes()?;
        ctx.add_in_memory_image_partition(pid, Arc::new(blob.to_vec()));
    }

    // Ptex atlases are published keyed by file name.
    let texture_count = reader.read_u32()?;
    for _ in 0..texture_count {
        let id = reader.read_u32()?;
        let blob = reader.read_bytes()?;
        ctx.add_in_memory_texture(
            SceneContext::file_name(ObjectType::Texture, id),
            Arc::new(blob.to_vec()),
        );
    }

    let mut stexes: BTreeMap<u32, TextureRecord> = BTreeMap::new();
    let spectrum_texture_count = reader.read_u32()?;
    for _ in 0..spectrum_texture_count {
        let id = reader.read_u32()?;
        let blob = reader.read_bytes()?;
        stexes.insert(id, TextureRecord::from_bytes(blob)?);
    }

    let mut ftexes: BTreeMap<u32, TextureRecord> = BTreeMap::new();
    let float_texture_count = reader.read_u32()?;
    for _ in 0..float_texture_count {
        let id = reader.read_u32()?;
        let blob = reader.read_bytes()?;
        ftexes.insert(id, TextureRecord::from_bytes(blob)?);
    }

    let material_count = reader.read_u32()?;
    for _ in 0..material_count {
        let id = reader.read_u32()?;
        let blob = reader.read_bytes()?;
        let record = MaterialRecord::from_bytes(blob)?;

        let float_textures = record
            .float_textures
            .values()
            .filter_map(|tid| ftexes.get(tid).map(|t| (*tid, t.clone())))
            .collect();
        let spectrum_textures = record
            .spectrum_textures
            .values()
            .filter_map(|tid| stexes.get(tid).map(|t| (*tid, t.clone())))
            .collect();

        treelet.included_material.insert(
            id,
            Arc::new(Material::Loaded(LoadedMaterial {
                id,
                record,
                float_textures,
                spectrum_textures,
            })),
        );
    }

    // Meshes: capture one backing buffer spanning all mesh blobs and view
    // each mesh at its offset.
    let mesh_count = reader.read_u32()?;
    let mut mesh_headers = Vec::with_capacity(mesh_count as usize);
    let mut mesh_storage: Vec<u8> = vec![];
    let mut mesh_material_ids: BTreeMap<u64, MaterialKey> = BTreeMap::new();
    let mut mesh_area_light_ids: BTreeMap<u64, u32> = BTreeMap::new();

    for _ in 0..mesh_count {
        let mesh_id = reader.read_u64()?;
        let material_key = MaterialKey::from_bytes(reader.read_bytes()?)?;
        let area_light_id = reader.read_u32()?;
        let blob = reader.read_bytes()?;

        let offset = mesh_storage.len();
        mesh_storage.extend_from_slice(blob);
        mesh_headers.push((mesh_id, offset));

        mesh_material_ids.insert(mesh_id, material_key);
        if area_light_id != 0 {
            mesh_area_light_ids.insert(mesh_id, area_light_id);
        }
    }

    let mesh_storage = Arc::new(mesh_storage);
    for (mesh_id, offset) in mesh_headers {
        let mesh = TriangleMesh::from_storage(Arc::clone(&mesh_storage), offset)
            .map_err(|_| Error::format(root_id, format!("malformed mesh {mesh_id}")))?;
        if treelet.meshes.insert(mesh_id, Arc::new(mesh)).is_some() {
            return Err(Error::format(root_id, format!("duplicate mesh {mesh_id}")));
        }
    }

    let node_count = reader.read_u32()?;
    let primitive_count = reader.read_u32()?;

    if node_count == 0 {
        if primitive_count != 0 {
            return Err(Error::format(
                root_id,
                format!("{primitive_count} primitives but no nodes"),
            ));
        }
        return Ok(treelet);
    }

    let node_blob = reader.read_bytes()?;
    treelet.nodes = TreeletNode::from_blob(node_blob, node_count as usize, root_id)?;
    treelet.primitives.reserve(primitive_count as usize);

    for _ in 0..node_count {
        let transformed_count = reader.read_u32()?;
        let triangle_count = reader.read_u32()?;

        for _ in 0..transformed_count {
            let record = reader.read_bytes()?;
            let (instance_ref, to_world) = parse_transformed_primitive(record, root_id)?;

            let instance_group = (instance_ref >> 32) as u32;
            let instance_node = instance_ref as u32;

            if instance_group == root_id {
                treelet
                    .primitives
                    .push(TreeletPrimitive::Transformed(TransformedPrimitive {
                        instance: Instance::Included {
                            node: instance_node,
                        },
                        to_world,
                    }));
            } else {
                treelet.required_instances.insert(instance_ref);
                treelet.unfinished_transformed.push(UnfinishedTransformed {
                    primitive_index: treelet.primitives.len(),
                    instance_ref,
                    to_world,
                });
                treelet.primitives.push(TreeletPrimitive::Pending);
            }
        }

        for i in 0..triangle_count {
            let record = reader.read_bytes()?;
            if record.len() != super::dump::TRIANGLE_SIZE {
                return Err(Error::format(root_id, "malformed triangle record"));
            }
            let mut r = record;
            let mesh_id = r.read_u64::<LittleEndian>()?;
            let tri_number = r.read_u32::<LittleEndian>()? as usize;

            let mesh = treelet.meshes.get(&mesh_id).ok_or_else(|| {
                Error::format(root_id, format!("triangle references unknown mesh {mesh_id}"))
            })?;
            let material_key = mesh_material_ids
                .get(&mesh_id)
                .copied()
                .unwrap_or_default();
            let area_light_id = mesh_area_light_ids.get(&mesh_id).copied().unwrap_or(0);

            treelet.required_materials.insert(material_key);
            treelet.unfinished_geometric.push(UnfinishedGeometric {
                primitive_index: treelet.primitives.len(),
                material_key,
                area_light_id,
                triangle_idx: i as usize,
            });

            treelet
                .primitives
                .push(TreeletPrimitive::Geometric(GeometricPrimitive {
                    shape: Triangle::new(Arc::clone(mesh), tri_number),
                    material_key,
                    material: None,
                    area_light: None,
                }));
        }
    }

    if treelet.primitives.len() != primitive_count as usize {
        return Err(Error::format(
            root_id,
            format!(
                "primitive lists hold {} entries, header says {}",
                treelet.primitives.len(),
                primitive_count
            ),
        ));
    }

    // Leaf ranges must stay within the primitive array.
    for node in &treelet.nodes {
        if let Some((offset, count)) = node.leaf_range() {
            if offset as usize + count as usize > treelet.primitives.len() {
                return Err(Error::format(root_id, "leaf range out of bounds"));
            }
        }
    }

    Ok(treelet)
}

/// Fills a treelet's pending slots: external instances become transformed
/// primitives, emissive triangles get their diffuse area light, and
/// material slots are resolved through `materials`.
///
/// * `treelet`   - The treelet to finalize.
/// * `ctx`       - The scene context (area-light table).
/// * `materials` - Material lookup by key.
fn finalize_treelet<F>(treelet: &mut Treelet, ctx: &SceneContext, materials: F) -> Result<()>
where
    F: Fn(MaterialKey) -> Option<ArcMaterial>,
{
    for u in treelet.unfinished_transformed.drain(..) {
        treelet.primitives[u.primitive_index] =
            TreeletPrimitive::Transformed(TransformedPrimitive {
                instance: Instance::External {
                    root: (u.instance_ref >> 32) as u32,
                },
                to_world: u.to_world,
            });
    }

    for u in treelet.unfinished_geometric.drain(..) {
        let area_light = if u.area_light_id != 0 {
            let record = ctx.area_lights.get(&u.area_light_id).ok_or_else(|| {
                Error::Integrity(format!("unknown area light {}", u.area_light_id))
            })?;
            Some(Arc::new(DiffuseAreaLight::new(
                record,
                u.area_light_id + u.triangle_idx as u32,
            )))
        } else {
            None
        };

        let material = if u.material_key.id != 0 {
            materials(u.material_key)
        } else {
            None
        };

        match &mut treelet.primitives[u.primitive_index] {
            TreeletPrimitive::Geometric(gp) => {
                gp.material = material;
                gp.area_light = area_light;
            }
            _ => {
                return Err(Error::Integrity(String::from(
                    "unfinished geometric primitive is not geometric",
                )))
            }
        }
    }

    treelet.required_materials.clear();
    treelet.required_instances.clear();
    Ok(())
}

/// Parses a packed transformed-primitive record.
fn parse_transformed_primitive(record: &[u8], id: u32) -> Result<(u64, AnimatedTransform)> {
    if record.len() != super::dump::TRANSFORMED_PRIMITIVE_SIZE {
        return Err(Error::format(id, "malformed transformed primitive record"));
    }

    let mut r = record;
    let instance_ref = r.read_u64::<LittleEndian>()?;

    let mut read_matrix = |r: &mut &[u8]| -> Result<Matrix4x4> {
        let mut m = crate::core::geometry::IDENTITY_MATRIX;
        for row in m.m.iter_mut() {
            for v in row.iter_mut() {
                *v = r.read_f32::<LittleEndian>()?;
            }
        }
        Ok(m)
    };

    let start = read_matrix(&mut r)?;
    let end = read_matrix(&mut r)?;
    let start_time = r.read_f32::<LittleEndian>()?;
    let end_time = r.read_f32::<LittleEndian>()?;

    let start_transform = Transform::new(start);
    let end_transform = if start == end {
        start_transform
    } else {
        Transform::new(end)
    };

    Ok((
        instance_ref,
        AnimatedTransform::new(start_transform, start_time, end_transform, end_time),
    ))
}
