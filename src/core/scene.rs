//! Scene context

#![allow(dead_code)]
use crate::core::error::{Error, Result};
use crate::core::light::AreaLightRecord;
use crate::core::material::{MaterialRecord, TextureRecord};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

/// The kinds of objects a dumped scene is made of. Each kind has its own id
/// space and file naming.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum ObjectType {
    Treelet = 0,
    TriangleMesh = 1,
    Material = 2,
    FloatTexture = 3,
    SpectrumTexture = 4,
    Texture = 5,
    ImagePartition = 6,
    AreaLight = 7,
}

const OBJECT_TYPE_COUNT: usize = 8;

/// Identifies one object of a dumped scene.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct ObjectKey {
    /// The object kind.
    pub kind: ObjectType,

    /// The object id.
    pub id: u32,
}

impl ObjectKey {
    /// Creates a new object key.
    ///
    /// * `kind` - The object kind.
    /// * `id`   - The object id.
    pub fn new(kind: ObjectType, id: u32) -> Self {
        Self { kind, id }
    }
}

/// Explicit scene state shared by the dumper and the residency manager:
/// object id allocation, file naming, the dependency table, the material /
/// area-light tables, and the registry of textures published in memory by
/// loaded treelets.
pub struct SceneContext {
    /// Directory holding the dumped scene.
    scene_path: PathBuf,

    /// Next free id per object type.
    next_ids: [u32; OBJECT_TYPE_COUNT],

    /// Next free instanced sub-BVH id.
    next_instance_id: usize,

    /// Material id assigned to each source mesh.
    mesh_materials: HashMap<u64, u32>,

    /// Area light id assigned to each emissive source mesh.
    mesh_area_lights: HashMap<u64, u32>,

    /// Material descriptions by id.
    materials: BTreeMap<u32, MaterialRecord>,

    /// Float texture descriptions by id.
    float_textures: BTreeMap<u32, TextureRecord>,

    /// Spectrum texture descriptions by id.
    spectrum_textures: BTreeMap<u32, TextureRecord>,

    /// Area light records by id.
    pub area_lights: BTreeMap<u32, AreaLightRecord>,

    /// Object dependency edges (material -> textures, texture -> atlas).
    dependencies: BTreeMap<ObjectKey, BTreeSet<ObjectKey>>,

    /// Texture atlas file name to texture id.
    texture_file_ids: BTreeMap<String, u32>,

    /// Cut texture groups: texture key (sorted atlas file names) to the
    /// partitions, each a list of new texture ids plus the face remap.
    compound_textures: BTreeMap<Vec<String>, Vec<(Vec<u32>, Arc<BTreeMap<u32, u32>>)>>,

    /// Cut materials: original material id to partition material ids and
    /// their face remaps.
    compound_materials: BTreeMap<u32, BTreeMap<u32, Arc<BTreeMap<u32, u32>>>>,

    /// Material id to the material treelet that carries it.
    material_treelets: BTreeMap<u32, u32>,

    /// Image partition id to the image treelet that carries it.
    partition_treelets: BTreeMap<u32, u32>,

    /// Cached per-material texture byte totals.
    texture_size_cache: RwLock<BTreeMap<u32, u64>>,

    /// Textures published in memory by loaded treelets, keyed by file name.
    in_memory_textures: RwLock<HashMap<String, Arc<Vec<u8>>>>,

    /// Image partitions published in memory by loaded treelets.
    in_memory_partitions: RwLock<HashMap<u32, Arc<Vec<u8>>>>,

    /// Whether texture reads may race texture loads.
    pub sync_texture_reads: bool,
}

impl SceneContext {
    /// Creates a context for dumping a scene into a directory.
    ///
    /// * `path` - The scene directory; created if missing.
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        fs::create_dir_all(path.as_ref())?;
        Ok(Self::empty(path.as_ref().to_path_buf()))
    }

    /// Opens a dumped scene directory for loading; reads the scene-level
    /// area light records if present.
    ///
    /// * `path` - The scene directory.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut ctx = Self::empty(path.as_ref().to_path_buf());

        let area_lights_path = ctx.scene_path.join("AREALIGHTS");
        if area_lights_path.exists() {
            let bytes = fs::read(&area_lights_path)?;
            let mut r = bytes.as_slice();
            let count = r.read_u32::<LittleEndian>()?;
            for _ in 0..count {
                let record = AreaLightRecord::from_reader(&mut r)?;
                ctx.area_lights.insert(record.id, record);
            }
        }

        Ok(ctx)
    }

    fn empty(scene_path: PathBuf) -> Self {
        Self {
            scene_path,
            next_ids: [0; OBJECT_TYPE_COUNT],
            next_instance_id: 0,
            mesh_materials: HashMap::new(),
            mesh_area_lights: HashMap::new(),
            materials: BTreeMap::new(),
            float_textures: BTreeMap::new(),
            spectrum_textures: BTreeMap::new(),
            area_lights: BTreeMap::new(),
            dependencies: BTreeMap::new(),
            texture_file_ids: BTreeMap::new(),
            compound_textures: BTreeMap::new(),
            compound_materials: BTreeMap::new(),
            material_treelets: BTreeMap::new(),
            partition_treelets: BTreeMap::new(),
            texture_size_cache: RwLock::new(BTreeMap::new()),
            in_memory_textures: RwLock::new(HashMap::new()),
            in_memory_partitions: RwLock::new(HashMap::new()),
            sync_texture_reads: false,
        }
    }

    /// Returns the scene directory.
    pub fn scene_path(&self) -> &Path {
        &self.scene_path
    }

    /// Allocates the next id for an object type.
    ///
    /// * `kind` - The object type.
    pub fn next_id(&mut self, kind: ObjectType) -> u32 {
        let id = self.next_ids[kind as usize];
        self.next_ids[kind as usize] += 1;
        id
    }

    /// Allocates the next instanced sub-BVH id.
    pub fn next_instance_id(&mut self) -> usize {
        let id = self.next_instance_id;
        self.next_instance_id += 1;
        id
    }

    /// Returns the number of ids allocated for an object type.
    ///
    /// * `kind` - The object type.
    pub fn id_count(&self, kind: ObjectType) -> u32 {
        self.next_ids[kind as usize]
    }

    /// Returns the file name of an object.
    ///
    /// * `kind` - The object type.
    /// * `id`   - The object id.
    pub fn file_name(kind: ObjectType, id: u32) -> String {
        match kind {
            ObjectType::Treelet => format!("T{id:04}"),
            ObjectType::TriangleMesh => format!("MESH{id}"),
            ObjectType::Material => format!("MAT{id}"),
            ObjectType::FloatTexture => format!("FTEX{id}"),
            ObjectType::SpectrumTexture => format!("STEX{id}"),
            ObjectType::Texture => format!("TEX{id}"),
            ObjectType::ImagePartition => format!("PART{id}"),
            ObjectType::AreaLight => format!("LIGHT{id}"),
        }
    }

    /// Returns the path of an object's file inside the scene directory.
    ///
    /// * `kind` - The object type.
    /// * `id`   - The object id.
    pub fn file_path(&self, kind: ObjectType, id: u32) -> PathBuf {
        self.scene_path.join(Self::file_name(kind, id))
    }

    /// Reads an object file.
    ///
    /// * `kind` - The object type.
    /// * `id`   - The object id.
    pub fn read_object(&self, kind: ObjectType, id: u32) -> Result<Vec<u8>> {
        Ok(fs::read(self.file_path(kind, id))?)
    }

    /// Returns an object file's size in bytes.
    ///
    /// * `kind` - The object type.
    /// * `id`   - The object id.
    pub fn object_size(&self, kind: ObjectType, id: u32) -> Result<u64> {
        Ok(fs::metadata(self.file_path(kind, id))?.len())
    }

    /// Counts the treelet files present in the scene directory.
    pub fn treelet_count(&self) -> Result<usize> {
        let mut count = 0;
        for entry in fs::read_dir(&self.scene_path)? {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.len() > 1 && name.starts_with('T') && name[1..].chars().all(|c| c.is_ascii_digit()) {
                count += 1;
            }
        }
        Ok(count)
    }

    /// Registers a material and writes its description file.
    ///
    /// * `record` - The material description.
    pub fn add_material(&mut self, record: MaterialRecord) -> Result<u32> {
        let id = self.next_id(ObjectType::Material);
        fs::write(self.file_path(ObjectType::Material, id), record.to_bytes())?;

        for tid in record.float_textures.values() {
            self.record_dependency(
                ObjectKey::new(ObjectType::Material, id),
                ObjectKey::new(ObjectType::FloatTexture, *tid),
            );
        }
        for tid in record.spectrum_textures.values() {
            self.record_dependency(
                ObjectKey::new(ObjectType::Material, id),
                ObjectKey::new(ObjectType::SpectrumTexture, *tid),
            );
        }

        self.materials.insert(id, record);
        Ok(id)
    }

    /// Registers a float texture and writes its description file.
    ///
    /// * `record` - The texture description.
    pub fn add_float_texture(&mut self, record: TextureRecord) -> Result<u32> {
        let id = self.next_id(ObjectType::FloatTexture);
        fs::write(self.file_path(ObjectType::FloatTexture, id), record.to_bytes())?;

        if let Some(filename) = record.filename() {
            let tid = self.texture_id_for_file(&filename)?;
            self.record_dependency(
                ObjectKey::new(ObjectType::FloatTexture, id),
                ObjectKey::new(ObjectType::Texture, tid),
            );
        }

        self.float_textures.insert(id, record);
        Ok(id)
    }

    /// Registers a spectrum texture and writes its description file.
    ///
    /// * `record` - The texture description.
    pub fn add_spectrum_texture(&mut self, record: TextureRecord) -> Result<u32> {
        let id = self.next_id(ObjectType::SpectrumTexture);
        fs::write(
            self.file_path(ObjectType::SpectrumTexture, id),
            record.to_bytes(),
        )?;

        if let Some(filename) = record.filename() {
            let tid = self.texture_id_for_file(&filename)?;
            self.record_dependency(
                ObjectKey::new(ObjectType::SpectrumTexture, id),
                ObjectKey::new(ObjectType::Texture, tid),
            );
        }

        self.spectrum_textures.insert(id, record);
        Ok(id)
    }

    /// Writes a texture atlas file and returns its id and file name.
    ///
    /// * `bytes` - The encoded atlas.
    pub fn add_texture(&mut self, bytes: &[u8]) -> Result<(u32, String)> {
        let id = self.next_id(ObjectType::Texture);
        let name = Self::file_name(ObjectType::Texture, id);
        fs::write(self.scene_path.join(&name), bytes)?;
        self.texture_file_ids.insert(name.clone(), id);
        Ok((id, name))
    }

    /// Returns the texture id of an atlas file name, registering the file
    /// if it was placed in the scene directory externally.
    ///
    /// * `filename` - The atlas file name.
    pub fn texture_id_for_file(&mut self, filename: &str) -> Result<u32> {
        if let Some(id) = self.texture_file_ids.get(filename) {
            return Ok(*id);
        }
        if !self.scene_path.join(filename).exists() {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("texture file {filename} not found"),
            )));
        }
        let id = self.next_id(ObjectType::Texture);
        self.texture_file_ids.insert(String::from(filename), id);
        Ok(id)
    }

    /// Registers an area light record.
    ///
    /// * `record` - The area light record.
    pub fn add_area_light(&mut self, record: AreaLightRecord) {
        self.area_lights.insert(record.id, record);
    }

    /// Writes an image partition file.
    ///
    /// * `bytes` - The partition payload.
    pub fn add_image_partition(&mut self, bytes: &[u8]) -> Result<u32> {
        let id = self.next_id(ObjectType::ImagePartition);
        fs::write(self.file_path(ObjectType::ImagePartition, id), bytes)?;
        Ok(id)
    }

    /// Writes scene-level records (currently the area light table) so the
    /// loading side can read them back.
    pub fn save(&self) -> Result<()> {
        let mut out = vec![];
        out.write_u32::<LittleEndian>(self.area_lights.len() as u32).unwrap();
        for record in self.area_lights.values() {
            out.extend_from_slice(&record.to_bytes());
        }
        fs::write(self.scene_path.join("AREALIGHTS"), out)?;
        Ok(())
    }

    /// Records a dependency edge between two objects.
    ///
    /// * `from` - The depending object.
    /// * `to`   - The object depended on.
    pub fn record_dependency(&mut self, from: ObjectKey, to: ObjectKey) {
        self.dependencies.entry(from).or_default().insert(to);
    }

    /// Returns the dependency table.
    pub fn dependencies(&self) -> &BTreeMap<ObjectKey, BTreeSet<ObjectKey>> {
        &self.dependencies
    }

    /// Binds a source mesh to its material.
    ///
    /// * `mesh_id` - The mesh id.
    /// * `mtl_id`  - The material id.
    pub fn record_mesh_material(&mut self, mesh_id: u64, mtl_id: u32) {
        self.mesh_materials.insert(mesh_id, mtl_id);
    }

    /// Returns the material id bound to a mesh; 0 when unbound.
    ///
    /// * `mesh_id` - The mesh id.
    pub fn mesh_material(&self, mesh_id: u64) -> u32 {
        self.mesh_materials.get(&mesh_id).copied().unwrap_or(0)
    }

    /// Binds a source mesh to its area light.
    ///
    /// * `mesh_id`  - The mesh id.
    /// * `light_id` - The area light id.
    pub fn record_mesh_area_light(&mut self, mesh_id: u64, light_id: u32) {
        self.mesh_area_lights.insert(mesh_id, light_id);
    }

    /// Returns the area light id bound to a mesh; 0 when not emissive.
    ///
    /// * `mesh_id` - The mesh id.
    pub fn mesh_area_light(&self, mesh_id: u64) -> u32 {
        self.mesh_area_lights.get(&mesh_id).copied().unwrap_or(0)
    }

    /// Returns the ids of all registered materials.
    pub fn all_material_ids(&self) -> Vec<u32> {
        self.materials.keys().copied().collect()
    }

    /// Returns a registered material description.
    ///
    /// * `id` - The material id.
    pub fn material(&self, id: u32) -> Option<&MaterialRecord> {
        self.materials.get(&id)
    }

    /// Returns a registered float texture description.
    ///
    /// * `id` - The texture id.
    pub fn float_texture(&self, id: u32) -> Option<&TextureRecord> {
        self.float_textures.get(&id)
    }

    /// Returns a registered spectrum texture description.
    ///
    /// * `id` - The texture id.
    pub fn spectrum_texture(&self, id: u32) -> Option<&TextureRecord> {
        self.spectrum_textures.get(&id)
    }

    /// Total bytes of atlas files referenced by a material's textures.
    ///
    /// * `mtl_id` - The material id.
    pub fn texture_bytes_of_material(&self, mtl_id: u32) -> Result<u64> {
        if mtl_id == 0 {
            return Ok(0);
        }

        if let Some(cached) = self.texture_size_cache.read().unwrap().get(&mtl_id) {
            return Ok(*cached);
        }

        let mut total = 0;
        if let Some(deps) = self.dependencies.get(&ObjectKey::new(ObjectType::Material, mtl_id)) {
            for dep in deps {
                if dep.kind != ObjectType::FloatTexture && dep.kind != ObjectType::SpectrumTexture {
                    continue;
                }
                if let Some(tdeps) = self.dependencies.get(dep) {
                    for tdep in tdeps {
                        if tdep.kind == ObjectType::Texture {
                            total += self.object_size(tdep.kind, tdep.id)?;
                        }
                    }
                }
            }
        }

        self.texture_size_cache.write().unwrap().insert(mtl_id, total);
        Ok(total)
    }

    /// Records the partitions of a cut texture group.
    ///
    /// * `key`        - The texture key (sorted atlas file names).
    /// * `part_key`   - New texture ids, one per original atlas.
    /// * `old_to_new` - Old face to new face remap.
    pub fn add_to_compound_texture(
        &mut self,
        key: &[String],
        part_key: Vec<u32>,
        old_to_new: Arc<BTreeMap<u32, u32>>,
    ) {
        self.compound_textures
            .entry(key.to_vec())
            .or_default()
            .push((part_key, old_to_new));
    }

    /// Returns true if a texture group has already been cut.
    ///
    /// * `key` - The texture key.
    pub fn is_compound_texture(&self, key: &[String]) -> bool {
        self.compound_textures.contains_key(key)
    }

    /// Returns the partitions of a cut texture group.
    ///
    /// * `key` - The texture key.
    pub fn compound_texture(&self, key: &[String]) -> Option<&Vec<(Vec<u32>, Arc<BTreeMap<u32, u32>>)>> {
        self.compound_textures.get(key)
    }

    /// Records a partition material of a cut material.
    ///
    /// * `original`   - The original material id.
    /// * `partition`  - The partition material id.
    /// * `old_to_new` - Old face to new face remap for the partition.
    pub fn add_to_compound_material(
        &mut self,
        original: u32,
        partition: u32,
        old_to_new: Arc<BTreeMap<u32, u32>>,
    ) {
        self.compound_materials
            .entry(original)
            .or_default()
            .insert(partition, old_to_new);
    }

    /// Returns true if a material has been cut into partitions.
    ///
    /// * `mtl_id` - The material id.
    pub fn is_compound_material(&self, mtl_id: u32) -> bool {
        self.compound_materials.contains_key(&mtl_id)
    }

    /// Returns the partitions of a cut material.
    ///
    /// * `mtl_id` - The material id.
    pub fn compound_material(&self, mtl_id: u32) -> Option<&BTreeMap<u32, Arc<BTreeMap<u32, u32>>>> {
        self.compound_materials.get(&mtl_id)
    }

    /// Records the material treelet carrying a material.
    ///
    /// * `mtl_id`  - The material id.
    /// * `treelet` - The treelet id.
    pub fn record_material_treelet(&mut self, mtl_id: u32, treelet: u32) {
        self.material_treelets.insert(mtl_id, treelet);
    }

    /// Returns the material treelet carrying a material; 0 for material 0.
    ///
    /// * `mtl_id` - The material id.
    pub fn material_treelet(&self, mtl_id: u32) -> u32 {
        if mtl_id == 0 {
            0
        } else {
            self.material_treelets.get(&mtl_id).copied().unwrap_or(0)
        }
    }

    /// Records the image treelet carrying an image partition.
    ///
    /// * `pid`     - The partition id.
    /// * `treelet` - The treelet id.
    pub fn record_partition_treelet(&mut self, pid: u32, treelet: u32) {
        self.partition_treelets.insert(pid, treelet);
    }

    /// Marks that texture loads may race texture reads; reads then take the
    /// registry lock.
    ///
    /// * `val` - Whether to synchronize texture reads.
    pub fn set_sync_texture_reads(&mut self, val: bool) {
        self.sync_texture_reads = val;
    }

    /// Publishes a texture loaded from a treelet, keyed by file name.
    ///
    /// * `name`  - The atlas file name.
    /// * `bytes` - The atlas payload.
    pub fn add_in_memory_texture(&self, name: String, bytes: Arc<Vec<u8>>) {
        self.in_memory_textures.write().unwrap().insert(name, bytes);
    }

    /// Returns a texture previously published by a loaded treelet.
    ///
    /// * `name` - The atlas file name.
    pub fn in_memory_texture(&self, name: &str) -> Option<Arc<Vec<u8>>> {
        self.in_memory_textures.read().unwrap().get(name).cloned()
    }

    /// Publishes an image partition loaded from a treelet.
    ///
    /// * `pid`   - The partition id.
    /// * `bytes` - The partition payload.
    pub fn add_in_memory_image_partition(&self, pid: u32, bytes: Arc<Vec<u8>>) {
        self.in_memory_partitions.write().unwrap().insert(pid, bytes);
    }

    /// Returns an image partition previously published by a loaded treelet.
    ///
    /// * `pid` - The partition id.
    pub fn in_memory_image_partition(&self, pid: u32) -> Option<Arc<Vec<u8>>> {
        self.in_memory_partitions.read().unwrap().get(&pid).cloned()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_allocation_is_per_type() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = SceneContext::create(dir.path()).unwrap();
        assert_eq!(ctx.next_id(ObjectType::Treelet), 0);
        assert_eq!(ctx.next_id(ObjectType::Treelet), 1);
        assert_eq!(ctx.next_id(ObjectType::Material), 0);
        assert_eq!(ctx.id_count(ObjectType::Treelet), 2);
    }

    #[test]
    fn treelet_file_names_are_zero_padded() {
        assert_eq!(SceneContext::file_name(ObjectType::Treelet, 3), "T0003");
        assert_eq!(SceneContext::file_name(ObjectType::Treelet, 123), "T0123");
    }

    #[test]
    fn area_lights_roundtrip_through_save() {
        use crate::core::geometry::Transform;
        use crate::core::paramset::ParamSet;

        let dir = tempfile::tempdir().unwrap();
        let mut ctx = SceneContext::create(dir.path()).unwrap();
        let mut params = ParamSet::new();
        params.add_float("L", vec![1.0, 1.0, 1.0]);
        ctx.add_area_light(AreaLightRecord {
            id: 1,
            params,
            light_to_world: Transform::default(),
        });
        ctx.save().unwrap();

        let reopened = SceneContext::open(dir.path()).unwrap();
        assert_eq!(reopened.area_lights.len(), 1);
        assert!(reopened.area_lights.contains_key(&1));
    }
}
