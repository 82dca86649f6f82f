//! Treelet dumper: materializes a partitioned BVH to disk.

#![allow(dead_code)]
use super::format::RecordWriter;
use super::node::{TreeletNode, LEFT, RIGHT};
use super::partition::DumpBvh;
use super::ptex::{partition_faces, FaceAtlas};
use crate::accelerators::ScenePrimitive;
use crate::core::error::{Error, Result};
use crate::core::material::{MaterialKey, TextureRecord};
use crate::core::scene::{ObjectKey, ObjectType, SceneContext};
use byteorder::{LittleEndian, WriteBytesExt};
use itertools::Itertools;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs;
use std::io::Write;
use std::sync::Arc;

/// Serialized size of a packed transformed-primitive record.
pub const TRANSFORMED_PRIMITIVE_SIZE: usize = 8 + 16 * 4 + 16 * 4 + 4 + 4;

/// Serialized size of a packed triangle record.
pub const TRIANGLE_SIZE: usize = 8 + 4;

/// Result of dumping one partitioned BVH.
pub struct DumpedTreelets {
    /// Global treelet id of every entry in `all_treelets`, in order.
    pub treelet_ids: Vec<u32>,

    /// Global ids of the root treelets, one per traversal direction.
    pub root_ids: Vec<u32>,
}

impl DumpBvh {
    /// Dumps the scene: header, material treelets, image-partition
    /// treelets, geometry treelets, and the static allocation hint.
    /// Returns the root treelet ids.
    ///
    /// * `ctx` - The scene context.
    pub fn dump(&self, ctx: &mut SceneContext) -> Result<Vec<u32>> {
        if self.config.write_header {
            self.dump_header(ctx)?;
        }

        let dumped = self.dump_treelets(ctx, true)?;
        Ok(dumped.root_ids)
    }

    /// Writes the `HEADER` record: scene root bounds plus total treelet
    /// bytes.
    ///
    /// * `ctx` - The scene context.
    fn dump_header(&self, ctx: &SceneContext) -> Result<()> {
        let root = self.world_bound();
        let mut out = vec![];
        for v in [
            root.p_min.x,
            root.p_min.y,
            root.p_min.z,
            root.p_max.x,
            root.p_max.y,
            root.p_max.z,
        ] {
            out.write_f32::<LittleEndian>(v).unwrap();
        }

        let total: u64 = self
            .all_treelets
            .iter()
            .map(|t| t.no_instance_size + t.instance_size)
            .sum();
        out.write_u64::<LittleEndian>(total).unwrap();

        fs::write(ctx.scene_path().join("HEADER"), out)?;
        Ok(())
    }

    /// Groups materials into material treelets, cutting oversized ptex
    /// textures into face partitions first.
    ///
    /// * `ctx` - The scene context.
    fn dump_materials(&self, ctx: &mut SceneContext) -> Result<()> {
        info!("dumping materials");

        let max_material_treelet_bytes = 3 * self.config.max_treelet_bytes / 4;

        let mut textured_materials: Vec<(u32, u64)> = vec![];
        let mut no_texture_materials: Vec<u32> = vec![];

        for mtl_id in ctx.all_material_ids() {
            let texture_size = ctx.texture_bytes_of_material(mtl_id)?;

            if texture_size > max_material_treelet_bytes {
                // The material's textures cannot fit one treelet; cut them.
                let new_ids = generate_texture_partitions(mtl_id, max_material_treelet_bytes, ctx)?;
                for id in new_ids {
                    let size = ctx.texture_bytes_of_material(id)?;
                    textured_materials.push((id, size));
                }
            } else if texture_size > 0 {
                textured_materials.push((mtl_id, texture_size));
            } else {
                no_texture_materials.push(mtl_id);
            }
        }

        info!(
            "dumping {} textured material(s) and {} untextured material(s)",
            textured_materials.len(),
            no_texture_materials.len()
        );

        // Group textured materials by texture key.
        let mut key_to_materials: BTreeMap<Vec<String>, (Vec<u32>, u64)> = BTreeMap::new();
        for (mtl_id, _) in &textured_materials {
            let key = texture_key(*mtl_id, ctx)?;

            if !key_to_materials.contains_key(&key) {
                let mut size = 0;
                for filename in &key {
                    size += fs::metadata(ctx.scene_path().join(filename))?.len();
                }
                key_to_materials.insert(key.clone(), (vec![], size));
            }
            key_to_materials.get_mut(&key).unwrap().0.push(*mtl_id);
        }

        // Merge texture keys that are strict subsets of another key.
        let keys: Vec<Vec<String>> = key_to_materials.keys().cloned().collect();
        for key in keys {
            let superset = key_to_materials
                .keys()
                .find(|other| is_subset(&key, other))
                .cloned();
            if let Some(superset) = superset {
                let (materials, _) = key_to_materials.remove(&key).unwrap();
                key_to_materials
                    .get_mut(&superset)
                    .unwrap()
                    .0
                    .extend(materials);
            }
        }

        info!("{} texture key(s) after merge", key_to_materials.len());

        // First-fit-decreasing pack texture keys into material treelets.
        struct MaterialTreelet {
            id: u32,
            materials: Vec<u32>,
            texture_keys: Vec<Vec<String>>,
            size: u64,
        }

        let mut treelets: Vec<MaterialTreelet> = vec![MaterialTreelet {
            id: ctx.next_id(ObjectType::Treelet),
            materials: vec![],
            texture_keys: vec![],
            size: 0,
        }];

        let sorted_keys: Vec<(Vec<String>, u64)> = key_to_materials
            .iter()
            .map(|(k, (_, size))| (k.clone(), *size))
            .sorted_by(|a, b| b.1.cmp(&a.1))
            .collect();

        for (key, size) in sorted_keys {
            let slot = treelets.iter_mut().find(|t| {
                t.size + size <= max_material_treelet_bytes && t.texture_keys.len() < 150
            });

            match slot {
                Some(t) => {
                    t.texture_keys.push(key);
                    t.size += size;
                }
                None => {
                    treelets.push(MaterialTreelet {
                        id: ctx.next_id(ObjectType::Treelet),
                        materials: vec![],
                        texture_keys: vec![key],
                        size,
                    });
                }
            }
        }

        for t in treelets.iter_mut() {
            for key in &t.texture_keys {
                if let Some((materials, _)) = key_to_materials.get(key) {
                    t.materials.extend(materials.iter().copied());
                }
            }
        }

        // Materials with no textures go into the smallest material treelet.
        let smallest = treelets
            .iter_mut()
            .min_by_key(|t| t.size)
            .expect("at least one material treelet");
        smallest.materials.extend(no_texture_materials);

        // Write the material treelet files.
        for t in &treelets {
            let mut texs: BTreeSet<u32> = BTreeSet::new();
            let mut stexs: BTreeSet<u32> = BTreeSet::new();
            let mut ftexs: BTreeSet<u32> = BTreeSet::new();

            for mtl in &t.materials {
                let Some(deps) = ctx
                    .dependencies()
                    .get(&ObjectKey::new(ObjectType::Material, *mtl))
                    .cloned()
                else {
                    continue;
                };

                for dep in deps {
                    match dep.kind {
                        ObjectType::SpectrumTexture => {
                            stexs.insert(dep.id);
                        }
                        ObjectType::FloatTexture => {
                            ftexs.insert(dep.id);
                        }
                        _ => continue,
                    }

                    if let Some(tdeps) = ctx.dependencies().get(&dep) {
                        for tdep in tdeps {
                            if tdep.kind == ObjectType::Texture {
                                texs.insert(tdep.id);
                            }
                        }
                    }
                }
            }

            info!(
                "dumping material treelet {} with {} material(s) and {} bytes of textures",
                t.id,
                t.materials.len(),
                t.size
            );

            let mut writer = RecordWriter::create(ctx.file_path(ObjectType::Treelet, t.id))?;

            writer.write_u32(0)?; // image partitions

            writer.write_u32(texs.len() as u32)?;
            for id in &texs {
                writer.write_u32(*id)?;
                let name = SceneContext::file_name(ObjectType::Texture, *id);
                writer.write_bytes(&fs::read(ctx.scene_path().join(name))?)?;
            }

            writer.write_u32(stexs.len() as u32)?;
            for id in &stexs {
                writer.write_u32(*id)?;
                writer.write_bytes(&ctx.read_object(ObjectType::SpectrumTexture, *id)?)?;
            }

            writer.write_u32(ftexs.len() as u32)?;
            for id in &ftexs {
                writer.write_u32(*id)?;
                writer.write_bytes(&ctx.read_object(ObjectType::FloatTexture, *id)?)?;
            }

            writer.write_u32(t.materials.len() as u32)?;
            for id in &t.materials {
                ctx.record_material_treelet(*id, t.id);

                writer.write_u32(*id)?;
                writer.write_bytes(&ctx.read_object(ObjectType::Material, *id)?)?;
            }

            writer.write_u32(0)?; // triangle meshes
            writer.write_u32(0)?; // nodes
            writer.write_u32(0)?; // primitives
            writer.flush()?;
        }

        Ok(())
    }

    /// First-fit-decreasing packs environment-map image partitions into
    /// image treelets.
    ///
    /// * `ctx` - The scene context.
    fn dump_image_partitions(&self, ctx: &mut SceneContext) -> Result<()> {
        let partition_count = ctx.id_count(ObjectType::ImagePartition);
        if partition_count == 0 {
            return Ok(());
        }

        let mut partitions: Vec<(u32, u64)> = (0..partition_count)
            .map(|pid| Ok((pid, ctx.object_size(ObjectType::ImagePartition, pid)?)))
            .collect::<Result<_>>()?;
        partitions.sort_by(|a, b| b.1.cmp(&a.1));

        struct ImageTreelet {
            id: u32,
            partitions: Vec<u32>,
            size: u64,
        }

        let mut treelets: Vec<ImageTreelet> = vec![];
        for (pid, size) in partitions {
            let slot = treelets
                .iter_mut()
                .find(|t| t.size + size <= self.config.max_treelet_bytes);

            match slot {
                Some(t) => {
                    t.partitions.push(pid);
                    t.size += size;
                }
                None => treelets.push(ImageTreelet {
                    id: ctx.next_id(ObjectType::Treelet),
                    partitions: vec![pid],
                    size,
                }),
            }
        }

        for t in &treelets {
            info!(
                "dumping image-partition treelet {} with {} image(s), {} bytes",
                t.id,
                t.partitions.len(),
                t.size
            );

            let mut writer = RecordWriter::create(ctx.file_path(ObjectType::Treelet, t.id))?;

            writer.write_u32(t.partitions.len() as u32)?;
            for pid in &t.partitions {
                writer.write_u32(*pid)?;
                writer.write_bytes(&ctx.read_object(ObjectType::ImagePartition, *pid)?)?;
                ctx.record_partition_treelet(*pid, t.id);
            }

            writer.write_u32(0)?; // ptex textures
            writer.write_u32(0)?; // spectrum textures
            writer.write_u32(0)?; // float textures
            writer.write_u32(0)?; // materials
            writer.write_u32(0)?; // triangle meshes
            writer.write_u32(0)?; // nodes
            writer.write_u32(0)?; // primitives
            writer.flush()?;
        }

        Ok(())
    }

    /// Serializes every geometry treelet of this BVH, recursing into
    /// non-copyable instances.
    ///
    /// * `ctx`  - The scene context.
    /// * `root` - True when dumping the scene accelerator.
    fn dump_treelets(&self, ctx: &mut SceneContext, root: bool) -> Result<DumpedTreelets> {
        // Assign global ids to each treelet.
        let treelet_ids: Vec<u32> = self
            .all_treelets
            .iter()
            .map(|_| ctx.next_id(ObjectType::Treelet))
            .collect();

        if root {
            self.dump_materials(ctx)?;
            self.dump_image_partitions(ctx)?;
        }

        // Serialized position of every node, per treelet, plus where each
        // inlined instance's nodes start.
        let mut node_locations: Vec<HashMap<u64, u32>> = vec![];
        let mut instance_starts: Vec<HashMap<usize, u32>> = vec![];
        for treelet in &self.all_treelets {
            let mut locations = HashMap::new();
            for (list_idx, node_idx) in treelet.nodes.iter().enumerate() {
                locations.insert(*node_idx, list_idx as u32);
            }
            node_locations.push(locations);

            let mut starts = HashMap::new();
            let mut inst_idx = treelet.nodes.len() as u32;
            for inst in &treelet.instances {
                debug_assert!(inst.copyable);
                starts.insert(inst.instance_id, inst_idx);
                inst_idx += inst.node_count() as u32;
            }
            instance_starts.push(starts);
        }

        self.dump_sanity_check()?;

        // Non-copyable instances are dumped once and referenced by treelet
        // id everywhere else.
        let mut instance_treelets: HashMap<usize, DumpedTreelets> = HashMap::new();

        for (treelet_idx, treelet) in self.all_treelets.iter().enumerate() {
            let s_treelet_id = treelet_ids[treelet_idx];

            // Collect the triangles of each mesh appearing in the treelet.
            let mut triangles_in_treelet: BTreeMap<u64, Vec<usize>> = BTreeMap::new();
            let mut source_meshes: BTreeMap<u64, Arc<crate::shapes::triangle::TriangleMesh>> =
                BTreeMap::new();
            for node_idx in &treelet.nodes {
                let node = self.as_bvh().nodes[*node_idx as usize];
                for prim_idx in 0..node.n_primitives as usize {
                    let prim = &self.as_bvh().primitives[node.offset as usize + prim_idx];
                    if let Some((mesh, mesh_id, tri_number)) = prim.as_triangle() {
                        triangles_in_treelet.entry(mesh_id).or_default().push(tri_number);
                        source_meshes.entry(mesh_id).or_insert_with(|| Arc::clone(mesh));
                    }
                }
            }

            // Inlined instances contribute their meshes wholesale.
            for inst in &treelet.instances {
                for prim in &inst.as_bvh().primitives {
                    match prim.as_triangle() {
                        Some((mesh, mesh_id, _)) => {
                            triangles_in_treelet.entry(mesh_id).or_default();
                            source_meshes.entry(mesh_id).or_insert_with(|| Arc::clone(mesh));
                        }
                        None => {
                            return Err(Error::Integrity(String::from(
                                "instance contains nested instancing",
                            )))
                        }
                    }
                }
            }

            let mut writer = RecordWriter::create(ctx.file_path(ObjectType::Treelet, s_treelet_id))?;

            writer.write_u32(0)?; // image partitions
            writer.write_u32(0)?; // ptex textures
            writer.write_u32(0)?; // spectrum textures
            writer.write_u32(0)?; // float textures
            writer.write_u32(0)?; // materials

            let mesh_count_offset = writer.write_u32(0)?;
            let mut num_meshes = 0_u32;

            // (orig mesh, orig tri) -> (new mesh, new tri)
            let mut tri_num_remap: HashMap<u64, HashMap<usize, (u64, usize)>> = HashMap::new();

            for (mesh_id, tri_nums) in &triangles_in_treelet {
                let mesh = &source_meshes[mesh_id];
                let new_mesh_id = ctx.next_id(ObjectType::TriangleMesh) as u64;
                let remap = tri_num_remap.entry(*mesh_id).or_default();

                let new_mesh = if !tri_nums.is_empty() {
                    crate::shapes::triangle::cut_mesh(new_mesh_id, mesh, tri_nums, remap, |f| f)
                } else {
                    // Instance mesh; kept whole.
                    for i in 0..mesh.n_triangles() {
                        remap.insert(i, (new_mesh_id, i));
                    }
                    (**mesh).clone()
                };

                let mtl_id = ctx.mesh_material(*mesh_id);
                let area_light_id = ctx.mesh_area_light(*mesh_id);

                // (mesh, material) pairs to serialize for this source mesh.
                let mut meshes_to_write: Vec<(u64, crate::shapes::triangle::TriangleMesh, u32)> =
                    vec![];

                if ctx.is_compound_material(mtl_id) {
                    // The material was split; split the cut mesh along the
                    // face partitions too.
                    let parts: Vec<(u32, Arc<BTreeMap<u32, u32>>)> = ctx
                        .compound_material(mtl_id)
                        .unwrap()
                        .iter()
                        .map(|(id, map)| (*id, Arc::clone(map)))
                        .collect();

                    for (part_mtl_id, face_map) in parts {
                        let part_tri_nums =
                            crate::shapes::triangle::face_ids_to_tri_nums(&new_mesh, &face_map)?;
                        let part_mesh_id = ctx.next_id(ObjectType::TriangleMesh) as u64;

                        let mut part_remap: HashMap<usize, (u64, usize)> = HashMap::new();
                        let part_mesh = crate::shapes::triangle::cut_mesh(
                            part_mesh_id,
                            &new_mesh,
                            &part_tri_nums,
                            &mut part_remap,
                            |f| face_map[&f],
                        );

                        // Retarget the original remap at the partition mesh.
                        for entry in remap.values_mut() {
                            if entry.0 == new_mesh_id {
                                if let Some(part_entry) = part_remap.get(&entry.1) {
                                    *entry = *part_entry;
                                }
                            }
                        }

                        meshes_to_write.push((part_mesh_id, part_mesh, part_mtl_id));
                    }

                    if remap.values().any(|entry| entry.0 == new_mesh_id) {
                        return Err(Error::Integrity(format!(
                            "triangles of mesh {mesh_id} missing from every material partition"
                        )));
                    }
                } else {
                    meshes_to_write.push((new_mesh_id, new_mesh, mtl_id));
                }

                for (s_mesh_id, m, mtl) in meshes_to_write {
                    num_meshes += 1;

                    let key = MaterialKey::new(ctx.material_treelet(mtl), mtl);

                    writer.write_u64(s_mesh_id)?;
                    writer.write_bytes(&key.to_bytes())?;
                    writer.write_u32(area_light_id)?;
                    writer.write_bytes(m.serialized())?;
                }
            }

            writer.patch_u32(mesh_count_offset, num_meshes)?;

            // Nodes: the treelet's own, then each inlined instance's.
            let node_count = treelet.nodes.len()
                + treelet
                    .instances
                    .iter()
                    .map(|inst| inst.node_count())
                    .sum::<usize>();

            let mut prim_count = 0_u32;
            for node_idx in &treelet.nodes {
                prim_count += self.as_bvh().nodes[*node_idx as usize].n_primitives as u32;
            }
            for inst in &treelet.instances {
                for node in &inst.as_bvh().nodes {
                    prim_count += node.n_primitives as u32;
                }
            }

            info!(
                "treelet {} has {} nodes and {} primitives",
                s_treelet_id, node_count, prim_count
            );

            writer.write_u32(node_count as u32)?;
            writer.write_u32(prim_count)?;

            let mut output_nodes: Vec<TreeletNode> = Vec::with_capacity(node_count);
            let mut current_primitive_offset = 0_u32;
            let mut q: Vec<(usize, usize)> = vec![]; // (parent output index, side)

            for node_idx in &treelet.nodes {
                let node = self.as_bvh().nodes[*node_idx as usize];

                let out_index = output_nodes.len();
                if let Some((parent, side)) = q.pop() {
                    output_nodes[parent].set_child(
                        side,
                        treelet_id_u16(s_treelet_id)?,
                        out_index as u32,
                    );
                }

                if node.n_primitives == 0 {
                    let mut out_node = TreeletNode::interior(node.bounds, node.axis);

                    let right_idx = node.offset as u64;
                    let r_tid = self.treelet_allocations[treelet.dir_idx][right_idx as usize];
                    if r_tid as usize != treelet_idx {
                        out_node.set_child(
                            RIGHT,
                            treelet_id_u16(treelet_ids[r_tid as usize])?,
                            node_locations[r_tid as usize][&right_idx],
                        );
                        output_nodes.push(out_node);
                    } else {
                        output_nodes.push(out_node);
                        q.push((out_index, RIGHT));
                    }

                    let left_idx = *node_idx + 1;
                    let l_tid = self.treelet_allocations[treelet.dir_idx][left_idx as usize];
                    if l_tid as usize != treelet_idx {
                        output_nodes[out_index].set_child(
                            LEFT,
                            treelet_id_u16(treelet_ids[l_tid as usize])?,
                            node_locations[l_tid as usize][&left_idx],
                        );
                    } else {
                        q.push((out_index, LEFT));
                    }
                } else {
                    output_nodes.push(TreeletNode::leaf(
                        node.bounds,
                        node.axis,
                        current_primitive_offset,
                        node.n_primitives as u32,
                    ));
                    current_primitive_offset += node.n_primitives as u32;
                }
            }

            for inst in &treelet.instances {
                debug_assert!(q.is_empty());

                for inst_node in &inst.as_bvh().nodes {
                    let out_index = output_nodes.len();
                    if let Some((parent, side)) = q.pop() {
                        output_nodes[parent].set_child(
                            side,
                            treelet_id_u16(s_treelet_id)?,
                            out_index as u32,
                        );
                    }

                    if inst_node.n_primitives == 0 {
                        // All of an inlined instance's nodes live in the
                        // same treelet.
                        output_nodes.push(TreeletNode::interior(inst_node.bounds, inst_node.axis));
                        q.push((out_index, RIGHT));
                        q.push((out_index, LEFT));
                    } else {
                        output_nodes.push(TreeletNode::leaf(
                            inst_node.bounds,
                            inst_node.axis,
                            current_primitive_offset,
                            inst_node.n_primitives as u32,
                        ));
                        current_primitive_offset += inst_node.n_primitives as u32;
                    }
                }
            }

            let mut node_blob = Vec::with_capacity(output_nodes.len() * super::node::NODE_SIZE);
            for out_node in &output_nodes {
                node_blob.extend_from_slice(&out_node.to_bytes());
            }
            writer.write_bytes(&node_blob)?;

            // Per-node primitive lists: transformed primitives, then
            // triangles.
            for node_idx in &treelet.nodes {
                let node = self.as_bvh().nodes[*node_idx as usize];

                let mut transformed_count = 0_u32;
                let mut triangle_count = 0_u32;
                for prim_idx in 0..node.n_primitives as usize {
                    match &self.as_bvh().primitives[node.offset as usize + prim_idx] {
                        ScenePrimitive::Instance { .. } => transformed_count += 1,
                        ScenePrimitive::Triangle { .. } => triangle_count += 1,
                    }
                }

                writer.write_u32(transformed_count)?;
                writer.write_u32(triangle_count)?;

                for prim_idx in 0..node.n_primitives as usize {
                    let prim = &self.as_bvh().primitives[node.offset as usize + prim_idx];
                    let Some((inst, to_world)) = prim.as_instance() else {
                        continue;
                    };

                    let instance_ref = if inst.copyable {
                        ((s_treelet_id as u64) << 32)
                            | instance_starts[treelet_idx][&inst.instance_id] as u64
                    } else {
                        if !instance_treelets.contains_key(&inst.instance_id) {
                            let dumped = inst.dump_treelets(ctx, false)?;
                            instance_treelets.insert(inst.instance_id, dumped);
                        }
                        let roots = &instance_treelets[&inst.instance_id].root_ids;
                        let root = roots
                            .get(treelet.dir_idx)
                            .copied()
                            .unwrap_or(roots[0]);
                        (root as u64) << 32
                    };

                    let mut record = Vec::with_capacity(TRANSFORMED_PRIMITIVE_SIZE);
                    record.write_u64::<LittleEndian>(instance_ref).unwrap();
                    for row in &to_world.start_transform.m.m {
                        for v in row {
                            record.write_f32::<LittleEndian>(*v).unwrap();
                        }
                    }
                    for row in &to_world.end_transform.m.m {
                        for v in row {
                            record.write_f32::<LittleEndian>(*v).unwrap();
                        }
                    }
                    record.write_f32::<LittleEndian>(to_world.start_time).unwrap();
                    record.write_f32::<LittleEndian>(to_world.end_time).unwrap();
                    writer.write_bytes(&record)?;
                }

                for prim_idx in 0..node.n_primitives as usize {
                    let prim = &self.as_bvh().primitives[node.offset as usize + prim_idx];
                    let Some((_, mesh_id, tri_number)) = prim.as_triangle() else {
                        continue;
                    };

                    let (new_mesh, new_tri) = tri_num_remap[&mesh_id][&tri_number];
                    writer.write_bytes(&triangle_record(new_mesh, new_tri as u32))?;
                }
            }

            // Primitive lists of the inlined instances; triangles only.
            for inst in &treelet.instances {
                for inst_node in &inst.as_bvh().nodes {
                    writer.write_u32(0)?;
                    writer.write_u32(inst_node.n_primitives as u32)?;

                    for prim_idx in 0..inst_node.n_primitives as usize {
                        let prim = &inst.as_bvh().primitives[inst_node.offset as usize + prim_idx];
                        let (_, mesh_id, tri_number) = prim
                            .as_triangle()
                            .expect("instance meshes are triangles only");

                        let (new_mesh, new_tri) = tri_num_remap[&mesh_id][&tri_number];
                        writer.write_bytes(&triangle_record(new_mesh, new_tri as u32))?;
                    }
                }
            }

            writer.flush()?;

            info!("finished dumping treelet {}", s_treelet_id);
        }

        if root {
            let mut static_alloc = fs::File::create(ctx.scene_path().join("STATIC0_pre"))?;
            for (treelet_idx, treelet) in self.all_treelets.iter().enumerate() {
                writeln!(static_alloc, "{} {}", treelet_ids[treelet_idx], treelet.total_prob)?;
            }

            for (instance_id, dumped) in &instance_treelets {
                let inst = self.find_instance(*instance_id).ok_or_else(|| {
                    Error::Integrity(format!("dumped unknown instance {instance_id}"))
                })?;

                for (info, gid) in inst.all_treelets.iter().zip(&dumped.treelet_ids) {
                    let inst_prob = self.instance_probabilities[info.dir_idx]
                        .get(instance_id)
                        .copied()
                        .unwrap_or(0.0);
                    writeln!(static_alloc, "{} {}", gid, info.total_prob * inst_prob)?;
                }
            }
        }

        let multi_dir = self.all_treelets.iter().any(|t| t.dir_idx != 0);
        let num_roots = if multi_dir { 8 } else { 1 };

        Ok(DumpedTreelets {
            root_ids: treelet_ids[..num_roots].to_vec(),
            treelet_ids,
        })
    }

    /// Finds a non-copyable instance handle by instance id.
    fn find_instance(&self, instance_id: usize) -> Option<Arc<DumpBvh>> {
        for prim in &self.as_bvh().primitives {
            if let Some((inst, _)) = prim.as_instance() {
                if inst.instance_id == instance_id {
                    return Some(Arc::clone(inst));
                }
            }
        }
        None
    }

    /// Verifies that the serialized node order walks parent before child
    /// with the depth-first adjacency the loader expects.
    fn dump_sanity_check(&self) -> Result<()> {
        for (treelet_idx, treelet) in self.all_treelets.iter().enumerate() {
            let mut q: Vec<(u64, usize)> = vec![]; // (parent node idx, side)

            for node_idx in &treelet.nodes {
                let node = self.as_bvh().nodes[*node_idx as usize];

                if let Some((parent_idx, side)) = q.pop() {
                    let parent = self.as_bvh().nodes[parent_idx as usize];
                    let ok = match side {
                        LEFT => *node_idx == parent_idx + 1,
                        _ => *node_idx == parent.offset as u64,
                    };
                    if !ok {
                        return Err(Error::Integrity(format!(
                            "treelet {treelet_idx} serialization order broken at node {node_idx}"
                        )));
                    }
                }

                if node.n_primitives == 0 {
                    let right = node.offset as u64;
                    let left = *node_idx + 1;
                    if self.treelet_allocations[treelet.dir_idx][right as usize] as usize
                        == treelet_idx
                    {
                        q.push((*node_idx, RIGHT));
                    }
                    if self.treelet_allocations[treelet.dir_idx][left as usize] as usize
                        == treelet_idx
                    {
                        q.push((*node_idx, LEFT));
                    }
                }
            }
        }

        Ok(())
    }
}

/// Encodes a packed triangle record.
fn triangle_record(mesh_id: u64, tri_number: u32) -> Vec<u8> {
    let mut record = Vec::with_capacity(TRIANGLE_SIZE);
    record.write_u64::<LittleEndian>(mesh_id).unwrap();
    record.write_u32::<LittleEndian>(tri_number).unwrap();
    record
}

/// Narrows a global treelet id to the node child-link width.
fn treelet_id_u16(id: u32) -> Result<u16> {
    u16::try_from(id).map_err(|_| {
        Error::Integrity(format!("treelet id {id} does not fit the child link width"))
    })
}

/// Returns a material's texture key: the sorted atlas file names its
/// textures reference.
fn texture_key(mtl_id: u32, ctx: &SceneContext) -> Result<Vec<String>> {
    let record = ctx
        .material(mtl_id)
        .ok_or_else(|| Error::Integrity(format!("unknown material {mtl_id}")))?;

    let mut key = vec![];
    for id in record.float_textures.values() {
        if let Some(tex) = ctx.float_texture(*id) {
            if let Some(filename) = tex.filename() {
                key.push(filename);
            }
        }
    }
    for id in record.spectrum_textures.values() {
        if let Some(tex) = ctx.spectrum_texture(*id) {
            if let Some(filename) = tex.filename() {
                key.push(filename);
            }
        }
    }

    key.sort();
    Ok(key)
}

/// True when `sub` is a strict subset of `superset` (both sorted).
fn is_subset(sub: &[String], superset: &[String]) -> bool {
    if superset.len() <= sub.len() {
        return false;
    }

    let mut i = 0;
    let mut j = 0;
    while i < sub.len() && j < superset.len() {
        if sub[i] == superset[j] {
            i += 1;
        }
        j += 1;
    }

    i == sub.len()
}

/// Cuts every atlas of a texture group to a face partition and records the
/// partition with the scene context.
///
/// * `texture_key` - Sorted atlas file names of the group.
/// * `used_faces`  - The partition's face set.
/// * `ctx`         - The scene context.
fn create_texture_partition(
    texture_key: &[String],
    used_faces: &BTreeSet<u32>,
    ctx: &mut SceneContext,
) -> Result<()> {
    let mut old_to_new: BTreeMap<u32, u32> = BTreeMap::new();
    let mut part_key = vec![];

    for filename in texture_key {
        let src = FaceAtlas::from_bytes(&fs::read(ctx.scene_path().join(filename))?)?;

        info!("cutting texture {filename} ({} faces)", src.face_count());
        let (cut, mapping) = src.cut(used_faces);

        let (new_tid, new_name) = ctx.add_texture(&cut.to_bytes())?;
        info!("texture {filename} cut into {new_name} ({} faces)", cut.face_count());

        old_to_new.extend(mapping);
        part_key.push(new_tid);
    }

    ctx.add_to_compound_texture(texture_key, part_key, Arc::new(old_to_new));
    Ok(())
}

/// Creates a partition material: the original material with its ptex
/// textures retargeted at one partition's cut atlases.
///
/// * `mtl_id`      - The original material.
/// * `texture_key` - The group's atlas file names (sorted).
/// * `part_key`    - New texture ids, one per atlas in key order.
/// * `ctx`         - The scene context.
fn create_material_partition(
    mtl_id: u32,
    texture_key: &[String],
    part_key: &[u32],
    ctx: &mut SceneContext,
) -> Result<u32> {
    let new_texture: BTreeMap<&String, u32> =
        texture_key.iter().zip(part_key.iter().copied()).collect();

    let mut record = ctx
        .material(mtl_id)
        .ok_or_else(|| Error::Integrity(format!("unknown material {mtl_id}")))?
        .clone();

    let retarget = |tex: &TextureRecord| -> Result<Option<TextureRecord>> {
        let Some(filename) = tex.filename() else {
            return Ok(None);
        };
        let Some(new_tid) = new_texture.get(&filename) else {
            return Ok(None);
        };

        let mut new_tex = tex.clone();
        new_tex.params.add_string(
            "filename",
            vec![SceneContext::file_name(ObjectType::Texture, *new_tid)],
        );
        Ok(Some(new_tex))
    };

    let float_textures = std::mem::take(&mut record.float_textures);
    for (name, tid) in float_textures {
        let tex = ctx
            .float_texture(tid)
            .ok_or_else(|| Error::Integrity(format!("unknown float texture {tid}")))?
            .clone();
        let new_id = match retarget(&tex)? {
            Some(new_tex) => ctx.add_float_texture(new_tex)?,
            None => tid,
        };
        record.float_textures.insert(name, new_id);
    }

    let spectrum_textures = std::mem::take(&mut record.spectrum_textures);
    for (name, tid) in spectrum_textures {
        let tex = ctx
            .spectrum_texture(tid)
            .ok_or_else(|| Error::Integrity(format!("unknown spectrum texture {tid}")))?
            .clone();
        let new_id = match retarget(&tex)? {
            Some(new_tex) => ctx.add_spectrum_texture(new_tex)?,
            None => tid,
        };
        record.spectrum_textures.insert(name, new_id);
    }

    ctx.add_material(record)
}

/// Cuts an oversized material's ptex textures into face partitions and
/// creates one material per partition. Returns the new material ids.
///
/// * `mtl_id`    - The material to cut.
/// * `max_bytes` - Partition byte budget.
/// * `ctx`       - The scene context.
fn generate_texture_partitions(
    mtl_id: u32,
    max_bytes: u64,
    ctx: &mut SceneContext,
) -> Result<Vec<u32>> {
    let key = texture_key(mtl_id, ctx)?;
    if key.is_empty() {
        return Err(Error::Integrity(format!(
            "material {mtl_id} has no textures to partition"
        )));
    }

    if !ctx.is_compound_texture(&key) {
        // Load every atlas of the group and aggregate face sizes; all
        // atlases must agree on face count and adjacency.
        let mut atlases = vec![];
        for filename in &key {
            atlases.push(FaceAtlas::from_bytes(&fs::read(
                ctx.scene_path().join(filename),
            )?)?);
        }

        let face_count = atlases[0].face_count();
        if atlases.iter().any(|a| a.face_count() != face_count) {
            return Err(Error::Integrity(String::from(
                "textures of one material disagree on face count",
            )));
        }

        let mut face_sizes = vec![0_u64; face_count];
        let mut adjacency = vec![[super::ptex::NO_FACE; 4]; face_count];
        for atlas in &atlases {
            for (i, face) in atlas.faces.iter().enumerate() {
                face_sizes[i] += face.data.len() as u64;

                for j in 0..4 {
                    if face.adj[j] == super::ptex::NO_FACE {
                        continue;
                    }
                    if adjacency[i][j] == super::ptex::NO_FACE {
                        adjacency[i][j] = face.adj[j];
                    } else if adjacency[i][j] != face.adj[j] {
                        return Err(Error::Integrity(String::from(
                            "textures of one material disagree on face adjacency",
                        )));
                    }
                }
            }
        }

        for partition in partition_faces(&face_sizes, &adjacency, max_bytes) {
            create_texture_partition(&key, &partition, ctx)?;
        }
    }

    let partitions: Vec<(Vec<u32>, Arc<BTreeMap<u32, u32>>)> = ctx
        .compound_texture(&key)
        .expect("texture group was just cut")
        .clone();

    let mut new_mtl_ids = vec![];
    for (part_key, face_map) in partitions {
        let new_mtl = create_material_partition(mtl_id, &key, &part_key, ctx)?;
        new_mtl_ids.push(new_mtl);
        ctx.add_to_compound_material(mtl_id, new_mtl, face_map);
    }

    Ok(new_mtl_ids)
}
