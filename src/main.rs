//! Treelet scene inspector: prints per-treelet summaries of a dumped scene
//! and verifies cross-treelet links.

#[macro_use]
extern crate log;

use byteorder::{LittleEndian, ReadBytesExt};
use grove::accelerators::treelet::format::RecordReader;
use grove::accelerators::treelet::node::{NodeData, TreeletNode};
use grove::core::app::options;
use grove::core::error::{Error, Result};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

fn main() {
    env_logger::init();

    if let Err(e) = inspect(Path::new(&options().scene_path)) {
        error!("{e}");
        std::process::exit(1);
    }
}

/// Summary of one treelet file.
struct TreeletSummary {
    image_partitions: u32,
    textures: u32,
    spectrum_textures: u32,
    float_textures: u32,
    materials: u32,
    meshes: u32,
    nodes: Vec<TreeletNode>,
    primitives: u32,
    bytes: u64,
}

fn inspect(scene_path: &Path) -> Result<()> {
    let opts = options();

    if !opts.quiet {
        print_header(scene_path)?;
        print_static_allocation(scene_path)?;
    }

    let mut summaries: BTreeMap<u32, TreeletSummary> = BTreeMap::new();
    for entry in fs::read_dir(scene_path)? {
        let entry = entry?;
        let name = entry.file_name();
        let name = name.to_string_lossy().to_string();
        if name.len() < 2 || !name.starts_with('T') || !name[1..].chars().all(|c| c.is_ascii_digit()) {
            continue;
        }
        let Ok(id) = name[1..].parse::<u32>() else {
            continue;
        };

        if let Some(only) = opts.treelet {
            if only != id {
                continue;
            }
        }

        summaries.insert(id, summarize(&entry.path(), id)?);
    }

    for (id, s) in &summaries {
        if !opts.quiet {
            println!(
                "T{id:04}: {} nodes, {} primitives, {} meshes, {} materials, \
                 {} textures ({} spectrum, {} float), {} image partitions, {} bytes",
                s.nodes.len(),
                s.primitives,
                s.meshes,
                s.materials,
                s.textures,
                s.spectrum_textures,
                s.float_textures,
                s.image_partitions,
                s.bytes
            );
        }
    }

    if opts.check_links {
        check_links(&summaries)?;
        if !opts.quiet {
            println!("cross-treelet links OK");
        }
    }

    Ok(())
}

fn print_header(scene_path: &Path) -> Result<()> {
    let path = scene_path.join("HEADER");
    if !path.exists() {
        return Ok(());
    }

    let bytes = fs::read(path)?;
    let mut r = bytes.as_slice();
    let mut bounds = [0.0_f32; 6];
    for v in bounds.iter_mut() {
        *v = r.read_f32::<LittleEndian>()?;
    }
    let total = r.read_u64::<LittleEndian>()?;

    println!(
        "scene bounds ({} {} {}) - ({} {} {}), {} treelet bytes",
        bounds[0], bounds[1], bounds[2], bounds[3], bounds[4], bounds[5], total
    );
    Ok(())
}

fn print_static_allocation(scene_path: &Path) -> Result<()> {
    let path = scene_path.join("STATIC0_pre");
    if !path.exists() {
        return Ok(());
    }

    let contents = fs::read_to_string(path)?;
    let count = contents.lines().count();
    println!("static allocation hint: {count} treelet(s)");
    Ok(())
}

fn summarize(path: &Path, id: u32) -> Result<TreeletSummary> {
    let buffer = fs::read(path)?;
    let mut reader = RecordReader::new(&buffer, id);

    let image_partitions = reader.read_u32()?;
    for _ in 0..image_partitions {
        reader.read_u32()?;
        reader.read_bytes()?;
    }

    let mut counts = [0_u32; 4];
    for slot in counts.iter_mut() {
        *slot = reader.read_u32()?;
        for _ in 0..*slot {
            reader.read_u32()?;
            reader.read_bytes()?;
        }
    }
    let [textures, spectrum_textures, float_textures, materials] = counts;

    let meshes = reader.read_u32()?;
    for _ in 0..meshes {
        reader.read_u64()?;
        reader.read_bytes()?;
        reader.read_u32()?;
        reader.read_bytes()?;
    }

    let node_count = reader.read_u32()?;
    let primitives = reader.read_u32()?;

    let nodes = if node_count > 0 {
        let blob = reader.read_bytes()?;
        TreeletNode::from_blob(blob, node_count as usize, id)?
    } else {
        vec![]
    };

    Ok(TreeletSummary {
        image_partitions,
        textures,
        spectrum_textures,
        float_textures,
        materials,
        meshes,
        nodes,
        primitives,
        bytes: buffer.len() as u64,
    })
}

fn check_links(summaries: &BTreeMap<u32, TreeletSummary>) -> Result<()> {
    for (id, s) in summaries {
        for (node_idx, node) in s.nodes.iter().enumerate() {
            let NodeData::Interior {
                child_treelet,
                child_node,
            } = node.data
            else {
                continue;
            };

            for side in 0..2 {
                let tid = child_treelet[side] as u32;
                let nid = child_node[side];

                let target = summaries.get(&tid).ok_or_else(|| {
                    Error::Integrity(format!(
                        "T{id:04} node {node_idx} links to missing treelet {tid}"
                    ))
                })?;

                if nid as usize >= target.nodes.len() {
                    return Err(Error::Integrity(format!(
                        "T{id:04} node {node_idx} links to node {nid} of T{tid:04}, \
                         which has only {} nodes",
                        target.nodes.len()
                    )));
                }
            }
        }
    }
    Ok(())
}
