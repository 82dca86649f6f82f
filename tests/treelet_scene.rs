//! End-to-end dump / load / traverse scenarios.

use float_cmp::approx_eq;
use grove::accelerators::treelet::partition::DumpBvh;
use grove::accelerators::treelet::ptex::{Face, FaceAtlas, NO_FACE};
use grove::accelerators::treelet::ray_state::RayState;
use grove::accelerators::treelet::residency::{LoadOptions, TreeletBvh};
use grove::accelerators::treelet::{DumpConfig, PartitionAlgorithm};
use grove::accelerators::ScenePrimitive;
use grove::core::error::Error;
use grove::core::geometry::{
    point3, ray, vector3, AnimatedTransform, Point3f, Ray, Transform, Vector3f, INFINITY,
};
use grove::core::material::{MaterialRecord, TextureRecord};
use grove::core::paramset::ParamSet;
use grove::core::scene::SceneContext;
use grove::shapes::triangle::TriangleMesh;
use rand::{Rng, SeedableRng};
use rand_pcg::Pcg64;
use std::sync::Arc;

/// A unit cube centred at the origin.
fn cube_mesh(center: Point3f, half: f32) -> TriangleMesh {
    let (c, h) = (center, half);
    let p = vec![
        point3(c.x - h, c.y - h, c.z - h),
        point3(c.x + h, c.y - h, c.z - h),
        point3(c.x + h, c.y + h, c.z - h),
        point3(c.x - h, c.y + h, c.z - h),
        point3(c.x - h, c.y - h, c.z + h),
        point3(c.x + h, c.y - h, c.z + h),
        point3(c.x + h, c.y + h, c.z + h),
        point3(c.x - h, c.y + h, c.z + h),
    ];
    let vi = vec![
        0, 1, 2, 0, 2, 3, // -z
        4, 6, 5, 4, 7, 6, // +z
        0, 1, 5, 0, 5, 4, // -y
        3, 2, 6, 3, 6, 7, // +y
        0, 4, 7, 0, 7, 3, // -x
        1, 2, 6, 1, 6, 5, // +x
    ];
    TriangleMesh::new(vi, p, None, None, None, None)
}

fn mesh_prims(mesh: &Arc<TriangleMesh>, mesh_id: u64) -> Vec<ScenePrimitive> {
    (0..mesh.n_triangles())
        .map(|tri_number| ScenePrimitive::Triangle {
            mesh: Arc::clone(mesh),
            mesh_id,
            tri_number,
        })
        .collect()
}

fn root_config(max_treelet_bytes: u64) -> DumpConfig {
    DumpConfig {
        max_treelet_bytes,
        copyable_threshold: max_treelet_bytes / 2,
        scene_accelerator: true,
        write_header: true,
        ..DumpConfig::default()
    }
}

/// Random triangle soup in a single mesh.
fn soup_mesh(n_triangles: usize, seed: u64) -> TriangleMesh {
    let mut rng = Pcg64::seed_from_u64(seed);
    let mut p = vec![];
    let mut vi = vec![];

    for i in 0..n_triangles {
        let cx: f32 = rng.gen_range(-5.0..5.0);
        let cy: f32 = rng.gen_range(-5.0..5.0);
        let cz: f32 = rng.gen_range(-5.0..5.0);

        for _ in 0..3 {
            p.push(point3(
                cx + rng.gen_range(-0.5..0.5),
                cy + rng.gen_range(-0.5..0.5),
                cz + rng.gen_range(-0.5..0.5),
            ));
        }
        vi.extend([3 * i as u32, 3 * i as u32 + 1, 3 * i as u32 + 2]);
    }

    TriangleMesh::new(vi, p, None, None, None, None)
}

fn soup_rays(n: usize, seed: u64) -> Vec<Ray> {
    let mut rng = Pcg64::seed_from_u64(seed);
    (0..n)
        .map(|_| {
            let o = point3(
                rng.gen_range(-20.0..20.0_f32),
                rng.gen_range(-20.0..20.0_f32),
                -20.0,
            );
            let target = point3(
                rng.gen_range(-5.0..5.0_f32),
                rng.gen_range(-5.0..5.0_f32),
                rng.gen_range(-5.0..5.0_f32),
            );
            ray(o, target - o, INFINITY)
        })
        .collect()
}

#[test]
fn single_cube_dump_and_hit() {
    let dir = tempfile::tempdir().unwrap();
    let mut ctx = SceneContext::create(dir.path()).unwrap();

    let mesh = Arc::new(cube_mesh(point3(0.0, 0.0, 0.0), 0.5));
    let bvh = DumpBvh::new(mesh_prims(&mesh, 1), root_config(10_000), &mut ctx).unwrap();
    let roots = bvh.dump(&mut ctx).unwrap();
    ctx.save().unwrap();

    assert_eq!(roots, vec![0]);
    assert!(dir.path().join("HEADER").exists());
    assert!(dir.path().join("STATIC0_pre").exists());
    assert!(dir.path().join("T0000").exists());

    let ctx = Arc::new(SceneContext::open(dir.path()).unwrap());
    let scene = TreeletBvh::new(ctx, LoadOptions::default()).unwrap();

    let mut r = ray(point3(0.0, 0.0, -5.0), vector3(0.0, 0.0, 1.0), INFINITY);
    let isect = scene.intersect(&mut r).unwrap().expect("ray should hit the cube");

    assert!(approx_eq!(f32, r.t_max, 4.5, epsilon = 1e-4));
    assert!(approx_eq!(f32, isect.p.z, -0.5, epsilon = 1e-4));

    assert!(scene
        .intersect_p(&ray(point3(0.0, 0.0, -5.0), vector3(0.0, 0.0, 1.0), INFINITY))
        .unwrap());
    assert!(!scene
        .intersect_p(&ray(point3(0.0, 5.0, -5.0), vector3(0.0, 0.0, 1.0), INFINITY))
        .unwrap());
}

#[test]
fn random_soup_matches_flat_bvh() {
    for seed in [1_u64, 2, 3] {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = SceneContext::create(dir.path()).unwrap();

        let mesh = Arc::new(soup_mesh(200, seed));
        let bvh = DumpBvh::new(mesh_prims(&mesh, 1), root_config(4_096), &mut ctx).unwrap();
        bvh.dump(&mut ctx).unwrap();
        ctx.save().unwrap();

        // The budget forces the soup across several treelets.
        let ctx2 = SceneContext::open(dir.path()).unwrap();
        assert!(ctx2.treelet_count().unwrap() > 2);

        let scene = TreeletBvh::new(
            Arc::new(ctx2),
            LoadOptions {
                preload: true,
                ..LoadOptions::default()
            },
        )
        .unwrap();

        for r in soup_rays(100, seed + 100) {
            let mut reference_ray = r;
            let reference = bvh.as_bvh().intersect(&mut reference_ray);

            let mut treelet_ray = r;
            let result = scene.intersect(&mut treelet_ray).unwrap();

            match (reference, result) {
                (None, None) => {}
                (Some(a), Some(b)) => {
                    assert!(approx_eq!(f32, reference_ray.t_max, treelet_ray.t_max, epsilon = 1e-3));
                    assert!(approx_eq!(f32, a.p.x, b.p.x, epsilon = 1e-3));
                    assert!(approx_eq!(f32, a.p.y, b.p.y, epsilon = 1e-3));
                    assert!(approx_eq!(f32, a.p.z, b.p.z, epsilon = 1e-3));
                    assert!(approx_eq!(f32, a.n.dot(&Vector3f::from(b.n)).abs(), 1.0, epsilon = 1e-3));
                }
                (a, b) => panic!("hit mismatch: reference {:?} vs treelets {:?}", a.is_some(), b.is_some()),
            }

            assert_eq!(bvh.as_bvh().intersect_p(&r), scene.intersect_p(&r).unwrap());
        }
    }
}

#[test]
fn partial_trace_reproduces_intersect() {
    let dir = tempfile::tempdir().unwrap();
    let mut ctx = SceneContext::create(dir.path()).unwrap();

    let mesh = Arc::new(soup_mesh(120, 7));
    let bvh = DumpBvh::new(mesh_prims(&mesh, 1), root_config(4_096), &mut ctx).unwrap();
    bvh.dump(&mut ctx).unwrap();
    ctx.save().unwrap();

    let scene = TreeletBvh::new(
        Arc::new(SceneContext::open(dir.path()).unwrap()),
        LoadOptions::default(),
    )
    .unwrap();

    for r in soup_rays(50, 11) {
        let mut state = RayState::new(r);
        state.start_trace(false);
        while !state.finished() {
            scene.trace(&mut state).unwrap();
        }

        let mut closest_ray = r;
        let closest = scene.intersect(&mut closest_ray).unwrap();

        assert_eq!(state.has_hit(), closest.is_some());
        if let Some(isect) = closest {
            assert!(approx_eq!(f32, state.ray.t_max, closest_ray.t_max, epsilon = 1e-3));
            assert!(approx_eq!(f32, state.hit_info.isect.p.x, isect.p.x, epsilon = 1e-3));
            assert!(approx_eq!(f32, state.hit_info.isect.p.y, isect.p.y, epsilon = 1e-3));
            assert!(approx_eq!(f32, state.hit_info.isect.p.z, isect.p.z, epsilon = 1e-3));
        }
    }
}

#[test]
fn external_instance_suspends_trace() {
    let dir = tempfile::tempdir().unwrap();
    let mut ctx = SceneContext::create(dir.path()).unwrap();

    // A non-copyable instanced cube, translated along +x.
    let instance_mesh = Arc::new(cube_mesh(point3(0.0, 0.0, 0.0), 0.5));
    let instance_config = DumpConfig {
        max_treelet_bytes: 10_000,
        copyable_threshold: 0,
        ..DumpConfig::default()
    };
    let instance = Arc::new(
        DumpBvh::new(mesh_prims(&instance_mesh, 1), instance_config, &mut ctx).unwrap(),
    );
    assert!(!instance.copyable);

    // The scene: a direct cube at the origin plus the instance at x = 3.
    let direct_mesh = Arc::new(cube_mesh(point3(0.0, 0.0, 0.0), 0.5));
    let mut prims = mesh_prims(&direct_mesh, 2);
    prims.push(ScenePrimitive::Instance {
        bvh: Arc::clone(&instance),
        to_world: AnimatedTransform::from_transform(Transform::translate(&Vector3f::new(
            3.0, 0.0, 0.0,
        ))),
    });

    let mut config = root_config(10_000);
    config.copyable_threshold = 0;
    let bvh = DumpBvh::new(prims, config, &mut ctx).unwrap();
    bvh.dump(&mut ctx).unwrap();
    ctx.save().unwrap();

    let scene = TreeletBvh::new(
        Arc::new(SceneContext::open(dir.path()).unwrap()),
        LoadOptions::default(),
    )
    .unwrap();

    // A ray aimed at the instance suspends at the instance's treelet.
    let r = ray(point3(3.0, 0.0, -5.0), vector3(0.0, 0.0, 1.0), INFINITY);
    let mut state = RayState::new(r);
    state.start_trace(false);
    scene.trace(&mut state).unwrap();

    assert!(!state.finished());
    let crossing = state.current_treelet().unwrap();
    assert_ne!(crossing, 0);

    // Running the trace to completion finds the instanced geometry.
    while !state.finished() {
        scene.trace(&mut state).unwrap();
    }
    assert!(state.has_hit());

    // The recorded interaction is in instance space; `hit_transform` maps
    // it back to the world.
    let p_world = state.hit_transform.transform_point(&state.hit_info.isect.p);
    assert!(approx_eq!(f32, p_world.x, 3.0, epsilon = 1e-3));
    assert!(approx_eq!(f32, p_world.z, -0.5, epsilon = 1e-3));

    // The closest-hit query agrees.
    let mut closest_ray = r;
    let isect = scene
        .intersect(&mut closest_ray)
        .unwrap()
        .expect("instance should be hit");
    assert!(approx_eq!(f32, isect.p.z, -0.5, epsilon = 1e-3));
    assert!(approx_eq!(f32, closest_ray.t_max, state.ray.t_max, epsilon = 1e-3));
}

#[test]
fn directional_roots_cover_all_octants() {
    let dir = tempfile::tempdir().unwrap();
    let mut ctx = SceneContext::create(dir.path()).unwrap();

    let mesh = Arc::new(cube_mesh(point3(0.0, 0.0, 0.0), 0.5));
    let mut config = root_config(10_000);
    config.partition = PartitionAlgorithm::OneByOne;
    config.directional_treelets = true;

    let bvh = DumpBvh::new(mesh_prims(&mesh, 1), config, &mut ctx).unwrap();
    let roots = bvh.dump(&mut ctx).unwrap();
    ctx.save().unwrap();

    assert_eq!(roots, (0..8).collect::<Vec<u32>>());

    let scene = TreeletBvh::new(
        Arc::new(SceneContext::open(dir.path()).unwrap()),
        LoadOptions {
            directional_treelets: true,
            ..LoadOptions::default()
        },
    )
    .unwrap();

    // Each diagonal direction starts in its own root treelet.
    let mut seen = std::collections::BTreeSet::new();
    for idx in 0..8_u32 {
        let d = Vector3f::new(
            if idx & 1 != 0 { 1.0 } else { -1.0 },
            if idx & 2 != 0 { 1.0 } else { -1.0 },
            if idx & 4 != 0 { 1.0 } else { -1.0 },
        );
        let mut state = RayState::new(ray(point3(0.0, 0.0, 0.0), d, INFINITY));
        state.start_trace(true);
        let root = state.current_treelet().unwrap();
        assert_eq!(root, idx);
        seen.insert(root);
    }
    assert_eq!(seen.len(), 8);

    // Closest hit still works through the octant root.
    let mut r = ray(point3(0.0, 0.0, -5.0), vector3(0.0, 0.0, 1.0), INFINITY);
    let isect = scene.intersect(&mut r).unwrap().expect("should hit the cube");
    assert!(approx_eq!(f32, isect.p.z, -0.5, epsilon = 1e-4));
}

#[test]
fn lazy_with_threads_is_a_config_error() {
    let dir = tempfile::tempdir().unwrap();
    let mut ctx = SceneContext::create(dir.path()).unwrap();

    let mesh = Arc::new(cube_mesh(point3(0.0, 0.0, 0.0), 0.5));
    let bvh = DumpBvh::new(mesh_prims(&mesh, 1), root_config(10_000), &mut ctx).unwrap();
    bvh.dump(&mut ctx).unwrap();
    ctx.save().unwrap();

    let result = TreeletBvh::new(
        Arc::new(SceneContext::open(dir.path()).unwrap()),
        LoadOptions {
            preload: false,
            threads: 2,
            ..LoadOptions::default()
        },
    );

    match result {
        Err(Error::Config(_)) => {}
        other => panic!("expected a config error, got {:?}", other.is_ok()),
    }
}

#[test]
fn preloaded_scene_is_shared_between_threads() {
    let dir = tempfile::tempdir().unwrap();
    let mut ctx = SceneContext::create(dir.path()).unwrap();

    let mesh = Arc::new(soup_mesh(150, 5));
    let bvh = DumpBvh::new(mesh_prims(&mesh, 1), root_config(4_096), &mut ctx).unwrap();
    bvh.dump(&mut ctx).unwrap();
    ctx.save().unwrap();

    let scene = Arc::new(
        TreeletBvh::new(
            Arc::new(SceneContext::open(dir.path()).unwrap()),
            LoadOptions {
                preload: true,
                threads: 2,
                ..LoadOptions::default()
            },
        )
        .unwrap(),
    );

    let rays = soup_rays(60, 17);
    let single: Vec<Option<f32>> = rays
        .iter()
        .map(|r| {
            let mut r = *r;
            scene.intersect(&mut r).unwrap().map(|_| r.t_max)
        })
        .collect();

    let mut handles = vec![];
    for _ in 0..2 {
        let scene = Arc::clone(&scene);
        let rays = rays.clone();
        handles.push(std::thread::spawn(move || {
            rays.iter()
                .map(|r| {
                    let mut r = *r;
                    scene.intersect(&mut r).unwrap().map(|_| r.t_max)
                })
                .collect::<Vec<Option<f32>>>()
        }));
    }

    for handle in handles {
        let parallel = handle.join().unwrap();
        assert_eq!(parallel, single);
    }
}

#[test]
fn oversized_ptex_material_is_partitioned() {
    let dir = tempfile::tempdir().unwrap();
    let mut ctx = SceneContext::create(dir.path()).unwrap();

    // An 8-face strip atlas, 2 KiB per face; the material budget below
    // cannot hold it whole.
    let faces: Vec<Face> = (0..8)
        .map(|i| {
            let mut adj = [NO_FACE; 4];
            if i > 0 {
                adj[0] = i - 1;
            }
            if i < 7 {
                adj[1] = i + 1;
            }
            Face::new(adj, vec![i as u8; 2048])
        })
        .collect();
    let atlas = FaceAtlas::new(faces);

    let (_tex_id, tex_name) = ctx.add_texture(&atlas.to_bytes()).unwrap();

    let mut tex_params = ParamSet::new();
    tex_params.add_string("filename", vec![tex_name]);
    let stex_id = ctx
        .add_spectrum_texture(TextureRecord {
            name: String::from("ptex"),
            params: tex_params,
        })
        .unwrap();

    let mut record = MaterialRecord {
        name: String::from("matte"),
        ..MaterialRecord::default()
    };
    record.spectrum_textures.insert(String::from("Kd"), stex_id);
    let mtl_id = ctx.add_material(record).unwrap();

    // Eight triangles in the z = 0 plane, one per ptex face.
    let mut p = vec![];
    let mut vi = vec![];
    for i in 0..8 {
        let x = i as f32 * 2.0;
        p.push(point3(x, 0.0, 0.0));
        p.push(point3(x + 1.0, 0.0, 0.0));
        p.push(point3(x, 1.0, 0.0));
        vi.extend([3 * i as u32, 3 * i as u32 + 1, 3 * i as u32 + 2]);
    }
    let mesh = Arc::new(TriangleMesh::new(
        vi,
        p,
        None,
        None,
        None,
        Some((0..8).collect()),
    ));
    ctx.record_mesh_material(1, mtl_id);

    let bvh = DumpBvh::new(mesh_prims(&mesh, 1), root_config(8_000), &mut ctx).unwrap();
    bvh.dump(&mut ctx).unwrap();
    ctx.save().unwrap();

    // The material was cut into at least two partitions.
    assert!(ctx.is_compound_material(mtl_id));
    assert!(ctx.compound_material(mtl_id).unwrap().len() >= 2);

    let scene = TreeletBvh::new(
        Arc::new(SceneContext::open(dir.path()).unwrap()),
        LoadOptions {
            preload: true,
            ..LoadOptions::default()
        },
    )
    .unwrap();

    // Every triangle resolves to a loadable, non-placeholder material.
    let mut seen_treelets = std::collections::BTreeSet::new();
    for i in 0..8 {
        let x = i as f32 * 2.0 + 0.25;
        let mut r = ray(point3(x, 0.25, -5.0), vector3(0.0, 0.0, 1.0), INFINITY);
        let isect = scene.intersect(&mut r).unwrap().expect("triangle should be hit");

        assert_ne!(isect.material_key.id, 0);
        let material = isect.material.as_ref().expect("material must be resolved");
        assert!(!material.is_placeholder());

        scene.load_treelet(isect.material_key.treelet).unwrap();
        seen_treelets.insert(isect.material_key.treelet);
    }
    assert!(!seen_treelets.is_empty());
}
