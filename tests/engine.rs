mod common;

use std::sync::Arc;

use glam::Vec3;
use reign_engine::render::DrawList;
use reign_engine::{
    DirectoryArchive, EngineConfig, EngineError, InstanceKind, MemoryArchive, PlaybackState,
    ReignEngine, Scene,
};

fn scene_engine() -> (tempfile::TempDir, ReignEngine, std::collections::BTreeMap<String, reign_engine::InstanceId>) {
    let dir = tempfile::tempdir().unwrap();
    common::write_assets(dir.path());
    let scene = Scene::from_xml(common::SCENE_XML).unwrap();
    let archive = DirectoryArchive::open(dir.path()).unwrap();
    let mut engine = ReignEngine::with_archive(scene.config.clone(), Arc::new(archive));
    let ids = scene.instantiate(&mut engine).unwrap();
    (dir, engine, ids)
}

#[test]
fn scene_directory_builds_every_instance() {
    let (_dir, engine, ids) = scene_engine();
    assert_eq!(engine.instances().capacity(), 16);
    assert_eq!(ids.len(), 4);
    assert_eq!(engine.cache().model_count(), 2);
    assert_eq!(engine.cache().effect_count(), 1);
    assert!(engine.backgrounds()[0].is_drawn());
    let (_, light) = engine.directional_light().unwrap();
    assert!((light.direction - Vec3::new(0.0, -1.0, -1.0).normalize()).length() < 1e-5);
}

#[test]
fn bone_buffers_always_match_the_skeleton() {
    let (_dir, mut engine, ids) = scene_engine();
    let hero = ids["hero"];
    engine.set_motion_state(hero, PlaybackState::Loop).unwrap();
    for _ in 0..20 {
        engine.update(33.0);
        for instance in engine.instances().iter() {
            if let (Some(model), Some(pose)) = (instance.model(), instance.pose()) {
                assert_eq!(pose.skin.len(), model.bones.len());
            }
        }
    }
    let frame = engine.motion_frame(hero).unwrap().unwrap();
    assert!((0.0..=9.0).contains(&frame));
}

#[test]
fn effect_particles_keep_their_random_parameters() {
    let (_dir, mut engine, ids) = scene_engine();
    let aura = ids["aura"];
    let before = engine.instance(aura).unwrap().effect().unwrap().particles(0).to_vec();
    assert_eq!(before.len(), 4);
    engine.update(0.0);

    let effect = engine.instance(aura).unwrap().effect().unwrap();
    assert_eq!(effect.particles(0), before.as_slice());
    assert!(!effect.frame().sprites.is_empty());
    for sprite in &effect.frame().sprites {
        assert!((sprite.position - Vec3::new(3.0, 1.0, 0.0)).length() < 1.0);
    }

    for _ in 0..5 {
        engine.update(33.0);
    }
    let effect = engine.instance(aura).unwrap().effect().unwrap();
    assert_eq!(effect.particles(0), before.as_slice());
}

#[test]
fn repeated_loads_share_cached_assets() {
    let (_dir, mut engine, ids) = scene_engine();
    let other = engine.create_instance(InstanceKind::SkinnedMesh).unwrap();
    engine.load_model(other, "chara/hero").unwrap();
    let first = engine.instance(ids["hero"]).unwrap().model().unwrap().clone();
    let second = engine.instance(other).unwrap().model().unwrap().clone();
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(engine.cache().model_count(), 2);
}

#[test]
fn mismatched_motion_leaves_the_instance_untouched() {
    let (_dir, mut engine, ids) = scene_engine();
    let hero = ids["hero"];
    match engine.load_motion(hero, "short") {
        Err(EngineError::Load(err)) => assert!(err.is_structural()),
        other => panic!("expected a structural load error, got {other:?}"),
    }
    assert_eq!(engine.instance(hero).unwrap().motion().unwrap().name, "idle");
}

#[test]
fn height_query_on_the_field() {
    let (_dir, mut engine, ids) = scene_engine();
    let height = engine.calc_height(ids["field"], 2.0, -2.0).unwrap().unwrap();
    assert!((height - 0.5).abs() < 1e-4);
}

#[test]
fn opaque_instances_sort_nearest_first() {
    let mut archive = MemoryArchive::new();
    archive.insert("map/tile/tile.POL", common::pol_quad(1.0, 0.0, 0, &[]));
    let mut engine = ReignEngine::with_archive(EngineConfig::default(), Arc::new(archive));

    let mut ids = Vec::new();
    for z in [-20.0, -1.0, -10.0] {
        let id = engine.create_instance(InstanceKind::StaticMesh).unwrap();
        engine.load_model(id, "map/tile").unwrap();
        engine.set_position(id, Vec3::new(0.0, 0.0, z)).unwrap();
        ids.push(id);
    }
    let hidden = engine.create_instance(InstanceKind::StaticMesh).unwrap();
    engine.load_model(hidden, "map/tile").unwrap();
    engine.instance_mut(hidden).unwrap().draw.visible = false;

    let list = DrawList::from_instances(engine.instances(), &engine.camera);
    let order: Vec<_> = list.opaque.iter().map(|item| item.id).collect();
    assert_eq!(order, vec![ids[1], ids[2], ids[0]]);
    assert!(list.transparent.is_empty());

    engine.set_alpha(ids[1], 0.5).unwrap();
    let list = DrawList::from_instances(engine.instances(), &engine.camera);
    assert_eq!(list.opaque.len(), 2);
    assert_eq!(list.transparent[0].id, ids[1]);
}
