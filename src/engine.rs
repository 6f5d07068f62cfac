//! The engine facade: one scene with its instances, camera, background
//! layers and the asset cache they load from.

use std::sync::Arc;

use glam::{Vec2, Vec3};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::animation::{frames_for, PlaybackState, DEFAULT_FPS};
use crate::archive::Archive;
use crate::assets::{AssetCache, Texture};
use crate::error::EngineError;
use crate::instance::{Column, DrawFlags, EffectTargets, Instance, InstanceId, InstanceKind, InstanceTable};
use crate::particle::ParticleEffectState;
use crate::render::{Camera, RenderOptions};

/// Number of background CG layers drawn behind the scene.
pub const MAX_BACKGROUND_LAYERS: usize = 16;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub capacity: usize,
    pub frames_per_second: f32,
    pub shadow_map_size: u32,
    pub height_map_size: u32,
    /// Base seed for particle randomisation.
    pub seed: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            capacity: 256,
            frames_per_second: DEFAULT_FPS,
            shadow_map_size: 2048,
            height_map_size: 512,
            seed: 0x5eed,
        }
    }
}

/// A full-screen image layer behind the 3D scene.
#[derive(Debug, Clone)]
pub struct BackgroundLayer {
    pub image: Option<u32>,
    pub texture: Option<Arc<Texture>>,
    /// Offset in pixels from the top-left corner.
    pub position: Vec2,
    pub scale: Vec2,
    /// Opacity, 0..=1.
    pub blend_rate: f32,
    pub visible: bool,
}

impl Default for BackgroundLayer {
    fn default() -> Self {
        Self {
            image: None,
            texture: None,
            position: Vec2::ZERO,
            scale: Vec2::ONE,
            blend_rate: 1.0,
            visible: false,
        }
    }
}

impl BackgroundLayer {
    pub fn is_drawn(&self) -> bool {
        self.visible && self.blend_rate > 0.0 && self.texture.is_some()
    }
}

pub struct ReignEngine {
    config: EngineConfig,
    cache: Arc<AssetCache>,
    instances: InstanceTable,
    pub camera: Camera,
    pub options: RenderOptions,
    backgrounds: Vec<BackgroundLayer>,
    effects_loaded: u64,
    ticks: u64,
}

impl ReignEngine {
    pub fn new(config: EngineConfig, cache: Arc<AssetCache>) -> Self {
        info!(
            "engine created: {} instance slots at {} fps",
            config.capacity, config.frames_per_second
        );
        Self {
            instances: InstanceTable::new(config.capacity),
            config,
            cache,
            camera: Camera::default(),
            options: RenderOptions::default(),
            backgrounds: vec![BackgroundLayer::default(); MAX_BACKGROUND_LAYERS],
            effects_loaded: 0,
            ticks: 0,
        }
    }

    pub fn with_archive(config: EngineConfig, archive: Arc<dyn Archive>) -> Self {
        Self::new(config, Arc::new(AssetCache::new(archive)))
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn cache(&self) -> &Arc<AssetCache> {
        &self.cache
    }

    pub fn instances(&self) -> &InstanceTable {
        &self.instances
    }

    /// Number of completed [`ReignEngine::update`] calls.
    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    pub fn instance(&self, id: InstanceId) -> Result<&Instance, EngineError> {
        self.instances.require(id)
    }

    pub fn instance_mut(&mut self, id: InstanceId) -> Result<&mut Instance, EngineError> {
        self.instances.require_mut(id)
    }

    pub fn create_instance(&mut self, kind: InstanceKind) -> Result<InstanceId, EngineError> {
        let id = self.instances.create(kind)?;
        debug!("created instance {id}");
        Ok(id)
    }

    pub fn release_instance(&mut self, id: InstanceId) -> Result<(), EngineError> {
        self.instances.release(id)?;
        for instance in self.instances.iter_mut() {
            instance.effect_targets.retain(|target| *target != id);
        }
        debug!("released instance {id}");
        Ok(())
    }

    pub fn set_position(&mut self, id: InstanceId, position: Vec3) -> Result<(), EngineError> {
        self.instance_mut(id)?.set_position(position);
        Ok(())
    }

    /// Pitch, yaw and roll in degrees.
    pub fn set_rotation(&mut self, id: InstanceId, rotation: Vec3) -> Result<(), EngineError> {
        self.instance_mut(id)?.set_rotation(rotation);
        Ok(())
    }

    pub fn set_scale(&mut self, id: InstanceId, scale: Vec3) -> Result<(), EngineError> {
        self.instance_mut(id)?.set_scale(scale);
        Ok(())
    }

    pub fn set_draw_flags(&mut self, id: InstanceId, flags: DrawFlags) -> Result<(), EngineError> {
        self.instance_mut(id)?.draw = flags;
        Ok(())
    }

    pub fn set_ambient(&mut self, id: InstanceId, color: Vec3) -> Result<(), EngineError> {
        self.instance_mut(id)?.ambient = color;
        Ok(())
    }

    pub fn set_diffuse(&mut self, id: InstanceId, color: Vec3) -> Result<(), EngineError> {
        self.instance_mut(id)?.diffuse = color;
        Ok(())
    }

    pub fn set_alpha(&mut self, id: InstanceId, alpha: f32) -> Result<(), EngineError> {
        self.instance_mut(id)?.alpha = alpha.clamp(0.0, 1.0);
        Ok(())
    }

    pub fn set_column(&mut self, id: InstanceId, column: Column) -> Result<(), EngineError> {
        self.instance_mut(id)?.column = column;
        Ok(())
    }

    /// Replaces the point list of a path-line instance.
    pub fn set_path_points(&mut self, id: InstanceId, points: Vec<Vec3>) -> Result<(), EngineError> {
        let instance = self.instance_mut(id)?;
        match instance.kind_mut() {
            InstanceKind::PathLine(current) => {
                *current = points;
                Ok(())
            }
            other => Err(EngineError::WrongKind {
                id,
                kind: other.name(),
                action: "hold path points",
            }),
        }
    }

    /// Loads the model at `path` into a mesh or billboard instance.
    pub fn load_model(&mut self, id: InstanceId, path: &str) -> Result<(), EngineError> {
        let accepts = self.instance(id)?.kind().accepts_model();
        if !accepts {
            let kind = self.instance(id)?.kind().name();
            return Err(EngineError::WrongKind {
                id,
                kind,
                action: "hold a model",
            });
        }
        let model = self.cache.load_model(path)?;
        self.instance_mut(id)?.set_model(model)
    }

    /// Loads motion `name` from the instance's model directory as its
    /// current motion.
    pub fn load_motion(&mut self, id: InstanceId, name: &str) -> Result<(), EngineError> {
        let model = self.instance(id)?.model().cloned().ok_or(EngineError::NoModel(id))?;
        let motion = self.cache.load_motion(&model, name)?;
        self.instance_mut(id)?.set_motion(motion);
        Ok(())
    }

    /// Loads the motion blended towards while motion blending is enabled.
    pub fn load_next_motion(&mut self, id: InstanceId, name: &str) -> Result<(), EngineError> {
        let model = self.instance(id)?.model().cloned().ok_or(EngineError::NoModel(id))?;
        let motion = self.cache.load_motion(&model, name)?;
        self.instance_mut(id)?.set_next_motion(Some(motion));
        Ok(())
    }

    pub fn set_motion_blend(&mut self, id: InstanceId, enabled: bool, rate: f32) -> Result<(), EngineError> {
        let instance = self.instance_mut(id)?;
        instance.motion_blend = enabled;
        instance.blend_rate = rate.clamp(0.0, 1.0);
        Ok(())
    }

    pub fn swap_motions(&mut self, id: InstanceId) -> Result<(), EngineError> {
        self.instance_mut(id)?.swap_motions();
        Ok(())
    }

    pub fn set_motion_state(&mut self, id: InstanceId, state: PlaybackState) -> Result<(), EngineError> {
        let instance = self.instance_mut(id)?;
        if let Some(motion) = instance.motion_mut() {
            motion.playback.state = state;
        } else if let Some(effect) = instance.effect_mut() {
            effect.playback.state = state;
        }
        Ok(())
    }

    pub fn set_motion_frame(&mut self, id: InstanceId, frame: f32) -> Result<(), EngineError> {
        let instance = self.instance_mut(id)?;
        if let Some(motion) = instance.motion_mut() {
            motion.playback.set_frame(frame);
            instance.refresh_pose();
        } else if let Some(effect) = instance.effect_mut() {
            effect.playback.set_frame(frame);
        }
        Ok(())
    }

    pub fn set_motion_frame_range(&mut self, id: InstanceId, begin: f32, end: f32) -> Result<(), EngineError> {
        let instance = self.instance_mut(id)?;
        if let Some(motion) = instance.motion_mut() {
            motion.playback.set_frame_range(begin, end);
        } else if let Some(effect) = instance.effect_mut() {
            effect.playback.set_frame_range(begin, end);
        }
        Ok(())
    }

    pub fn set_motion_loop_range(&mut self, id: InstanceId, begin: f32, end: f32) -> Result<(), EngineError> {
        let instance = self.instance_mut(id)?;
        if let Some(motion) = instance.motion_mut() {
            motion.playback.set_loop_range(begin, end);
        } else if let Some(effect) = instance.effect_mut() {
            effect.playback.set_loop_range(begin, end);
        }
        Ok(())
    }

    /// Current frame of the instance's motion or effect.
    pub fn motion_frame(&self, id: InstanceId) -> Result<Option<f32>, EngineError> {
        let instance = self.instance(id)?;
        Ok(instance
            .motion()
            .map(|motion| motion.playback.frame)
            .or_else(|| instance.effect().map(|effect| effect.playback.frame)))
    }

    /// Loads a particle script into a particle-effect instance. Each load
    /// gets its own random seed.
    pub fn load_effect(&mut self, id: InstanceId, path: &str) -> Result<(), EngineError> {
        let kind = self.instance(id)?.kind().clone();
        if kind != InstanceKind::ParticleEffect {
            return Err(EngineError::WrongKind {
                id,
                kind: kind.name(),
                action: "hold a particle effect",
            });
        }
        let effect = self.cache.load_particle_effect(path)?;
        let seed = self.config.seed.wrapping_add(self.effects_loaded);
        self.effects_loaded += 1;
        self.instance_mut(id)?
            .set_effect(ParticleEffectState::new(effect, seed))
    }

    /// Instances that target-relative and bone-relative particle units
    /// refer to, by target index.
    pub fn set_effect_targets(&mut self, id: InstanceId, targets: Vec<InstanceId>) -> Result<(), EngineError> {
        for target in &targets {
            self.instance(*target)?;
        }
        self.instance_mut(id)?.effect_targets = targets;
        Ok(())
    }

    pub fn set_camera_quake(&mut self, id: InstanceId, enabled: bool) -> Result<(), EngineError> {
        let instance = self.instance_mut(id)?;
        let kind = instance.kind().name();
        let effect = instance.effect_mut().ok_or(EngineError::WrongKind {
            id,
            kind,
            action: "shake the camera without an effect",
        })?;
        effect.camera_quake_enabled = enabled;
        Ok(())
    }

    pub fn backgrounds(&self) -> &[BackgroundLayer] {
        &self.backgrounds
    }

    pub fn background_mut(&mut self, layer: usize) -> Option<&mut BackgroundLayer> {
        self.backgrounds.get_mut(layer)
    }

    /// Shows numbered CG `image` on background `layer`. Out-of-range layers
    /// are ignored with a warning.
    pub fn set_background_image(&mut self, layer: usize, image: u32) -> Result<(), EngineError> {
        if layer >= self.backgrounds.len() {
            warn!("background layer {layer} is out of range");
            return Ok(());
        }
        let texture = self.cache.load_background(image)?;
        let background = &mut self.backgrounds[layer];
        background.image = Some(image);
        background.texture = Some(texture);
        background.visible = true;
        Ok(())
    }

    /// Advances the scene by `elapsed_ms`.
    ///
    /// All skeletons are evaluated before any particle effect so bone
    /// anchored particles see this tick's poses.
    pub fn update(&mut self, elapsed_ms: f32) {
        let delta = frames_for(elapsed_ms, self.config.frames_per_second);

        for instance in self.instances.iter_mut() {
            instance.update_animation(delta);
        }

        let mut quake = Vec2::ZERO;
        for id in self.instances.ids() {
            let Some(instance) = self.instances.get_mut(id) else {
                continue;
            };
            let Some(mut effect) = instance.take_effect() else {
                continue;
            };
            let origin = instance.position();
            let targets = std::mem::take(&mut instance.effect_targets);
            {
                let resolver = EffectTargets {
                    table: &self.instances,
                    targets: &targets,
                };
                effect.update(delta, origin, &resolver);
            }
            if let Some(offset) = effect.frame().quake {
                quake += offset;
            }
            if let Some(instance) = self.instances.get_mut(id) {
                instance.effect_targets = targets;
                instance.restore_effect(effect);
            }
        }
        self.camera.quake = quake;
        self.ticks += 1;
    }

    /// Ground height under world `(x, z)` on the instance's model.
    pub fn calc_height(&mut self, id: InstanceId, x: f32, z: f32) -> Result<Option<f32>, EngineError> {
        let instance = self.instance_mut(id)?;
        let transform = instance.transform();
        let collider = instance.collider().ok_or(EngineError::NoModel(id))?;
        Ok(collider.height_at_world(&transform, x, z))
    }

    /// Path finding over the instance's model. Not implemented; always
    /// `None`.
    pub fn find_path(&mut self, id: InstanceId, from: Vec3, to: Vec3) -> Result<Option<Vec<Vec3>>, EngineError> {
        let instance = self.instance_mut(id)?;
        let collider = instance.collider().ok_or(EngineError::NoModel(id))?;
        Ok(collider.find_path(from, to))
    }

    /// First directional light instance, if any.
    pub fn directional_light(&self) -> Option<(&Instance, crate::instance::Light)> {
        self.instances.iter().find_map(|instance| match instance.kind() {
            InstanceKind::DirectionalLight(light) => Some((instance, *light)),
            _ => None,
        })
    }

    /// First specular light instance, if any.
    pub fn specular_light(&self) -> Option<crate::instance::Light> {
        self.instances.iter().find_map(|instance| match instance.kind() {
            InstanceKind::SpecularLight(light) => Some(*light),
            _ => None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::MemoryArchive;
    use crate::assets::encode_png;
    use crate::formats::testdata::{MotBuilder, PolBuilder, TestMesh};

    fn archive() -> MemoryArchive {
        let mut archive = MemoryArchive::new();
        archive.insert(
            "chara/hero/hero.POL",
            PolBuilder::new(1)
                .material("plain", &[])
                .mesh(TestMesh::quad("body", 0).weighted(&[(0, 1.0)]))
                .bone_chain(3)
                .build(),
        );
        archive.insert("chara/hero/idle.MOT", MotBuilder::new(10).rest_chain(3).build());
        archive.insert("chara/hero/run.MOT", MotBuilder::new(10).rest_chain(3).build());
        archive.insert("chara/hero/short.MOT", MotBuilder::new(10).rest_chain(2).build());
        archive.insert(
            "map/field/field.POL",
            PolBuilder::new(1)
                .material("ground", &[])
                .mesh(TestMesh::quad("ground", 0).sized(4.0).at_height(0.5))
                .build(),
        );
        archive.insert(
            "fx/aura/aura.pae",
            "object \"glow\" = { 位置 = (ターゲット(0, 0, 1, 0)), フレーム = 0, 20, パーティクル数 = 3 }\n\
             object \"shake\" = { 種類 = カメラ振動, フレーム = 0, 20, 振幅 = 2, 2, 周期 = 8 }",
        );
        archive.insert_numbered(1, encode_png(4, 4, 255));
        archive
    }

    fn engine(capacity: usize) -> ReignEngine {
        let config = EngineConfig {
            capacity,
            ..EngineConfig::default()
        };
        ReignEngine::with_archive(config, Arc::new(archive()))
    }

    #[test]
    fn capacity_failures_create_nothing() {
        let mut engine = engine(1);
        engine.create_instance(InstanceKind::StaticMesh).unwrap();
        let err = engine.create_instance(InstanceKind::StaticMesh).unwrap_err();
        assert!(matches!(err, EngineError::CapacityExceeded(1)));
        assert_eq!(engine.instances().len(), 1);
    }

    #[test]
    fn skinned_instance_animates() {
        let mut engine = engine(4);
        let hero = engine.create_instance(InstanceKind::SkinnedMesh).unwrap();
        engine.load_model(hero, "chara/hero").unwrap();
        engine.load_motion(hero, "idle").unwrap();
        engine.set_motion_state(hero, PlaybackState::Loop).unwrap();
        engine.update(100.0);
        assert_eq!(engine.motion_frame(hero).unwrap(), Some(3.0));
        assert_eq!(engine.instance(hero).unwrap().pose().unwrap().len(), 3);
        assert_eq!(engine.ticks(), 1);
    }

    #[test]
    fn motion_with_wrong_bone_count_is_structural() {
        let mut engine = engine(4);
        let hero = engine.create_instance(InstanceKind::SkinnedMesh).unwrap();
        engine.load_model(hero, "chara/hero").unwrap();
        let err = engine.load_motion(hero, "short").unwrap_err();
        match err {
            EngineError::Load(load) => assert!(load.is_structural()),
            other => panic!("unexpected error {other:?}"),
        }
        assert!(engine.instance(hero).unwrap().motion().is_none());
    }

    #[test]
    fn motions_need_a_model() {
        let mut engine = engine(2);
        let id = engine.create_instance(InstanceKind::SkinnedMesh).unwrap();
        assert!(matches!(
            engine.load_motion(id, "idle"),
            Err(EngineError::NoModel(_))
        ));
        let light = engine
            .create_instance(InstanceKind::DirectionalLight(Default::default()))
            .unwrap();
        assert!(matches!(
            engine.load_model(light, "chara/hero"),
            Err(EngineError::WrongKind { .. })
        ));
    }

    #[test]
    fn blending_and_swapping_motions() {
        let mut engine = engine(2);
        let hero = engine.create_instance(InstanceKind::SkinnedMesh).unwrap();
        engine.load_model(hero, "chara/hero").unwrap();
        engine.load_motion(hero, "idle").unwrap();
        engine.load_next_motion(hero, "run").unwrap();
        engine.set_motion_blend(hero, true, 2.0).unwrap();
        assert_eq!(engine.instance(hero).unwrap().blend_rate, 1.0);
        engine.update(33.0);
        engine.swap_motions(hero).unwrap();
        let instance = engine.instance(hero).unwrap();
        assert_eq!(instance.motion().unwrap().name, "run");
        assert!(instance.next_motion().is_none());
    }

    #[test]
    fn effects_follow_their_targets() {
        let mut engine = engine(4);
        let hero = engine.create_instance(InstanceKind::SkinnedMesh).unwrap();
        engine.set_position(hero, Vec3::new(3.0, 0.0, 0.0)).unwrap();
        let fx = engine.create_instance(InstanceKind::ParticleEffect).unwrap();
        engine.load_effect(fx, "fx/aura").unwrap();
        engine.set_effect_targets(fx, vec![hero]).unwrap();
        engine.update(0.0);
        let frame = engine.instance(fx).unwrap().effect().unwrap().frame().clone();
        assert_eq!(frame.sprites.len(), 3);
        for sprite in &frame.sprites {
            assert!((sprite.position - Vec3::new(3.0, 1.0, 0.0)).length() < 1e-4);
        }
        assert_eq!(engine.instance(fx).unwrap().effect_targets, vec![hero]);

        engine.release_instance(hero).unwrap();
        assert!(engine.instance(fx).unwrap().effect_targets.is_empty());
    }

    #[test]
    fn camera_quake_only_when_enabled() {
        let mut engine = engine(2);
        let fx = engine.create_instance(InstanceKind::ParticleEffect).unwrap();
        engine.load_effect(fx, "fx/aura").unwrap();
        engine.update(100.0);
        assert_eq!(engine.camera.quake, Vec2::ZERO);
        engine.set_camera_quake(fx, true).unwrap();
        engine.update(100.0);
        assert_ne!(engine.camera.quake, Vec2::ZERO);
    }

    #[test]
    fn height_queries_use_the_collider() {
        let mut engine = engine(2);
        let field = engine.create_instance(InstanceKind::StaticMesh).unwrap();
        engine.load_model(field, "map/field").unwrap();
        engine.set_position(field, Vec3::new(0.0, 1.0, 0.0)).unwrap();
        let height = engine.calc_height(field, 1.0, -1.0).unwrap().unwrap();
        assert!((height - 1.5).abs() < 1e-4);
        assert_eq!(engine.calc_height(field, 10.0, 10.0).unwrap(), None);
        assert!(engine
            .find_path(field, Vec3::ZERO, Vec3::ONE)
            .unwrap()
            .is_none());
    }

    #[test]
    fn background_layers() {
        let mut engine = engine(1);
        engine.set_background_image(2, 1).unwrap();
        assert!(engine.backgrounds()[2].is_drawn());
        assert!(!engine.backgrounds()[0].is_drawn());
        engine.set_background_image(MAX_BACKGROUND_LAYERS, 1).unwrap();
        assert!(engine.set_background_image(3, 99).is_err());
        engine.background_mut(2).unwrap().blend_rate = 0.0;
        assert!(!engine.backgrounds()[2].is_drawn());
    }
}
