//! Scene instances and the fixed-capacity table that owns them.

use std::cell::Cell;
use std::fmt;
use std::sync::Arc;

use glam::{EulerRot, Mat4, Quat, Vec3};
use log::warn;
use serde::{Deserialize, Serialize};

use crate::animation::{evaluate_skeleton, sample_blended, Motion, SkeletonPose};
use crate::assets::Model;
use crate::collider::Collider;
use crate::error::EngineError;
use crate::geometry::BoundingSphere;
use crate::particle::{ParticleEffectState, TargetResolver};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InstanceId(pub u32);

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Cylinder around an instance used by target-relative particle units.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Column {
    pub radius: f32,
    pub height: f32,
    /// Degrees around Y.
    pub angle: f32,
}

impl Default for Column {
    fn default() -> Self {
        Self {
            radius: 1.0,
            height: 1.0,
            angle: 0.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Light {
    /// Direction the light travels in.
    pub direction: Vec3,
    pub color: Vec3,
}

impl Default for Light {
    fn default() -> Self {
        Self {
            direction: Vec3::new(-0.5, -1.0, -0.5).normalize(),
            color: Vec3::ONE,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum InstanceKind {
    StaticMesh,
    SkinnedMesh,
    /// Camera-facing model.
    Billboard,
    DirectionalLight(Light),
    SpecularLight(Light),
    ParticleEffect,
    /// Debug polyline through world-space points.
    PathLine(Vec<Vec3>),
}

impl InstanceKind {
    pub fn name(&self) -> &'static str {
        match self {
            InstanceKind::StaticMesh => "static mesh",
            InstanceKind::SkinnedMesh => "skinned mesh",
            InstanceKind::Billboard => "billboard",
            InstanceKind::DirectionalLight(_) => "directional light",
            InstanceKind::SpecularLight(_) => "specular light",
            InstanceKind::ParticleEffect => "particle effect",
            InstanceKind::PathLine(_) => "path line",
        }
    }

    /// Parses the kind names used by scene files.
    pub fn from_name(name: &str) -> Option<Self> {
        Some(match name.trim().to_ascii_lowercase().as_str() {
            "mesh" | "static" | "static_mesh" => InstanceKind::StaticMesh,
            "skinned" | "skinned_mesh" | "character" => InstanceKind::SkinnedMesh,
            "billboard" => InstanceKind::Billboard,
            "light" | "directional_light" => InstanceKind::DirectionalLight(Light::default()),
            "specular_light" => InstanceKind::SpecularLight(Light::default()),
            "effect" | "particle" | "particle_effect" => InstanceKind::ParticleEffect,
            "path" | "path_line" => InstanceKind::PathLine(Vec::new()),
            _ => return None,
        })
    }

    pub fn accepts_model(&self) -> bool {
        match self {
            InstanceKind::StaticMesh | InstanceKind::SkinnedMesh | InstanceKind::Billboard => true,
            InstanceKind::DirectionalLight(_)
            | InstanceKind::SpecularLight(_)
            | InstanceKind::ParticleEffect
            | InstanceKind::PathLine(_) => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DrawFlags {
    pub visible: bool,
    pub cast_shadow: bool,
    pub lighting: bool,
    pub fog: bool,
    pub outline: bool,
    /// Characters get outlines in the characters-only edge mode.
    pub character: bool,
}

impl Default for DrawFlags {
    fn default() -> Self {
        Self {
            visible: true,
            cast_shadow: true,
            lighting: true,
            fog: true,
            outline: true,
            character: false,
        }
    }
}

/// One slot of the instance table.
#[derive(Debug)]
pub struct Instance {
    id: InstanceId,
    kind: InstanceKind,
    model: Option<Arc<Model>>,
    motion: Option<Motion>,
    next_motion: Option<Motion>,
    pub motion_blend: bool,
    /// Weight of the next motion while blending, 0..=1.
    pub blend_rate: f32,
    effect: Option<ParticleEffectState>,
    pub effect_targets: Vec<InstanceId>,
    position: Vec3,
    /// Pitch, yaw and roll in degrees.
    rotation: Vec3,
    scale: Vec3,
    pub draw: DrawFlags,
    pub ambient: Vec3,
    pub diffuse: Vec3,
    pub alpha: f32,
    pub column: Column,
    local_transform: Cell<Mat4>,
    dirty: Cell<bool>,
    pose: Option<SkeletonPose>,
    collider: Option<Collider>,
}

impl Instance {
    fn new(id: InstanceId, kind: InstanceKind) -> Self {
        let draw = DrawFlags {
            character: kind == InstanceKind::SkinnedMesh,
            ..DrawFlags::default()
        };
        Self {
            id,
            kind,
            model: None,
            motion: None,
            next_motion: None,
            motion_blend: false,
            blend_rate: 0.0,
            effect: None,
            effect_targets: Vec::new(),
            position: Vec3::ZERO,
            rotation: Vec3::ZERO,
            scale: Vec3::ONE,
            draw,
            ambient: Vec3::splat(0.3),
            diffuse: Vec3::ONE,
            alpha: 1.0,
            column: Column::default(),
            local_transform: Cell::new(Mat4::IDENTITY),
            dirty: Cell::new(true),
            pose: None,
            collider: None,
        }
    }

    pub fn id(&self) -> InstanceId {
        self.id
    }

    pub fn kind(&self) -> &InstanceKind {
        &self.kind
    }

    pub fn kind_mut(&mut self) -> &mut InstanceKind {
        &mut self.kind
    }

    pub fn position(&self) -> Vec3 {
        self.position
    }

    pub fn rotation(&self) -> Vec3 {
        self.rotation
    }

    pub fn scale(&self) -> Vec3 {
        self.scale
    }

    pub fn set_position(&mut self, position: Vec3) {
        self.position = position;
        self.dirty.set(true);
    }

    pub fn set_rotation(&mut self, rotation: Vec3) {
        self.rotation = rotation;
        self.dirty.set(true);
    }

    pub fn set_scale(&mut self, scale: Vec3) {
        self.scale = scale;
        self.dirty.set(true);
    }

    /// Translation, yaw, pitch, roll, then scale. Recomputed only after a
    /// spatial property changed.
    pub fn transform(&self) -> Mat4 {
        if self.dirty.get() {
            let rotation = Quat::from_euler(
                EulerRot::YXZ,
                self.rotation.y.to_radians(),
                self.rotation.x.to_radians(),
                self.rotation.z.to_radians(),
            );
            self.local_transform.set(Mat4::from_scale_rotation_translation(
                self.scale,
                rotation,
                self.position,
            ));
            self.dirty.set(false);
        }
        self.local_transform.get()
    }

    pub fn model(&self) -> Option<&Arc<Model>> {
        self.model.as_ref()
    }

    /// Binds a model, dropping motions and derived state of the old one.
    pub fn set_model(&mut self, model: Arc<Model>) -> Result<(), EngineError> {
        if !self.kind.accepts_model() {
            return Err(EngineError::WrongKind {
                id: self.id,
                kind: self.kind.name(),
                action: "hold a model",
            });
        }
        self.model = Some(model);
        self.motion = None;
        self.next_motion = None;
        self.pose = None;
        self.collider = None;
        Ok(())
    }

    pub fn motion(&self) -> Option<&Motion> {
        self.motion.as_ref()
    }

    pub fn motion_mut(&mut self) -> Option<&mut Motion> {
        self.motion.as_mut()
    }

    pub fn next_motion(&self) -> Option<&Motion> {
        self.next_motion.as_ref()
    }

    pub fn next_motion_mut(&mut self) -> Option<&mut Motion> {
        self.next_motion.as_mut()
    }

    /// Binds `motion` and evaluates the skeleton at its current frame.
    pub fn set_motion(&mut self, motion: Motion) {
        self.motion = Some(motion);
        self.refresh_pose();
    }

    pub fn set_next_motion(&mut self, motion: Option<Motion>) {
        self.next_motion = motion;
    }

    /// Promotes the next motion to current and ends blending.
    pub fn swap_motions(&mut self) {
        if let Some(next) = self.next_motion.take() {
            self.motion = Some(next);
        }
        self.motion_blend = false;
        self.blend_rate = 0.0;
        self.refresh_pose();
    }

    pub fn clear_motions(&mut self) {
        self.motion = None;
        self.next_motion = None;
        self.pose = None;
    }

    /// Present exactly when the model has bones and a motion is bound;
    /// then holds one matrix per model bone.
    pub fn pose(&self) -> Option<&SkeletonPose> {
        self.pose.as_ref()
    }

    /// Advances motion playback by `delta` frames and re-evaluates the
    /// skeleton.
    pub fn update_animation(&mut self, delta: f32) {
        if self.model.as_ref().is_some_and(|model| model.has_bones()) {
            if let Some(motion) = self.motion.as_mut() {
                motion.playback.advance(delta);
                if let Some(next) = self.next_motion.as_mut() {
                    next.playback.advance(delta);
                }
            }
        }
        self.refresh_pose();
    }

    /// Re-evaluates the skeleton at the current playback frames.
    pub fn refresh_pose(&mut self) {
        let (Some(model), Some(motion)) = (self.model.as_ref(), self.motion.as_ref()) else {
            self.pose = None;
            return;
        };
        if !model.has_bones() {
            self.pose = None;
            return;
        }
        let next = match (&self.next_motion, self.motion_blend) {
            (Some(next), true) => Some((next, self.blend_rate)),
            _ => None,
        };
        let locals = sample_blended(model, motion, next);
        self.pose = Some(evaluate_skeleton(model, &locals));
    }

    pub fn effect(&self) -> Option<&ParticleEffectState> {
        self.effect.as_ref()
    }

    pub fn effect_mut(&mut self) -> Option<&mut ParticleEffectState> {
        self.effect.as_mut()
    }

    pub fn set_effect(&mut self, effect: ParticleEffectState) -> Result<(), EngineError> {
        if self.kind != InstanceKind::ParticleEffect {
            return Err(EngineError::WrongKind {
                id: self.id,
                kind: self.kind.name(),
                action: "hold a particle effect",
            });
        }
        self.effect = Some(effect);
        Ok(())
    }

    pub(crate) fn take_effect(&mut self) -> Option<ParticleEffectState> {
        self.effect.take()
    }

    pub(crate) fn restore_effect(&mut self, effect: ParticleEffectState) {
        self.effect = Some(effect);
    }

    /// World position of the named bone, posed if animated.
    pub fn bone_world_position(&self, name: &str) -> Option<Vec3> {
        let model = self.model.as_ref()?;
        let index = model.bone_index(name)?;
        let local = match &self.pose {
            Some(pose) => pose.bone_position(index)?,
            None => model.bones[index].inverse_bind.inverse().w_axis.truncate(),
        };
        Some(self.transform().transform_point3(local))
    }

    /// Collider built from the model on first use.
    pub fn collider(&mut self) -> Option<&Collider> {
        if self.collider.is_none() {
            let model = self.model.as_ref()?;
            self.collider = Some(Collider::from_model(model));
        }
        self.collider.as_ref()
    }

    /// World-space bounds used for depth sorting and shadow fitting.
    pub fn bounding_sphere(&self) -> BoundingSphere {
        match &self.model {
            Some(model) if !model.aabb.is_empty() => {
                model.aabb.transformed(&self.transform()).bounding_sphere()
            }
            _ => BoundingSphere {
                center: self.position,
                radius: 0.0,
            },
        }
    }
}

/// Fixed-capacity registry of scene instances.
#[derive(Debug)]
pub struct InstanceTable {
    slots: Vec<Option<Instance>>,
}

impl InstanceTable {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: (0..capacity).map(|_| None).collect(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn len(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Creates an instance in the first free slot.
    pub fn create(&mut self, kind: InstanceKind) -> Result<InstanceId, EngineError> {
        let Some(index) = self.slots.iter().position(Option::is_none) else {
            warn!(
                "cannot create {}: instance table is full ({})",
                kind.name(),
                self.capacity()
            );
            return Err(EngineError::CapacityExceeded(self.capacity()));
        };
        let id = InstanceId(index as u32);
        self.slots[index] = Some(Instance::new(id, kind));
        Ok(id)
    }

    /// Destroys an instance, dropping its model, motions and effect.
    pub fn release(&mut self, id: InstanceId) -> Result<(), EngineError> {
        match self.slots.get_mut(id.0 as usize) {
            Some(slot @ Some(_)) => {
                *slot = None;
                Ok(())
            }
            _ => Err(EngineError::UnknownInstance(id)),
        }
    }

    pub fn get(&self, id: InstanceId) -> Option<&Instance> {
        self.slots.get(id.0 as usize)?.as_ref()
    }

    pub fn get_mut(&mut self, id: InstanceId) -> Option<&mut Instance> {
        self.slots.get_mut(id.0 as usize)?.as_mut()
    }

    pub fn require(&self, id: InstanceId) -> Result<&Instance, EngineError> {
        self.get(id).ok_or(EngineError::UnknownInstance(id))
    }

    pub fn require_mut(&mut self, id: InstanceId) -> Result<&mut Instance, EngineError> {
        self.get_mut(id).ok_or(EngineError::UnknownInstance(id))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Instance> {
        self.slots.iter().flatten()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Instance> {
        self.slots.iter_mut().flatten()
    }

    pub fn ids(&self) -> Vec<InstanceId> {
        self.iter().map(Instance::id).collect()
    }

    pub fn clear(&mut self) {
        for slot in &mut self.slots {
            *slot = None;
        }
    }
}

/// Resolves an effect's target list against the table.
pub struct EffectTargets<'a> {
    pub table: &'a InstanceTable,
    pub targets: &'a [InstanceId],
}

impl EffectTargets<'_> {
    fn target(&self, index: usize) -> Option<&Instance> {
        self.table.get(*self.targets.get(index)?)
    }
}

impl TargetResolver for EffectTargets<'_> {
    fn target_position(&self, target: usize) -> Option<Vec3> {
        self.target(target).map(Instance::position)
    }

    fn target_column(&self, target: usize) -> Option<Column> {
        self.target(target).map(|instance| instance.column)
    }

    fn bone_position(&self, target: usize, bone: &str) -> Option<Vec3> {
        self.target(target)?.bone_world_position(bone)
    }
}
