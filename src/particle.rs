//! Particle effect simulation.
//!
//! Every random quantity (lifetimes, random offsets, emitter angles) is
//! rolled once when the effect state is created, so evaluating the same
//! frame twice always yields the same particles.

use std::f32::consts::TAU;
use std::sync::Arc;

use glam::{EulerRot, Quat, Vec2, Vec3};
use log::debug;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::animation::{Playback, PlaybackState};
use crate::assets::ParticleEffect;
use crate::instance::Column;
use crate::pae::{BlendType, MoveType, ParticleObject, ParticleType, PositionFormula, PositionUnit};

/// World queries needed to resolve target- and bone-relative positions.
pub trait TargetResolver {
    fn target_position(&self, target: usize) -> Option<Vec3>;
    fn target_column(&self, target: usize) -> Option<Column>;
    /// World position of `bone` on the `target`-th effect target.
    fn bone_position(&self, target: usize, bone: &str) -> Option<Vec3>;
}

/// Resolver for effects without targets.
pub struct NoTargets;

impl TargetResolver for NoTargets {
    fn target_position(&self, _target: usize) -> Option<Vec3> {
        None
    }

    fn target_column(&self, _target: usize) -> Option<Column> {
        None
    }

    fn bone_position(&self, _target: usize, _bone: &str) -> Option<Vec3> {
        None
    }
}

/// Randomised, creation-time parameters of one particle.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ParticleInstance {
    pub begin_frame: f32,
    pub end_frame: f32,
    /// Random offsets added to the begin and end positions.
    pub random_offsets: [Vec3; 2],
    /// Emitter roll around the up vector, degrees.
    pub roll: f32,
    /// Emitter tilt away from the up vector, degrees.
    pub pitch: f32,
}

impl ParticleInstance {
    fn life(&self) -> f32 {
        self.end_frame - self.begin_frame
    }

    fn progress(&self, frame: f32) -> f32 {
        let life = self.life();
        if life > f32::EPSILON {
            ((frame - self.begin_frame) / life).clamp(0.0, 1.0)
        } else {
            0.0
        }
    }

    fn is_alive(&self, frame: f32) -> bool {
        frame >= self.begin_frame && frame <= self.end_frame
    }
}

/// One visible particle produced by an evaluation.
#[derive(Debug, Clone, PartialEq)]
pub struct ParticleSprite {
    pub object: usize,
    pub kind: ParticleType,
    pub blend: BlendType,
    pub position: Vec3,
    /// Euler angles in degrees (X, Y, Z).
    pub rotation: Vec3,
    pub size: Vec2,
    pub alpha: f32,
    /// Index into the object's texture list.
    pub texture: Option<usize>,
}

/// Sword-blur ribbon stretched between the object's two anchors.
#[derive(Debug, Clone, PartialEq)]
pub struct ParticleBlur {
    pub object: usize,
    pub blend: BlendType,
    pub start: Vec3,
    pub end: Vec3,
    pub width: f32,
    pub alpha: f32,
    pub texture: Option<usize>,
}

/// Result of evaluating an effect at one frame.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParticleFrame {
    pub sprites: Vec<ParticleSprite>,
    pub blurs: Vec<ParticleBlur>,
    /// Camera (pitch, yaw) offset in degrees from quake objects.
    pub quake: Option<Vec2>,
}

/// Runtime state of one particle effect owned by a scene instance.
#[derive(Debug, Clone)]
pub struct ParticleEffectState {
    pub effect: Arc<ParticleEffect>,
    objects: Vec<Vec<ParticleInstance>>,
    pub playback: Playback,
    pub camera_quake_enabled: bool,
    frame: ParticleFrame,
}

impl ParticleEffectState {
    /// Rolls every particle of `effect` from `seed`.
    pub fn new(effect: Arc<ParticleEffect>, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let objects = effect
            .objects
            .iter()
            .map(|object| spawn_particles(object, &mut rng))
            .collect();
        let mut playback = Playback::new(effect.last_frame() as f32);
        playback.state = PlaybackState::PlayOnce;
        Self {
            effect,
            objects,
            playback,
            camera_quake_enabled: false,
            frame: ParticleFrame::default(),
        }
    }

    pub fn particles(&self, object: usize) -> &[ParticleInstance] {
        self.objects.get(object).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Latest evaluated frame.
    pub fn frame(&self) -> &ParticleFrame {
        &self.frame
    }

    pub fn is_finished(&self) -> bool {
        self.playback.is_finished()
    }

    /// Advances playback by `delta` frames and re-evaluates.
    pub fn update(&mut self, delta: f32, origin: Vec3, resolver: &dyn TargetResolver) {
        self.playback.advance(delta);
        self.frame = self.evaluate(origin, resolver);
    }

    /// Evaluates the effect at the current playback frame without
    /// changing any state.
    pub fn evaluate(&self, origin: Vec3, resolver: &dyn TargetResolver) -> ParticleFrame {
        let mut frame = ParticleFrame::default();
        for (index, (object, particles)) in self.effect.objects.iter().zip(&self.objects).enumerate() {
            let at = match object.stop_frame {
                Some(stop) => self.playback.frame.min(stop as f32),
                None => self.playback.frame,
            };
            if object.kind == ParticleType::CameraQuake {
                if self.camera_quake_enabled {
                    if let Some(offset) = camera_quake(object, at) {
                        *frame.quake.get_or_insert(Vec2::ZERO) += offset;
                    }
                }
                continue;
            }
            let begin = resolve_anchor(object.begin_position(), origin, resolver);
            let end = resolve_anchor(object.end_position(), origin, resolver);
            for particle in particles.iter().filter(|particle| particle.is_alive(at)) {
                let sprite = evaluate_particle(index, object, particle, begin, end, at);
                if object.kind == ParticleType::SwordBlur {
                    frame.blurs.push(ParticleBlur {
                        object: index,
                        blend: object.blend,
                        start: begin + particle.random_offsets[0],
                        end: end + particle.random_offsets[1],
                        width: sprite.size.x,
                        alpha: sprite.alpha,
                        texture: sprite.texture,
                    });
                } else {
                    frame.sprites.push(sprite);
                }
            }
        }
        frame
    }
}

fn spawn_particles(object: &ParticleObject, rng: &mut StdRng) -> Vec<ParticleInstance> {
    if object.kind == ParticleType::CameraQuake {
        return Vec::new();
    }
    let count = object.particle_count as usize;
    let (first, last) = (object.frame_range.0 as f32, object.frame_range.1 as f32);
    let single_position = object.positions.len() < 2;
    (0..count)
        .map(|index| {
            let life = match object.life {
                Some((low, high)) => low + (high - low) * rng.random::<f32>(),
                None => object.span(),
            }
            .max(0.0);
            let begin_frame = match object.move_type {
                MoveType::Emitter if count > 1 => {
                    let window = (last - life - first).max(0.0);
                    first + window * index as f32 / (count - 1) as f32
                }
                _ => first,
            };
            let begin_offset = roll_random_units(object.begin_position(), rng);
            let end_offset = if single_position {
                begin_offset
            } else {
                roll_random_units(object.end_position(), rng)
            };
            let roll = rng.random::<f32>() * 360.0;
            let pitch = rng.random::<f32>() * object.emit_angle;
            ParticleInstance {
                begin_frame,
                end_frame: begin_frame + life,
                random_offsets: [begin_offset, end_offset],
                roll,
                pitch,
            }
        })
        .collect()
}

fn roll_random_units(formula: &PositionFormula, rng: &mut StdRng) -> Vec3 {
    formula
        .units
        .iter()
        .map(|unit| match unit {
            PositionUnit::Random(radius) => random_direction(rng) * *radius * rng.random::<f32>(),
            PositionUnit::RandomPositiveY(radius) => {
                let mut direction = random_direction(rng);
                direction.y = direction.y.abs();
                direction * *radius * rng.random::<f32>()
            }
            _ => Vec3::ZERO,
        })
        .sum()
}

fn random_direction(rng: &mut StdRng) -> Vec3 {
    let z = rng.random::<f32>() * 2.0 - 1.0;
    let phi = rng.random::<f32>() * TAU;
    let radius = (1.0 - z * z).max(0.0).sqrt();
    Vec3::new(radius * phi.cos(), z, radius * phi.sin())
}

/// Sums the world-anchored units of a formula. Formulas without an
/// anchor start at the effect's own position, and units whose target is
/// unbound are offset from it as well.
fn resolve_anchor(formula: &PositionFormula, origin: Vec3, resolver: &dyn TargetResolver) -> Vec3 {
    let mut position = if formula.has_anchor() { Vec3::ZERO } else { origin };
    for unit in &formula.units {
        position += match unit {
            PositionUnit::Absolute(offset) => *offset,
            PositionUnit::Bone {
                target,
                bone,
                offset,
            } => match resolver.bone_position(*target, bone) {
                Some(bone_position) => bone_position + *offset,
                None => {
                    debug!("particle target {target} has no bone {bone}");
                    origin + *offset
                }
            },
            PositionUnit::Target { target, offset } => {
                match (resolver.target_position(*target), resolver.target_column(*target)) {
                    (Some(position), column) => {
                        let column = column.unwrap_or_default();
                        let scaled = Vec3::new(
                            offset.x * column.radius,
                            offset.y * column.height,
                            offset.z * column.radius,
                        );
                        position + Quat::from_rotation_y(column.angle.to_radians()) * scaled
                    }
                    (None, _) => {
                        debug!("particle target {target} is not bound");
                        origin + *offset
                    }
                }
            }
            PositionUnit::None | PositionUnit::Random(_) | PositionUnit::RandomPositiveY(_) => {
                Vec3::ZERO
            }
        };
    }
    position
}

fn lerp(range: (f32, f32), t: f32) -> f32 {
    range.0 + (range.1 - range.0) * t
}

/// Samples a per-frame curve, interpolating between adjacent entries and
/// holding the last entry.
fn sample_curve(curve: &[f32], frame: f32) -> Option<f32> {
    let last = curve.len().checked_sub(1)?;
    let frame = frame.clamp(0.0, last as f32);
    let lower = frame.floor() as usize;
    let upper = (lower + 1).min(last);
    let t = frame - lower as f32;
    Some(curve[lower] + (curve[upper] - curve[lower]) * t)
}

/// Linear fade-in from the particle's begin frame and fade-out towards
/// its end frame.
pub fn fade_alpha(begin: f32, end: f32, fade_in: f32, fade_out: f32, frame: f32) -> f32 {
    let fade_in = if fade_in > 0.0 {
        ((frame - begin) / fade_in).clamp(0.0, 1.0)
    } else {
        1.0
    };
    let fade_out = if fade_out > 0.0 {
        ((end - frame) / fade_out).clamp(0.0, 1.0)
    } else {
        1.0
    };
    fade_in.min(fade_out)
}

fn evaluate_particle(
    index: usize,
    object: &ParticleObject,
    particle: &ParticleInstance,
    begin_anchor: Vec3,
    end_anchor: Vec3,
    frame: f32,
) -> ParticleSprite {
    let t = particle.progress(frame);
    let age = frame - particle.begin_frame;
    let begin = begin_anchor + particle.random_offsets[0];
    let end = end_anchor + particle.random_offsets[1];

    let position = match object.move_type {
        MoveType::Fixed => begin,
        MoveType::Linear => begin.lerp(end, t.powf(object.move_curve.max(0.0))),
        MoveType::Emitter => {
            let up = object.up_vector.axis();
            let tilt = Quat::from_axis_angle(up.any_orthonormal_vector(), particle.pitch.to_radians());
            let spin = Quat::from_axis_angle(up, particle.roll.to_radians());
            let direction = spin * tilt * up;
            let drift = direction * begin.distance(end) * t - Vec3::Y * object.curve_length * t * t;
            let revolution = Quat::from_euler(
                EulerRot::YXZ,
                lerp(object.revolution[1], t).to_radians(),
                lerp(object.revolution[0], t).to_radians(),
                lerp(object.revolution[2], t).to_radians(),
            );
            begin + revolution * drift
        }
    };

    let rotation = Vec3::new(
        lerp(object.rotation[0], t),
        lerp(object.rotation[1], t),
        lerp(object.rotation[2], t),
    );
    let size = Vec2::new(
        sample_curve(&object.size_x_curve, age).unwrap_or_else(|| lerp(object.size, t)),
        sample_curve(&object.size_y_curve, age).unwrap_or_else(|| lerp(object.size, t)),
    );
    let alpha = fade_alpha(
        particle.begin_frame,
        particle.end_frame,
        object.fade_in,
        object.fade_out,
        frame,
    );
    let texture = match (object.textures.len(), object.texture_anim_frame) {
        (0, _) => None,
        (_, 0) => Some(0),
        (count, step) => Some((age.max(0.0) as u32 / step) as usize % count),
    };

    ParticleSprite {
        object: index,
        kind: object.kind,
        blend: object.blend,
        position,
        rotation,
        size,
        alpha,
        texture,
    }
}

/// Camera (pitch, yaw) offset of a quake object at `frame`, or `None`
/// outside its active range.
fn camera_quake(object: &ParticleObject, frame: f32) -> Option<Vec2> {
    let (begin, end) = (object.frame_range.0 as f32, object.frame_range.1 as f32);
    if frame < begin || frame > end {
        return None;
    }
    let ramp = smoothstep(fade_alpha(begin, end, object.fade_in, object.fade_out, frame));
    let phase = if object.quake_period > f32::EPSILON {
        TAU * (frame - begin) / object.quake_period
    } else {
        0.0
    };
    Some(Vec2::new(
        object.quake_amplitude.0 * phase.sin() * ramp,
        object.quake_amplitude.1 * phase.cos() * ramp,
    ))
}

fn smoothstep(x: f32) -> f32 {
    let x = x.clamp(0.0, 1.0);
    x * x * (3.0 - 2.0 * x)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::pae::parse_effect;

    fn effect(script: &str) -> Arc<ParticleEffect> {
        Arc::new(ParticleEffect {
            path: "fx/test".into(),
            objects: parse_effect(script).unwrap(),
            textures: HashMap::new(),
            models: HashMap::new(),
        })
    }

    fn at(state: &mut ParticleEffectState, frame: f32) -> ParticleFrame {
        state.playback.set_frame(frame);
        state.evaluate(Vec3::ZERO, &NoTargets)
    }

    struct Targets;

    impl TargetResolver for Targets {
        fn target_position(&self, target: usize) -> Option<Vec3> {
            (target == 0).then_some(Vec3::new(10.0, 0.0, 0.0))
        }

        fn target_column(&self, target: usize) -> Option<Column> {
            (target == 0).then_some(Column {
                radius: 2.0,
                height: 3.0,
                angle: 90.0,
            })
        }

        fn bone_position(&self, target: usize, bone: &str) -> Option<Vec3> {
            (target == 0 && bone == "head").then_some(Vec3::new(10.0, 1.5, 0.0))
        }
    }

    #[test]
    fn repeated_evaluation_is_stable() {
        let mut state = ParticleEffectState::new(
            effect(
                "object \"dust\" = { 移動タイプ = 発射, パーティクル数 = 8, 寿命 = 5, 15,
                 位置 = (乱数(2) + 絶対(0, 1, 0), 乱数正Ｙ(1)), フレーム = 0, 30 }",
            ),
            7,
        );
        let first = at(&mut state, 12.5);
        let second = at(&mut state, 12.5);
        assert!(!first.sprites.is_empty());
        assert_eq!(first, second);
        let particles = state.particles(0).to_vec();
        at(&mut state, 20.0);
        assert_eq!(particles, state.particles(0));
    }

    #[test]
    fn alpha_fades_in_and_out() {
        let mut state = ParticleEffectState::new(
            effect(
                "object \"glow\" = { フレーム = 0, 20, アルファフェードインフレーム = 5,
                 アルファフェードアウトフレーム = 5 }",
            ),
            1,
        );
        let alpha = |state: &mut ParticleEffectState, frame| at(state, frame).sprites[0].alpha;
        assert_eq!(alpha(&mut state, 0.0), 0.0);
        assert!((alpha(&mut state, 5.0) - 1.0).abs() < 1e-6);
        assert!((alpha(&mut state, 15.0) - 1.0).abs() < 1e-6);
        assert_eq!(alpha(&mut state, 20.0), 0.0);
        assert!((alpha(&mut state, 2.5) - 0.5).abs() < 1e-6);
    }

    #[test]
    fn without_fade_in_alpha_starts_opaque() {
        assert_eq!(fade_alpha(0.0, 10.0, 0.0, 0.0, 0.0), 1.0);
    }

    #[test]
    fn linear_movement_interpolates_with_easing() {
        let mut state = ParticleEffectState::new(
            effect(
                "object \"bolt\" = { 移動タイプ = 直線, フレーム = 0, 20,
                 位置 = (絶対(0, 0, 0), 絶対(10, 0, 0)) }
                 object \"eased\" = { 移動タイプ = 直線, フレーム = 0, 20, 移動曲線 = 2,
                 位置 = (絶対(0, 0, 0), 絶対(10, 0, 0)) }",
            ),
            3,
        );
        let frame = at(&mut state, 10.0);
        assert!((frame.sprites[0].position.x - 5.0).abs() < 1e-5);
        assert!((frame.sprites[1].position.x - 2.5).abs() < 1e-5);
    }

    #[test]
    fn fixed_particles_without_anchor_follow_origin() {
        let state = ParticleEffectState::new(effect("object \"a\" = { フレーム = 0, 10 }"), 0);
        let frame = state.evaluate(Vec3::new(1.0, 2.0, 3.0), &NoTargets);
        assert_eq!(frame.sprites[0].position, Vec3::new(1.0, 2.0, 3.0));
    }

    #[test]
    fn target_units_scale_by_column() {
        let state = ParticleEffectState::new(
            effect("object \"a\" = { フレーム = 0, 10, 位置 = (ターゲット(0, 1, 1, 0)) }"),
            0,
        );
        let position = state.evaluate(Vec3::ZERO, &Targets).sprites[0].position;
        // (2, 3, 0) rotated a quarter turn around Y.
        assert!((position - Vec3::new(10.0, 3.0, -2.0)).length() < 1e-4);
    }

    #[test]
    fn bone_units_use_bone_world_position() {
        let state = ParticleEffectState::new(
            effect("object \"a\" = { フレーム = 0, 10, 位置 = (ボーン(0, \"head\", 0, 0.5, 0)) }"),
            0,
        );
        let position = state.evaluate(Vec3::ZERO, &Targets).sprites[0].position;
        assert!((position - Vec3::new(10.0, 2.0, 0.0)).length() < 1e-5);
    }

    #[test]
    fn unbound_units_are_offset_from_origin() {
        let state = ParticleEffectState::new(
            effect(
                "object \"a\" = { フレーム = 0, 10, 位置 = (ターゲット(1, 0, 1, 0)) }
                 object \"b\" = { フレーム = 0, 10, 位置 = (ボーン(1, \"head\", 0, 1, 0)) }",
            ),
            0,
        );
        let frame = state.evaluate(Vec3::new(5.0, 0.0, 0.0), &Targets);
        assert_eq!(frame.sprites[0].position, Vec3::new(5.0, 1.0, 0.0));
        assert_eq!(frame.sprites[1].position, Vec3::new(5.0, 1.0, 0.0));
    }

    #[test]
    fn sword_blur_spans_both_anchors() {
        let state = ParticleEffectState::new(
            effect(
                "object \"slash\" = { 種類 = 剣ブラー, フレーム = 0, 10, サイズ = 0.5,
                 位置 = (ボーン(0, \"head\", 0, 0, 0), ターゲット(0, 0, 1, 0)) }",
            ),
            0,
        );
        let frame = state.evaluate(Vec3::ZERO, &Targets);
        assert!(frame.sprites.is_empty());
        assert_eq!(frame.blurs.len(), 1);
        let blur = &frame.blurs[0];
        assert!((blur.start - Vec3::new(10.0, 1.5, 0.0)).length() < 1e-5);
        assert!((blur.end - Vec3::new(10.0, 3.0, 0.0)).length() < 1e-5);
        assert_eq!(blur.width, 0.5);
        assert_eq!(blur.alpha, 1.0);
    }

    #[test]
    fn emitter_particles_are_staggered() {
        let state = ParticleEffectState::new(
            effect("object \"a\" = { 移動タイプ = 発射, パーティクル数 = 3, 寿命 = 10, フレーム = 0, 30 }"),
            0,
        );
        let begins: Vec<f32> = state.particles(0).iter().map(|p| p.begin_frame).collect();
        assert_eq!(begins, vec![0.0, 10.0, 20.0]);
        assert!(state.particles(0).iter().all(|p| p.end_frame - p.begin_frame == 10.0));
    }

    #[test]
    fn emitter_sags_by_curve_length() {
        let mut state = ParticleEffectState::new(
            effect(
                "object \"a\" = { 移動タイプ = 発射, 発射角度 = 0, 曲線長 = 4, フレーム = 0, 10,
                 位置 = (絶対(0, 0, 0), 絶対(0, 2, 0)) }",
            ),
            0,
        );
        let position = at(&mut state, 5.0).sprites[0].position;
        // up 2 * 0.5, minus sag 4 * 0.25
        assert!(position.length() < 1e-4);
    }

    #[test]
    fn size_uses_pair_or_curve() {
        let mut state = ParticleEffectState::new(
            effect("object \"a\" = { フレーム = 0, 10, サイズ = 1, 3, サイズＸ = 0, 2, 4 }"),
            0,
        );
        let size = at(&mut state, 5.0).sprites[0].size;
        assert_eq!(size.x, 4.0);
        assert_eq!(size.y, 2.0);
        let size = at(&mut state, 1.5).sprites[0].size;
        assert_eq!(size.x, 3.0);
    }

    #[test]
    fn texture_index_cycles() {
        let mut state = ParticleEffectState::new(
            effect(
                "object \"a\" = { フレーム = 0, 30, テクスチャ = \"a.png\", \"b.png\", \"c.png\",
                 テクスチャアニメフレーム = 2 }",
            ),
            0,
        );
        assert_eq!(at(&mut state, 1.0).sprites[0].texture, Some(0));
        assert_eq!(at(&mut state, 5.0).sprites[0].texture, Some(2));
        assert_eq!(at(&mut state, 6.0).sprites[0].texture, Some(0));
    }

    #[test]
    fn stop_frame_freezes_evaluation() {
        let mut state = ParticleEffectState::new(
            effect(
                "object \"a\" = { 移動タイプ = 直線, フレーム = 0, 20, ストップフレーム = 5,
                 位置 = (絶対(0, 0, 0), 絶対(20, 0, 0)) }",
            ),
            0,
        );
        assert_eq!(at(&mut state, 5.0), at(&mut state, 12.0));
    }

    #[test]
    fn camera_quake_requires_flag_and_active_range() {
        let mut state = ParticleEffectState::new(
            effect(
                "object \"shake\" = { 種類 = カメラ振動, フレーム = 10, 20, 振幅 = 2, 4, 周期 = 8 }",
            ),
            0,
        );
        assert!(at(&mut state, 12.0).quake.is_none());
        state.camera_quake_enabled = true;
        let quake = at(&mut state, 12.0).quake.unwrap();
        // quarter period: full pitch, no yaw
        assert!((quake.x - 2.0).abs() < 1e-4);
        assert!(quake.y.abs() < 1e-4);
        assert!(at(&mut state, 25.0).quake.is_none());
        assert!(at(&mut state, 12.0).sprites.is_empty());
    }

    #[test]
    fn update_advances_playback() {
        let mut state =
            ParticleEffectState::new(effect("object \"a\" = { フレーム = 0, 10 }"), 0);
        state.update(4.0, Vec3::ZERO, &NoTargets);
        assert_eq!(state.playback.frame, 4.0);
        assert_eq!(state.frame().sprites.len(), 1);
        state.update(40.0, Vec3::ZERO, &NoTargets);
        assert!(state.is_finished());
    }
}
