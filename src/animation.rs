//! Skeletal animation: motion playback, keyframe sampling, cross-fade
//! blending and skinning matrix evaluation.

use glam::{Mat4, Quat, Vec3};
use serde::{Deserialize, Serialize};

use crate::assets::Model;
use crate::error::LoadError;
use crate::formats::{Mot, MotFrame};

/// Frames advanced per tick when no rate is configured.
pub const DEFAULT_FPS: f32 = 30.0;

/// Converts a tick of `elapsed_ms` into a frame delta.
pub fn frames_for(elapsed_ms: f32, fps: f32) -> f32 {
    elapsed_ms.max(0.0) * fps / 1000.0
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlaybackState {
    #[default]
    Stopped,
    PlayOnce,
    Loop,
}

/// Playback cursor of a motion or particle effect.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Playback {
    pub state: PlaybackState,
    pub frame: f32,
    pub frame_range: (f32, f32),
    pub loop_range: (f32, f32),
}

impl Playback {
    /// Stopped at frame 0 with both ranges covering `last_frame`.
    pub fn new(last_frame: f32) -> Self {
        let last = last_frame.max(0.0);
        Self {
            state: PlaybackState::Stopped,
            frame: 0.0,
            frame_range: (0.0, last),
            loop_range: (0.0, last),
        }
    }

    pub fn set_frame_range(&mut self, begin: f32, end: f32) {
        self.frame_range = (begin, end.max(begin));
        self.frame = self.frame.clamp(self.frame_range.0, self.frame_range.1);
    }

    pub fn set_loop_range(&mut self, begin: f32, end: f32) {
        self.loop_range = (begin, end.max(begin));
    }

    pub fn set_frame(&mut self, frame: f32) {
        self.frame = frame;
    }

    /// True once a play-once cursor has reached the end of its range.
    pub fn is_finished(&self) -> bool {
        self.state == PlaybackState::PlayOnce && self.frame >= self.frame_range.1
    }

    pub fn advance(&mut self, delta: f32) {
        match self.state {
            PlaybackState::Stopped => {}
            PlaybackState::PlayOnce => {
                self.frame = (self.frame + delta).min(self.frame_range.1);
            }
            PlaybackState::Loop => {
                let (begin, end) = self.loop_range;
                self.frame += delta;
                if self.frame > end {
                    let length = end - begin;
                    self.frame = if length > f32::EPSILON {
                        begin + (self.frame - end) % length
                    } else {
                        begin
                    };
                }
            }
        }
    }
}

/// Local transform of one bone relative to its parent.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LocalPose {
    pub position: Vec3,
    pub rotation: Quat,
}

impl LocalPose {
    pub fn blend(&self, other: &LocalPose, rate: f32) -> LocalPose {
        let rate = rate.clamp(0.0, 1.0);
        LocalPose {
            position: self.position.lerp(other.position, rate),
            rotation: self.rotation.lerp(other.rotation, rate),
        }
    }

    fn matrix(&self) -> Mat4 {
        Mat4::from_rotation_translation(self.rotation, self.position)
    }
}

/// A motion bound to a model: track `i` animates bone `i`.
#[derive(Debug, Clone)]
pub struct Motion {
    pub name: String,
    pub nr_frames: usize,
    tracks: Vec<Vec<MotFrame>>,
    pub playback: Playback,
}

impl Motion {
    /// Re-indexes a parsed motion onto `model`'s bone order.
    ///
    /// Tracks match bones by name first, then by numeric id. Any mismatch
    /// in topology is a structural error.
    pub fn bind(name: &str, mot: Mot, model: &Model) -> Result<Self, LoadError> {
        if mot.bones.len() != model.bones.len() {
            return Err(LoadError::BoneCountMismatch {
                model: model.path.clone(),
                motion: name.to_string(),
                expected: model.bones.len(),
                found: mot.bones.len(),
            });
        }
        let mut tracks: Vec<Option<Vec<MotFrame>>> = vec![None; model.bones.len()];
        for bone in mot.bones {
            let index = model
                .bone_index(&bone.name)
                .or_else(|| model.bone_by_id.get(&bone.id).copied())
                .ok_or_else(|| LoadError::Structural {
                    path: name.to_string(),
                    message: format!("motion bone {} ({}) is not in the model", bone.name, bone.id),
                })?;
            if tracks[index].is_some() {
                return Err(LoadError::Structural {
                    path: name.to_string(),
                    message: format!("bone {} is animated twice", model.bones[index].name),
                });
            }
            tracks[index] = Some(bone.frames);
        }
        Ok(Self {
            name: name.to_string(),
            nr_frames: mot.nr_frames,
            tracks: tracks.into_iter().flatten().collect(),
            playback: Playback::new(mot.nr_frames.saturating_sub(1) as f32),
        })
    }

    pub fn last_frame(&self) -> f32 {
        self.nr_frames.saturating_sub(1) as f32
    }

    /// Samples bone `bone` at `frame`, interpolating between the
    /// neighbouring integer frames. Returns `None` for empty tracks.
    pub fn sample(&self, bone: usize, frame: f32) -> Option<LocalPose> {
        let track = self.tracks.get(bone)?;
        let last = track.len().checked_sub(1)?;
        let frame = frame.clamp(0.0, last as f32);
        let lower = frame.floor() as usize;
        let upper = (lower + 1).min(last);
        let t = frame - lower as f32;
        let a = &track[lower];
        let b = &track[upper];
        Some(LocalPose {
            position: a.position.lerp(b.position, t),
            rotation: a.rotation.lerp(b.rotation, t),
        })
    }

    /// Samples every bone at the current playback frame.
    pub fn sample_pose(&self, model: &Model) -> Vec<LocalPose> {
        let frame = self.playback.frame;
        model
            .bones
            .iter()
            .enumerate()
            .map(|(index, bone)| {
                self.sample(index, frame).unwrap_or(LocalPose {
                    position: bone.position,
                    rotation: bone.rotation,
                })
            })
            .collect()
    }
}

/// Per-bone output of one evaluation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SkeletonPose {
    /// Skinning matrices, row-major 3x4 (the last row is always 0,0,0,1).
    pub skin: Vec<[[f32; 4]; 3]>,
    /// Model-space bone transforms.
    pub world: Vec<Mat4>,
}

impl SkeletonPose {
    pub fn len(&self) -> usize {
        self.skin.len()
    }

    pub fn is_empty(&self) -> bool {
        self.skin.is_empty()
    }

    /// Model-space origin of bone `index`.
    pub fn bone_position(&self, index: usize) -> Option<Vec3> {
        self.world.get(index).map(|world| world.w_axis.truncate())
    }
}

/// Samples `current`, optionally cross-fading into `next` by `blend_rate`.
pub fn sample_blended(
    model: &Model,
    current: &Motion,
    next: Option<(&Motion, f32)>,
) -> Vec<LocalPose> {
    let pose = current.sample_pose(model);
    match next {
        Some((next, rate)) => pose
            .iter()
            .zip(next.sample_pose(model))
            .map(|(a, b)| a.blend(&b, rate))
            .collect(),
        None => pose,
    }
}

/// Composes local poses parent-first into skinning matrices.
pub fn evaluate_skeleton(model: &Model, locals: &[LocalPose]) -> SkeletonPose {
    let mut world: Vec<Mat4> = Vec::with_capacity(model.bones.len());
    let mut skin = Vec::with_capacity(model.bones.len());
    for (index, bone) in model.bones.iter().enumerate() {
        let local = locals.get(index).map_or_else(
            || Mat4::from_rotation_translation(bone.rotation, bone.position),
            LocalPose::matrix,
        );
        let matrix = match bone.parent {
            Some(parent) => world[parent] * local,
            None => local,
        };
        world.push(matrix);
        skin.push(to_rows_3x4(&(matrix * bone.inverse_bind)));
    }
    SkeletonPose { skin, world }
}

fn to_rows_3x4(matrix: &Mat4) -> [[f32; 4]; 3] {
    [
        matrix.row(0).to_array(),
        matrix.row(1).to_array(),
        matrix.row(2).to_array(),
    ]
}
