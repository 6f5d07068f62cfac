//! Per-frame planning shared by the GPU passes: draw ordering, the shadow
//! frustum and the height-map encoding.

use std::cmp::Ordering;

use glam::{Mat4, Vec3};
use serde::{Deserialize, Serialize};

use super::camera::Camera;
use crate::geometry::{Aabb, BoundingSphere};
use crate::instance::{DrawFlags, Instance, InstanceId, InstanceKind, InstanceTable};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeMode {
    None,
    CharactersOnly,
    #[default]
    All,
}

impl EdgeMode {
    pub fn wants_outline(self, flags: &DrawFlags) -> bool {
        match self {
            EdgeMode::None => false,
            EdgeMode::CharactersOnly => flags.outline && flags.character,
            EdgeMode::All => flags.outline,
        }
    }
}

/// Global rendering switches.
///
/// SSAO, bloom and glare are carried as settings only; the renderer has no
/// post-processing passes.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RenderOptions {
    pub shadow: bool,
    pub fog: bool,
    pub bump: bool,
    pub specular: bool,
    pub light_map: bool,
    pub ssao: bool,
    pub bloom: bool,
    pub glare: bool,
    pub edge_mode: EdgeMode,
    /// Outline thickness in meters.
    pub edge_width: f32,
    pub edge_color: Vec3,
    pub fog_near: f32,
    pub fog_far: f32,
    pub fog_color: Vec3,
    pub global_ambient: Vec3,
    pub clear_color: Vec3,
}

impl Default for RenderOptions {
    fn default() -> Self {
        Self {
            shadow: true,
            fog: false,
            bump: false,
            specular: true,
            light_map: true,
            ssao: false,
            bloom: false,
            glare: false,
            edge_mode: EdgeMode::default(),
            edge_width: 0.01,
            edge_color: Vec3::ZERO,
            fog_near: 10.0,
            fog_far: 100.0,
            fog_color: Vec3::splat(0.5),
            global_ambient: Vec3::splat(0.2),
            clear_color: Vec3::new(0.03, 0.03, 0.05),
        }
    }
}

/// One instance queued for drawing, with its camera-space depth.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DrawItem {
    pub id: InstanceId,
    pub depth: f32,
    pub opaque: bool,
    pub transparent: bool,
}

/// Instances split into the opaque (nearest first) and transparent
/// (farthest first) passes. An instance with both kinds of meshes shows
/// up in both lists.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DrawList {
    pub opaque: Vec<DrawItem>,
    pub transparent: Vec<DrawItem>,
}

impl DrawList {
    pub fn build<I: IntoIterator<Item = DrawItem>>(items: I) -> Self {
        let mut list = DrawList::default();
        for item in items {
            if item.opaque {
                list.opaque.push(item);
            }
            if item.transparent {
                list.transparent.push(item);
            }
        }
        let by_depth = |a: &DrawItem, b: &DrawItem| -> Ordering { a.depth.total_cmp(&b.depth) };
        list.opaque.sort_by(by_depth);
        list.transparent.sort_by(|a, b| by_depth(b, a));
        list
    }

    /// Sorts every visible drawable instance by the depth of its bounding
    /// sphere center.
    pub fn from_instances(instances: &InstanceTable, camera: &Camera) -> Self {
        let view = camera.view();
        Self::build(instances.iter().filter_map(|instance| {
            let (opaque, transparent) = draw_classes(instance)?;
            let center = instance.bounding_sphere().center;
            Some(DrawItem {
                id: instance.id(),
                depth: -view.transform_point3(center).z,
                opaque,
                transparent,
            })
        }))
    }
}

/// Which passes an instance contributes to, or `None` if it never draws.
fn draw_classes(instance: &Instance) -> Option<(bool, bool)> {
    if !instance.draw.visible {
        return None;
    }
    match instance.kind() {
        InstanceKind::StaticMesh | InstanceKind::SkinnedMesh | InstanceKind::Billboard => {
            let model = instance.model()?;
            if instance.alpha < 1.0 {
                return Some((false, true));
            }
            let transparent = model.meshes.iter().any(|mesh| mesh.transparent);
            let opaque = model.meshes.iter().any(|mesh| !mesh.transparent);
            Some((opaque, transparent))
        }
        InstanceKind::ParticleEffect => instance.effect().map(|_| (false, true)),
        InstanceKind::PathLine(points) if points.len() >= 2 => Some((true, false)),
        InstanceKind::PathLine(_)
        | InstanceKind::DirectionalLight(_)
        | InstanceKind::SpecularLight(_) => None,
    }
}

/// Light-space view-projection covering every shadow caster, looking
/// along `direction`.
pub fn shadow_view_projection(casters: &[BoundingSphere], direction: Vec3) -> Option<Mat4> {
    let sphere = BoundingSphere::enclosing(casters)?;
    let radius = sphere.radius.max(0.01);
    let direction = direction.try_normalize().unwrap_or(Vec3::NEG_Y);
    let up = if direction.cross(Vec3::Y).length_squared() < 1e-6 {
        Vec3::Z
    } else {
        Vec3::Y
    };
    let eye = sphere.center - direction * radius * 2.0;
    let view = Mat4::look_at_rh(eye, sphere.center, up);
    let projection = Mat4::orthographic_rh(-radius, radius, -radius, radius, radius, radius * 3.0);
    Some(projection * view)
}

/// Value stored where the height pass drew no geometry.
pub const NO_HEIGHT: u16 = 0;

/// Maps a height inside `[min, max]` to `1..=u16::MAX`.
pub fn encode_height(y: f32, min: f32, max: f32) -> u16 {
    let range = max - min;
    let t = if range > f32::EPSILON {
        ((y - min) / range).clamp(0.0, 1.0)
    } else {
        0.0
    };
    1 + (t * (u16::MAX - 1) as f32).round() as u16
}

pub fn decode_height(value: u16, min: f32, max: f32) -> Option<f32> {
    if value == NO_HEIGHT {
        return None;
    }
    let t = (value - 1) as f32 / (u16::MAX - 1) as f32;
    Some(min + (max - min) * t)
}

/// Top-down orthographic view of `bounds`. Row 0 of the image is the
/// minimum Z edge and column 0 the minimum X edge.
pub fn height_view_projection(bounds: &Aabb) -> Mat4 {
    let center = bounds.center();
    let half = bounds.extent() * 0.5;
    let eye = Vec3::new(center.x, bounds.max.y + 1.0, center.z);
    let view = Mat4::look_at_rh(eye, Vec3::new(center.x, bounds.min.y, center.z), Vec3::NEG_Z);
    let far = bounds.extent().y + 2.0;
    Mat4::orthographic_rh(
        -half.x.max(1e-3),
        half.x.max(1e-3),
        -half.z.max(1e-3),
        half.z.max(1e-3),
        0.5,
        far,
    ) * view
}

/// Read-back result of the height pass.
#[derive(Debug, Clone, PartialEq)]
pub struct HeightMap {
    pub width: u32,
    pub height: u32,
    /// World-space bounds the map covers.
    pub bounds: Aabb,
    pub values: Vec<u16>,
}

impl HeightMap {
    /// World height of the highest surface at `(x, z)`.
    pub fn sample(&self, x: f32, z: f32) -> Option<f32> {
        if self.width == 0 || self.height == 0 || !self.bounds.contains_xz(x, z) {
            return None;
        }
        let extent = self.bounds.extent();
        let u = if extent.x > f32::EPSILON {
            (x - self.bounds.min.x) / extent.x
        } else {
            0.5
        };
        let v = if extent.z > f32::EPSILON {
            (z - self.bounds.min.z) / extent.z
        } else {
            0.5
        };
        let column = ((u * self.width as f32) as u32).min(self.width - 1);
        let row = ((v * self.height as f32) as u32).min(self.height - 1);
        let value = *self.values.get((row * self.width + column) as usize)?;
        decode_height(value, self.bounds.min.y, self.bounds.max.y)
    }
}
