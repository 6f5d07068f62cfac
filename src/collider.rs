//! Triangle-soup collider for ground height queries.

use glam::{Mat4, Vec3};
use log::warn;

use crate::assets::Model;
use crate::geometry::Aabb;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ColliderTriangle {
    pub corners: [Vec3; 3],
    pub aabb: Aabb,
}

impl ColliderTriangle {
    pub fn new(corners: [Vec3; 3]) -> Self {
        Self {
            corners,
            aabb: Aabb::from_points(corners),
        }
    }

    pub fn centroid(&self) -> Vec3 {
        (self.corners[0] + self.corners[1] + self.corners[2]) / 3.0
    }
}

/// Local-space triangles of a model with per-triangle bounds.
#[derive(Debug, Clone, Default)]
pub struct Collider {
    triangles: Vec<ColliderTriangle>,
}

impl Collider {
    pub fn from_model(model: &Model) -> Self {
        Self::from_triangles(
            model
                .meshes
                .iter()
                .flat_map(|mesh| mesh.triangles.iter().copied()),
        )
    }

    pub fn from_triangles<I: IntoIterator<Item = [Vec3; 3]>>(triangles: I) -> Self {
        Self {
            triangles: triangles.into_iter().map(ColliderTriangle::new).collect(),
        }
    }

    pub fn triangles(&self) -> &[ColliderTriangle] {
        &self.triangles
    }

    pub fn is_empty(&self) -> bool {
        self.triangles.is_empty()
    }

    /// Height of the ground at local `(x, z)`.
    ///
    /// Picks the first triangle whose bounding box footprint contains the
    /// point and reports its centroid height.
    pub fn height_at(&self, x: f32, z: f32) -> Option<f32> {
        self.triangles
            .iter()
            .find(|triangle| triangle.aabb.contains_xz(x, z))
            .map(|triangle| triangle.centroid().y)
    }

    /// As [`Collider::height_at`] for a collider placed by `transform`.
    pub fn height_at_world(&self, transform: &Mat4, x: f32, z: f32) -> Option<f32> {
        let inverse = transform.inverse();
        let local = inverse.transform_point3(Vec3::new(x, 0.0, z));
        let height = self.height_at(local.x, local.z)?;
        Some(transform.transform_point3(Vec3::new(local.x, height, local.z)).y)
    }

    /// Path finding across the collider. Not implemented; always `None`.
    pub fn find_path(&self, from: Vec3, to: Vec3) -> Option<Vec<Vec3>> {
        warn!("path finding from {from} to {to} is not implemented");
        None
    }

    /// Swept collision test. Not implemented; never reports a hit.
    pub fn sweep(&self, _from: Vec3, _to: Vec3, _radius: f32) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slope() -> Collider {
        Collider::from_triangles([
            [
                Vec3::new(0.0, 0.0, 0.0),
                Vec3::new(2.0, 0.0, 0.0),
                Vec3::new(0.0, 3.0, 2.0),
            ],
            [
                Vec3::new(5.0, 1.0, 5.0),
                Vec3::new(6.0, 1.0, 5.0),
                Vec3::new(5.0, 1.0, 6.0),
            ],
        ])
    }

    #[test]
    fn height_uses_first_containing_box_centroid() {
        let collider = slope();
        // The exact surface height at (0.1, 0.1) is near 0.15; the
        // approximation reports the centroid instead.
        assert_eq!(collider.height_at(0.1, 0.1), Some(1.0));
        assert_eq!(collider.height_at(5.9, 5.9), Some(1.0));
        assert_eq!(collider.height_at(3.0, 3.0), None);
    }

    #[test]
    fn world_queries_apply_the_transform() {
        let collider = slope();
        let transform = Mat4::from_translation(Vec3::new(10.0, 2.0, 0.0));
        assert_eq!(collider.height_at_world(&transform, 10.1, 0.1), Some(3.0));
        assert_eq!(collider.height_at_world(&transform, 0.1, 0.1), None);
    }

    #[test]
    fn path_finding_and_sweeps_are_stubs() {
        let collider = slope();
        assert!(collider.find_path(Vec3::ZERO, Vec3::ONE).is_none());
        assert!(!collider.sweep(Vec3::ZERO, Vec3::ONE, 0.5));
    }
}
