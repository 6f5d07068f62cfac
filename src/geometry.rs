use glam::{Mat4, Vec3};
use serde::{Deserialize, Serialize};

/// Axis-aligned bounding box.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Aabb {
    pub min: Vec3,
    pub max: Vec3,
}

impl Aabb {
    /// An inverted box that any point will grow.
    pub const EMPTY: Self = Self {
        min: Vec3::splat(f32::INFINITY),
        max: Vec3::splat(f32::NEG_INFINITY),
    };

    pub fn from_points<I: IntoIterator<Item = Vec3>>(points: I) -> Self {
        let mut aabb = Self::EMPTY;
        for point in points {
            aabb.grow(point);
        }
        aabb
    }

    pub fn grow(&mut self, point: Vec3) {
        self.min = self.min.min(point);
        self.max = self.max.max(point);
    }

    pub fn union(&self, other: &Self) -> Self {
        Self {
            min: self.min.min(other.min),
            max: self.max.max(other.max),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.min.x > self.max.x || self.min.y > self.max.y || self.min.z > self.max.z
    }

    pub fn center(&self) -> Vec3 {
        if self.is_empty() {
            Vec3::ZERO
        } else {
            (self.min + self.max) * 0.5
        }
    }

    pub fn extent(&self) -> Vec3 {
        if self.is_empty() {
            Vec3::ZERO
        } else {
            self.max - self.min
        }
    }

    /// True when `(x, z)` lies inside the box's footprint, edges included.
    pub fn contains_xz(&self, x: f32, z: f32) -> bool {
        x >= self.min.x && x <= self.max.x && z >= self.min.z && z <= self.max.z
    }

    /// Box enclosing all eight corners after `transform`.
    pub fn transformed(&self, transform: &Mat4) -> Self {
        if self.is_empty() {
            return *self;
        }
        let corners = (0..8).map(|i| {
            Vec3::new(
                if i & 1 == 0 { self.min.x } else { self.max.x },
                if i & 2 == 0 { self.min.y } else { self.max.y },
                if i & 4 == 0 { self.min.z } else { self.max.z },
            )
        });
        Self::from_points(corners.map(|corner| transform.transform_point3(corner)))
    }

    pub fn bounding_sphere(&self) -> BoundingSphere {
        BoundingSphere {
            center: self.center(),
            radius: self.extent().length() * 0.5,
        }
    }
}

impl Default for Aabb {
    fn default() -> Self {
        Self::EMPTY
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingSphere {
    pub center: Vec3,
    pub radius: f32,
}

impl BoundingSphere {
    /// Smallest sphere around the centers that also contains every input
    /// sphere. Not minimal, but stable from frame to frame.
    pub fn enclosing(spheres: &[BoundingSphere]) -> Option<Self> {
        if spheres.is_empty() {
            return None;
        }
        let center = Aabb::from_points(spheres.iter().map(|sphere| sphere.center)).center();
        let radius = spheres
            .iter()
            .map(|sphere| sphere.center.distance(center) + sphere.radius)
            .fold(0.0f32, f32::max);
        Some(Self { center, radius })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_box_grows_to_points() {
        let aabb = Aabb::from_points([Vec3::new(1.0, 2.0, 3.0), Vec3::new(-1.0, 0.0, 5.0)]);
        assert_eq!(aabb.min, Vec3::new(-1.0, 0.0, 3.0));
        assert_eq!(aabb.max, Vec3::new(1.0, 2.0, 5.0));
        assert!(Aabb::EMPTY.is_empty());
        assert_eq!(Aabb::EMPTY.center(), Vec3::ZERO);
    }

    #[test]
    fn transformed_box_follows_translation() {
        let aabb = Aabb::from_points([Vec3::ZERO, Vec3::ONE]);
        let moved = aabb.transformed(&Mat4::from_translation(Vec3::new(0.0, 2.0, 0.0)));
        assert_eq!(moved.min, Vec3::new(0.0, 2.0, 0.0));
        assert_eq!(moved.max, Vec3::new(1.0, 3.0, 1.0));
    }

    #[test]
    fn enclosing_sphere_contains_inputs() {
        let a = BoundingSphere {
            center: Vec3::new(-2.0, 0.0, 0.0),
            radius: 1.0,
        };
        let b = BoundingSphere {
            center: Vec3::new(2.0, 0.0, 0.0),
            radius: 0.5,
        };
        let sphere = BoundingSphere::enclosing(&[a, b]).unwrap();
        assert_eq!(sphere.center, Vec3::ZERO);
        assert!((sphere.radius - 3.0).abs() < 1e-6);
        assert!(BoundingSphere::enclosing(&[]).is_none());
    }
}
