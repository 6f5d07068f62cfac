use glam::{EulerRot, Mat4, Quat, Vec2, Vec3};
use serde::{Deserialize, Serialize};

/// Scene camera: a position and pitch/yaw/roll in degrees.
///
/// With zero angles the camera looks down -Z with +Y up.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Camera {
    pub position: Vec3,
    pub pitch: f32,
    pub yaw: f32,
    pub roll: f32,
    /// Vertical field of view in degrees.
    pub fov_y: f32,
    pub near: f32,
    pub far: f32,
    /// Transient (pitch, yaw) offset from camera-quake particles.
    #[serde(skip)]
    pub quake: Vec2,
}

impl Default for Camera {
    fn default() -> Self {
        Self {
            position: Vec3::new(0.0, 1.5, 5.0),
            pitch: 0.0,
            yaw: 0.0,
            roll: 0.0,
            fov_y: 45.0,
            near: 0.1,
            far: 1000.0,
            quake: Vec2::ZERO,
        }
    }
}

impl Camera {
    pub fn orientation(&self) -> Quat {
        Quat::from_euler(
            EulerRot::YXZ,
            (self.yaw + self.quake.y).to_radians(),
            (self.pitch + self.quake.x).to_radians(),
            self.roll.to_radians(),
        )
    }

    pub fn forward(&self) -> Vec3 {
        self.orientation() * Vec3::NEG_Z
    }

    pub fn view(&self) -> Mat4 {
        Mat4::from_rotation_translation(self.orientation(), self.position).inverse()
    }

    /// Perspective projection. With `flip_y` the image comes out upside
    /// down, which targets storing rows bottom-up need; triangle winding
    /// is then reversed as well (see [`front_face`]).
    pub fn projection(&self, aspect: f32, flip_y: bool) -> Mat4 {
        let projection = Mat4::perspective_rh(
            self.fov_y.to_radians(),
            aspect.max(f32::EPSILON),
            self.near,
            self.far,
        );
        if flip_y {
            Mat4::from_scale(Vec3::new(1.0, -1.0, 1.0)) * projection
        } else {
            projection
        }
    }

    pub fn view_projection(&self, aspect: f32, flip_y: bool) -> Mat4 {
        self.projection(aspect, flip_y) * self.view()
    }

    /// Distance in front of the camera along its view axis.
    pub fn depth_of(&self, point: Vec3) -> f32 {
        -self.view().transform_point3(point).z
    }

    /// Rotation that turns a quad facing +Z towards the camera.
    pub fn billboard_rotation(&self) -> Quat {
        self.orientation()
    }
}

/// Front-facing winding matching [`Camera::projection`].
pub fn front_face(flip_y: bool) -> wgpu::FrontFace {
    if flip_y {
        wgpu::FrontFace::Cw
    } else {
        wgpu::FrontFace::Ccw
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: Vec3, b: Vec3) -> bool {
        (a - b).length() < 1e-4
    }

    #[test]
    fn default_camera_looks_down_negative_z() {
        let camera = Camera {
            position: Vec3::ZERO,
            ..Camera::default()
        };
        assert!(close(camera.forward(), Vec3::NEG_Z));
        assert!((camera.depth_of(Vec3::new(0.0, 0.0, -3.0)) - 3.0).abs() < 1e-5);
    }

    #[test]
    fn yaw_turns_left_and_quake_adds_to_it() {
        let mut camera = Camera {
            position: Vec3::ZERO,
            yaw: 90.0,
            ..Camera::default()
        };
        assert!(close(camera.forward(), Vec3::NEG_X));
        camera.yaw = 80.0;
        camera.quake = Vec2::new(0.0, 10.0);
        assert!(close(camera.forward(), Vec3::NEG_X));
    }

    #[test]
    fn flipped_projection_mirrors_clip_y() {
        let camera = Camera::default();
        let point = Vec3::new(0.0, 3.0, -5.0);
        let plain = camera.view_projection(1.0, false).project_point3(point);
        let flipped = camera.view_projection(1.0, true).project_point3(point);
        assert!((plain.y + flipped.y).abs() < 1e-5);
        assert!((plain.z - flipped.z).abs() < 1e-6);
        assert_eq!(front_face(true), wgpu::FrontFace::Cw);
        assert_eq!(front_face(false), wgpu::FrontFace::Ccw);
    }
}
