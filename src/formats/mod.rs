//! Decoders for the proprietary binary asset formats.
//!
//! * `POL`: meshes, materials and the bind-pose skeleton.
//! * `MOT`: per-bone keyframe animation.
//! * `AMT`: per-material shading parameters.
//!
//! The source data is authored in a left-handed, Z-forward coordinate
//! system measured in inches. Every decoder converts to the engine's
//! right-handed metric convention through the helpers below so the rest of
//! the crate never sees raw file coordinates.

pub mod amt;
pub mod mot;
pub mod pol;
pub(crate) mod reader;
#[cfg(test)]
pub(crate) mod testdata;

use glam::{Quat, Vec3};

pub use amt::{Amt, AmtMaterial};
pub use mot::{Mot, MotBone, MotFrame};
pub use pol::{
    BoneWeight, MeshFlags, Pol, PolBone, PolMaterial, PolMesh, PolTexture, PolTriangle, PolVertex,
    TextureKind,
};

/// Scale applied to every linear quantity read from asset files.
pub const INCHES_TO_METERS: f32 = 0.0254;

/// Converts a file-space position to engine space.
pub fn convert_position(x: f32, y: f32, z: f32) -> Vec3 {
    Vec3::new(x, y, -z) * INCHES_TO_METERS
}

/// Converts a file-space direction (normals) to engine space.
pub fn convert_direction(x: f32, y: f32, z: f32) -> Vec3 {
    Vec3::new(x, y, -z)
}

/// Converts a file-space rotation to engine space.
///
/// Mirroring across the XY plane negates the imaginary Z component
/// together with W.
pub fn convert_rotation(w: f32, x: f32, y: f32, z: f32) -> Quat {
    let q = Quat::from_xyzw(x, y, -z, -w);
    if q.length_squared() > f32::EPSILON {
        q.normalize()
    } else {
        Quat::IDENTITY
    }
}
