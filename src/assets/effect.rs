use std::collections::HashMap;
use std::sync::Arc;

use super::model::Model;
use super::texture::Texture;
use crate::pae::{ParticleObject, ParticleType};

/// A parsed particle script together with everything it references.
#[derive(Debug)]
pub struct ParticleEffect {
    pub path: String,
    pub objects: Vec<ParticleObject>,
    /// Keyed by the file name as written in the script.
    pub textures: HashMap<String, Arc<Texture>>,
    /// Keyed by the `ポリゴン` name as written in the script.
    pub models: HashMap<String, Arc<Model>>,
}

impl ParticleEffect {
    pub fn texture(&self, name: &str) -> Option<&Arc<Texture>> {
        self.textures.get(name)
    }

    pub fn model(&self, name: &str) -> Option<&Arc<Model>> {
        self.models.get(name)
    }

    /// True when any object drives the camera instead of drawing.
    pub fn has_camera_quake(&self) -> bool {
        self.objects
            .iter()
            .any(|object| object.kind == ParticleType::CameraQuake)
    }

    /// Last frame at which any object is active.
    pub fn last_frame(&self) -> i32 {
        self.objects
            .iter()
            .map(|object| object.frame_range.1)
            .max()
            .unwrap_or(0)
    }
}
