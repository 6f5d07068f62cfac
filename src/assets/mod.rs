//! Shared, immutable assets and the cache that loads them.

mod cache;
mod effect;
mod model;
mod texture;

pub use cache::AssetCache;
pub use effect::ParticleEffect;
pub use model::{Bone, Material, Mesh, MeshBatch, Model, ModelId, Vertex, MAX_BONES, MAX_INFLUENCES};
pub use texture::{Texture, TextureId};

#[cfg(test)]
pub(crate) use texture::encode_png;
