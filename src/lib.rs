//! Real-time 3D scene engine.
//!
//! The crate loads the POL/MOT/AMT binary formats and PAE particle scripts
//! through an [`AssetCache`], keeps scene instances in a fixed-capacity
//! table driven by [`ReignEngine`], and renders them headlessly with wgpu.
//! Archive access and the output surface are supplied by the embedder
//! through the [`Archive`] and [`RenderTarget`] traits.

pub mod animation;
pub mod app;
pub mod archive;
pub mod assets;
pub mod collider;
pub mod engine;
pub mod error;
pub mod formats;
pub mod geometry;
pub mod instance;
pub mod pae;
pub mod particle;
pub mod render;
pub mod scene;

pub use animation::{Motion, Playback, PlaybackState, SkeletonPose};
pub use archive::{Archive, DirectoryArchive, MemoryArchive};
pub use assets::{AssetCache, Model, ParticleEffect, Texture};
pub use collider::Collider;
pub use engine::{BackgroundLayer, EngineConfig, ReignEngine, MAX_BACKGROUND_LAYERS};
pub use error::{EngineError, LoadError, ParseError};
pub use geometry::{Aabb, BoundingSphere};
pub use instance::{Column, DrawFlags, Instance, InstanceId, InstanceKind, InstanceTable, Light};
pub use particle::{ParticleBlur, ParticleEffectState, ParticleFrame, ParticleSprite, TargetResolver};
pub use render::{Camera, EdgeMode, PixelSurface, RenderOptions, RenderTarget, Renderer};
pub use scene::Scene;
