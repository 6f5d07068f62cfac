//! Headless wgpu rendering of an engine scene.

pub mod camera;
pub mod frame;
pub mod native;
pub mod shared;
pub mod target;

pub use camera::{front_face, Camera};
pub use frame::{DrawItem, DrawList, EdgeMode, HeightMap, RenderOptions};
pub use native::Renderer;
pub use target::{PixelSurface, RenderTarget};
