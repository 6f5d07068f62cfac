use std::sync::atomic::{AtomicU32, Ordering};

use crate::error::LoadError;

/// Identity of a decoded texture; the renderer keys its GPU copies by it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TextureId(u32);

impl TextureId {
    fn next() -> Self {
        static NEXT: AtomicU32 = AtomicU32::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

/// A decoded RGBA8 image.
#[derive(Debug, Clone)]
pub struct Texture {
    pub id: TextureId,
    pub path: String,
    pub width: u32,
    pub height: u32,
    pub rgba: Vec<u8>,
    /// True when any texel is not fully opaque.
    pub has_alpha: bool,
}

impl Texture {
    /// Decodes any image format enabled on the `image` crate.
    pub fn decode(path: &str, bytes: &[u8]) -> Result<Self, LoadError> {
        let image = image::load_from_memory(bytes).map_err(|err| LoadError::Image {
            path: path.to_string(),
            message: err.to_string(),
        })?;
        let rgba = image.to_rgba8();
        let (width, height) = rgba.dimensions();
        let has_alpha = rgba.pixels().any(|pixel| pixel[3] < u8::MAX);
        Ok(Self {
            id: TextureId::next(),
            path: path.to_string(),
            width,
            height,
            rgba: rgba.into_raw(),
            has_alpha,
        })
    }

    /// Single-texel texture used when a material has no colour map.
    pub fn solid(path: &str, rgba: [u8; 4]) -> Self {
        Self {
            id: TextureId::next(),
            path: path.to_string(),
            width: 1,
            height: 1,
            rgba: rgba.to_vec(),
            has_alpha: rgba[3] < u8::MAX,
        }
    }
}

#[cfg(test)]
pub(crate) fn encode_png(width: u32, height: u32, alpha: u8) -> Vec<u8> {
    use std::io::Cursor;

    let image = image::RgbaImage::from_fn(width, height, |x, y| {
        image::Rgba([(x * 40) as u8, (y * 40) as u8, 128, alpha])
    });
    let mut bytes = Cursor::new(Vec::new());
    image
        .write_to(&mut bytes, image::ImageFormat::Png)
        .expect("encode png");
    bytes.into_inner()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_png_and_detects_alpha() {
        let opaque = Texture::decode("a.png", &encode_png(4, 2, 255)).unwrap();
        assert_eq!((opaque.width, opaque.height), (4, 2));
        assert_eq!(opaque.rgba.len(), 4 * 2 * 4);
        assert!(!opaque.has_alpha);

        let translucent = Texture::decode("b.png", &encode_png(2, 2, 100)).unwrap();
        assert!(translucent.has_alpha);
        assert_ne!(opaque.id, translucent.id);
    }

    #[test]
    fn garbage_fails_to_decode() {
        let err = Texture::decode("bad.bmp", b"not an image").unwrap_err();
        assert!(matches!(err, LoadError::Image { .. }));
    }
}
