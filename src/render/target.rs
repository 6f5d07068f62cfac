use std::path::Path;

use anyhow::{anyhow, Context, Result};
use image::RgbaImage;

/// Pixel surface owned by the compositing layer that the renderer draws
/// into.
pub trait RenderTarget {
    fn size(&self) -> (u32, u32);

    /// True when row 0 of the surface is the bottom of the image.
    fn bottom_up(&self) -> bool {
        false
    }

    /// Receives tightly packed RGBA8 rows, `width * height * 4` bytes, in
    /// the surface's own row order.
    fn write_rgba(&mut self, pixels: &[u8]);

    /// Called once after each completed render.
    fn mark_dirty(&mut self);
}

/// In-memory RGBA surface.
#[derive(Debug, Clone)]
pub struct PixelSurface {
    width: u32,
    height: u32,
    bottom_up: bool,
    pixels: Vec<u8>,
    dirty: bool,
}

impl PixelSurface {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            bottom_up: false,
            pixels: vec![0; width as usize * height as usize * 4],
            dirty: false,
        }
    }

    /// Surface whose first row is the bottom of the image.
    pub fn bottom_up(width: u32, height: u32) -> Self {
        Self {
            bottom_up: true,
            ..Self::new(width, height)
        }
    }

    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    pub fn pixel(&self, x: u32, y: u32) -> Option<[u8; 4]> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let offset = (y as usize * self.width as usize + x as usize) * 4;
        let mut pixel = [0; 4];
        pixel.copy_from_slice(&self.pixels[offset..offset + 4]);
        Some(pixel)
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Returns and clears the dirty flag.
    pub fn take_dirty(&mut self) -> bool {
        std::mem::replace(&mut self.dirty, false)
    }

    /// Copies the surface into a top-down image.
    pub fn to_image(&self) -> Result<RgbaImage> {
        let mut image = RgbaImage::from_raw(self.width, self.height, self.pixels.clone())
            .ok_or_else(|| anyhow!("surface buffer does not match {}x{}", self.width, self.height))?;
        if self.bottom_up {
            image::imageops::flip_vertical_in_place(&mut image);
        }
        Ok(image)
    }

    pub fn save_png(&self, path: &Path) -> Result<()> {
        self.to_image()?
            .save_with_format(path, image::ImageFormat::Png)
            .with_context(|| format!("failed to write {}", path.display()))
    }
}

impl RenderTarget for PixelSurface {
    fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn bottom_up(&self) -> bool {
        self.bottom_up
    }

    fn write_rgba(&mut self, pixels: &[u8]) {
        let len = self.pixels.len().min(pixels.len());
        self.pixels[..len].copy_from_slice(&pixels[..len]);
    }

    fn mark_dirty(&mut self) {
        self.dirty = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_and_reports_dirty() {
        let mut surface = PixelSurface::new(2, 1);
        surface.write_rgba(&[1, 2, 3, 4, 5, 6, 7, 8]);
        surface.mark_dirty();
        assert_eq!(surface.pixel(1, 0), Some([5, 6, 7, 8]));
        assert_eq!(surface.pixel(2, 0), None);
        assert!(surface.take_dirty());
        assert!(!surface.is_dirty());
    }

    #[test]
    fn bottom_up_surfaces_flip_when_exported() {
        let mut surface = PixelSurface::bottom_up(1, 2);
        surface.write_rgba(&[255, 0, 0, 255, 0, 0, 255, 255]);
        let image = surface.to_image().unwrap();
        assert_eq!(image.get_pixel(0, 0).0, [0, 0, 255, 255]);
        assert_eq!(image.get_pixel(0, 1).0, [255, 0, 0, 255]);
    }

    #[test]
    fn saves_png_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("frame.png");
        PixelSurface::new(4, 4).save_png(&path).unwrap();
        let decoded = image::open(&path).unwrap();
        assert_eq!(decoded.width(), 4);
    }
}
