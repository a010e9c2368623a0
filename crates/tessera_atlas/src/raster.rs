//! Rasterizer seam
//!
//! The atlas does not rasterize glyphs itself. Whatever produces the bitmaps
//! (a font engine, a bitmap font, a cache on disk) implements
//! [`GlyphRasterizer`]; `tessera_text` provides one backed by swash.

use thiserror::Error;

use crate::key::GlyphKey;

/// Rasterized glyph bitmap
///
/// Rows are tightly packed in the atlas texel format
/// (`width * bytes_per_texel` bytes per row).
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RasterizedGlyph {
    /// Bitmap width in texels
    pub width: u32,
    /// Bitmap height in texels
    pub height: u32,
    /// Pixel data, row-major
    pub pixels: Vec<u8>,
}

impl RasterizedGlyph {
    pub fn new(width: u32, height: u32, pixels: Vec<u8>) -> Self {
        Self {
            width,
            height,
            pixels,
        }
    }

    /// Glyph with no ink (e.g. a space)
    pub fn empty() -> Self {
        Self::default()
    }

    /// True if there is nothing to upload
    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    /// Bytes needed for a tightly packed bitmap of this size
    pub fn packed_len(&self, bytes_per_texel: u32) -> usize {
        self.width as usize * self.height as usize * bytes_per_texel as usize
    }

    /// Check that the pixel buffer covers the declared size
    pub(crate) fn check_len(&self, bytes_per_texel: u32) -> Result<(), RasterError> {
        let expected = self.packed_len(bytes_per_texel);
        if self.pixels.len() < expected {
            return Err(RasterError::Truncated {
                width: self.width,
                height: self.height,
                expected,
                actual: self.pixels.len(),
            });
        }
        Ok(())
    }

    /// Crop to at most `max` x `max` texels (top-left corner kept)
    pub(crate) fn clip_to(self, max: u32, bytes_per_texel: u32) -> Self {
        if self.width <= max && self.height <= max {
            return self;
        }
        let width = self.width.min(max);
        let height = self.height.min(max);
        let src_row = self.width as usize * bytes_per_texel as usize;
        let dst_row = width as usize * bytes_per_texel as usize;
        let mut pixels = Vec::with_capacity(dst_row * height as usize);
        for row in self.pixels.chunks(src_row).take(height as usize) {
            pixels.extend_from_slice(&row[..dst_row]);
        }
        Self {
            width,
            height,
            pixels,
        }
    }
}

/// Rasterization failures
///
/// A failed glyph is cached as a blank so it is not retried every frame.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RasterError {
    #[error("unknown font id {0}")]
    UnknownFont(u32),

    #[error("font {font_id} has no glyph for U+{codepoint:04X}")]
    MissingGlyph { font_id: u32, codepoint: u32 },

    #[error("invalid glyph size {0:#x} (16.16)")]
    InvalidSize(u32),

    #[error("bitmap {width}x{height} needs {expected} bytes, got {actual}")]
    Truncated {
        width: u32,
        height: u32,
        expected: usize,
        actual: usize,
    },

    #[error("rasterizer error: {0}")]
    Engine(String),

    #[error("rasterizer panicked: {0}")]
    Panicked(String),
}

/// Produces glyph bitmaps for cache misses.
///
/// In background mode every worker owns its own clone, so implementations
/// are free to keep mutable scratch state (scaler contexts, buffers).
pub trait GlyphRasterizer: Send {
    /// Rasterize `key` in the atlas texel format
    fn rasterize(&mut self, key: &GlyphKey) -> Result<RasterizedGlyph, RasterError>;
}

impl<F> GlyphRasterizer for F
where
    F: FnMut(&GlyphKey) -> Result<RasterizedGlyph, RasterError> + Send,
{
    fn rasterize(&mut self, key: &GlyphKey) -> Result<RasterizedGlyph, RasterError> {
        self(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_closure_is_a_rasterizer() {
        let mut raster = |key: &GlyphKey| -> Result<RasterizedGlyph, RasterError> {
            Ok(RasterizedGlyph::new(1, 1, vec![key.codepoint as u8]))
        };
        let glyph = raster.rasterize(&GlyphKey::new(0, 7, 0)).unwrap();
        assert_eq!(glyph.pixels, vec![7]);
    }

    #[test]
    fn test_clip_keeps_top_left() {
        // 3x3 alpha bitmap, values = row * 10 + col
        let pixels = vec![0, 1, 2, 10, 11, 12, 20, 21, 22];
        let glyph = RasterizedGlyph::new(3, 3, pixels).clip_to(2, 1);
        assert_eq!((glyph.width, glyph.height), (2, 2));
        assert_eq!(glyph.pixels, vec![0, 1, 10, 11]);
    }

    #[test]
    fn test_clip_rgba_rows() {
        let pixels: Vec<u8> = (0..2 * 3 * 4).collect();
        let glyph = RasterizedGlyph::new(3, 2, pixels).clip_to(1, 4);
        assert_eq!((glyph.width, glyph.height), (1, 1));
        assert_eq!(glyph.pixels, vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_truncated_bitmap_detected() {
        let glyph = RasterizedGlyph::new(4, 4, vec![0; 15]);
        assert!(matches!(
            glyph.check_len(1),
            Err(RasterError::Truncated { expected: 16, actual: 15, .. })
        ));
        assert!(RasterizedGlyph::empty().check_len(4).is_ok());
    }
}
