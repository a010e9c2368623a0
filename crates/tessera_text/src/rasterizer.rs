//! Glyph rasterization using swash
//!
//! Resolves the key's codepoint through the font's charmap and renders it at
//! the key's size. Output always matches the atlas texel format: color
//! glyphs are reduced to their alpha channel in an `Alpha8` atlas, and
//! coverage masks are expanded to white RGBA in an `Rgba8` atlas.

use swash::scale::image::Content;
use swash::scale::{Render, ScaleContext, Source, StrikeWith};
use swash::zeno::Format;

use tessera_atlas::{GlyphKey, GlyphRasterizer, RasterError, RasterizedGlyph, TexelFormat};

use crate::fonts::SharedFontSet;
use crate::{Result, TextError};

/// swash-backed [`GlyphRasterizer`]
pub struct SwashRasterizer {
    fonts: SharedFontSet,
    /// Swash scale context (caches scaling state)
    context: ScaleContext,
    format: TexelFormat,
    hinting: bool,
}

impl SwashRasterizer {
    pub fn new(fonts: SharedFontSet, format: TexelFormat) -> Self {
        Self {
            fonts,
            context: ScaleContext::new(),
            format,
            hinting: true,
        }
    }

    /// Enable or disable outline hinting (on by default)
    pub fn with_hinting(mut self, hinting: bool) -> Self {
        self.hinting = hinting;
        self
    }

    pub fn fonts(&self) -> &SharedFontSet {
        &self.fonts
    }

    fn render(&mut self, key: &GlyphKey) -> Result<RasterizedGlyph> {
        if key.size == 0 {
            return Err(TextError::InvalidSize(key.size));
        }
        let missing = TextError::MissingGlyph {
            font_id: key.font_id,
            codepoint: key.codepoint,
        };

        let font = {
            let fonts = self.fonts.read().map_err(|_| TextError::Poisoned)?;
            fonts
                .get(key.font_id)
                .ok_or(TextError::UnknownFont(key.font_id))?
        };
        let font_ref = swash::FontRef::from_index(&font.data, font.index)
            .ok_or(TextError::FontParse { font_id: key.font_id })?;

        let ch = key.char().ok_or(missing)?;
        let glyph_id = font_ref.charmap().map(ch);
        if glyph_id == 0 {
            return Err(TextError::MissingGlyph {
                font_id: key.font_id,
                codepoint: key.codepoint,
            });
        }

        let mut scaler = self
            .context
            .builder(font_ref)
            .size(key.size_px())
            .hint(self.hinting)
            .build();

        let sources: &[Source] = match self.format {
            TexelFormat::Alpha8 => &[
                Source::ColorOutline(0),
                Source::ColorBitmap(StrikeWith::BestFit),
                Source::Outline,
            ],
            // Prefer color bitmaps for emoji
            TexelFormat::Rgba8 => &[
                Source::ColorBitmap(StrikeWith::BestFit),
                Source::ColorOutline(0),
                Source::Outline,
            ],
        };
        let mut render = Render::new(sources);
        render.format(Format::Alpha);

        let Some(image) = render.render(&mut scaler, glyph_id) else {
            // Empty glyph (like space)
            return Ok(RasterizedGlyph::empty());
        };

        let width = image.placement.width;
        let height = image.placement.height;
        if width == 0 || height == 0 {
            return Ok(RasterizedGlyph::empty());
        }

        let pixels = match (image.content, self.format) {
            (Content::Mask, TexelFormat::Alpha8) => image.data,
            (Content::Mask, TexelFormat::Rgba8) => mask_to_rgba(&image.data),
            (Content::Color | Content::SubpixelMask, TexelFormat::Alpha8) => {
                rgba_to_alpha(&image.data)
            }
            (Content::Color | Content::SubpixelMask, TexelFormat::Rgba8) => image.data,
        };

        Ok(RasterizedGlyph::new(width, height, pixels))
    }
}

impl Clone for SwashRasterizer {
    /// Shares the font set; the scale context is per clone
    fn clone(&self) -> Self {
        Self {
            fonts: self.fonts.clone(),
            context: ScaleContext::new(),
            format: self.format,
            hinting: self.hinting,
        }
    }
}

impl GlyphRasterizer for SwashRasterizer {
    fn rasterize(&mut self, key: &GlyphKey) -> std::result::Result<RasterizedGlyph, RasterError> {
        self.render(key).map_err(RasterError::from)
    }
}

fn mask_to_rgba(mask: &[u8]) -> Vec<u8> {
    let mut rgba = Vec::with_capacity(mask.len() * 4);
    for &alpha in mask {
        rgba.extend_from_slice(&[255, 255, 255, alpha]);
    }
    rgba
}

fn rgba_to_alpha(rgba: &[u8]) -> Vec<u8> {
    rgba.chunks_exact(4).map(|px| px[3]).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::FontSet;

    const SYSTEM_FONTS: &[&str] = &[
        "/usr/share/fonts/truetype/dejavu/DejaVuSans.ttf",
        "/usr/share/fonts/TTF/DejaVuSans.ttf",
        "/usr/share/fonts/dejavu/DejaVuSans.ttf",
        "/usr/share/fonts/truetype/liberation/LiberationSans-Regular.ttf",
        "/System/Library/Fonts/Supplemental/Arial.ttf",
        "C:\\Windows\\Fonts\\arial.ttf",
    ];

    /// Font set with one system font as id 0, if any is installed
    fn system_fonts() -> Option<SharedFontSet> {
        let mut fonts = FontSet::new();
        SYSTEM_FONTS
            .iter()
            .find(|path| fonts.load_file(0, path).is_ok())
            .map(|_| fonts.into_shared())
    }

    #[test]
    fn test_conversions() {
        assert_eq!(mask_to_rgba(&[7, 9]), vec![255, 255, 255, 7, 255, 255, 255, 9]);
        assert_eq!(rgba_to_alpha(&[1, 2, 3, 4, 5, 6, 7, 8]), vec![4, 8]);
    }

    #[test]
    fn test_unknown_font() {
        let mut raster = SwashRasterizer::new(FontSet::new().into_shared(), TexelFormat::Alpha8);
        let err = raster
            .rasterize(&GlyphKey::from_px(7, 'a', 12.0))
            .unwrap_err();
        assert_eq!(err, RasterError::UnknownFont(7));
    }

    #[test]
    fn test_zero_size_rejected() {
        let mut raster = SwashRasterizer::new(FontSet::new().into_shared(), TexelFormat::Alpha8);
        let err = raster.rasterize(&GlyphKey::new(0, 'a' as u32, 0)).unwrap_err();
        assert_eq!(err, RasterError::InvalidSize(0));
    }

    #[test]
    fn test_renders_alpha_glyph() {
        let Some(fonts) = system_fonts() else {
            // Skip test if no system font available
            return;
        };
        let mut raster = SwashRasterizer::new(fonts, TexelFormat::Alpha8);
        let glyph = raster.rasterize(&GlyphKey::from_px(0, 'A', 32.0)).unwrap();
        assert!(glyph.width > 0 && glyph.height > 0);
        assert_eq!(glyph.pixels.len(), (glyph.width * glyph.height) as usize);
        assert!(glyph.pixels.iter().any(|&a| a > 0));

        let space = raster.rasterize(&GlyphKey::from_px(0, ' ', 32.0)).unwrap();
        assert!(space.is_empty());
    }

    #[test]
    fn test_renders_rgba_glyph() {
        let Some(fonts) = system_fonts() else {
            return;
        };
        let mut raster = SwashRasterizer::new(fonts, TexelFormat::Rgba8).with_hinting(false);
        let glyph = raster.rasterize(&GlyphKey::from_px(0, 'g', 20.0)).unwrap();
        assert_eq!(glyph.pixels.len(), (glyph.width * glyph.height * 4) as usize);
    }

    #[test]
    fn test_missing_codepoint() {
        let Some(fonts) = system_fonts() else {
            return;
        };
        let mut raster = SwashRasterizer::new(fonts, TexelFormat::Alpha8);
        // Private use area
        let key = GlyphKey::new(0, 0xF8FF0, 16 << 16);
        assert!(matches!(
            raster.rasterize(&key),
            Err(RasterError::MissingGlyph { .. })
        ));
    }

    #[test]
    fn test_clones_share_fonts() {
        let fonts = FontSet::new().into_shared();
        let raster = SwashRasterizer::new(fonts.clone(), TexelFormat::Alpha8);
        let clone = raster.clone();
        assert!(std::sync::Arc::ptr_eq(raster.fonts(), clone.fonts()));
    }
}
