//! Glyph cache key

/// Fractional bits of the fixed-point glyph size
pub const SIZE_FRACTION_BITS: u32 = 16;

const SIZE_ONE: f32 = (1u32 << SIZE_FRACTION_BITS) as f32;

/// Identity of one rasterized glyph bitmap.
///
/// Equality is an exact field match: the same codepoint at two sizes, or in
/// two fonts, occupies two cache entries. Sizes are never interpolated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GlyphKey {
    /// Font identifier, as understood by the rasterizer
    pub font_id: u32,
    /// Unicode scalar value
    pub codepoint: u32,
    /// Pixel size in 16.16 fixed point
    pub size: u32,
}

impl GlyphKey {
    /// Create a key from an already fixed-point size
    pub const fn new(font_id: u32, codepoint: u32, size: u32) -> Self {
        Self {
            font_id,
            codepoint,
            size,
        }
    }

    /// Create a key from a character and a pixel size.
    ///
    /// Negative and non-finite sizes collapse to zero; sizes beyond the
    /// 16.16 range saturate.
    pub fn from_px(font_id: u32, ch: char, size_px: f32) -> Self {
        Self::new(font_id, ch as u32, px_to_fixed(size_px))
    }

    /// Pixel size as a float
    pub fn size_px(&self) -> f32 {
        self.size as f32 / SIZE_ONE
    }

    /// The codepoint as a `char`, if it is a valid scalar value
    pub fn char(&self) -> Option<char> {
        char::from_u32(self.codepoint)
    }
}

/// Convert a pixel size to 16.16 fixed point
pub fn px_to_fixed(size_px: f32) -> u32 {
    if !size_px.is_finite() || size_px <= 0.0 {
        return 0;
    }
    // `as` saturates for out-of-range floats
    (size_px * SIZE_ONE).round() as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_point_round_trip() {
        let key = GlyphKey::from_px(1, 'a', 14.5);
        assert_eq!(key.size, 14 * 65536 + 32768);
        assert_eq!(key.size_px(), 14.5);
        assert_eq!(key.char(), Some('a'));
    }

    #[test]
    fn test_sizes_are_distinct_keys() {
        let a = GlyphKey::from_px(1, 'a', 14.0);
        let b = GlyphKey::from_px(1, 'a', 14.01);
        let c = GlyphKey::from_px(2, 'a', 14.0);
        assert_ne!(a, b);
        assert_ne!(a, c);
        assert_eq!(a, GlyphKey::new(1, 'a' as u32, 14 << 16));
    }

    #[test]
    fn test_degenerate_sizes() {
        assert_eq!(px_to_fixed(-3.0), 0);
        assert_eq!(px_to_fixed(f32::NAN), 0);
        assert_eq!(px_to_fixed(f32::INFINITY), 0);
        assert_eq!(px_to_fixed(1.0e9), u32::MAX);
    }
}
