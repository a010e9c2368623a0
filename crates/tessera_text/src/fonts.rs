//! Font set: atlas font ids to font data
//!
//! Glyph keys carry a bare `font_id`; this is where the id gets its bytes.
//! Fonts are parsed once on registration so a bad file fails early instead
//! of once per glyph.

use std::path::Path;
use std::sync::{Arc, RwLock};

use rustc_hash::FxHashMap;

use crate::{Result, TextError};

/// Font set shared by every rasterizer clone
pub type SharedFontSet = Arc<RwLock<FontSet>>;

/// Raw font bytes plus the face index inside a collection
#[derive(Debug, Clone)]
pub(crate) struct LoadedFont {
    pub(crate) data: Arc<[u8]>,
    pub(crate) index: usize,
}

/// Registered fonts by id
#[derive(Debug, Default)]
pub struct FontSet {
    fonts: FxHashMap<u32, LoadedFont>,
}

impl FontSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register face `index` of `data` (0 for plain TTF/OTF files) as
    /// `font_id`, replacing any previous font with that id
    pub fn register(&mut self, font_id: u32, data: Vec<u8>, index: usize) -> Result<()> {
        if swash::FontRef::from_index(&data, index).is_none() {
            return Err(TextError::FontParse { font_id });
        }
        let replaced = self
            .fonts
            .insert(
                font_id,
                LoadedFont {
                    data: data.into(),
                    index,
                },
            )
            .is_some();
        if replaced {
            tracing::debug!("replaced font {}", font_id);
        }
        Ok(())
    }

    /// Read a font file and register its first face
    pub fn load_file(&mut self, font_id: u32, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let data = std::fs::read(path)?;
        self.register(font_id, data, 0)?;
        tracing::debug!("loaded font {} from {}", font_id, path.display());
        Ok(())
    }

    /// Forget a font. Glyphs already in the atlas are unaffected.
    pub fn remove(&mut self, font_id: u32) -> bool {
        self.fonts.remove(&font_id).is_some()
    }

    pub fn contains(&self, font_id: u32) -> bool {
        self.fonts.contains_key(&font_id)
    }

    pub fn len(&self) -> usize {
        self.fonts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fonts.is_empty()
    }

    pub(crate) fn get(&self, font_id: u32) -> Option<LoadedFont> {
        self.fonts.get(&font_id).cloned()
    }

    pub fn into_shared(self) -> SharedFontSet {
        Arc::new(RwLock::new(self))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_garbage() {
        let mut fonts = FontSet::new();
        let err = fonts.register(3, vec![0, 1, 2, 3], 0).unwrap_err();
        assert!(matches!(err, TextError::FontParse { font_id: 3 }));
        assert!(fonts.is_empty());
    }

    #[test]
    fn test_missing_file() {
        let mut fonts = FontSet::new();
        let err = fonts
            .load_file(1, "/nonexistent/tessera/font.ttf")
            .unwrap_err();
        assert!(matches!(err, TextError::Io(_)));
    }
}
