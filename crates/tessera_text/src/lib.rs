//! Font-backed glyph rasterization for the Tessera glyph atlas
//!
//! This crate provides:
//! - A font set mapping atlas font ids to font files
//! - A swash rasterizer implementing [`tessera_atlas::GlyphRasterizer`]

pub mod fonts;
pub mod rasterizer;

pub use fonts::{FontSet, SharedFontSet};
pub use rasterizer::SwashRasterizer;

use tessera_atlas::RasterError;
use thiserror::Error;

/// Text rasterization errors
#[derive(Error, Debug)]
pub enum TextError {
    #[error("font {font_id} could not be parsed")]
    FontParse { font_id: u32 },

    #[error("no font registered for id {0}")]
    UnknownFont(u32),

    #[error("failed to read font file: {0}")]
    Io(#[from] std::io::Error),

    #[error("font {font_id} has no glyph for U+{codepoint:04X}")]
    MissingGlyph { font_id: u32, codepoint: u32 },

    #[error("invalid glyph size {0:#x}")]
    InvalidSize(u32),

    #[error("font set lock poisoned")]
    Poisoned,
}

impl From<TextError> for RasterError {
    fn from(e: TextError) -> Self {
        match e {
            TextError::UnknownFont(id) => RasterError::UnknownFont(id),
            TextError::MissingGlyph { font_id, codepoint } => {
                RasterError::MissingGlyph { font_id, codepoint }
            }
            TextError::InvalidSize(size) => RasterError::InvalidSize(size),
            other => RasterError::Engine(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, TextError>;
