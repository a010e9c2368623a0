//! Atlas error types

use thiserror::Error;

use crate::config::ConfigError;
use crate::entry::EntryState;
use crate::gpu::GpuError;
use crate::key::GlyphKey;
use crate::raster::RasterError;

/// Atlas errors
///
/// Only [`AtlasError::Gpu`] escapes [`AtlasManager`](crate::AtlasManager)
/// at runtime; capacity exhaustion, rasterization failure and upload
/// backpressure are absorbed and show up as glyphs that are not ready yet.
#[derive(Error, Debug)]
pub enum AtlasError {
    /// The configuration is unusable
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The GPU context failed; the whole renderer must be torn down
    #[error("gpu failure: {0}")]
    Gpu(#[from] GpuError),

    /// A state transition that the entry lifecycle does not allow
    #[error("invalid glyph transition {from:?} -> {to:?} for {key:?}")]
    InvalidTransition {
        key: GlyphKey,
        from: EntryState,
        to: EntryState,
    },

    /// The entry handle refers to a slot that has been evicted or reused
    #[error("stale glyph entry handle")]
    StaleEntry,

    /// A bitmap handed to the cache does not match its dimensions
    #[error(transparent)]
    Raster(#[from] RasterError),

    /// A page was freed that the grid never handed out
    #[error("page {0} is not allocated")]
    PageNotAllocated(u32),

    /// A rasterization worker thread could not be started
    #[error("failed to spawn rasterization worker: {0}")]
    WorkerSpawn(#[source] std::io::Error),
}

impl AtlasError {
    /// True for errors that invalidate the GPU context
    pub fn is_fatal(&self) -> bool {
        matches!(self, AtlasError::Gpu(_))
    }
}

/// Result type for atlas operations
pub type Result<T> = std::result::Result<T, AtlasError>;
