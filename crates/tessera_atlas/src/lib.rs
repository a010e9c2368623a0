//! Tessera glyph atlas
//!
//! A fixed-capacity GPU glyph cache for text renderers:
//! - Uniform page grid over a single atlas texture (one glyph per page)
//! - Hash lookup plus intrusive LRU eviction
//! - Inline or background rasterization behind [`GlyphRasterizer`]
//! - Triple-buffered staging uploads with per-frame fences and barriers
//!
//! The GPU is reached through [`GpuBackend`]; `tessera_gpu` implements it on
//! wgpu and [`headless::HeadlessBackend`] keeps the atlas in memory.
//!
//! ```
//! use tessera_atlas::headless::{HeadlessBackend, HeadlessCommands};
//! use tessera_atlas::{AtlasConfig, AtlasManager, DispatchMode, GlyphKey, RasterizedGlyph};
//!
//! let config = AtlasConfig::square(512, 64);
//! let backend = HeadlessBackend::new(&config);
//! let raster = |_key: &GlyphKey| -> Result<RasterizedGlyph, tessera_atlas::RasterError> {
//!     Ok(RasterizedGlyph::new(8, 8, vec![255; 64]))
//! };
//! let mut atlas = AtlasManager::new(config, backend, raster, DispatchMode::Inline).unwrap();
//!
//! let key = GlyphKey::from_px(0, 'g', 14.0);
//! atlas.request_glyph(key).unwrap();
//!
//! let mut cmd = HeadlessCommands::default();
//! atlas.process_uploads(&mut cmd).unwrap();
//! atlas.backend_mut().submit(cmd).unwrap();
//!
//! assert!(atlas.peek(&key).unwrap().is_drawable());
//! ```

pub mod cache;
pub mod config;
pub mod dispatch;
pub mod entry;
pub mod error;
pub mod gpu;
pub mod headless;
pub mod key;
mod lru;
pub mod manager;
pub mod page_grid;
pub mod raster;
pub mod upload;

pub use cache::{CacheLookup, CacheStats, GlyphCache, Readiness};
pub use config::{AtlasConfig, ConfigError, TexelFormat};
pub use dispatch::{DispatchMode, RasterCompletion, RasterDispatcher, RasterJob};
pub use entry::{CacheEntry, EntryId, EntryState};
pub use error::{AtlasError, Result};
pub use gpu::{AtlasAccess, GpuBackend, GpuError};
pub use key::{px_to_fixed, GlyphKey};
pub use manager::{AtlasManager, AtlasStats, GlyphLookup, SharedAtlas, UploadReport};
pub use page_grid::{AtlasRect, PageGrid, PageIndex};
pub use raster::{GlyphRasterizer, RasterError, RasterizedGlyph};
pub use upload::{QueueError, UploadCommand, UploadPipeline};
