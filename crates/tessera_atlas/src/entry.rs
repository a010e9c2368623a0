//! Cache entries and their lifecycle
//!
//! ```text
//! Empty ──dispatch──▶ Loading ──raster ok──▶ Ready ──copy recorded──▶ Uploaded
//!                        │                                               ▲
//!                        └──────raster failed (blank, terminal)──────────┘
//! ```
//!
//! Evicting a `Ready` or `Uploaded` entry resets it to `Empty` and frees its
//! slot in the arena for the next miss.

use slotmap::new_key_type;

use crate::key::GlyphKey;
use crate::page_grid::{AtlasRect, PageIndex};
use crate::raster::RasterizedGlyph;

new_key_type! {
    /// Stable handle to a cache entry.
    ///
    /// Handles are generational: once the entry is evicted, the old handle
    /// never resolves again, even after its slot is reused.
    pub struct EntryId;
}

/// Lifecycle state of a cache entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntryState {
    /// Slot allocated, nothing requested yet (or evicted)
    Empty,
    /// Handed to the rasterizer; not evictable
    Loading,
    /// Bitmap available on the CPU, not yet copied to the atlas
    Ready,
    /// Copy recorded; safe to sample once the frame's commands are submitted
    Uploaded,
}

/// One resident or pending glyph
#[derive(Debug)]
pub struct CacheEntry {
    pub(crate) key: GlyphKey,
    pub(crate) state: EntryState,
    pub(crate) page: PageIndex,
    /// Glyph bitmap rect inside the page (zero-sized until rasterized)
    pub(crate) rect: AtlasRect,
    /// Towards the most recently used end
    pub(crate) lru_prev: Option<EntryId>,
    /// Towards the least recently used end
    pub(crate) lru_next: Option<EntryId>,
    /// Raster bytes, owned until the copy is recorded
    pub(crate) raster: Option<RasterizedGlyph>,
    /// A copy for this entry sits in the current upload frame
    pub(crate) upload_queued: bool,
    /// Rasterization failed; the entry is a permanently cached blank
    pub(crate) failed: bool,
}

impl CacheEntry {
    pub(crate) fn new(key: GlyphKey, page: PageIndex, page_rect: AtlasRect) -> Self {
        Self {
            key,
            state: EntryState::Empty,
            page,
            rect: AtlasRect::new(page_rect.x, page_rect.y, 0, 0),
            lru_prev: None,
            lru_next: None,
            raster: None,
            upload_queued: false,
            failed: false,
        }
    }

    /// Drop everything but the key and page, back to `Empty`
    pub(crate) fn reset(&mut self) {
        self.state = EntryState::Empty;
        self.rect.width = 0;
        self.rect.height = 0;
        self.lru_prev = None;
        self.lru_next = None;
        self.raster = None;
        self.upload_queued = false;
        self.failed = false;
    }

    pub fn key(&self) -> GlyphKey {
        self.key
    }

    pub fn state(&self) -> EntryState {
        self.state
    }

    /// Atlas page owned by this entry
    pub fn page(&self) -> PageIndex {
        self.page
    }

    /// Texel rectangle of the glyph bitmap in the atlas
    pub fn rect(&self) -> AtlasRect {
        self.rect
    }

    pub fn atlas_x(&self) -> u32 {
        self.rect.x
    }

    pub fn atlas_y(&self) -> u32 {
        self.rect.y
    }

    pub fn width(&self) -> u32 {
        self.rect.width
    }

    pub fn height(&self) -> u32 {
        self.rect.height
    }

    /// Bitmap bytes still waiting for upload
    pub fn raster(&self) -> Option<&RasterizedGlyph> {
        self.raster.as_ref()
    }

    /// True once rasterization failed; the glyph stays blank
    pub fn is_failed(&self) -> bool {
        self.failed
    }

    /// Uploaded entries may be sampled by draw code
    pub fn is_uploaded(&self) -> bool {
        self.state == EntryState::Uploaded
    }

    /// Uploaded with no texels (whitespace or a failed raster): nothing to draw
    pub fn is_blank(&self) -> bool {
        self.is_uploaded() && self.rect.is_empty()
    }

    /// Uploaded and has texels to sample
    pub fn is_drawable(&self) -> bool {
        self.is_uploaded() && !self.rect.is_empty()
    }

    /// Eviction may only pick entries whose bitmap is settled
    pub(crate) fn is_evictable(&self) -> bool {
        matches!(self.state, EntryState::Ready | EntryState::Uploaded)
    }
}
