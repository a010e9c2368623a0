//! Glyph cache: key table, entry arena and LRU order
//!
//! The cache owns every [`CacheEntry`]. Entries live in a generational arena
//! sized to the page capacity; the key table maps [`GlyphKey`] to arena
//! handles and the LRU list threads through the entries themselves.
//!
//! Each resident entry (including ones still loading) owns exactly one page,
//! so the arena, the table and the occupied pages always have the same size.

use rustc_hash::FxHashMap;
use slotmap::SlotMap;

use crate::config::AtlasConfig;
use crate::entry::{CacheEntry, EntryId, EntryState};
use crate::error::{AtlasError, Result};
use crate::key::GlyphKey;
use crate::lru::LruList;
use crate::page_grid::{AtlasRect, PageGrid};
use crate::raster::RasterizedGlyph;

/// Outcome of a cache lookup
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheLookup {
    /// Entry already present (in any state); promoted to most recently used
    Hit(EntryId),
    /// New entry created in `Loading`; the caller must dispatch rasterization
    Miss(EntryId),
    /// Grid full and every resident entry is still loading; retry next frame
    Deferred,
}

/// What a successful `mark_ready` left behind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    /// Entry is `Ready` and its bitmap must be uploaded
    NeedsUpload,
    /// Bitmap had no texels; entry went straight to `Uploaded`
    Blank,
}

/// Cache counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    /// Misses that could not get a page (subset of `misses`)
    pub deferred: u64,
}

/// Fixed-capacity glyph cache with LRU eviction
#[derive(Debug)]
pub struct GlyphCache {
    entries: SlotMap<EntryId, CacheEntry>,
    table: FxHashMap<GlyphKey, EntryId>,
    lru: LruList,
    grid: PageGrid,
    bytes_per_texel: u32,
    loading: usize,
    /// Evicted entries whose copy was still queued for the current frame
    cancelled_uploads: Vec<EntryId>,
    stats: CacheStats,
}

impl GlyphCache {
    /// Create an empty cache for the configured atlas
    pub fn new(config: &AtlasConfig) -> Self {
        let grid = PageGrid::new(config);
        let capacity = grid.capacity();
        Self {
            entries: SlotMap::with_capacity_and_key(capacity),
            table: FxHashMap::with_capacity_and_hasher(capacity, Default::default()),
            lru: LruList::new(),
            grid,
            bytes_per_texel: config.texel_format.bytes_per_texel(),
            loading: 0,
            cancelled_uploads: Vec::new(),
            stats: CacheStats::default(),
        }
    }

    /// Look up `key`, creating a `Loading` entry on a miss.
    ///
    /// A miss on a full grid evicts the least recently used settled entry.
    /// When every resident entry is still loading nothing can be evicted and
    /// the request is deferred instead of blocking.
    pub fn request(&mut self, key: GlyphKey) -> CacheLookup {
        if let Some(&id) = self.table.get(&key) {
            self.stats.hits += 1;
            self.lru.touch(&mut self.entries, id);
            return CacheLookup::Hit(id);
        }

        self.stats.misses += 1;

        let page = match self.grid.allocate() {
            Some(page) => page,
            None => {
                let page = self.evict_lru().and_then(|_| self.grid.allocate());
                match page {
                    Some(page) => page,
                    None => {
                        self.stats.deferred += 1;
                        tracing::trace!("atlas full of in-flight glyphs, deferring {:?}", key);
                        return CacheLookup::Deferred;
                    }
                }
            }
        };

        let mut entry = CacheEntry::new(key, page, self.grid.page_rect(page));
        entry.state = EntryState::Loading;
        let id = self.entries.insert(entry);
        self.table.insert(key, id);
        self.lru.push_front(&mut self.entries, id);
        self.loading += 1;

        tracing::trace!("glyph miss {:?} -> page {}", key, page.0);
        CacheLookup::Miss(id)
    }

    /// `Loading -> Ready`: take ownership of the raster bytes.
    ///
    /// Bitmaps larger than a page are clipped to the page. Any other source
    /// state is rejected, so a glyph can never be queued for upload twice. A
    /// bitmap shorter than `width * height` texels is rejected and the entry
    /// stays `Loading`.
    pub fn mark_ready(&mut self, id: EntryId, raster: RasterizedGlyph) -> Result<Readiness> {
        let page_size = self.grid.page_size();
        let bytes_per_texel = self.bytes_per_texel;
        let entry = self.loading_entry(id, EntryState::Ready)?;
        raster.check_len(bytes_per_texel)?;

        let raster = if raster.width > page_size || raster.height > page_size {
            tracing::warn!(
                "glyph {:?} is {}x{}, clipping to {}px page",
                entry.key,
                raster.width,
                raster.height,
                page_size
            );
            raster.clip_to(page_size, bytes_per_texel)
        } else {
            raster
        };

        let readiness = if raster.is_empty() {
            entry.state = EntryState::Uploaded;
            Readiness::Blank
        } else {
            entry.rect.width = raster.width;
            entry.rect.height = raster.height;
            entry.raster = Some(raster);
            entry.state = EntryState::Ready;
            Readiness::NeedsUpload
        };
        self.loading -= 1;
        Ok(readiness)
    }

    /// `Loading -> Uploaded` as a permanent blank after a failed rasterization
    pub fn mark_failed(&mut self, id: EntryId) -> Result<()> {
        let entry = self.loading_entry(id, EntryState::Uploaded)?;
        entry.state = EntryState::Uploaded;
        entry.failed = true;
        self.loading -= 1;
        Ok(())
    }

    /// `Ready -> Uploaded` once the copy has been recorded; frees the bytes
    pub fn mark_uploaded(&mut self, id: EntryId) -> Result<()> {
        let entry = self.entries.get_mut(id).ok_or(AtlasError::StaleEntry)?;
        if entry.state != EntryState::Ready {
            return Err(AtlasError::InvalidTransition {
                key: entry.key,
                from: entry.state,
                to: EntryState::Uploaded,
            });
        }
        entry.state = EntryState::Uploaded;
        entry.raster = None;
        entry.upload_queued = false;
        Ok(())
    }

    /// Evict the least recently used `Ready` or `Uploaded` entry.
    ///
    /// Loading entries are skipped no matter how old they are. Returns the
    /// evicted entry reset to `Empty`, or `None` if nothing is evictable.
    pub fn evict_lru(&mut self) -> Option<CacheEntry> {
        let id = self
            .lru
            .find_from_tail(&self.entries, CacheEntry::is_evictable)?;
        let entry = self.remove(id)?;
        self.stats.evictions += 1;
        tracing::trace!("evicted {:?} from page {}", entry.key, entry.page.0);
        Some(entry)
    }

    /// Drop every settled entry; loading entries stay and complete normally
    pub fn clear(&mut self) {
        let settled: Vec<EntryId> = self
            .lru
            .iter(&self.entries)
            .filter(|&id| self.entries[id].is_evictable())
            .collect();
        for id in settled {
            self.remove(id);
        }
    }

    fn remove(&mut self, id: EntryId) -> Option<CacheEntry> {
        self.lru.unlink(&mut self.entries, id);
        let mut entry = self.entries.remove(id)?;
        self.table.remove(&entry.key);
        if let Err(e) = self.grid.free(entry.page) {
            tracing::error!("page bookkeeping out of sync for {:?}: {}", entry.key, e);
        }
        if entry.upload_queued {
            self.cancelled_uploads.push(id);
        }
        entry.reset();
        Some(entry)
    }

    fn loading_entry(&mut self, id: EntryId, to: EntryState) -> Result<&mut CacheEntry> {
        let entry = self.entries.get_mut(id).ok_or(AtlasError::StaleEntry)?;
        if entry.state != EntryState::Loading {
            return Err(AtlasError::InvalidTransition {
                key: entry.key,
                from: entry.state,
                to,
            });
        }
        Ok(entry)
    }

    pub(crate) fn set_upload_queued(&mut self, id: EntryId, queued: bool) {
        if let Some(entry) = self.entries.get_mut(id) {
            entry.upload_queued = queued;
        }
    }

    /// Entries evicted while their copy was queued; the upload pipeline must
    /// drop those copies before recording
    pub(crate) fn take_cancelled_uploads(&mut self) -> Vec<EntryId> {
        std::mem::take(&mut self.cancelled_uploads)
    }

    /// Raster bytes and destination of a `Ready` entry
    pub(crate) fn pending_upload(&self, id: EntryId) -> Option<(&RasterizedGlyph, AtlasRect)> {
        let entry = self.entries.get(id)?;
        if entry.state != EntryState::Ready || entry.upload_queued {
            return None;
        }
        entry.raster.as_ref().map(|raster| (raster, entry.rect))
    }

    /// Resolve a handle; `None` once the entry was evicted
    pub fn entry(&self, id: EntryId) -> Option<&CacheEntry> {
        self.entries.get(id)
    }

    /// Handle for `key` without counting a lookup or touching the LRU order
    pub fn peek(&self, key: &GlyphKey) -> Option<EntryId> {
        self.table.get(key).copied()
    }

    /// Keys from most to least recently used
    pub fn keys_by_recency(&self) -> Vec<GlyphKey> {
        self.lru
            .iter(&self.entries)
            .map(|id| self.entries[id].key)
            .collect()
    }

    /// Number of resident entries (any state)
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries waiting on the rasterizer
    pub fn loading(&self) -> usize {
        self.loading
    }

    /// Page capacity of the atlas
    pub fn capacity(&self) -> usize {
        self.grid.capacity()
    }

    pub fn grid(&self) -> &PageGrid {
        &self.grid
    }

    pub fn stats(&self) -> CacheStats {
        self.stats
    }

    #[cfg(test)]
    pub(crate) fn check_invariants(&self) {
        assert_eq!(self.entries.len(), self.table.len());
        assert_eq!(self.entries.len(), self.lru.len());
        assert_eq!(self.entries.len(), self.grid.occupied());
        assert_eq!(self.lru.iter(&self.entries).count(), self.lru.len());
        let loading = self
            .entries
            .values()
            .filter(|e| e.state == EntryState::Loading)
            .count();
        assert_eq!(loading, self.loading);
        for (id, entry) in &self.entries {
            assert_eq!(self.table.get(&entry.key), Some(&id));
            assert!(self.grid.is_occupied(entry.page));
        }
    }
}
