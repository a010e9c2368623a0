//! Atlas manager
//!
//! Ties the cache, the rasterization dispatcher and the upload pipeline
//! together behind the three calls a text renderer makes:
//!
//! - [`AtlasManager::request_glyph`] while laying out a frame
//! - [`AtlasManager::process_uploads`] once per frame, before drawing
//! - [`AtlasManager::stats`] for diagnostics
//!
//! Everything here runs on the render thread. Background rasterization only
//! produces [`RasterCompletion`]s; the manager applies them when it drains the
//! completion queue.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use crate::cache::{CacheLookup, CacheStats, GlyphCache, Readiness};
use crate::config::{log_atlas_config, AtlasConfig};
use crate::dispatch::{DispatchMode, RasterCompletion, RasterDispatcher, RasterJob};
use crate::entry::{CacheEntry, EntryId};
use crate::error::{AtlasError, Result};
use crate::gpu::{GpuBackend, GpuError};
use crate::key::GlyphKey;
use crate::raster::GlyphRasterizer;
use crate::upload::{QueueError, UploadPipeline};

/// Result of [`AtlasManager::request_glyph`]
#[derive(Debug, Clone, Copy)]
pub enum GlyphLookup<'a> {
    /// Already cached; check [`CacheEntry::is_drawable`] before sampling
    Hit(&'a CacheEntry),
    /// Newly created entry (`Loading`, or further along in inline mode)
    Miss(&'a CacheEntry),
    /// No page could be freed this frame; ask again next frame
    Deferred,
}

impl<'a> GlyphLookup<'a> {
    pub fn entry(&self) -> Option<&'a CacheEntry> {
        match *self {
            GlyphLookup::Hit(entry) | GlyphLookup::Miss(entry) => Some(entry),
            GlyphLookup::Deferred => None,
        }
    }

    pub fn is_hit(&self) -> bool {
        matches!(self, GlyphLookup::Hit(_))
    }

    pub fn is_deferred(&self) -> bool {
        matches!(self, GlyphLookup::Deferred)
    }
}

/// Atlas counters since creation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AtlasStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    /// Copies recorded into command buffers
    pub uploads: u64,
    /// Glyphs whose rasterization failed (cached as blanks)
    pub failures: u64,
    /// Misses that found no evictable page
    pub deferred_requests: u64,
    /// Ready glyphs that did not fit in the open upload frame
    pub upload_backpressure: u64,
    /// Entries currently resident (any state)
    pub resident: usize,
    /// Entries waiting on the rasterizer
    pub loading: usize,
    /// Page capacity of the atlas
    pub capacity: usize,
}

impl AtlasStats {
    /// Fraction of lookups served from the cache
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// What one `process_uploads` call did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UploadReport {
    /// Background completions applied
    pub completions: usize,
    /// Copies recorded into the command buffer
    pub recorded: usize,
    /// Ready glyphs still waiting for staging space
    pub deferred: usize,
}

/// Glyph atlas shared between a layout thread and the render thread
pub type SharedAtlas<B, R> = Arc<Mutex<AtlasManager<B, R>>>;

/// GPU glyph atlas: cache + rasterization + streamed uploads
pub struct AtlasManager<B: GpuBackend, R: GlyphRasterizer> {
    config: AtlasConfig,
    backend: B,
    cache: GlyphCache,
    dispatcher: RasterDispatcher<R>,
    pipeline: UploadPipeline<B>,
    /// Ready entries that did not fit in the open frame, oldest first
    deferred_uploads: VecDeque<EntryId>,
    uploads: u64,
    failures: u64,
    upload_backpressure: u64,
}

impl<B, R> AtlasManager<B, R>
where
    B: GpuBackend,
    R: GlyphRasterizer + Clone + 'static,
{
    /// Validate `config`, create the upload resources and start the
    /// rasterization workers (in background mode)
    pub fn new(config: AtlasConfig, mut backend: B, rasterizer: R, mode: DispatchMode) -> Result<Self> {
        config.validate()?;
        log_atlas_config(&config);

        let cache = GlyphCache::new(&config);
        let pipeline = UploadPipeline::new(&mut backend, &config)?;
        let dispatcher =
            RasterDispatcher::new(rasterizer, mode, config.texel_format.bytes_per_texel())?;

        Ok(Self {
            config,
            backend,
            cache,
            dispatcher,
            pipeline,
            deferred_uploads: VecDeque::new(),
            uploads: 0,
            failures: 0,
            upload_backpressure: 0,
        })
    }

    /// Wrap in [`SharedAtlas`]
    pub fn into_shared(self) -> SharedAtlas<B, R> {
        Arc::new(Mutex::new(self))
    }
}

impl<B: GpuBackend, R: GlyphRasterizer> AtlasManager<B, R> {
    /// Look up a glyph, starting rasterization on a miss.
    ///
    /// A hit refreshes the glyph's LRU position. Only GPU failures are
    /// returned as errors; a glyph that cannot be cached right now comes back
    /// as [`GlyphLookup::Deferred`].
    pub fn request_glyph(&mut self, key: GlyphKey) -> Result<GlyphLookup<'_>> {
        let id = match self.cache.request(key) {
            CacheLookup::Hit(id) => {
                return Ok(self
                    .cache
                    .entry(id)
                    .map_or(GlyphLookup::Deferred, GlyphLookup::Hit));
            }
            CacheLookup::Deferred => return Ok(GlyphLookup::Deferred),
            CacheLookup::Miss(id) => id,
        };

        if let Some(completion) = self.dispatcher.dispatch(RasterJob { entry: id, key }) {
            self.apply_completion(completion)?;
        }

        Ok(self
            .cache
            .entry(id)
            .map_or(GlyphLookup::Deferred, GlyphLookup::Miss))
    }

    /// Apply finished background rasterizations without recording anything.
    ///
    /// `process_uploads` does this too; call it directly to make glyphs
    /// `Ready` earlier in the frame.
    pub fn pump_completions(&mut self) -> Result<usize> {
        let mut applied = 0;
        while let Some(completion) = self.dispatcher.try_completion() {
            self.apply_completion(completion)?;
            applied += 1;
        }
        Ok(applied)
    }

    /// Block until every background rasterization has finished and apply
    /// the results
    pub fn wait_idle(&mut self) -> Result<usize> {
        let mut applied = 0;
        while let Some(completion) = self.dispatcher.wait_completion() {
            self.apply_completion(completion)?;
            applied += 1;
        }
        Ok(applied)
    }

    fn apply_completion(&mut self, completion: RasterCompletion) -> Result<()> {
        let RasterCompletion { entry, key, result } = completion;
        let readiness = match result {
            Ok(raster) => self.cache.mark_ready(entry, raster),
            Err(e) => {
                tracing::warn!("glyph {:?} failed to rasterize: {}", key, e);
                self.failures += 1;
                self.cache.mark_failed(entry).map(|()| Readiness::Blank)
            }
        };

        match readiness {
            Ok(Readiness::NeedsUpload) => self.queue_or_defer(entry),
            Ok(Readiness::Blank) => Ok(()),
            Err(AtlasError::Raster(e)) => {
                tracing::warn!("glyph {:?} has a malformed bitmap: {}", key, e);
                self.failures += 1;
                if let Err(e) = self.cache.mark_failed(entry) {
                    tracing::debug!("could not fail {:?}: {}", key, e);
                }
                Ok(())
            }
            Err(AtlasError::StaleEntry) => {
                tracing::debug!("dropping completion for evicted glyph {:?}", key);
                Ok(())
            }
            Err(e) => {
                tracing::warn!("ignoring completion for {:?}: {}", key, e);
                Ok(())
            }
        }
    }

    fn queue_or_defer(&mut self, id: EntryId) -> Result<()> {
        // Drains evicted ids at the front so they can't hold back a fresh glyph
        self.retry_deferred()?;
        // Keep FIFO order behind glyphs already waiting for staging space
        if !self.deferred_uploads.is_empty() {
            self.upload_backpressure += 1;
            self.deferred_uploads.push_back(id);
            return Ok(());
        }
        match self.try_queue(id) {
            Ok(_) => Ok(()),
            Err(QueueError::Gpu(e)) => Err(e.into()),
            Err(e) if e.is_backpressure() => {
                tracing::trace!("upload deferred: {}", e);
                self.upload_backpressure += 1;
                self.deferred_uploads.push_back(id);
                Ok(())
            }
            Err(e) => {
                tracing::error!("dropping upload that can never be queued: {}", e);
                Ok(())
            }
        }
    }

    /// Queue the upload for a `Ready` entry. `Ok(false)` if the entry is gone
    /// or no longer needs uploading.
    fn try_queue(&mut self, id: EntryId) -> std::result::Result<bool, QueueError> {
        let Some((raster, rect)) = self.cache.pending_upload(id) else {
            return Ok(false);
        };
        let key = match self.cache.entry(id) {
            Some(entry) => entry.key(),
            None => return Ok(false),
        };
        self.pipeline
            .queue_upload(&mut self.backend, id, key, rect, raster)?;
        self.cache.set_upload_queued(id, true);
        Ok(true)
    }

    /// Record this frame's atlas copies into `cmd`.
    ///
    /// Drains background completions, drops copies for glyphs evicted since
    /// they were queued, records barrier / copy / barrier for every queued
    /// glyph and marks those glyphs `Uploaded`. The caller submits `cmd`;
    /// glyphs it uploads are safe to sample from that submission on.
    ///
    /// Blocks only when the ring wraps around to a frame whose fence has not
    /// signaled yet. A GPU error here is fatal.
    pub fn process_uploads(&mut self, cmd: &mut B::CommandBuffer) -> Result<UploadReport> {
        let completions = self.pump_completions()?;

        for id in self.cache.take_cancelled_uploads() {
            if self.pipeline.cancel(id) {
                tracing::trace!("cancelled upload for evicted entry");
            }
        }

        let recorded = self
            .pipeline
            .process_uploads(&mut self.backend, cmd)
            .map_err(|e| self.fatal(e))?;
        for copy in &recorded {
            if let Err(e) = self.cache.mark_uploaded(copy.entry) {
                tracing::debug!("recorded copy for {:?} not applied: {}", copy.key, e);
            }
        }
        self.uploads += recorded.len() as u64;

        self.retry_deferred()?;

        Ok(UploadReport {
            completions,
            recorded: recorded.len(),
            deferred: self.deferred_uploads.len(),
        })
    }

    fn retry_deferred(&mut self) -> Result<()> {
        while let Some(&id) = self.deferred_uploads.front() {
            match self.try_queue(id) {
                Ok(_) => {
                    self.deferred_uploads.pop_front();
                }
                Err(QueueError::Gpu(e)) => return Err(e.into()),
                Err(e) if e.is_backpressure() => break,
                Err(e) => {
                    tracing::error!("dropping upload that can never be queued: {}", e);
                    self.deferred_uploads.pop_front();
                }
            }
        }
        Ok(())
    }

    fn fatal(&self, error: GpuError) -> AtlasError {
        tracing::error!("atlas upload failed, GPU context is unusable: {}", error);
        AtlasError::Gpu(error)
    }

    /// Evict the least recently used settled glyph, if any
    pub fn evict_lru(&mut self) -> Option<CacheEntry> {
        self.cache.evict_lru()
    }

    /// Drop every settled glyph. Loading glyphs finish normally.
    pub fn clear(&mut self) {
        self.cache.clear();
        self.deferred_uploads.clear();
        tracing::debug!("atlas cleared, {} glyphs still loading", self.cache.loading());
    }

    /// Counters plus current occupancy
    pub fn stats(&self) -> AtlasStats {
        let CacheStats {
            hits,
            misses,
            evictions,
            deferred,
        } = self.cache.stats();
        AtlasStats {
            hits,
            misses,
            evictions,
            uploads: self.uploads,
            failures: self.failures,
            deferred_requests: deferred,
            upload_backpressure: self.upload_backpressure,
            resident: self.cache.len(),
            loading: self.cache.loading(),
            capacity: self.cache.capacity(),
        }
    }

    /// Resolve an entry handle; `None` once the glyph was evicted
    pub fn entry(&self, id: EntryId) -> Option<&CacheEntry> {
        self.cache.entry(id)
    }

    /// Cached entry for `key`, without counting a lookup or touching the LRU
    pub fn peek(&self, key: &GlyphKey) -> Option<&CacheEntry> {
        self.cache.peek(key).and_then(|id| self.cache.entry(id))
    }

    pub fn contains(&self, key: &GlyphKey) -> bool {
        self.cache.peek(key).is_some()
    }

    /// Keys from most to least recently used
    pub fn keys_by_recency(&self) -> Vec<GlyphKey> {
        self.cache.keys_by_recency()
    }

    /// Resident glyphs (any state)
    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }

    /// Page capacity
    pub fn capacity(&self) -> usize {
        self.cache.capacity()
    }

    /// Copies queued for the next `process_uploads`
    pub fn pending_uploads(&self) -> usize {
        self.pipeline.pending()
    }

    /// Ready glyphs waiting for staging space in a later frame
    pub fn deferred_uploads(&self) -> usize {
        self.deferred_uploads.len()
    }

    /// Background jobs not yet drained
    pub fn in_flight(&self) -> usize {
        self.dispatcher.in_flight()
    }

    pub fn config(&self) -> &AtlasConfig {
        &self.config
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    /// Stop the workers and wait for all submitted uploads to retire.
    ///
    /// Dropping the manager also stops the workers, but does not wait on the
    /// GPU.
    pub fn destroy(mut self) -> Result<()> {
        self.dispatcher.shutdown();
        self.pipeline.wait_all(&mut self.backend)?;
        tracing::debug!(
            "atlas destroyed after {} uploads ({} glyphs resident)",
            self.uploads,
            self.cache.len()
        );
        Ok(())
    }
}
