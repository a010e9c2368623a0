//! Streamed atlas uploads
//!
//! Uploads rotate through a ring of frames (three by default). Each frame owns
//! a staging buffer, a fence and the copy commands queued into it:
//!
//! 1. `queue_upload` writes glyph rows into the open frame's staging buffer
//! 2. `process_uploads` records barrier / copy / barrier per command into the
//!    caller's command buffer and attaches the frame fence
//! 3. the ring advances; the next frame is reopened only after its fence
//!    (from `upload_frames` rotations ago) has signaled
//!
//! The fence wait in step 3 is the only place the pipeline blocks, and with
//! three frames the GPU is normally done long before the CPU gets there.

use std::time::Duration;

use thiserror::Error;

use crate::config::{AtlasConfig, ConfigError};
use crate::entry::EntryId;
use crate::error::Result;
use crate::gpu::{AtlasAccess, GpuBackend, GpuError};
use crate::key::GlyphKey;
use crate::page_grid::AtlasRect;
use crate::raster::{RasterError, RasterizedGlyph};

/// One staging-to-atlas copy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UploadCommand {
    /// Entry that becomes `Uploaded` once the copy is recorded
    pub entry: EntryId,
    pub key: GlyphKey,
    /// Byte offset of the first row in the staging buffer
    pub staging_offset: u64,
    /// Row pitch in the staging buffer (padded to the copy alignment)
    pub bytes_per_row: u32,
    /// Destination in atlas texels
    pub rect: AtlasRect,
}

impl UploadCommand {
    /// Bytes this copy occupies in the staging buffer
    pub fn staging_len(&self) -> u64 {
        u64::from(self.bytes_per_row) * u64::from(self.rect.height)
    }
}

/// Why a glyph could not be queued this frame
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueueError {
    /// The frame already holds `max_uploads_per_frame` copies
    #[error("upload batch full ({0} copies)")]
    BatchFull(usize),

    /// Not enough staging space left in the frame
    #[error("staging buffer full: need {needed} bytes, {remaining} left")]
    StagingFull { needed: u64, remaining: u64 },

    /// The bitmap is shorter than the destination rect
    #[error(transparent)]
    Raster(#[from] RasterError),

    /// Writing the staging buffer failed
    #[error(transparent)]
    Gpu(#[from] GpuError),
}

impl QueueError {
    /// Capacity errors clear up after the next rotation; the others don't
    pub fn is_backpressure(&self) -> bool {
        matches!(self, QueueError::BatchFull(_) | QueueError::StagingFull { .. })
    }
}

struct UploadFrame<B: GpuBackend> {
    staging: B::StagingBuffer,
    fence: B::Fence,
    commands: Vec<UploadCommand>,
    write_offset: u64,
}

/// Triple-buffered staging ring feeding the atlas texture
pub struct UploadPipeline<B: GpuBackend> {
    frames: Vec<UploadFrame<B>>,
    /// Monotonic frame counter; the open frame is `frame_index % frames.len()`
    frame_index: u64,
    staging_size: u64,
    max_commands: usize,
    row_alignment: u64,
    bytes_per_texel: u32,
    fence_timeout: Duration,
    /// Row-padding scratch, reused across glyphs
    scratch: Vec<u8>,
}

fn align_up(value: u64, align: u64) -> u64 {
    value.div_ceil(align) * align
}

impl<B: GpuBackend> UploadPipeline<B> {
    /// Create the staging buffers and fences and open frame 0
    pub fn new(backend: &mut B, config: &AtlasConfig) -> Result<Self> {
        let row_alignment = u64::from(backend.copy_row_alignment().max(1));
        let bytes_per_texel = config.texel_format.bytes_per_texel();

        // A full page with padded rows has to fit, or a large glyph would be
        // deferred forever
        let page_row = align_up(u64::from(config.page_size * bytes_per_texel), row_alignment);
        let required = page_row * u64::from(config.page_size);
        if config.staging_bytes_per_frame < required {
            return Err(ConfigError::StagingTooSmall {
                staging: config.staging_bytes_per_frame,
                required,
            }
            .into());
        }

        let mut frames = Vec::with_capacity(config.upload_frames);
        for _ in 0..config.upload_frames {
            frames.push(UploadFrame {
                staging: backend.create_staging_buffer(config.staging_bytes_per_frame)?,
                fence: backend.create_fence()?,
                commands: Vec::with_capacity(config.max_uploads_per_frame),
                write_offset: 0,
            });
        }
        if let Some(first) = frames.first_mut() {
            backend.map_staging(&mut first.staging)?;
        }

        tracing::debug!(
            "upload pipeline: {} frames x {} KiB staging, row alignment {}",
            frames.len(),
            config.staging_bytes_per_frame / 1024,
            row_alignment
        );

        Ok(Self {
            frames,
            frame_index: 0,
            staging_size: config.staging_bytes_per_frame,
            max_commands: config.max_uploads_per_frame,
            row_alignment,
            bytes_per_texel,
            fence_timeout: config.fence_timeout(),
            scratch: Vec::new(),
        })
    }

    fn current(&self) -> usize {
        (self.frame_index % self.frames.len() as u64) as usize
    }

    /// Copy `raster` into the open frame's staging buffer and queue a copy to
    /// `rect`. Never blocks.
    pub fn queue_upload(
        &mut self,
        backend: &mut B,
        entry: EntryId,
        key: GlyphKey,
        rect: AtlasRect,
        raster: &RasterizedGlyph,
    ) -> std::result::Result<(), QueueError> {
        let current = self.current();
        let frame = &mut self.frames[current];

        if frame.commands.len() >= self.max_commands {
            return Err(QueueError::BatchFull(self.max_commands));
        }

        let row_bytes = u64::from(rect.width * self.bytes_per_texel);
        let packed = row_bytes * u64::from(rect.height);
        if (raster.pixels.len() as u64) < packed {
            return Err(RasterError::Truncated {
                width: rect.width,
                height: rect.height,
                expected: packed as usize,
                actual: raster.pixels.len(),
            }
            .into());
        }
        let pitch = align_up(row_bytes, self.row_alignment);
        let offset = align_up(frame.write_offset, self.row_alignment);
        let needed = pitch * u64::from(rect.height);
        let remaining = self.staging_size.saturating_sub(offset);
        if needed > remaining {
            return Err(QueueError::StagingFull { needed, remaining });
        }

        let data: &[u8] = if pitch == row_bytes {
            &raster.pixels[..needed as usize]
        } else {
            let (row_bytes, pitch) = (row_bytes as usize, pitch as usize);
            self.scratch.clear();
            self.scratch.resize(needed as usize, 0);
            for (src, dst) in raster
                .pixels
                .chunks_exact(row_bytes)
                .zip(self.scratch.chunks_exact_mut(pitch))
            {
                dst[..row_bytes].copy_from_slice(src);
            }
            &self.scratch
        };
        backend.write_staging(&mut frame.staging, offset, data)?;

        frame.write_offset = offset + needed;
        frame.commands.push(UploadCommand {
            entry,
            key,
            staging_offset: offset,
            bytes_per_row: pitch as u32,
            rect,
        });
        Ok(())
    }

    /// Drop the queued copy for `entry` (evicted before it was recorded).
    ///
    /// Its staging bytes stay reserved until the frame rotates.
    pub fn cancel(&mut self, entry: EntryId) -> bool {
        let current = self.current();
        let commands = &mut self.frames[current].commands;
        let before = commands.len();
        commands.retain(|c| c.entry != entry);
        before != commands.len()
    }

    /// Record every queued copy into `cmd`, in queue order, and advance the
    /// ring.
    ///
    /// Each copy is bracketed by barriers moving its region to transfer-write
    /// and back to shader-read. The frame fence is attached to `cmd`, so the
    /// caller must submit `cmd` before the ring comes back around to this
    /// frame. Returns the recorded commands; an empty frame records nothing
    /// and does not rotate.
    pub fn process_uploads(
        &mut self,
        backend: &mut B,
        cmd: &mut B::CommandBuffer,
    ) -> std::result::Result<Vec<UploadCommand>, GpuError> {
        let current = self.current();
        let frame = &mut self.frames[current];
        if frame.commands.is_empty() {
            // Copies cancelled before recording leave their staging bytes
            // behind; nothing reads them, so the space is free again
            frame.write_offset = 0;
            return Ok(Vec::new());
        }

        backend.unmap_staging(&mut frame.staging);
        for copy in &frame.commands {
            backend.transition(cmd, copy.rect, AtlasAccess::ShaderRead, AtlasAccess::TransferWrite);
            backend.copy_to_atlas(cmd, &frame.staging, copy);
            backend.transition(cmd, copy.rect, AtlasAccess::TransferWrite, AtlasAccess::ShaderRead);
        }
        backend.attach_fence(cmd, &frame.fence);

        let recorded = std::mem::replace(
            &mut frame.commands,
            Vec::with_capacity(self.max_commands),
        );
        frame.write_offset = 0;
        tracing::trace!(
            "frame {} recorded {} atlas copies",
            self.frame_index,
            recorded.len()
        );

        self.frame_index += 1;
        self.open_current(backend)?;
        Ok(recorded)
    }

    /// Wait for the open frame's previous use to retire and map its staging
    fn open_current(&mut self, backend: &mut B) -> std::result::Result<(), GpuError> {
        let current = self.current();
        let frame = &mut self.frames[current];
        backend.wait_fence(&frame.fence, self.fence_timeout)?;
        backend.reset_fence(&mut frame.fence);
        backend.map_staging(&mut frame.staging)?;
        frame.write_offset = 0;
        Ok(())
    }

    /// Wait for every submitted frame to retire. Copies still queued in the
    /// open frame are discarded.
    pub fn wait_all(&mut self, backend: &mut B) -> std::result::Result<(), GpuError> {
        let current = self.current();
        self.frames[current].commands.clear();
        // The open frame's fence was already waited on when it was opened
        for (i, frame) in self.frames.iter().enumerate() {
            if i != current {
                backend.wait_fence(&frame.fence, self.fence_timeout)?;
            }
        }
        Ok(())
    }

    /// Copies queued in the open frame
    pub fn pending(&self) -> usize {
        self.frames[self.current()].commands.len()
    }

    /// Commands queued in the open frame, in recording order
    pub fn queued(&self) -> &[UploadCommand] {
        &self.frames[self.current()].commands
    }

    /// Staging bytes used in the open frame
    pub fn staging_used(&self) -> u64 {
        self.frames[self.current()].write_offset
    }

    /// Frames recorded so far
    pub fn frame_index(&self) -> u64 {
        self.frame_index
    }

    pub fn frame_count(&self) -> usize {
        self.frames.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::headless::{HeadlessBackend, HeadlessCommands, HeadlessOp};
    use slotmap::SlotMap;

    fn ids(n: usize) -> Vec<EntryId> {
        let mut map: SlotMap<EntryId, ()> = SlotMap::with_key();
        (0..n).map(|_| map.insert(())).collect()
    }

    fn config() -> AtlasConfig {
        AtlasConfig {
            max_uploads_per_frame: 4,
            ..AtlasConfig::square(256, 64)
        }
    }

    fn glyph(w: u32, h: u32, v: u8) -> RasterizedGlyph {
        RasterizedGlyph::new(w, h, vec![v; (w * h) as usize])
    }

    fn key(c: u32) -> GlyphKey {
        GlyphKey::new(0, c, 16 << 16)
    }

    #[test]
    fn test_rows_padded_to_alignment() {
        let config = config();
        let mut backend = HeadlessBackend::new(&config).with_row_alignment(256);
        let mut pipeline = UploadPipeline::new(&mut backend, &config).unwrap();
        let id = ids(2);

        pipeline
            .queue_upload(&mut backend, id[0], key(1), AtlasRect::new(0, 0, 10, 3), &glyph(10, 3, 1))
            .unwrap();
        pipeline
            .queue_upload(&mut backend, id[1], key(2), AtlasRect::new(64, 0, 5, 2), &glyph(5, 2, 2))
            .unwrap();

        let queued = pipeline.queued();
        assert_eq!(queued[0].bytes_per_row, 256);
        assert_eq!(queued[0].staging_offset, 0);
        assert_eq!(queued[1].staging_offset, 768);
        assert_eq!(pipeline.staging_used(), 768 + 512);
    }

    #[test]
    fn test_batch_limit() {
        let config = config();
        let mut backend = HeadlessBackend::new(&config);
        let mut pipeline = UploadPipeline::new(&mut backend, &config).unwrap();
        let id = ids(5);
        for (i, &entry) in id[..4].iter().enumerate() {
            pipeline
                .queue_upload(&mut backend, entry, key(i as u32), AtlasRect::new(0, 0, 1, 1), &glyph(1, 1, 0))
                .unwrap();
        }
        let err = pipeline
            .queue_upload(&mut backend, id[4], key(9), AtlasRect::new(0, 0, 1, 1), &glyph(1, 1, 0))
            .unwrap_err();
        assert_eq!(err, QueueError::BatchFull(4));
        assert!(err.is_backpressure());
    }

    #[test]
    fn test_staging_limit() {
        let config = AtlasConfig {
            staging_bytes_per_frame: 64 * 256,
            ..config()
        };
        let mut backend = HeadlessBackend::new(&config).with_row_alignment(256);
        let mut pipeline = UploadPipeline::new(&mut backend, &config).unwrap();
        let id = ids(2);
        pipeline
            .queue_upload(&mut backend, id[0], key(1), AtlasRect::new(0, 0, 64, 60), &glyph(64, 60, 1))
            .unwrap();
        let err = pipeline
            .queue_upload(&mut backend, id[1], key(2), AtlasRect::new(64, 0, 64, 8), &glyph(64, 8, 1))
            .unwrap_err();
        assert_eq!(
            err,
            QueueError::StagingFull {
                needed: 8 * 256,
                remaining: 4 * 256
            }
        );
    }

    #[test]
    fn test_staging_must_hold_a_padded_page() {
        let config = AtlasConfig {
            staging_bytes_per_frame: 64 * 64,
            ..config()
        };
        let mut backend = HeadlessBackend::new(&config).with_row_alignment(256);
        assert!(UploadPipeline::new(&mut backend, &config).is_err());
    }

    #[test]
    fn test_process_records_barriers_around_each_copy() {
        let config = config();
        let mut backend = HeadlessBackend::new(&config);
        let mut pipeline = UploadPipeline::new(&mut backend, &config).unwrap();
        let id = ids(2);
        let a = AtlasRect::new(0, 0, 2, 2);
        let b = AtlasRect::new(64, 0, 3, 1);
        pipeline
            .queue_upload(&mut backend, id[0], key(1), a, &glyph(2, 2, 7))
            .unwrap();
        pipeline
            .queue_upload(&mut backend, id[1], key(2), b, &glyph(3, 1, 8))
            .unwrap();

        let mut cmd = HeadlessCommands::default();
        let recorded = pipeline.process_uploads(&mut backend, &mut cmd).unwrap();
        assert_eq!(recorded.iter().map(|c| c.entry).collect::<Vec<_>>(), id);

        let ops = cmd.ops();
        assert_eq!(ops.len(), 6);
        assert_eq!(
            ops[0],
            HeadlessOp::Transition {
                region: a,
                from: AtlasAccess::ShaderRead,
                to: AtlasAccess::TransferWrite
            }
        );
        assert!(matches!(ops[1], HeadlessOp::Copy { rect, .. } if rect == a));
        assert_eq!(
            ops[2],
            HeadlessOp::Transition {
                region: a,
                from: AtlasAccess::TransferWrite,
                to: AtlasAccess::ShaderRead
            }
        );
        assert!(matches!(ops[4], HeadlessOp::Copy { rect, .. } if rect == b));
        assert_eq!(cmd.fence_count(), 1);

        backend.submit(cmd).unwrap();
        assert_eq!(backend.texel(1, 1), 7);
        assert_eq!(backend.texel(66, 0), 8);
        assert_eq!(backend.texel(67, 0), 0);
        assert_eq!(pipeline.frame_index(), 1);
        assert_eq!(pipeline.pending(), 0);
    }

    #[test]
    fn test_empty_frame_does_not_rotate() {
        let config = config();
        let mut backend = HeadlessBackend::new(&config);
        let mut pipeline = UploadPipeline::new(&mut backend, &config).unwrap();
        let mut cmd = HeadlessCommands::default();
        assert!(pipeline.process_uploads(&mut backend, &mut cmd).unwrap().is_empty());
        assert!(cmd.ops().is_empty());
        assert_eq!(pipeline.frame_index(), 0);
    }

    #[test]
    fn test_cancel_removes_queued_copy() {
        let config = config();
        let mut backend = HeadlessBackend::new(&config);
        let mut pipeline = UploadPipeline::new(&mut backend, &config).unwrap();
        let id = ids(2);
        for (i, &entry) in id.iter().enumerate() {
            pipeline
                .queue_upload(&mut backend, entry, key(i as u32), AtlasRect::new(0, 0, 1, 1), &glyph(1, 1, 0))
                .unwrap();
        }
        assert!(pipeline.cancel(id[0]));
        assert!(!pipeline.cancel(id[0]));
        assert_eq!(pipeline.pending(), 1);
        assert_eq!(pipeline.queued()[0].entry, id[1]);
    }

    #[test]
    fn test_cancelled_frame_releases_staging() {
        let config = AtlasConfig {
            staging_bytes_per_frame: 64 * 64,
            ..config()
        };
        let mut backend = HeadlessBackend::new(&config);
        let mut pipeline = UploadPipeline::new(&mut backend, &config).unwrap();
        let id = ids(2);
        let page = AtlasRect::new(0, 0, 64, 64);

        pipeline
            .queue_upload(&mut backend, id[0], key(1), page, &glyph(64, 64, 1))
            .unwrap();
        assert!(pipeline.cancel(id[0]));
        assert!(matches!(
            pipeline.queue_upload(&mut backend, id[1], key(2), page, &glyph(64, 64, 2)),
            Err(QueueError::StagingFull { .. })
        ));

        // Nothing to record, but the abandoned bytes are reclaimed
        let mut cmd = HeadlessCommands::default();
        assert!(pipeline.process_uploads(&mut backend, &mut cmd).unwrap().is_empty());
        assert_eq!(pipeline.frame_index(), 0);
        assert_eq!(pipeline.staging_used(), 0);
        pipeline
            .queue_upload(&mut backend, id[1], key(2), page, &glyph(64, 64, 2))
            .unwrap();
    }

    #[test]
    fn test_short_bitmap_rejected() {
        let config = config();
        let mut backend = HeadlessBackend::new(&config).with_row_alignment(256);
        let mut pipeline = UploadPipeline::new(&mut backend, &config).unwrap();
        let id = ids(1);
        let err = pipeline
            .queue_upload(&mut backend, id[0], key(1), AtlasRect::new(0, 0, 8, 8), &glyph(8, 4, 1))
            .unwrap_err();
        assert!(matches!(
            err,
            QueueError::Raster(RasterError::Truncated { expected: 64, actual: 32, .. })
        ));
        assert!(!err.is_backpressure());
        assert_eq!(pipeline.pending(), 0);
        assert_eq!(pipeline.staging_used(), 0);
    }

    #[test]
    fn test_ring_reuses_frame_after_fence() {
        let config = config();
        let mut backend = HeadlessBackend::new(&config);
        let mut pipeline = UploadPipeline::new(&mut backend, &config).unwrap();
        let id = ids(1);
        for frame in 0..7u32 {
            pipeline
                .queue_upload(&mut backend, id[0], key(frame), AtlasRect::new(0, 0, 1, 1), &glyph(1, 1, frame as u8))
                .unwrap();
            let mut cmd = HeadlessCommands::default();
            pipeline.process_uploads(&mut backend, &mut cmd).unwrap();
            backend.submit(cmd).unwrap();
        }
        assert_eq!(pipeline.frame_index(), 7);
        assert_eq!(backend.texel(0, 0), 6);
        assert_eq!(backend.stats().fence_waits, 7);
    }

    #[test]
    fn test_unsubmitted_frame_times_out_on_reuse() {
        let config = AtlasConfig {
            upload_frames: 2,
            ..config()
        };
        let mut backend = HeadlessBackend::new(&config);
        let mut pipeline = UploadPipeline::new(&mut backend, &config).unwrap();
        let id = ids(1);

        // Frame 0 recorded but never submitted
        pipeline
            .queue_upload(&mut backend, id[0], key(1), AtlasRect::new(0, 0, 1, 1), &glyph(1, 1, 1))
            .unwrap();
        let mut lost = HeadlessCommands::default();
        pipeline.process_uploads(&mut backend, &mut lost).unwrap();

        pipeline
            .queue_upload(&mut backend, id[0], key(2), AtlasRect::new(0, 0, 1, 1), &glyph(1, 1, 1))
            .unwrap();
        let mut cmd = HeadlessCommands::default();
        let err = pipeline.process_uploads(&mut backend, &mut cmd).unwrap_err();
        assert!(matches!(err, GpuError::FenceTimeout(_)));
    }
}
