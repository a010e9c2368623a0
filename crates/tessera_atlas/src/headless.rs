//! CPU implementation of [`GpuBackend`]
//!
//! Keeps the atlas texels in memory and executes recorded copies on
//! [`HeadlessBackend::submit`]. Used by tests and benchmarks, and handy for
//! tools that only need the packed atlas image.
//!
//! Faults can be injected with [`HeadlessBackend::lose_device`] and
//! [`HeadlessBackend::hang`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::config::AtlasConfig;
use crate::gpu::{AtlasAccess, GpuBackend, GpuError};
use crate::page_grid::AtlasRect;
use crate::upload::UploadCommand;

/// Staging buffer backed by a `Vec`
#[derive(Debug)]
pub struct HeadlessStaging {
    data: Vec<u8>,
    mapped: bool,
}

/// Fence shared between the pipeline and the command buffers it was
/// attached to
#[derive(Debug, Clone)]
pub struct HeadlessFence(Arc<AtomicBool>);

impl HeadlessFence {
    pub fn is_signaled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// A recorded operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeadlessOp {
    Transition {
        region: AtlasRect,
        from: AtlasAccess,
        to: AtlasAccess,
    },
    Copy {
        rect: AtlasRect,
        bytes_per_row: u32,
        /// Staging bytes captured at record time
        bytes: Vec<u8>,
    },
}

/// Command buffer for the headless backend
#[derive(Debug, Default)]
pub struct HeadlessCommands {
    ops: Vec<HeadlessOp>,
    fences: Vec<HeadlessFence>,
}

impl HeadlessCommands {
    pub fn ops(&self) -> &[HeadlessOp] {
        &self.ops
    }

    pub fn fence_count(&self) -> usize {
        self.fences.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty() && self.fences.is_empty()
    }
}

/// Counters for asserting on backend traffic
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeadlessStats {
    pub staging_buffers: usize,
    pub fences: usize,
    pub maps: usize,
    pub fence_waits: usize,
    pub barriers: usize,
    pub copies: usize,
    pub submits: usize,
    /// Copies executed while their region was not in transfer-write
    pub barrier_violations: usize,
}

/// In-memory GPU
#[derive(Debug)]
pub struct HeadlessBackend {
    width: u32,
    height: u32,
    bytes_per_texel: u32,
    texels: Vec<u8>,
    row_alignment: u32,
    device_lost: bool,
    hung: bool,
    stats: HeadlessStats,
}

impl HeadlessBackend {
    /// Backend with a zeroed atlas matching `config`
    pub fn new(config: &AtlasConfig) -> Self {
        let bytes_per_texel = config.texel_format.bytes_per_texel();
        let len = config.atlas_width as usize * config.atlas_height as usize * bytes_per_texel as usize;
        Self {
            width: config.atlas_width,
            height: config.atlas_height,
            bytes_per_texel,
            texels: vec![0; len],
            row_alignment: 1,
            device_lost: false,
            hung: false,
            stats: HeadlessStats::default(),
        }
    }

    /// Emulate a row pitch alignment (wgpu uses 256)
    pub fn with_row_alignment(mut self, alignment: u32) -> Self {
        self.row_alignment = alignment.max(1);
        self
    }

    /// Every later call fails with [`GpuError::DeviceLost`]
    pub fn lose_device(&mut self) {
        self.device_lost = true;
    }

    /// Submitted work never completes; fence waits time out
    pub fn hang(&mut self) {
        self.hung = true;
    }

    /// Execute a recorded command buffer and signal its fences
    pub fn submit(&mut self, cmd: HeadlessCommands) -> Result<(), GpuError> {
        if self.device_lost {
            return Err(GpuError::DeviceLost("headless device lost".into()));
        }
        self.stats.submits += 1;

        let mut writable: Vec<AtlasRect> = Vec::new();
        for op in cmd.ops {
            match op {
                HeadlessOp::Transition { region, to, .. } => match to {
                    AtlasAccess::TransferWrite => writable.push(region),
                    AtlasAccess::ShaderRead => writable.retain(|r| *r != region),
                },
                HeadlessOp::Copy {
                    rect,
                    bytes_per_row,
                    bytes,
                } => {
                    if !writable.contains(&rect) {
                        self.stats.barrier_violations += 1;
                    }
                    self.blit(rect, bytes_per_row, &bytes);
                }
            }
        }
        if !writable.is_empty() {
            // Left in transfer-write at the end of the buffer
            self.stats.barrier_violations += writable.len();
        }

        if !self.hung {
            for fence in &cmd.fences {
                fence.0.store(true, Ordering::Release);
            }
        }
        Ok(())
    }

    fn blit(&mut self, rect: AtlasRect, bytes_per_row: u32, bytes: &[u8]) {
        let bpt = self.bytes_per_texel as usize;
        let row_bytes = rect.width as usize * bpt;
        let atlas_row = self.width as usize * bpt;
        for row in 0..rect.height as usize {
            let src = row * bytes_per_row as usize;
            let dst = (rect.y as usize + row) * atlas_row + rect.x as usize * bpt;
            self.texels[dst..dst + row_bytes].copy_from_slice(&bytes[src..src + row_bytes]);
        }
    }

    /// First byte of the texel at (x, y)
    pub fn texel(&self, x: u32, y: u32) -> u8 {
        let index = (y as usize * self.width as usize + x as usize) * self.bytes_per_texel as usize;
        self.texels[index]
    }

    /// Tightly packed copy of an atlas region
    pub fn read_region(&self, rect: AtlasRect) -> Vec<u8> {
        let bpt = self.bytes_per_texel as usize;
        let row_bytes = rect.width as usize * bpt;
        let atlas_row = self.width as usize * bpt;
        let mut out = Vec::with_capacity(row_bytes * rect.height as usize);
        for row in 0..rect.height as usize {
            let start = (rect.y as usize + row) * atlas_row + rect.x as usize * bpt;
            out.extend_from_slice(&self.texels[start..start + row_bytes]);
        }
        out
    }

    pub fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn stats(&self) -> HeadlessStats {
        self.stats
    }

    fn check_device(&self) -> Result<(), GpuError> {
        if self.device_lost {
            Err(GpuError::DeviceLost("headless device lost".into()))
        } else {
            Ok(())
        }
    }
}

impl GpuBackend for HeadlessBackend {
    type StagingBuffer = HeadlessStaging;
    type Fence = HeadlessFence;
    type CommandBuffer = HeadlessCommands;

    fn copy_row_alignment(&self) -> u32 {
        self.row_alignment
    }

    fn create_staging_buffer(&mut self, size: u64) -> Result<HeadlessStaging, GpuError> {
        self.check_device()?;
        let len = usize::try_from(size).map_err(|_| GpuError::ResourceCreation {
            what: "staging buffer",
            reason: format!("{} bytes does not fit in memory", size),
        })?;
        self.stats.staging_buffers += 1;
        Ok(HeadlessStaging {
            data: vec![0; len],
            mapped: false,
        })
    }

    fn create_fence(&mut self) -> Result<HeadlessFence, GpuError> {
        self.check_device()?;
        self.stats.fences += 1;
        Ok(HeadlessFence(Arc::new(AtomicBool::new(true))))
    }

    fn map_staging(&mut self, buffer: &mut HeadlessStaging) -> Result<(), GpuError> {
        self.check_device()?;
        if !buffer.mapped {
            buffer.mapped = true;
            self.stats.maps += 1;
        }
        Ok(())
    }

    fn write_staging(
        &mut self,
        buffer: &mut HeadlessStaging,
        offset: u64,
        data: &[u8],
    ) -> Result<(), GpuError> {
        self.check_device()?;
        if !buffer.mapped {
            return Err(GpuError::StagingMap("write to unmapped staging buffer".into()));
        }
        let start = offset as usize;
        let end = start + data.len();
        let dst = buffer.data.get_mut(start..end).ok_or_else(|| {
            GpuError::StagingMap(format!("write {}..{} out of bounds", start, end))
        })?;
        dst.copy_from_slice(data);
        Ok(())
    }

    fn unmap_staging(&mut self, buffer: &mut HeadlessStaging) {
        buffer.mapped = false;
    }

    fn wait_fence(&mut self, fence: &HeadlessFence, timeout: Duration) -> Result<(), GpuError> {
        self.check_device()?;
        self.stats.fence_waits += 1;
        if fence.is_signaled() {
            Ok(())
        } else {
            Err(GpuError::FenceTimeout(timeout))
        }
    }

    fn reset_fence(&mut self, fence: &mut HeadlessFence) {
        fence.0.store(false, Ordering::Release);
    }

    fn transition(
        &mut self,
        cmd: &mut HeadlessCommands,
        region: AtlasRect,
        from: AtlasAccess,
        to: AtlasAccess,
    ) {
        self.stats.barriers += 1;
        cmd.ops.push(HeadlessOp::Transition { region, from, to });
    }

    fn copy_to_atlas(
        &mut self,
        cmd: &mut HeadlessCommands,
        staging: &HeadlessStaging,
        copy: &UploadCommand,
    ) {
        self.stats.copies += 1;
        let start = copy.staging_offset as usize;
        let end = start + copy.staging_len() as usize;
        cmd.ops.push(HeadlessOp::Copy {
            rect: copy.rect,
            bytes_per_row: copy.bytes_per_row,
            bytes: staging.data[start..end].to_vec(),
        });
    }

    fn attach_fence(&mut self, cmd: &mut HeadlessCommands, fence: &HeadlessFence) {
        fence.0.store(false, Ordering::Release);
        cmd.fences.push(fence.clone());
    }
}
