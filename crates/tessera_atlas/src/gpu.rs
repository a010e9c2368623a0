//! GPU backend seam
//!
//! The upload pipeline only needs a handful of primitives: mappable staging
//! buffers, fences, barriers around the atlas region being written and a
//! buffer-to-texture copy. `tessera_gpu` implements them on wgpu and
//! [`HeadlessBackend`](crate::headless::HeadlessBackend) implements them on
//! the CPU for tests.

use std::time::Duration;

use thiserror::Error;

use crate::page_grid::AtlasRect;
use crate::upload::UploadCommand;

/// Access mode of an atlas region, used for barrier transitions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AtlasAccess {
    /// Sampled by fragment shaders
    ShaderRead,
    /// Destination of a transfer
    TransferWrite,
}

/// GPU failures. All of them are fatal for the atlas.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GpuError {
    #[error("fence not signaled after {0:?}")]
    FenceTimeout(Duration),

    #[error("device lost: {0}")]
    DeviceLost(String),

    #[error("failed to map staging buffer: {0}")]
    StagingMap(String),

    #[error("failed to create {what}: {reason}")]
    ResourceCreation { what: &'static str, reason: String },
}

/// Primitives the upload pipeline records against.
///
/// Fences are created signaled. A fence attached to a command buffer is
/// signaled by the backend once the GPU has finished executing that buffer;
/// only then may the frame's staging buffer be written again.
pub trait GpuBackend {
    /// Host-visible buffer the CPU writes glyph rows into
    type StagingBuffer;
    /// CPU-waitable completion signal for one upload frame
    type Fence;
    /// Caller-owned recording target for copies and barriers
    type CommandBuffer;

    /// Required alignment of the staging row pitch in bytes
    fn copy_row_alignment(&self) -> u32 {
        1
    }

    fn create_staging_buffer(&mut self, size: u64) -> Result<Self::StagingBuffer, GpuError>;

    /// Create a fence in the signaled state
    fn create_fence(&mut self) -> Result<Self::Fence, GpuError>;

    /// Make the staging buffer CPU-writable. Mapping an already mapped buffer
    /// is a no-op.
    fn map_staging(&mut self, buffer: &mut Self::StagingBuffer) -> Result<(), GpuError>;

    /// Copy `data` into a mapped staging buffer at `offset`
    fn write_staging(
        &mut self,
        buffer: &mut Self::StagingBuffer,
        offset: u64,
        data: &[u8],
    ) -> Result<(), GpuError>;

    /// Hand the staging buffer back to the GPU before copies read it
    fn unmap_staging(&mut self, buffer: &mut Self::StagingBuffer);

    /// Block until `fence` is signaled or `timeout` elapses
    fn wait_fence(&mut self, fence: &Self::Fence, timeout: Duration) -> Result<(), GpuError>;

    fn reset_fence(&mut self, fence: &mut Self::Fence);

    /// Record a barrier moving `region` of the atlas between access modes
    fn transition(
        &mut self,
        cmd: &mut Self::CommandBuffer,
        region: AtlasRect,
        from: AtlasAccess,
        to: AtlasAccess,
    );

    /// Record a staging-to-atlas copy
    fn copy_to_atlas(
        &mut self,
        cmd: &mut Self::CommandBuffer,
        staging: &Self::StagingBuffer,
        copy: &UploadCommand,
    );

    /// Signal `fence` when `cmd` has finished executing
    fn attach_fence(&mut self, cmd: &mut Self::CommandBuffer, fence: &Self::Fence);
}
