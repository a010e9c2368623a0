//! wgpu implementation of the atlas GPU seam
//!
//! - Staging buffers are `MAP_WRITE | COPY_SRC`, created mapped and remapped
//!   with `map_async` once their frame fence has signaled
//! - Fences are flags set by `Queue::on_submitted_work_done` after the
//!   [`UploadEncoder`] carrying them is submitted
//! - wgpu tracks texture usage itself, so barriers are implicit and
//!   `transition` only traces

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use tessera_atlas::{
    AtlasAccess, AtlasConfig, AtlasRect, GpuBackend, GpuError, TexelFormat, UploadCommand,
};

/// Atlas texture format for a texel format
pub fn texture_format(format: TexelFormat) -> wgpu::TextureFormat {
    match format {
        TexelFormat::Alpha8 => wgpu::TextureFormat::R8Unorm,
        TexelFormat::Rgba8 => wgpu::TextureFormat::Rgba8Unorm,
    }
}

/// Staging buffer plus its mapping state
#[derive(Debug)]
pub struct WgpuStaging {
    buffer: wgpu::Buffer,
    size: u64,
    mapped: bool,
}

impl WgpuStaging {
    pub fn buffer(&self) -> &wgpu::Buffer {
        &self.buffer
    }
}

/// Signaled once the submission it was attached to has completed
#[derive(Debug, Clone)]
pub struct WgpuFence {
    signaled: Arc<AtomicBool>,
}

impl WgpuFence {
    pub fn is_signaled(&self) -> bool {
        self.signaled.load(Ordering::Acquire)
    }
}

/// Command encoder for one frame's atlas copies.
///
/// Draw passes may be recorded into the same encoder after
/// `process_uploads`; the atlas copies then land in the same submission,
/// ahead of the draws that sample them.
pub struct UploadEncoder {
    encoder: wgpu::CommandEncoder,
    fences: Vec<Arc<AtomicBool>>,
}

impl UploadEncoder {
    pub fn new(device: &wgpu::Device) -> Self {
        let encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("Glyph Atlas Upload Encoder"),
        });
        Self {
            encoder,
            fences: Vec::new(),
        }
    }

    /// The wrapped encoder, for recording further passes
    pub fn encoder_mut(&mut self) -> &mut wgpu::CommandEncoder {
        &mut self.encoder
    }

    /// Finish and submit; attached fences signal when the GPU is done
    pub fn submit(self, queue: &wgpu::Queue) -> wgpu::SubmissionIndex {
        let index = queue.submit(std::iter::once(self.encoder.finish()));
        for fence in self.fences {
            queue.on_submitted_work_done(move || fence.store(true, Ordering::Release));
        }
        index
    }
}

/// Glyph atlas texture and the upload plumbing around it
pub struct WgpuAtlasBackend {
    device: Arc<wgpu::Device>,
    queue: Arc<wgpu::Queue>,
    texture: wgpu::Texture,
    view: wgpu::TextureView,
    format: wgpu::TextureFormat,
    width: u32,
    height: u32,
    /// Set by the device-lost callback
    lost: Arc<Mutex<Option<String>>>,
    /// How long a staging remap may take
    map_timeout: Duration,
}

impl WgpuAtlasBackend {
    /// Create the atlas texture described by `config`
    pub fn new(
        device: Arc<wgpu::Device>,
        queue: Arc<wgpu::Queue>,
        config: &AtlasConfig,
    ) -> Result<Self, GpuError> {
        let max = device.limits().max_texture_dimension_2d;
        if config.atlas_width > max || config.atlas_height > max {
            return Err(GpuError::ResourceCreation {
                what: "atlas texture",
                reason: format!(
                    "{}x{} exceeds the device limit of {}",
                    config.atlas_width, config.atlas_height, max
                ),
            });
        }

        let format = texture_format(config.texel_format);
        let texture = device.create_texture(&wgpu::TextureDescriptor {
            label: Some("Glyph Atlas"),
            size: wgpu::Extent3d {
                width: config.atlas_width,
                height: config.atlas_height,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format,
            usage: wgpu::TextureUsages::TEXTURE_BINDING
                | wgpu::TextureUsages::COPY_DST
                | wgpu::TextureUsages::COPY_SRC,
            view_formats: &[],
        });
        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());

        let lost = Arc::new(Mutex::new(None));
        {
            let lost = Arc::clone(&lost);
            device.set_device_lost_callback(move |reason, message| {
                tracing::error!("glyph atlas device lost ({:?}): {}", reason, message);
                if let Ok(mut slot) = lost.lock() {
                    *slot = Some(message);
                }
            });
        }

        tracing::debug!(
            "created {}x{} {:?} glyph atlas texture",
            config.atlas_width,
            config.atlas_height,
            format
        );

        Ok(Self {
            device,
            queue,
            texture,
            view,
            format,
            width: config.atlas_width,
            height: config.atlas_height,
            lost,
            map_timeout: config.fence_timeout(),
        })
    }

    /// Start an encoder for this frame's uploads
    pub fn create_encoder(&self) -> UploadEncoder {
        UploadEncoder::new(&self.device)
    }

    /// Submit an upload encoder on this backend's queue
    pub fn submit(&self, encoder: UploadEncoder) -> wgpu::SubmissionIndex {
        encoder.submit(&self.queue)
    }

    pub fn texture(&self) -> &wgpu::Texture {
        &self.texture
    }

    /// View for binding the atlas in a sampling pass
    pub fn view(&self) -> &wgpu::TextureView {
        &self.view
    }

    pub fn format(&self) -> wgpu::TextureFormat {
        self.format
    }

    pub fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn device(&self) -> &Arc<wgpu::Device> {
        &self.device
    }

    pub fn queue(&self) -> &Arc<wgpu::Queue> {
        &self.queue
    }

    fn check_device(&self) -> Result<(), GpuError> {
        match self.lost.lock() {
            Ok(slot) => match slot.as_ref() {
                Some(message) => Err(GpuError::DeviceLost(message.clone())),
                None => Ok(()),
            },
            Err(_) => Err(GpuError::DeviceLost("device-lost state poisoned".into())),
        }
    }
}

impl GpuBackend for WgpuAtlasBackend {
    type StagingBuffer = WgpuStaging;
    type Fence = WgpuFence;
    type CommandBuffer = UploadEncoder;

    fn copy_row_alignment(&self) -> u32 {
        wgpu::COPY_BYTES_PER_ROW_ALIGNMENT
    }

    fn create_staging_buffer(&mut self, size: u64) -> Result<WgpuStaging, GpuError> {
        self.check_device()?;
        let size = size.div_ceil(wgpu::COPY_BUFFER_ALIGNMENT) * wgpu::COPY_BUFFER_ALIGNMENT;
        let max = self.device.limits().max_buffer_size;
        if size > max {
            return Err(GpuError::ResourceCreation {
                what: "staging buffer",
                reason: format!("{} bytes exceeds the device limit of {}", size, max),
            });
        }
        let buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Glyph Atlas Staging"),
            size,
            usage: wgpu::BufferUsages::MAP_WRITE | wgpu::BufferUsages::COPY_SRC,
            mapped_at_creation: true,
        });
        Ok(WgpuStaging {
            buffer,
            size,
            mapped: true,
        })
    }

    fn create_fence(&mut self) -> Result<WgpuFence, GpuError> {
        self.check_device()?;
        Ok(WgpuFence {
            signaled: Arc::new(AtomicBool::new(true)),
        })
    }

    fn map_staging(&mut self, staging: &mut WgpuStaging) -> Result<(), GpuError> {
        self.check_device()?;
        if staging.mapped {
            return Ok(());
        }

        let (tx, rx) = mpsc::channel();
        staging
            .buffer
            .slice(..)
            .map_async(wgpu::MapMode::Write, move |result| {
                let _ = tx.send(result);
            });
        // The frame fence has already signaled, so only this map is pending
        let mapped = poll_until(
            self.map_timeout,
            || {
                self.check_device()?;
                match rx.try_recv() {
                    Ok(Ok(())) => Ok(Some(())),
                    Ok(Err(e)) => Err(GpuError::StagingMap(e.to_string())),
                    Err(mpsc::TryRecvError::Disconnected) => {
                        Err(GpuError::StagingMap("map callback dropped".into()))
                    }
                    Err(mpsc::TryRecvError::Empty) => Ok(None),
                }
            },
            || {
                self.device.poll(wgpu::Maintain::Poll);
            },
        )?;
        match mapped {
            Some(()) => {
                staging.mapped = true;
                Ok(())
            }
            None => Err(GpuError::StagingMap("map callback never fired".into())),
        }
    }

    fn write_staging(
        &mut self,
        staging: &mut WgpuStaging,
        offset: u64,
        data: &[u8],
    ) -> Result<(), GpuError> {
        if !staging.mapped {
            return Err(GpuError::StagingMap("write to unmapped staging buffer".into()));
        }
        let end = offset + data.len() as u64;
        if end > staging.size {
            return Err(GpuError::StagingMap(format!(
                "write {}..{} past the end of a {} byte buffer",
                offset, end, staging.size
            )));
        }
        if data.is_empty() {
            return Ok(());
        }
        let mut view = staging.buffer.slice(offset..end).get_mapped_range_mut();
        view.copy_from_slice(data);
        Ok(())
    }

    fn unmap_staging(&mut self, staging: &mut WgpuStaging) {
        if staging.mapped {
            staging.buffer.unmap();
            staging.mapped = false;
        }
    }

    fn wait_fence(&mut self, fence: &WgpuFence, timeout: Duration) -> Result<(), GpuError> {
        let signaled = poll_until(
            timeout,
            || {
                self.check_device()?;
                Ok(fence.is_signaled().then_some(()))
            },
            || {
                self.device.poll(wgpu::Maintain::Poll);
            },
        )?;
        signaled.ok_or(GpuError::FenceTimeout(timeout))
    }

    fn reset_fence(&mut self, fence: &mut WgpuFence) {
        fence.signaled.store(false, Ordering::Release);
    }

    fn transition(
        &mut self,
        _cmd: &mut UploadEncoder,
        region: AtlasRect,
        from: AtlasAccess,
        to: AtlasAccess,
    ) {
        tracing::trace!("atlas region {:?}: {:?} -> {:?}", region, from, to);
    }

    fn copy_to_atlas(
        &mut self,
        cmd: &mut UploadEncoder,
        staging: &WgpuStaging,
        copy: &UploadCommand,
    ) {
        cmd.encoder.copy_buffer_to_texture(
            wgpu::ImageCopyBuffer {
                buffer: &staging.buffer,
                layout: wgpu::ImageDataLayout {
                    offset: copy.staging_offset,
                    bytes_per_row: Some(copy.bytes_per_row),
                    rows_per_image: Some(copy.rect.height),
                },
            },
            wgpu::ImageCopyTexture {
                texture: &self.texture,
                mip_level: 0,
                origin: wgpu::Origin3d {
                    x: copy.rect.x,
                    y: copy.rect.y,
                    z: 0,
                },
                aspect: wgpu::TextureAspect::All,
            },
            wgpu::Extent3d {
                width: copy.rect.width,
                height: copy.rect.height,
                depth_or_array_layers: 1,
            },
        );
    }

    fn attach_fence(&mut self, cmd: &mut UploadEncoder, fence: &WgpuFence) {
        fence.signaled.store(false, Ordering::Release);
        cmd.fences.push(Arc::clone(&fence.signaled));
    }
}

/// Poll the device until `ready` yields a value or `timeout` passes.
///
/// Only `Maintain::Poll` is used, so submissions made after the awaited work
/// are never waited on.
fn poll_until<T>(
    timeout: Duration,
    mut ready: impl FnMut() -> Result<Option<T>, GpuError>,
    mut poll: impl FnMut(),
) -> Result<Option<T>, GpuError> {
    let start = Instant::now();
    loop {
        if let Some(value) = ready()? {
            return Ok(Some(value));
        }
        if start.elapsed() >= timeout {
            return Ok(None);
        }
        poll();
        thread::sleep(Duration::from_micros(100));
    }
}
