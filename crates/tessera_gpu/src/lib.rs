//! wgpu backend for the Tessera glyph atlas
//!
//! [`WgpuAtlasBackend`] owns the atlas texture and implements
//! [`tessera_atlas::GpuBackend`] with mapped staging buffers and
//! submission-tracked fences. Each frame:
//!
//! ```ignore
//! let mut encoder = atlas.backend().create_encoder();
//! atlas.process_uploads(&mut encoder)?;
//! // ... record draw passes sampling atlas.backend().view() ...
//! atlas.backend().submit(encoder);
//! ```

pub mod backend;
pub mod context;

pub use backend::{texture_format, UploadEncoder, WgpuAtlasBackend, WgpuFence, WgpuStaging};
pub use context::{ContextError, GpuContext};
