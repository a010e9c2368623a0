//! Atlas configuration
//!
//! All sizes are fixed for the lifetime of an [`AtlasManager`](crate::AtlasManager):
//! the page capacity, the number of upload frames and the staging budget are
//! baked into the resources created at startup.
//!
//! Values come from [`AtlasConfig::default`], a TOML document
//! ([`AtlasConfig::from_toml_str`]) and finally environment overrides
//! ([`AtlasConfig::with_env_overrides`]):
//!
//! - `TESSERA_ATLAS_SIZE=2048` (sets both width and height)
//! - `TESSERA_PAGE_SIZE=32`
//! - `TESSERA_UPLOAD_FRAMES=2`
//! - `TESSERA_MAX_UPLOADS_PER_FRAME=256`
//! - `TESSERA_STAGING_BYTES=8388608`

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

fn env_u32(name: &str) -> Option<u32> {
    parse_env(name)
}

fn env_usize(name: &str) -> Option<usize> {
    parse_env(name)
}

fn env_u64(name: &str) -> Option<u64> {
    parse_env(name)
}

fn parse_env<T: std::str::FromStr>(name: &str) -> Option<T> {
    let raw = std::env::var(name).ok()?;
    match raw.trim().parse::<T>() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!("ignoring {}={:?}: not a valid number", name, raw);
            None
        }
    }
}

/// Texel format of the atlas texture (and therefore of rasterized bitmaps)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TexelFormat {
    /// Single-channel coverage (grayscale glyphs)
    #[default]
    Alpha8,
    /// Four-channel color (color emoji, subpixel masks)
    Rgba8,
}

impl TexelFormat {
    /// Bytes occupied by one texel
    pub const fn bytes_per_texel(self) -> u32 {
        match self {
            TexelFormat::Alpha8 => 1,
            TexelFormat::Rgba8 => 4,
        }
    }
}

/// Configuration errors, reported by [`AtlasConfig::validate`]
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("{0} must be non-zero")]
    Zero(&'static str),

    #[error("page size {page} is larger than the atlas ({width}x{height})")]
    PageLargerThanAtlas { page: u32, width: u32, height: u32 },

    #[error("atlas {width}x{height} is not a whole number of {page}px pages")]
    NotDivisible { page: u32, width: u32, height: u32 },

    #[error("need at least 2 upload frames, got {0}")]
    TooFewFrames(usize),

    #[error("staging buffer of {staging} bytes cannot hold one full page ({required} bytes)")]
    StagingTooSmall { staging: u64, required: u64 },

    #[error("invalid atlas config: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Atlas sizing and upload budget
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AtlasConfig {
    /// Atlas texture width in texels
    pub atlas_width: u32,
    /// Atlas texture height in texels
    pub atlas_height: u32,
    /// Edge length of one square page in texels
    pub page_size: u32,
    /// Texel format of the atlas texture
    pub texel_format: TexelFormat,
    /// Number of rotating upload frames (3 = triple buffering)
    pub upload_frames: usize,
    /// Maximum copy commands recorded per frame
    pub max_uploads_per_frame: usize,
    /// Staging buffer size per upload frame, in bytes
    pub staging_bytes_per_frame: u64,
    /// How long a frame fence may take before the device is considered hung
    pub fence_timeout_ms: u64,
}

impl Default for AtlasConfig {
    fn default() -> Self {
        Self {
            atlas_width: 4096,
            atlas_height: 4096,
            page_size: 64,
            texel_format: TexelFormat::Alpha8,
            upload_frames: 3,
            max_uploads_per_frame: 128,
            // 128 full 64x64 alpha pages with 256-byte row pitch
            staging_bytes_per_frame: 4 * 1024 * 1024,
            fence_timeout_ms: 2_000,
        }
    }
}

impl AtlasConfig {
    /// Square atlas of `atlas_size` texels split into `page_size` pages,
    /// everything else default
    pub fn square(atlas_size: u32, page_size: u32) -> Self {
        Self {
            atlas_width: atlas_size,
            atlas_height: atlas_size,
            page_size,
            ..Default::default()
        }
    }

    /// Parse a TOML document; missing keys keep their defaults
    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        let config: AtlasConfig = toml::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `TESSERA_*` environment overrides.
    ///
    /// Unparsable values are ignored with a warning.
    pub fn with_env_overrides(mut self) -> Self {
        if let Some(v) = env_u32("TESSERA_ATLAS_SIZE") {
            self.atlas_width = v;
            self.atlas_height = v;
        }
        if let Some(v) = env_u32("TESSERA_PAGE_SIZE") {
            self.page_size = v;
        }
        if let Some(v) = env_usize("TESSERA_UPLOAD_FRAMES") {
            self.upload_frames = v;
        }
        if let Some(v) = env_usize("TESSERA_MAX_UPLOADS_PER_FRAME") {
            self.max_uploads_per_frame = v;
        }
        if let Some(v) = env_u64("TESSERA_STAGING_BYTES") {
            self.staging_bytes_per_frame = v;
        }
        self
    }

    /// Check that the sizes describe a usable atlas
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.atlas_width == 0 {
            return Err(ConfigError::Zero("atlas_width"));
        }
        if self.atlas_height == 0 {
            return Err(ConfigError::Zero("atlas_height"));
        }
        if self.page_size == 0 {
            return Err(ConfigError::Zero("page_size"));
        }
        if self.upload_frames < 2 {
            return Err(ConfigError::TooFewFrames(self.upload_frames));
        }
        if self.max_uploads_per_frame == 0 {
            return Err(ConfigError::Zero("max_uploads_per_frame"));
        }
        if self.fence_timeout_ms == 0 {
            return Err(ConfigError::Zero("fence_timeout_ms"));
        }
        if self.page_size > self.atlas_width || self.page_size > self.atlas_height {
            return Err(ConfigError::PageLargerThanAtlas {
                page: self.page_size,
                width: self.atlas_width,
                height: self.atlas_height,
            });
        }
        if self.atlas_width % self.page_size != 0 || self.atlas_height % self.page_size != 0 {
            return Err(ConfigError::NotDivisible {
                page: self.page_size,
                width: self.atlas_width,
                height: self.atlas_height,
            });
        }
        let required = self.page_bytes();
        if self.staging_bytes_per_frame < required {
            return Err(ConfigError::StagingTooSmall {
                staging: self.staging_bytes_per_frame,
                required,
            });
        }
        Ok(())
    }

    /// Pages along the x axis
    pub fn pages_per_row(&self) -> u32 {
        self.atlas_width / self.page_size
    }

    /// Pages along the y axis
    pub fn pages_per_column(&self) -> u32 {
        self.atlas_height / self.page_size
    }

    /// Total page capacity of the atlas
    pub fn page_capacity(&self) -> usize {
        self.pages_per_row() as usize * self.pages_per_column() as usize
    }

    /// Tightly packed size of one full page
    pub fn page_bytes(&self) -> u64 {
        let side = u64::from(self.page_size);
        side * side * u64::from(self.texel_format.bytes_per_texel())
    }

    /// Fence timeout as a [`Duration`]
    pub fn fence_timeout(&self) -> Duration {
        Duration::from_millis(self.fence_timeout_ms)
    }
}

pub(crate) fn log_atlas_config(config: &AtlasConfig) {
    tracing::info!(
        "atlas config: {}x{} texels, {}px pages ({} pages), format={:?}, frames={}, max_uploads={}, staging={} KiB",
        config.atlas_width,
        config.atlas_height,
        config.page_size,
        config.page_capacity(),
        config.texel_format,
        config.upload_frames,
        config.max_uploads_per_frame,
        config.staging_bytes_per_frame / 1024
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_capacity() {
        let config = AtlasConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.page_capacity(), 4096);
        assert_eq!(config.pages_per_row(), 64);
    }

    #[test]
    fn test_rejects_uneven_pages() {
        let config = AtlasConfig::square(100, 64);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::NotDivisible { .. })
        ));
    }

    #[test]
    fn test_rejects_page_larger_than_atlas() {
        let config = AtlasConfig::square(32, 64);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::PageLargerThanAtlas { .. })
        ));
    }

    #[test]
    fn test_rejects_tiny_staging() {
        let config = AtlasConfig {
            staging_bytes_per_frame: 16,
            ..AtlasConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::StagingTooSmall { .. })
        ));
    }

    #[test]
    fn test_toml_partial_override() {
        let config = AtlasConfig::from_toml_str(
            r#"
            atlas_width = 1024
            atlas_height = 512
            page_size = 32
            texel_format = "rgba8"
            "#,
        )
        .unwrap();
        assert_eq!(config.page_capacity(), 32 * 16);
        assert_eq!(config.texel_format, TexelFormat::Rgba8);
        assert_eq!(config.upload_frames, 3);
        assert_eq!(config.page_bytes(), 32 * 32 * 4);
    }

    #[test]
    fn test_rejects_single_upload_frame() {
        let config = AtlasConfig {
            upload_frames: 1,
            ..AtlasConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::TooFewFrames(1))
        ));
    }

    #[test]
    fn test_toml_invalid_values_rejected() {
        assert!(AtlasConfig::from_toml_str("page_size = 0").is_err());
        assert!(AtlasConfig::from_toml_str("page_size = \"big\"").is_err());
    }
}
