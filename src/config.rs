//! Configuration for the delivery service.
//!
//! Every knob the pipeline, the adapters and the folder cache read lives in
//! [`DeliveryConfig`], built through [`DeliveryConfigBuilder`]. The builder
//! clamps numeric values into their supported ranges and `build()` rejects
//! combinations that cannot work (empty binaries, zero intervals).

use crate::error::DeliveryError;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Configuration shared by every job and background task.
///
/// # Example
/// ```rust
/// use paperdrop::DeliveryConfig;
///
/// let config = DeliveryConfig::builder()
///     .page_size(1404, 1872)
///     .dpi(226)
///     .download_timeout_secs(30)
///     .build()
///     .unwrap();
/// assert_eq!(config.dpi, 226);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryConfig {
    /// Target page width in pixels for rasterised images. Default: 1404.
    pub page_width_px: u32,

    /// Target page height in pixels for rasterised images. Default: 1872.
    pub page_height_px: u32,

    /// Pixel density of the target screen. Default: 226.
    ///
    /// Together with the pixel size this fixes the physical page size
    /// (`px / dpi` inches), so a converted page fills the screen exactly.
    pub dpi: u32,

    /// `-dCompatibilityLevel` passed to the compressor. Default: "1.4".
    pub pdf_compatibility_level: String,

    /// `-dPDFSETTINGS` quality preset passed to the compressor. Default: "/ebook".
    pub pdf_quality_preset: String,

    /// Download timeout for URL sources in seconds. Default: 60.
    pub download_timeout_secs: u64,

    /// Where to fetch the browser user-agent pool at startup.
    /// `None` uses the built-in fallback only.
    pub user_agents_url: Option<String>,

    /// Ephemeral storage for downloads and uploads that are not archived.
    pub upload_dir: PathBuf,

    /// Permanent storage; archived artifacts live in `archive_dir/<prefix>/`.
    pub archive_dir: PathBuf,

    /// Ghostscript binary. Default: "gs".
    pub ghostscript_bin: String,

    /// Remote sync CLI binary. Default: "rmapi".
    pub remote_cli_bin: String,

    /// Folder cache refresh interval in seconds. Default: 3600.
    pub folder_refresh_interval_secs: u64,

    /// Minimum gap between two background folder refreshes, in seconds. Default: 30.
    pub background_refresh_gap_secs: u64,

    /// How often the folder scheduler wakes up, in seconds. Default: 15.
    pub scheduler_tick_secs: u64,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        let base = std::env::temp_dir().join("paperdrop");
        Self {
            page_width_px: 1404,
            page_height_px: 1872,
            dpi: 226,
            pdf_compatibility_level: "1.4".to_string(),
            pdf_quality_preset: "/ebook".to_string(),
            download_timeout_secs: 60,
            user_agents_url: None,
            upload_dir: base.join("uploads"),
            archive_dir: base.join("archive"),
            ghostscript_bin: "gs".to_string(),
            remote_cli_bin: "rmapi".to_string(),
            folder_refresh_interval_secs: 3600,
            background_refresh_gap_secs: 30,
            scheduler_tick_secs: 15,
        }
    }
}

impl DeliveryConfig {
    /// Create a new builder starting from the defaults.
    pub fn builder() -> DeliveryConfigBuilder {
        DeliveryConfigBuilder {
            config: Self::default(),
        }
    }

    pub fn download_timeout(&self) -> Duration {
        Duration::from_secs(self.download_timeout_secs)
    }

    pub fn background_refresh_gap(&self) -> Duration {
        Duration::from_secs(self.background_refresh_gap_secs)
    }

    pub fn scheduler_tick(&self) -> Duration {
        Duration::from_secs(self.scheduler_tick_secs)
    }
}

/// Builder for [`DeliveryConfig`].
#[derive(Debug)]
pub struct DeliveryConfigBuilder {
    config: DeliveryConfig,
}

impl DeliveryConfigBuilder {
    pub fn page_size(mut self, width_px: u32, height_px: u32) -> Self {
        self.config.page_width_px = width_px.max(16);
        self.config.page_height_px = height_px.max(16);
        self
    }

    pub fn dpi(mut self, dpi: u32) -> Self {
        self.config.dpi = dpi.clamp(72, 600);
        self
    }

    pub fn pdf_compatibility_level(mut self, level: impl Into<String>) -> Self {
        self.config.pdf_compatibility_level = level.into();
        self
    }

    pub fn pdf_quality_preset(mut self, preset: impl Into<String>) -> Self {
        self.config.pdf_quality_preset = preset.into();
        self
    }

    pub fn download_timeout_secs(mut self, secs: u64) -> Self {
        self.config.download_timeout_secs = secs.max(1);
        self
    }

    pub fn user_agents_url(mut self, url: impl Into<String>) -> Self {
        self.config.user_agents_url = Some(url.into());
        self
    }

    pub fn upload_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.upload_dir = dir.into();
        self
    }

    pub fn archive_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.archive_dir = dir.into();
        self
    }

    pub fn ghostscript_bin(mut self, bin: impl Into<String>) -> Self {
        self.config.ghostscript_bin = bin.into();
        self
    }

    pub fn remote_cli_bin(mut self, bin: impl Into<String>) -> Self {
        self.config.remote_cli_bin = bin.into();
        self
    }

    pub fn folder_refresh_interval_secs(mut self, secs: u64) -> Self {
        self.config.folder_refresh_interval_secs = secs;
        self
    }

    pub fn background_refresh_gap_secs(mut self, secs: u64) -> Self {
        self.config.background_refresh_gap_secs = secs;
        self
    }

    pub fn scheduler_tick_secs(mut self, secs: u64) -> Self {
        self.config.scheduler_tick_secs = secs.max(1);
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<DeliveryConfig, DeliveryError> {
        let c = &self.config;
        if c.folder_refresh_interval_secs == 0 {
            return Err(DeliveryError::Internal(
                "folder refresh interval must be ≥ 1s".into(),
            ));
        }
        if c.ghostscript_bin.trim().is_empty() || c.remote_cli_bin.trim().is_empty() {
            return Err(DeliveryError::Internal(
                "tool binaries must not be empty".into(),
            ));
        }
        if c.pdf_quality_preset.is_empty() || !c.pdf_quality_preset.starts_with('/') {
            return Err(DeliveryError::Internal(format!(
                "quality preset must look like '/ebook', got '{}'",
                c.pdf_quality_preset
            )));
        }
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_tablet_screen() {
        let c = DeliveryConfig::default();
        assert_eq!((c.page_width_px, c.page_height_px, c.dpi), (1404, 1872, 226));
        assert_eq!(c.download_timeout(), Duration::from_secs(60));
    }

    #[test]
    fn builder_clamps_ranges() {
        let c = DeliveryConfig::builder()
            .dpi(10)
            .download_timeout_secs(0)
            .page_size(1, 1)
            .build()
            .unwrap();
        assert_eq!(c.dpi, 72);
        assert_eq!(c.download_timeout_secs, 1);
        assert_eq!(c.page_width_px, 16);
    }

    #[test]
    fn builder_rejects_zero_interval() {
        let err = DeliveryConfig::builder()
            .folder_refresh_interval_secs(0)
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("interval"));
    }

    #[test]
    fn builder_rejects_bad_preset() {
        assert!(DeliveryConfig::builder()
            .pdf_quality_preset("ebook")
            .build()
            .is_err());
    }
}
