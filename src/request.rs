//! Delivery requests as accepted by enqueue.

use crate::error::DeliveryError;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Default remote retention window for managed deliveries.
pub const DEFAULT_RETENTION_DAYS: u32 = 7;

/// Where the document comes from.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SourceSpec {
    /// A file already on local disk. The pipeline takes ownership of it.
    Local { path: PathBuf },
    /// Free text (a URL, or a message body containing one).
    Url { body: String },
    /// Raw uploaded bytes, base64-encoded, saved to disk at enqueue time.
    Bytes { filename: String, data: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictResolution {
    /// Fail when the remote name already exists.
    #[default]
    Abort,
    /// Replace the existing remote document.
    Overwrite,
    /// Replace content only, keeping annotations. PDF only.
    ContentOnly,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CoverPage {
    /// Thumbnail shows the last opened page.
    #[default]
    Current,
    /// Thumbnail shows the first page.
    First,
}

/// One delivery, immutable once enqueued.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryRequest {
    pub source: SourceSpec,
    #[serde(default)]
    pub prefix: String,
    #[serde(default)]
    pub compress: bool,
    #[serde(default)]
    pub manage: bool,
    #[serde(default)]
    pub archive: bool,
    #[serde(default = "default_remote_dir")]
    pub remote_dir: String,
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
    #[serde(default)]
    pub conflict_resolution: ConflictResolution,
    #[serde(default)]
    pub cover_page: CoverPage,
}

fn default_remote_dir() -> String {
    "/".to_string()
}

fn default_retention_days() -> u32 {
    DEFAULT_RETENTION_DAYS
}

impl DeliveryRequest {
    pub fn new(source: SourceSpec) -> Self {
        Self {
            source,
            prefix: String::new(),
            compress: false,
            manage: false,
            archive: false,
            remote_dir: default_remote_dir(),
            retention_days: DEFAULT_RETENTION_DAYS,
            conflict_resolution: ConflictResolution::default(),
            cover_page: CoverPage::default(),
        }
    }

    pub fn prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    pub fn remote_dir(mut self, dir: impl Into<String>) -> Self {
        self.remote_dir = dir.into();
        self
    }

    pub fn compress(mut self, v: bool) -> Self {
        self.compress = v;
        self
    }

    pub fn manage(mut self, v: bool) -> Self {
        self.manage = v;
        self
    }

    pub fn archive(mut self, v: bool) -> Self {
        self.archive = v;
        self
    }

    pub fn retention_days(mut self, days: u32) -> Self {
        self.retention_days = days;
        self
    }

    pub fn conflict_resolution(mut self, c: ConflictResolution) -> Self {
        self.conflict_resolution = c;
        self
    }

    pub fn cover_page(mut self, c: CoverPage) -> Self {
        self.cover_page = c;
        self
    }

    /// Retention window, never below one day.
    pub fn effective_retention_days(&self) -> u32 {
        self.retention_days.max(1)
    }
}

/// Validate a folder/filename stem.
///
/// A valid prefix comes back exactly as given. Path separators (which also
/// covers absolute paths), `..` and NUL are rejected.
pub fn sanitize_prefix(prefix: &str) -> Result<String, DeliveryError> {
    let invalid = prefix.contains(['/', '\\', '\0']) || prefix.contains("..");
    if invalid {
        return Err(DeliveryError::InvalidPrefix {
            prefix: prefix.to_string(),
        });
    }
    Ok(prefix.to_string())
}

static RE_URL: Lazy<Regex> = Lazy::new(|| Regex::new(r#"https?://[^\s<>"']+"#).unwrap());

/// First http(s) URL in a free-text body, trailing punctuation removed.
pub fn extract_url(body: &str) -> Option<String> {
    RE_URL.find(body).map(|m| {
        m.as_str()
            .trim_end_matches(['.', ',', ';', ')', ']', '>'])
            .to_string()
    })
}
