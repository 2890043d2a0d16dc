//! Error types for the paperdrop library.
//!
//! Three layers of failure exist, each with its own type:
//!
//! * [`ErrorCode`]: the opaque, machine-readable code a client sees on a
//!   failed job (or an enqueue-time rejection). Never carries prose.
//!
//! * [`DeliveryError`]: fatal for one job. A pipeline stage failed and
//!   the job moves straight to `error`. Every variant maps to exactly one
//!   [`ErrorCode`] through [`DeliveryError::code`]; the rich `Display` text
//!   only ever reaches the logs.
//!
//! * [`ToolError`] / [`crate::remote::RemoteError`]: failures of an
//!   external collaborator (subprocess, remote CLI). Stages wrap these into
//!   the matching `DeliveryError` variant.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Machine-readable job failure codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    InvalidPrefix,
    NoUrl,
    DownloadError,
    ConversionError,
    CompressError,
    RenameError,
    InternalError,
    UnsupportedFileType,
    DecodeError,
    SaveError,
    JobNotFound,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::InvalidPrefix => "invalid_prefix",
            ErrorCode::NoUrl => "no_url",
            ErrorCode::DownloadError => "download_error",
            ErrorCode::ConversionError => "conversion_error",
            ErrorCode::CompressError => "compress_error",
            ErrorCode::RenameError => "rename_error",
            ErrorCode::InternalError => "internal_error",
            ErrorCode::UnsupportedFileType => "unsupported_file_type",
            ErrorCode::DecodeError => "decode_error",
            ErrorCode::SaveError => "save_error",
            ErrorCode::JobNotFound => "job_not_found",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// All fatal per-job errors raised by the delivery pipeline.
#[derive(Debug, Error)]
pub enum DeliveryError {
    // ── Request errors ────────────────────────────────────────────────────
    /// Prefix contains a separator, `..`, or is absolute.
    #[error("Invalid prefix '{prefix}'")]
    InvalidPrefix { prefix: String },

    /// Body text carried no http(s) URL.
    #[error("No URL found in request body")]
    NoUrl,

    /// Extension is neither a document nor a convertible image.
    #[error("Unsupported file type: '{path}'")]
    UnsupportedFileType { path: PathBuf },

    /// Raw upload bytes were not valid base64.
    #[error("Failed to decode upload: {0}")]
    Decode(String),

    /// Raw upload could not be written to local storage.
    #[error("Failed to save upload to '{path}': {source}")]
    Save {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // ── Acquisition errors ────────────────────────────────────────────────
    /// URL refused by the SSRF policy.
    #[error("URL '{url}' rejected: {reason}")]
    UrlRejected { url: String, reason: String },

    /// HTTP request failed or returned a non-2xx status.
    #[error("Failed to download '{url}': {reason}")]
    DownloadFailed { url: String, reason: String },

    /// Download exceeded the configured timeout.
    #[error("Download timed out after {secs}s for '{url}'")]
    DownloadTimeout { url: String, secs: u64 },

    // ── Transformation errors ─────────────────────────────────────────────
    /// Image → PDF rasterisation failed.
    #[error("Conversion of '{path}' failed: {detail}")]
    ConversionFailed { path: PathBuf, detail: String },

    /// Lossy PDF recompression failed.
    #[error("Compression of '{path}' failed: {detail}")]
    CompressionFailed { path: PathBuf, detail: String },

    /// Renaming an artifact on local disk failed.
    #[error("Failed to rename '{from}' to '{to}': {source}")]
    RenameFailed {
        from: PathBuf,
        to: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // ── Delivery errors ───────────────────────────────────────────────────
    /// The upload adapter reported a failure. `detail` is already stripped
    /// of tool-internal syntax.
    #[error("Upload failed: {detail}")]
    UploadFailed { detail: String },

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl DeliveryError {
    /// The code recorded on the job when this error ends it.
    pub fn code(&self) -> ErrorCode {
        match self {
            DeliveryError::InvalidPrefix { .. } => ErrorCode::InvalidPrefix,
            DeliveryError::NoUrl => ErrorCode::NoUrl,
            DeliveryError::UnsupportedFileType { .. } => ErrorCode::UnsupportedFileType,
            DeliveryError::Decode(_) => ErrorCode::DecodeError,
            DeliveryError::Save { .. } => ErrorCode::SaveError,
            DeliveryError::UrlRejected { .. }
            | DeliveryError::DownloadFailed { .. }
            | DeliveryError::DownloadTimeout { .. } => ErrorCode::DownloadError,
            DeliveryError::ConversionFailed { .. } => ErrorCode::ConversionError,
            DeliveryError::CompressionFailed { .. } => ErrorCode::CompressError,
            DeliveryError::RenameFailed { .. } => ErrorCode::RenameError,
            DeliveryError::UploadFailed { .. } | DeliveryError::Internal(_) => {
                ErrorCode::InternalError
            }
        }
    }

    /// Client-safe detail to attach to the job, if any.
    ///
    /// Only upload failures expose text, and only the part the tool itself
    /// marked as its error message.
    pub fn client_detail(&self) -> Option<&str> {
        match self {
            DeliveryError::UploadFailed { detail } => Some(detail),
            _ => None,
        }
    }
}

/// Failure of an external transformation tool (rasteriser, compressor).
#[derive(Debug, Error)]
pub enum ToolError {
    /// The tool binary could not be started.
    #[error("Failed to spawn '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// The tool ran but exited unsuccessfully.
    #[error("'{program}' exited with {status}: {stderr}")]
    Failed {
        program: String,
        status: String,
        stderr: String,
    },

    /// Image decoding or encoding failed.
    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),

    /// PDF assembly failed.
    #[error("PDF error: {0}")]
    Pdf(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_serialize_snake_case() {
        let json = serde_json::to_string(&ErrorCode::UnsupportedFileType).unwrap();
        assert_eq!(json, "\"unsupported_file_type\"");
        assert_eq!(ErrorCode::JobNotFound.to_string(), "job_not_found");
    }

    #[test]
    fn download_variants_share_one_code() {
        let timeout = DeliveryError::DownloadTimeout {
            url: "https://example.com/a.pdf".into(),
            secs: 60,
        };
        let rejected = DeliveryError::UrlRejected {
            url: "http://127.0.0.1/".into(),
            reason: "loopback".into(),
        };
        assert_eq!(timeout.code(), ErrorCode::DownloadError);
        assert_eq!(rejected.code(), ErrorCode::DownloadError);
        assert!(timeout.to_string().contains("60s"));
    }

    #[test]
    fn upload_failure_is_internal_with_detail() {
        let e = DeliveryError::UploadFailed {
            detail: "Error: entry already exists".into(),
        };
        assert_eq!(e.code(), ErrorCode::InternalError);
        assert_eq!(e.client_detail(), Some("Error: entry already exists"));
        assert_eq!(DeliveryError::NoUrl.client_detail(), None);
    }
}
