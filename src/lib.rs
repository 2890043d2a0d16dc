//! # paperdrop
//!
//! Deliver documents to an e-ink tablet: hand it a URL, a local file or raw
//! uploaded bytes, and paperdrop fetches it, turns images into screen-sized
//! PDF pages, optionally recompresses the PDF, and uploads it through the
//! device's sync CLI, while observers watch the job's progress live.
//!
//! ## Pipeline Overview
//!
//! ```text
//! request
//!  │
//!  ├─ 1. Acquire   reuse a local file, or download the URL (SSRF-checked)
//!  ├─ 2. Convert   image → single-page PDF at the tablet's size and DPI
//!  ├─ 3. Compress  optional Ghostscript pass with page-level progress
//!  └─ 4. Deliver   simple / archive / managed upload + retention cleanup
//! ```
//!
//! Each request becomes a [`Job`] in the [`JobStore`]; every state change
//! is pushed to subscribers and can be polled at any time.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use paperdrop::{DeliveryConfig, DeliveryRequest, Pipeline, SourceSpec};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let pipeline = Pipeline::builder(DeliveryConfig::default()).build()?;
//!     let request = DeliveryRequest::new(SourceSpec::Url {
//!         body: "https://arxiv.org/pdf/1706.03762".into(),
//!     })
//!     .remote_dir("/Papers")
//!     .compress(true);
//!
//!     let id = pipeline.enqueue(request).await.map_err(|c| c.to_string())?;
//!     let mut updates = pipeline.store().subscribe(&id);
//!     while let Some(job) = updates.recv().await {
//!         eprintln!("{:?} {:?} {}%", job.status, job.operation, job.progress);
//!         if job.status.is_terminal() {
//!             break;
//!         }
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `paperdrop` binary (clap + anyhow + tracing-subscriber + indicatif) |
//!
//! ## External tools
//!
//! Compression runs `gs` and delivery runs an `rmapi`-compatible CLI; both
//! sit behind traits ([`PdfCompressor`], [`RemoteStore`]) so they can be
//! replaced.

// ── Modules ──────────────────────────────────────────────────────────────

pub mod artifact;
pub mod config;
pub mod error;
pub mod folders;
pub mod job;
pub mod pipeline;
pub mod progress;
pub mod remote;
pub mod request;
pub mod server;
pub mod store;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use config::{DeliveryConfig, DeliveryConfigBuilder};
pub use error::{DeliveryError, ErrorCode, ToolError};
pub use folders::{FolderCache, FolderError};
pub use job::{Job, JobData, JobId, JobStatus, Operation};
pub use pipeline::compress::PdfCompressor;
pub use pipeline::render::{PageGeometry, Rasterizer};
pub use pipeline::{Pipeline, PipelineBuilder};
pub use progress::{JobProgress, NoopProgress, TransferProgress};
pub use remote::{PutFlags, RemoteEntry, RemoteError, RemoteStore};
pub use request::{ConflictResolution, CoverPage, DeliveryRequest, SourceSpec};
pub use store::{JobStore, Subscription};
