//! Progress-callback trait for byte transfers.
//!
//! Source acquisition reports bytes as they arrive through an
//! [`Arc<dyn TransferProgress>`]. The pipeline plugs in [`JobProgress`],
//! which turns byte counts into the job's 0–100 progress; callers that do
//! not care use [`NoopProgress`].
//!
//! # Example
//!
//! ```rust
//! use paperdrop::TransferProgress;
//! use std::sync::atomic::{AtomicU64, Ordering};
//!
//! struct Counter(AtomicU64);
//!
//! impl TransferProgress for Counter {
//!     fn on_bytes(&self, downloaded: u64, _total: Option<u64>) {
//!         self.0.store(downloaded, Ordering::SeqCst);
//!     }
//! }
//! ```

use crate::job::JobId;
use crate::store::JobStore;
use std::sync::Arc;

/// Called as a transfer makes progress. All methods default to no-ops.
pub trait TransferProgress: Send + Sync {
    /// `downloaded` bytes so far; `total` when the server announced a length.
    fn on_bytes(&self, downloaded: u64, total: Option<u64>) {
        let _ = (downloaded, total);
    }

    /// Called once after the last byte was written.
    fn on_complete(&self, total: u64) {
        let _ = total;
    }
}

/// A no-op implementation for callers that don't need progress events.
pub struct NoopProgress;

impl TransferProgress for NoopProgress {}

/// Maps transfer progress onto a job's percentage.
///
/// Without a known total nothing is reported until completion.
pub struct JobProgress {
    store: Arc<JobStore>,
    job_id: JobId,
}

impl JobProgress {
    pub fn new(store: Arc<JobStore>, job_id: JobId) -> Self {
        Self { store, job_id }
    }
}

impl TransferProgress for JobProgress {
    fn on_bytes(&self, downloaded: u64, total: Option<u64>) {
        if let Some(total) = total.filter(|t| *t > 0) {
            let pct = (downloaded.saturating_mul(100) / total).min(100);
            self.store.update_progress(&self.job_id, pct as i64);
        }
    }

    fn on_complete(&self, _total: u64) {
        self.store.update_progress(&self.job_id, 100);
    }
}
