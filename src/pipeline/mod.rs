//! The per-job delivery pipeline.
//!
//! Each submodule implements one stage; [`Pipeline`] strings them together
//! for one request at a time and owns the job's state machine.
//!
//! ## Data Flow
//!
//! ```text
//! input ──▶ render ──▶ compress ──▶ deliver
//! (path/URL) (image→PDF) (gs)        (put, list, delete)
//! ```
//!
//! 1. [`input`]: take ownership of a local file, or download a URL
//! 2. [`render`]: rasterise images onto a single PDF page
//! 3. [`compress`]: only when requested and the document is a PDF
//! 4. [`deliver`]: apply the manage/archive policy and upload
//!
//! Every file a stage creates is wrapped in an [`Artifact`] the moment its
//! path is chosen, and every job works inside its own temporary workspace,
//! so nothing but the archived copy outlives the job, whichever way it ends.
//! A panic inside a run is caught and recorded as `internal_error`.

pub mod compress;
pub mod deliver;
pub mod input;
pub mod render;

use crate::artifact::{claim_file, claim_path, extension_of, Artifact, Storage};
use crate::config::DeliveryConfig;
use crate::error::{DeliveryError, ErrorCode};
use crate::job::{JobData, JobId, JobStatus, Operation};
use crate::progress::JobProgress;
use crate::remote::{CliRemoteStore, RemoteStore};
use crate::request::{extract_url, sanitize_prefix, DeliveryRequest, SourceSpec};
use crate::store::JobStore;
use base64::Engine;
use compress::{CompressProgress, GhostscriptCompressor, PdfCompressor};
use deliver::Delivered;
use futures::FutureExt;
use input::{Fetcher, PublicAddressPolicy, UrlPolicy, UserAgentPool};
use render::{NativeRasterizer, PageGeometry, Rasterizer};
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use tokio::io::AsyncWriteExt;
use tracing::{debug, error, info, warn};

/// Name used for uploads whose filename carries no usable stem.
const DEFAULT_UPLOAD_NAME: &str = "upload";

/// A source after enqueue-time preparation.
#[derive(Debug)]
enum StagedSource {
    File(PathBuf),
    Text(String),
}

enum Acquire {
    Local(Artifact),
    Remote(String),
}

/// Runs delivery requests, one task per job.
pub struct Pipeline {
    store: Arc<JobStore>,
    storage: Storage,
    fetcher: Fetcher,
    rasterizer: Arc<dyn Rasterizer>,
    compressor: Arc<dyn PdfCompressor>,
    remote: Arc<dyn RemoteStore>,
    geometry: PageGeometry,
}

impl Pipeline {
    pub fn builder(config: DeliveryConfig) -> PipelineBuilder {
        PipelineBuilder {
            config,
            store: None,
            rasterizer: None,
            compressor: None,
            remote: None,
            url_policy: None,
            user_agents: None,
        }
    }

    pub fn store(&self) -> &Arc<JobStore> {
        &self.store
    }

    pub fn remote(&self) -> &Arc<dyn RemoteStore> {
        &self.remote
    }

    /// Accept a request and start its job. Returns as soon as the job exists.
    ///
    /// The prefix is validated before anything touches the disk, and uploaded
    /// bytes are decoded and written here, so `invalid_prefix`,
    /// `decode_error`, `unsupported_file_type` and `save_error` are reported
    /// to the caller instead of on a job.
    pub async fn enqueue(self: &Arc<Self>, request: DeliveryRequest) -> Result<JobId, ErrorCode> {
        let prefix = sanitize_prefix(&request.prefix).map_err(|e| {
            warn!("Rejected request: {}", e);
            e.code()
        })?;

        let workspace = self.storage.workspace().map_err(|e| {
            error!("Failed to create job workspace: {}", e);
            ErrorCode::InternalError
        })?;

        let staged = match &request.source {
            SourceSpec::Local { path } => StagedSource::File(path.clone()),
            SourceSpec::Url { body } => StagedSource::Text(body.clone()),
            SourceSpec::Bytes { filename, data } => {
                let path = self
                    .save_upload(&request, &prefix, filename, data, workspace.path())
                    .await
                    .map_err(|e| {
                        warn!("Rejected upload '{}': {}", filename, e);
                        e.code()
                    })?;
                StagedSource::File(path)
            }
        };

        let id = JobId::new();
        self.store.create(&id);
        info!(job = %id, "Enqueued");
        tokio::spawn(Arc::clone(self).run(id.clone(), request, prefix, staged, workspace));
        Ok(id)
    }

    async fn save_upload(
        &self,
        request: &DeliveryRequest,
        prefix: &str,
        filename: &str,
        data: &str,
        workspace: &Path,
    ) -> Result<PathBuf, DeliveryError> {
        let name = Path::new(filename)
            .file_name()
            .map(|n| n.to_string_lossy().trim().to_string())
            .filter(|n| !n.is_empty() && !n.starts_with('.'))
            .unwrap_or_else(|| DEFAULT_UPLOAD_NAME.to_string());
        let ext = extension_of(Path::new(&name));
        if !input::is_known_extension(&ext) {
            return Err(DeliveryError::UnsupportedFileType { path: name.into() });
        }

        let bytes = base64::engine::general_purpose::STANDARD
            .decode(data.trim())
            .map_err(|e| DeliveryError::Decode(e.to_string()))?;

        let dir = self
            .storage
            .destination(request.archive, prefix, workspace)
            .await
            .map_err(|source| DeliveryError::Save {
                path: workspace.to_path_buf(),
                source,
            })?;
        let (path, mut file) = claim_file(&dir, &name)
            .await
            .map_err(|source| DeliveryError::Save {
                path: dir.join(&name),
                source,
            })?;
        let guard = Artifact::new(&path);
        let written = async {
            file.write_all(&bytes).await?;
            file.flush().await
        };
        written.await.map_err(|source| DeliveryError::Save {
            path: path.clone(),
            source,
        })?;
        guard.retain();
        debug!("Saved {} bytes to {}", bytes.len(), path.display());
        Ok(path)
    }

    async fn run(
        self: Arc<Self>,
        id: JobId,
        request: DeliveryRequest,
        prefix: String,
        staged: StagedSource,
        workspace: TempDir,
    ) {
        let outcome = AssertUnwindSafe(self.execute(&id, &request, &prefix, staged, workspace.path()))
            .catch_unwind()
            .await;

        match outcome {
            Ok(Ok(delivered)) => {
                info!(job = %id, path = %delivered.remote_path, "Delivered");
                let mut data = JobData::new();
                data.insert("path".to_string(), delivered.remote_path);
                self.store.update(&id, JobStatus::Success, "", Some(data));
            }
            Ok(Err(e)) => {
                warn!(job = %id, "Failed: {}", e);
                let data = e.client_detail().map(|detail| {
                    let mut data = JobData::new();
                    data.insert("detail".to_string(), detail.to_string());
                    data
                });
                self.store.update(&id, JobStatus::Error, e.code().as_str(), data);
            }
            Err(_) => {
                error!(job = %id, "Pipeline panicked");
                self.store
                    .update(&id, JobStatus::Error, ErrorCode::InternalError.as_str(), None);
            }
        }

        if let Err(e) = workspace.close() {
            warn!(job = %id, "Failed to remove workspace: {}", e);
        }
    }

    async fn execute(
        &self,
        id: &JobId,
        request: &DeliveryRequest,
        prefix: &str,
        staged: StagedSource,
        workspace: &Path,
    ) -> Result<Delivered, DeliveryError> {
        // A staged file belongs to the job from here on, whatever happens next.
        let source = match staged {
            StagedSource::File(path) => Acquire::Local(Artifact::new(path)),
            StagedSource::Text(body) => Acquire::Remote(body),
        };

        let dest = self
            .storage
            .destination(request.archive, prefix, workspace)
            .await
            .map_err(|e| DeliveryError::Internal(format!("destination: {e}")))?;

        // ── Acquire ──────────────────────────────────────────────────────
        let mut artifact = match source {
            Acquire::Local(local) => {
                self.store.update_stage(id, Operation::Processing);
                relocate(input::resolve_local(local)?, &dest).await?
            }
            Acquire::Remote(body) => {
                self.store.update_stage(id, Operation::Downloading);
                let url = extract_url(&body).ok_or(DeliveryError::NoUrl)?;
                let progress = JobProgress::new(Arc::clone(&self.store), id.clone());
                self.fetcher.download(&url, &dest, &progress).await?
            }
        };

        // ── Convert ──────────────────────────────────────────────────────
        if render::is_image_extension(&artifact.extension()) {
            self.store.update_stage(id, Operation::Converting);
            let out = claim_path(&dest, &render::pdf_name_for(artifact.path()))
                .await
                .map_err(|e| DeliveryError::Internal(format!("claim PDF path: {e}")))?;
            let pdf = Artifact::new(&out);
            self.rasterizer
                .rasterize(artifact.path(), &out, &self.geometry)
                .await
                .map_err(|e| DeliveryError::ConversionFailed {
                    path: artifact.path().to_path_buf(),
                    detail: e.to_string(),
                })?;
            self.store.update_progress(id, 100);
            artifact = pdf;
        }

        let ext = artifact.extension();
        if ext != "pdf" && ext != "epub" {
            return Err(DeliveryError::UnsupportedFileType {
                path: artifact.path().to_path_buf(),
            });
        }

        // ── Compress ─────────────────────────────────────────────────────
        if request.compress && ext == "pdf" {
            self.store.update_stage(id, Operation::Compressing);
            let out = claim_path(&dest, &compress::compressed_name_for(artifact.path()))
                .await
                .map_err(|e| DeliveryError::Internal(format!("claim output path: {e}")))?;
            let compressed = Artifact::new(&out);

            let progress = Mutex::new(CompressProgress::new());
            let store = &self.store;
            let on_line = |line: &str| {
                let advanced = progress.lock().ok().and_then(|mut p| p.observe(line));
                if let Some(pct) = advanced {
                    store.update_progress(id, i64::from(pct));
                }
            };
            self.compressor
                .compress(artifact.path(), &out, &on_line)
                .await
                .map_err(|e| DeliveryError::CompressionFailed {
                    path: artifact.path().to_path_buf(),
                    detail: e.to_string(),
                })?;
            let done = progress.into_inner().map_or(100, |mut p| p.finish());
            self.store.update_progress(id, i64::from(done));
            // The pre-compression file is deleted here.
            artifact = compressed;

            if !request.manage {
                if let Some(name) = compress::strip_compressed_suffix(&artifact.file_name()) {
                    let from = artifact.path().to_path_buf();
                    let to = from.with_file_name(name);
                    artifact
                        .rename_exclusive(&to)
                        .await
                        .map_err(|source| DeliveryError::RenameFailed { from, to, source })?;
                }
            }
        }

        // ── Upload ───────────────────────────────────────────────────────
        self.store.update_stage(id, Operation::Uploading);
        let today = chrono::Local::now().date_naive();
        deliver::deliver(self.remote.as_ref(), artifact, request, prefix, today).await
    }
}

/// Move a local source into `dest` unless it is already there.
async fn relocate(mut artifact: Artifact, dest: &Path) -> Result<Artifact, DeliveryError> {
    if artifact.path().parent() == Some(dest) {
        return Ok(artifact);
    }
    let from = artifact.path().to_path_buf();
    let to = claim_path(dest, &artifact.file_name())
        .await
        .map_err(|source| DeliveryError::RenameFailed {
            from: from.clone(),
            to: dest.join(artifact.file_name()),
            source,
        })?;
    if let Err(e) = artifact.rename_to(&to).await {
        // Different filesystems: copy over the claimed file, then let the
        // old guard delete the source.
        debug!("rename {} failed ({}), copying", from.display(), e);
        let moved = Artifact::new(&to);
        tokio::fs::copy(&from, &to)
            .await
            .map_err(|source| DeliveryError::RenameFailed {
                from: from.clone(),
                to: to.clone(),
                source,
            })?;
        drop(artifact);
        return Ok(moved);
    }
    Ok(artifact)
}

/// Assembles a [`Pipeline`] from a config plus optional adapter overrides.
pub struct PipelineBuilder {
    config: DeliveryConfig,
    store: Option<Arc<JobStore>>,
    rasterizer: Option<Arc<dyn Rasterizer>>,
    compressor: Option<Arc<dyn PdfCompressor>>,
    remote: Option<Arc<dyn RemoteStore>>,
    url_policy: Option<Arc<dyn UrlPolicy>>,
    user_agents: Option<Arc<UserAgentPool>>,
}

impl PipelineBuilder {
    pub fn store(mut self, store: Arc<JobStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn rasterizer(mut self, rasterizer: Arc<dyn Rasterizer>) -> Self {
        self.rasterizer = Some(rasterizer);
        self
    }

    pub fn compressor(mut self, compressor: Arc<dyn PdfCompressor>) -> Self {
        self.compressor = Some(compressor);
        self
    }

    pub fn remote(mut self, remote: Arc<dyn RemoteStore>) -> Self {
        self.remote = Some(remote);
        self
    }

    pub fn url_policy(mut self, policy: Arc<dyn UrlPolicy>) -> Self {
        self.url_policy = Some(policy);
        self
    }

    pub fn user_agents(mut self, pool: Arc<UserAgentPool>) -> Self {
        self.user_agents = Some(pool);
        self
    }

    pub fn build(self) -> Result<Arc<Pipeline>, DeliveryError> {
        let config = self.config;
        let policy = self
            .url_policy
            .unwrap_or_else(|| Arc::new(PublicAddressPolicy));
        let agents = self
            .user_agents
            .unwrap_or_else(|| Arc::new(UserAgentPool::fallback()));
        let fetcher = Fetcher::new(config.download_timeout(), policy, agents)?;

        Ok(Arc::new(Pipeline {
            store: self.store.unwrap_or_else(JobStore::new),
            storage: Storage::from_config(&config),
            fetcher,
            rasterizer: self
                .rasterizer
                .unwrap_or_else(|| Arc::new(NativeRasterizer)),
            compressor: self
                .compressor
                .unwrap_or_else(|| Arc::new(GhostscriptCompressor::from_config(&config))),
            remote: self
                .remote
                .unwrap_or_else(|| Arc::new(CliRemoteStore::new(&config.remote_cli_bin))),
            geometry: PageGeometry::from_config(&config),
        }))
    }
}
