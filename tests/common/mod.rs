//! Shared fakes and helpers for the integration tests.
#![allow(dead_code)]

use async_trait::async_trait;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use reqwest::Url;
use paperdrop::error::ToolError;
use paperdrop::pipeline::compress::{LineSink, PdfCompressor};
use paperdrop::pipeline::input::{AllowAllPolicy, UrlPolicy};
use paperdrop::remote::EntryKind;
use paperdrop::{
    DeliveryConfig, Job, JobId, JobStore, Pipeline, PutFlags, RemoteEntry, RemoteError,
    RemoteStore,
};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

// ── Fake remote store ────────────────────────────────────────────────────────

/// One recorded `put`.
#[derive(Debug, Clone)]
pub struct PutRecord {
    pub name: String,
    pub remote_dir: String,
    pub flags: PutFlags,
    pub existed: bool,
}

/// In-memory device: records every command and lists what was put.
#[derive(Default)]
pub struct FakeRemote {
    pub calls: Mutex<Vec<String>>,
    pub puts: Mutex<Vec<PutRecord>>,
    pub files: Mutex<Vec<(String, String)>>,
    pub dirs: Vec<(String, String)>,
    pub fail_put: Option<String>,
}

impl FakeRemote {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn failing(output: &str) -> Arc<Self> {
        Arc::new(Self {
            fail_put: Some(output.to_string()),
            ..Default::default()
        })
    }

    /// Pre-populate `dir` with file entries.
    pub fn with_files(dir: &str, names: &[&str]) -> Arc<Self> {
        let remote = Self::default();
        {
            let mut files = remote.files.lock().unwrap();
            for n in names {
                files.push((dir.to_string(), n.to_string()));
            }
        }
        Arc::new(remote)
    }

    pub fn with_dirs(dirs: &[(&str, &str)]) -> Arc<Self> {
        Arc::new(Self {
            dirs: dirs
                .iter()
                .map(|(parent, name)| (parent.to_string(), name.to_string()))
                .collect(),
            ..Default::default()
        })
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn puts(&self) -> Vec<PutRecord> {
        self.puts.lock().unwrap().clone()
    }
}

#[async_trait]
impl RemoteStore for FakeRemote {
    async fn put(&self, local: &Path, remote_dir: &str, flags: &PutFlags) -> Result<String, RemoteError> {
        let name = local.file_name().unwrap().to_string_lossy().into_owned();
        self.calls
            .lock()
            .unwrap()
            .push(format!("put {name} {remote_dir}"));
        self.puts.lock().unwrap().push(PutRecord {
            name: name.clone(),
            remote_dir: remote_dir.to_string(),
            flags: *flags,
            existed: local.is_file(),
        });
        if let Some(out) = &self.fail_put {
            return Err(RemoteError::new(out.clone()));
        }
        self.files
            .lock()
            .unwrap()
            .push((remote_dir.to_string(), name));
        Ok(String::new())
    }

    async fn list(&self, remote_dir: &str) -> Result<Vec<RemoteEntry>, RemoteError> {
        self.calls.lock().unwrap().push(format!("list {remote_dir}"));
        let mut out: Vec<RemoteEntry> = self
            .dirs
            .iter()
            .filter(|(parent, _)| parent == remote_dir)
            .map(|(_, name)| RemoteEntry {
                kind: EntryKind::Directory,
                name: name.clone(),
            })
            .collect();
        out.extend(
            self.files
                .lock()
                .unwrap()
                .iter()
                .filter(|(dir, _)| dir == remote_dir)
                .map(|(_, name)| RemoteEntry {
                    kind: EntryKind::File,
                    name: name.clone(),
                }),
        );
        Ok(out)
    }

    async fn delete(&self, remote_path: &str) -> Result<(), RemoteError> {
        self.calls
            .lock()
            .unwrap()
            .push(format!("delete {remote_path}"));
        Ok(())
    }
}

/// A remote whose upload panics.
pub struct PanickingRemote;

#[async_trait]
impl RemoteStore for PanickingRemote {
    async fn put(&self, _: &Path, _: &str, _: &PutFlags) -> Result<String, RemoteError> {
        panic!("sync tool crashed");
    }

    async fn list(&self, _: &str) -> Result<Vec<RemoteEntry>, RemoteError> {
        Ok(Vec::new())
    }

    async fn delete(&self, _: &str) -> Result<(), RemoteError> {
        Ok(())
    }
}

// ── Fake compressor ──────────────────────────────────────────────────────────

/// Copies the input and prints Ghostscript-style page lines.
pub struct FakeCompressor {
    pub pages: u32,
    pub fail: bool,
    pub runs: Mutex<Vec<PathBuf>>,
}

impl FakeCompressor {
    pub fn new(pages: u32) -> Arc<Self> {
        Arc::new(Self {
            pages,
            fail: false,
            runs: Mutex::new(Vec::new()),
        })
    }

    pub fn failing() -> Arc<Self> {
        Arc::new(Self {
            pages: 1,
            fail: true,
            runs: Mutex::new(Vec::new()),
        })
    }

    pub fn runs(&self) -> usize {
        self.runs.lock().unwrap().len()
    }
}

#[async_trait]
impl PdfCompressor for FakeCompressor {
    async fn compress(&self, input: &Path, output: &Path, on_line: LineSink<'_>) -> Result<(), ToolError> {
        self.runs.lock().unwrap().push(input.to_path_buf());
        if self.fail {
            return Err(ToolError::Failed {
                program: "gs".into(),
                status: "exit status: 1".into(),
                stderr: "Unrecoverable error".into(),
            });
        }
        on_line(&format!("Processing pages 1 through {}.", self.pages));
        for page in 1..=self.pages {
            on_line(&format!("Page {page}"));
            tokio::task::yield_now().await;
        }
        tokio::fs::copy(input, output).await?;
        Ok(())
    }
}

// ── Environment ──────────────────────────────────────────────────────────────

/// Temporary storage roots plus a small-page config pointing at them.
pub struct TestEnv {
    pub root: TempDir,
    pub config: DeliveryConfig,
}

impl TestEnv {
    pub fn new() -> Self {
        Self::with_download_timeout(5)
    }

    pub fn with_download_timeout(secs: u64) -> Self {
        let root = tempfile::tempdir().unwrap();
        let config = DeliveryConfig::builder()
            .page_size(140, 187)
            .dpi(226)
            .download_timeout_secs(secs)
            .upload_dir(root.path().join("uploads"))
            .archive_dir(root.path().join("archive"))
            .build()
            .unwrap();
        Self { root, config }
    }

    pub fn upload_dir(&self) -> PathBuf {
        self.config.upload_dir.clone()
    }

    pub fn archive_dir(&self) -> PathBuf {
        self.config.archive_dir.clone()
    }

    /// Directory for source files the pipeline will take over.
    pub fn inbox(&self) -> PathBuf {
        let dir = self.root.path().join("inbox");
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    pub fn pipeline(&self, remote: Arc<dyn RemoteStore>, compressor: Arc<dyn PdfCompressor>) -> Arc<Pipeline> {
        self.pipeline_with_policy(remote, compressor, Arc::new(AllowAllPolicy))
    }

    pub fn pipeline_with_policy(
        &self,
        remote: Arc<dyn RemoteStore>,
        compressor: Arc<dyn PdfCompressor>,
        policy: Arc<dyn UrlPolicy>,
    ) -> Arc<Pipeline> {
        Pipeline::builder(self.config.clone())
            .remote(remote)
            .compressor(compressor)
            .url_policy(policy)
            .build()
            .unwrap()
    }
}

/// Refuses one host name and allows everything else.
pub struct RefuseHost(pub &'static str);

#[async_trait]
impl UrlPolicy for RefuseHost {
    async fn check(&self, url: &Url) -> Result<(), String> {
        match url.host_str() {
            Some(host) if host == self.0 => Err(format!("host {host} is not allowed")),
            _ => Ok(()),
        }
    }
}

/// Every regular file under `dir` with a `.pdf` extension.
pub fn pdfs_under(dir: &Path) -> Vec<PathBuf> {
    files_under(dir)
        .into_iter()
        .filter(|p| p.extension().is_some_and(|e| e.eq_ignore_ascii_case("pdf")))
        .collect()
}

/// Files left anywhere under `dir`.
pub fn files_under(dir: &Path) -> Vec<PathBuf> {
    let mut out = Vec::new();
    let Ok(entries) = std::fs::read_dir(dir) else {
        return out;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            out.extend(files_under(&path));
        } else {
            out.push(path);
        }
    }
    out
}

pub fn write_jpeg(path: &Path, w: u32, h: u32) {
    image::RgbImage::from_pixel(w, h, image::Rgb([30, 120, 200]))
        .save(path)
        .unwrap();
}

pub fn write_pdf(path: &Path) {
    std::fs::write(path, b"%PDF-1.4\n%\xe2\xe3\xcf\xd3\n1 0 obj\n<<>>\nendobj\ntrailer\n<<>>\n%%EOF\n").unwrap();
}

/// Poll the store until the job is terminal.
pub async fn wait_terminal(store: &JobStore, id: &JobId) -> Job {
    tokio::time::timeout(Duration::from_secs(20), async {
        loop {
            if let Some(job) = store.get(id) {
                if job.status.is_terminal() {
                    return job;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("job did not finish in time")
}

// ── Local HTTP origin ────────────────────────────────────────────────────────

async fn pdf_without_extension() -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "application/pdf")],
        b"%PDF-1.4\n%%EOF\n".to_vec(),
    )
}

/// Local origin on 127.0.0.1:
///
/// - `/files/report` serves a PDF without an extension in its path
/// - `/go` redirects to the same report via `localhost`
/// - `/hop` redirects to `/files/report` with a relative `Location`
/// - `/loop` redirects to itself
/// - `/stall` answers only after [`STALL`]
///
/// Everything else is 404.
pub async fn spawn_origin() -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let via_localhost = format!("http://localhost:{}/files/report", addr.port());
    let app = Router::new()
        .route("/files/report", get(pdf_without_extension))
        .route("/go", get(move || redirect(via_localhost.clone())))
        .route("/hop", get(|| redirect("/files/report".to_string())))
        .route("/loop", get(|| redirect("/loop".to_string())))
        .route(
            "/stall",
            get(|| async {
                tokio::time::sleep(STALL).await;
                pdf_without_extension().await
            }),
        )
        .fallback(|| async { StatusCode::NOT_FOUND });
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

/// How long `/stall` holds the request.
pub const STALL: Duration = Duration::from_secs(3);

async fn redirect(location: String) -> impl IntoResponse {
    let mut headers = HeaderMap::new();
    headers.insert(header::LOCATION, location.parse().unwrap());
    (StatusCode::FOUND, headers)
}

/// Every snapshot a subscriber receives until the job ends, plus the final
/// state. The store drops updates for a full subscriber, so a quiet channel
/// falls back to reading the store.
pub async fn collect_updates(store: &Arc<JobStore>, id: &JobId) -> (Vec<Job>, Job) {
    let mut sub = store.subscribe(id);
    let mut seen = Vec::new();
    loop {
        match tokio::time::timeout(Duration::from_millis(200), sub.recv()).await {
            Ok(Some(job)) => {
                let done = job.status.is_terminal();
                seen.push(job);
                if done {
                    break;
                }
            }
            Ok(None) => break,
            Err(_) => {
                if store.get(id).is_some_and(|j| j.status.is_terminal()) {
                    break;
                }
            }
        }
    }
    let last = wait_terminal(store, id).await;
    (seen, last)
}
