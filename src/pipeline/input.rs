//! Source acquisition: turn a request body into a local file.
//!
//! A local path is taken over as-is. A URL is validated against the
//! [`UrlPolicy`] first, then fetched with a bounded timeout and a browser
//! user agent drawn from the [`UserAgentPool`]. The body streams to disk chunk
//! by chunk; the file is wrapped in an [`Artifact`] before the first byte is
//! written so a failed transfer never leaves a partial file behind.

use crate::artifact::{claim_file, extension_of, Artifact};
use crate::error::DeliveryError;
use crate::progress::TransferProgress;
use async_trait::async_trait;
use rand::seq::IndexedRandom;
use reqwest::header::{CONTENT_TYPE, LOCATION, USER_AGENT};
use reqwest::Url;
use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

/// Used whenever the agent list cannot be fetched.
pub const FALLBACK_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
(KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36";

/// Name for downloads whose URL has no usable last segment.
const DEFAULT_STEM: &str = "document";

/// Redirect hops followed before a download is abandoned.
pub const MAX_REDIRECTS: usize = 10;

// ── SSRF policy ──────────────────────────────────────────────────────────

/// Decides whether a URL may be fetched on behalf of a request.
#[async_trait]
pub trait UrlPolicy: Send + Sync {
    /// `Err(reason)` refuses the fetch.
    async fn check(&self, url: &Url) -> Result<(), String>;
}

/// Only http(s) URLs whose host resolves exclusively to public addresses.
pub struct PublicAddressPolicy;

#[async_trait]
impl UrlPolicy for PublicAddressPolicy {
    async fn check(&self, url: &Url) -> Result<(), String> {
        if !matches!(url.scheme(), "http" | "https") {
            return Err(format!("scheme '{}' not allowed", url.scheme()));
        }
        let host = url.host_str().ok_or("URL has no host")?;
        let port = url.port_or_known_default().unwrap_or(80);

        let host = host.trim_start_matches('[').trim_end_matches(']');
        let addrs: Vec<IpAddr> = match host.parse::<IpAddr>() {
            Ok(ip) => vec![ip],
            Err(_) => tokio::net::lookup_host((host, port))
                .await
                .map_err(|e| format!("cannot resolve '{host}': {e}"))?
                .map(|sa| sa.ip())
                .collect(),
        };
        if addrs.is_empty() {
            return Err(format!("'{host}' resolved to no addresses"));
        }
        match addrs.iter().find(|ip| !is_public(ip)) {
            Some(ip) => Err(format!("'{host}' resolves to non-public address {ip}")),
            None => Ok(()),
        }
    }
}

/// Accepts everything. For tests and trusted single-user setups.
pub struct AllowAllPolicy;

#[async_trait]
impl UrlPolicy for AllowAllPolicy {
    async fn check(&self, _url: &Url) -> Result<(), String> {
        Ok(())
    }
}

fn is_public(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            let o = v4.octets();
            !(v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local()
                || v4.is_unspecified()
                || v4.is_broadcast()
                || v4.is_multicast()
                || v4.is_documentation()
                || (o[0] == 100 && (o[1] & 0xc0) == 64)
                || o[0] == 0)
        }
        IpAddr::V6(v6) => {
            if let Some(mapped) = v6.to_ipv4_mapped() {
                return is_public(&IpAddr::V4(mapped));
            }
            let seg0 = v6.segments()[0];
            !(v6.is_loopback()
                || v6.is_unspecified()
                || v6.is_multicast()
                || (seg0 & 0xfe00) == 0xfc00
                || (seg0 & 0xffc0) == 0xfe80)
        }
    }
}

// ── User agents ──────────────────────────────────────────────────────────

/// Realistic browser user agents, loaded once at startup.
#[derive(Debug, Clone)]
pub struct UserAgentPool {
    agents: Vec<String>,
}

impl Default for UserAgentPool {
    fn default() -> Self {
        Self::fallback()
    }
}

impl UserAgentPool {
    /// The single hardcoded agent.
    pub fn fallback() -> Self {
        Self {
            agents: vec![FALLBACK_USER_AGENT.to_string()],
        }
    }

    /// A pool from an explicit list; empty lists fall back.
    pub fn from_list(agents: Vec<String>) -> Self {
        let agents: Vec<String> = agents
            .into_iter()
            .map(|a| a.trim().to_string())
            .filter(|a| !a.is_empty())
            .collect();
        if agents.is_empty() {
            Self::fallback()
        } else {
            Self { agents }
        }
    }

    /// Fetch a JSON array of agent strings. Never fails: any problem is
    /// logged and the fallback pool returned.
    pub async fn load(url: Option<&str>, timeout: Duration) -> Self {
        let Some(url) = url else {
            return Self::fallback();
        };
        match fetch_agent_list(url, timeout).await {
            Ok(list) => {
                let pool = Self::from_list(list);
                info!("Loaded {} user agents from {}", pool.len(), url);
                pool
            }
            Err(e) => {
                warn!("User agent list unavailable ({}), using fallback", e);
                Self::fallback()
            }
        }
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }

    /// A random agent from the pool.
    pub fn pick(&self) -> &str {
        self.agents
            .choose(&mut rand::rng())
            .map(String::as_str)
            .unwrap_or(FALLBACK_USER_AGENT)
    }
}

async fn fetch_agent_list(url: &str, timeout: Duration) -> Result<Vec<String>, String> {
    let bytes = reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| e.to_string())?
        .get(url)
        .send()
        .await
        .and_then(reqwest::Response::error_for_status)
        .map_err(|e| e.to_string())?
        .bytes()
        .await
        .map_err(|e| e.to_string())?;
    serde_json::from_slice(&bytes).map_err(|e| e.to_string())
}

// ── Fetching ─────────────────────────────────────────────────────────────

/// Downloads URL sources to local files.
pub struct Fetcher {
    client: reqwest::Client,
    timeout: Duration,
    policy: Arc<dyn UrlPolicy>,
    agents: Arc<UserAgentPool>,
}

impl Fetcher {
    pub fn new(
        timeout: Duration,
        policy: Arc<dyn UrlPolicy>,
        agents: Arc<UserAgentPool>,
    ) -> Result<Self, DeliveryError> {
        // Redirects are followed by hand so every hop passes the policy.
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| DeliveryError::Internal(format!("HTTP client: {e}")))?;
        Ok(Self {
            client,
            timeout,
            policy,
            agents,
        })
    }

    /// Download `url` into `dest_dir`.
    ///
    /// Every redirect target is checked against the [`UrlPolicy`] before it
    /// is requested. The returned artifact is named after the final URL.
    pub async fn download(
        &self,
        url: &str,
        dest_dir: &Path,
        progress: &dyn TransferProgress,
    ) -> Result<Artifact, DeliveryError> {
        let failed = |reason: String| DeliveryError::DownloadFailed {
            url: url.to_string(),
            reason,
        };

        let mut current = Url::parse(url).map_err(|e| failed(e.to_string()))?;
        let agent = self.agents.pick();
        let mut hops = 0;
        let mut response = loop {
            self.policy
                .check(&current)
                .await
                .map_err(|reason| DeliveryError::UrlRejected {
                    url: current.to_string(),
                    reason,
                })?;

            info!("Downloading {}", current);
            let response = self
                .client
                .get(current.clone())
                .header(USER_AGENT, agent)
                .send()
                .await
                .map_err(|e| self.map_reqwest(url, e))?;

            if !response.status().is_redirection() {
                break response;
            }
            let next = response
                .headers()
                .get(LOCATION)
                .and_then(|v| v.to_str().ok())
                .ok_or_else(|| failed(format!("HTTP {} without Location", response.status())))?;
            let next = current
                .join(next)
                .map_err(|e| failed(format!("bad redirect target: {e}")))?;
            hops += 1;
            if hops > MAX_REDIRECTS {
                return Err(failed(format!("more than {MAX_REDIRECTS} redirects")));
            }
            debug!("{} redirected to {}", current, next);
            current = next;
        };

        if !response.status().is_success() {
            return Err(failed(format!("HTTP {}", response.status())));
        }

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let file_name = derive_filename(&current, content_type.as_deref());
        let total = response.content_length();

        let (path, mut file) = claim_file(dest_dir, &file_name)
            .await
            .map_err(|e| DeliveryError::Internal(format!("create {file_name}: {e}")))?;
        let artifact = Artifact::new(&path);

        let mut downloaded: u64 = 0;
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| self.map_reqwest(url, e))?
        {
            file.write_all(&chunk)
                .await
                .map_err(|e| DeliveryError::Internal(format!("write {}: {e}", path.display())))?;
            downloaded += chunk.len() as u64;
            progress.on_bytes(downloaded, total);
        }
        file.flush()
            .await
            .map_err(|e| DeliveryError::Internal(format!("flush {}: {e}", path.display())))?;
        progress.on_complete(downloaded);

        debug!("Downloaded {} bytes to {}", downloaded, path.display());
        Ok(artifact)
    }

    fn map_reqwest(&self, url: &str, e: reqwest::Error) -> DeliveryError {
        if e.is_timeout() {
            DeliveryError::DownloadTimeout {
                url: url.to_string(),
                secs: self.timeout.as_secs(),
            }
        } else {
            DeliveryError::DownloadFailed {
                url: url.to_string(),
                reason: e.to_string(),
            }
        }
    }
}

/// Take ownership of a file that is already on local disk.
///
/// The file is guarded before it is checked, so the caller's claim on it
/// ends here either way.
pub fn resolve_local(source: Artifact) -> Result<Artifact, DeliveryError> {
    if !source.path().is_file() {
        return Err(DeliveryError::Internal(format!(
            "source file missing: {}",
            source.path().display()
        )));
    }
    debug!("Resolved local source: {}", source.path().display());
    Ok(source)
}

/// File name for a download: the URL's last path segment, with an extension
/// taken from the content type when the segment has none.
pub fn derive_filename(url: &Url, content_type: Option<&str>) -> String {
    let segment = url
        .path_segments()
        .and_then(|mut s| s.next_back())
        .map(|s| urlencoding::decode_binary(s.as_bytes()).into_owned())
        .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
        .map(|s| s.replace(['/', '\\', '\0'], "_"))
        .map(|s| s.trim().trim_start_matches('.').to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| DEFAULT_STEM.to_string());

    if is_known_extension(&extension_of(Path::new(&segment))) {
        return segment;
    }
    match content_type.and_then(extension_for_content_type) {
        Some(ext) => format!("{segment}.{ext}"),
        None => segment,
    }
}

/// File extension for the document and image types the pipeline accepts.
pub fn extension_for_content_type(content_type: &str) -> Option<&'static str> {
    let mime = content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();
    match mime.as_str() {
        "application/pdf" => Some("pdf"),
        "application/epub+zip" => Some("epub"),
        "image/jpeg" | "image/jpg" => Some("jpg"),
        "image/png" => Some("png"),
        "image/gif" => Some("gif"),
        "image/webp" => Some("webp"),
        "image/bmp" => Some("bmp"),
        _ => None,
    }
}

/// Extensions the pipeline can deliver, directly or after conversion.
pub fn is_known_extension(ext: &str) -> bool {
    matches!(ext, "pdf" | "epub") || super::render::is_image_extension(ext)
}
