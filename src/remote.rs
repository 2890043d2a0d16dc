//! Upload adapter: the boundary to the tablet-sync tool.
//!
//! The pipeline only needs three remote operations (put a file into a
//! folder, list a folder, delete an entry), expressed by [`RemoteStore`].
//! [`CliRemoteStore`] drives an `rmapi`-style CLI; tests substitute an
//! in-memory fake.

use crate::request::{ConflictResolution, CoverPage};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use thiserror::Error;
use tracing::debug;

/// Generic message used when the tool output carries no error marker.
pub const GENERIC_UPLOAD_FAILURE: &str = "upload failed";

/// Marker the sync tool prefixes its own error messages with.
const ERROR_MARKER: &str = "Error:";

/// A remote command failed. `output` is everything the tool printed.
#[derive(Debug, Clone, Error)]
#[error("remote command failed: {output}")]
pub struct RemoteError {
    pub output: String,
}

impl RemoteError {
    pub fn new(output: impl Into<String>) -> Self {
        Self {
            output: output.into(),
        }
    }

    /// Client-safe summary of the failure; see [`surface_tool_error`].
    pub fn surfaced(&self) -> String {
        surface_tool_error(&self.output)
    }
}

/// Flags for one `put`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PutFlags {
    pub conflict: ConflictResolution,
    pub cover_page: CoverPage,
}

impl PutFlags {
    /// Flags adjusted for the file being uploaded: content-only replacement
    /// exists for PDFs only and falls back to `abort` for anything else.
    pub fn for_file(conflict: ConflictResolution, cover_page: CoverPage, local: &Path) -> Self {
        let is_pdf = crate::artifact::extension_of(local) == "pdf";
        let conflict = match conflict {
            ConflictResolution::ContentOnly if !is_pdf => ConflictResolution::Abort,
            other => other,
        };
        Self {
            conflict,
            cover_page,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    Directory,
    File,
}

/// One line of a folder listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteEntry {
    pub kind: EntryKind,
    pub name: String,
}

impl RemoteEntry {
    pub fn is_dir(&self) -> bool {
        self.kind == EntryKind::Directory
    }
}

/// Put, list and delete on the remote device.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Upload `local` into `remote_dir`; returns the tool output.
    async fn put(&self, local: &Path, remote_dir: &str, flags: &PutFlags) -> Result<String, RemoteError>;

    /// Entries directly inside `remote_dir`.
    async fn list(&self, remote_dir: &str) -> Result<Vec<RemoteEntry>, RemoteError>;

    /// Remove one entry by full remote path.
    async fn delete(&self, remote_path: &str) -> Result<(), RemoteError>;
}

/// Parse `[d]`/`[f]`-tagged listing lines; anything else is ignored.
pub fn parse_listing(output: &str) -> Vec<RemoteEntry> {
    output
        .lines()
        .filter_map(|line| {
            let line = line.trim_end();
            let (kind, rest) = if let Some(rest) = line.strip_prefix("[d]") {
                (EntryKind::Directory, rest)
            } else if let Some(rest) = line.strip_prefix("[f]") {
                (EntryKind::File, rest)
            } else {
                return None;
            };
            let name = rest.trim();
            (!name.is_empty()).then(|| RemoteEntry {
                kind,
                name: name.to_string(),
            })
        })
        .collect()
}

/// The tool's own error text (from `Error:` onward), or a generic message.
pub fn surface_tool_error(output: &str) -> String {
    match output.find(ERROR_MARKER) {
        Some(idx) => output[idx..].trim().to_string(),
        None => GENERIC_UPLOAD_FAILURE.to_string(),
    }
}

/// `dir/name` on the remote, always absolute, without duplicate slashes.
pub fn join_remote(dir: &str, name: &str) -> String {
    let dir = dir.trim_end_matches('/');
    let name = name.trim_start_matches('/');
    if dir.is_empty() {
        format!("/{name}")
    } else if dir.starts_with('/') {
        format!("{dir}/{name}")
    } else {
        format!("/{dir}/{name}")
    }
}

/// Remote store backed by an `rmapi`-compatible command-line tool.
#[derive(Debug, Clone)]
pub struct CliRemoteStore {
    program: String,
    /// Per-identity tool configuration, passed as `RMAPI_CONFIG`.
    config_path: Option<PathBuf>,
}

impl CliRemoteStore {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            config_path: None,
        }
    }

    pub fn with_config_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config_path = Some(path.into());
        self
    }

    fn put_args(local: &Path, remote_dir: &str, flags: &PutFlags) -> Vec<String> {
        let mut args = vec!["put".to_string()];
        match flags.conflict {
            ConflictResolution::Abort => {}
            ConflictResolution::Overwrite => args.push("--force".to_string()),
            ConflictResolution::ContentOnly => args.push("--content-only".to_string()),
        }
        if flags.cover_page == CoverPage::First {
            args.push("--coverpage=1".to_string());
        }
        args.push(local.display().to_string());
        args.push(remote_dir.to_string());
        args
    }

    async fn run(&self, args: &[String]) -> Result<String, RemoteError> {
        debug!("{} {}", self.program, args.join(" "));
        let mut cmd = tokio::process::Command::new(&self.program);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(path) = &self.config_path {
            cmd.env("RMAPI_CONFIG", path);
        }

        let output = cmd
            .output()
            .await
            .map_err(|e| RemoteError::new(format!("failed to run '{}': {e}", self.program)))?;

        let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
        text.push_str(&String::from_utf8_lossy(&output.stderr));
        if output.status.success() {
            Ok(text)
        } else {
            Err(RemoteError::new(text))
        }
    }
}

#[async_trait]
impl RemoteStore for CliRemoteStore {
    async fn put(&self, local: &Path, remote_dir: &str, flags: &PutFlags) -> Result<String, RemoteError> {
        self.run(&Self::put_args(local, remote_dir, flags)).await
    }

    async fn list(&self, remote_dir: &str) -> Result<Vec<RemoteEntry>, RemoteError> {
        let output = self.run(&["ls".to_string(), remote_dir.to_string()]).await?;
        Ok(parse_listing(&output))
    }

    async fn delete(&self, remote_path: &str) -> Result<(), RemoteError> {
        self.run(&["rm".to_string(), remote_path.to_string()]).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn listing_lines_are_tagged() {
        let out = "[d]\tBooks\n[f]\tReport May 7\nnoise line\n[f]\t\n[d] Archive 2024\n";
        let entries = parse_listing(out);
        assert_eq!(
            entries,
            vec![
                RemoteEntry {
                    kind: EntryKind::Directory,
                    name: "Books".into()
                },
                RemoteEntry {
                    kind: EntryKind::File,
                    name: "Report May 7".into()
                },
                RemoteEntry {
                    kind: EntryKind::Directory,
                    name: "Archive 2024".into()
                },
            ]
        );
    }

    #[test]
    fn surfaces_marked_error_text() {
        assert_eq!(
            surface_tool_error("uploading a.pdf\nError: entry already exists (use --force)\n"),
            "Error: entry already exists (use --force)"
        );
        assert_eq!(surface_tool_error("segfault"), GENERIC_UPLOAD_FAILURE);
        assert_eq!(RemoteError::new("").surfaced(), GENERIC_UPLOAD_FAILURE);
    }

    #[test]
    fn content_only_falls_back_for_non_pdf() {
        let f = PutFlags::for_file(ConflictResolution::ContentOnly, CoverPage::First, Path::new("a.epub"));
        assert_eq!(f.conflict, ConflictResolution::Abort);
        assert_eq!(f.cover_page, CoverPage::First);
        let f = PutFlags::for_file(ConflictResolution::ContentOnly, CoverPage::Current, Path::new("a.PDF"));
        assert_eq!(f.conflict, ConflictResolution::ContentOnly);
    }

    #[test]
    fn put_arguments() {
        let flags = PutFlags {
            conflict: ConflictResolution::Overwrite,
            cover_page: CoverPage::First,
        };
        assert_eq!(
            CliRemoteStore::put_args(Path::new("/tmp/a.pdf"), "/Reports", &flags),
            vec!["put", "--force", "--coverpage=1", "/tmp/a.pdf", "/Reports"]
        );
        assert_eq!(
            CliRemoteStore::put_args(Path::new("a.pdf"), "/", &PutFlags::default()),
            vec!["put", "a.pdf", "/"]
        );
    }

    #[test]
    fn remote_paths_join() {
        assert_eq!(join_remote("/", "a.pdf"), "/a.pdf");
        assert_eq!(join_remote("", "a.pdf"), "/a.pdf");
        assert_eq!(join_remote("/Reports/", "a.pdf"), "/Reports/a.pdf");
        assert_eq!(join_remote("Reports", "/a.pdf"), "/Reports/a.pdf");
    }

    #[tokio::test]
    async fn missing_binary_reports_output() {
        let store = CliRemoteStore::new("/nonexistent/paperdrop-rmapi");
        let err = store.list("/").await.unwrap_err();
        assert!(err.output.contains("failed to run"));
        assert_eq!(err.surfaced(), GENERIC_UPLOAD_FAILURE);
    }
}
