//! Local artifacts and where they live.
//!
//! A job owns every file it produces. Ephemeral files go into a per-job
//! [`TempDir`] workspace under `upload_dir`, which disappears when the job
//! ends. Archived files go into `archive_dir/<prefix>/`. Each individual file
//! is additionally wrapped in an [`Artifact`], which deletes it on drop,
//! including during unwinding, unless ownership was handed to the archive
//! with [`Artifact::retain`].

use crate::config::DeliveryConfig;
use std::io;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tracing::{debug, warn};

/// Directory name used for archived files of requests without a prefix.
const UNSORTED_DIR: &str = "unsorted";

/// A file owned by the current pipeline stage.
#[derive(Debug)]
pub struct Artifact {
    path: PathBuf,
    retained: bool,
}

impl Artifact {
    /// Take ownership of an existing file; it is deleted when this is dropped.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            retained: false,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    /// Lower-cased extension without the dot, or an empty string.
    pub fn extension(&self) -> String {
        extension_of(&self.path)
    }

    /// Move the file, keeping ownership of the new location.
    pub async fn rename_to(&mut self, to: impl Into<PathBuf>) -> io::Result<()> {
        let to = to.into();
        tokio::fs::rename(&self.path, &to).await?;
        debug!("Renamed {} → {}", self.path.display(), to.display());
        self.path = to;
        Ok(())
    }

    /// Move the file to `to`, failing with `AlreadyExists` rather than
    /// replacing a file some other job owns.
    pub async fn rename_exclusive(&mut self, to: impl Into<PathBuf>) -> io::Result<()> {
        let to = to.into();
        claim_exact(&to).await?;
        self.replace_claimed(to).await
    }

    /// Move the file to `file_name` in its directory, or to the first free
    /// `stem (n).ext` when that name is taken.
    pub async fn rename_unique(&mut self, file_name: &str) -> io::Result<()> {
        let dir = self.path.parent().unwrap_or_else(|| Path::new(".")).to_path_buf();
        let to = claim_path(&dir, file_name).await?;
        self.replace_claimed(to).await
    }

    async fn replace_claimed(&mut self, to: PathBuf) -> io::Result<()> {
        if let Err(e) = self.rename_to(&to).await {
            let _ = tokio::fs::remove_file(&to).await;
            return Err(e);
        }
        Ok(())
    }

    /// Hand the file over to permanent storage; it survives the job.
    pub fn retain(mut self) -> PathBuf {
        self.retained = true;
        std::mem::take(&mut self.path)
    }
}

impl Drop for Artifact {
    fn drop(&mut self) {
        if self.retained {
            return;
        }
        match std::fs::remove_file(&self.path) {
            Ok(()) => debug!("Removed artifact {}", self.path.display()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to remove artifact {}: {}", self.path.display(), e),
        }
    }
}

/// Lower-cased extension of a path, without the dot.
pub fn extension_of(path: &Path) -> String {
    path.extension()
        .map(|e| e.to_string_lossy().to_lowercase())
        .unwrap_or_default()
}

/// Storage roots for ephemeral and archived files.
#[derive(Debug, Clone)]
pub struct Storage {
    upload_dir: PathBuf,
    archive_dir: PathBuf,
}

impl Storage {
    pub fn new(upload_dir: impl Into<PathBuf>, archive_dir: impl Into<PathBuf>) -> Self {
        Self {
            upload_dir: upload_dir.into(),
            archive_dir: archive_dir.into(),
        }
    }

    pub fn from_config(config: &DeliveryConfig) -> Self {
        Self::new(&config.upload_dir, &config.archive_dir)
    }

    /// Permanent directory for one prefix. The prefix must already be sanitised.
    pub fn archive_dir_for(&self, prefix: &str) -> PathBuf {
        if prefix.is_empty() {
            self.archive_dir.join(UNSORTED_DIR)
        } else {
            self.archive_dir.join(prefix)
        }
    }

    /// A fresh per-job directory, removed when the returned handle drops.
    pub fn workspace(&self) -> io::Result<TempDir> {
        std::fs::create_dir_all(&self.upload_dir)?;
        tempfile::Builder::new()
            .prefix("job-")
            .tempdir_in(&self.upload_dir)
    }

    /// Directory a job writes into: the archive for archived requests,
    /// the job workspace otherwise.
    pub async fn destination(
        &self,
        archive: bool,
        prefix: &str,
        workspace: &Path,
    ) -> io::Result<PathBuf> {
        if archive {
            let dir = self.archive_dir_for(prefix);
            tokio::fs::create_dir_all(&dir).await?;
            Ok(dir)
        } else {
            Ok(workspace.to_path_buf())
        }
    }
}

/// `dir/file_name`, then `dir/stem (1).ext`, `dir/stem (2).ext`, ...
fn candidates(dir: &Path, file_name: &str) -> impl Iterator<Item = PathBuf> {
    let as_path = Path::new(file_name);
    let stem = as_path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| file_name.to_string());
    let ext = extension_of(as_path);
    let first = dir.join(file_name);
    let dir = dir.to_path_buf();
    std::iter::once(first).chain((1u32..).map(move |n| {
        if ext.is_empty() {
            dir.join(format!("{stem} ({n})"))
        } else {
            dir.join(format!("{stem} ({n}).{ext}"))
        }
    }))
}

/// Create `path` empty, failing with `AlreadyExists` if anything is there.
pub async fn claim_exact(path: &Path) -> io::Result<tokio::fs::File> {
    tokio::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .await
}

/// Reserve a fresh file in `dir` named `file_name`, or `stem (n).ext` for the
/// first free `n`, and open it for writing.
///
/// The name is taken by creating the file, so two jobs sharing a directory
/// never end up with the same path.
pub async fn claim_file(dir: &Path, file_name: &str) -> io::Result<(PathBuf, tokio::fs::File)> {
    for candidate in candidates(dir, file_name) {
        match claim_exact(&candidate).await {
            Ok(file) => return Ok((candidate, file)),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
            Err(e) => return Err(e),
        }
    }
    Err(io::Error::new(
        io::ErrorKind::AlreadyExists,
        format!("no free name for {file_name} in {}", dir.display()),
    ))
}

/// Like [`claim_file`], for callers that write the file through a path.
pub async fn claim_path(dir: &Path, file_name: &str) -> io::Result<PathBuf> {
    claim_file(dir, file_name).await.map(|(path, _)| path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dropped_artifact_is_deleted() {
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("a.pdf");
        std::fs::write(&p, b"x").unwrap();
        drop(Artifact::new(&p));
        assert!(!p.exists());
    }

    #[test]
    fn retained_artifact_survives() {
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("keep.pdf");
        std::fs::write(&p, b"x").unwrap();
        let kept = Artifact::new(&p).retain();
        assert_eq!(kept, p);
        assert!(p.exists());
    }

    #[test]
    fn missing_file_drop_is_quiet() {
        drop(Artifact::new("/nonexistent/paperdrop/x.pdf"));
    }

    #[tokio::test]
    async fn rename_moves_ownership() {
        let dir = tempfile::tempdir().unwrap();
        let from = dir.path().join("a_compressed.pdf");
        let to = dir.path().join("a.pdf");
        std::fs::write(&from, b"x").unwrap();
        let mut art = Artifact::new(&from);
        art.rename_to(&to).await.unwrap();
        assert_eq!(art.path(), to.as_path());
        assert!(to.exists() && !from.exists());
        drop(art);
        assert!(!to.exists());
    }

    #[tokio::test]
    async fn claim_appends_counter() {
        let dir = tempfile::tempdir().unwrap();
        let first = claim_path(dir.path(), "a.pdf").await.unwrap();
        assert_eq!(first, dir.path().join("a.pdf"));
        let second = claim_path(dir.path(), "a.pdf").await.unwrap();
        assert_eq!(second, dir.path().join("a (1).pdf"));
        assert_eq!(
            claim_path(dir.path(), "README").await.unwrap(),
            dir.path().join("README")
        );
        assert_eq!(
            claim_path(dir.path(), "README").await.unwrap(),
            dir.path().join("README (1)")
        );
    }

    #[tokio::test]
    async fn concurrent_claims_never_share_a_path() {
        let dir = tempfile::tempdir().unwrap();
        let claims = (0..16).map(|_| claim_path(dir.path(), "report.pdf"));
        let mut paths: Vec<PathBuf> = futures::future::join_all(claims)
            .await
            .into_iter()
            .map(Result::unwrap)
            .collect();
        paths.sort();
        paths.dedup();
        assert_eq!(paths.len(), 16);
    }

    #[tokio::test]
    async fn claimed_file_is_not_truncated_by_a_second_claim() {
        let dir = tempfile::tempdir().unwrap();
        let (path, _) = claim_file(dir.path(), "a.pdf").await.unwrap();
        std::fs::write(&path, b"first job").unwrap();
        let (other, _) = claim_file(dir.path(), "a.pdf").await.unwrap();
        assert_ne!(path, other);
        assert_eq!(std::fs::read(&path).unwrap(), b"first job");
    }

    #[tokio::test]
    async fn exclusive_rename_refuses_to_replace() {
        let dir = tempfile::tempdir().unwrap();
        let taken = dir.path().join("Reports May 7.pdf");
        std::fs::write(&taken, b"other job").unwrap();
        let from = dir.path().join("a.pdf");
        std::fs::write(&from, b"mine").unwrap();

        let mut art = Artifact::new(&from);
        let err = art.rename_exclusive(&taken).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::AlreadyExists);
        assert_eq!(art.path(), from.as_path());
        assert_eq!(std::fs::read(&taken).unwrap(), b"other job");

        art.rename_unique("Reports May 7.pdf").await.unwrap();
        assert_eq!(art.path(), dir.path().join("Reports May 7 (1).pdf").as_path());
        assert_eq!(std::fs::read(art.path()).unwrap(), b"mine");
    }

    #[test]
    fn archive_dir_per_prefix() {
        let s = Storage::new("/tmp/u", "/srv/archive");
        assert_eq!(s.archive_dir_for("Reports"), PathBuf::from("/srv/archive/Reports"));
        assert_eq!(s.archive_dir_for(""), PathBuf::from("/srv/archive/unsorted"));
    }

    #[test]
    fn workspace_is_removed_on_drop() {
        let root = tempfile::tempdir().unwrap();
        let s = Storage::new(root.path().join("uploads"), root.path().join("archive"));
        let ws = s.workspace().unwrap();
        let p = ws.path().to_path_buf();
        std::fs::write(p.join("f.pdf"), b"x").unwrap();
        drop(ws);
        assert!(!p.exists());
    }
}
