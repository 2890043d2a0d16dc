//! Delivery policy: how an artifact reaches the device.
//!
//! Two request flags select one of four modes:
//!
//! | manage | archive | behaviour |
//! |--------|---------|-----------|
//! | no     | no      | upload as-is |
//! | no     | yes     | upload as-is, keep the archived local file |
//! | yes    | no      | date-rename, upload, year-stamp local copy, retention cleanup |
//! | yes    | yes     | same, and the year-stamped local copy is kept in the archive |
//!
//! Managed uploads are named `"<prefix> <Month> <Day>.<ext>"`. Retention
//! cleanup parses those names back into dates. Month and day alone do not
//! pin a year: a date that would lie in the future is taken to be from
//! last year, so entries older than a year alias onto the current calendar.

use crate::artifact::Artifact;
use crate::error::DeliveryError;
use crate::remote::{join_remote, PutFlags, RemoteStore};
use crate::request::DeliveryRequest;
use chrono::{Datelike, Duration, NaiveDate};
use once_cell::sync::Lazy;
use regex::Regex;
use std::path::PathBuf;
use tracing::{info, warn};

const MONTHS: [&str; 12] = [
    "january",
    "february",
    "march",
    "april",
    "may",
    "june",
    "july",
    "august",
    "september",
    "october",
    "november",
    "december",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryMode {
    Simple,
    Archive,
    Managed,
    ManagedArchive,
}

impl DeliveryMode {
    pub fn from_flags(manage: bool, archive: bool) -> Self {
        match (manage, archive) {
            (false, false) => DeliveryMode::Simple,
            (false, true) => DeliveryMode::Archive,
            (true, false) => DeliveryMode::Managed,
            (true, true) => DeliveryMode::ManagedArchive,
        }
    }

    pub fn is_managed(self) -> bool {
        matches!(self, DeliveryMode::Managed | DeliveryMode::ManagedArchive)
    }

    pub fn is_archive(self) -> bool {
        matches!(self, DeliveryMode::Archive | DeliveryMode::ManagedArchive)
    }
}

/// Result of a successful delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivered {
    /// Remote path of the uploaded document, without the leading slash.
    pub remote_path: String,
    /// Local copy kept in the archive, if any.
    pub archived: Option<PathBuf>,
}

fn dated_stem(prefix: &str, date: NaiveDate) -> String {
    let month = date.format("%B");
    if prefix.is_empty() {
        format!("{month} {}", date.day())
    } else {
        format!("{prefix} {month} {}", date.day())
    }
}

/// `"<prefix> <Month> <Day>.<ext>"`, the name a managed upload carries.
pub fn managed_name(prefix: &str, date: NaiveDate, ext: &str) -> String {
    format!("{}.{ext}", dated_stem(prefix, date))
}

/// `"<prefix> <Month> <Day> <Year>.<ext>"`, the local bookkeeping name.
pub fn year_stamped_name(prefix: &str, date: NaiveDate, ext: &str) -> String {
    format!("{} {}.{ext}", dated_stem(prefix, date), date.year())
}

fn parse_month(name: &str) -> Option<u32> {
    let lower = name.to_ascii_lowercase();
    MONTHS
        .iter()
        .position(|m| *m == lower || (lower.len() == 3 && m.starts_with(&lower)))
        .map(|i| i as u32 + 1)
}

static RE_DATED: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?:(?P<prefix>.+) )?(?P<month>[A-Za-z]+) (?P<day>\d{1,2})(?:\.[A-Za-z0-9]+)?$").unwrap()
});

/// Parse a managed entry name back into `(prefix, date)`.
///
/// The date is placed in `today`'s year, or the year before when that
/// would put it after `today`.
pub fn parse_dated_entry(name: &str, today: NaiveDate) -> Option<(String, NaiveDate)> {
    let c = RE_DATED.captures(name.trim())?;
    let month = parse_month(&c["month"])?;
    let day: u32 = c["day"].parse().ok()?;
    let prefix = c.name("prefix").map(|m| m.as_str().to_string()).unwrap_or_default();

    let date = match NaiveDate::from_ymd_opt(today.year(), month, day) {
        Some(d) if d > today => NaiveDate::from_ymd_opt(today.year() - 1, month, day)?,
        Some(d) => d,
        None => NaiveDate::from_ymd_opt(today.year() - 1, month, day)?,
    };
    Some((prefix, date))
}

/// Delete managed entries for `prefix` in `remote_dir` older than
/// `today - retention_days`. Returns the deleted remote paths.
///
/// A failed delete is logged and skipped; a failed listing is returned.
pub async fn retention_cleanup(
    remote: &dyn RemoteStore,
    remote_dir: &str,
    prefix: &str,
    retention_days: u32,
    today: NaiveDate,
) -> Result<Vec<String>, crate::remote::RemoteError> {
    let cutoff = today - Duration::days(i64::from(retention_days.max(1)));
    let entries = remote.list(remote_dir).await?;

    let mut deleted = Vec::new();
    for entry in entries.iter().filter(|e| !e.is_dir()) {
        let Some((entry_prefix, date)) = parse_dated_entry(&entry.name, today) else {
            continue;
        };
        if entry_prefix != prefix || date >= cutoff {
            continue;
        }
        let path = join_remote(remote_dir, &entry.name);
        match remote.delete(&path).await {
            Ok(()) => {
                info!("Retention: deleted {} (dated {})", path, date);
                deleted.push(path);
            }
            Err(e) => warn!("Retention: failed to delete {}: {}", path, e.surfaced()),
        }
    }
    Ok(deleted)
}

/// Deliver `artifact` according to the request's mode.
///
/// `prefix` is the sanitised prefix. The artifact is consumed: it is kept
/// on disk only in archive modes, and deleted on every other path.
pub async fn deliver(
    remote: &dyn RemoteStore,
    mut artifact: Artifact,
    request: &DeliveryRequest,
    prefix: &str,
    today: NaiveDate,
) -> Result<Delivered, DeliveryError> {
    let mode = DeliveryMode::from_flags(request.manage, request.archive);
    let ext = artifact.extension();
    info!("Delivering {} ({:?})", artifact.path().display(), mode);

    if mode.is_managed() {
        let target = artifact.path().with_file_name(managed_name(prefix, today, &ext));
        // Never replaces an existing file in the destination.
        if target.as_path() != artifact.path() {
            let from = artifact.path().to_path_buf();
            artifact
                .rename_exclusive(&target)
                .await
                .map_err(|source| DeliveryError::RenameFailed {
                    from,
                    to: target.clone(),
                    source,
                })?;
        }
    }

    let flags = PutFlags::for_file(request.conflict_resolution, request.cover_page, artifact.path());
    remote
        .put(artifact.path(), &request.remote_dir, &flags)
        .await
        .map_err(|e| DeliveryError::UploadFailed { detail: e.surfaced() })?;

    let remote_path = join_remote(&request.remote_dir, &artifact.file_name())
        .trim_start_matches('/')
        .to_string();
    info!("Uploaded → {}", remote_path);

    if mode.is_managed() {
        let stamped = year_stamped_name(prefix, today, &ext);
        if let Err(e) = artifact.rename_unique(&stamped).await {
            warn!("Failed to year-stamp {}: {}", artifact.path().display(), e);
        }

        match retention_cleanup(
            remote,
            &request.remote_dir,
            prefix,
            request.effective_retention_days(),
            today,
        )
        .await
        {
            Ok(deleted) if !deleted.is_empty() => {
                info!("Retention cleanup removed {} entries", deleted.len())
            }
            Ok(_) => {}
            Err(e) => warn!("Retention cleanup of {} failed: {}", request.remote_dir, e.surfaced()),
        }
    }

    let archived = mode.is_archive().then(|| artifact.retain());
    Ok(Delivered {
        remote_path,
        archived,
    })
}
