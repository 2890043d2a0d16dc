//! Per-identity cache of the remote folder tree.
//!
//! Listing the whole device is slow, so each identity keeps its last
//! listing and a background scheduler refreshes it once per interval. To
//! avoid every identity refreshing at the top of the interval, each one
//! gets a fixed percentage offset derived from a stable hash of its name;
//! its refresh falls due at
//!
//! ```text
//! floor(now / interval) · interval + interval · pct / 100
//! ```
//!
//! Background refreshes additionally queue behind a global rate limiter.
//! Refreshes a user asked for skip the limiter. Only one listing per
//! identity runs at a time; concurrent callers wait for it and share its
//! result.

use crate::config::DeliveryConfig;
use crate::remote::{join_remote, RemoteError, RemoteStore};
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Identity used when there is only one tenant.
pub const DEFAULT_IDENTITY: &str = "default";

/// How often a caller checks whether an in-flight refresh has finished.
const IN_FLIGHT_POLL: Duration = Duration::from_millis(100);

#[derive(Debug, Error)]
pub enum FolderError {
    #[error("Unknown identity '{0}'")]
    UnknownIdentity(String),

    #[error(transparent)]
    Remote(#[from] RemoteError),
}

/// Stable `0..100` offset for an identity (FNV-1a).
pub fn stable_percentage(identity: &str) -> u8 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for b in identity.bytes() {
        hash ^= u64::from(b);
        hash = hash.wrapping_mul(0x0100_0000_01b3);
    }
    (hash % 100) as u8
}

/// Due instant (unix seconds) in the interval containing `now`.
pub fn due_at(now: u64, interval: u64, pct: u8) -> u64 {
    let interval = interval.max(1);
    (now / interval) * interval + interval * u64::from(pct) / 100
}

/// The most recent due instant not after `now`.
fn last_due(now: u64, interval: u64, pct: u8) -> u64 {
    let due = due_at(now, interval, pct);
    if due > now {
        due.saturating_sub(interval.max(1))
    } else {
        due
    }
}

fn unix_now() -> u64 {
    chrono::Utc::now().timestamp().max(0) as u64
}

/// Enforces a minimum gap between background refreshes.
struct RateLimiter {
    gap: Duration,
    next_slot: Mutex<Option<Instant>>,
}

impl RateLimiter {
    fn new(gap: Duration) -> Self {
        Self {
            gap,
            next_slot: Mutex::new(None),
        }
    }

    async fn acquire(&self) {
        let wait = {
            let mut next = self.next_slot.lock().unwrap_or_else(|p| p.into_inner());
            let now = Instant::now();
            let slot = next.map_or(now, |n| n.max(now));
            *next = Some(slot + self.gap);
            slot - now
        };
        if !wait.is_zero() {
            debug!("Background refresh waiting {:?}", wait);
            tokio::time::sleep(wait).await;
        }
    }
}

struct Entry {
    remote: Arc<dyn RemoteStore>,
    pct: u8,
    folders: Vec<String>,
    last_refresh: Option<u64>,
    in_progress: bool,
    /// Bumped each time a listing finishes, successfully or not.
    generation: u64,
    last_error: Option<RemoteError>,
}

enum Claim {
    Leader(Arc<dyn RemoteStore>),
    Waiter(u64),
}

/// Folder listings for every registered identity.
pub struct FolderCache {
    entries: Mutex<HashMap<String, Entry>>,
    interval_secs: u64,
    tick: Duration,
    limiter: RateLimiter,
}

impl FolderCache {
    pub fn new(config: &DeliveryConfig) -> Arc<Self> {
        Arc::new(Self {
            entries: Mutex::new(HashMap::new()),
            interval_secs: config.folder_refresh_interval_secs.max(1),
            tick: config.scheduler_tick(),
            limiter: RateLimiter::new(config.background_refresh_gap()),
        })
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Entry>> {
        self.entries.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Add an identity and the store its folders are listed from.
    /// Re-registering replaces the store and keeps the cached listing.
    pub fn register(&self, identity: &str, remote: Arc<dyn RemoteStore>) {
        let mut entries = self.lock();
        match entries.get_mut(identity) {
            Some(entry) => entry.remote = remote,
            None => {
                let pct = stable_percentage(identity);
                debug!(identity, pct, "registered folder cache identity");
                entries.insert(
                    identity.to_string(),
                    Entry {
                        remote,
                        pct,
                        folders: Vec::new(),
                        last_refresh: None,
                        in_progress: false,
                        generation: 0,
                        last_error: None,
                    },
                );
            }
        }
    }

    /// Folder list for `identity`.
    ///
    /// `refresh` forces a new listing (bypassing the background rate
    /// limiter); otherwise the cached listing is returned, listing once if
    /// there is none yet.
    pub async fn get(&self, identity: &str, refresh: bool) -> Result<Vec<String>, FolderError> {
        let cached = {
            let entries = self.lock();
            let entry = entries
                .get(identity)
                .ok_or_else(|| FolderError::UnknownIdentity(identity.to_string()))?;
            entry.last_refresh.map(|_| entry.folders.clone())
        };
        match cached {
            Some(folders) if !refresh => Ok(folders),
            _ => self.refresh(identity, false).await,
        }
    }

    /// List the remote tree for `identity` and cache it.
    ///
    /// If a refresh is already running, waits for it and returns its
    /// result, error included.
    pub async fn refresh(&self, identity: &str, background: bool) -> Result<Vec<String>, FolderError> {
        loop {
            match self.claim(identity)? {
                Claim::Leader(remote) => return self.lead(identity, remote, background).await,
                Claim::Waiter(seen) => {
                    if let Some(outcome) = self.wait_in_flight(identity, seen).await {
                        return outcome;
                    }
                    // The running refresh was dropped before it finished.
                }
            }
        }
    }

    fn claim(&self, identity: &str) -> Result<Claim, FolderError> {
        let mut entries = self.lock();
        let entry = entries
            .get_mut(identity)
            .ok_or_else(|| FolderError::UnknownIdentity(identity.to_string()))?;
        if entry.in_progress {
            return Ok(Claim::Waiter(entry.generation));
        }
        entry.in_progress = true;
        Ok(Claim::Leader(Arc::clone(&entry.remote)))
    }

    async fn lead(
        &self,
        identity: &str,
        remote: Arc<dyn RemoteStore>,
        background: bool,
    ) -> Result<Vec<String>, FolderError> {
        let _flag = InProgress {
            cache: self,
            identity,
        };

        if background {
            self.limiter.acquire().await;
        }

        let listed = list_folders(remote.as_ref()).await;
        {
            let mut entries = self.lock();
            if let Some(entry) = entries.get_mut(identity) {
                entry.generation += 1;
                match &listed {
                    Ok(folders) => {
                        entry.folders = folders.clone();
                        entry.last_refresh = Some(unix_now());
                        entry.last_error = None;
                    }
                    Err(e) => entry.last_error = Some(e.clone()),
                }
            }
        }

        let folders = listed?;
        info!(identity, count = folders.len(), background, "Folder listing refreshed");
        Ok(folders)
    }

    /// Outcome of the refresh that was running at generation `seen`, or
    /// `None` if it went away without recording one.
    async fn wait_in_flight(&self, identity: &str, seen: u64) -> Option<Result<Vec<String>, FolderError>> {
        loop {
            tokio::time::sleep(IN_FLIGHT_POLL).await;
            let entries = self.lock();
            let Some(entry) = entries.get(identity) else {
                return Some(Err(FolderError::UnknownIdentity(identity.to_string())));
            };
            if entry.generation != seen {
                return Some(match &entry.last_error {
                    Some(e) => Err(FolderError::Remote(e.clone())),
                    None => Ok(entry.folders.clone()),
                });
            }
            if !entry.in_progress {
                return None;
            }
        }
    }

    /// Identities whose due instant has passed since their last refresh.
    pub fn due_identities(&self, now: u64) -> Vec<String> {
        let mut due: Vec<String> = self
            .lock()
            .iter()
            .filter(|(_, e)| {
                let last_due = last_due(now, self.interval_secs, e.pct);
                !e.in_progress && e.last_refresh.is_none_or(|t| t < last_due)
            })
            .map(|(id, _)| id.clone())
            .collect();
        due.sort();
        due
    }

    /// One scheduler pass: refresh everything due at `now`.
    pub async fn refresh_due(&self, now: u64) -> Vec<String> {
        let due = self.due_identities(now);
        for identity in &due {
            if let Err(e) = self.refresh(identity, true).await {
                warn!(identity = %identity, "Background folder refresh failed: {}", e);
            }
        }
        due
    }

    /// Run [`FolderCache::refresh_due`] every scheduler tick until aborted.
    pub fn spawn_scheduler(self: &Arc<Self>) -> JoinHandle<()> {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(cache.tick);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                cache.refresh_due(unix_now()).await;
            }
        })
    }
}

/// Clears an identity's in-progress flag on every exit path.
struct InProgress<'a> {
    cache: &'a FolderCache,
    identity: &'a str,
}

impl Drop for InProgress<'_> {
    fn drop(&mut self) {
        if let Some(entry) = self.cache.lock().get_mut(self.identity) {
            entry.in_progress = false;
        }
    }
}

/// Every folder below `/` (and `/` itself), sorted.
pub async fn list_folders(remote: &dyn RemoteStore) -> Result<Vec<String>, RemoteError> {
    let mut found = BTreeSet::from(["/".to_string()]);
    let mut queue = VecDeque::from(["/".to_string()]);
    while let Some(dir) = queue.pop_front() {
        for entry in remote.list(&dir).await? {
            if entry.is_dir() {
                let path = join_remote(&dir, &entry.name);
                if found.insert(path.clone()) {
                    queue.push_back(path);
                }
            }
        }
    }
    Ok(found.into_iter().collect())
}
