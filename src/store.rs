//! In-memory job registry with per-job change notification.
//!
//! Every mutation broadcasts the full job snapshot to the job's subscribers
//! with `try_send` on a bounded channel: a subscriber that is slow or gone
//! misses updates instead of stalling the pipeline that owns the job. The
//! push stream is therefore latest-wins; [`JobStore::get`] stays the
//! authoritative read.
//!
//! Jobs are never evicted. A long-running process accumulates one record per
//! request for its whole lifetime.

use crate::job::{Job, JobData, JobId, JobStatus, Operation};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use tracing::{debug, trace};

/// Per-subscriber channel capacity.
pub const SUBSCRIBER_BUFFER: usize = 10;

#[derive(Default)]
struct Inner {
    jobs: HashMap<JobId, Job>,
    subscribers: HashMap<JobId, Vec<(u64, mpsc::Sender<Job>)>>,
}

/// Shared job registry. Construct once and pass around as `Arc<JobStore>`.
#[derive(Default)]
pub struct JobStore {
    inner: Mutex<Inner>,
    next_subscriber: AtomicU64,
}

impl JobStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // A panic while holding the lock cannot leave a half-written job: every
        // critical section assigns whole fields.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register a new job as `pending` with progress 0.
    pub fn create(&self, id: &JobId) {
        let mut inner = self.lock();
        let job = Job::pending(id.clone());
        inner.jobs.insert(id.clone(), job.clone());
        broadcast(&mut inner, &job);
    }

    /// Set status, message and data in one step. Unknown ids are ignored.
    pub fn update(&self, id: &JobId, status: JobStatus, message: &str, data: Option<JobData>) {
        self.mutate(id, |job| {
            job.status = status;
            job.message = message.to_string();
            job.data = data;
        });
    }

    /// Enter a pipeline stage: `running`, the given operation, progress reset.
    pub fn update_stage(&self, id: &JobId, operation: Operation) {
        self.mutate(id, |job| {
            job.status = JobStatus::Running;
            job.operation = Some(operation);
            job.progress = 0;
        });
    }

    /// Set progress, clamped to `0..=100`.
    pub fn update_progress(&self, id: &JobId, percent: i64) {
        let clamped = percent.clamp(0, 100) as u8;
        self.mutate(id, |job| job.progress = clamped);
    }

    /// Snapshot of the job, if it exists.
    pub fn get(&self, id: &JobId) -> Option<Job> {
        self.lock().jobs.get(id).cloned()
    }

    /// Subscribe to changes of one job.
    ///
    /// When the job already exists its current snapshot is queued first, so a
    /// subscriber never starts without state.
    pub fn subscribe(self: &Arc<Self>, id: &JobId) -> Subscription {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        let sub_id = self.next_subscriber.fetch_add(1, Ordering::Relaxed);

        let mut inner = self.lock();
        if let Some(job) = inner.jobs.get(id) {
            let _ = tx.try_send(job.clone());
        }
        inner
            .subscribers
            .entry(id.clone())
            .or_default()
            .push((sub_id, tx));
        debug!(job = %id, subscriber = sub_id, "subscribed");

        Subscription {
            rx,
            store: Arc::clone(self),
            job_id: id.clone(),
            sub_id,
            active: true,
        }
    }

    fn unsubscribe(&self, id: &JobId, sub_id: u64) {
        let mut inner = self.lock();
        if let Some(list) = inner.subscribers.get_mut(id) {
            list.retain(|(s, _)| *s != sub_id);
            if list.is_empty() {
                inner.subscribers.remove(id);
            }
        }
        debug!(job = %id, subscriber = sub_id, "unsubscribed");
    }

    fn mutate(&self, id: &JobId, f: impl FnOnce(&mut Job)) {
        let mut inner = self.lock();
        let Some(job) = inner.jobs.get_mut(id) else {
            return;
        };
        f(job);
        let snapshot = job.clone();
        broadcast(&mut inner, &snapshot);
    }

    #[cfg(test)]
    fn subscriber_count(&self, id: &JobId) -> usize {
        self.lock().subscribers.get(id).map_or(0, Vec::len)
    }
}

fn broadcast(inner: &mut Inner, job: &Job) {
    let Some(list) = inner.subscribers.get_mut(&job.id) else {
        return;
    };
    list.retain(|(sub_id, tx)| match tx.try_send(job.clone()) {
        Ok(()) => true,
        Err(mpsc::error::TrySendError::Full(_)) => {
            trace!(job = %job.id, subscriber = sub_id, "subscriber full, update dropped");
            true
        }
        Err(mpsc::error::TrySendError::Closed(_)) => false,
    });
}

/// Receive side of a job subscription. Unsubscribes on drop.
pub struct Subscription {
    rx: mpsc::Receiver<Job>,
    store: Arc<JobStore>,
    job_id: JobId,
    sub_id: u64,
    active: bool,
}

impl Subscription {
    /// Next snapshot, or `None` once unsubscribed.
    pub async fn recv(&mut self) -> Option<Job> {
        self.rx.recv().await
    }

    /// Non-blocking variant of [`Subscription::recv`].
    pub fn try_recv(&mut self) -> Option<Job> {
        self.rx.try_recv().ok()
    }

    pub fn job_id(&self) -> &JobId {
        &self.job_id
    }

    pub fn unsubscribe(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if self.active {
            self.active = false;
            self.store.unsubscribe(&self.job_id, self.sub_id);
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.release();
    }
}
