//! Job tracker for remote ingestion, tagging, and indexing jobs.
//!
//! The tracker owns every in-flight job started through it. Each job gets
//! one lightweight polling task on the tokio runtime; all mutation of the
//! job map goes through a single mutex that is never held across an await.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::future::join_all;
use serde_json::Value as JsonValue;
use tokio::runtime::Handle;
use tokio::sync::{broadcast, watch};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn, Instrument};
use uuid::Uuid;

use docket_core::defaults::{
    EVENT_BUS_CAPACITY, MAX_CONSECUTIVE_POLL_FAILURES, POLL_INTERVAL_MS, TRANSPORT_FAILURE_PREFIX,
};
use docket_core::logging::job_span;
use docket_core::{
    DocumentId, Error, JobExecutionService, JobKind, JobSignal, JobStatus, PollResult,
    RemoteJobId, Result,
};

/// Configuration for the job tracker.
#[derive(Debug, Clone)]
pub struct TrackerConfig {
    /// Interval between polls of one job, in milliseconds.
    pub poll_interval_ms: u64,
    /// Consecutive failed polls before the job is reported as failed.
    pub max_consecutive_poll_failures: u32,
    /// Allow several active jobs for the same document without per-call opt-in.
    pub allow_duplicate_jobs: bool,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: POLL_INTERVAL_MS,
            max_consecutive_poll_failures: MAX_CONSECUTIVE_POLL_FAILURES,
            allow_duplicate_jobs: false,
        }
    }
}

impl TrackerConfig {
    /// Create config from environment variables (with defaults).
    ///
    /// | Variable | Default | Description |
    /// |----------|---------|-------------|
    /// | `DOCKET_POLL_INTERVAL_MS` | `2000` | Interval between polls of one job |
    /// | `DOCKET_MAX_POLL_FAILURES` | `5` | Consecutive poll failures tolerated |
    /// | `DOCKET_ALLOW_DUPLICATE_JOBS` | `false` | Allow concurrent jobs per document |
    pub fn from_env() -> Self {
        let poll_interval_ms = std::env::var("DOCKET_POLL_INTERVAL_MS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(POLL_INTERVAL_MS)
            .max(1);

        let max_consecutive_poll_failures = std::env::var("DOCKET_MAX_POLL_FAILURES")
            .ok()
            .and_then(|v| v.parse::<u32>().ok())
            .unwrap_or(MAX_CONSECUTIVE_POLL_FAILURES)
            .max(1);

        let allow_duplicate_jobs = std::env::var("DOCKET_ALLOW_DUPLICATE_JOBS")
            .map(|v| v == "true" || v == "1")
            .unwrap_or(false);

        Self {
            poll_interval_ms,
            max_consecutive_poll_failures,
            allow_duplicate_jobs,
        }
    }

    /// Set the poll interval.
    pub fn with_poll_interval(mut self, ms: u64) -> Self {
        self.poll_interval_ms = ms;
        self
    }

    /// Set the consecutive poll failure bound.
    pub fn with_max_poll_failures(mut self, max: u32) -> Self {
        self.max_consecutive_poll_failures = max;
        self
    }

    /// Allow or reject concurrent jobs for one document.
    pub fn with_allow_duplicates(mut self, allow: bool) -> Self {
        self.allow_duplicate_jobs = allow;
        self
    }
}

/// Per-call options for [`JobTracker::start`].
#[derive(Debug, Clone, Default)]
pub struct StartOptions {
    /// Forwarded verbatim to the remote `begin_job` call.
    pub payload: Option<JsonValue>,
    /// Start even if the document already has an active job.
    pub allow_duplicate: bool,
}

impl StartOptions {
    pub fn with_payload(mut self, payload: JsonValue) -> Self {
        self.payload = Some(payload);
        self
    }

    pub fn allow_duplicate(mut self) -> Self {
        self.allow_duplicate = true;
        self
    }
}

/// Handle identifying one tracked job.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct JobHandle {
    /// Local identifier, unique per `start` call.
    pub id: Uuid,
    pub remote_id: RemoteJobId,
    pub document_id: DocumentId,
    pub kind: JobKind,
}

/// Change notification emitted by the tracker.
#[derive(Debug, Clone)]
pub enum TrackerEvent {
    /// The remote system accepted the job.
    Started { handle: JobHandle, signal: JobSignal },
    /// A poll observed a new transient status or progress value.
    Progress { handle: JobHandle, signal: JobSignal },
    /// The job reached a terminal status. Emitted exactly once per job.
    Finished { handle: JobHandle, signal: JobSignal },
}

impl TrackerEvent {
    pub fn handle(&self) -> &JobHandle {
        match self {
            TrackerEvent::Started { handle, .. }
            | TrackerEvent::Progress { handle, .. }
            | TrackerEvent::Finished { handle, .. } => handle,
        }
    }

    pub fn signal(&self) -> &JobSignal {
        match self {
            TrackerEvent::Started { signal, .. }
            | TrackerEvent::Progress { signal, .. }
            | TrackerEvent::Finished { signal, .. } => signal,
        }
    }
}

/// Counts of tracked jobs by status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrackerStats {
    pub pending: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
}

impl TrackerStats {
    pub fn active(&self) -> usize {
        self.pending + self.running
    }
}

/// Outcome of [`JobTracker::start_batch`].
#[derive(Debug, Default)]
pub struct BatchStartReport {
    /// Jobs accepted by the remote system and now being polled.
    pub started: Vec<JobHandle>,
    /// Targets whose start failed, with the reason.
    pub rejected: Vec<(DocumentId, Error)>,
}

impl BatchStartReport {
    pub fn is_complete(&self) -> bool {
        self.rejected.is_empty()
    }
}

type ChangeCallback = Arc<dyn Fn(&TrackerEvent) + Send + Sync>;

struct TrackedJob {
    /// `None` while the begin request is in flight.
    remote_id: Option<RemoteJobId>,
    signal: JobSignal,
    cancel: CancellationToken,
    watch_tx: watch::Sender<JobSignal>,
}

struct Inner {
    service: Arc<dyn JobExecutionService>,
    config: TrackerConfig,
    jobs: Mutex<HashMap<Uuid, TrackedJob>>,
    event_tx: broadcast::Sender<TrackerEvent>,
    callbacks: RwLock<Vec<ChangeCallback>>,
    /// Events awaiting callback delivery, queued in the order of the state
    /// changes that produced them.
    pending_events: Mutex<VecDeque<TrackerEvent>>,
    dispatching: AtomicBool,
    shutdown: CancellationToken,
    /// Runtime the tracker was created on, used for background remote
    /// cancellation when `cancel` is called from outside any runtime.
    runtime: Option<Handle>,
}

/// Holds a document's start reservation until the remote job is registered.
/// Dropping it early removes the reservation.
struct Reservation<'a> {
    inner: &'a Inner,
    id: Uuid,
    armed: bool,
}

impl Reservation<'_> {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.inner.lock_jobs().remove(&self.id);
        }
    }
}

/// Clears the dispatching flag on drop, including when a callback panics.
struct DispatchFlag<'a>(&'a AtomicBool);

impl Drop for DispatchFlag<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Tracks remote jobs from start to terminal status.
///
/// Cheap to clone; clones share the same job map.
#[derive(Clone)]
pub struct JobTracker {
    inner: Arc<Inner>,
}

impl JobTracker {
    /// Create a tracker backed by the given job execution service.
    pub fn new(service: Arc<dyn JobExecutionService>, config: TrackerConfig) -> Self {
        let (event_tx, _) = broadcast::channel(EVENT_BUS_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                service,
                config,
                jobs: Mutex::new(HashMap::new()),
                event_tx,
                callbacks: RwLock::new(Vec::new()),
                pending_events: Mutex::new(VecDeque::new()),
                dispatching: AtomicBool::new(false),
                shutdown: CancellationToken::new(),
                runtime: Handle::try_current().ok(),
            }),
        }
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.inner.config
    }

    /// Start a job for one document and begin polling it.
    ///
    /// Fails with [`Error::DuplicateJob`] if the document already has an
    /// active job and duplicates are not allowed. The document is reserved
    /// before the remote request is sent, so concurrent starts for the same
    /// target cannot both succeed. Dropping the returned future before it
    /// resolves releases the reservation.
    pub async fn start(
        &self,
        kind: JobKind,
        target: impl Into<DocumentId>,
        options: StartOptions,
    ) -> Result<JobHandle> {
        let document_id = target.into();
        let id = Uuid::new_v4();
        let allow_duplicate = options.allow_duplicate || self.inner.config.allow_duplicate_jobs;

        let (reservation, cancel) = {
            let mut jobs = self.inner.lock_jobs();
            if self.inner.shutdown.is_cancelled() {
                return Err(Error::Internal("job tracker is shut down".to_string()));
            }
            if !allow_duplicate
                && jobs
                    .values()
                    .any(|j| j.signal.document_id == document_id && j.signal.is_active())
            {
                debug!(%document_id, job_kind = %kind, "Rejected duplicate job");
                return Err(Error::DuplicateJob { document_id, kind });
            }

            let signal = JobSignal::pending(document_id.clone(), kind);
            let (watch_tx, _) = watch::channel(signal.clone());
            let cancel = self.inner.shutdown.child_token();
            jobs.insert(
                id,
                TrackedJob {
                    remote_id: None,
                    signal,
                    cancel: cancel.clone(),
                    watch_tx,
                },
            );
            let reservation = Reservation {
                inner: &self.inner,
                id,
                armed: true,
            };
            (reservation, cancel)
        };

        let remote_id = match self
            .inner
            .service
            .begin_job(kind, &document_id, options.payload.as_ref())
            .await
        {
            Ok(remote_id) => remote_id,
            Err(e) => {
                warn!(%document_id, job_kind = %kind, error = %e, "Failed to start job");
                return Err(e);
            }
        };

        let handle = JobHandle {
            id,
            remote_id,
            document_id,
            kind,
        };

        let registered = {
            let mut jobs = self.inner.lock_jobs();
            match jobs.get_mut(&id) {
                Some(job) => {
                    job.remote_id = Some(handle.remote_id.clone());
                    self.inner.queue(TrackerEvent::Started {
                        handle: handle.clone(),
                        signal: job.signal.clone(),
                    });
                    true
                }
                None => false,
            }
        };
        reservation.disarm();

        if !registered {
            // shut down while the begin request was in flight
            warn!(
                remote_job_id = %handle.remote_id,
                document_id = %handle.document_id,
                "Tracker shut down during start, cancelling remote job"
            );
            if let Err(e) = self.inner.service.cancel_job(&handle.remote_id).await {
                warn!(remote_job_id = %handle.remote_id, error = %e, "Remote cancellation failed");
            }
            return Err(Error::Internal(format!(
                "job tracker shut down while starting job for {}",
                handle.document_id
            )));
        }

        info!(
            job_id = %handle.id,
            remote_job_id = %handle.remote_id,
            document_id = %handle.document_id,
            job_kind = %kind,
            "Job started"
        );
        self.inner.dispatch();

        let span = job_span(
            &handle.id.to_string(),
            &handle.remote_id,
            &handle.document_id,
            kind,
        );
        tokio::spawn(Inner::poll_loop(self.inner.clone(), handle.clone(), cancel).instrument(span));

        Ok(handle)
    }

    /// Start one job per target. Each start is independent: failures are
    /// reported per target and never abort the rest of the batch.
    pub async fn start_batch<I, T>(
        &self,
        kind: JobKind,
        targets: I,
        options: StartOptions,
    ) -> BatchStartReport
    where
        I: IntoIterator<Item = T>,
        T: Into<DocumentId>,
    {
        let targets: Vec<DocumentId> = targets.into_iter().map(Into::into).collect();
        let starts = targets
            .iter()
            .map(|target| self.start(kind, target.clone(), options.clone()));
        let results = join_all(starts).await;

        let mut report = BatchStartReport::default();
        for (target, result) in targets.into_iter().zip(results) {
            match result {
                Ok(handle) => report.started.push(handle),
                Err(e) => report.rejected.push((target, e)),
            }
        }

        info!(
            job_kind = %kind,
            started = report.started.len(),
            rejected = report.rejected.len(),
            "Batch submitted"
        );
        report
    }

    /// Cancel a job. Returns `false` if the job was already terminal or unknown.
    ///
    /// Local polling stops immediately and the signal becomes `Cancelled`;
    /// the remote cancellation is sent in the background and not awaited.
    /// Callable from any thread: outside a runtime the request goes to the
    /// runtime the tracker was created on.
    pub fn cancel(&self, handle: &JobHandle) -> bool {
        {
            let mut jobs = self.inner.lock_jobs();
            let Some(job) = jobs.get_mut(&handle.id) else {
                return false;
            };
            if !job.signal.is_active() {
                return false;
            }
            job.signal.status = JobStatus::Cancelled;
            job.signal.updated_at = Utc::now();
            job.cancel.cancel();
            job.watch_tx.send_replace(job.signal.clone());
            self.inner.queue(TrackerEvent::Finished {
                handle: handle.clone(),
                signal: job.signal.clone(),
            });
        }

        info!(job_id = %handle.id, document_id = %handle.document_id, "Job cancelled");
        self.inner.dispatch();

        let Some(runtime) = Handle::try_current().ok().or_else(|| self.inner.runtime.clone())
        else {
            warn!(
                remote_job_id = %handle.remote_id,
                "No runtime available, remote job not cancelled"
            );
            return true;
        };
        let service = self.inner.service.clone();
        let remote_id = handle.remote_id.clone();
        runtime.spawn(async move {
            if let Err(e) = service.cancel_job(&remote_id).await {
                warn!(remote_job_id = %remote_id, error = %e, "Remote cancellation failed");
            }
        });
        true
    }

    /// Latest signal for a document: the active job if there is one,
    /// otherwise the most recently updated terminal job not yet acknowledged.
    pub fn status_of(&self, document_id: &str) -> Option<JobSignal> {
        let jobs = self.inner.lock_jobs();
        let own = jobs.values().filter(|j| j.signal.document_id == document_id);
        let mut latest: Option<&JobSignal> = None;
        for job in own {
            let candidate = &job.signal;
            latest = match latest {
                None => Some(candidate),
                Some(current) if current.is_active() && !candidate.is_active() => Some(current),
                Some(current) if candidate.is_active() && !current.is_active() => Some(candidate),
                Some(current) if candidate.updated_at > current.updated_at => Some(candidate),
                Some(current) => Some(current),
            };
        }
        latest.cloned()
    }

    /// Current signal of one job.
    pub fn signal(&self, handle: &JobHandle) -> Option<JobSignal> {
        self.inner
            .lock_jobs()
            .get(&handle.id)
            .map(|j| j.signal.clone())
    }

    /// Snapshot of every tracked signal, active and terminal.
    pub fn signals(&self) -> Vec<JobSignal> {
        self.inner
            .lock_jobs()
            .values()
            .map(|j| j.signal.clone())
            .collect()
    }

    /// Wait until the job reaches a terminal status.
    pub async fn wait(&self, handle: &JobHandle) -> Result<JobSignal> {
        let mut rx = {
            let jobs = self.inner.lock_jobs();
            let job = jobs
                .get(&handle.id)
                .ok_or_else(|| Error::NotFound(format!("job {}", handle.id)))?;
            job.watch_tx.subscribe()
        };
        let signal = rx
            .wait_for(|s| s.status.is_terminal())
            .await
            .map_err(|_| Error::Internal(format!("job {} dropped before finishing", handle.id)))?;
        Ok(signal.clone())
    }

    /// Forget a terminal job. Returns `false` if it is still active or unknown.
    pub fn acknowledge(&self, handle: &JobHandle) -> bool {
        let mut jobs = self.inner.lock_jobs();
        match jobs.get(&handle.id) {
            Some(job) if job.signal.status.is_terminal() => {
                jobs.remove(&handle.id);
                true
            }
            _ => false,
        }
    }

    /// Job counts by status.
    pub fn stats(&self) -> TrackerStats {
        let jobs = self.inner.lock_jobs();
        let mut stats = TrackerStats::default();
        for job in jobs.values() {
            match job.signal.status {
                JobStatus::Pending => stats.pending += 1,
                JobStatus::Running => stats.running += 1,
                JobStatus::Completed => stats.completed += 1,
                JobStatus::Failed => stats.failed += 1,
                JobStatus::Cancelled => stats.cancelled += 1,
            }
        }
        stats
    }

    /// Subscribe to change events.
    pub fn subscribe(&self) -> broadcast::Receiver<TrackerEvent> {
        self.inner.event_tx.subscribe()
    }

    /// Register a callback invoked for every change event.
    pub fn on_change<F>(&self, callback: F)
    where
        F: Fn(&TrackerEvent) + Send + Sync + 'static,
    {
        self.inner
            .callbacks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::new(callback));
    }

    /// Stop every polling task and forget all jobs without contacting the
    /// remote system. Pending [`JobTracker::wait`] calls return an error.
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
        let dropped = {
            let mut jobs = self.inner.lock_jobs();
            let n = jobs.len();
            jobs.clear();
            n
        };
        info!(dropped, "Job tracker shut down");
    }
}

impl Inner {
    fn lock_jobs(&self) -> MutexGuard<'_, HashMap<Uuid, TrackedJob>> {
        self.jobs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Publish an event. Must be called with the job map locked so that
    /// events leave in the same order as the state changes behind them.
    fn queue(&self, event: TrackerEvent) {
        let _ = self.event_tx.send(event.clone());
        self.pending_events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(event);
    }

    fn next_pending(&self) -> Option<TrackerEvent> {
        self.pending_events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
    }

    /// Deliver queued events to callbacks, one dispatcher at a time.
    ///
    /// Call without the job map locked. A callback may call back into the
    /// tracker; events it causes are delivered by the running dispatcher.
    fn dispatch(&self) {
        loop {
            if self
                .dispatching
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                return;
            }
            {
                let _active = DispatchFlag(&self.dispatching);
                while let Some(event) = self.next_pending() {
                    let callbacks: Vec<ChangeCallback> = self
                        .callbacks
                        .read()
                        .unwrap_or_else(PoisonError::into_inner)
                        .clone();
                    for callback in callbacks {
                        callback(&event);
                    }
                }
            }

            // an event queued after the last pop but before the release
            // would otherwise wait for the next state change
            let empty = self
                .pending_events
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .is_empty();
            if empty {
                return;
            }
        }
    }

    /// Poll one job until it is terminal, cancelled, or the tracker shuts down.
    async fn poll_loop(inner: Arc<Inner>, handle: JobHandle, cancel: CancellationToken) {
        let interval = Duration::from_millis(inner.config.poll_interval_ms);
        let max_failures = inner.config.max_consecutive_poll_failures.max(1);
        let started = Instant::now();
        let mut failures = 0u32;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("Polling stopped");
                    return;
                }
                _ = sleep(interval) => {}
            }

            let polled = tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("Polling stopped mid-request");
                    return;
                }
                polled = inner.service.poll_job(&handle.remote_id) => polled,
            };

            match polled {
                Ok(poll) if poll.status.is_terminal() => {
                    if inner.finish(&handle, poll) {
                        info!(
                            duration_ms = started.elapsed().as_millis() as u64,
                            "Job finished"
                        );
                    }
                    return;
                }
                Ok(poll) => {
                    failures = 0;
                    trace!(status = %poll.status, progress = ?poll.progress, "Job polled");
                    inner.update(&handle, poll);
                }
                Err(e) => {
                    failures += 1;
                    if failures >= max_failures {
                        warn!(poll_failures = failures, error = %e, "Lost contact with job");
                        let message = format!("{TRANSPORT_FAILURE_PREFIX}: {e}");
                        inner.finish(&handle, PollResult::failed(message));
                        return;
                    }
                    warn!(poll_failures = failures, error = %e, "Poll failed, retrying");
                }
            }
        }
    }

    /// Apply a transient poll result in place.
    fn update(&self, handle: &JobHandle, poll: PollResult) {
        {
            let mut jobs = self.lock_jobs();
            let Some(job) = jobs.get_mut(&handle.id) else {
                return;
            };
            if !job.signal.is_active() {
                return;
            }
            let progress = poll.progress.map(|p| p.min(100)).or(job.signal.progress);
            if job.signal.status == poll.status && job.signal.progress == progress {
                return;
            }
            job.signal.status = poll.status;
            job.signal.progress = progress;
            job.signal.updated_at = Utc::now();
            job.watch_tx.send_replace(job.signal.clone());
            self.queue(TrackerEvent::Progress {
                handle: handle.clone(),
                signal: job.signal.clone(),
            });
        }
        self.dispatch();
    }

    /// Retire a job with a terminal result. Returns `false` if it was
    /// already retired, in which case the result is discarded.
    fn finish(&self, handle: &JobHandle, poll: PollResult) -> bool {
        let signal = {
            let mut jobs = self.lock_jobs();
            let Some(job) = jobs.get_mut(&handle.id) else {
                return false;
            };
            if !job.signal.is_active() {
                debug!(status = %poll.status, "Discarding late terminal status");
                return false;
            }
            job.signal.status = poll.status;
            if let Some(progress) = poll.progress {
                job.signal.progress = Some(progress.min(100));
            } else if poll.status == JobStatus::Completed {
                job.signal.progress = Some(100);
            }
            job.signal.error_message = poll.error_message;
            job.signal.updated_at = Utc::now();
            job.cancel.cancel();
            job.watch_tx.send_replace(job.signal.clone());
            self.queue(TrackerEvent::Finished {
                handle: handle.clone(),
                signal: job.signal.clone(),
            });
            job.signal.clone()
        };

        match signal.status {
            JobStatus::Failed => warn!(
                error = signal.error_message.as_deref().unwrap_or(""),
                "Job failed"
            ),
            status => debug!(%status, "Job reached terminal status"),
        }
        self.dispatch();
        true
    }
}
