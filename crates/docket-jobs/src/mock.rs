//! Deterministic in-memory collaborators for testing and demos.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use docket_jobs::mock::{MockJobService, MockStep};
//! use docket_core::PollResult;
//!
//! let service = MockJobService::new()
//!     .with_script("doc-1", vec![
//!         MockStep::TransportError("connection reset".into()),
//!         MockStep::Status(PollResult::failed("OOM")),
//!     ])
//!     .fail_begin_for("doc-2");
//! ```

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use tokio::sync::Notify;

use docket_core::{
    DocumentId, Error, JobExecutionService, JobKind, JobStatus, PollResult, RemoteJobId, Result,
};

use crate::selection::{AbnormalCandidate, AbnormalReason, CandidatePool, CandidateSource};

/// One scripted answer to a poll.
#[derive(Debug, Clone, PartialEq)]
pub enum MockStep {
    Status(PollResult),
    /// The poll fails as if the network dropped.
    TransportError(String),
}

/// A recorded call against the mock service.
#[derive(Debug, Clone, PartialEq)]
pub enum MockCall {
    Begin {
        kind: JobKind,
        target: DocumentId,
        options: Option<JsonValue>,
    },
    Poll {
        job_id: RemoteJobId,
    },
    Cancel {
        job_id: RemoteJobId,
    },
}

type CompletionHook = Arc<dyn Fn(&str, JobKind) + Send + Sync>;

struct MockJob {
    target: DocumentId,
    kind: JobKind,
    steps: VecDeque<MockStep>,
    last: Option<PollResult>,
    cancelled: bool,
    polls: usize,
    completion_reported: bool,
}

#[derive(Default)]
struct MockState {
    jobs: HashMap<RemoteJobId, MockJob>,
    scripts: HashMap<DocumentId, Vec<MockStep>>,
    fail_begin: HashSet<DocumentId>,
    held_begin: HashMap<DocumentId, Arc<Notify>>,
    calls: Vec<MockCall>,
    next_id: u64,
}

/// Scripted [`JobExecutionService`].
///
/// Each job replays its target's script, one step per poll; the last status
/// step repeats once the script runs out. Targets without a script run
/// `Running(50)` then `Completed`.
#[derive(Clone)]
pub struct MockJobService {
    state: Arc<Mutex<MockState>>,
    default_script: Arc<Vec<MockStep>>,
    on_complete: Option<CompletionHook>,
}

impl Default for MockJobService {
    fn default() -> Self {
        Self::new()
    }
}

impl MockJobService {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MockState::default())),
            default_script: Arc::new(vec![
                MockStep::Status(PollResult::running(50)),
                MockStep::Status(PollResult::new(JobStatus::Completed)),
            ]),
            on_complete: None,
        }
    }

    /// Script used for targets without their own.
    pub fn with_default_script(mut self, steps: Vec<MockStep>) -> Self {
        self.default_script = Arc::new(steps);
        self
    }

    /// Script for jobs started against one target.
    pub fn with_script(self, target: impl Into<DocumentId>, steps: Vec<MockStep>) -> Self {
        self.lock().scripts.insert(target.into(), steps);
        self
    }

    /// Make `begin_job` fail with a transport error for this target.
    pub fn fail_begin_for(self, target: impl Into<DocumentId>) -> Self {
        self.lock().fail_begin.insert(target.into());
        self
    }

    /// Hold `begin_job` for this target until `gate` is notified. A gate
    /// that is never notified makes the start hang.
    pub fn hold_begin_for(self, target: impl Into<DocumentId>, gate: Arc<Notify>) -> Self {
        self.lock().held_begin.insert(target.into(), gate);
        self
    }

    /// Called once per job the first time a poll reports `Completed`.
    pub fn with_completion_hook<F>(mut self, hook: F) -> Self
    where
        F: Fn(&str, JobKind) + Send + Sync + 'static,
    {
        self.on_complete = Some(Arc::new(hook));
        self
    }

    /// Every call received so far, in order.
    pub fn calls(&self) -> Vec<MockCall> {
        self.lock().calls.clone()
    }

    /// Targets passed to `begin_job`, in order, including rejected ones.
    pub fn begun_targets(&self) -> Vec<DocumentId> {
        self.lock()
            .calls
            .iter()
            .filter_map(|c| match c {
                MockCall::Begin { target, .. } => Some(target.clone()),
                _ => None,
            })
            .collect()
    }

    /// Remote ids that received a cancel request.
    pub fn cancelled_jobs(&self) -> Vec<RemoteJobId> {
        self.lock()
            .calls
            .iter()
            .filter_map(|c| match c {
                MockCall::Cancel { job_id } => Some(job_id.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn poll_count(&self, job_id: &str) -> usize {
        self.lock().jobs.get(job_id).map(|j| j.polls).unwrap_or(0)
    }

    /// Total polls across every job.
    pub fn total_polls(&self) -> usize {
        self.lock().jobs.values().map(|j| j.polls).sum()
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl JobExecutionService for MockJobService {
    async fn begin_job(
        &self,
        kind: JobKind,
        target_id: &str,
        options: Option<&JsonValue>,
    ) -> Result<RemoteJobId> {
        let gate = {
            let mut state = self.lock();
            state.calls.push(MockCall::Begin {
                kind,
                target: target_id.to_string(),
                options: options.cloned(),
            });
            state.held_begin.get(target_id).cloned()
        };
        if let Some(gate) = gate {
            gate.notified().await;
        }

        let mut state = self.lock();
        if state.fail_begin.contains(target_id) {
            return Err(Error::Transport(format!("begin rejected for {target_id}")));
        }

        state.next_id += 1;
        let job_id = format!("job-{}", state.next_id);
        let steps = state
            .scripts
            .get(target_id)
            .cloned()
            .unwrap_or_else(|| self.default_script.as_ref().clone());
        state.jobs.insert(
            job_id.clone(),
            MockJob {
                target: target_id.to_string(),
                kind,
                steps: steps.into(),
                last: None,
                cancelled: false,
                polls: 0,
                completion_reported: false,
            },
        );
        Ok(job_id)
    }

    async fn poll_job(&self, job_id: &str) -> Result<PollResult> {
        let (result, completed) = {
            let mut state = self.lock();
            state.calls.push(MockCall::Poll {
                job_id: job_id.to_string(),
            });
            let job = state
                .jobs
                .get_mut(job_id)
                .ok_or_else(|| Error::NotFound(format!("job {job_id}")))?;
            job.polls += 1;

            if job.cancelled {
                return Ok(PollResult::new(JobStatus::Cancelled));
            }

            let result = match job.steps.pop_front() {
                Some(MockStep::TransportError(message)) => return Err(Error::Transport(message)),
                Some(MockStep::Status(poll)) => {
                    job.last = Some(poll.clone());
                    poll
                }
                None => job
                    .last
                    .clone()
                    .unwrap_or_else(|| PollResult::new(JobStatus::Completed)),
            };

            let completed = result.status == JobStatus::Completed && !job.completion_reported;
            if completed {
                job.completion_reported = true;
            }
            (result, completed.then(|| (job.target.clone(), job.kind)))
        };

        if let (Some(hook), Some((target, kind))) = (&self.on_complete, completed) {
            hook(&target, kind);
        }
        Ok(result)
    }

    async fn cancel_job(&self, job_id: &str) -> Result<()> {
        let mut state = self.lock();
        state.calls.push(MockCall::Cancel {
            job_id: job_id.to_string(),
        });
        if let Some(job) = state.jobs.get_mut(job_id) {
            let terminal = job.last.as_ref().is_some_and(|p| p.status.is_terminal());
            if !terminal {
                job.cancelled = true;
            }
        }
        Ok(())
    }
}

/// Mutable candidate pools shared between a scheduler and whatever
/// resolves abnormal flags.
#[derive(Clone, Default)]
pub struct InMemoryCandidates {
    pool: Arc<Mutex<CandidatePool>>,
}

impl InMemoryCandidates {
    pub fn new<I, T>(documents: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<DocumentId>,
    {
        Self {
            pool: Arc::new(Mutex::new(CandidatePool {
                abnormal: Vec::new(),
                documents: documents.into_iter().map(Into::into).collect(),
            })),
        }
    }

    /// Flag a document as abnormal now.
    pub fn flag(&self, document_id: impl Into<DocumentId>, reason: AbnormalReason) {
        self.flag_at(document_id, reason, Utc::now());
    }

    pub fn flag_at(
        &self,
        document_id: impl Into<DocumentId>,
        reason: AbnormalReason,
        flagged_at: DateTime<Utc>,
    ) {
        self.lock().abnormal.push(AbnormalCandidate {
            document_id: document_id.into(),
            flagged_at,
            reason,
        });
    }

    /// Clear every flag on a document. Returns whether it was flagged.
    pub fn resolve(&self, document_id: &str) -> bool {
        let mut pool = self.lock();
        let before = pool.abnormal.len();
        pool.abnormal.retain(|c| c.document_id != document_id);
        pool.abnormal.len() != before
    }

    pub fn add_document(&self, document_id: impl Into<DocumentId>) {
        self.lock().documents.push(document_id.into());
    }

    /// Current pool contents.
    pub fn pool(&self) -> CandidatePool {
        self.lock().clone()
    }

    fn lock(&self) -> MutexGuard<'_, CandidatePool> {
        self.pool.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl CandidateSource for InMemoryCandidates {
    async fn snapshot(&self) -> Result<CandidatePool> {
        Ok(self.pool())
    }
}
