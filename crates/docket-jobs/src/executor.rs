//! Round execution seam between the scheduler and the job tracker.

use async_trait::async_trait;
use futures::future::join_all;
use futures::stream::{FuturesUnordered, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use docket_core::{DocumentId, JobKind, JobStatus, Result};

use crate::selection::RoundSelection;
use crate::tracker::{JobHandle, JobTracker, StartOptions};

/// Outcome of one executed round.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoundReport {
    /// Documents whose job was accepted.
    pub submitted: usize,
    pub succeeded: usize,
    /// Documents that failed to start or finished `Failed`, with the cause.
    pub failures: Vec<(DocumentId, String)>,
    /// The round was interrupted by cancellation.
    pub cancelled: bool,
}

impl RoundReport {
    pub fn is_failed(&self) -> bool {
        !self.failures.is_empty()
    }

    /// Short description of the failures, for error messages.
    pub fn failure_summary(&self) -> String {
        self.failures
            .iter()
            .map(|(id, cause)| format!("{id}: {cause}"))
            .collect::<Vec<_>>()
            .join("; ")
    }
}

/// Executes one round's selection and waits for it to finish.
///
/// Implementations must stop promptly once `cancel` fires, cancelling only
/// the work they started for this round, and report `cancelled: true`.
#[async_trait]
pub trait RoundExecutor: Send + Sync {
    async fn execute_round(
        &self,
        selection: &RoundSelection,
        cancel: CancellationToken,
    ) -> Result<RoundReport>;
}

/// Runs rounds as one tracked job per selected document.
pub struct TrackerExecutor {
    tracker: JobTracker,
    kind: JobKind,
    options: StartOptions,
}

impl TrackerExecutor {
    pub fn new(tracker: JobTracker, kind: JobKind) -> Self {
        Self {
            tracker,
            kind,
            options: StartOptions::default(),
        }
    }

    /// Options forwarded to every job start.
    pub fn with_options(mut self, options: StartOptions) -> Self {
        self.options = options;
        self
    }

    pub fn tracker(&self) -> &JobTracker {
        &self.tracker
    }

    /// Cancel and forget this round's jobs.
    fn abandon(
        &self,
        selection: &RoundSelection,
        started: &[JobHandle],
        mut report: RoundReport,
    ) -> RoundReport {
        let cancelled = started.iter().filter(|h| self.tracker.cancel(h)).count();
        debug!(iteration = selection.iteration, cancelled, "Round cancelled");
        for handle in started {
            self.tracker.acknowledge(handle);
        }
        report.cancelled = true;
        report
    }
}

#[async_trait]
impl RoundExecutor for TrackerExecutor {
    async fn execute_round(
        &self,
        selection: &RoundSelection,
        cancel: CancellationToken,
    ) -> Result<RoundReport> {
        let mut starts: FuturesUnordered<_> = selection
            .all()
            .into_iter()
            .map(|document_id| async move {
                let result = self
                    .tracker
                    .start(self.kind, document_id.clone(), self.options.clone())
                    .await;
                (document_id, result)
            })
            .collect();

        let mut report = RoundReport::default();
        let mut started = Vec::new();
        let mut interrupted = false;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    interrupted = true;
                    break;
                }
                next = starts.next() => match next {
                    Some((_, Ok(handle))) => started.push(handle),
                    Some((document_id, Err(e))) => report.failures.push((document_id, e.to_string())),
                    None => break,
                },
            }
        }
        // dropping unfinished starts releases their reservations
        drop(starts);
        report.submitted = started.len();
        debug!(
            iteration = selection.iteration,
            submitted = report.submitted,
            rejected = report.failures.len(),
            "Round jobs submitted"
        );
        if interrupted {
            return Ok(self.abandon(selection, &started, report));
        }

        let waits = join_all(started.iter().map(|h| self.tracker.wait(h)));
        let results = tokio::select! {
            _ = cancel.cancelled() => None,
            results = waits => Some(results),
        };
        let Some(results) = results else {
            return Ok(self.abandon(selection, &started, report));
        };

        for (handle, result) in started.iter().zip(results) {
            match result {
                Ok(signal) if signal.status == JobStatus::Completed => report.succeeded += 1,
                Ok(signal) if signal.status == JobStatus::Failed => {
                    let cause = signal
                        .error_message
                        .unwrap_or_else(|| "job failed".to_string());
                    report.failures.push((handle.document_id.clone(), cause));
                }
                Ok(signal) => {
                    debug!(document_id = %handle.document_id, status = %signal.status, "Job ended without completing");
                }
                Err(e) => {
                    warn!(document_id = %handle.document_id, error = %e, "Lost job while waiting");
                    report.failures.push((handle.document_id.clone(), e.to_string()));
                }
            }
            self.tracker.acknowledge(handle);
        }

        Ok(report)
    }
}
