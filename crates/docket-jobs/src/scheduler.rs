//! Multi-round batch optimization scheduler.
//!
//! Each round splits a fixed batch between flagged (abnormal) documents and
//! ordinary ones, hands the selection to a [`RoundExecutor`], then decides
//! whether to run another round. One instance runs at most one run at a time.

use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Instrument};

use docket_core::defaults::{
    ABNORMAL_DOC_THRESHOLD_PCT, ABNORMAL_SLOTS, BATCH_SIZE, ENABLE_EARLY_TERMINATION,
    EVENT_BUS_CAPACITY, MAX_ITERATIONS, ROUND_CANCEL_GRACE_MS, ROUND_TIMEOUT_MS,
};
use docket_core::logging::{round_span, run_span};
use docket_core::{DocumentId, Error, Result};

use crate::executor::RoundExecutor;
use crate::selection::{draw_round, CandidatePool, CandidateSource, RoundSelection};

/// Validated scheduler configuration.
///
/// `normal_slots` is always `batch_size - abnormal_slots`; it cannot be set.
#[derive(Debug, Clone, PartialEq)]
pub struct SchedulerConfig {
    batch_size: usize,
    abnormal_slots: usize,
    max_iterations: u32,
    abnormal_doc_threshold_pct: f64,
    enable_early_termination: bool,
    round_timeout_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            batch_size: BATCH_SIZE,
            abnormal_slots: ABNORMAL_SLOTS,
            max_iterations: MAX_ITERATIONS,
            abnormal_doc_threshold_pct: ABNORMAL_DOC_THRESHOLD_PCT,
            enable_early_termination: ENABLE_EARLY_TERMINATION,
            round_timeout_ms: ROUND_TIMEOUT_MS,
        }
    }
}

impl SchedulerConfig {
    /// Build and validate a configuration. The round timeout takes its default.
    pub fn new(
        batch_size: usize,
        abnormal_slots: usize,
        max_iterations: u32,
        abnormal_doc_threshold_pct: f64,
        enable_early_termination: bool,
    ) -> Result<Self> {
        let config = Self {
            batch_size,
            abnormal_slots,
            max_iterations,
            abnormal_doc_threshold_pct,
            enable_early_termination,
            round_timeout_ms: ROUND_TIMEOUT_MS,
        };
        config.validate()?;
        Ok(config)
    }

    /// Create config from environment variables (with defaults).
    ///
    /// | Variable | Default | Description |
    /// |----------|---------|-------------|
    /// | `DOCKET_BATCH_SIZE` | `10` | Documents per round |
    /// | `DOCKET_ABNORMAL_SLOTS` | `3` | Slots reserved for flagged documents |
    /// | `DOCKET_MAX_ITERATIONS` | `5` | Upper bound on rounds per run |
    /// | `DOCKET_ABNORMAL_THRESHOLD_PCT` | `10.0` | Early-stop abnormal percentage |
    /// | `DOCKET_EARLY_TERMINATION` | `true` | Stop once the threshold is reached |
    /// | `DOCKET_ROUND_TIMEOUT_MS` | `600000` | Per-round timeout |
    ///
    /// Unparseable values fall back to the default; parsed but invalid
    /// combinations are rejected.
    pub fn from_env() -> Result<Self> {
        fn parsed<T: std::str::FromStr>(key: &str, default: T) -> T {
            std::env::var(key)
                .ok()
                .and_then(|v| v.trim().parse::<T>().ok())
                .unwrap_or(default)
        }

        let config = Self {
            batch_size: parsed("DOCKET_BATCH_SIZE", BATCH_SIZE),
            abnormal_slots: parsed("DOCKET_ABNORMAL_SLOTS", ABNORMAL_SLOTS),
            max_iterations: parsed("DOCKET_MAX_ITERATIONS", MAX_ITERATIONS),
            abnormal_doc_threshold_pct: parsed(
                "DOCKET_ABNORMAL_THRESHOLD_PCT",
                ABNORMAL_DOC_THRESHOLD_PCT,
            ),
            enable_early_termination: std::env::var("DOCKET_EARLY_TERMINATION")
                .map(|v| v != "false" && v != "0")
                .unwrap_or(ENABLE_EARLY_TERMINATION),
            round_timeout_ms: parsed("DOCKET_ROUND_TIMEOUT_MS", ROUND_TIMEOUT_MS),
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(Error::Config("batch_size must be at least 1".into()));
        }
        if self.abnormal_slots > self.batch_size {
            return Err(Error::Config(format!(
                "abnormal_slots ({}) exceeds batch_size ({})",
                self.abnormal_slots, self.batch_size
            )));
        }
        if self.max_iterations == 0 {
            return Err(Error::Config("max_iterations must be at least 1".into()));
        }
        if !self.abnormal_doc_threshold_pct.is_finite()
            || !(0.0..=100.0).contains(&self.abnormal_doc_threshold_pct)
        {
            return Err(Error::Config(format!(
                "abnormal_doc_threshold_pct must be within 0-100, got {}",
                self.abnormal_doc_threshold_pct
            )));
        }
        if self.round_timeout_ms == 0 {
            return Err(Error::Config("round_timeout_ms must be at least 1".into()));
        }
        Ok(())
    }

    /// Apply a change, keeping the old config if the result is invalid.
    fn update(&mut self, change: impl FnOnce(&mut Self)) -> Result<()> {
        let mut next = self.clone();
        change(&mut next);
        next.validate()?;
        *self = next;
        Ok(())
    }

    pub fn set_batch_size(&mut self, batch_size: usize) -> Result<()> {
        self.update(|c| c.batch_size = batch_size)
    }

    pub fn set_abnormal_slots(&mut self, abnormal_slots: usize) -> Result<()> {
        self.update(|c| c.abnormal_slots = abnormal_slots)
    }

    pub fn set_max_iterations(&mut self, max_iterations: u32) -> Result<()> {
        self.update(|c| c.max_iterations = max_iterations)
    }

    pub fn set_abnormal_doc_threshold_pct(&mut self, pct: f64) -> Result<()> {
        self.update(|c| c.abnormal_doc_threshold_pct = pct)
    }

    pub fn set_early_termination(&mut self, enabled: bool) {
        self.enable_early_termination = enabled;
    }

    pub fn set_round_timeout_ms(&mut self, ms: u64) -> Result<()> {
        self.update(|c| c.round_timeout_ms = ms)
    }

    /// Builder form of [`SchedulerConfig::set_round_timeout_ms`].
    pub fn with_round_timeout_ms(mut self, ms: u64) -> Result<Self> {
        self.set_round_timeout_ms(ms)?;
        Ok(self)
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn abnormal_slots(&self) -> usize {
        self.abnormal_slots
    }

    pub fn normal_slots(&self) -> usize {
        self.batch_size - self.abnormal_slots
    }

    pub fn max_iterations(&self) -> u32 {
        self.max_iterations
    }

    pub fn abnormal_doc_threshold_pct(&self) -> f64 {
        self.abnormal_doc_threshold_pct
    }

    pub fn early_termination(&self) -> bool {
        self.enable_early_termination
    }

    pub fn round_timeout(&self) -> Duration {
        Duration::from_millis(self.round_timeout_ms)
    }
}

/// Record of one completed round.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchRound {
    pub iteration: u32,
    pub abnormal_slots: usize,
    pub normal_slots: usize,
    pub selected_abnormal_count: usize,
    pub selected_normal_count: usize,
    /// Abnormal share of this round's selection; 0 for an empty round.
    pub abnormal_ratio: f64,
    pub abnormal_items: Vec<DocumentId>,
    pub normal_items: Vec<DocumentId>,
    /// Abnormal share of the whole candidate pool after the round.
    pub pool_abnormal_ratio: f64,
    pub duration_ms: u64,
}

impl BatchRound {
    fn new(
        selection: RoundSelection,
        config: &SchedulerConfig,
        pool_abnormal_ratio: f64,
        duration_ms: u64,
    ) -> Self {
        let total = selection.len();
        let abnormal_ratio = if total == 0 {
            0.0
        } else {
            selection.abnormal.len() as f64 / total as f64
        };
        Self {
            iteration: selection.iteration,
            abnormal_slots: config.abnormal_slots(),
            normal_slots: config.normal_slots(),
            selected_abnormal_count: selection.abnormal.len(),
            selected_normal_count: selection.normal.len(),
            abnormal_ratio,
            abnormal_items: selection.abnormal,
            normal_items: selection.normal,
            pool_abnormal_ratio,
            duration_ms,
        }
    }

    pub fn processed(&self) -> usize {
        self.selected_abnormal_count + self.selected_normal_count
    }
}

/// Why a run stopped without error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationReason {
    /// Neither lane had anything left to draw.
    ExhaustedPool,
    MaxIterationsReached,
    /// Pool abnormal percentage dropped to or below the threshold.
    ThresholdReached,
    Cancelled,
}

impl fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TerminationReason::ExhaustedPool => "exhausted_pool",
            TerminationReason::MaxIterationsReached => "max_iterations_reached",
            TerminationReason::ThresholdReached => "threshold_reached",
            TerminationReason::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Result of a run that stopped without error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub rounds: Vec<BatchRound>,
    pub reason: TerminationReason,
}

/// Notification emitted while a run progresses.
#[derive(Debug, Clone)]
pub enum SchedulerEvent {
    RoundComplete(BatchRound),
    Terminated(TerminationReason),
    Failed(String),
}

enum RoundOutcome {
    Completed(BatchRound),
    Stopped(TerminationReason),
}

type RoundCallback = Arc<dyn Fn(&BatchRound) + Send + Sync>;

/// Clears the running flag when a run ends, however it ends.
struct RunGuard<'a>(&'a AtomicBool);

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Sequential multi-round optimization driver.
pub struct BatchScheduler {
    config: SchedulerConfig,
    source: Arc<dyn CandidateSource>,
    executor: Arc<dyn RoundExecutor>,
    running: AtomicBool,
    cancel: Mutex<CancellationToken>,
    event_tx: broadcast::Sender<SchedulerEvent>,
    callbacks: RwLock<Vec<RoundCallback>>,
}

impl BatchScheduler {
    pub fn new(
        config: SchedulerConfig,
        source: Arc<dyn CandidateSource>,
        executor: Arc<dyn RoundExecutor>,
    ) -> Self {
        let (event_tx, _) = broadcast::channel(EVENT_BUS_CAPACITY);
        Self {
            config,
            source,
            executor,
            running: AtomicBool::new(false),
            cancel: Mutex::new(CancellationToken::new()),
            event_tx,
            callbacks: RwLock::new(Vec::new()),
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Subscribe to round and termination events.
    pub fn subscribe(&self) -> broadcast::Receiver<SchedulerEvent> {
        self.event_tx.subscribe()
    }

    /// Register a callback invoked after every completed round.
    pub fn on_round_complete<F>(&self, callback: F)
    where
        F: Fn(&BatchRound) + Send + Sync + 'static,
    {
        self.callbacks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::new(callback));
    }

    /// Cancel the run in progress, if any.
    ///
    /// Jobs of the current round are cancelled; completed rounds are left alone.
    /// Has no effect on a run started afterwards.
    pub fn cancel(&self) {
        let token = self.cancel.lock().unwrap_or_else(PoisonError::into_inner);
        if self.is_running() {
            info!("Cancelling optimization run");
        }
        token.cancel();
    }

    /// Run rounds until a termination condition holds.
    ///
    /// Returns [`Error::SchedulerBusy`] if a run is already in progress,
    /// and stops on the first failed or timed-out round.
    pub async fn run(&self) -> Result<RunSummary> {
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(Error::SchedulerBusy);
        }
        let _guard = RunGuard(&self.running);

        let token = CancellationToken::new();
        *self.cancel.lock().unwrap_or_else(PoisonError::into_inner) = token.clone();

        let span = run_span(
            self.config.batch_size(),
            self.config.abnormal_slots(),
            self.config.max_iterations(),
        );
        let result = self.run_rounds(token).instrument(span).await;

        match &result {
            Ok(summary) => {
                let _ = self.event_tx.send(SchedulerEvent::Terminated(summary.reason));
            }
            Err(e) => {
                let _ = self.event_tx.send(SchedulerEvent::Failed(e.to_string()));
            }
        }
        result
    }

    async fn run_rounds(&self, token: CancellationToken) -> Result<RunSummary> {
        let started = Instant::now();
        let mut rounds = Vec::new();
        let mut processed: HashSet<DocumentId> = HashSet::new();
        let mut iteration = 0u32;

        let reason = loop {
            if token.is_cancelled() {
                break TerminationReason::Cancelled;
            }
            iteration += 1;

            match self
                .run_round(iteration, &token, &mut processed)
                .instrument(round_span(iteration))
                .await?
            {
                RoundOutcome::Stopped(reason) => break reason,
                RoundOutcome::Completed(round) => {
                    let pool_pct = round.pool_abnormal_ratio * 100.0;
                    self.publish(&round);
                    rounds.push(round);

                    if iteration >= self.config.max_iterations() {
                        break TerminationReason::MaxIterationsReached;
                    }
                    if self.config.early_termination()
                        && pool_pct <= self.config.abnormal_doc_threshold_pct()
                    {
                        break TerminationReason::ThresholdReached;
                    }
                }
            }
        };

        info!(
            rounds = rounds.len(),
            reason = %reason,
            duration_ms = started.elapsed().as_millis() as u64,
            "Optimization run finished"
        );
        Ok(RunSummary { rounds, reason })
    }

    async fn run_round(
        &self,
        iteration: u32,
        token: &CancellationToken,
        processed: &mut HashSet<DocumentId>,
    ) -> Result<RoundOutcome> {
        let round_started = Instant::now();
        let pool = self.snapshot(iteration).await?;
        let selection = draw_round(
            &pool,
            iteration,
            self.config.abnormal_slots(),
            self.config.normal_slots(),
            processed,
        );
        if selection.is_empty() {
            debug!("Candidate pool exhausted");
            return Ok(RoundOutcome::Stopped(TerminationReason::ExhaustedPool));
        }
        debug!(
            abnormal = selection.abnormal.len(),
            normal = selection.normal.len(),
            "Round selected"
        );

        let round_token = token.child_token();
        let timeout = self.config.round_timeout();
        let outcome = {
            let execution = self.executor.execute_round(&selection, round_token.clone());
            tokio::pin!(execution);
            tokio::select! {
                outcome = &mut execution => outcome,
                _ = sleep(timeout) => {
                    warn!(timeout_ms = timeout.as_millis() as u64, "Round timed out");
                    round_token.cancel();
                    let grace = Duration::from_millis(ROUND_CANCEL_GRACE_MS);
                    if tokio::time::timeout(grace, execution).await.is_err() {
                        warn!(grace_ms = ROUND_CANCEL_GRACE_MS, "Round ignored cancellation, abandoning it");
                    }
                    return Err(Error::RoundTimeout {
                        iteration,
                        timeout_ms: timeout.as_millis() as u64,
                    });
                }
            }
        };

        processed.extend(selection.all());

        let report = outcome.map_err(|e| Error::RoundFailed {
            iteration,
            cause: e.to_string(),
        })?;
        if report.cancelled {
            return Ok(RoundOutcome::Stopped(TerminationReason::Cancelled));
        }
        if report.is_failed() {
            warn!(failures = report.failures.len(), "Round failed");
            return Err(Error::RoundFailed {
                iteration,
                cause: report.failure_summary(),
            });
        }

        let pool = self.snapshot(iteration).await?;
        let round = BatchRound::new(
            selection,
            &self.config,
            pool.abnormal_ratio(),
            round_started.elapsed().as_millis() as u64,
        );
        info!(
            submitted = report.submitted,
            succeeded = report.succeeded,
            pool_abnormal_pct = round.pool_abnormal_ratio * 100.0,
            duration_ms = round.duration_ms,
            "Round complete"
        );
        Ok(RoundOutcome::Completed(round))
    }

    async fn snapshot(&self, iteration: u32) -> Result<CandidatePool> {
        self.source
            .snapshot()
            .await
            .map_err(|e| Error::RoundFailed {
                iteration,
                cause: format!("candidate snapshot failed: {e}"),
            })
    }

    fn publish(&self, round: &BatchRound) {
        let _ = self.event_tx.send(SchedulerEvent::RoundComplete(round.clone()));
        let callbacks: Vec<RoundCallback> = self
            .callbacks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for callback in callbacks {
            callback(round);
        }
    }
}
