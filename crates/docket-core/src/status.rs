//! Document lifecycle status resolution.
//!
//! [`resolve_status`] collapses every signal known about a document into a
//! single [`LifecycleState`]. Rules are evaluated in order and the first
//! match wins:
//!
//! 1. An active (pending/running) tagging job paints `Tagging`.
//! 2. An active ingestion or indexing job paints `Ingesting`.
//! 3. A missing or zero chunk count paints `NotIngested`.
//! 4. Otherwise the document is ingested. A tag dictionary newer than the
//!    last ingest paints `Outdated`. Without tagging tracking the document is
//!    `Ingested`; with it, the document is `Tagged`, `TaggingOutdated`, or
//!    `IngestedUntagged` depending on the tagging evidence.
//!
//! Failed and cancelled job signals never count as active. Their error
//! message is surfaced through [`Resolution::error`] instead of the state.
//! The resolver performs no I/O and never fails: malformed values are
//! clamped so a displayable state is always returned.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::{Document, JobKind, JobSignal, JobStatus, KnowledgeBaseSignal, LifecycleState};

/// Whether the deployment distinguishes tagging from ingestion.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaggingTracking {
    /// Tagging sub-states collapse into `Ingested`.
    Untracked,
    /// Tagging completion is tracked separately from ingestion.
    #[default]
    Tracked,
}

/// Deployment-level knobs for the resolver.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResolverConfig {
    pub tagging: TaggingTracking,
}

impl ResolverConfig {
    /// Create config from environment variables (with defaults).
    ///
    /// | Variable | Default | Description |
    /// |----------|---------|-------------|
    /// | `DOCKET_TAGGING_TRACKED` | `true` | Track tagging separately from ingestion |
    pub fn from_env() -> Self {
        let tracked = std::env::var("DOCKET_TAGGING_TRACKED")
            .map(|v| v != "false" && v != "0")
            .unwrap_or(true);
        Self::default().with_tagging(if tracked {
            TaggingTracking::Tracked
        } else {
            TaggingTracking::Untracked
        })
    }

    /// Set the tagging mode.
    pub fn with_tagging(mut self, tagging: TaggingTracking) -> Self {
        self.tagging = tagging;
        self
    }
}

/// Output of [`resolve_status`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution {
    pub state: LifecycleState,
    /// Progress of the active job, when one is running and reports it.
    pub progress: Option<u8>,
    /// Error of the most recent terminal job if it failed or was cancelled.
    pub error: Option<String>,
}

impl Resolution {
    fn new(state: LifecycleState) -> Self {
        Self {
            state,
            progress: None,
            error: None,
        }
    }
}

/// Resolve the lifecycle state of one document.
///
/// Signals belonging to other documents are ignored, so callers may pass
/// the tracker's full signal snapshot.
pub fn resolve_status(
    document: &Document,
    signals: &[JobSignal],
    kb: &KnowledgeBaseSignal,
    config: &ResolverConfig,
) -> Resolution {
    let own: Vec<&JobSignal> = signals
        .iter()
        .filter(|s| s.document_id == document.document_id)
        .collect();

    let mut resolution = resolve_state(document, &own, kb, config);
    resolution.error = latest_error(&own);
    resolution
}

fn resolve_state(
    document: &Document,
    signals: &[&JobSignal],
    kb: &KnowledgeBaseSignal,
    config: &ResolverConfig,
) -> Resolution {
    if let Some(job) = latest_active(signals, |kind| kind == JobKind::Tagging) {
        return Resolution {
            progress: job.progress.map(|p| p.min(100)),
            ..Resolution::new(LifecycleState::Tagging)
        };
    }

    if let Some(job) = latest_active(signals, JobKind::is_ingestion_like) {
        return Resolution {
            progress: job.progress.map(|p| p.min(100)),
            ..Resolution::new(LifecycleState::Ingesting)
        };
    }

    // A positive chunk count proves ingestion even when timestamps were lost.
    if document.effective_chunk_count() == 0 {
        return Resolution::new(LifecycleState::NotIngested);
    }

    let dictionary = kb.tag_dictionary_updated_at;
    if newer(dictionary, document.last_ingest_time) {
        return Resolution::new(LifecycleState::Outdated);
    }

    match config.tagging {
        TaggingTracking::Untracked => Resolution::new(LifecycleState::Ingested),
        TaggingTracking::Tracked => match tagging_time(document, signals) {
            None => Resolution::new(LifecycleState::IngestedUntagged),
            Some(tagged) if newer(dictionary, Some(tagged)) => {
                Resolution::new(LifecycleState::TaggingOutdated)
            }
            Some(_) => Resolution::new(LifecycleState::Tagged),
        },
    }
}

/// `a > b`, false when either side is unknown.
fn newer(a: Option<DateTime<Utc>>, b: Option<DateTime<Utc>>) -> bool {
    matches!((a, b), (Some(a), Some(b)) if a > b)
}

fn latest_active<'a>(
    signals: &[&'a JobSignal],
    kind_matches: impl Fn(JobKind) -> bool,
) -> Option<&'a JobSignal> {
    signals
        .iter()
        .copied()
        .filter(|s| s.is_active() && kind_matches(s.kind))
        .max_by_key(|s| s.updated_at)
}

/// Effective tagging completion time: the catalog timestamp, or the
/// observation time of a completed tagging job the catalog has not caught up with.
fn tagging_time(document: &Document, signals: &[&JobSignal]) -> Option<DateTime<Utc>> {
    let observed = signals
        .iter()
        .filter(|s| s.kind == JobKind::Tagging && s.status == JobStatus::Completed)
        .map(|s| s.updated_at)
        .max();
    document.last_tagging_time.max(observed)
}

fn latest_error(signals: &[&JobSignal]) -> Option<String> {
    let last_terminal = signals
        .iter()
        .filter(|s| s.status.is_terminal())
        .max_by_key(|s| s.updated_at)?;
    match last_terminal.status {
        JobStatus::Failed | JobStatus::Cancelled => last_terminal.error_message.clone(),
        _ => None,
    }
}
