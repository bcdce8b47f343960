//! Data model shared by the resolver, tracker, and scheduler.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identifier of a document in the remote catalog.
pub type DocumentId = String;

/// Identifier assigned to a job by the remote job execution service.
pub type RemoteJobId = String;

// =============================================================================
// DOCUMENTS
// =============================================================================

/// Read-only snapshot of a catalog document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Document {
    pub document_id: DocumentId,
    /// Number of indexed chunks. Negative values from the remote are treated as zero.
    #[serde(default)]
    pub chunk_count: Option<i64>,
    #[serde(default)]
    pub last_ingest_time: Option<DateTime<Utc>>,
    /// Absent in deployments that do not distinguish tagging from ingestion.
    #[serde(default)]
    pub last_tagging_time: Option<DateTime<Utc>>,
}

impl Document {
    /// Create a document snapshot with no ingestion history.
    pub fn new(document_id: impl Into<DocumentId>) -> Self {
        Self {
            document_id: document_id.into(),
            chunk_count: None,
            last_ingest_time: None,
            last_tagging_time: None,
        }
    }

    /// Set the chunk count.
    pub fn with_chunks(mut self, count: i64) -> Self {
        self.chunk_count = Some(count);
        self
    }

    /// Set the last ingest time.
    pub fn ingested_at(mut self, at: DateTime<Utc>) -> Self {
        self.last_ingest_time = Some(at);
        self
    }

    /// Set the last tagging time.
    pub fn tagged_at(mut self, at: DateTime<Utc>) -> Self {
        self.last_tagging_time = Some(at);
        self
    }

    /// Chunk count with missing and negative values collapsed to zero.
    pub fn effective_chunk_count(&self) -> u64 {
        self.chunk_count.unwrap_or(0).max(0) as u64
    }
}

/// Knowledge-base-wide signals used for staleness comparison.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KnowledgeBaseSignal {
    /// Last time the controlled tag vocabulary changed.
    #[serde(default)]
    pub tag_dictionary_updated_at: Option<DateTime<Utc>>,
}

impl KnowledgeBaseSignal {
    pub fn updated_at(at: DateTime<Utc>) -> Self {
        Self {
            tag_dictionary_updated_at: Some(at),
        }
    }
}

// =============================================================================
// JOBS
// =============================================================================

/// Kind of background job driving a document's lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    /// Parse and chunk the source document
    Ingestion,
    /// Annotate the document against the tag dictionary
    Tagging,
    /// Rebuild the search index entries for the document
    Indexing,
}

impl JobKind {
    /// Ingestion and indexing both paint a document as `Ingesting`.
    pub fn is_ingestion_like(self) -> bool {
        matches!(self, JobKind::Ingestion | JobKind::Indexing)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobKind::Ingestion => "ingestion",
            JobKind::Tagging => "tagging",
            JobKind::Indexing => "indexing",
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status reported for a job by the remote system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    /// Pending or running.
    pub fn is_active(self) -> bool {
        matches!(self, JobStatus::Pending | JobStatus::Running)
    }

    /// Completed, failed, or cancelled.
    pub fn is_terminal(self) -> bool {
        !self.is_active()
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Latest known state of one job for one document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSignal {
    pub document_id: DocumentId,
    pub kind: JobKind,
    pub status: JobStatus,
    /// 0-100. `None` means unknown, not "just started".
    #[serde(default)]
    pub progress: Option<u8>,
    #[serde(default)]
    pub error_message: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl JobSignal {
    /// A freshly submitted job with no progress information.
    pub fn pending(document_id: impl Into<DocumentId>, kind: JobKind) -> Self {
        Self {
            document_id: document_id.into(),
            kind,
            status: JobStatus::Pending,
            progress: None,
            error_message: None,
            updated_at: Utc::now(),
        }
    }

    pub fn with_status(mut self, status: JobStatus) -> Self {
        self.status = status;
        self
    }

    /// Set progress, clamped to 0-100.
    pub fn with_progress(mut self, percent: u8) -> Self {
        self.progress = Some(percent.min(100));
        self
    }

    pub fn with_error(mut self, message: impl Into<String>) -> Self {
        self.error_message = Some(message.into());
        self
    }

    pub fn is_active(&self) -> bool {
        self.status.is_active()
    }
}

/// Result of a single remote poll.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollResult {
    pub status: JobStatus,
    #[serde(default)]
    pub progress: Option<u8>,
    #[serde(default)]
    pub error_message: Option<String>,
}

impl PollResult {
    pub fn new(status: JobStatus) -> Self {
        Self {
            status,
            progress: None,
            error_message: None,
        }
    }

    pub fn running(progress: u8) -> Self {
        Self {
            status: JobStatus::Running,
            progress: Some(progress),
            error_message: None,
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            status: JobStatus::Failed,
            progress: None,
            error_message: Some(message.into()),
        }
    }
}

// =============================================================================
// LIFECYCLE
// =============================================================================

/// The single state a document is painted with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    NotIngested,
    Ingesting,
    /// Ingested in a deployment without a tagging concept
    Ingested,
    IngestedUntagged,
    Tagging,
    Tagged,
    /// Tag dictionary changed after the last ingest
    Outdated,
    /// Tag dictionary changed after the last tagging run, but not after ingest
    TaggingOutdated,
}

impl LifecycleState {
    /// Every state, in display order.
    pub const ALL: [LifecycleState; 8] = [
        LifecycleState::NotIngested,
        LifecycleState::Ingesting,
        LifecycleState::Ingested,
        LifecycleState::IngestedUntagged,
        LifecycleState::Tagging,
        LifecycleState::Tagged,
        LifecycleState::Outdated,
        LifecycleState::TaggingOutdated,
    ];

    /// Human-readable label for status columns.
    pub fn label(self) -> &'static str {
        match self {
            LifecycleState::NotIngested => "Not ingested",
            LifecycleState::Ingesting => "Ingesting",
            LifecycleState::Ingested => "Ingested",
            LifecycleState::IngestedUntagged => "Ingested, untagged",
            LifecycleState::Tagging => "Tagging",
            LifecycleState::Tagged => "Tagged",
            LifecycleState::Outdated => "Outdated",
            LifecycleState::TaggingOutdated => "Tagging outdated",
        }
    }

    /// A job is currently running for the document.
    pub fn is_busy(self) -> bool {
        matches!(self, LifecycleState::Ingesting | LifecycleState::Tagging)
    }

    /// The job that would bring the document up to date, if any.
    pub fn suggested_job(self) -> Option<JobKind> {
        match self {
            LifecycleState::NotIngested | LifecycleState::Outdated => Some(JobKind::Ingestion),
            LifecycleState::IngestedUntagged | LifecycleState::TaggingOutdated => {
                Some(JobKind::Tagging)
            }
            LifecycleState::Ingesting
            | LifecycleState::Ingested
            | LifecycleState::Tagging
            | LifecycleState::Tagged => None,
        }
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}
