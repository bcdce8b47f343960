//! Collaborator interfaces the core consumes but never implements.
//!
//! Transport, authentication, and persistence all live behind these traits.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;

use crate::error::Result;
use crate::models::{Document, DocumentId, JobKind, PollResult, RemoteJobId};

/// Remote system that actually executes ingestion, tagging, and indexing.
///
/// Network failures should be reported as [`crate::Error::Transport`] so the
/// tracker can tell "the job failed" apart from "the job could not be observed".
#[async_trait]
pub trait JobExecutionService: Send + Sync {
    /// Begin a job and return the identifier used for polling.
    async fn begin_job(
        &self,
        kind: JobKind,
        target_id: &str,
        options: Option<&JsonValue>,
    ) -> Result<RemoteJobId>;

    /// Report the current status of a job.
    async fn poll_job(&self, job_id: &str) -> Result<PollResult>;

    /// Request cancellation. Must be a no-op for already-terminal jobs.
    async fn cancel_job(&self, job_id: &str) -> Result<()>;
}

/// Read-only accessor for document snapshots.
#[async_trait]
pub trait DocumentCatalog: Send + Sync {
    /// List every document in the knowledge base.
    async fn list_documents(&self) -> Result<Vec<Document>>;

    /// Fetch one document, or `None` if it does not exist.
    async fn get_document(&self, document_id: &DocumentId) -> Result<Option<Document>> {
        let documents = self.list_documents().await?;
        Ok(documents
            .into_iter()
            .find(|d| &d.document_id == document_id))
    }
}

/// Read-only accessor for knowledge-base metadata.
#[async_trait]
pub trait KnowledgeBaseMetadata: Send + Sync {
    /// Last time the tag dictionary changed, if it ever has.
    async fn tag_dictionary_updated_at(&self) -> Result<Option<DateTime<Utc>>>;
}
