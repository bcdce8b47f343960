//! Catalog snapshot files read by `docket resolve`.
//!
//! ```json
//! {
//!   "tag_dictionary_updated_at": "2025-02-01T00:00:00Z",
//!   "documents": [
//!     { "document_id": "handbook", "chunk_count": 42, "last_ingest_time": "2025-01-20T10:00:00Z" }
//!   ],
//!   "signals": [
//!     { "document_id": "handbook", "kind": "tagging", "status": "running", "progress": 40,
//!       "updated_at": "2025-02-02T08:00:00Z" }
//!   ]
//! }
//! ```

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;

use docket_core::{Document, DocumentCatalog, JobSignal, KnowledgeBaseMetadata, Result};

/// A catalog exported to a JSON file.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CatalogSnapshot {
    #[serde(default)]
    pub tag_dictionary_updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub documents: Vec<Document>,
    /// Job signals recorded alongside the export.
    #[serde(default)]
    pub signals: Vec<JobSignal>,
}

impl CatalogSnapshot {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::parse(&raw)
    }

    pub fn parse(raw: &str) -> Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }

    /// Replace the recorded dictionary timestamp.
    pub fn with_tag_dictionary_updated_at(mut self, at: Option<DateTime<Utc>>) -> Self {
        if at.is_some() {
            self.tag_dictionary_updated_at = at;
        }
        self
    }
}

#[async_trait]
impl DocumentCatalog for CatalogSnapshot {
    async fn list_documents(&self) -> Result<Vec<Document>> {
        Ok(self.documents.clone())
    }
}

#[async_trait]
impl KnowledgeBaseMetadata for CatalogSnapshot {
    async fn tag_dictionary_updated_at(&self) -> Result<Option<DateTime<Utc>>> {
        Ok(self.tag_dictionary_updated_at)
    }
}
