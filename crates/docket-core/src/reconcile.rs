//! Catalog-wide reconciliation built on [`crate::status::resolve_status`].

use std::collections::HashMap;

use serde::Serialize;
use tracing::{debug, trace};

use crate::error::Result;
use crate::models::{Document, DocumentId, JobKind, JobSignal, KnowledgeBaseSignal, LifecycleState};
use crate::status::{resolve_status, Resolution, ResolverConfig};
use crate::traits::{DocumentCatalog, KnowledgeBaseMetadata};

/// Resolved status of one catalog document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DocumentStatus {
    pub document_id: DocumentId,
    #[serde(flatten)]
    pub resolution: Resolution,
}

/// Document counts per lifecycle state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatusSummary {
    counts: HashMap<LifecycleState, usize>,
}

impl StatusSummary {
    pub fn from_statuses(statuses: &[DocumentStatus]) -> Self {
        let mut counts = HashMap::new();
        for status in statuses {
            *counts.entry(status.resolution.state).or_insert(0) += 1;
        }
        Self { counts }
    }

    pub fn count(&self, state: LifecycleState) -> usize {
        self.counts.get(&state).copied().unwrap_or(0)
    }

    pub fn total(&self) -> usize {
        self.counts.values().sum()
    }

    /// Non-zero counts in [`LifecycleState::ALL`] order.
    pub fn iter(&self) -> impl Iterator<Item = (LifecycleState, usize)> + '_ {
        LifecycleState::ALL
            .into_iter()
            .map(|s| (s, self.count(s)))
            .filter(|(_, n)| *n > 0)
    }
}

/// A job a document needs in order to become current.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RefreshItem {
    pub document_id: DocumentId,
    pub kind: JobKind,
    pub reason: LifecycleState,
}

/// Resolve every document with the signals that belong to it.
pub fn resolve_catalog(
    documents: &[Document],
    signals: &[JobSignal],
    kb: &KnowledgeBaseSignal,
    config: &ResolverConfig,
) -> Vec<DocumentStatus> {
    let mut by_document: HashMap<&str, Vec<JobSignal>> = HashMap::new();
    for signal in signals {
        by_document
            .entry(signal.document_id.as_str())
            .or_default()
            .push(signal.clone());
    }

    documents
        .iter()
        .map(|doc| {
            let own = by_document
                .get(doc.document_id.as_str())
                .map(Vec::as_slice)
                .unwrap_or(&[]);
            let resolution = resolve_status(doc, own, kb, config);
            trace!(document_id = %doc.document_id, state = ?resolution.state, "Resolved document");
            DocumentStatus {
                document_id: doc.document_id.clone(),
                resolution,
            }
        })
        .collect()
}

/// List the job each stale or unprocessed document needs.
///
/// Busy and up-to-date documents are skipped.
pub fn plan_refresh(statuses: &[DocumentStatus]) -> Vec<RefreshItem> {
    statuses
        .iter()
        .filter_map(|s| {
            let reason = s.resolution.state;
            reason.suggested_job().map(|kind| RefreshItem {
                document_id: s.document_id.clone(),
                kind,
                reason,
            })
        })
        .collect()
}

/// Read the catalog and knowledge-base metadata, then resolve every document.
pub async fn reconcile(
    catalog: &dyn DocumentCatalog,
    kb: &dyn KnowledgeBaseMetadata,
    signals: &[JobSignal],
    config: &ResolverConfig,
) -> Result<Vec<DocumentStatus>> {
    let documents = catalog.list_documents().await?;
    let kb_signal = KnowledgeBaseSignal {
        tag_dictionary_updated_at: kb.tag_dictionary_updated_at().await?,
    };
    let statuses = resolve_catalog(&documents, signals, &kb_signal, config);
    debug!(
        document_count = statuses.len(),
        signal_count = signals.len(),
        "Catalog reconciled"
    );
    Ok(statuses)
}
