//! Candidate pools and per-round selection for the batch scheduler.

use std::collections::HashSet;
use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use docket_core::{DocumentId, Result};

/// Why the tagging-quality process flagged a document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AbnormalReason {
    UnderAnnotated,
    OverAnnotated,
    /// Tags do not distinguish the document from its neighbours
    Indistinguishable,
    /// Needs an initial tagging pass before quality can be judged
    ColdStart,
}

impl fmt::Display for AbnormalReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AbnormalReason::UnderAnnotated => "under_annotated",
            AbnormalReason::OverAnnotated => "over_annotated",
            AbnormalReason::Indistinguishable => "indistinguishable",
            AbnormalReason::ColdStart => "cold_start",
        };
        f.write_str(s)
    }
}

/// A document flagged abnormal, waiting for an abnormal slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AbnormalCandidate {
    pub document_id: DocumentId,
    pub flagged_at: DateTime<Utc>,
    pub reason: AbnormalReason,
}

/// Snapshot of both candidate pools.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidatePool {
    /// Flagged documents, in any order.
    pub abnormal: Vec<AbnormalCandidate>,
    /// Every document eligible for the normal lane, in pool order.
    pub documents: Vec<DocumentId>,
}

impl CandidatePool {
    /// Distinct abnormal ids over distinct ids across both lists, in 0.0..=1.0.
    /// An empty pool has ratio 0.
    pub fn abnormal_ratio(&self) -> f64 {
        let abnormal: HashSet<&str> = self
            .abnormal
            .iter()
            .map(|c| c.document_id.as_str())
            .collect();
        let mut all: HashSet<&str> = abnormal.clone();
        all.extend(self.documents.iter().map(String::as_str));
        if all.is_empty() {
            return 0.0;
        }
        abnormal.len() as f64 / all.len() as f64
    }

    pub fn is_flagged(&self, document_id: &str) -> bool {
        self.abnormal.iter().any(|c| c.document_id == document_id)
    }
}

/// Documents drawn for one round, lane by lane.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoundSelection {
    pub iteration: u32,
    pub abnormal: Vec<DocumentId>,
    pub normal: Vec<DocumentId>,
}

impl RoundSelection {
    /// Abnormal lane first, then normal.
    pub fn all(&self) -> Vec<DocumentId> {
        self.abnormal.iter().chain(&self.normal).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.abnormal.len() + self.normal.len()
    }

    pub fn is_empty(&self) -> bool {
        self.abnormal.is_empty() && self.normal.is_empty()
    }
}

/// Draw one round from the pool.
///
/// The abnormal lane takes the oldest-flagged candidates first (stable on
/// ties). The normal lane walks `documents` in order, skipping anything in
/// `processed` or currently flagged. Lanes never borrow each other's slots.
pub fn draw_round(
    pool: &CandidatePool,
    iteration: u32,
    abnormal_slots: usize,
    normal_slots: usize,
    processed: &HashSet<DocumentId>,
) -> RoundSelection {
    let mut flagged: Vec<&AbnormalCandidate> = pool.abnormal.iter().collect();
    flagged.sort_by_key(|c| c.flagged_at);

    let mut taken: HashSet<&str> = HashSet::new();
    let mut abnormal = Vec::with_capacity(abnormal_slots);
    for candidate in flagged {
        if abnormal.len() >= abnormal_slots {
            break;
        }
        if taken.insert(candidate.document_id.as_str()) {
            abnormal.push(candidate.document_id.clone());
        }
    }

    let mut normal = Vec::with_capacity(normal_slots);
    for document_id in &pool.documents {
        if normal.len() >= normal_slots {
            break;
        }
        if processed.contains(document_id) || pool.is_flagged(document_id) {
            continue;
        }
        if taken.insert(document_id.as_str()) {
            normal.push(document_id.clone());
        }
    }

    RoundSelection {
        iteration,
        abnormal,
        normal,
    }
}

/// Supplies the current candidate pools.
///
/// The reconciliation layer owns the pools; the scheduler re-reads them
/// before each draw and again after each round.
#[async_trait]
pub trait CandidateSource: Send + Sync {
    async fn snapshot(&self) -> Result<CandidatePool>;
}
