//! Structured logging schema for docket.
//!
//! Every crate attaches work to one of the spans below so log queries can
//! filter by the same field names (`document_id`, `job_id`, `job_kind`,
//! `iteration`, ...) across the tracker, scheduler, and CLI.
//!
//! ## Log Level Contract
//!
//! | Level | Usage |
//! |-------|-------|
//! | ERROR | Degraded operation, requires attention |
//! | WARN  | Recoverable issue, automatic fallback applied |
//! | INFO  | Lifecycle events, job and round completions |
//! | DEBUG | Decision points, selections, config choices |
//! | TRACE | Per-poll and per-document noise |

use tracing::{info_span, Span};

use crate::models::JobKind;

/// Span covering the polling task of one tracked job.
pub fn job_span(job_id: &str, remote_job_id: &str, document_id: &str, kind: JobKind) -> Span {
    info_span!(
        "job",
        component = "tracker",
        job_id,
        remote_job_id,
        document_id,
        job_kind = %kind,
    )
}

/// Span covering a whole scheduler run.
pub fn run_span(batch_size: usize, abnormal_slots: usize, max_iterations: u32) -> Span {
    info_span!(
        "optimization_run",
        component = "scheduler",
        batch_size,
        abnormal_slots,
        max_iterations,
    )
}

/// Span covering one scheduler round.
pub fn round_span(iteration: u32) -> Span {
    info_span!("round", component = "scheduler", iteration)
}
