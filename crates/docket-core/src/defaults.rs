//! Centralized default constants for docket.
//!
//! **This module is the single source of truth** for shared default values.
//! Config types in every crate reference these constants instead of
//! defining their own magic numbers.

// =============================================================================
// JOB TRACKING
// =============================================================================

/// Interval between polls of a single in-flight job, in milliseconds.
pub const POLL_INTERVAL_MS: u64 = 2_000;

/// Consecutive failed polls tolerated before a job is reported as failed.
pub const MAX_CONSECUTIVE_POLL_FAILURES: u32 = 5;

/// Broadcast channel capacity for tracker and scheduler events.
pub const EVENT_BUS_CAPACITY: usize = 256;

/// Error message prefix used for synthetic failures caused by lost observability.
pub const TRANSPORT_FAILURE_PREFIX: &str = "transport error";

// =============================================================================
// BATCH SCHEDULING
// =============================================================================

/// Total slots per optimization round.
pub const BATCH_SIZE: usize = 10;

/// Slots per round reserved for abnormal documents.
pub const ABNORMAL_SLOTS: usize = 3;

/// Upper bound on optimization rounds per run.
pub const MAX_ITERATIONS: u32 = 5;

/// Abnormal-document percentage at or below which a run may stop early.
pub const ABNORMAL_DOC_THRESHOLD_PCT: f64 = 10.0;

/// Whether the threshold check is applied between rounds.
pub const ENABLE_EARLY_TERMINATION: bool = true;

/// Maximum wait for a single round to complete (10 minutes).
pub const ROUND_TIMEOUT_MS: u64 = 600_000;

/// Wait for a timed-out round to wind down after cancellation before giving up on it.
pub const ROUND_CANCEL_GRACE_MS: u64 = 5_000;
