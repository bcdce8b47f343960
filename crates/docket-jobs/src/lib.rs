//! # docket-jobs
//!
//! Background job orchestration for docket.
//!
//! This crate provides:
//! - [`JobTracker`]: start/poll/cancel lifecycle of remote ingestion,
//!   tagging, and indexing jobs, with duplicate protection and change events
//! - [`BatchScheduler`]: multi-round optimization that splits a fixed batch
//!   between abnormal and normal documents and decides when to stop
//! - [`mock`]: deterministic in-memory collaborators for tests and demos
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use docket_core::JobKind;
//! use docket_jobs::{
//!     BatchScheduler, JobTracker, SchedulerConfig, StartOptions, TrackerConfig, TrackerExecutor,
//! };
//!
//! let tracker = JobTracker::new(service, TrackerConfig::from_env());
//! let handle = tracker.start(JobKind::Ingestion, "doc-42", StartOptions::default()).await?;
//! let finished = tracker.wait(&handle).await?;
//!
//! let executor = TrackerExecutor::new(tracker.clone(), JobKind::Tagging);
//! let scheduler = BatchScheduler::new(SchedulerConfig::from_env()?, candidates, Arc::new(executor));
//! let summary = scheduler.run().await?;
//! println!("stopped after {} rounds: {:?}", summary.rounds.len(), summary.reason);
//! ```

pub mod executor;
pub mod mock;
pub mod scheduler;
pub mod selection;
pub mod tracker;

// Re-export core types
pub use docket_core::*;

pub use executor::{RoundExecutor, RoundReport, TrackerExecutor};
pub use scheduler::{
    BatchRound, BatchScheduler, RunSummary, SchedulerConfig, SchedulerEvent, TerminationReason,
};
pub use selection::{
    draw_round, AbnormalCandidate, AbnormalReason, CandidatePool, CandidateSource, RoundSelection,
};
pub use tracker::{
    BatchStartReport, JobHandle, JobTracker, StartOptions, TrackerConfig, TrackerEvent,
    TrackerStats,
};
