//! # docket-core
//!
//! Core types, status resolution, and collaborator traits for docket.
//!
//! This crate holds everything that does not need a runtime: the data
//! model, the error taxonomy, the pure lifecycle resolver, and the traits
//! through which the job tracker and batch scheduler reach remote systems.

pub mod defaults;
pub mod error;
pub mod logging;
pub mod models;
pub mod reconcile;
pub mod status;
pub mod traits;

// Re-export commonly used types at crate root
pub use error::{Error, Result};
pub use models::*;
pub use reconcile::{plan_refresh, reconcile, resolve_catalog, DocumentStatus, RefreshItem, StatusSummary};
pub use status::{resolve_status, Resolution, ResolverConfig, TaggingTracking};
pub use traits::*;
