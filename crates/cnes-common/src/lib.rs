//! CNES Common Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Shared types, logging bootstrap, and error handling for the CNES ingest
//! workspace.
//!
//! # Overview
//!
//! - **Error Handling**: [`CnesError`] for fatal, caller-visible failures
//! - **Logging**: `tracing` subscriber setup driven by [`logging::LogConfig`]
//! - **Types**: identifiers, lookup outcomes, records and reference entries
//!
//! # Example
//!
//! ```no_run
//! use cnes_common::types::{Identifier, LookupOutcome};
//!
//! fn describe(outcome: &LookupOutcome) -> String {
//!     format!("{} -> success={}", outcome.identifier(), outcome.is_success())
//! }
//!
//! let id = Identifier::new("2077485");
//! assert_eq!(id.as_str(), "2077485");
//! ```

pub mod error;
pub mod logging;
pub mod types;

// Re-export commonly used types
pub use error::{CnesError, Result};
