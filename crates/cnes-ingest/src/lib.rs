//! CNES Ingest Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Bulk lookup of CNES health establishments against the public open-data
//! API, followed by enrichment with municipality and health-region data.
//!
//! # Pipeline
//!
//! - [`input`]: load the establishment codes to look up
//! - [`reference`]: load the municipality reference dataset
//! - [`scheduler`]: dispatch lookups in rate-limited waves through a [`fetcher::LookupClient`]
//! - [`progress`]: live counters, throughput and ETA
//! - [`checkpoint`]: periodic crash-safe snapshots of the [`state::JobState`]
//! - [`enrichment`]: join successful records with the reference data
//! - [`report`]: write and verify the final document
//! - [`job`]: the whole run, end to end
//!
//! # Example
//!
//! ```no_run
//! use cnes_ingest::config::IngestConfig;
//! use cnes_ingest::fetcher::HttpLookupClient;
//! use cnes_ingest::job::IngestJob;
//! use cnes_ingest::progress::SilentProgress;
//! use cnes_ingest::{input, reference};
//! use std::path::Path;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = IngestConfig::new().with_concurrency(10);
//!     let identifiers = input::load_identifiers("codes.json")?;
//!     let regions = reference::load_reference("regions.json")?;
//!     let client = HttpLookupClient::new(&config.fetch, config.wave.concurrency)?;
//!
//!     let outcome = IngestJob::new(config, client)
//!         .run(&identifiers, &regions, Path::new("report.json"), &mut SilentProgress)
//!         .await?;
//!     println!("{} of {} found", outcome.counts.succeeded, outcome.counts.total);
//!     Ok(())
//! }
//! ```

pub mod checkpoint;
pub mod config;
pub mod enrichment;
pub mod fetcher;
pub mod input;
pub mod job;
pub mod progress;
pub mod reference;
pub mod report;
pub mod scheduler;
pub mod state;
