//! Final report document
//!
//! The report is written as pretty JSON, read back and checked. If that
//! fails, a compact emergency copy is attempted next to the target before the
//! error is returned.

use crate::config::IngestConfig;
use crate::enrichment::{EnrichedRecord, Enrichment, MergeStats};
use crate::state::JobState;
use chrono::{DateTime, Utc};
use cnes_common::types::{FailureReason, LookupFailure};
use cnes_common::{CnesError, Result};
use serde::de::IgnoredAny;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};
use uuid::Uuid;

/// Settings the run was executed with
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    pub concurrency: usize,
    pub delay_secs: f64,
    pub checkpoint_every: usize,
    pub total_waves: usize,
    pub timeout_secs: f64,
    pub join_field: String,
    pub checkpoint_path: String,
}

impl RunConfig {
    pub fn new(config: &IngestConfig, total_waves: usize, checkpoint_path: &Path) -> Self {
        Self {
            concurrency: config.wave.concurrency,
            delay_secs: config.wave.delay.as_secs_f64(),
            checkpoint_every: config.wave.checkpoint_every,
            total_waves,
            timeout_secs: config.fetch.timeout.as_secs_f64(),
            join_field: config.join_field.clone(),
            checkpoint_path: checkpoint_path.display().to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunMetadata {
    pub run_id: Uuid,

    /// When the job first started; earlier than this run when resumed
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,

    /// Wall time of this run only
    pub duration_secs: f64,

    pub resumed: bool,

    /// Whether every identifier has an outcome
    pub complete: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_api: Option<String>,

    pub total_identifiers: usize,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub config: Option<RunConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportSummary {
    pub total: usize,
    pub successes: usize,
    pub failures: usize,

    /// Percentage of identifiers looked up successfully
    pub success_rate: f64,

    /// Items per second over this run
    pub average_throughput: Option<f64>,

    pub failure_breakdown: BTreeMap<FailureReason, usize>,
    pub merge: MergeStats,
}

/// Everything produced by one job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Report {
    pub metadata: RunMetadata,
    pub records: Vec<EnrichedRecord>,
    pub failures: Vec<LookupFailure>,
    pub summary: ReportSummary,
}

impl Report {
    pub fn new(
        metadata: RunMetadata,
        state: &JobState,
        enrichment: Enrichment,
        average_throughput: Option<f64>,
    ) -> Self {
        let counts = state.counts();
        let success_rate = if counts.total == 0 {
            0.0
        } else {
            counts.succeeded as f64 / counts.total as f64 * 100.0
        };

        Self {
            metadata,
            records: enrichment.records,
            failures: state.failures.clone(),
            summary: ReportSummary {
                total: counts.total,
                successes: counts.succeeded,
                failures: counts.failed,
                success_rate,
                average_throughput,
                failure_breakdown: state.failure_breakdown(),
                merge: enrichment.stats,
            },
        }
    }
}

#[derive(Deserialize)]
struct WrittenShape {
    records: Vec<IgnoredAny>,
    failures: Vec<IgnoredAny>,
}

/// `{stem}_emergency.json` next to `path`
pub fn emergency_path(path: &Path) -> PathBuf {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "report".to_string());
    path.with_file_name(format!("{}_emergency.json", stem))
}

/// Write and verify the report.
///
/// On failure an emergency copy is attempted and the original error is
/// returned either way.
pub fn write_report(path: impl AsRef<Path>, report: &Report) -> Result<()> {
    let path = path.as_ref();

    match write_verified(path, report) {
        Ok(bytes) => {
            info!(
                path = %path.display(),
                bytes,
                records = report.records.len(),
                failures = report.failures.len(),
                "Report written and verified"
            );
            Ok(())
        },
        Err(e) => {
            error!(path = %path.display(), error = %e, "Failed to write report");

            let emergency = emergency_path(path);
            match serde_json::to_vec(report)
                .map_err(CnesError::from)
                .and_then(|content| std::fs::write(&emergency, content).map_err(CnesError::from))
            {
                Ok(()) => warn!(path = %emergency.display(), "Emergency copy of the report written"),
                Err(e2) => error!(path = %emergency.display(), error = %e2, "Emergency copy failed too"),
            }

            Err(e)
        },
    }
}

fn write_verified(path: &Path, report: &Report) -> Result<usize> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }

    let content = serde_json::to_vec_pretty(report)?;
    std::fs::write(path, &content)?;

    let written: WrittenShape = serde_json::from_slice(&std::fs::read(path)?)?;
    if written.records.len() != report.records.len() || written.failures.len() != report.failures.len() {
        return Err(CnesError::report(format!(
            "verification failed: wrote {} records and {} failures, read back {} and {}",
            report.records.len(),
            report.failures.len(),
            written.records.len(),
            written.failures.len()
        )));
    }

    Ok(content.len())
}
