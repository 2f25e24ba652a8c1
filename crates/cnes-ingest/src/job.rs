//! End-to-end ingestion job
//!
//! validate -> restore or create state -> waves -> enrichment -> report ->
//! checkpoint removal. An interrupted run stops after the scheduler and keeps
//! its checkpoint for `--resume`.

use crate::checkpoint::CheckpointStore;
use crate::config::IngestConfig;
use crate::enrichment::{Enricher, MergeStats};
use crate::fetcher::LookupClient;
use crate::progress::ProgressObserver;
use crate::reference::ReferenceIndex;
use crate::report::{write_report, Report, RunConfig, RunMetadata};
use crate::scheduler::WaveScheduler;
use crate::state::JobState;
use anyhow::{bail, Context, Result};
use chrono::Utc;
use cnes_common::types::{Counts, Identifier};
use std::path::{Path, PathBuf};
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

/// How a job ended
#[derive(Debug, Clone, PartialEq)]
pub struct JobOutcome {
    pub run_id: Uuid,
    pub counts: Counts,
    pub interrupted: bool,

    /// Where the report went; `None` when interrupted
    pub report_path: Option<PathBuf>,

    /// Checkpoint of this job; removed once the report is written
    pub checkpoint_path: PathBuf,

    pub merge: Option<MergeStats>,
}

/// One ingestion run over a list of identifiers
pub struct IngestJob<C> {
    config: IngestConfig,
    client: C,
    shutdown: CancellationToken,
    resume_from: Option<PathBuf>,
}

impl<C: LookupClient> IngestJob<C> {
    pub fn new(config: IngestConfig, client: C) -> Self {
        Self {
            config,
            client,
            shutdown: CancellationToken::new(),
            resume_from: None,
        }
    }

    pub fn with_shutdown(mut self, token: CancellationToken) -> Self {
        self.shutdown = token;
        self
    }

    /// Continue from a checkpoint written by an earlier run over the same input.
    pub fn with_resume(mut self, checkpoint: impl Into<PathBuf>) -> Self {
        self.resume_from = Some(checkpoint.into());
        self
    }

    pub async fn run(
        self,
        identifiers: &[Identifier],
        reference: &ReferenceIndex,
        output: &Path,
        observer: &mut dyn ProgressObserver,
    ) -> Result<JobOutcome> {
        self.config.validate().context("Invalid job configuration")?;

        let run_id = Uuid::new_v4();
        let every = self.config.wave.checkpoint_every;

        let (mut state, store) = match &self.resume_from {
            Some(path) => {
                let checkpoint = CheckpointStore::load(path)
                    .with_context(|| format!("Cannot resume from {}", path.display()))?;
                if checkpoint.state.total != identifiers.len() {
                    bail!(
                        "Checkpoint {} covers {} identifiers but the input has {}",
                        path.display(),
                        checkpoint.state.total,
                        identifiers.len()
                    );
                }
                if !checkpoint.state.covers_prefix_of(identifiers) {
                    bail!(
                        "Checkpoint {} was written for a different input: its {} settled identifiers do not match the start of this one",
                        path.display(),
                        checkpoint.state.done()
                    );
                }
                info!(
                    path = %path.display(),
                    done = checkpoint.counts.done,
                    total = checkpoint.counts.total,
                    "Resuming from checkpoint"
                );
                (checkpoint.state, CheckpointStore::at(path.clone(), every))
            },
            None => {
                let state = JobState::new(identifiers.len());
                let store = CheckpointStore::new(&self.config.checkpoint_dir, state.started_at, every);
                (state, store)
            },
        };

        info!(
            %run_id,
            identifiers = identifiers.len(),
            checkpoint = %store.path().display(),
            "Starting CNES ingestion"
        );

        let session = Instant::now();
        let scheduler = WaveScheduler::new(self.client, self.config.wave.clone())
            .with_checkpoint(store.clone())
            .with_shutdown(self.shutdown.clone());
        let schedule = scheduler.run(identifiers, &mut state, observer).await;

        let counts = state.counts();
        if schedule.is_interrupted() {
            warn!(
                done = counts.done,
                total = counts.total,
                checkpoint = %store.path().display(),
                "Run interrupted; resume with --resume"
            );
            return Ok(JobOutcome {
                run_id,
                counts,
                interrupted: true,
                report_path: None,
                checkpoint_path: store.path().to_path_buf(),
                merge: None,
            });
        }

        let elapsed = session.elapsed();
        let average_throughput = schedule.average_throughput;

        let enrichment = Enricher::new(reference, &self.config.join_field).merge(&state.successes);
        let merge = enrichment.stats.clone();
        info!(
            matched = merge.matched,
            missed = merge.missed,
            match_rate = %format!("{:.1}%", merge.match_rate()),
            "Enrichment complete"
        );

        let metadata = RunMetadata {
            run_id,
            started_at: state.started_at,
            finished_at: Utc::now(),
            duration_secs: elapsed.as_secs_f64(),
            resumed: self.resume_from.is_some(),
            complete: state.is_complete(),
            source_api: Some(self.config.fetch.base_url.clone()),
            total_identifiers: identifiers.len(),
            config: Some(RunConfig::new(&self.config, state.waves_completed, store.path())),
        };
        let report = Report::new(metadata, &state, enrichment, average_throughput);

        write_report(output, &report)
            .with_context(|| format!("Failed to write report to {}", output.display()))?;
        store.remove_logged();

        info!(
            succeeded = counts.succeeded,
            failed = counts.failed,
            success_rate = %format!("{:.1}%", report.summary.success_rate),
            throughput = %average_throughput
                .map(|t| format!("{:.1}/s", t))
                .unwrap_or_else(|| "n/a".to_string()),
            duration_secs = %format!("{:.1}", elapsed.as_secs_f64()),
            report = %output.display(),
            "CNES ingestion complete"
        );

        Ok(JobOutcome {
            run_id,
            counts,
            interrupted: false,
            report_path: Some(output.to_path_buf()),
            checkpoint_path: store.path().to_path_buf(),
            merge: Some(merge),
        })
    }
}

/// Rebuild a report from the successes stored in a checkpoint.
pub fn enrich_checkpoint(
    checkpoint: &Path,
    reference: &ReferenceIndex,
    join_field: &str,
    output: &Path,
) -> Result<MergeStats> {
    let started = Instant::now();
    let saved = CheckpointStore::load(checkpoint)
        .with_context(|| format!("Cannot read checkpoint {}", checkpoint.display()))?;
    let state = saved.state;

    if !state.is_complete() {
        warn!(
            done = state.done(),
            total = state.total,
            "Checkpoint is partial; the report only covers settled identifiers"
        );
    }

    let enrichment = Enricher::new(reference, join_field).merge(&state.successes);
    let merge = enrichment.stats.clone();

    let metadata = RunMetadata {
        run_id: Uuid::new_v4(),
        started_at: state.started_at,
        finished_at: Utc::now(),
        duration_secs: started.elapsed().as_secs_f64(),
        resumed: true,
        complete: state.is_complete(),
        source_api: None,
        total_identifiers: state.total,
        config: None,
    };
    let report = Report::new(metadata, &state, enrichment, None);

    write_report(output, &report)
        .with_context(|| format!("Failed to write report to {}", output.display()))?;

    info!(
        records = report.records.len(),
        matched = merge.matched,
        missed = merge.missed,
        report = %output.display(),
        "Checkpoint enriched"
    );
    Ok(merge)
}
