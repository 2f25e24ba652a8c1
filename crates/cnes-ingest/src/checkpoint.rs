//! Incremental checkpoints of the job state
//!
//! A checkpoint is the full [`JobState`] wrapped with a small header. It is
//! written atomically (temporary file, then rename) so a crash mid-write never
//! leaves a truncated checkpoint behind.

use crate::state::JobState;
use chrono::{DateTime, Utc};
use cnes_common::types::Counts;
use cnes_common::{CnesError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Format version written into every checkpoint
pub const CHECKPOINT_VERSION: u32 = 1;

/// Checkpoint document as read back from disk
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub version: u32,
    pub written_at: DateTime<Utc>,
    pub counts: Counts,
    pub state: JobState,
}

#[derive(Serialize)]
struct CheckpointRef<'a> {
    version: u32,
    written_at: DateTime<Utc>,
    counts: Counts,
    state: &'a JobState,
}

/// Location and cadence of a job's checkpoint file
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    path: PathBuf,
    every: usize,
}

impl CheckpointStore {
    /// Store for a new job: `{dir}/cnes_backup_{YYYYmmdd_HHMMSS}.json`
    pub fn new(dir: impl AsRef<Path>, started_at: DateTime<Utc>, every: usize) -> Self {
        Self::at(dir.as_ref().join(Self::file_name(started_at)), every)
    }

    /// Store writing to an explicit path (used when resuming)
    pub fn at(path: impl Into<PathBuf>, every: usize) -> Self {
        Self {
            path: path.into(),
            every: every.max(1),
        }
    }

    pub fn file_name(started_at: DateTime<Utc>) -> String {
        format!("cnes_backup_{}.json", started_at.format("%Y%m%d_%H%M%S"))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether a checkpoint is due after `waves_completed` waves.
    pub fn should_checkpoint(&self, waves_completed: usize) -> bool {
        waves_completed > 0 && waves_completed % self.every == 0
    }

    /// Persist the state atomically.
    pub fn save(&self, state: &JobState) -> Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        let document = CheckpointRef {
            version: CHECKPOINT_VERSION,
            written_at: Utc::now(),
            counts: state.counts(),
            state,
        };
        let content = serde_json::to_vec(&document)?;

        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, content)?;
        std::fs::rename(&tmp, &self.path)?;

        Ok(())
    }

    /// Save, logging instead of failing. Returns whether the write succeeded.
    pub fn save_logged(&self, state: &JobState) -> bool {
        let counts = state.counts();
        match self.save(state) {
            Ok(()) => {
                info!(
                    path = %self.path.display(),
                    done = counts.done,
                    total = counts.total,
                    succeeded = counts.succeeded,
                    failed = counts.failed,
                    "Checkpoint saved"
                );
                true
            },
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Failed to write checkpoint; continuing");
                false
            },
        }
    }

    /// Load and validate a checkpoint.
    pub fn load(path: impl AsRef<Path>) -> Result<Checkpoint> {
        let path = path.as_ref();
        let content = std::fs::read(path).map_err(|e| {
            CnesError::checkpoint(format!("cannot read '{}': {}", path.display(), e))
        })?;
        let checkpoint: Checkpoint = serde_json::from_slice(&content).map_err(|e| {
            CnesError::checkpoint(format!("'{}' is not a valid checkpoint: {}", path.display(), e))
        })?;

        if checkpoint.version != CHECKPOINT_VERSION {
            return Err(CnesError::checkpoint(format!(
                "unsupported checkpoint version {} (expected {})",
                checkpoint.version, CHECKPOINT_VERSION
            )));
        }

        let counts = checkpoint.state.counts();
        if !counts.is_consistent() || counts != checkpoint.counts {
            return Err(CnesError::checkpoint(format!(
                "'{}' has inconsistent counters: header {:?}, state {:?}",
                path.display(),
                checkpoint.counts,
                counts
            )));
        }

        debug!(path = %path.display(), done = counts.done, total = counts.total, "Checkpoint loaded");
        Ok(checkpoint)
    }

    /// Delete the checkpoint; a missing file is not an error.
    pub fn remove(&self) -> Result<()> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Remove, logging instead of failing.
    pub fn remove_logged(&self) {
        match self.remove() {
            Ok(()) => debug!(path = %self.path.display(), "Checkpoint removed"),
            Err(e) => warn!(path = %self.path.display(), error = %e, "Failed to remove checkpoint"),
        }
    }
}
