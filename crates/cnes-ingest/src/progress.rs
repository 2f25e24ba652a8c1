//! Live progress: counters, rolling throughput and ETA
//!
//! [`ProgressTracker`] only derives numbers from the job counters. Display is
//! delegated to a [`ProgressObserver`] that the scheduler notifies after each
//! outcome, so the core never depends on a terminal.

use crate::scheduler::WaveSummary;
use cnes_common::types::Counts;
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Number of rate samples averaged into the reported throughput.
pub const RATE_WINDOW: usize = 10;

/// Status lines longer than this are truncated with an ellipsis.
pub const STATUS_LINE_MAX: usize = 120;

/// Estimated time to completion
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Eta {
    /// No throughput yet, or nothing to estimate against
    Unknown,
    Remaining(Duration),
}

impl std::fmt::Display for Eta {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Eta::Unknown => f.write_str("unknown"),
            Eta::Remaining(duration) => f.write_str(&format_hms(*duration)),
        }
    }
}

/// Point-in-time view of the job
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressSnapshot {
    pub counts: Counts,

    /// 1-based index of the wave in flight (0 before the first wave)
    pub wave: usize,
    pub total_waves: usize,

    /// Time since this run started
    pub elapsed: Duration,

    /// Items per second, `None` until it can be measured
    pub throughput: Option<f64>,
    pub eta: Eta,
}

impl ProgressSnapshot {
    /// Completion percentage; an empty job counts as complete.
    pub fn percent(&self) -> f64 {
        if self.counts.total == 0 {
            100.0
        } else {
            self.counts.done as f64 / self.counts.total as f64 * 100.0
        }
    }

    pub fn remaining(&self) -> usize {
        self.counts.remaining()
    }
}

/// Derives snapshots from job counters
#[derive(Debug)]
pub struct ProgressTracker {
    started: Instant,
    total_waves: usize,

    /// Items already done when this run started (non-zero on resume)
    baseline_done: usize,

    rates: VecDeque<f64>,
    current: ProgressSnapshot,
}

impl ProgressTracker {
    pub fn new(initial: Counts, total_waves: usize) -> Self {
        Self {
            started: Instant::now(),
            total_waves,
            baseline_done: initial.done,
            rates: VecDeque::with_capacity(RATE_WINDOW),
            current: ProgressSnapshot {
                counts: initial,
                wave: 0,
                total_waves,
                elapsed: Duration::ZERO,
                throughput: None,
                eta: Eta::Unknown,
            },
        }
    }

    /// Recompute the snapshot for the current counters.
    pub fn update(&mut self, counts: Counts, wave: usize) -> &ProgressSnapshot {
        let elapsed = self.started.elapsed();
        self.update_at(counts, wave, elapsed)
    }

    /// Same as [`update`](Self::update) with an explicit elapsed time.
    pub fn update_at(&mut self, counts: Counts, wave: usize, elapsed: Duration) -> &ProgressSnapshot {
        let secs = elapsed.as_secs_f64();
        if secs > 0.0 {
            let finished_this_run = counts.done.saturating_sub(self.baseline_done);
            if self.rates.len() == RATE_WINDOW {
                self.rates.pop_front();
            }
            self.rates.push_back(finished_this_run as f64 / secs);
        }

        let throughput = mean(&self.rates).filter(|rate| *rate > 0.0 && rate.is_finite());
        let eta = estimate(counts, throughput);

        self.current = ProgressSnapshot {
            counts,
            wave,
            total_waves: self.total_waves,
            elapsed,
            throughput,
            eta,
        };
        &self.current
    }

    pub fn snapshot(&self) -> &ProgressSnapshot {
        &self.current
    }

    /// Average items per second over the whole run, if measurable
    pub fn average_throughput(&self) -> Option<f64> {
        let secs = self.started.elapsed().as_secs_f64();
        let finished = self.current.counts.done.saturating_sub(self.baseline_done);
        (secs > 0.0).then(|| finished as f64 / secs)
    }
}

fn mean(samples: &VecDeque<f64>) -> Option<f64> {
    if samples.is_empty() {
        None
    } else {
        Some(samples.iter().sum::<f64>() / samples.len() as f64)
    }
}

fn estimate(counts: Counts, throughput: Option<f64>) -> Eta {
    match throughput {
        Some(rate) if counts.total > 0 => Duration::try_from_secs_f64(counts.remaining() as f64 / rate)
            .map(Eta::Remaining)
            .unwrap_or(Eta::Unknown),
        _ => Eta::Unknown,
    }
}

/// `H:MM:SS`, whole seconds
pub fn format_hms(duration: Duration) -> String {
    let secs = duration.as_secs();
    format!("{}:{:02}:{:02}", secs / 3600, (secs % 3600) / 60, secs % 60)
}

/// One-line textual rendering of a snapshot, capped at [`STATUS_LINE_MAX`] characters.
pub fn format_status_line(snapshot: &ProgressSnapshot) -> String {
    let rate = match snapshot.throughput {
        Some(rate) => format!("{:.1}/s", rate),
        None => "--/s".to_string(),
    };

    let line = format!(
        "{}/{} ({:.1}%) | left {} | {} | ETA {} | wave {}/{} | ok {} fail {}",
        snapshot.counts.done,
        snapshot.counts.total,
        snapshot.percent(),
        snapshot.remaining(),
        rate,
        snapshot.eta,
        snapshot.wave,
        snapshot.total_waves,
        snapshot.counts.succeeded,
        snapshot.counts.failed,
    );

    if line.chars().count() > STATUS_LINE_MAX {
        let mut truncated: String = line.chars().take(STATUS_LINE_MAX - 3).collect();
        truncated.push_str("...");
        truncated
    } else {
        line
    }
}

// ============================================================================
// Observers
// ============================================================================

/// Receives progress notifications from the scheduler.
///
/// Implementations must not feed anything back into the job; rendering the
/// same snapshot twice has no effect on the counters.
pub trait ProgressObserver {
    fn on_progress(&mut self, snapshot: &ProgressSnapshot);

    fn on_wave_complete(&mut self, _summary: &WaveSummary) {}

    fn on_finish(&mut self, _snapshot: &ProgressSnapshot) {}
}

/// Observer that renders nothing
#[derive(Debug, Default)]
pub struct SilentProgress;

impl ProgressObserver for SilentProgress {
    fn on_progress(&mut self, _snapshot: &ProgressSnapshot) {}
}

/// Terminal progress bar with a status line
pub struct TerminalProgress {
    bar: ProgressBar,
}

impl TerminalProgress {
    pub fn new(total: u64, message: &str) -> Self {
        Self::with_bar(ProgressBar::new(total), message)
    }

    /// A bar that tracks state but never draws
    pub fn hidden(total: u64) -> Self {
        Self::with_bar(
            ProgressBar::with_draw_target(Some(total), ProgressDrawTarget::hidden()),
            "",
        )
    }

    fn with_bar(bar: ProgressBar, message: &str) -> Self {
        let style = ProgressStyle::default_bar()
            .template("{prefix}\n{spinner:.green} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("#>-");
        bar.set_style(style);
        bar.set_prefix(message.to_string());
        Self { bar }
    }

    pub fn position(&self) -> u64 {
        self.bar.position()
    }
}

impl ProgressObserver for TerminalProgress {
    fn on_progress(&mut self, snapshot: &ProgressSnapshot) {
        self.bar.set_length(snapshot.counts.total as u64);
        self.bar.set_position(snapshot.counts.done as u64);
        self.bar.set_message(format_status_line(snapshot));
    }

    fn on_finish(&mut self, snapshot: &ProgressSnapshot) {
        self.on_progress(snapshot);
        self.bar.finish();
    }
}
