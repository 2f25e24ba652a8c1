//! Wave scheduling of lookups
//!
//! Identifiers are split into consecutive waves of at most `concurrency`
//! items. All lookups of a wave run concurrently and the wave is a barrier:
//! the next one starts only after every outcome of the current one has been
//! recorded and the configured delay has elapsed. The delay is skipped after
//! the final wave.
//!
//! Outcomes flow back through a single stream into the coordinating task,
//! which is the only writer of [`JobState`].

use crate::checkpoint::CheckpointStore;
use crate::config::WaveConfig;
use crate::fetcher::LookupClient;
use crate::progress::{ProgressObserver, ProgressTracker};
use crate::state::JobState;
use cnes_common::types::Identifier;
use futures::stream::{self, StreamExt};
use std::ops::Range;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Partition of `total` items into waves of at most `concurrency`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WavePlan {
    total: usize,
    concurrency: usize,
}

impl WavePlan {
    pub fn new(total: usize, concurrency: usize) -> Self {
        Self {
            total,
            concurrency: concurrency.max(1),
        }
    }

    /// `ceil(total / concurrency)`
    pub fn wave_count(&self) -> usize {
        self.total.div_ceil(self.concurrency)
    }

    /// Index range of one wave (0-based) into the planned items
    pub fn wave_range(&self, wave: usize) -> Range<usize> {
        let start = (wave * self.concurrency).min(self.total);
        let end = (start + self.concurrency).min(self.total);
        start..end
    }

    pub fn wave_sizes(&self) -> Vec<usize> {
        (0..self.wave_count()).map(|w| self.wave_range(w).len()).collect()
    }
}

/// What happened in one wave
#[derive(Debug, Clone, PartialEq)]
pub struct WaveSummary {
    /// 1-based, counted across resumes
    pub number: usize,
    pub size: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub duration: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// Every identifier has an outcome
    Completed,
    /// Shutdown was requested; the state holds a clean prefix of the input
    Interrupted,
}

/// Result of a scheduler run
#[derive(Debug, Clone, PartialEq)]
pub struct ScheduleOutcome {
    pub stop: StopReason,
    pub waves: Vec<WaveSummary>,

    /// Items settled per second during this run
    pub average_throughput: Option<f64>,
}

impl ScheduleOutcome {
    pub fn is_interrupted(&self) -> bool {
        self.stop == StopReason::Interrupted
    }

    /// Waves executed during this run
    pub fn waves_run(&self) -> usize {
        self.waves.len()
    }
}

/// Dispatches lookups wave by wave
pub struct WaveScheduler<C> {
    client: C,
    config: WaveConfig,
    checkpoint: Option<CheckpointStore>,
    shutdown: CancellationToken,
}

impl<C: LookupClient> WaveScheduler<C> {
    pub fn new(client: C, config: WaveConfig) -> Self {
        Self {
            client,
            config,
            checkpoint: None,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn with_checkpoint(mut self, store: CheckpointStore) -> Self {
        self.checkpoint = Some(store);
        self
    }

    /// Stop at the next wave boundary once `token` is cancelled.
    pub fn with_shutdown(mut self, token: CancellationToken) -> Self {
        self.shutdown = token;
        self
    }

    pub fn client(&self) -> &C {
        &self.client
    }

    /// Look up every identifier not yet present in `state`.
    ///
    /// `state` must describe `identifiers` (same total). Identifiers already
    /// accounted for are the first `state.done()` ones, since waves settle
    /// in input order.
    pub async fn run(
        &self,
        identifiers: &[Identifier],
        state: &mut JobState,
        observer: &mut dyn ProgressObserver,
    ) -> ScheduleOutcome {
        debug_assert_eq!(state.total, identifiers.len(), "state does not match input");

        let pending = &identifiers[state.done().min(identifiers.len())..];
        let plan = WavePlan::new(pending.len(), self.config.concurrency);
        let first_wave = state.waves_completed;
        let total_waves = first_wave + plan.wave_count();

        info!(
            pending = pending.len(),
            already_done = state.done(),
            waves = plan.wave_count(),
            concurrency = self.config.concurrency,
            delay_ms = self.config.delay.as_millis() as u64,
            "Dispatching lookups"
        );

        let mut tracker = ProgressTracker::new(state.counts(), total_waves);
        observer.on_progress(tracker.snapshot());

        let mut stop = StopReason::Completed;
        let mut waves = Vec::with_capacity(plan.wave_count());
        let mut last_saved = None;

        for index in 0..plan.wave_count() {
            if self.shutdown.is_cancelled() {
                stop = StopReason::Interrupted;
                break;
            }

            let batch = &pending[plan.wave_range(index)];
            let number = first_wave + index + 1;
            let started = Instant::now();
            let (mut succeeded, mut failed) = (0, 0);

            let mut outcomes = stream::iter(batch)
                .map(|identifier| self.client.lookup(identifier))
                .buffer_unordered(batch.len());

            while let Some(outcome) = outcomes.next().await {
                if outcome.is_success() {
                    succeeded += 1;
                } else {
                    failed += 1;
                }
                state.record(outcome);
                observer.on_progress(tracker.update(state.counts(), number));
            }

            state.complete_wave();
            let summary = WaveSummary {
                number,
                size: batch.len(),
                succeeded,
                failed,
                duration: started.elapsed(),
            };
            debug!(
                wave = summary.number,
                total_waves,
                size = summary.size,
                succeeded = summary.succeeded,
                failed = summary.failed,
                duration_ms = summary.duration.as_millis() as u64,
                "Wave complete"
            );
            observer.on_wave_complete(&summary);
            waves.push(summary);

            if let Some(store) = &self.checkpoint {
                if store.should_checkpoint(state.waves_completed) {
                    store.save_logged(state);
                    last_saved = Some(state.waves_completed);
                }
            }

            let is_last = index + 1 == plan.wave_count();
            if !is_last && !self.config.delay.is_zero() {
                tokio::select! {
                    _ = tokio::time::sleep(self.config.delay) => {},
                    _ = self.shutdown.cancelled() => {
                        stop = StopReason::Interrupted;
                        break;
                    },
                }
            }
        }

        if stop == StopReason::Interrupted {
            let counts = state.counts();
            warn!(
                done = counts.done,
                total = counts.total,
                "Shutdown requested; stopped at a wave boundary"
            );
        }

        if let Some(store) = &self.checkpoint {
            if !waves.is_empty() && last_saved != Some(state.waves_completed) {
                store.save_logged(state);
            }
        }

        observer.on_finish(tracker.update(state.counts(), state.waves_completed));

        ScheduleOutcome {
            stop,
            waves,
            average_throughput: tracker.average_throughput(),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::progress::ProgressSnapshot;
    use async_trait::async_trait;
    use chrono::Utc;
    use cnes_common::types::{FailureReason, FetchMetadata, LookupFailure, LookupOutcome, Record};
    use proptest::prelude::*;
    use std::collections::{HashMap, HashSet};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tokio::time::Instant as TokioInstant;

    /// Answers from a fixed script, tracking concurrency and timing
    #[derive(Default)]
    struct ScriptedClient {
        missing: HashSet<String>,
        latency_ms: HashMap<String, u64>,
        in_flight: AtomicUsize,
        peak: AtomicUsize,
        spans: Mutex<Vec<(String, TokioInstant, TokioInstant)>>,
    }

    impl ScriptedClient {
        fn missing(mut self, ids: &[&str]) -> Self {
            self.missing = ids.iter().map(|s| s.to_string()).collect();
            self
        }

        fn latency(mut self, id: &str, ms: u64) -> Self {
            self.latency_ms.insert(id.to_string(), ms);
            self
        }

        fn requested(&self) -> Vec<String> {
            let mut ids: Vec<String> = self.spans.lock().unwrap().iter().map(|s| s.0.clone()).collect();
            ids.sort();
            ids
        }

        fn span(&self, id: &str) -> (TokioInstant, TokioInstant) {
            let spans = self.spans.lock().unwrap();
            let span = spans.iter().find(|s| s.0 == id).unwrap();
            (span.1, span.2)
        }
    }

    #[async_trait]
    impl LookupClient for ScriptedClient {
        async fn lookup(&self, identifier: &Identifier) -> LookupOutcome {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            let start = TokioInstant::now();

            if let Some(ms) = self.latency_ms.get(identifier.as_str()) {
                tokio::time::sleep(Duration::from_millis(*ms)).await;
            }

            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            self.spans
                .lock()
                .unwrap()
                .push((identifier.to_string(), start, TokioInstant::now()));

            if self.missing.contains(identifier.as_str()) {
                LookupOutcome::Failure(
                    LookupFailure::new(identifier.clone(), FailureReason::NotFound).with_status(404),
                )
            } else {
                LookupOutcome::Success(Record::new(
                    FetchMetadata {
                        identifier: identifier.clone(),
                        url: format!("http://mock/{}", identifier),
                        fetched_at: Utc::now(),
                    },
                    serde_json::Map::new(),
                ))
            }
        }
    }

    /// Collects notifications; optionally cancels after a given wave
    #[derive(Default)]
    struct RecordingObserver {
        snapshots: Vec<ProgressSnapshot>,
        waves: Vec<WaveSummary>,
        finished: Option<ProgressSnapshot>,
        cancel_after: Option<(usize, CancellationToken)>,
    }

    impl ProgressObserver for RecordingObserver {
        fn on_progress(&mut self, snapshot: &ProgressSnapshot) {
            self.snapshots.push(snapshot.clone());
        }

        fn on_wave_complete(&mut self, summary: &WaveSummary) {
            self.waves.push(summary.clone());
            if let Some((wave, token)) = &self.cancel_after {
                if summary.number == *wave {
                    token.cancel();
                }
            }
        }

        fn on_finish(&mut self, snapshot: &ProgressSnapshot) {
            self.finished = Some(snapshot.clone());
        }
    }

    fn ids(values: &[&str]) -> Vec<Identifier> {
        values.iter().map(|v| Identifier::new(*v)).collect()
    }

    #[test]
    fn test_wave_plan_shapes() {
        assert_eq!(WavePlan::new(5, 2).wave_sizes(), vec![2, 2, 1]);
        assert_eq!(WavePlan::new(4, 2).wave_sizes(), vec![2, 2]);
        assert_eq!(WavePlan::new(0, 3).wave_count(), 0);
        assert_eq!(WavePlan::new(3, 10).wave_sizes(), vec![3]);
        assert_eq!(WavePlan::new(5, 2).wave_range(2), 4..5);
    }

    proptest! {
        #[test]
        fn wave_plan_covers_every_item(total in 0usize..500, concurrency in 1usize..40) {
            let plan = WavePlan::new(total, concurrency);
            let sizes = plan.wave_sizes();

            prop_assert_eq!(sizes.len(), total.div_ceil(concurrency));
            prop_assert_eq!(sizes.iter().sum::<usize>(), total);
            prop_assert!(sizes.iter().all(|s| *s >= 1 && *s <= concurrency));
            if let Some((_, init)) = sizes.split_last() {
                prop_assert!(init.iter().all(|s| *s == concurrency));
            }
        }
    }

    #[tokio::test]
    async fn test_run_settles_every_identifier() {
        let input = ids(&["A", "B", "C", "D", "E"]);
        let client = ScriptedClient::default().missing(&["B", "D"]);
        let scheduler = WaveScheduler::new(client, WaveConfig::new(2, Duration::ZERO));

        let mut state = JobState::new(input.len());
        let mut observer = RecordingObserver::default();
        let outcome = scheduler.run(&input, &mut state, &mut observer).await;

        assert_eq!(outcome.stop, StopReason::Completed);
        assert_eq!(
            outcome.waves.iter().map(|w| w.size).collect::<Vec<_>>(),
            vec![2, 2, 1]
        );
        assert_eq!(state.counts().done, 5);
        assert_eq!(state.counts().succeeded, 3);
        assert_eq!(state.counts().failed, 2);
        assert_eq!(state.waves_completed, 3);
        assert_eq!(scheduler.client().requested(), vec!["A", "B", "C", "D", "E"]);

        // one initial snapshot plus one per outcome
        assert_eq!(observer.snapshots.len(), 6);
        assert!(observer.snapshots.iter().all(|s| s.counts.is_consistent()));
        assert_eq!(observer.finished.unwrap().counts.done, 5);
    }

    #[tokio::test]
    async fn test_wave_of_failures_still_advances() {
        let input = ids(&["A", "B", "C", "D", "E"]);
        let client = ScriptedClient::default().missing(&["A", "B"]);
        let scheduler = WaveScheduler::new(client, WaveConfig::new(2, Duration::ZERO));

        let mut state = JobState::new(input.len());
        let outcome = scheduler
            .run(&input, &mut state, &mut RecordingObserver::default())
            .await;

        assert_eq!(outcome.stop, StopReason::Completed);
        assert_eq!(outcome.waves_run(), 3);
        assert_eq!(outcome.waves[0].succeeded, 0);
        assert_eq!(outcome.waves[0].failed, 2);
        assert_eq!(state.counts().succeeded, 3);
        assert_eq!(state.counts().failed, 2);
        assert_eq!(scheduler.client().requested(), vec!["A", "B", "C", "D", "E"]);
    }

    #[tokio::test]
    async fn test_unwritable_checkpoint_does_not_stop_run() {
        let dir = tempfile::TempDir::new().unwrap();
        // a non-empty directory in place of the checkpoint file
        let target = dir.path().join("cp.json");
        std::fs::create_dir(&target).unwrap();
        std::fs::write(target.join("keep"), b"x").unwrap();

        let input = ids(&["A", "B", "C", "D", "E"]);
        let scheduler = WaveScheduler::new(
            ScriptedClient::default().missing(&["D"]),
            WaveConfig::new(2, Duration::ZERO),
        )
        .with_checkpoint(CheckpointStore::at(&target, 1));

        let mut state = JobState::new(input.len());
        let outcome = scheduler
            .run(&input, &mut state, &mut RecordingObserver::default())
            .await;

        assert_eq!(outcome.stop, StopReason::Completed);
        assert_eq!(outcome.waves_run(), 3);
        assert_eq!(state.counts().done, state.counts().total);
        assert!(target.is_dir());
    }

    #[tokio::test]
    async fn test_empty_input_runs_no_waves() {
        let scheduler = WaveScheduler::new(ScriptedClient::default(), WaveConfig::default());
        let mut state = JobState::new(0);
        let outcome = scheduler
            .run(&[], &mut state, &mut RecordingObserver::default())
            .await;

        assert_eq!(outcome.stop, StopReason::Completed);
        assert_eq!(outcome.waves_run(), 0);
        assert!(state.is_complete());
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrency_never_exceeds_limit() {
        let input: Vec<Identifier> = (0..23).map(|i| Identifier::new(i.to_string())).collect();
        let mut client = ScriptedClient::default();
        for id in &input {
            client = client.latency(id.as_str(), 50);
        }
        let scheduler = WaveScheduler::new(client, WaveConfig::new(4, Duration::ZERO));

        let mut state = JobState::new(input.len());
        scheduler
            .run(&input, &mut state, &mut RecordingObserver::default())
            .await;

        assert_eq!(scheduler.client().peak.load(Ordering::SeqCst), 4);
        assert_eq!(state.counts().done, 23);
    }

    #[tokio::test(start_paused = true)]
    async fn test_waves_are_barriers() {
        let input = ids(&["A", "B", "C", "D"]);
        // A is slow, so C and D must wait for it
        let client = ScriptedClient::default()
            .latency("A", 500)
            .latency("B", 10)
            .latency("C", 10)
            .latency("D", 10);
        let scheduler = WaveScheduler::new(client, WaveConfig::new(2, Duration::ZERO));

        let mut state = JobState::new(input.len());
        scheduler
            .run(&input, &mut state, &mut RecordingObserver::default())
            .await;

        let client = scheduler.client();
        let (_, a_end) = client.span("A");
        let (_, b_end) = client.span("B");
        let (c_start, _) = client.span("C");
        let (d_start, _) = client.span("D");
        assert!(c_start >= a_end && c_start >= b_end);
        assert!(d_start >= a_end && d_start >= b_end);
    }

    #[tokio::test(start_paused = true)]
    async fn test_delay_skipped_after_last_wave() {
        let input = ids(&["A", "B", "C", "D", "E"]);
        let scheduler = WaveScheduler::new(
            ScriptedClient::default(),
            WaveConfig::new(2, Duration::from_secs(10)),
        );

        let started = TokioInstant::now();
        let mut state = JobState::new(input.len());
        scheduler
            .run(&input, &mut state, &mut RecordingObserver::default())
            .await;
        let elapsed = started.elapsed();

        // three waves, two delays
        assert!(elapsed >= Duration::from_secs(20));
        assert!(elapsed < Duration::from_secs(30));
    }

    #[tokio::test]
    async fn test_cancelled_before_start_runs_nothing() {
        let input = ids(&["A", "B", "C"]);
        let token = CancellationToken::new();
        token.cancel();
        let scheduler = WaveScheduler::new(ScriptedClient::default(), WaveConfig::new(2, Duration::ZERO))
            .with_shutdown(token);

        let mut state = JobState::new(input.len());
        let outcome = scheduler
            .run(&input, &mut state, &mut RecordingObserver::default())
            .await;

        assert!(outcome.is_interrupted());
        assert_eq!(outcome.waves_run(), 0);
        assert_eq!(state.done(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_delay_stops_at_boundary() {
        let input = ids(&["A", "B", "C", "D", "E"]);
        let token = CancellationToken::new();
        let scheduler = WaveScheduler::new(
            ScriptedClient::default(),
            WaveConfig::new(2, Duration::from_secs(3600)),
        )
        .with_shutdown(token.clone());

        let mut observer = RecordingObserver {
            cancel_after: Some((1, token)),
            ..Default::default()
        };
        let mut state = JobState::new(input.len());
        let outcome = scheduler.run(&input, &mut state, &mut observer).await;

        assert!(outcome.is_interrupted());
        assert_eq!(outcome.waves_run(), 1);
        assert_eq!(state.done(), 2);
        assert_eq!(state.waves_completed, 1);
    }

    #[tokio::test]
    async fn test_resume_skips_settled_prefix() {
        let input = ids(&["A", "B", "C", "D", "E"]);

        let first = WaveScheduler::new(ScriptedClient::default(), WaveConfig::new(2, Duration::ZERO));
        let mut partial = JobState::new(2);
        first
            .run(&input[..2], &mut partial, &mut RecordingObserver::default())
            .await;

        let mut state = JobState::started_at(input.len(), partial.started_at);
        state.successes = partial.successes;
        state.waves_completed = partial.waves_completed;

        let second = WaveScheduler::new(ScriptedClient::default(), WaveConfig::new(2, Duration::ZERO));
        let mut observer = RecordingObserver::default();
        let outcome = second.run(&input, &mut state, &mut observer).await;

        assert_eq!(second.client().requested(), vec!["C", "D", "E"]);
        assert_eq!(state.counts().done, 5);
        assert_eq!(outcome.waves.first().unwrap().number, 2);
        assert_eq!(observer.snapshots.first().unwrap().total_waves, 3);
    }

    #[tokio::test]
    async fn test_checkpoints_follow_cadence_and_final_state() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = CheckpointStore::at(dir.path().join("cp.json"), 2);
        let input = ids(&["A", "B", "C", "D", "E"]);
        let scheduler = WaveScheduler::new(
            ScriptedClient::default().missing(&["C"]),
            WaveConfig::new(1, Duration::ZERO),
        )
        .with_checkpoint(store.clone());

        let mut state = JobState::new(input.len());
        scheduler
            .run(&input, &mut state, &mut RecordingObserver::default())
            .await;

        let saved = CheckpointStore::load(store.path()).unwrap();
        assert_eq!(saved.state, state);
        assert_eq!(saved.counts.done, 5);
        assert_eq!(saved.counts.failed, 1);
    }
}
