//! Accumulated job state
//!
//! Owned by the coordinating flow only. Concurrent lookups hand their outcomes
//! back to it; nothing else mutates it, so no locking is involved.

use chrono::{DateTime, Utc};
use cnes_common::types::{Counts, FailureReason, Identifier, LookupFailure, LookupOutcome, Record};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// Results and counters of one ingestion job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobState {
    /// When the job was first started (kept across resumes)
    pub started_at: DateTime<Utc>,

    /// Number of identifiers in the job
    pub total: usize,

    /// Waves fully settled so far
    pub waves_completed: usize,

    /// Successful lookups, in completion order
    pub successes: Vec<Record>,

    /// Failed lookups, in completion order
    pub failures: Vec<LookupFailure>,
}

impl JobState {
    pub fn new(total: usize) -> Self {
        Self::started_at(total, Utc::now())
    }

    pub fn started_at(total: usize, started_at: DateTime<Utc>) -> Self {
        Self {
            started_at,
            total,
            waves_completed: 0,
            successes: Vec::new(),
            failures: Vec::new(),
        }
    }

    /// Append one outcome.
    ///
    /// Outcomes beyond `total` indicate a scheduler bug; they are still kept
    /// so nothing is lost, and the debug build asserts.
    pub fn record(&mut self, outcome: LookupOutcome) {
        debug_assert!(self.done() < self.total, "more outcomes than identifiers");

        match outcome {
            LookupOutcome::Success(record) => self.successes.push(record),
            LookupOutcome::Failure(failure) => self.failures.push(failure),
        }
    }

    pub fn complete_wave(&mut self) {
        self.waves_completed += 1;
    }

    pub fn done(&self) -> usize {
        self.successes.len() + self.failures.len()
    }

    pub fn counts(&self) -> Counts {
        Counts {
            total: self.total,
            done: self.done(),
            succeeded: self.successes.len(),
            failed: self.failures.len(),
        }
    }

    pub fn is_complete(&self) -> bool {
        self.done() >= self.total
    }

    /// Failure counts grouped by reason
    pub fn failure_breakdown(&self) -> BTreeMap<FailureReason, usize> {
        let mut breakdown = BTreeMap::new();
        for failure in &self.failures {
            *breakdown.entry(failure.reason).or_insert(0) += 1;
        }
        breakdown
    }

    /// Whether the settled outcomes are exactly the first `done()` identifiers.
    ///
    /// Compared as a multiset since lookups within a wave settle in any order.
    pub fn covers_prefix_of(&self, identifiers: &[Identifier]) -> bool {
        if self.done() > identifiers.len() {
            return false;
        }

        let mut expected: HashMap<&str, usize> = HashMap::new();
        for identifier in &identifiers[..self.done()] {
            *expected.entry(identifier.as_str()).or_insert(0) += 1;
        }

        let settled = self
            .successes
            .iter()
            .map(|record| &record.metadata.identifier)
            .chain(self.failures.iter().map(|failure| &failure.identifier));
        for identifier in settled {
            match expected.get_mut(identifier.as_str()) {
                Some(count) if *count > 0 => *count -= 1,
                _ => return false,
            }
        }
        true
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use cnes_common::types::FetchMetadata;
    use proptest::prelude::*;

    fn success(id: &str) -> LookupOutcome {
        LookupOutcome::Success(Record::new(
            FetchMetadata {
                identifier: Identifier::new(id),
                url: format!("http://localhost/{}", id),
                fetched_at: Utc::now(),
            },
            serde_json::Map::new(),
        ))
    }

    fn failure(id: &str, reason: FailureReason) -> LookupOutcome {
        LookupOutcome::Failure(LookupFailure::new(Identifier::new(id), reason))
    }

    #[test]
    fn test_new_state_is_empty() {
        let state = JobState::new(3);
        assert_eq!(state.done(), 0);
        assert_eq!(state.waves_completed, 0);
        assert!(!state.is_complete());
        assert!(state.counts().is_consistent());
    }

    #[test]
    fn test_empty_job_is_complete() {
        assert!(JobState::new(0).is_complete());
    }

    #[test]
    fn test_record_routes_outcomes() {
        let mut state = JobState::new(3);
        state.record(success("A"));
        state.record(failure("B", FailureReason::NotFound));
        state.record(failure("C", FailureReason::Timeout));

        let counts = state.counts();
        assert_eq!(counts.done, 3);
        assert_eq!(counts.succeeded, 1);
        assert_eq!(counts.failed, 2);
        assert!(state.is_complete());

        let breakdown = state.failure_breakdown();
        assert_eq!(breakdown.get(&FailureReason::NotFound), Some(&1));
        assert_eq!(breakdown.get(&FailureReason::Timeout), Some(&1));
    }

    fn ids(values: &[&str]) -> Vec<Identifier> {
        values.iter().map(|v| Identifier::new(*v)).collect()
    }

    #[test]
    fn test_covers_prefix_ignores_order_within_wave() {
        let mut state = JobState::new(4);
        state.record(failure("B", FailureReason::NotFound));
        state.record(success("A"));

        assert!(state.covers_prefix_of(&ids(&["A", "B", "C", "D"])));
        assert!(state.covers_prefix_of(&ids(&["B", "A", "C", "D"])));
        assert!(!state.covers_prefix_of(&ids(&["X", "Y", "C", "D"])));
        assert!(!state.covers_prefix_of(&ids(&["A", "C", "B", "D"])));
        assert!(!state.covers_prefix_of(&ids(&["A"])));
    }

    #[test]
    fn test_covers_prefix_counts_duplicates() {
        let mut state = JobState::new(3);
        state.record(success("A"));
        state.record(success("A"));

        assert!(state.covers_prefix_of(&ids(&["A", "A", "B"])));
        assert!(!state.covers_prefix_of(&ids(&["A", "B", "A"])));
        assert!(JobState::new(2).covers_prefix_of(&ids(&["A", "B"])));
    }

    proptest! {
        #[test]
        fn counters_stay_consistent(outcomes in proptest::collection::vec(any::<bool>(), 0..200)) {
            let mut state = JobState::new(outcomes.len());
            for (i, ok) in outcomes.iter().enumerate() {
                let id = i.to_string();
                if *ok {
                    state.record(success(&id));
                } else {
                    state.record(failure(&id, FailureReason::HttpStatus));
                }
                prop_assert!(state.counts().is_consistent());
            }
            prop_assert_eq!(state.done(), outcomes.len());
        }
    }
}
