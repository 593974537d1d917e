//! Append-only store of completed experiments.
//!
//! The [`HistoryStore`] is the optimizer's sole training signal, so it is
//! tamper-proof by construction: records can only be appended, never edited
//! or deleted, and identifiers increase monotonically. Appends are atomic
//! from a reader's perspective; a record is fully constructed before it
//! becomes visible, and readers take cheap snapshots of `Arc`-wrapped
//! records rather than holding the lock.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::outcome::{ExperimentOutcome, TargetMetric};
use crate::params::ExperimentParameters;

/// One completed experiment: the parameters that were run, what was measured,
/// a monotonically increasing id, and the completion timestamp. Never mutated
/// after creation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExperimentRecord {
    /// Monotonically increasing identifier, starting at 1.
    pub id: u64,
    /// UTC completion timestamp.
    pub completed_at: DateTime<Utc>,
    /// The parameter set that produced this outcome.
    pub params: ExperimentParameters,
    /// The measured outcome.
    pub outcome: ExperimentOutcome,
}

/// Shared handle to the append-only experiment log.
///
/// Cloning the store clones the handle, not the data; all clones observe the
/// same log.
#[derive(Clone, Default)]
pub struct HistoryStore {
    records: Arc<RwLock<Vec<Arc<ExperimentRecord>>>>,
}

impl HistoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a completed experiment, assigning the next id and a timestamp.
    pub fn record(
        &self,
        params: ExperimentParameters,
        outcome: ExperimentOutcome,
    ) -> Arc<ExperimentRecord> {
        let mut records = self.records.write();
        let record = Arc::new(ExperimentRecord {
            id: records.len() as u64 + 1,
            completed_at: Utc::now(),
            params,
            outcome,
        });
        records.push(Arc::clone(&record));
        record
    }

    /// Snapshot of all records in insertion order, oldest first.
    pub fn all(&self) -> Vec<Arc<ExperimentRecord>> {
        self.records.read().clone()
    }

    /// Number of recorded experiments.
    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    /// True when nothing has been recorded yet.
    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }

    /// The record maximizing the chosen metric; ties go to the earliest
    /// record (strict `>` comparison in insertion order).
    pub fn best(&self, metric: TargetMetric) -> Option<Arc<ExperimentRecord>> {
        let records = self.records.read();
        let mut best: Option<&Arc<ExperimentRecord>> = None;
        for record in records.iter() {
            let better = match best {
                None => true,
                Some(current) => {
                    metric.value_of(&record.outcome) > metric.value_of(&current.outcome)
                }
            };
            if better {
                best = Some(record);
            }
        }
        best.cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outcome(diameter_nm: f64, length_um: f64, yield_percent: f64) -> ExperimentOutcome {
        ExperimentOutcome::new(diameter_nm, length_um, yield_percent).unwrap()
    }

    #[test]
    fn test_ids_are_monotonic() {
        let store = HistoryStore::new();
        for i in 1..=5 {
            let record = store.record(ExperimentParameters::default(), outcome(100.0, 10.0, 50.0));
            assert_eq!(record.id, i);
        }
        let all = store.all();
        assert_eq!(all.len(), 5);
        for (i, record) in all.iter().enumerate() {
            assert_eq!(record.id, i as u64 + 1);
        }
    }

    #[test]
    fn test_insertion_order_preserved() {
        let store = HistoryStore::new();
        store.record(ExperimentParameters::default(), outcome(120.0, 15.0, 85.0));
        store.record(ExperimentParameters::default(), outcome(95.0, 20.0, 90.0));
        let all = store.all();
        assert_eq!(all[0].outcome.diameter_nm, 120.0);
        assert_eq!(all[1].outcome.diameter_nm, 95.0);
    }

    #[test]
    fn test_snapshots_are_immutable_views() {
        let store = HistoryStore::new();
        store.record(ExperimentParameters::default(), outcome(120.0, 15.0, 85.0));
        let before = store.all();
        store.record(ExperimentParameters::default(), outcome(95.0, 20.0, 90.0));
        // Earlier snapshot is unaffected by the later append.
        assert_eq!(before.len(), 1);
        assert_eq!(store.len(), 2);
        assert_eq!(before[0].outcome.diameter_nm, 120.0);
    }

    #[test]
    fn test_best_by_metric() {
        let store = HistoryStore::new();
        store.record(ExperimentParameters::default(), outcome(120.0, 15.0, 85.0)); // AR 125
        store.record(ExperimentParameters::default(), outcome(95.0, 20.0, 90.0)); // AR ~211
        let best = store.best(TargetMetric::AspectRatio).unwrap();
        assert_eq!(best.id, 2);
        let best = store.best(TargetMetric::Diameter).unwrap();
        assert_eq!(best.id, 1);
    }

    #[test]
    fn test_best_tie_goes_to_earliest() {
        let store = HistoryStore::new();
        store.record(ExperimentParameters::default(), outcome(100.0, 10.0, 80.0));
        store.record(ExperimentParameters::default(), outcome(100.0, 10.0, 80.0));
        assert_eq!(store.best(TargetMetric::Yield).unwrap().id, 1);
    }

    #[test]
    fn test_best_of_empty_is_none() {
        assert!(HistoryStore::new().best(TargetMetric::Yield).is_none());
    }

    #[test]
    fn test_concurrent_readers_see_whole_records() {
        let store = HistoryStore::new();
        let writer = store.clone();
        let handle = std::thread::spawn(move || {
            for _ in 0..100 {
                writer.record(ExperimentParameters::default(), outcome(100.0, 10.0, 50.0));
            }
        });
        // Readers may observe any prefix of the log, but never a torn record.
        for _ in 0..100 {
            for record in store.all() {
                assert!(record.id >= 1);
                assert_eq!(record.outcome.diameter_nm, 100.0);
            }
        }
        handle.join().unwrap();
        assert_eq!(store.len(), 100);
    }
}
