// Copyright (c) The json-results Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The storage boundary and the two-tier update flow.
//!
//! Aggregates are persisted in two tiers per builder: the full file retains
//! [`MAX_BUILDS`](crate::merge::MAX_BUILDS) builds, the small file retains
//! [`MAX_BUILDS_SMALL`](crate::merge::MAX_BUILDS_SMALL) and is what dashboards
//! load by default. [`TieredUpdater`] folds one incremental batch into both.

use crate::merge::{MAX_BUILDS, MAX_BUILDS_SMALL, MergeOptions, MergeOutcome, Merger, STATUS_OK};
use tracing::{debug, warn};

/// The persisted filename of the full aggregate.
pub const RESULTS_FILENAME: &str = "results.json";

/// The persisted filename of the small (recent-window) aggregate.
pub const SMALL_RESULTS_FILENAME: &str = "results-small.json";

/// Where aggregates live.
///
/// The engine never talks to storage directly beyond this trait; the
/// surrounding server decides whether `name` maps to a blob key, a file path,
/// or a datastore row.
pub trait ResultsStore {
    /// Reads a persisted aggregate, or `None` when none exists yet.
    fn read(&self, name: &str) -> Option<String>;

    /// Persists an aggregate, returning false when the write failed.
    fn save(&self, name: &str, data: &str) -> bool;
}

/// The result of updating one tier.
#[derive(Debug)]
pub struct TierOutcome {
    /// The tier's filename.
    pub name: &'static str,

    /// The merge outcome for this tier.
    pub outcome: MergeOutcome,

    /// Whether the merged aggregate was persisted. Always false when the
    /// merge itself failed.
    pub saved: bool,
}

impl TierOutcome {
    /// True when this tier merged and persisted successfully.
    pub fn is_success(&self) -> bool {
        self.outcome.is_success() && self.saved
    }
}

/// Merges one incremental batch into both persisted tiers of a builder.
///
/// Fail-closed per tier: a failed merge leaves that tier's file untouched,
/// and a failure in one tier does not stop the other from updating.
#[derive(Debug)]
pub struct TieredUpdater {
    builder: String,
    sort_keys: bool,
}

impl TieredUpdater {
    /// Creates an updater for one builder.
    pub fn new(builder: impl Into<String>) -> Self {
        Self {
            builder: builder.into(),
            sort_keys: false,
        }
    }

    /// Requests lexicographically sorted output keys in both tiers.
    pub fn with_sort_keys(mut self, sort_keys: bool) -> Self {
        self.sort_keys = sort_keys;
        self
    }

    /// Merges `incremental_json` into both tiers held by `store`.
    ///
    /// The overall status is the worst tier status; a rejected tier reports
    /// its own diagnostic.
    pub fn update(&self, store: &dyn ResultsStore, incremental_json: &str) -> Vec<TierOutcome> {
        [
            (SMALL_RESULTS_FILENAME, MAX_BUILDS_SMALL),
            (RESULTS_FILENAME, MAX_BUILDS),
        ]
        .into_iter()
        .map(|(name, num_runs)| self.update_tier(store, name, num_runs, incremental_json))
        .collect()
    }

    fn update_tier(
        &self,
        store: &dyn ResultsStore,
        name: &'static str,
        num_runs: usize,
        incremental_json: &str,
    ) -> TierOutcome {
        let merger = Merger::new(
            MergeOptions::new(self.builder.clone(), num_runs).with_sort_keys(self.sort_keys),
        );
        let aggregated = store.read(name).unwrap_or_default();
        let outcome = merger.merge(&aggregated, incremental_json);

        let saved = match &outcome.body {
            Some(body) => {
                let ok = store.save(name, body);
                if ok {
                    debug!(
                        builder = self.builder.as_str(),
                        tier = name,
                        "aggregate updated"
                    );
                } else {
                    warn!(
                        builder = self.builder.as_str(),
                        tier = name,
                        "aggregate merge succeeded but the save failed"
                    );
                }
                ok
            }
            None => false,
        };

        TierOutcome {
            name,
            outcome,
            saved,
        }
    }
}

/// Collapses tier outcomes to a single status code.
pub fn overall_status(outcomes: &[TierOutcome]) -> u16 {
    outcomes
        .iter()
        .map(|tier| tier.outcome.status)
        .max()
        .unwrap_or(STATUS_OK)
}
