// Copyright (c) The json-results Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The merge engine.
//!
//! One merge call folds a single incremental batch into a persisted
//! aggregate: new builds are prepended ahead of old ones, every tracked
//! test's history is extended in lockstep (backfilling a no-data sentinel
//! where the batch has no entry), the result is trimmed to the retention
//! window, and tests whose retained window has become uninteresting are
//! pruned from the output.
//!
//! The merge is a pure function of its two inputs; serializing concurrent
//! merges against the same persisted aggregate is the caller's job.

use crate::{
    errors::{EmptyInputError, FormatError, MergeConflictError, MergeError},
    formats::{AggregateResults, BuilderHistory, FullResults, strip_comments, strip_json_wrapper},
    result_type::ResultType,
    run_length::RunLengthSequence,
    tree::{TestNode, TestTree, TestTreeNode},
};
use indexmap::IndexMap;
use serde_json::{Map, Value};
use tracing::{debug, warn};

/// Builds retained per test in the full aggregate file.
pub const MAX_BUILDS: usize = 500;

/// Builds retained per test in the small (recent-window) aggregate file.
pub const MAX_BUILDS_SMALL: usize = 100;

/// The slow-test floor, in seconds.
pub const MIN_TIME_SECS: i64 = 3;

/// A passing test on a debug builder is kept visible once any retained time
/// reaches this multiple of the floor.
const SLOW_MULTIPLIER: i64 = 3;

/// Status code for a successful merge.
pub const STATUS_OK: u16 = 200;

/// Status code for a rejected merge. Callers must not persist anything over
/// the existing aggregate when they see this.
pub const STATUS_REJECTED: u16 = 403;

/// The builder class, derived from the builder name.
///
/// Debug builders run slower, so their pruning decision also looks at
/// elapsed times: a perpetually slow test stays visible even when passing.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BuilderKind {
    /// A debug builder (name contains `(dbg)`).
    Debug,
    /// Everything else.
    Release,
}

impl BuilderKind {
    /// Classifies a builder by name.
    pub fn classify(name: &str) -> Self {
        if name.contains("(dbg)") {
            BuilderKind::Debug
        } else {
            BuilderKind::Release
        }
    }

    /// The retained-time threshold at or above which an all-passing test is
    /// kept anyway, or `None` when times never block pruning.
    fn slow_time_threshold(self) -> Option<i64> {
        match self {
            BuilderKind::Debug => Some(SLOW_MULTIPLIER * MIN_TIME_SECS),
            BuilderKind::Release => None,
        }
    }
}

/// Configuration for one merge call.
#[derive(Clone, Debug)]
pub struct MergeOptions {
    /// The builder whose aggregate is being updated. Both payloads must name
    /// this builder.
    pub builder: String,

    /// The retention window: maximum builds kept per test.
    pub num_runs: usize,

    /// Whether output tree keys are emitted in lexicographic order. Affects
    /// only byte-level determinism of the serialized output.
    pub sort_keys: bool,
}

impl MergeOptions {
    /// Creates options with unsorted output keys.
    pub fn new(builder: impl Into<String>, num_runs: usize) -> Self {
        Self {
            builder: builder.into(),
            num_runs,
            sort_keys: false,
        }
    }

    /// Requests lexicographically sorted output keys.
    pub fn with_sort_keys(mut self, sort_keys: bool) -> Self {
        self.sort_keys = sort_keys;
        self
    }
}

/// What a merge call produced.
///
/// Errors never escape the merge boundary; they are folded into a
/// non-success status plus a diagnostic message, matching what the
/// surrounding HTTP handler reports.
#[derive(Debug)]
pub struct MergeOutcome {
    /// The merged aggregate, present only on success.
    pub body: Option<String>,

    /// [`STATUS_OK`] or [`STATUS_REJECTED`].
    pub status: u16,

    /// The diagnostic message on failure.
    pub message: Option<String>,
}

impl MergeOutcome {
    /// True when the merge succeeded and `body` holds the new aggregate.
    pub fn is_success(&self) -> bool {
        self.status == STATUS_OK
    }
}

/// Merges incremental result batches into a builder's aggregate history.
#[derive(Clone, Debug)]
pub struct Merger {
    options: MergeOptions,
}

impl Merger {
    /// Creates a merger for one builder and retention window.
    pub fn new(options: MergeOptions) -> Self {
        Self { options }
    }

    /// The configured options.
    pub fn options(&self) -> &MergeOptions {
        &self.options
    }

    /// Merges one incremental batch into the aggregate, converting any error
    /// into a rejected [`MergeOutcome`].
    pub fn merge(&self, aggregated_json: &str, incremental_json: &str) -> MergeOutcome {
        match self.try_merge(aggregated_json, incremental_json) {
            Ok(body) => MergeOutcome {
                body: Some(body),
                status: STATUS_OK,
                message: None,
            },
            Err(error) => {
                warn!(builder = self.options.builder.as_str(), %error, "merge rejected");
                MergeOutcome {
                    body: None,
                    status: error.status_code(),
                    message: Some(error.to_string()),
                }
            }
        }
    }

    /// Merges one incremental batch into the aggregate.
    ///
    /// `aggregated_json` may be empty, meaning "no history yet"; the
    /// incremental batch may be in full-results form (one harness run,
    /// possibly wrapped in the `ADD_RESULTS` envelope) or already
    /// aggregate-shaped when chained from another merge.
    pub fn try_merge(
        &self,
        aggregated_json: &str,
        incremental_json: &str,
    ) -> Result<String, MergeError> {
        let aggregated_json = aggregated_json.trim();
        let incremental_json = incremental_json.trim();
        if incremental_json.is_empty() {
            if aggregated_json.is_empty() {
                return Err(EmptyInputError.into());
            }
            return Err(FormatError::EmptyPayload.into());
        }

        let incremental = self.parse_incremental(incremental_json)?;
        if incremental.history.build_numbers.is_empty() {
            return Err(MergeConflictError::NoNewBuilds.into());
        }

        let mut merged = if aggregated_json.is_empty() {
            incremental.history
        } else {
            let aggregated = AggregateResults::parse(aggregated_json)?;
            self.check_builder(&aggregated.builder)?;
            merge_histories(aggregated.history, incremental.history)?
        };

        normalize(
            &mut merged,
            self.options.num_runs,
            BuilderKind::classify(&self.options.builder),
        )?;

        AggregateResults {
            builder: self.options.builder.clone(),
            history: merged,
        }
        .to_json(self.options.sort_keys)
    }

    fn parse_incremental(&self, payload: &str) -> Result<AggregateResults, MergeError> {
        let stripped = strip_comments(strip_json_wrapper(payload)?)?;
        let value: Value = serde_json::from_str(&stripped).map_err(FormatError::from)?;
        let aggregate = if FullResults::is_full_results(&value) {
            let full: FullResults =
                serde_json::from_value(value).map_err(FormatError::from)?;
            full.into_aggregate()?
        } else {
            AggregateResults::from_value(value)?
        };
        self.check_builder(&aggregate.builder)?;
        Ok(aggregate)
    }

    fn check_builder(&self, found: &str) -> Result<(), MergeError> {
        if found != self.options.builder {
            return Err(MergeConflictError::BuilderMismatch {
                expected: self.options.builder.clone(),
                found: found.to_owned(),
            }
            .into());
        }
        Ok(())
    }
}

/// Merges the incremental history ahead of the aggregated one.
fn merge_histories(
    aggregated: BuilderHistory,
    incremental: BuilderHistory,
) -> Result<BuilderHistory, MergeError> {
    if let Some(duplicate) = incremental
        .build_numbers
        .iter()
        .find(|build| aggregated.build_numbers.contains(build))
    {
        return Err(MergeConflictError::DuplicateBuild {
            build: duplicate.clone(),
        }
        .into());
    }

    let new_builds = incremental.build_numbers.len();
    let old_builds = aggregated.build_numbers.len();

    let num_failures_by_type = merge_histograms(
        &aggregated.num_failures_by_type,
        &incremental.num_failures_by_type,
        new_builds,
        old_builds,
    )?;
    let tests = merge_trees(&aggregated.tests, Some(&incremental.tests), new_builds)?;

    Ok(BuilderHistory {
        build_numbers: prepend(incremental.build_numbers, aggregated.build_numbers),
        blink_revisions: prepend(incremental.blink_revisions, aggregated.blink_revisions),
        chrome_revisions: prepend(incremental.chrome_revisions, aggregated.chrome_revisions),
        times: prepend(incremental.times, aggregated.times),
        num_failures_by_type,
        tests,
    })
}

fn prepend<T>(mut new: Vec<T>, old: Vec<T>) -> Vec<T> {
    new.extend(old);
    new
}

/// Merges the per-type failure histograms in lockstep with the builds.
///
/// A type present on only one side is padded with zero counts for the other
/// side's builds, so every histogram keeps decoding to the full build count.
fn merge_histograms(
    aggregated: &IndexMap<ResultType, RunLengthSequence<i64>>,
    incremental: &IndexMap<ResultType, RunLengthSequence<i64>>,
    new_builds: usize,
    old_builds: usize,
) -> Result<IndexMap<ResultType, RunLengthSequence<i64>>, MergeError> {
    let mut merged = IndexMap::new();
    for (&ty, aggregated_seq) in aggregated {
        let mut flat = match incremental.get(&ty) {
            Some(incremental_seq) => incremental_seq.decode()?,
            None => vec![0; new_builds],
        };
        flat.extend(aggregated_seq.decode()?);
        merged.insert(ty, RunLengthSequence::from_flat(flat));
    }
    for (&ty, incremental_seq) in incremental {
        if merged.contains_key(&ty) {
            continue;
        }
        let mut flat = incremental_seq.decode()?;
        flat.extend(std::iter::repeat_n(0, old_builds));
        merged.insert(ty, RunLengthSequence::from_flat(flat));
    }
    Ok(merged)
}

/// Recursively merges two trees keyed by path segment.
///
/// `incremental` is `None` below a subtree the batch did not report at all;
/// every aggregated leaf under it still gets its no-data backfill so history
/// lengths stay aligned with the global build count.
fn merge_trees(
    aggregated: &TestTree,
    incremental: Option<&TestTree>,
    new_builds: usize,
) -> Result<TestTree, MergeError> {
    let mut children = IndexMap::new();
    for (name, aggregated_child) in &aggregated.children {
        let incremental_child = incremental.and_then(|tree| tree.children.get(name));
        let merged = match (aggregated_child, incremental_child) {
            (TestTreeNode::Directory(aggregated_dir), Some(TestTreeNode::Directory(inc_dir))) => {
                TestTreeNode::Directory(merge_trees(aggregated_dir, Some(inc_dir), new_builds)?)
            }
            (TestTreeNode::Directory(aggregated_dir), None) => {
                TestTreeNode::Directory(merge_trees(aggregated_dir, None, new_builds)?)
            }
            (TestTreeNode::Test(aggregated_node), Some(TestTreeNode::Test(inc_node))) => {
                TestTreeNode::Test(merge_leaves(aggregated_node, Some(inc_node), new_builds)?)
            }
            (TestTreeNode::Test(aggregated_node), None) => {
                TestTreeNode::Test(merge_leaves(aggregated_node, None, new_builds)?)
            }
            // Kind changed between the two sides; take the incremental view,
            // matching the lenient posture toward feeder data.
            (_, Some(incremental_child)) => {
                warn!(
                    test = name.as_str(),
                    "node kind changed between aggregate and incremental; taking the incremental side"
                );
                incremental_child.clone()
            }
        };
        children.insert(name.clone(), merged);
    }

    if let Some(incremental) = incremental {
        for (name, incremental_child) in &incremental.children {
            if children.contains_key(name) {
                continue;
            }
            // A test new in this batch starts its history here; no
            // historical backfill.
            children.insert(name.clone(), incremental_child.clone());
        }
    }

    Ok(TestTree { children })
}

/// Merges one test's record: incremental entries are prepended ahead of the
/// aggregated history, with a no-data backfill when the batch has no entry
/// for this test.
fn merge_leaves(
    aggregated: &TestNode,
    incremental: Option<&TestNode>,
    new_builds: usize,
) -> Result<TestNode, MergeError> {
    let (mut results, mut times, expected, bugs) = match incremental {
        Some(node) => {
            let results = node.results.decode()?;
            if results.len() != new_builds {
                debug!(
                    declared = new_builds,
                    actual = results.len(),
                    "incremental result count differs from declared build count; merging leniently"
                );
            }
            (
                results,
                node.times.decode()?,
                node.expected.clone(),
                node.bugs.clone(),
            )
        }
        None => (
            vec![ResultType::NoData; new_builds],
            vec![0; new_builds],
            None,
            None,
        ),
    };

    results.extend(aggregated.results.decode()?);
    times.extend(aggregated.times.decode()?);

    Ok(TestNode {
        results: RunLengthSequence::from_flat(results),
        times: RunLengthSequence::from_flat(times),
        expected: expected.or_else(|| aggregated.expected.clone()),
        bugs: bugs.or_else(|| aggregated.bugs.clone()),
    })
}

/// Trims every history to the retention window and prunes tests whose
/// retained window has become uninteresting.
fn normalize(
    history: &mut BuilderHistory,
    num_runs: usize,
    kind: BuilderKind,
) -> Result<(), MergeError> {
    history.build_numbers.truncate(num_runs);
    history.blink_revisions.truncate(num_runs);
    history.chrome_revisions.truncate(num_runs);
    history.times.truncate(num_runs);
    for seq in history.num_failures_by_type.values_mut() {
        *seq = truncate_runs(seq, num_runs)?;
    }
    prune_tree(&mut history.tests, num_runs, kind.slow_time_threshold())?;
    Ok(())
}

fn truncate_runs<T: Clone + PartialEq>(
    seq: &RunLengthSequence<T>,
    num_runs: usize,
) -> Result<RunLengthSequence<T>, MergeError> {
    let mut flat = seq.decode()?;
    flat.truncate(num_runs);
    Ok(RunLengthSequence::from_flat(flat))
}

fn prune_tree(
    tree: &mut TestTree,
    num_runs: usize,
    slow_threshold: Option<i64>,
) -> Result<(), MergeError> {
    let mut remove = Vec::new();
    for (name, child) in tree.children.iter_mut() {
        match child {
            TestTreeNode::Directory(dir) => {
                prune_tree(dir, num_runs, slow_threshold)?;
                if dir.is_empty() {
                    remove.push(name.clone());
                }
            }
            TestTreeNode::Test(node) => {
                node.results = truncate_runs(&node.results, num_runs)?;
                node.times = truncate_runs(&node.times, num_runs)?;
                if should_prune_leaf(node, slow_threshold) {
                    remove.push(name.clone());
                }
            }
        }
    }
    for name in remove {
        debug!(node = name.as_str(), "pruning uninteresting node");
        tree.children.shift_remove(&name);
    }
    Ok(())
}

/// A leaf is pruned only when nothing about it is worth showing: no
/// expectation override, no bugs, no failing result in the retained window,
/// and (on debug builders) no slow-time signal.
fn should_prune_leaf(node: &TestNode, slow_threshold: Option<i64>) -> bool {
    if node.expected.is_some() || node.bugs.is_some() {
        return false;
    }
    if node
        .results
        .runs()
        .iter()
        .any(|(_, result)| !result.is_droppable())
    {
        return false;
    }
    if let Some(threshold) = slow_threshold
        && node.times.runs().iter().any(|(_, time)| *time >= threshold)
    {
        return false;
    }
    true
}

/// Projects an aggregate payload down to its test-name structure.
///
/// Every test leaf becomes an empty object; run data and stray leaf keys on
/// directory nodes are stripped. Pure function, no merge semantics.
pub fn get_test_list(aggregated_json: &str) -> Result<String, MergeError> {
    let aggregate = AggregateResults::parse(aggregated_json)?;
    let mut map = Map::new();
    let mut builder_map = Map::new();
    builder_map.insert(
        "tests".to_owned(),
        aggregate.history.tests.test_list().to_value(true),
    );
    map.insert(aggregate.builder, Value::Object(builder_map));
    serde_json::to_string(&Value::Object(map)).map_err(|err| FormatError::from(err).into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_kind_is_classified_by_name() {
        assert_eq!(BuilderKind::classify("WebKit Linux"), BuilderKind::Release);
        assert_eq!(
            BuilderKind::classify("WebKit Linux (dbg)"),
            BuilderKind::Debug
        );
        assert_eq!(
            BuilderKind::classify("WebKit Linux (dbg)(1)"),
            BuilderKind::Debug
        );
    }

    #[test]
    fn leaf_with_expectation_override_or_bugs_is_never_pruned() {
        let all_pass = TestNode {
            results: [(10, ResultType::Pass)].into_iter().collect(),
            times: [(10, 0)].into_iter().collect(),
            expected: None,
            bugs: None,
        };
        assert!(should_prune_leaf(&all_pass, None));

        let with_expected = TestNode {
            expected: Some("FAIL".to_owned()),
            ..all_pass.clone()
        };
        assert!(!should_prune_leaf(&with_expected, None));

        let with_bugs = TestNode {
            bugs: Some(vec!["crbug.com/1".to_owned()]),
            ..all_pass
        };
        assert!(!should_prune_leaf(&with_bugs, None));
    }

    #[test]
    fn slow_threshold_only_blocks_pruning_when_set() {
        let slow_pass = TestNode {
            results: [(10, ResultType::Pass)].into_iter().collect(),
            times: [(9, 0), (1, MIN_TIME_SECS * 3)].into_iter().collect(),
            expected: None,
            bugs: None,
        };
        assert!(should_prune_leaf(&slow_pass, None));
        assert!(!should_prune_leaf(
            &slow_pass,
            BuilderKind::Debug.slow_time_threshold()
        ));
    }

    #[test]
    fn failing_result_anywhere_in_the_window_blocks_pruning() {
        let node = TestNode {
            results: [(9, ResultType::Pass), (1, ResultType::Text)]
                .into_iter()
                .collect(),
            times: [(10, 0)].into_iter().collect(),
            expected: None,
            bugs: None,
        };
        assert!(!should_prune_leaf(&node, None));
    }

    #[test]
    fn histograms_are_zero_padded_for_one_sided_types() {
        let aggregated: IndexMap<ResultType, RunLengthSequence<i64>> =
            [(ResultType::Pass, [(2, 10)].into_iter().collect())]
                .into_iter()
                .collect();
        let incremental: IndexMap<ResultType, RunLengthSequence<i64>> =
            [(ResultType::Text, [(1, 3)].into_iter().collect())]
                .into_iter()
                .collect();

        let merged = merge_histograms(&aggregated, &incremental, 1, 2).unwrap();
        assert_eq!(
            merged[&ResultType::Pass].decode().unwrap(),
            vec![0, 10, 10]
        );
        assert_eq!(merged[&ResultType::Text].decode().unwrap(), vec![3, 0, 0]);
    }

    #[test]
    fn missing_incremental_leaf_is_backfilled_with_no_data() {
        let aggregated = TestNode {
            results: [(5, ResultType::Text)].into_iter().collect(),
            times: [(5, 1)].into_iter().collect(),
            expected: None,
            bugs: None,
        };
        let merged = merge_leaves(&aggregated, None, 2).unwrap();
        assert_eq!(
            merged.results.runs(),
            &[(2, ResultType::NoData), (5, ResultType::Text)]
        );
        assert_eq!(merged.times.runs(), &[(2, 0), (5, 1)]);
    }

    #[test]
    fn merged_runs_coalesce_across_the_seam() {
        let aggregated = TestNode {
            results: [(200, ResultType::Text)].into_iter().collect(),
            times: [(200, 0)].into_iter().collect(),
            expected: None,
            bugs: None,
        };
        let incremental = TestNode {
            results: [(1, ResultType::Text)].into_iter().collect(),
            times: [(1, 0)].into_iter().collect(),
            expected: None,
            bugs: None,
        };
        let merged = merge_leaves(&aggregated, Some(&incremental), 1).unwrap();
        assert_eq!(merged.results.runs(), &[(201, ResultType::Text)]);
        assert_eq!(merged.times.runs(), &[(201, 0)]);
    }

    #[test]
    fn truncation_reencodes_the_retained_window() {
        let seq: RunLengthSequence<i64> = [(3, 7), (4, 0)].into_iter().collect();
        let trimmed = truncate_runs(&seq, 5).unwrap();
        assert_eq!(trimmed.runs(), &[(3, 7), (2, 0)]);
    }
}
