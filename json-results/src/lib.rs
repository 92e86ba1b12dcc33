// Copyright (c) The json-results Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Merge engine for layout-test result histories.
//!
//! Test harnesses upload one **full results** snapshot per build; dashboards
//! read a per-builder **aggregate**: a run-length-encoded history of every
//! test's recent outcomes, most recent build first. This crate implements the
//! fold between the two:
//!
//! - [`Merger`] prepends an incremental batch ahead of the persisted
//!   aggregate, backfills a no-data sentinel for tests the batch did not
//!   report, trims every history to the retention window, and prunes tests
//!   whose retained window no longer says anything interesting.
//! - [`TieredUpdater`] applies one batch to both persisted tiers (the full
//!   and the recent-window aggregate) through the [`ResultsStore`] boundary.
//! - [`get_test_list`] projects an aggregate down to its test-name structure.
//!
//! The engine is deliberately free of I/O and HTTP concerns; it consumes and
//! produces strings and reports [`STATUS_OK`]/[`STATUS_REJECTED`] outcomes
//! for the surrounding server to relay.

mod errors;
mod formats;
mod merge;
mod result_type;
mod run_length;
mod store;
mod tree;

pub use errors::{
    EmptyInputError, FormatError, MergeConflictError, MergeError, UnknownResultError,
};
pub use formats::{
    AGGREGATE_VERSION, AggregateResults, BuilderHistory, FullResults, failure_map,
    strip_comments, strip_json_wrapper,
};
pub use merge::{
    BuilderKind, MAX_BUILDS, MAX_BUILDS_SMALL, MIN_TIME_SECS, MergeOptions, MergeOutcome, Merger,
    STATUS_OK, STATUS_REJECTED, get_test_list,
};
pub use result_type::ResultType;
pub use run_length::RunLengthSequence;
pub use store::{
    RESULTS_FILENAME, ResultsStore, SMALL_RESULTS_FILENAME, TierOutcome, TieredUpdater,
    overall_status,
};
pub use tree::{TestNode, TestTree, TestTreeNode};
