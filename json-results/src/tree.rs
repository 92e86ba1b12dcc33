// Copyright (c) The json-results Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The nested test tree and its per-test leaf records.
//!
//! On disk the tree conflates "directory" and "test" by key-sniffing: an
//! object with a `results` key is a test. This module decides leaf-ness once,
//! at parse time, producing an explicit tagged union that the merge and
//! pruning code can match on without re-sniffing.

use crate::{
    errors::{FormatError, MergeError},
    result_type::{ResultChar, ResultType},
    run_length::RunLengthSequence,
};
use indexmap::IndexMap;
use itertools::Itertools;
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::warn;

/// The keys a test leaf may carry. Anything else on an object makes it a
/// directory.
const LEAF_KEYS: &[&str] = &["results", "times", "expected", "bugs"];

/// A single test's merged record.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TestNode {
    /// Per-build results, most recent first.
    pub results: RunLengthSequence<ResultType>,

    /// Per-build elapsed seconds, parallel to `results`.
    pub times: RunLengthSequence<i64>,

    /// Space-separated expected result names; absent means the default
    /// (`PASS`).
    pub expected: Option<String>,

    /// Bug references attached by the test owner.
    pub bugs: Option<Vec<String>>,
}

/// Serialization shape for a leaf. Field order is the wire key order.
#[derive(Serialize)]
struct RawTestNode {
    results: RunLengthSequence<ResultChar>,
    times: RunLengthSequence<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    expected: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    bugs: Option<Vec<String>>,
}

impl TestNode {
    fn from_map(map: &Map<String, Value>, context: &str) -> Result<Self, MergeError> {
        let results_value = map
            .get("results")
            .ok_or(FormatError::MissingKey { key: "results" })?;
        let results = parse_result_runs(results_value, context)?;

        let times = match map.get("times") {
            Some(value) => serde_json::from_value(value.clone()).map_err(FormatError::from)?,
            None => RunLengthSequence::new(),
        };

        let expected = match map.get("expected") {
            Some(value) => Some(
                value
                    .as_str()
                    .ok_or_else(|| FormatError::unexpected_shape(format!("{context}/expected")))?
                    .to_owned(),
            ),
            None => None,
        };

        let bugs = match map.get("bugs") {
            Some(value) => {
                Some(serde_json::from_value(value.clone()).map_err(FormatError::from)?)
            }
            None => None,
        };

        Ok(Self {
            results,
            times,
            expected,
            bugs,
        })
    }

    pub(crate) fn to_value(&self) -> Value {
        let raw = RawTestNode {
            results: self.results.clone().map(ResultChar),
            times: self.times.clone(),
            expected: self.expected.clone(),
            bugs: self.bugs.clone(),
        };
        serde_json::to_value(raw).expect("leaf serialization has no fallible fields")
    }
}

/// Parses a `results` run-length array, resolving single-character result
/// codes through the alphabet.
fn parse_result_runs(
    value: &Value,
    context: &str,
) -> Result<RunLengthSequence<ResultType>, MergeError> {
    let shape = || FormatError::unexpected_shape(format!("{context}/results"));
    let entries = value.as_array().ok_or_else(shape)?;
    let mut seq = RunLengthSequence::new();
    for entry in entries {
        let pair = entry.as_array().ok_or_else(shape)?;
        let [count, code] = pair.as_slice() else {
            return Err(shape().into());
        };
        let count = count.as_u64().ok_or_else(shape)?;
        if count == 0 {
            return Err(FormatError::ZeroRunCount.into());
        }
        let code = code.as_str().ok_or_else(shape)?;
        let mut chars = code.chars();
        let ty = match (chars.next(), chars.next()) {
            (Some(ch), None) => ResultType::from_char(ch)?,
            _ => return Err(crate::errors::UnknownResultError::new(code).into()),
        };
        seq.push_run(count, ty);
    }
    Ok(seq)
}

/// A node in the test tree: either a subtree or a test leaf.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TestTreeNode {
    /// An intermediate path segment.
    Directory(TestTree),
    /// A test record.
    Test(TestNode),
}

impl TestTreeNode {
    fn from_map(map: &Map<String, Value>, context: &str) -> Result<Self, MergeError> {
        let is_leaf = map.contains_key("results")
            && map.keys().all(|key| LEAF_KEYS.contains(&key.as_str()));
        if is_leaf {
            return Ok(TestTreeNode::Test(TestNode::from_map(map, context)?));
        }

        let mut children = IndexMap::new();
        for (key, child) in map {
            let child_context = format!("{context}/{key}");
            match child.as_object() {
                Some(child_map) => {
                    children.insert(key.clone(), TestTreeNode::from_map(child_map, &child_context)?);
                }
                // A directory node carrying stray leaf keys is a known
                // historical data quirk; drop the stray keys and keep the
                // node as a subtree.
                None if LEAF_KEYS.contains(&key.as_str()) => {
                    warn!(context = child_context.as_str(), "dropping stray leaf key on directory node");
                }
                None => return Err(FormatError::unexpected_shape(child_context).into()),
            }
        }
        Ok(TestTreeNode::Directory(TestTree { children }))
    }

    fn to_value(&self, sort_keys: bool) -> Value {
        match self {
            TestTreeNode::Directory(tree) => tree.to_value(sort_keys),
            TestTreeNode::Test(node) => node.to_value(),
        }
    }
}

/// A recursively nested mapping from path segment to subtree or test.
///
/// Child order is preserved from the input for stable output; correctness
/// never depends on it.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TestTree {
    /// The children, keyed by path segment.
    pub children: IndexMap<String, TestTreeNode>,
}

impl TestTree {
    /// Creates an empty tree.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true if the tree has no children.
    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }

    /// Parses a `tests` JSON object into the tagged tree form.
    pub fn from_value(value: &Value) -> Result<Self, MergeError> {
        let map = value
            .as_object()
            .ok_or_else(|| FormatError::unexpected_shape("tests"))?;
        let mut children = IndexMap::new();
        for (key, child) in map {
            let context = format!("tests/{key}");
            let child_map = child
                .as_object()
                .ok_or_else(|| FormatError::unexpected_shape(context.clone()))?;
            children.insert(key.clone(), TestTreeNode::from_map(child_map, &context)?);
        }
        Ok(Self { children })
    }

    /// Serializes back to the on-disk shape. With `sort_keys`, child keys are
    /// emitted in lexicographic order at every level.
    pub fn to_value(&self, sort_keys: bool) -> Value {
        let mut map = Map::new();
        if sort_keys {
            for (key, child) in self.children.iter().sorted_by_key(|(key, _)| key.as_str()) {
                map.insert(key.clone(), child.to_value(sort_keys));
            }
        } else {
            for (key, child) in &self.children {
                map.insert(key.clone(), child.to_value(sort_keys));
            }
        }
        Value::Object(map)
    }

    /// The read-only path-structure projection: the same tree with every test
    /// leaf replaced by an empty object.
    pub fn test_list(&self) -> TestTree {
        let children = self
            .children
            .iter()
            .map(|(key, child)| {
                let projected = match child {
                    TestTreeNode::Directory(tree) => TestTreeNode::Directory(tree.test_list()),
                    TestTreeNode::Test(_) => TestTreeNode::Directory(TestTree::new()),
                };
                (key.clone(), projected)
            })
            .collect();
        TestTree { children }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn parse(value: Value) -> TestTree {
        TestTree::from_value(&value).expect("tree parses")
    }

    #[test]
    fn leaf_is_classified_by_results_key() {
        let tree = parse(json!({
            "fast": {
                "001.html": { "results": [[3, "P"]], "times": [[3, 0]] },
            }
        }));
        let TestTreeNode::Directory(dir) = &tree.children["fast"] else {
            panic!("fast should be a directory");
        };
        let TestTreeNode::Test(node) = &dir.children["001.html"] else {
            panic!("001.html should be a test");
        };
        assert_eq!(node.results.runs(), &[(3, ResultType::Pass)]);
        assert_eq!(node.times.runs(), &[(3, 0)]);
        assert_eq!(node.expected, None);
        assert_eq!(node.bugs, None);
    }

    #[test]
    fn expected_and_bugs_are_carried() {
        let tree = parse(json!({
            "001.html": {
                "results": [[1, "Q"]],
                "times": [[1, 2]],
                "expected": "FAIL",
                "bugs": ["crbug.com/123"],
            }
        }));
        let TestTreeNode::Test(node) = &tree.children["001.html"] else {
            panic!("001.html should be a test");
        };
        assert_eq!(node.expected.as_deref(), Some("FAIL"));
        assert_eq!(node.bugs.as_deref(), Some(&["crbug.com/123".to_owned()][..]));
    }

    #[test]
    fn directory_with_stray_leaf_keys_stays_a_directory() {
        let tree = parse(json!({
            "fast": {
                "results": [[5, "P"]],
                "times": [[5, 0]],
                "001.html": { "results": [[5, "F"]], "times": [[5, 1]] },
            }
        }));
        let TestTreeNode::Directory(dir) = &tree.children["fast"] else {
            panic!("fast should be a directory despite stray keys");
        };
        assert_eq!(dir.children.len(), 1);
        assert!(matches!(dir.children["001.html"], TestTreeNode::Test(_)));
    }

    #[test]
    fn unknown_result_char_is_an_unknown_result_error() {
        let err = TestTree::from_value(&json!({
            "001.html": { "results": [[1, "?"]] }
        }))
        .unwrap_err();
        assert!(matches!(err, MergeError::UnknownResult(_)), "{err}");
    }

    #[test]
    fn zero_count_is_a_format_error() {
        let err = TestTree::from_value(&json!({
            "001.html": { "results": [[0, "P"]] }
        }))
        .unwrap_err();
        assert!(
            matches!(err, MergeError::Format(FormatError::ZeroRunCount)),
            "{err}"
        );
    }

    #[test]
    fn test_list_replaces_leaves_with_empty_objects() {
        let tree = parse(json!({
            "fast": {
                "results": [[5, "P"]],
                "001.html": { "results": [[5, "F"]], "times": [[5, 1]] },
            },
            "002.html": { "results": [[1, "P"]], "times": [[1, 0]] },
        }));
        let projection = tree.test_list().to_value(false);
        assert_eq!(
            projection,
            json!({
                "fast": { "001.html": {} },
                "002.html": {},
            })
        );
    }

    #[test]
    fn to_value_round_trips_and_sorts_keys_on_request() {
        let tree = parse(json!({
            "b.html": { "results": [[1, "P"]], "times": [[1, 0]] },
            "a.html": { "results": [[2, "C"]], "times": [[2, 3]] },
        }));
        let unsorted = tree.to_value(false);
        assert_eq!(
            unsorted.as_object().unwrap().keys().collect::<Vec<_>>(),
            ["b.html", "a.html"]
        );
        let sorted = tree.to_value(true);
        assert_eq!(
            sorted.as_object().unwrap().keys().collect::<Vec<_>>(),
            ["a.html", "b.html"]
        );
        assert_eq!(parse(unsorted), tree);
    }
}
