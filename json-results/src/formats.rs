// Copyright (c) The json-results Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The two wire shapes and the conversion between them.
//!
//! A test harness emits **full results**: one run's complete snapshot, with
//! per-leaf `actual`/`expected` name lists and flat failure counts, usually
//! wrapped in an `ADD_RESULTS(...);` JS-callback envelope. The server
//! persists **aggregate results**: the multi-build run-length-encoded history
//! keyed by builder, plus a format version. Every incremental batch is
//! normalized into the aggregate shape before merging.

use crate::{
    errors::{FormatError, MergeError},
    result_type::ResultType,
    run_length::RunLengthSequence,
    tree::{TestNode, TestTree, TestTreeNode},
};
use indexmap::IndexMap;
use itertools::Itertools;
use serde::{Deserialize, Deserializer};
use serde_json::{Map, Value};
use tracing::debug;

/// The aggregate format version this engine reads and writes.
pub const AGGREGATE_VERSION: u64 = 4;

const JSON_WRAPPER_START: &str = "ADD_RESULTS(";
const JSON_WRAPPER_END: &str = ");";

/// Strips the `ADD_RESULTS(...);` envelope when present.
///
/// Payloads without the envelope pass through unchanged; an opening half
/// without its closing half is a [`FormatError::Envelope`]. Output is always
/// raw JSON — the engine never re-adds an envelope.
pub fn strip_json_wrapper(payload: &str) -> Result<&str, FormatError> {
    let trimmed = payload.trim();
    match trimmed.strip_prefix(JSON_WRAPPER_START) {
        Some(rest) => rest
            .trim_end()
            .strip_suffix(JSON_WRAPPER_END)
            .ok_or(FormatError::Envelope),
        None => Ok(trimmed),
    }
}

/// Removes `//` line comments and `/* ... */` block comments outside string
/// literals.
///
/// Historical feeder data occasionally carries JS-style comments. An
/// unterminated block comment fails rather than truncating the payload.
pub fn strip_comments(input: &str) -> Result<String, FormatError> {
    let mut out = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();
    let mut in_string = false;
    let mut escaped = false;

    while let Some(ch) = chars.next() {
        if in_string {
            out.push(ch);
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_string = false;
            }
            continue;
        }
        match ch {
            '"' => {
                in_string = true;
                out.push(ch);
            }
            '/' => match chars.peek() {
                Some('/') => {
                    while let Some(&next) = chars.peek() {
                        if next == '\n' {
                            break;
                        }
                        chars.next();
                    }
                }
                Some('*') => {
                    chars.next();
                    let mut closed = false;
                    while let Some(next) = chars.next() {
                        if next == '*' && chars.peek() == Some(&'/') {
                            chars.next();
                            closed = true;
                            break;
                        }
                    }
                    if !closed {
                        return Err(FormatError::UnterminatedComment);
                    }
                }
                _ => out.push(ch),
            },
            _ => out.push(ch),
        }
    }
    Ok(out)
}

/// Accepts wire values that are either strings or bare numbers.
///
/// Build and revision numbers have historically been emitted both ways.
fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum StringOrNumber {
        String(String),
        Number(serde_json::Number),
    }

    Ok(match StringOrNumber::deserialize(deserializer)? {
        StringOrNumber::String(s) => s,
        StringOrNumber::Number(n) => n.to_string(),
    })
}

fn string_or_number_vec<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    struct Wrapper(#[serde(deserialize_with = "string_or_number")] String);

    let values = Vec::<Wrapper>::deserialize(deserializer)?;
    Ok(values.into_iter().map(|Wrapper(s)| s).collect())
}

/// Accepts integer or float seconds, rounding floats.
fn rounded_seconds<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    let number = serde_json::Number::deserialize(deserializer)?;
    number
        .as_i64()
        .or_else(|| number.as_f64().map(|f| f.round() as i64))
        .ok_or_else(|| serde::de::Error::custom("seconds value out of range"))
}

fn rounded_seconds_vec<'de, D>(deserializer: D) -> Result<Vec<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    struct Wrapper(#[serde(deserialize_with = "rounded_seconds")] i64);

    let values = Vec::<Wrapper>::deserialize(deserializer)?;
    Ok(values.into_iter().map(|Wrapper(s)| s).collect())
}

/// One builder's merged multi-build history.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct BuilderHistory {
    /// Build numbers, most recent first.
    pub build_numbers: Vec<String>,

    /// Blink revision per build, parallel to `build_numbers`.
    pub blink_revisions: Vec<String>,

    /// Chromium revision per build, parallel to `build_numbers`.
    pub chrome_revisions: Vec<String>,

    /// Seconds-since-epoch per build, parallel to `build_numbers`.
    pub times: Vec<i64>,

    /// Per-result-type failure counts, run-length encoded across builds.
    pub num_failures_by_type: IndexMap<ResultType, RunLengthSequence<i64>>,

    /// The merged test tree.
    pub tests: TestTree,
}

/// Deserialization shape for [`BuilderHistory`]; `tests` stays raw because
/// leaf classification needs the whole object.
#[derive(Deserialize)]
struct RawBuilderHistory {
    #[serde(rename = "buildNumbers", deserialize_with = "string_or_number_vec")]
    build_numbers: Vec<String>,
    #[serde(
        rename = "blinkRevision",
        default,
        deserialize_with = "string_or_number_vec"
    )]
    blink_revisions: Vec<String>,
    #[serde(
        rename = "chromeRevision",
        default,
        deserialize_with = "string_or_number_vec"
    )]
    chrome_revisions: Vec<String>,
    #[serde(
        rename = "secondsSinceEpoch",
        default,
        deserialize_with = "rounded_seconds_vec"
    )]
    times: Vec<i64>,
    #[serde(default)]
    num_failures_by_type: IndexMap<ResultType, RunLengthSequence<i64>>,
    tests: Value,
}

impl BuilderHistory {
    fn from_value(value: Value) -> Result<Self, MergeError> {
        let raw: RawBuilderHistory =
            serde_json::from_value(value).map_err(FormatError::from)?;
        Ok(Self {
            build_numbers: raw.build_numbers,
            blink_revisions: raw.blink_revisions,
            chrome_revisions: raw.chrome_revisions,
            times: raw.times,
            num_failures_by_type: raw.num_failures_by_type,
            tests: TestTree::from_value(&raw.tests)?,
        })
    }

    fn to_value(&self, sort_keys: bool) -> Value {
        let mut histogram = Map::new();
        let histogram_entries = if sort_keys {
            itertools::Either::Left(
                self.num_failures_by_type
                    .iter()
                    .sorted_by_key(|(ty, _)| ty.as_name()),
            )
        } else {
            itertools::Either::Right(self.num_failures_by_type.iter())
        };
        for (ty, counts) in histogram_entries {
            histogram.insert(
                ty.as_name().to_owned(),
                serde_json::to_value(counts).expect("run-length pairs always serialize"),
            );
        }

        let mut map = Map::new();
        map.insert(
            "blinkRevision".to_owned(),
            self.blink_revisions.clone().into(),
        );
        map.insert("buildNumbers".to_owned(), self.build_numbers.clone().into());
        map.insert(
            "chromeRevision".to_owned(),
            self.chrome_revisions.clone().into(),
        );
        map.insert("failure_map".to_owned(), failure_map());
        map.insert("num_failures_by_type".to_owned(), Value::Object(histogram));
        map.insert("secondsSinceEpoch".to_owned(), self.times.clone().into());
        map.insert("tests".to_owned(), self.tests.to_value(sort_keys));
        Value::Object(map)
    }
}

/// The static char-to-name table echoed verbatim into aggregate output.
pub fn failure_map() -> Value {
    let mut map = Map::new();
    for ty in ResultType::ALL
        .iter()
        .sorted_by_key(|ty| ty.as_char())
    {
        map.insert(ty.as_char().to_string(), ty.as_name().into());
    }
    Value::Object(map)
}

/// A parsed aggregate payload: one builder's history plus the format version.
#[derive(Clone, Debug, PartialEq)]
pub struct AggregateResults {
    /// The builder this history belongs to.
    pub builder: String,

    /// The history itself.
    pub history: BuilderHistory,
}

impl AggregateResults {
    /// Parses an aggregate payload from text, stripping the envelope and any
    /// comments first.
    pub fn parse(payload: &str) -> Result<Self, MergeError> {
        let stripped = strip_comments(strip_json_wrapper(payload)?)?;
        let value: Value = serde_json::from_str(&stripped).map_err(FormatError::from)?;
        Self::from_value(value)
    }

    /// Builds an aggregate from an already-parsed JSON value.
    ///
    /// The top level must hold exactly one builder key besides `version`.
    pub fn from_value(value: Value) -> Result<Self, MergeError> {
        let Value::Object(map) = value else {
            return Err(FormatError::unexpected_shape("aggregate root").into());
        };
        let mut builder_entry = None;
        for (key, child) in map {
            if key == "version" {
                continue;
            }
            if builder_entry.is_some() {
                return Err(FormatError::unexpected_shape(format!(
                    "aggregate root: second builder key `{key}`"
                ))
                .into());
            }
            builder_entry = Some((key, child));
        }
        let (builder, history_value) =
            builder_entry.ok_or(FormatError::MissingKey { key: "builder" })?;
        Ok(Self {
            builder,
            history: BuilderHistory::from_value(history_value)?,
        })
    }

    /// Serializes to the persisted on-disk form.
    pub fn to_json(&self, sort_keys: bool) -> Result<String, MergeError> {
        let mut map = Map::new();
        map.insert(self.builder.clone(), self.history.to_value(sort_keys));
        map.insert("version".to_owned(), AGGREGATE_VERSION.into());
        serde_json::to_string(&Value::Object(map))
            .map_err(|err| FormatError::from(err).into())
    }
}

/// One test run's complete snapshot, as emitted by the harness.
#[derive(Debug, Deserialize)]
pub struct FullResults {
    /// The builder that produced the run.
    pub builder_name: String,

    /// The build number of the run.
    #[serde(deserialize_with = "string_or_number")]
    pub build_number: String,

    /// The Blink revision the run was built at.
    #[serde(default, deserialize_with = "string_or_number")]
    pub blink_revision: String,

    /// The Chromium revision the run was built at.
    #[serde(default, deserialize_with = "string_or_number")]
    pub chromium_revision: String,

    /// When the run started.
    #[serde(default, deserialize_with = "rounded_seconds")]
    pub seconds_since_epoch: i64,

    /// Flat per-type failure counts for the run.
    #[serde(default)]
    pub num_failures_by_type: IndexMap<ResultType, i64>,

    /// The raw test trie, with per-leaf `actual`/`expected` name lists.
    pub tests: Value,
}

impl FullResults {
    /// Whether a parsed payload is in full-results form.
    ///
    /// Aggregate payloads key their top level by builder name; full results
    /// carry `builder_name` alongside `tests`.
    pub fn is_full_results(value: &Value) -> bool {
        value.get("builder_name").is_some() && value.get("tests").is_some()
    }

    /// Converts this snapshot into a single-build aggregate, the shape every
    /// merge consumes.
    ///
    /// Each leaf becomes a run-length history of length one; flat failure
    /// counts become one run-length entry per type.
    pub fn into_aggregate(self) -> Result<AggregateResults, MergeError> {
        let tests = convert_full_results_tree(&self.tests, "tests")?;
        let num_failures_by_type = self
            .num_failures_by_type
            .into_iter()
            .map(|(ty, count)| (ty, [(1, count)].into_iter().collect()))
            .collect();
        Ok(AggregateResults {
            builder: self.builder_name,
            history: BuilderHistory {
                build_numbers: vec![self.build_number],
                blink_revisions: vec![self.blink_revision],
                chrome_revisions: vec![self.chromium_revision],
                times: vec![self.seconds_since_epoch],
                num_failures_by_type,
                tests,
            },
        })
    }
}

/// Per-leaf fields of the full-results trie.
#[derive(Deserialize)]
struct FullResultsLeaf {
    actual: String,
    #[serde(default)]
    expected: Option<String>,
    #[serde(default)]
    time: Option<f64>,
    #[serde(default)]
    bugs: Option<Vec<String>>,
}

fn convert_full_results_tree(value: &Value, context: &str) -> Result<TestTree, MergeError> {
    let map = value
        .as_object()
        .ok_or_else(|| FormatError::unexpected_shape(context))?;
    let mut children = IndexMap::new();
    for (key, child) in map {
        let child_context = format!("{context}/{key}");
        let child_map = child
            .as_object()
            .ok_or_else(|| FormatError::unexpected_shape(child_context.clone()))?;
        let node = if child_map.contains_key("actual") {
            TestTreeNode::Test(convert_full_results_leaf(child_map, &child_context)?)
        } else {
            TestTreeNode::Directory(convert_full_results_tree(child, &child_context)?)
        };
        children.insert(key.clone(), node);
    }
    Ok(TestTree { children })
}

fn convert_full_results_leaf(
    map: &Map<String, Value>,
    context: &str,
) -> Result<TestNode, MergeError> {
    let leaf: FullResultsLeaf = serde_json::from_value(Value::Object(map.clone()))
        .map_err(FormatError::from)?;

    let result = result_for_actual(&leaf.actual, context);
    let time = leaf.time.map_or(0, |t| t.round() as i64);
    // The harness default is PASS; only overrides are carried forward.
    let expected = leaf.expected.filter(|expected| expected != "PASS");

    Ok(TestNode {
        results: [(1, result)].into_iter().collect(),
        times: [(1, time)].into_iter().collect(),
        expected,
        bugs: leaf.bugs,
    })
}

/// Collapses a space-separated `actual` list (retries included) to one result
/// code: any PASS wins, otherwise the first recognizable entry, otherwise the
/// no-data sentinel.
fn result_for_actual(actual: &str, context: &str) -> ResultType {
    let mut tokens = actual.split_whitespace().peekable();
    if tokens.peek().is_none() {
        return ResultType::NoData;
    }
    let mut first = None;
    for token in tokens {
        match ResultType::from_name(token) {
            Ok(ResultType::Pass) => return ResultType::Pass,
            Ok(ty) => {
                first.get_or_insert(ty);
            }
            Err(_) => {
                debug!(context, token, "unrecognized actual result token");
            }
        }
    }
    first.unwrap_or(ResultType::NoData)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn wrapper_is_stripped_when_present() {
        assert_eq!(
            strip_json_wrapper("ADD_RESULTS({\"a\":1});").unwrap(),
            "{\"a\":1}"
        );
        assert_eq!(strip_json_wrapper("{\"a\":1}").unwrap(), "{\"a\":1}");
        assert!(matches!(
            strip_json_wrapper("ADD_RESULTS({\"a\":1}"),
            Err(FormatError::Envelope)
        ));
    }

    #[test]
    fn comments_are_stripped_outside_strings() {
        let input = "{\n// a comment\n\"url\": \"http://example.com\", /* block */ \"n\": 1}";
        let stripped = strip_comments(input).unwrap();
        let value: Value = serde_json::from_str(&stripped).unwrap();
        assert_eq!(value, json!({"url": "http://example.com", "n": 1}));
    }

    #[test]
    fn unterminated_block_comment_is_rejected() {
        assert!(matches!(
            strip_comments("{} /* never closed"),
            Err(FormatError::UnterminatedComment)
        ));
    }

    #[test]
    fn aggregate_requires_exactly_one_builder_key() {
        let err = AggregateResults::from_value(json!({"version": 4})).unwrap_err();
        assert!(matches!(
            err,
            MergeError::Format(FormatError::MissingKey { key: "builder" })
        ));

        let err = AggregateResults::from_value(json!({
            "version": 4,
            "Builder A": {"buildNumbers": [], "tests": {}},
            "Builder B": {"buildNumbers": [], "tests": {}},
        }))
        .unwrap_err();
        assert!(matches!(err, MergeError::Format(_)));
    }

    #[test]
    fn aggregate_accepts_numeric_build_numbers_and_revisions() {
        let aggregate = AggregateResults::from_value(json!({
            "Builder": {
                "buildNumbers": [3, "2"],
                "blinkRevision": [1002, 1001],
                "chromeRevision": ["5002", 5001],
                "secondsSinceEpoch": [1368146629.5, 1368136629],
                "num_failures_by_type": {"PASS": [[2, 10]]},
                "tests": {},
            },
            "version": 4,
        }))
        .unwrap();
        assert_eq!(aggregate.builder, "Builder");
        assert_eq!(aggregate.history.build_numbers, ["3", "2"]);
        assert_eq!(aggregate.history.blink_revisions, ["1002", "1001"]);
        assert_eq!(aggregate.history.chrome_revisions, ["5002", "5001"]);
        assert_eq!(aggregate.history.times, [1368146630, 1368136629]);
    }

    #[test]
    fn full_results_normalize_to_a_single_build_aggregate() {
        let full: FullResults = serde_json::from_value(json!({
            "builder_name": "Builder",
            "build_number": 3,
            "blink_revision": "1003",
            "chromium_revision": "5003",
            "seconds_since_epoch": 1368146629,
            "num_failures_by_type": {"PASS": 2, "TEXT": 1},
            "tests": {
                "fast": {
                    "001.html": {"actual": "TEXT", "expected": "PASS", "time": 0.4},
                    "002.html": {"actual": "FAIL PASS", "time": 2.0},
                },
                "003.html": {"actual": "CRASH", "expected": "CRASH", "bugs": ["crbug.com/9"]},
            },
        }))
        .unwrap();

        let aggregate = full.into_aggregate().unwrap();
        assert_eq!(aggregate.builder, "Builder");
        assert_eq!(aggregate.history.build_numbers, ["3"]);
        assert_eq!(
            aggregate.history.num_failures_by_type[&ResultType::Text].runs(),
            &[(1, 1)]
        );

        let tests = aggregate.history.tests.to_value(true);
        assert_eq!(
            tests,
            json!({
                "003.html": {
                    "results": [[1, "C"]],
                    "times": [[1, 0]],
                    "expected": "CRASH",
                    "bugs": ["crbug.com/9"],
                },
                "fast": {
                    "001.html": {"results": [[1, "F"]], "times": [[1, 0]]},
                    // Any PASS among retries counts as a pass.
                    "002.html": {"results": [[1, "P"]], "times": [[1, 2]]},
                },
            })
        );
    }

    #[test]
    fn actual_list_collapses_with_pass_priority() {
        assert_eq!(result_for_actual("TEXT PASS", "t"), ResultType::Pass);
        assert_eq!(result_for_actual("IMAGE TEXT", "t"), ResultType::Image);
        assert_eq!(result_for_actual("", "t"), ResultType::NoData);
        assert_eq!(result_for_actual("BOGUS", "t"), ResultType::NoData);
    }

    #[test]
    fn failure_map_covers_the_whole_alphabet() {
        let map = failure_map();
        let map = map.as_object().unwrap();
        assert_eq!(map.len(), ResultType::ALL.len());
        assert_eq!(map["N"], "NO DATA");
        assert_eq!(map["Z"], "IMAGE+TEXT");
    }
}
