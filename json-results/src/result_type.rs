// Copyright (c) The json-results Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The fixed result-type alphabet.
//!
//! Every per-build outcome is drawn from a small closed set. Each type has a
//! single-character wire representation (used inside run-length-encoded
//! result histories) and a canonical name (used as `num_failures_by_type`
//! map keys and in full-results `actual`/`expected` lists). Both mappings are
//! total and bidirectional over the alphabet; anything outside it is an
//! [`UnknownResultError`].

use crate::errors::UnknownResultError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

/// A single test outcome.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ResultType {
    /// The test passed.
    Pass,
    /// The test was skipped by the harness.
    Skip,
    /// A generic failure.
    Fail,
    /// The test crashed.
    Crash,
    /// The test timed out.
    Timeout,
    /// The pixel output mismatched.
    Image,
    /// The text output mismatched.
    Text,
    /// Both pixel and text output mismatched.
    ImagePlusText,
    /// The audio output mismatched.
    Audio,
    /// An expected artifact was missing.
    Missing,
    /// The test leaked state into the following test.
    Leak,
    /// The test was listed but never ran.
    NotRun,
    /// No result was produced for this build. Backfilled during merge, not a
    /// real outcome.
    NoData,
}

impl ResultType {
    /// Every member of the alphabet.
    pub const ALL: [ResultType; 13] = [
        ResultType::Pass,
        ResultType::Skip,
        ResultType::Fail,
        ResultType::Crash,
        ResultType::Timeout,
        ResultType::Image,
        ResultType::Text,
        ResultType::ImagePlusText,
        ResultType::Audio,
        ResultType::Missing,
        ResultType::Leak,
        ResultType::NotRun,
        ResultType::NoData,
    ];

    /// The single-character wire representation.
    pub fn as_char(self) -> char {
        match self {
            ResultType::Pass => 'P',
            ResultType::Skip => 'X',
            ResultType::Fail => 'Q',
            ResultType::Crash => 'C',
            ResultType::Timeout => 'T',
            ResultType::Image => 'I',
            ResultType::Text => 'F',
            ResultType::ImagePlusText => 'Z',
            ResultType::Audio => 'A',
            ResultType::Missing => 'O',
            ResultType::Leak => 'K',
            ResultType::NotRun => 'Y',
            ResultType::NoData => 'N',
        }
    }

    /// Resolves a wire character.
    pub fn from_char(ch: char) -> Result<Self, UnknownResultError> {
        Self::ALL
            .iter()
            .copied()
            .find(|ty| ty.as_char() == ch)
            .ok_or_else(|| UnknownResultError::new(ch.to_string()))
    }

    /// The canonical result-type name.
    ///
    /// `IMAGE+TEXT` and `NO DATA` keep their historical wire punctuation.
    pub fn as_name(self) -> &'static str {
        match self {
            ResultType::Pass => "PASS",
            ResultType::Skip => "SKIP",
            ResultType::Fail => "FAIL",
            ResultType::Crash => "CRASH",
            ResultType::Timeout => "TIMEOUT",
            ResultType::Image => "IMAGE",
            ResultType::Text => "TEXT",
            ResultType::ImagePlusText => "IMAGE+TEXT",
            ResultType::Audio => "AUDIO",
            ResultType::Missing => "MISSING",
            ResultType::Leak => "LEAK",
            ResultType::NotRun => "NOTRUN",
            ResultType::NoData => "NO DATA",
        }
    }

    /// Resolves a canonical name.
    pub fn from_name(name: &str) -> Result<Self, UnknownResultError> {
        Self::ALL
            .iter()
            .copied()
            .find(|ty| ty.as_name() == name)
            .ok_or_else(|| UnknownResultError::new(name))
    }

    /// True for results that always count as passing.
    ///
    /// Used when deciding whether a test whose recent history is all-pass can
    /// be dropped from the output entirely.
    pub fn is_always_matching_as_pass(self) -> bool {
        matches!(self, ResultType::Pass)
    }

    /// Whether this type participates in the per-build failure histogram.
    ///
    /// Every type does, except the internal no-data sentinel.
    pub fn counts_toward_failure_histogram(self) -> bool {
        !matches!(self, ResultType::NoData)
    }

    /// Whether a history made entirely of this type is a candidate for
    /// pruning.
    ///
    /// NOTRUN and NO_DATA are always uninteresting; SKIP and PASS are
    /// uninteresting only in a history with no real failure, which is exactly
    /// what an all-droppable retained window means.
    pub fn is_droppable(self) -> bool {
        matches!(
            self,
            ResultType::Pass | ResultType::Skip | ResultType::NotRun | ResultType::NoData
        )
    }

    /// An ordered severity ranking.
    ///
    /// Non-outcomes rank below passing results, which rank below every
    /// failing type; among failures the ranking follows how disruptive the
    /// outcome is to the rest of the run.
    pub fn severity(self) -> u8 {
        match self {
            ResultType::NoData => 0,
            ResultType::NotRun => 1,
            ResultType::Skip => 2,
            ResultType::Pass => 3,
            ResultType::Text => 4,
            ResultType::Image => 5,
            ResultType::ImagePlusText => 6,
            ResultType::Audio => 7,
            ResultType::Missing => 8,
            ResultType::Fail => 9,
            ResultType::Leak => 10,
            ResultType::Timeout => 11,
            ResultType::Crash => 12,
        }
    }
}

impl fmt::Display for ResultType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_name())
    }
}

/// Serializes as the canonical name, so the type can key
/// `num_failures_by_type` maps directly.
impl Serialize for ResultType {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(self.as_name())
    }
}

impl<'de> Deserialize<'de> for ResultType {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let name = String::deserialize(deserializer)?;
        Self::from_name(&name).map_err(serde::de::Error::custom)
    }
}

/// A [`ResultType`] that serializes as its single-character wire form.
///
/// Run-length-encoded result histories store the char form; histogram keys
/// store the name form. This wrapper carries the char representation so both
/// can coexist on the same enum. (Parsing the char form goes through
/// [`ResultType::from_char`] so unknown characters surface as
/// [`UnknownResultError`] rather than a generic serde error.)
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct ResultChar(pub(crate) ResultType);

impl Serialize for ResultChar {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut buf = [0u8; 4];
        serializer.serialize_str(self.0.as_char().encode_utf8(&mut buf))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case('P', ResultType::Pass; "pass")]
    #[test_case('X', ResultType::Skip; "skip")]
    #[test_case('Q', ResultType::Fail; "fail")]
    #[test_case('C', ResultType::Crash; "crash")]
    #[test_case('T', ResultType::Timeout; "timeout")]
    #[test_case('I', ResultType::Image; "image")]
    #[test_case('F', ResultType::Text; "text")]
    #[test_case('Z', ResultType::ImagePlusText; "image plus text")]
    #[test_case('A', ResultType::Audio; "audio")]
    #[test_case('O', ResultType::Missing; "missing")]
    #[test_case('K', ResultType::Leak; "leak")]
    #[test_case('Y', ResultType::NotRun; "notrun")]
    #[test_case('N', ResultType::NoData; "no data")]
    fn char_mapping_is_bidirectional(ch: char, ty: ResultType) {
        assert_eq!(ResultType::from_char(ch).unwrap(), ty);
        assert_eq!(ty.as_char(), ch);
    }

    #[test]
    fn name_mapping_is_bidirectional_over_the_alphabet() {
        for ty in ResultType::ALL {
            assert_eq!(ResultType::from_name(ty.as_name()).unwrap(), ty);
        }
    }

    #[test]
    fn unknown_tokens_are_rejected() {
        assert_eq!(
            ResultType::from_char('?').unwrap_err(),
            UnknownResultError::new("?")
        );
        assert_eq!(
            ResultType::from_name("FLAKY").unwrap_err(),
            UnknownResultError::new("FLAKY")
        );
    }

    #[test]
    fn only_no_data_is_excluded_from_histograms() {
        for ty in ResultType::ALL {
            assert_eq!(
                ty.counts_toward_failure_histogram(),
                ty != ResultType::NoData,
                "{ty}"
            );
        }
    }

    #[test]
    fn droppable_set_is_exactly_the_non_failing_types() {
        for ty in ResultType::ALL {
            assert_eq!(
                ty.is_droppable(),
                ty.severity() <= ResultType::Pass.severity(),
                "{ty}"
            );
        }
    }

    #[test]
    fn result_char_serializes_as_single_character_string() {
        let json = serde_json::to_string(&ResultChar(ResultType::Text)).unwrap();
        assert_eq!(json, r#""F""#);
    }
}
