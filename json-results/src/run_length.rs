// Copyright (c) The json-results Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Run-length encoding of per-build values.
//!
//! Result histories and per-build elapsed times are stored as `[count, value]`
//! pairs, most recent first. The codec is generic over the value type: the
//! same sequence type carries result characters, elapsed seconds, and
//! per-type failure counts.

use crate::errors::FormatError;
use serde::{Deserialize, Serialize};

/// An ordered sequence of `(count, value)` runs.
///
/// Invariant: adjacent runs never share a value — construction through
/// [`push_run`](Self::push_run) and [`from_flat`](Self::from_flat) coalesces
/// them. Sequences arriving off the wire may transiently violate this; they
/// are re-coalesced the first time they flow through a merge.
///
/// On the wire each run serializes as a two-element JSON array
/// `[count, value]`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunLengthSequence<T> {
    runs: Vec<(u64, T)>,
}

impl<T> Default for RunLengthSequence<T> {
    fn default() -> Self {
        Self { runs: Vec::new() }
    }
}

impl<T> RunLengthSequence<T> {
    /// Creates an empty sequence.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the underlying runs.
    pub fn runs(&self) -> &[(u64, T)] {
        &self.runs
    }

    /// The decoded length, i.e. the sum of all run counts.
    pub fn total_len(&self) -> usize {
        self.runs.iter().map(|(count, _)| *count as usize).sum()
    }

    /// Returns true if the sequence holds no runs.
    pub fn is_empty(&self) -> bool {
        self.runs.is_empty()
    }

    /// Maps the run values, preserving counts.
    pub fn map<U>(self, f: impl FnMut(T) -> U) -> RunLengthSequence<U> {
        let mut f = f;
        RunLengthSequence {
            runs: self
                .runs
                .into_iter()
                .map(|(count, value)| (count, f(value)))
                .collect(),
        }
    }
}

impl<T: PartialEq> RunLengthSequence<T> {
    /// Appends a run, coalescing with the trailing run when the values match.
    ///
    /// A zero count is ignored.
    pub fn push_run(&mut self, count: u64, value: T) {
        if count == 0 {
            return;
        }
        match self.runs.last_mut() {
            Some((last_count, last_value)) if *last_value == value => {
                *last_count += count;
            }
            _ => self.runs.push((count, value)),
        }
    }

    /// Encodes a flat sequence, coalescing adjacent equal values in order.
    ///
    /// Round-trip law: `from_flat(decode(s)) == s` for any already-coalesced
    /// `s`.
    pub fn from_flat(values: impl IntoIterator<Item = T>) -> Self {
        let mut seq = Self::new();
        for value in values {
            seq.push_run(1, value);
        }
        seq
    }
}

impl<T: Clone> RunLengthSequence<T> {
    /// Expands each run into `count` repetitions, concatenated in order.
    ///
    /// Fails with [`FormatError::ZeroRunCount`] if any run declares a zero
    /// count. (Non-integer counts are rejected earlier, at deserialization.)
    pub fn decode(&self) -> Result<Vec<T>, FormatError> {
        let mut flat = Vec::with_capacity(self.total_len());
        for (count, value) in &self.runs {
            if *count == 0 {
                return Err(FormatError::ZeroRunCount);
            }
            flat.extend(std::iter::repeat_n(value.clone(), *count as usize));
        }
        Ok(flat)
    }
}

impl<T> FromIterator<(u64, T)> for RunLengthSequence<T>
where
    T: PartialEq,
{
    fn from_iter<I: IntoIterator<Item = (u64, T)>>(iter: I) -> Self {
        let mut seq = Self::new();
        for (count, value) in iter {
            seq.push_run(count, value);
        }
        seq
    }
}
