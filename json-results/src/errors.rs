// Copyright (c) The json-results Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Errors produced while parsing and merging result histories.

use thiserror::Error;

/// An error that occurs while decoding one of the wire formats.
///
/// Parsing routines raise immediately on malformed input rather than silently
/// defaulting, since a silently-defaulted history would corrupt build counts
/// for every merge that follows.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum FormatError {
    /// The payload is not valid JSON.
    #[error("payload is not valid JSON")]
    Json(#[from] serde_json::Error),

    /// The `ADD_RESULTS(...)` wrapper was opened but never closed.
    #[error("mismatched ADD_RESULTS wrapper")]
    Envelope,

    /// A `/* ... */` comment was opened but never closed.
    #[error("unterminated block comment")]
    UnterminatedComment,

    /// A run-length entry declared a count of zero.
    #[error("run-length entry has a zero count")]
    ZeroRunCount,

    /// A required key is absent from the payload.
    #[error("missing required key `{key}`")]
    MissingKey {
        /// The key that was expected.
        key: &'static str,
    },

    /// A value had an unexpected JSON shape.
    #[error("unexpected JSON shape at `{context}`")]
    UnexpectedShape {
        /// A path-like description of where the malformed value sits.
        context: String,
    },

    /// The incremental payload was empty while the aggregate was not.
    #[error("incremental payload is empty")]
    EmptyPayload,
}

impl FormatError {
    pub(crate) fn unexpected_shape(context: impl Into<String>) -> Self {
        Self::UnexpectedShape {
            context: context.into(),
        }
    }
}

/// A result character or result-type name outside the fixed alphabet.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("unknown result type `{token}`")]
pub struct UnknownResultError {
    /// The character or name that failed to resolve.
    pub token: String,
}

impl UnknownResultError {
    pub(crate) fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

/// Build-number bookkeeping that cannot be safely resolved by the merge.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum MergeConflictError {
    /// The incremental batch carries a build number already present in the
    /// retained aggregate history.
    #[error("build {build} is already present in the aggregate")]
    DuplicateBuild {
        /// The duplicated build number.
        build: String,
    },

    /// The incremental batch declares no builds at all.
    #[error("incremental batch contains no builds")]
    NoNewBuilds,

    /// The aggregate and the incremental payload belong to different builders.
    #[error("builder mismatch: expected `{expected}`, found `{found}`")]
    BuilderMismatch {
        /// The builder the merge was configured for.
        expected: String,
        /// The builder named by the payload.
        found: String,
    },
}

/// Both the aggregate and the incremental payload are empty or absent.
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
#[error("both the aggregate and the incremental payload are empty")]
pub struct EmptyInputError;

/// Any error surfaced by the merge entry points.
///
/// The merge entry point never propagates these past its own boundary: they
/// are converted to a non-success status code plus a diagnostic message (see
/// [`MergeOutcome`](crate::MergeOutcome)).
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum MergeError {
    /// A malformed payload.
    #[error(transparent)]
    Format(#[from] FormatError),

    /// A result code outside the alphabet.
    #[error(transparent)]
    UnknownResult(#[from] UnknownResultError),

    /// Inconsistent build-number bookkeeping.
    #[error(transparent)]
    Conflict(#[from] MergeConflictError),

    /// Nothing to merge on either side.
    #[error(transparent)]
    EmptyInput(#[from] EmptyInputError),
}

impl MergeError {
    /// The HTTP-equivalent status code for this error.
    ///
    /// The original results server rejected every bad merge with 403, and
    /// callers key off that convention, so every error class maps to it.
    pub fn status_code(&self) -> u16 {
        crate::merge::STATUS_REJECTED
    }
}
