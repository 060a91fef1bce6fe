//! Optimistic concurrency guard.
//!
//! Records carry a version that starts at 1 and advances by exactly one on every write. Callers
//! state which version their edit was based on; a mismatch is a conflict and nothing is written.
//!
//! The guard is only a fast pre-check. The authoritative comparison happens again inside the
//! store's conditional write, keyed on the version the engine read.

use crate::error::{MutationError, MutationResult};
use serde::{Deserialize, Serialize};

/// What the caller believes the stored version to be.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "mode", content = "version")]
pub enum VersionExpectation {
    /// Write only if the stored version equals this value.
    Exact(i64),
    /// Blind last-writer-wins overwrite for callers that do not track versions.
    Overwrite,
}

impl VersionExpectation {
    /// Maps an optional caller-supplied version onto an expectation.
    pub fn from_optional(expected: Option<i64>) -> Self {
        match expected {
            Some(version) => Self::Exact(version),
            None => Self::Overwrite,
        }
    }

    pub fn is_overwrite(&self) -> bool {
        matches!(self, Self::Overwrite)
    }
}

/// Stateless version comparison.
#[derive(Clone, Copy, Debug, Default)]
pub struct VersionGuard;

impl VersionGuard {
    /// Checks `expectation` against `stored` and returns the version the write will produce.
    ///
    /// # Errors
    ///
    /// - [`MutationError::Conflict`] if an exact expectation does not match.
    /// - [`MutationError::Internal`] if `stored` cannot be advanced.
    pub fn check(stored: i64, expectation: VersionExpectation) -> MutationResult<i64> {
        if let VersionExpectation::Exact(expected) = expectation {
            if expected != stored {
                return Err(MutationError::Conflict {
                    expected,
                    actual: stored,
                });
            }
        }

        stored
            .checked_add(1)
            .ok_or_else(|| MutationError::internal("record version exhausted"))
    }
}
