//! Canonical UUID identifiers.
//!
//! Visit records, patients, templates and schedules are all keyed by UUIDs. To keep identifiers
//! comparable as plain strings across stores, logs and snapshots, one *canonical* representation
//! is used everywhere: **32 lowercase hexadecimal characters** (no hyphens).
//!
//! ## Canonical UUID form
//! - Length: 32
//! - Characters: `0-9` and `a-f` only
//! - Example: `550e8400e29b41d4a716446655440000`
//!
//! Notes:
//! - This is the same value you would get from `Uuid::new_v4().simple().to_string()`.
//! - Canonical form is *required* for externally supplied identifiers (CLI arguments, snapshot
//!   files, caller requests). Use [`CanonicalUuid::parse`] to validate an input string.
//! - Non-canonical values (uppercase, hyphenated, wrong length, non-hex) are rejected.

mod service;

pub use service::{CanonicalUuid, Uuid};

/// Error type for UUID operations.
#[derive(Debug, thiserror::Error)]
pub enum UuidError {
    /// Invalid input provided
    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

/// Result type for UUID operations.
pub type UuidResult<T> = Result<T, UuidError>;
