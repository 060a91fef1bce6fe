//! Error types for the visit record core.
//!
//! [`MutationError`] is the taxonomy callers see. Collaborator failures arrive as [`StoreError`]
//! and are folded into [`MutationError::Internal`] with a generic cause. Only the
//! [`StoreError::kind`] is logged; the store's own message is neither logged nor returned, since
//! a backend may echo row data into it. Clinical content must not appear in any message here.

/// Errors surfaced by the record mutation engine.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum MutationError {
    #[error("access denied")]
    AccessDenied,

    #[error("record not found")]
    NotFound,

    #[error("version conflict: expected {expected}, actual {actual}")]
    Conflict { expected: i64, actual: i64 },

    #[error("invalid {field}: {reason}")]
    Validation { field: &'static str, reason: String },

    #[error("internal error: {cause}")]
    Internal { cause: String },

    #[error("request cancelled")]
    Cancelled,

    #[error("request deadline exceeded")]
    DeadlineExceeded,
}

impl MutationError {
    pub(crate) fn validation(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Validation {
            field,
            reason: reason.into(),
        }
    }

    pub(crate) fn internal(cause: impl Into<String>) -> Self {
        Self::Internal {
            cause: cause.into(),
        }
    }

    /// Returns true when the caller may re-fetch and resubmit.
    ///
    /// Only [`MutationError::Conflict`] qualifies; the engine itself never retries.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}

pub type MutationResult<T> = std::result::Result<T, MutationError>;

/// Failure reported by an external collaborator (record store, template store, access gate).
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("store backend error: {0}")]
    Backend(String),
}

impl StoreError {
    /// Variant name, safe to log.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Unavailable(_) => "unavailable",
            Self::Backend(_) => "backend",
        }
    }
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Invalid startup configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    InvalidInput(String),
}

pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

/// Errors raised while loading or maintaining the template catalog.
#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("invalid template directory: {0}")]
    InvalidDirectory(String),

    #[error("failed to read template file: {0}")]
    FileRead(std::io::Error),

    #[error("template schema mismatch in {file} at {path}: {reason}")]
    Schema {
        file: String,
        path: String,
        reason: String,
    },

    #[error("duplicate template id {0}")]
    DuplicateId(String),

    #[error("template {0} not found")]
    NotFound(String),

    #[error("template {0} is a system template and cannot be deleted")]
    SystemTemplate(String),
}

pub type CatalogResult<T> = std::result::Result<T, CatalogError>;
