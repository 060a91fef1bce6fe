//! Core runtime configuration.
//!
//! Configuration is resolved once at process startup and then passed into core services as an
//! `Arc<CoreConfig>`. Core code never reads process environment variables during request
//! handling; binaries read them once and use the `*_from_env_value` helpers here to parse them.

use crate::constants::{
    DEFAULT_USAGE_QUEUE_CAPACITY, DEFAULT_USAGE_TIMEOUT, DEFAULT_USAGE_WORKERS,
};
use crate::error::{ConfigError, ConfigResult};
use crate::lifecycle::TransitionPolicy;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Directory searched for template definitions when no override is configured.
pub const DEFAULT_TEMPLATE_DIR: &str = "templates";

/// Core configuration resolved at startup.
#[derive(Clone, Debug)]
pub struct CoreConfig {
    template_dir: Option<PathBuf>,
    usage_queue_capacity: usize,
    usage_workers: usize,
    usage_timeout: Duration,
    allow_blind_overwrite: bool,
    transition_policy: TransitionPolicy,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            template_dir: None,
            usage_queue_capacity: DEFAULT_USAGE_QUEUE_CAPACITY,
            usage_workers: DEFAULT_USAGE_WORKERS,
            usage_timeout: DEFAULT_USAGE_TIMEOUT,
            allow_blind_overwrite: true,
            transition_policy: TransitionPolicy::Unrestricted,
        }
    }
}

impl CoreConfig {
    /// Create a new `CoreConfig`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidInput`] if the queue capacity or worker count is zero, or
    /// the usage timeout is zero.
    pub fn new(
        template_dir: Option<PathBuf>,
        usage_queue_capacity: usize,
        usage_workers: usize,
        usage_timeout: Duration,
        allow_blind_overwrite: bool,
        transition_policy: TransitionPolicy,
    ) -> ConfigResult<Self> {
        if usage_queue_capacity == 0 {
            return Err(ConfigError::InvalidInput(
                "usage_queue_capacity must be greater than zero".into(),
            ));
        }
        if usage_workers == 0 {
            return Err(ConfigError::InvalidInput(
                "usage_workers must be greater than zero".into(),
            ));
        }
        if usage_timeout.is_zero() {
            return Err(ConfigError::InvalidInput(
                "usage_timeout must be greater than zero".into(),
            ));
        }

        Ok(Self {
            template_dir,
            usage_queue_capacity,
            usage_workers,
            usage_timeout,
            allow_blind_overwrite,
            transition_policy,
        })
    }

    pub fn template_dir(&self) -> Option<&Path> {
        self.template_dir.as_deref()
    }

    pub fn usage_queue_capacity(&self) -> usize {
        self.usage_queue_capacity
    }

    pub fn usage_workers(&self) -> usize {
        self.usage_workers
    }

    pub fn usage_timeout(&self) -> Duration {
        self.usage_timeout
    }

    pub fn allow_blind_overwrite(&self) -> bool {
        self.allow_blind_overwrite
    }

    pub fn transition_policy(&self) -> TransitionPolicy {
        self.transition_policy
    }
}

/// Resolve the template directory without reading environment variables.
///
/// If `override_dir` is provided it must be an existing directory. Otherwise `templates/`
/// relative to the current working directory is used when present. `Ok(None)` means no
/// template directory is configured, which is valid: templates can still be added at runtime.
pub fn resolve_template_dir(override_dir: Option<PathBuf>) -> ConfigResult<Option<PathBuf>> {
    if let Some(dir) = override_dir {
        if dir.is_dir() {
            return Ok(Some(dir));
        }
        return Err(ConfigError::InvalidInput(format!(
            "template directory override is not a directory: {}",
            dir.display()
        )));
    }

    let cwd_relative = PathBuf::from(DEFAULT_TEMPLATE_DIR);
    if cwd_relative.is_dir() {
        return Ok(Some(cwd_relative));
    }

    Ok(None)
}

/// Parse the transition policy from an optional string value.
///
/// `None`, empty or whitespace gives the default ([`TransitionPolicy::Unrestricted`]).
pub fn transition_policy_from_env_value(value: Option<String>) -> ConfigResult<TransitionPolicy> {
    match trimmed(value).as_deref() {
        None => Ok(TransitionPolicy::default()),
        Some("unrestricted") => Ok(TransitionPolicy::Unrestricted),
        Some("ordered") => Ok(TransitionPolicy::Ordered),
        Some(other) => Err(ConfigError::InvalidInput(format!(
            "unknown transition policy '{}' (expected 'unrestricted' or 'ordered')",
            other
        ))),
    }
}

/// Parse a positive integer setting, falling back to `default` when unset.
pub fn usize_from_env_value(
    name: &str,
    value: Option<String>,
    default: usize,
) -> ConfigResult<usize> {
    match trimmed(value) {
        None => Ok(default),
        Some(v) => v
            .parse::<usize>()
            .map_err(|e| ConfigError::InvalidInput(format!("{}: {}", name, e))),
    }
}

/// Parse a millisecond duration setting, falling back to `default` when unset.
pub fn duration_ms_from_env_value(
    name: &str,
    value: Option<String>,
    default: Duration,
) -> ConfigResult<Duration> {
    match trimmed(value) {
        None => Ok(default),
        Some(v) => v
            .parse::<u64>()
            .map(Duration::from_millis)
            .map_err(|e| ConfigError::InvalidInput(format!("{}: {}", name, e))),
    }
}

/// Parse a boolean setting (`true/false/1/0/yes/no`), falling back to `default` when unset.
pub fn bool_from_env_value(name: &str, value: Option<String>, default: bool) -> ConfigResult<bool> {
    match trimmed(value).map(|v| v.to_ascii_lowercase()).as_deref() {
        None => Ok(default),
        Some("true" | "1" | "yes") => Ok(true),
        Some("false" | "0" | "no") => Ok(false),
        Some(other) => Err(ConfigError::InvalidInput(format!(
            "{}: expected a boolean, got '{}'",
            name, other
        ))),
    }
}

fn trimmed(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}
