//! Constants used throughout the visit core crate.

use std::time::Duration;

/// Version assigned to every newly inserted record.
pub const INITIAL_VERSION: i64 = 1;

/// Default capacity of the template usage queue.
pub const DEFAULT_USAGE_QUEUE_CAPACITY: usize = 256;

/// Default number of workers draining the template usage queue.
pub const DEFAULT_USAGE_WORKERS: usize = 2;

/// Default per-increment timeout for template usage updates.
pub const DEFAULT_USAGE_TIMEOUT: Duration = Duration::from_secs(2);

/// File extensions recognised as template definitions by the catalog loader.
pub const TEMPLATE_FILE_EXTENSIONS: &[&str] = &["yaml", "yml"];

/// Conventional top-level SOAP keys. Callers use these by convention; the engine never
/// validates content against them.
pub const SOAP_SUBJECTIVE: &str = "subjective";
pub const SOAP_OBJECTIVE: &str = "objective";
pub const SOAP_ASSESSMENT: &str = "assessment";
pub const SOAP_PLAN: &str = "plan";
