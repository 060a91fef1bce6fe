//! Collaborator contracts consumed by the engine.
//!
//! Persistence, template storage and authorization live outside this crate. The engine only
//! relies on the narrow async interfaces below. Implementations must be `Send + Sync` so one
//! engine can serve many requests in parallel.
//!
//! The one hard requirement on a [`RecordStore`] is that
//! [`conditional_update`](RecordStore::conditional_update) compares the stored version and
//! writes in a single atomic step. Two round-trips (read, then unconditional write) would let
//! concurrent updates overwrite each other.

use crate::error::StoreResult;
use crate::ids::{ActorId, PatientId, RecordId, TemplateId};
use crate::record::{ClinicalRecord, ContentTemplate, NewClinicalRecord, RecordChanges};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Outcome of a compare-and-swap write.
#[derive(Clone, Debug, PartialEq)]
pub enum ConditionalUpdate {
    /// The stored version matched; the record now carries `expected_version + 1`.
    Applied(ClinicalRecord),
    /// The stored version differed; nothing was written.
    VersionMismatch { actual: i64 },
    /// No live record exists under that id for that patient.
    NotFound,
}

/// Outcome of a soft delete.
#[derive(Clone, Debug, PartialEq)]
pub enum SoftDelete {
    /// The record was marked deleted by this call.
    Deleted(ClinicalRecord),
    /// The record was already deleted; nothing was written.
    AlreadyDeleted,
    NotFound,
}

#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Fetches a record, including soft-deleted ones. Callers filter on `deleted`.
    async fn get(
        &self,
        patient_id: &PatientId,
        record_id: &RecordId,
    ) -> StoreResult<Option<ClinicalRecord>>;

    /// All records for a patient, including soft-deleted ones.
    async fn list(&self, patient_id: &PatientId) -> StoreResult<Vec<ClinicalRecord>>;

    /// Applies `changes` only if the stored version equals `expected_version`.
    async fn conditional_update(
        &self,
        patient_id: &PatientId,
        record_id: &RecordId,
        expected_version: i64,
        changes: RecordChanges,
    ) -> StoreResult<ConditionalUpdate>;

    /// Persists a new record, assigning its id and the initial version.
    async fn insert(&self, record: NewClinicalRecord) -> StoreResult<ClinicalRecord>;

    /// Marks a record deleted without removing it.
    async fn soft_delete(
        &self,
        patient_id: &PatientId,
        record_id: &RecordId,
        actor: &ActorId,
        at: DateTime<Utc>,
    ) -> StoreResult<SoftDelete>;
}

#[async_trait]
pub trait TemplateStore: Send + Sync {
    async fn get(&self, template_id: &TemplateId) -> StoreResult<Option<ContentTemplate>>;

    /// Best-effort usage counter bump.
    async fn increment_usage(&self, template_id: &TemplateId) -> StoreResult<()>;
}

#[async_trait]
pub trait AccessGate: Send + Sync {
    /// Whether `actor` may read and write records of `patient_id`.
    async fn check_access(&self, actor: &ActorId, patient_id: &PatientId) -> StoreResult<bool>;
}
