//! Clinical visit record and content template models.
//!
//! Three shapes of record data exist:
//! - caller input ([`RecordDraft`], [`RecordPatch`]) with enum fields still as strings,
//! - validated store input ([`NewClinicalRecord`], [`RecordChanges`]),
//! - the stored [`ClinicalRecord`] handed back by a store.
//!
//! `record_id`, `patient_id` and `version` appear on neither input shape used for updates; only
//! stores assign ids and only the engine's conditional write advances versions.

use crate::document::Document;
use crate::ids::{ActorId, PatientId, RecordId, ScheduleId, TemplateId};
use crate::lifecycle::{RecordStatus, SourceType, Specialty, VisitType};
use chrono::{DateTime, Utc};
use serde::Deserialize;

/// Content as read back from a store.
#[derive(Clone, Debug, PartialEq)]
pub enum RecordContent {
    Document(Document),
    /// The stored bytes did not parse as a document.
    Unreadable,
}

impl RecordContent {
    pub fn as_document(&self) -> Option<&Document> {
        match self {
            Self::Document(doc) => Some(doc),
            Self::Unreadable => None,
        }
    }
}

impl From<Document> for RecordContent {
    fn from(doc: Document) -> Self {
        Self::Document(doc)
    }
}

/// A stored clinical visit record.
#[derive(Clone, Debug, PartialEq)]
pub struct ClinicalRecord {
    pub record_id: RecordId,
    pub patient_id: PatientId,
    pub visit_started_at: DateTime<Utc>,
    pub visit_ended_at: Option<DateTime<Utc>>,
    pub visit_type: VisitType,
    pub performed_by: ActorId,
    pub status: RecordStatus,
    pub source_type: SourceType,
    pub schedule_id: Option<ScheduleId>,
    pub template_id: Option<TemplateId>,
    pub source_record_id: Option<RecordId>,
    pub content: RecordContent,
    pub version: i64,
    pub deleted: bool,
    pub deleted_at: Option<DateTime<Utc>>,
    pub deleted_by: Option<ActorId>,
    pub created_by: ActorId,
    pub created_at: DateTime<Utc>,
    pub updated_by: ActorId,
    pub updated_at: DateTime<Utc>,
}

/// Caller input for creating a record. Enum fields are unvalidated strings.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct RecordDraft {
    pub visit_started_at: Option<DateTime<Utc>>,
    pub visit_ended_at: Option<DateTime<Utc>>,
    pub visit_type: Option<String>,
    pub performed_by: Option<String>,
    pub source_type: Option<String>,
    pub schedule_id: Option<String>,
    pub content: Option<Document>,
}

/// Caller input for a partial update. Absent fields are left unchanged.
///
/// `content`, when present, is deep-merged into the stored content rather than replacing it.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct RecordPatch {
    pub visit_started_at: Option<DateTime<Utc>>,
    pub visit_ended_at: Option<DateTime<Utc>>,
    pub visit_type: Option<String>,
    pub performed_by: Option<String>,
    pub status: Option<String>,
    pub source_type: Option<String>,
    pub schedule_id: Option<String>,
    pub content: Option<Document>,
}

impl RecordPatch {
    /// True when the patch carries nothing to change.
    pub fn is_empty(&self) -> bool {
        self.visit_started_at.is_none()
            && self.visit_ended_at.is_none()
            && self.visit_type.is_none()
            && self.performed_by.is_none()
            && self.status.is_none()
            && self.source_type.is_none()
            && self.schedule_id.is_none()
            && self.content.is_none()
    }
}

/// Validated input for [`crate::store::RecordStore::insert`].
#[derive(Clone, Debug, PartialEq)]
pub struct NewClinicalRecord {
    pub patient_id: PatientId,
    pub visit_started_at: DateTime<Utc>,
    pub visit_ended_at: Option<DateTime<Utc>>,
    pub visit_type: VisitType,
    pub performed_by: ActorId,
    pub status: RecordStatus,
    pub source_type: SourceType,
    pub schedule_id: Option<ScheduleId>,
    pub template_id: Option<TemplateId>,
    pub source_record_id: Option<RecordId>,
    pub content: Document,
    pub created_by: ActorId,
    pub created_at: DateTime<Utc>,
}

/// Validated changes for [`crate::store::RecordStore::conditional_update`].
///
/// `content`, when present, is the fully merged document to store.
#[derive(Clone, Debug, PartialEq)]
pub struct RecordChanges {
    pub visit_started_at: Option<DateTime<Utc>>,
    pub visit_ended_at: Option<DateTime<Utc>>,
    pub visit_type: Option<VisitType>,
    pub performed_by: Option<ActorId>,
    pub status: Option<RecordStatus>,
    pub source_type: Option<SourceType>,
    pub schedule_id: Option<ScheduleId>,
    pub content: Option<Document>,
    pub updated_by: ActorId,
    pub updated_at: DateTime<Utc>,
}

impl RecordChanges {
    /// Applies these changes to `record` in place, advancing it to `next_version`.
    ///
    /// Stores call this inside their compare-and-swap so the field mapping lives in one place.
    pub fn apply_to(&self, record: &mut ClinicalRecord, next_version: i64) {
        if let Some(at) = self.visit_started_at {
            record.visit_started_at = at;
        }
        if let Some(at) = self.visit_ended_at {
            record.visit_ended_at = Some(at);
        }
        if let Some(visit_type) = self.visit_type {
            record.visit_type = visit_type;
        }
        if let Some(performed_by) = &self.performed_by {
            record.performed_by = performed_by.clone();
        }
        if let Some(status) = self.status {
            record.status = status;
        }
        if let Some(source_type) = self.source_type {
            record.source_type = source_type;
        }
        if let Some(schedule_id) = self.schedule_id {
            record.schedule_id = Some(schedule_id);
        }
        if let Some(content) = &self.content {
            record.content = RecordContent::Document(content.clone());
        }
        record.updated_by = self.updated_by.clone();
        record.updated_at = self.updated_at;
        record.version = next_version;
    }
}

/// A reusable starting document for new records.
#[derive(Clone, Debug, PartialEq)]
pub struct ContentTemplate {
    pub template_id: TemplateId,
    pub name: String,
    pub specialty: Specialty,
    pub skeleton: Document,
    /// System templates ship with the product and cannot be deleted.
    pub is_system: bool,
    /// Best-effort count of records created from this template.
    pub usage_count: i64,
}

/// Non-fatal condition observed while applying a mutation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MutationWarning {
    /// Stored content could not be read, so the supplied content replaced it instead of being
    /// merged into it.
    ExistingContentUnreadable,
}

/// Result of a successful mutation.
#[derive(Clone, Debug, PartialEq)]
pub struct MutationOutcome {
    pub record: ClinicalRecord,
    pub warnings: Vec<MutationWarning>,
}

impl MutationOutcome {
    pub(crate) fn clean(record: ClinicalRecord) -> Self {
        Self {
            record,
            warnings: Vec::new(),
        }
    }
}
