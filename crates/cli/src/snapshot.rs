//! JSON snapshot of the in-memory stores.
//!
//! The CLI keeps all state in a single file: records, templates and access grants. Each
//! invocation loads the file into fresh in-memory stores, runs one command, and writes the
//! stores back out after a successful mutation.

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use visit_core::memory::{MemoryRecordStore, MemoryTemplateStore, StaticAccessGate};
use visit_core::{
    ActorId, ClinicalRecord, ContentTemplate, Document, PatientId, RecordContent, RecordId,
    RecordStatus, ScheduleId, SourceType, Specialty, TemplateId, VisitType,
};

fn is_false(value: &bool) -> bool {
    !*value
}

/// On-disk shape of a stored record.
#[derive(Debug, Serialize, Deserialize)]
pub struct RecordRow {
    pub record_id: RecordId,
    pub patient_id: PatientId,
    pub visit_started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub visit_ended_at: Option<DateTime<Utc>>,
    pub visit_type: VisitType,
    pub performed_by: ActorId,
    pub status: RecordStatus,
    pub source_type: SourceType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule_id: Option<ScheduleId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template_id: Option<TemplateId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_record_id: Option<RecordId>,
    #[serde(default)]
    pub content: Document,
    /// Set when the stored content could not be parsed; `content` is then meaningless.
    #[serde(default, skip_serializing_if = "is_false")]
    pub content_unreadable: bool,
    pub version: i64,
    #[serde(default)]
    pub deleted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_by: Option<ActorId>,
    pub created_by: ActorId,
    pub created_at: DateTime<Utc>,
    pub updated_by: ActorId,
    pub updated_at: DateTime<Utc>,
}

impl From<ClinicalRecord> for RecordRow {
    fn from(record: ClinicalRecord) -> Self {
        let (content, content_unreadable) = match record.content {
            RecordContent::Document(doc) => (doc, false),
            RecordContent::Unreadable => (Document::Null, true),
        };
        Self {
            record_id: record.record_id,
            patient_id: record.patient_id,
            visit_started_at: record.visit_started_at,
            visit_ended_at: record.visit_ended_at,
            visit_type: record.visit_type,
            performed_by: record.performed_by,
            status: record.status,
            source_type: record.source_type,
            schedule_id: record.schedule_id,
            template_id: record.template_id,
            source_record_id: record.source_record_id,
            content,
            content_unreadable,
            version: record.version,
            deleted: record.deleted,
            deleted_at: record.deleted_at,
            deleted_by: record.deleted_by,
            created_by: record.created_by,
            created_at: record.created_at,
            updated_by: record.updated_by,
            updated_at: record.updated_at,
        }
    }
}

impl From<RecordRow> for ClinicalRecord {
    fn from(row: RecordRow) -> Self {
        Self {
            record_id: row.record_id,
            patient_id: row.patient_id,
            visit_started_at: row.visit_started_at,
            visit_ended_at: row.visit_ended_at,
            visit_type: row.visit_type,
            performed_by: row.performed_by,
            status: row.status,
            source_type: row.source_type,
            schedule_id: row.schedule_id,
            template_id: row.template_id,
            source_record_id: row.source_record_id,
            content: if row.content_unreadable {
                RecordContent::Unreadable
            } else {
                RecordContent::Document(row.content)
            },
            version: row.version,
            deleted: row.deleted,
            deleted_at: row.deleted_at,
            deleted_by: row.deleted_by,
            created_by: row.created_by,
            created_at: row.created_at,
            updated_by: row.updated_by,
            updated_at: row.updated_at,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TemplateRow {
    pub template_id: TemplateId,
    pub name: String,
    pub specialty: Specialty,
    pub skeleton: Document,
    #[serde(default)]
    pub is_system: bool,
    #[serde(default)]
    pub usage_count: i64,
}

impl From<ContentTemplate> for TemplateRow {
    fn from(t: ContentTemplate) -> Self {
        Self {
            template_id: t.template_id,
            name: t.name,
            specialty: t.specialty,
            skeleton: t.skeleton,
            is_system: t.is_system,
            usage_count: t.usage_count,
        }
    }
}

impl From<TemplateRow> for ContentTemplate {
    fn from(row: TemplateRow) -> Self {
        Self {
            template_id: row.template_id,
            name: row.name,
            specialty: row.specialty,
            skeleton: row.skeleton,
            is_system: row.is_system,
            usage_count: row.usage_count,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct GrantRow {
    pub actor: ActorId,
    pub patient_id: PatientId,
}

/// The three in-memory collaborators behind one snapshot.
pub struct Stores {
    pub records: Arc<MemoryRecordStore>,
    pub templates: Arc<MemoryTemplateStore>,
    pub gate: Arc<StaticAccessGate>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct Snapshot {
    #[serde(default)]
    pub records: Vec<RecordRow>,
    #[serde(default)]
    pub templates: Vec<TemplateRow>,
    #[serde(default)]
    pub grants: Vec<GrantRow>,
}

impl Snapshot {
    /// Reads a snapshot file. A missing file is an empty snapshot.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            tracing::debug!(path = %path.display(), "snapshot file not found; starting empty");
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read snapshot {}", path.display()))?;
        serde_json::from_str(&text)
            .with_context(|| format!("failed to parse snapshot {}", path.display()))
    }

    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        let text = serde_json::to_string_pretty(self).context("failed to serialize snapshot")?;
        std::fs::write(path, text)
            .with_context(|| format!("failed to write snapshot {}", path.display()))
    }

    pub fn into_stores(self) -> anyhow::Result<Stores> {
        let records =
            MemoryRecordStore::with_records(self.records.into_iter().map(ClinicalRecord::from))
                .context("snapshot contains a duplicate record")?;
        let templates = MemoryTemplateStore::new();
        for row in self.templates {
            templates
                .insert(row.into())
                .context("snapshot contains a duplicate template")?;
        }
        let gate = StaticAccessGate::with_grants(
            self.grants.into_iter().map(|g| (g.actor, g.patient_id)),
        );

        Ok(Stores {
            records: Arc::new(records),
            templates: Arc::new(templates),
            gate: Arc::new(gate),
        })
    }

    pub fn capture(stores: &Stores) -> anyhow::Result<Self> {
        Ok(Self {
            records: stores
                .records
                .records()?
                .into_iter()
                .map(RecordRow::from)
                .collect(),
            templates: stores
                .templates
                .templates()?
                .into_iter()
                .map(TemplateRow::from)
                .collect(),
            grants: stores
                .gate
                .grants()?
                .into_iter()
                .map(|(actor, patient_id)| GrantRow { actor, patient_id })
                .collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_file_is_empty_snapshot() {
        let temp = TempDir::new().expect("Failed to create temp dir");
        let snapshot = Snapshot::load(&temp.path().join("store.json")).unwrap();
        assert!(snapshot.records.is_empty());
        assert!(snapshot.grants.is_empty());
    }

    fn unreadable_row(record_id: RecordId, patient_id: PatientId, actor: &ActorId) -> RecordRow {
        let now = Utc::now();
        RecordRow {
            record_id,
            patient_id,
            visit_started_at: now,
            visit_ended_at: None,
            visit_type: VisitType::Emergency,
            performed_by: actor.clone(),
            status: RecordStatus::InProgress,
            source_type: SourceType::VoiceToText,
            schedule_id: None,
            template_id: None,
            source_record_id: None,
            content: Document::Null,
            content_unreadable: true,
            version: 4,
            deleted: false,
            deleted_at: None,
            deleted_by: None,
            created_by: actor.clone(),
            created_at: now,
            updated_by: actor.clone(),
            updated_at: now,
        }
    }

    #[test]
    fn test_duplicate_record_ids_are_rejected() {
        let actor = ActorId::new("dr-abe").unwrap();
        let patient = PatientId::generate();
        let record_id = RecordId::generate();
        let snapshot = Snapshot {
            records: vec![
                unreadable_row(record_id, patient, &actor),
                unreadable_row(record_id, patient, &actor),
            ],
            ..Default::default()
        };

        let err = snapshot.into_stores().err().expect("duplicate ids must fail");
        assert!(format!("{:#}", err).contains("duplicate record"));
    }

    #[test]
    fn test_snapshot_survives_a_save_and_reload() {
        let temp = TempDir::new().expect("Failed to create temp dir");
        let path = temp.path().join("store.json");
        let actor = ActorId::new("dr-abe").unwrap();
        let patient = PatientId::generate();

        let snapshot = Snapshot {
            records: vec![unreadable_row(RecordId::generate(), patient, &actor)],
            templates: Vec::new(),
            grants: vec![GrantRow {
                actor: actor.clone(),
                patient_id: patient,
            }],
        };
        snapshot.save(&path).unwrap();

        let stores = Snapshot::load(&path).unwrap().into_stores().unwrap();
        let records = stores.records.records().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].version, 4);
        assert_eq!(records[0].content, RecordContent::Unreadable);
        assert_eq!(stores.gate.grants().unwrap(), vec![(actor, patient)]);
    }
}
