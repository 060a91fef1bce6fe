//! In-process collaborators.
//!
//! [`MemoryRecordStore`], [`MemoryTemplateStore`] and [`StaticAccessGate`] implement the
//! collaborator traits without any external service. They back the test suite and the `visit`
//! command-line tool.
//!
//! The record store keeps content as JSON text, the way a database JSON column would, and parses
//! it on every read. Text that no longer parses comes back as [`RecordContent::Unreadable`].
//! Each compare-and-swap runs under a single lock acquisition.

use crate::constants::INITIAL_VERSION;
use crate::document::Document;
use crate::error::{CatalogError, CatalogResult, StoreError, StoreResult};
use crate::ids::{ActorId, PatientId, RecordId, TemplateId};
use crate::record::{
    ClinicalRecord, ContentTemplate, NewClinicalRecord, RecordChanges, RecordContent,
};
use crate::store::{AccessGate, ConditionalUpdate, RecordStore, SoftDelete, TemplateStore};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeSet, HashMap};
use std::sync::{Mutex, MutexGuard};

fn lock<'a, T>(mutex: &'a Mutex<T>, what: &str) -> StoreResult<MutexGuard<'a, T>> {
    mutex
        .lock()
        .map_err(|_| StoreError::Backend(format!("{} lock poisoned", what)))
}

#[derive(Clone, Debug)]
struct StoredRecord {
    /// Every field except content, which lives in `content_json`.
    record: ClinicalRecord,
    content_json: String,
}

impl StoredRecord {
    fn new(record: ClinicalRecord) -> Self {
        let content_json = match &record.content {
            RecordContent::Document(doc) => doc.to_json_string(),
            RecordContent::Unreadable => String::new(),
        };
        Self {
            record,
            content_json,
        }
    }

    fn materialize(&self) -> ClinicalRecord {
        let mut record = self.record.clone();
        record.content = match Document::parse(&self.content_json) {
            Ok(doc) => RecordContent::Document(doc),
            Err(_) => RecordContent::Unreadable,
        };
        record
    }
}

/// Record store holding everything in a process-local map.
#[derive(Debug, Default)]
pub struct MemoryRecordStore {
    rows: Mutex<HashMap<RecordId, StoredRecord>>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a store pre-populated with existing records, keeping their ids and versions.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Backend`] if two records share a record id.
    pub fn with_records(records: impl IntoIterator<Item = ClinicalRecord>) -> StoreResult<Self> {
        let mut rows = HashMap::new();
        for record in records {
            let record_id = record.record_id;
            if rows.insert(record_id, StoredRecord::new(record)).is_some() {
                return Err(StoreError::Backend(format!(
                    "duplicate record id {}",
                    record_id
                )));
            }
        }
        Ok(Self {
            rows: Mutex::new(rows),
        })
    }

    /// Every stored record, deleted ones included, ordered by patient then record id.
    pub fn records(&self) -> StoreResult<Vec<ClinicalRecord>> {
        let rows = lock(&self.rows, "record store")?;
        let mut records: Vec<ClinicalRecord> = rows.values().map(StoredRecord::materialize).collect();
        records.sort_by(|a, b| {
            (a.patient_id, a.record_id).cmp(&(b.patient_id, b.record_id))
        });
        Ok(records)
    }

    /// Replaces the stored content text of a record without any validation.
    #[cfg(test)]
    pub(crate) fn overwrite_raw_content(&self, record_id: &RecordId, raw: &str) {
        let mut rows = self.rows.lock().expect("record store lock");
        if let Some(row) = rows.get_mut(record_id) {
            row.content_json = raw.to_string();
        }
    }

    fn patient_row<'a>(
        rows: &'a mut HashMap<RecordId, StoredRecord>,
        patient_id: &PatientId,
        record_id: &RecordId,
    ) -> Option<&'a mut StoredRecord> {
        rows.get_mut(record_id)
            .filter(|row| row.record.patient_id == *patient_id)
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn get(
        &self,
        patient_id: &PatientId,
        record_id: &RecordId,
    ) -> StoreResult<Option<ClinicalRecord>> {
        let rows = lock(&self.rows, "record store")?;
        Ok(rows
            .get(record_id)
            .filter(|row| row.record.patient_id == *patient_id)
            .map(StoredRecord::materialize))
    }

    async fn list(&self, patient_id: &PatientId) -> StoreResult<Vec<ClinicalRecord>> {
        let rows = lock(&self.rows, "record store")?;
        Ok(rows
            .values()
            .filter(|row| row.record.patient_id == *patient_id)
            .map(StoredRecord::materialize)
            .collect())
    }

    async fn conditional_update(
        &self,
        patient_id: &PatientId,
        record_id: &RecordId,
        expected_version: i64,
        changes: RecordChanges,
    ) -> StoreResult<ConditionalUpdate> {
        let mut rows = lock(&self.rows, "record store")?;
        let Some(row) = Self::patient_row(&mut rows, patient_id, record_id) else {
            return Ok(ConditionalUpdate::NotFound);
        };
        if row.record.deleted {
            return Ok(ConditionalUpdate::NotFound);
        }
        if row.record.version != expected_version {
            return Ok(ConditionalUpdate::VersionMismatch {
                actual: row.record.version,
            });
        }

        let next_version = expected_version
            .checked_add(1)
            .ok_or_else(|| StoreError::Backend("record version exhausted".into()))?;
        changes.apply_to(&mut row.record, next_version);
        if let Some(content) = &changes.content {
            row.content_json = content.to_json_string();
        }

        Ok(ConditionalUpdate::Applied(row.materialize()))
    }

    async fn insert(&self, new: NewClinicalRecord) -> StoreResult<ClinicalRecord> {
        let record = ClinicalRecord {
            record_id: RecordId::generate(),
            patient_id: new.patient_id,
            visit_started_at: new.visit_started_at,
            visit_ended_at: new.visit_ended_at,
            visit_type: new.visit_type,
            performed_by: new.performed_by,
            status: new.status,
            source_type: new.source_type,
            schedule_id: new.schedule_id,
            template_id: new.template_id,
            source_record_id: new.source_record_id,
            content: RecordContent::Document(new.content),
            version: INITIAL_VERSION,
            deleted: false,
            deleted_at: None,
            deleted_by: None,
            updated_by: new.created_by.clone(),
            updated_at: new.created_at,
            created_by: new.created_by,
            created_at: new.created_at,
        };

        let row = StoredRecord::new(record);
        let stored = row.materialize();
        let mut rows = lock(&self.rows, "record store")?;
        if rows.contains_key(&stored.record_id) {
            return Err(StoreError::Backend("record id collision".into()));
        }
        rows.insert(stored.record_id, row);
        Ok(stored)
    }

    async fn soft_delete(
        &self,
        patient_id: &PatientId,
        record_id: &RecordId,
        actor: &ActorId,
        at: DateTime<Utc>,
    ) -> StoreResult<SoftDelete> {
        let mut rows = lock(&self.rows, "record store")?;
        let Some(row) = Self::patient_row(&mut rows, patient_id, record_id) else {
            return Ok(SoftDelete::NotFound);
        };
        if row.record.deleted {
            return Ok(SoftDelete::AlreadyDeleted);
        }

        let record = &mut row.record;
        record.version = record
            .version
            .checked_add(1)
            .ok_or_else(|| StoreError::Backend("record version exhausted".into()))?;
        record.deleted = true;
        record.deleted_at = Some(at);
        record.deleted_by = Some(actor.clone());
        record.updated_by = actor.clone();
        record.updated_at = at;

        Ok(SoftDelete::Deleted(row.materialize()))
    }
}

/// Template store holding templates in a process-local map.
#[derive(Debug, Default)]
pub struct MemoryTemplateStore {
    templates: Mutex<HashMap<TemplateId, ContentTemplate>>,
}

impl MemoryTemplateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a template.
    ///
    /// # Errors
    ///
    /// Returns [`CatalogError::DuplicateId`] if a template with the same id already exists.
    pub fn insert(&self, template: ContentTemplate) -> CatalogResult<()> {
        let mut templates = self
            .templates
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if templates.contains_key(&template.template_id) {
            return Err(CatalogError::DuplicateId(template.template_id.to_string()));
        }
        templates.insert(template.template_id, template);
        Ok(())
    }

    /// Removes a non-system template.
    ///
    /// # Errors
    ///
    /// - [`CatalogError::NotFound`] if no such template exists.
    /// - [`CatalogError::SystemTemplate`] if the template ships with the product.
    pub fn remove(&self, template_id: &TemplateId) -> CatalogResult<ContentTemplate> {
        let mut templates = self
            .templates
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        match templates.get(template_id) {
            None => Err(CatalogError::NotFound(template_id.to_string())),
            Some(t) if t.is_system => Err(CatalogError::SystemTemplate(template_id.to_string())),
            Some(_) => templates
                .remove(template_id)
                .ok_or_else(|| CatalogError::NotFound(template_id.to_string())),
        }
    }

    /// All templates, ordered by name.
    pub fn templates(&self) -> StoreResult<Vec<ContentTemplate>> {
        let templates = lock(&self.templates, "template store")?;
        let mut all: Vec<ContentTemplate> = templates.values().cloned().collect();
        all.sort_by(|a, b| a.name.cmp(&b.name).then(a.template_id.cmp(&b.template_id)));
        Ok(all)
    }
}

#[async_trait]
impl TemplateStore for MemoryTemplateStore {
    async fn get(&self, template_id: &TemplateId) -> StoreResult<Option<ContentTemplate>> {
        let templates = lock(&self.templates, "template store")?;
        Ok(templates.get(template_id).cloned())
    }

    async fn increment_usage(&self, template_id: &TemplateId) -> StoreResult<()> {
        let mut templates = lock(&self.templates, "template store")?;
        let template = templates
            .get_mut(template_id)
            .ok_or_else(|| StoreError::Backend(format!("template {} not found", template_id)))?;
        template.usage_count = template.usage_count.saturating_add(1);
        Ok(())
    }
}

/// Access gate backed by an explicit set of (actor, patient) grants.
#[derive(Debug, Default)]
pub struct StaticAccessGate {
    grants: Mutex<BTreeSet<(ActorId, PatientId)>>,
}

impl StaticAccessGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_grants(grants: impl IntoIterator<Item = (ActorId, PatientId)>) -> Self {
        Self {
            grants: Mutex::new(grants.into_iter().collect()),
        }
    }

    /// Allows `actor` to read and write records of `patient_id`.
    pub fn grant(&self, actor: ActorId, patient_id: PatientId) -> StoreResult<()> {
        lock(&self.grants, "access gate")?.insert((actor, patient_id));
        Ok(())
    }

    pub fn revoke(&self, actor: &ActorId, patient_id: &PatientId) -> StoreResult<bool> {
        Ok(lock(&self.grants, "access gate")?.remove(&(actor.clone(), *patient_id)))
    }

    /// Every grant, in a stable order.
    pub fn grants(&self) -> StoreResult<Vec<(ActorId, PatientId)>> {
        Ok(lock(&self.grants, "access gate")?.iter().cloned().collect())
    }
}

#[async_trait]
impl AccessGate for StaticAccessGate {
    async fn check_access(&self, actor: &ActorId, patient_id: &PatientId) -> StoreResult<bool> {
        Ok(lock(&self.grants, "access gate")?.contains(&(actor.clone(), *patient_id)))
    }
}
