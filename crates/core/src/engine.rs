//! Record mutation engine.
//!
//! Every mutation follows the same pipeline:
//! access check, field validation, version check, content merge, then a single conditional
//! write to the record store. The engine holds no per-request state and no locks, so one
//! instance behind an `Arc` serves any number of concurrent requests. Exclusion between writers
//! to the same record comes entirely from the store's compare-and-swap.
//!
//! Log lines carry identifiers, versions and enum values only. Record content never reaches a
//! log or an error message.

use crate::config::CoreConfig;
use crate::context::RequestContext;
use crate::document::Document;
use crate::error::{MutationError, MutationResult, StoreError};
use crate::ids::{ActorId, PatientId, RecordId, ScheduleId};
use crate::instantiate::{CopyRequest, FromTemplateRequest, TemplateInstantiator, VisitDetails};
use crate::lifecycle::{parse_member, RecordStatus, SourceType, VisitType, WireEnum};
use crate::merge::merge_stored;
use crate::record::{
    ClinicalRecord, MutationOutcome, MutationWarning, NewClinicalRecord, RecordChanges,
    RecordDraft, RecordPatch,
};
use crate::store::{AccessGate, ConditionalUpdate, RecordStore, SoftDelete, TemplateStore};
use crate::usage::{Enqueue, UsageRecorder, UsageStats};
use crate::version::{VersionExpectation, VersionGuard};
use chrono::{DateTime, Utc};
use std::sync::Arc;

/// Maps a collaborator failure onto a generic internal error. Only the error kind is logged.
fn store_failure(operation: &'static str) -> impl FnOnce(StoreError) -> MutationError {
    move |e| {
        tracing::error!(operation, kind = e.kind(), "collaborator call failed");
        MutationError::internal(format!("{} failed", operation))
    }
}

fn check_visit_window(
    started: DateTime<Utc>,
    ended: Option<DateTime<Utc>>,
) -> MutationResult<()> {
    match ended {
        Some(ended) if ended < started => Err(MutationError::validation(
            "visit_ended_at",
            "must not be earlier than visit_started_at",
        )),
        _ => Ok(()),
    }
}

fn parse_schedule_id(value: Option<&str>) -> MutationResult<Option<ScheduleId>> {
    value.map(ScheduleId::parse).transpose()
}

/// Validates caller input for a new record. Status always starts as draft.
fn validate_draft(
    patient_id: PatientId,
    draft: RecordDraft,
    actor: &ActorId,
    now: DateTime<Utc>,
) -> MutationResult<NewClinicalRecord> {
    let visit_started_at = draft
        .visit_started_at
        .ok_or_else(|| MutationError::validation("visit_started_at", "required"))?;
    let performed_by = match draft.performed_by.as_deref() {
        Some(value) => ActorId::parse_field("performed_by", value)?,
        None => return Err(MutationError::validation("performed_by", "required")),
    };
    let visit_type = match draft.visit_type.as_deref() {
        Some(value) => parse_member("visit_type", value)?,
        None => VisitType::Regular,
    };
    let source_type = match draft.source_type.as_deref() {
        Some(value) => parse_member("source_type", value)?,
        None => SourceType::Manual,
    };
    let schedule_id = parse_schedule_id(draft.schedule_id.as_deref())?;
    check_visit_window(visit_started_at, draft.visit_ended_at)?;

    Ok(NewClinicalRecord {
        patient_id,
        visit_started_at,
        visit_ended_at: draft.visit_ended_at,
        visit_type,
        performed_by,
        status: RecordStatus::Draft,
        source_type,
        schedule_id,
        template_id: None,
        source_record_id: None,
        content: draft.content.unwrap_or_else(Document::empty_object),
        created_by: actor.clone(),
        created_at: now,
    })
}

/// Validates the non-content fields of a patch against the current record.
fn validate_patch(
    current: &ClinicalRecord,
    patch: &RecordPatch,
    cfg: &CoreConfig,
    actor: &ActorId,
    now: DateTime<Utc>,
) -> MutationResult<RecordChanges> {
    let visit_type = patch
        .visit_type
        .as_deref()
        .map(|v| parse_member::<VisitType>("visit_type", v))
        .transpose()?;
    let status = patch
        .status
        .as_deref()
        .map(|v| parse_member::<RecordStatus>("status", v))
        .transpose()?;
    let source_type = patch
        .source_type
        .as_deref()
        .map(|v| parse_member::<SourceType>("source_type", v))
        .transpose()?;
    let performed_by = patch
        .performed_by
        .as_deref()
        .map(|v| ActorId::parse_field("performed_by", v))
        .transpose()?;
    let schedule_id = parse_schedule_id(patch.schedule_id.as_deref())?;

    if let Some(next) = status {
        cfg.transition_policy().check(current.status, next)?;
    }
    check_visit_window(
        patch.visit_started_at.unwrap_or(current.visit_started_at),
        patch.visit_ended_at.or(current.visit_ended_at),
    )?;

    Ok(RecordChanges {
        visit_started_at: patch.visit_started_at,
        visit_ended_at: patch.visit_ended_at,
        visit_type,
        performed_by,
        status,
        source_type,
        schedule_id,
        content: None,
        updated_by: actor.clone(),
        updated_at: now,
    })
}

/// Builds a template-sourced draft from optional visit details.
fn instance_draft(
    details: VisitDetails,
    default_visit_type: VisitType,
    content: Document,
    actor: &ActorId,
    now: DateTime<Utc>,
) -> RecordDraft {
    RecordDraft {
        visit_started_at: Some(details.visit_started_at.unwrap_or(now)),
        visit_ended_at: details.visit_ended_at,
        visit_type: Some(
            details
                .visit_type
                .unwrap_or_else(|| default_visit_type.as_str().to_string()),
        ),
        performed_by: Some(
            details
                .performed_by
                .unwrap_or_else(|| actor.as_str().to_string()),
        ),
        source_type: Some(SourceType::Template.as_str().to_string()),
        schedule_id: details.schedule_id,
        content: Some(content),
    }
}

/// Orchestrates access checks, validation, version checks and merges for visit records.
pub struct RecordMutationEngine {
    records: Arc<dyn RecordStore>,
    templates: Arc<dyn TemplateStore>,
    access: Arc<dyn AccessGate>,
    cfg: Arc<CoreConfig>,
    usage: UsageRecorder,
}

impl RecordMutationEngine {
    /// Creates an engine and starts its template usage workers.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(
        records: Arc<dyn RecordStore>,
        templates: Arc<dyn TemplateStore>,
        access: Arc<dyn AccessGate>,
        cfg: Arc<CoreConfig>,
    ) -> Self {
        let usage = UsageRecorder::spawn(Arc::clone(&templates), &cfg);
        Self {
            records,
            templates,
            access,
            cfg,
            usage,
        }
    }

    pub fn config(&self) -> &CoreConfig {
        &self.cfg
    }

    pub fn usage_stats(&self) -> UsageStats {
        self.usage.stats()
    }

    /// Stops accepting usage increments and waits for queued ones to finish.
    pub async fn shutdown(&self) {
        self.usage.shutdown().await;
    }

    async fn authorize(
        &self,
        ctx: &RequestContext,
        actor: &ActorId,
        patient_id: &PatientId,
    ) -> MutationResult<()> {
        let allowed = ctx
            .run(self.access.check_access(actor, patient_id))
            .await?
            .map_err(store_failure("access check"))?;

        if allowed {
            Ok(())
        } else {
            tracing::warn!(%actor, %patient_id, "access denied");
            Err(MutationError::AccessDenied)
        }
    }

    /// Fetches a record that exists and is not soft-deleted.
    async fn fetch_live(
        &self,
        ctx: &RequestContext,
        patient_id: &PatientId,
        record_id: &RecordId,
    ) -> MutationResult<ClinicalRecord> {
        ctx.run(self.records.get(patient_id, record_id))
            .await?
            .map_err(store_failure("record store get"))?
            .filter(|record| !record.deleted)
            .ok_or(MutationError::NotFound)
    }

    async fn insert(
        &self,
        ctx: &RequestContext,
        new: NewClinicalRecord,
    ) -> MutationResult<ClinicalRecord> {
        let record = ctx
            .run(self.records.insert(new))
            .await?
            .map_err(store_failure("record store insert"))?;

        tracing::info!(
            record_id = %record.record_id,
            patient_id = %record.patient_id,
            source_type = %record.source_type,
            version = record.version,
            "record created"
        );
        Ok(record)
    }

    /// Creates a new draft record at version 1.
    ///
    /// `visit_started_at` and `performed_by` are required. `visit_type` defaults to `regular`
    /// and `source_type` to `manual`.
    pub async fn create(
        &self,
        ctx: &RequestContext,
        patient_id: &PatientId,
        draft: RecordDraft,
        actor: &ActorId,
    ) -> MutationResult<MutationOutcome> {
        let new = validate_draft(*patient_id, draft, actor, Utc::now())?;
        self.authorize(ctx, actor, patient_id).await?;
        let record = self.insert(ctx, new).await?;
        Ok(MutationOutcome::clean(record))
    }

    /// Applies a partial update.
    ///
    /// Supplied content is deep-merged into the stored content. On success the version advances
    /// by exactly one.
    ///
    /// # Errors
    ///
    /// - [`MutationError::Conflict`] if `expectation` is stale, or another writer committed
    ///   between the read and the write.
    /// - [`MutationError::Validation`] for invalid fields, a forbidden status transition, an
    ///   empty patch, or a blind overwrite when those are disabled.
    pub async fn update(
        &self,
        ctx: &RequestContext,
        patient_id: &PatientId,
        record_id: &RecordId,
        patch: RecordPatch,
        expectation: VersionExpectation,
        actor: &ActorId,
    ) -> MutationResult<MutationOutcome> {
        self.authorize(ctx, actor, patient_id).await?;

        if expectation.is_overwrite() && !self.cfg.allow_blind_overwrite() {
            return Err(MutationError::validation("expected_version", "required"));
        }
        if patch.is_empty() {
            return Err(MutationError::validation("patch", "no fields to update"));
        }

        let current = self.fetch_live(ctx, patient_id, record_id).await?;
        let next_version = VersionGuard::check(current.version, expectation)?;
        let mut changes = validate_patch(&current, &patch, &self.cfg, actor, Utc::now())?;

        let mut warnings = Vec::new();
        if let Some(update) = &patch.content {
            let merged = merge_stored(&current.content, update);
            if merged.replaced_unreadable() {
                tracing::warn!(
                    %record_id,
                    version = current.version,
                    "stored content unreadable; replacing it with the supplied content"
                );
                warnings.push(MutationWarning::ExistingContentUnreadable);
            }
            changes.content = Some(merged.into_document());
        }

        let written = ctx
            .run(
                self.records
                    .conditional_update(patient_id, record_id, current.version, changes),
            )
            .await?
            .map_err(store_failure("record store conditional update"))?;

        match written {
            ConditionalUpdate::Applied(record) => {
                tracing::info!(
                    %record_id,
                    version = record.version,
                    blind = expectation.is_overwrite(),
                    "record updated"
                );
                if record.version != next_version {
                    tracing::error!(
                        %record_id,
                        expected = next_version,
                        actual = record.version,
                        "record store advanced version unexpectedly"
                    );
                }
                Ok(MutationOutcome { record, warnings })
            }
            ConditionalUpdate::VersionMismatch { actual } => {
                tracing::info!(
                    %record_id,
                    expected = current.version,
                    actual,
                    "concurrent update lost the race"
                );
                Err(MutationError::Conflict {
                    expected: current.version,
                    actual,
                })
            }
            ConditionalUpdate::NotFound => Err(MutationError::NotFound),
        }
    }

    /// Soft-deletes a record. Deleting an already deleted record succeeds without writing.
    pub async fn delete(
        &self,
        ctx: &RequestContext,
        patient_id: &PatientId,
        record_id: &RecordId,
        actor: &ActorId,
    ) -> MutationResult<MutationOutcome> {
        self.authorize(ctx, actor, patient_id).await?;

        let outcome = ctx
            .run(
                self.records
                    .soft_delete(patient_id, record_id, actor, Utc::now()),
            )
            .await?
            .map_err(store_failure("record store soft delete"))?;

        match outcome {
            SoftDelete::Deleted(record) => {
                tracing::info!(%record_id, version = record.version, "record deleted");
                Ok(MutationOutcome::clean(record))
            }
            SoftDelete::AlreadyDeleted => {
                tracing::debug!(%record_id, "record already deleted");
                let record = ctx
                    .run(self.records.get(patient_id, record_id))
                    .await?
                    .map_err(store_failure("record store get"))?
                    .ok_or(MutationError::NotFound)?;
                Ok(MutationOutcome::clean(record))
            }
            SoftDelete::NotFound => Err(MutationError::NotFound),
        }
    }

    /// Reads one live record.
    pub async fn get(
        &self,
        ctx: &RequestContext,
        patient_id: &PatientId,
        record_id: &RecordId,
        actor: &ActorId,
    ) -> MutationResult<ClinicalRecord> {
        self.authorize(ctx, actor, patient_id).await?;
        self.fetch_live(ctx, patient_id, record_id).await
    }

    /// Lists a patient's live records, newest visit first.
    pub async fn list(
        &self,
        ctx: &RequestContext,
        patient_id: &PatientId,
        actor: &ActorId,
    ) -> MutationResult<Vec<ClinicalRecord>> {
        self.authorize(ctx, actor, patient_id).await?;

        let mut records: Vec<ClinicalRecord> = ctx
            .run(self.records.list(patient_id))
            .await?
            .map_err(store_failure("record store list"))?
            .into_iter()
            .filter(|record| !record.deleted)
            .collect();
        records.sort_by(|a, b| {
            b.visit_started_at
                .cmp(&a.visit_started_at)
                .then_with(|| a.record_id.cmp(&b.record_id))
        });
        Ok(records)
    }

    /// Creates a draft from a template skeleton, with optional overrides merged in.
    ///
    /// The template's usage counter is bumped in the background after the record is stored.
    pub async fn create_from_template(
        &self,
        ctx: &RequestContext,
        request: FromTemplateRequest,
        actor: &ActorId,
    ) -> MutationResult<MutationOutcome> {
        self.authorize(ctx, actor, &request.patient_id).await?;

        let template = ctx
            .run(self.templates.get(&request.template_id))
            .await?
            .map_err(store_failure("template store get"))?
            .ok_or(MutationError::NotFound)?;

        let content = TemplateInstantiator::from_template(&template, request.overrides.as_ref());
        let now = Utc::now();
        let draft = instance_draft(request.details, VisitType::Regular, content, actor, now);
        let mut new = validate_draft(request.patient_id, draft, actor, now)?;
        new.template_id = Some(template.template_id);

        let record = self.insert(ctx, new).await?;
        if self.usage.record(template.template_id) == Enqueue::Closed {
            tracing::warn!(
                template_id = %template.template_id,
                record_id = %record.record_id,
                "usage recorder shut down; increment not recorded"
            );
        }
        Ok(MutationOutcome::clean(record))
    }

    /// Copies a record, optionally to another patient, with modifications merged in.
    ///
    /// Access to the source patient is always checked. A copy to a different patient needs a
    /// second, independent check on the target before anything is written.
    pub async fn copy(
        &self,
        ctx: &RequestContext,
        request: CopyRequest,
        actor: &ActorId,
    ) -> MutationResult<MutationOutcome> {
        self.authorize(ctx, actor, &request.source_patient_id).await?;

        let source = self
            .fetch_live(ctx, &request.source_patient_id, &request.source_record_id)
            .await?;
        let content = TemplateInstantiator::from_record(&source, request.modifications.as_ref())?;

        let cross_patient = request.is_cross_patient();
        if cross_patient {
            self.authorize(ctx, actor, &request.target_patient_id).await?;
        }

        let now = Utc::now();
        let draft = instance_draft(request.details, source.visit_type, content, actor, now);
        let mut new = validate_draft(request.target_patient_id, draft, actor, now)?;
        new.source_record_id = Some(source.record_id);

        let record = self.insert(ctx, new).await?;
        tracing::debug!(
            record_id = %record.record_id,
            source_record_id = %source.record_id,
            cross_patient,
            "record copied"
        );
        Ok(MutationOutcome::clean(record))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreResult;
    use crate::ids::TemplateId;
    use crate::lifecycle::{Specialty, TransitionPolicy};
    use crate::memory::{MemoryRecordStore, MemoryTemplateStore, StaticAccessGate};
    use crate::record::{ContentTemplate, RecordContent};
    use async_trait::async_trait;
    use std::io;
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    /// Collects formatted log output for inspection.
    #[derive(Clone, Default)]
    struct LogBuffer(Arc<Mutex<Vec<u8>>>);

    impl LogBuffer {
        fn contents(&self) -> String {
            String::from_utf8(self.0.lock().unwrap().clone()).unwrap()
        }
    }

    impl io::Write for LogBuffer {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn capture_logs() -> (LogBuffer, tracing::subscriber::DefaultGuard) {
        let buffer = LogBuffer::default();
        let writer = buffer.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_ansi(false)
            .with_max_level(tracing::Level::DEBUG)
            .with_writer(move || writer.clone())
            .finish();
        let guard = tracing::subscriber::set_default(subscriber);
        (buffer, guard)
    }

    struct Harness {
        engine: Arc<RecordMutationEngine>,
        records: Arc<MemoryRecordStore>,
        templates: Arc<MemoryTemplateStore>,
        gate: Arc<StaticAccessGate>,
        actor: ActorId,
        patient: PatientId,
    }

    fn harness_with(cfg: CoreConfig) -> Harness {
        let records = Arc::new(MemoryRecordStore::new());
        let templates = Arc::new(MemoryTemplateStore::new());
        let gate = Arc::new(StaticAccessGate::new());
        let actor = ActorId::new("dr-tanaka").unwrap();
        let patient = PatientId::generate();
        gate.grant(actor.clone(), patient).unwrap();

        let engine = RecordMutationEngine::new(
            records.clone(),
            templates.clone(),
            gate.clone(),
            Arc::new(cfg),
        );
        Harness {
            engine: Arc::new(engine),
            records,
            templates,
            gate,
            actor,
            patient,
        }
    }

    fn harness() -> Harness {
        harness_with(CoreConfig::default())
    }

    fn doc(json: &str) -> Document {
        Document::parse(json).expect("test json should parse")
    }

    fn draft(content: &str) -> RecordDraft {
        RecordDraft {
            visit_started_at: Some(Utc::now()),
            performed_by: Some("dr-tanaka".into()),
            content: Some(doc(content)),
            ..Default::default()
        }
    }

    fn content_patch(content: &str) -> RecordPatch {
        RecordPatch {
            content: Some(doc(content)),
            ..Default::default()
        }
    }

    fn content_of(record: &ClinicalRecord) -> &Document {
        record
            .content
            .as_document()
            .expect("content should be readable")
    }

    impl Harness {
        async fn create(&self, content: &str) -> ClinicalRecord {
            self.engine
                .create(
                    &RequestContext::background(),
                    &self.patient,
                    draft(content),
                    &self.actor,
                )
                .await
                .expect("create should succeed")
                .record
        }

        async fn update(
            &self,
            record_id: &RecordId,
            patch: RecordPatch,
            expectation: VersionExpectation,
        ) -> MutationResult<MutationOutcome> {
            self.engine
                .update(
                    &RequestContext::background(),
                    &self.patient,
                    record_id,
                    patch,
                    expectation,
                    &self.actor,
                )
                .await
        }

        fn add_template(&self, skeleton: &str) -> TemplateId {
            let template_id = TemplateId::generate();
            self.templates
                .insert(ContentTemplate {
                    template_id,
                    name: "General SOAP".into(),
                    specialty: Specialty::General,
                    skeleton: doc(skeleton),
                    is_system: true,
                    usage_count: 0,
                })
                .unwrap();
            template_id
        }
    }

    #[tokio::test]
    async fn test_create_applies_defaults() {
        let h = harness();
        let record = h.create(r#"{"subjective":{"complaint":"cough"}}"#).await;

        assert_eq!(record.version, 1);
        assert_eq!(record.status, RecordStatus::Draft);
        assert_eq!(record.visit_type, VisitType::Regular);
        assert_eq!(record.source_type, SourceType::Manual);
        assert_eq!(record.patient_id, h.patient);
        assert_eq!(record.created_by, h.actor);
        assert!(!record.deleted);
    }

    #[tokio::test]
    async fn test_create_validates_required_fields() {
        let h = harness();
        let ctx = RequestContext::background();

        let missing_start = RecordDraft {
            performed_by: Some("dr-tanaka".into()),
            ..Default::default()
        };
        let err = h
            .engine
            .create(&ctx, &h.patient, missing_start, &h.actor)
            .await
            .expect_err("visit_started_at is required");
        assert!(matches!(err, MutationError::Validation { field: "visit_started_at", .. }));

        let missing_performer = RecordDraft {
            visit_started_at: Some(Utc::now()),
            ..Default::default()
        };
        let err = h
            .engine
            .create(&ctx, &h.patient, missing_performer, &h.actor)
            .await
            .expect_err("performed_by is required");
        assert!(matches!(err, MutationError::Validation { field: "performed_by", .. }));

        let bad_type = RecordDraft {
            visit_type: Some("house_call".into()),
            ..draft("{}")
        };
        let err = h
            .engine
            .create(&ctx, &h.patient, bad_type, &h.actor)
            .await
            .expect_err("unknown visit type");
        assert!(matches!(err, MutationError::Validation { field: "visit_type", .. }));

        let backwards = RecordDraft {
            visit_ended_at: Some(Utc::now() - chrono::Duration::hours(1)),
            ..draft("{}")
        };
        let err = h
            .engine
            .create(&ctx, &h.patient, backwards, &h.actor)
            .await
            .expect_err("visit cannot end before it starts");
        assert!(matches!(err, MutationError::Validation { field: "visit_ended_at", .. }));

        assert!(h.records.records().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_create_without_access_is_denied() {
        let h = harness();
        let stranger = PatientId::generate();

        let err = h
            .engine
            .create(&RequestContext::background(), &stranger, draft("{}"), &h.actor)
            .await
            .expect_err("no grant for this patient");
        assert_eq!(err, MutationError::AccessDenied);
        assert!(h.records.records().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_each_update_advances_version_by_one() {
        let h = harness();
        let record = h.create("{}").await;

        let mut version = record.version;
        for i in 0..5 {
            let patch = content_patch(&format!(r#"{{"plan":{{"step":{}}}}}"#, i));
            let outcome = h
                .update(&record.record_id, patch, VersionExpectation::Exact(version))
                .await
                .expect("update should succeed");
            assert_eq!(outcome.record.version, version + 1);
            version = outcome.record.version;
        }
        assert_eq!(version, 6);
    }

    #[tokio::test]
    async fn test_partial_update_preserves_untouched_branches() {
        let h = harness();
        let record = h
            .create(r#"{"subjective":{"a":1,"b":2},"objective":{"temp_c":37.1}}"#)
            .await;

        let outcome = h
            .update(
                &record.record_id,
                content_patch(r#"{"subjective":{"b":3}}"#),
                VersionExpectation::Exact(1),
            )
            .await
            .unwrap();

        assert_eq!(
            content_of(&outcome.record),
            &doc(r#"{"subjective":{"a":1,"b":3},"objective":{"temp_c":37.1}}"#)
        );
        assert!(outcome.warnings.is_empty());
    }

    #[tokio::test]
    async fn test_stale_version_is_a_conflict_and_writes_nothing() {
        let h = harness();
        let record = h.create(r#"{"plan":{"a":1}}"#).await;
        h.update(
            &record.record_id,
            content_patch(r#"{"plan":{"a":2}}"#),
            VersionExpectation::Exact(1),
        )
        .await
        .unwrap();

        let err = h
            .update(
                &record.record_id,
                content_patch(r#"{"plan":{"a":3}}"#),
                VersionExpectation::Exact(1),
            )
            .await
            .expect_err("stale version");
        assert_eq!(
            err,
            MutationError::Conflict {
                expected: 1,
                actual: 2
            }
        );
        assert!(err.is_retryable());

        let stored = h
            .engine
            .get(
                &RequestContext::background(),
                &h.patient,
                &record.record_id,
                &h.actor,
            )
            .await
            .unwrap();
        assert_eq!(stored.version, 2);
        assert_eq!(content_of(&stored), &doc(r#"{"plan":{"a":2}}"#));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_updates_with_same_version_have_one_winner() {
        let h = harness();
        let record = h.create("{}").await;

        let mut tasks = Vec::new();
        for i in 0..8 {
            let engine = Arc::clone(&h.engine);
            let patient = h.patient;
            let actor = h.actor.clone();
            let record_id = record.record_id;
            tasks.push(tokio::spawn(async move {
                engine
                    .update(
                        &RequestContext::background(),
                        &patient,
                        &record_id,
                        content_patch(&format!(r#"{{"subjective":{{"writer":{}}}}}"#, i)),
                        VersionExpectation::Exact(1),
                        &actor,
                    )
                    .await
            }));
        }

        let mut winners = 0;
        for task in tasks {
            match task.await.unwrap() {
                Ok(outcome) => {
                    winners += 1;
                    assert_eq!(outcome.record.version, 2);
                }
                Err(err) => assert_eq!(
                    err,
                    MutationError::Conflict {
                        expected: 1,
                        actual: 2
                    }
                ),
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn test_blind_overwrite_follows_configuration() {
        let h = harness();
        let record = h.create(r#"{"plan":{}}"#).await;
        let outcome = h
            .update(
                &record.record_id,
                content_patch(r#"{"plan":{"x":1}}"#),
                VersionExpectation::Overwrite,
            )
            .await
            .expect("blind overwrite allowed by default");
        assert_eq!(outcome.record.version, 2);

        let strict = harness_with(
            CoreConfig::new(
                None,
                8,
                1,
                Duration::from_secs(1),
                false,
                TransitionPolicy::Unrestricted,
            )
            .unwrap(),
        );
        let record = strict.create("{}").await;
        let err = strict
            .update(
                &record.record_id,
                content_patch(r#"{"plan":{"x":1}}"#),
                VersionExpectation::Overwrite,
            )
            .await
            .expect_err("blind overwrite disabled");
        assert_eq!(
            err,
            MutationError::Validation {
                field: "expected_version",
                reason: "required".into()
            }
        );
    }

    #[tokio::test]
    async fn test_unreadable_content_is_replaced_with_warning() {
        let h = harness();
        let record = h.create(r#"{"subjective":{"a":1}}"#).await;
        h.records
            .overwrite_raw_content(&record.record_id, "{\"subjective\": tru");

        let outcome = h
            .update(
                &record.record_id,
                content_patch(r#"{"plan":{"b":2}}"#),
                VersionExpectation::Exact(1),
            )
            .await
            .expect("update should still succeed");

        assert_eq!(
            outcome.warnings,
            vec![MutationWarning::ExistingContentUnreadable]
        );
        assert_eq!(content_of(&outcome.record), &doc(r#"{"plan":{"b":2}}"#));
        assert_eq!(outcome.record.version, 2);
    }

    #[tokio::test]
    async fn test_status_changes_follow_policy() {
        let h = harness();
        let record = h.create("{}").await;
        let to = |status: &str| RecordPatch {
            status: Some(status.into()),
            ..Default::default()
        };

        h.update(&record.record_id, to("completed"), VersionExpectation::Exact(1))
            .await
            .unwrap();
        let reopened = h
            .update(&record.record_id, to("draft"), VersionExpectation::Exact(2))
            .await
            .expect("unrestricted policy allows reopening");
        assert_eq!(reopened.record.status, RecordStatus::Draft);

        let err = h
            .update(&record.record_id, to("archived"), VersionExpectation::Exact(3))
            .await
            .expect_err("unknown status");
        assert!(matches!(err, MutationError::Validation { field: "status", .. }));

        let ordered = harness_with(
            CoreConfig::new(
                None,
                8,
                1,
                Duration::from_secs(1),
                true,
                TransitionPolicy::Ordered,
            )
            .unwrap(),
        );
        let record = ordered.create("{}").await;
        ordered
            .update(&record.record_id, to("completed"), VersionExpectation::Exact(1))
            .await
            .unwrap();
        let err = ordered
            .update(&record.record_id, to("draft"), VersionExpectation::Exact(2))
            .await
            .expect_err("ordered policy forbids reopening");
        assert!(matches!(err, MutationError::Validation { field: "status", .. }));
    }

    #[tokio::test]
    async fn test_empty_patch_is_rejected() {
        let h = harness();
        let record = h.create("{}").await;

        let err = h
            .update(
                &record.record_id,
                RecordPatch::default(),
                VersionExpectation::Exact(1),
            )
            .await
            .expect_err("nothing to update");
        assert!(matches!(err, MutationError::Validation { field: "patch", .. }));
    }

    #[tokio::test]
    async fn test_soft_delete_hides_record() {
        let h = harness();
        let ctx = RequestContext::background();
        let record = h.create("{}").await;

        let deleted = h
            .engine
            .delete(&ctx, &h.patient, &record.record_id, &h.actor)
            .await
            .expect("delete should succeed");
        assert!(deleted.record.deleted);
        assert_eq!(deleted.record.version, 2);
        assert_eq!(deleted.record.deleted_by.as_ref(), Some(&h.actor));

        let err = h
            .engine
            .get(&ctx, &h.patient, &record.record_id, &h.actor)
            .await
            .expect_err("deleted records are hidden");
        assert_eq!(err, MutationError::NotFound);
        assert!(h
            .engine
            .list(&ctx, &h.patient, &h.actor)
            .await
            .unwrap()
            .is_empty());

        let again = h
            .engine
            .delete(&ctx, &h.patient, &record.record_id, &h.actor)
            .await
            .expect("repeat delete is idempotent");
        assert_eq!(again.record.version, 2);

        let err = h
            .update(
                &record.record_id,
                content_patch(r#"{"a":1}"#),
                VersionExpectation::Exact(2),
            )
            .await
            .expect_err("deleted records cannot be updated");
        assert_eq!(err, MutationError::NotFound);

        // Retained, never physically removed.
        assert_eq!(h.records.records().unwrap().len(), 1);

        let err = h
            .engine
            .delete(&ctx, &h.patient, &RecordId::generate(), &h.actor)
            .await
            .expect_err("unknown record");
        assert_eq!(err, MutationError::NotFound);
    }

    #[tokio::test]
    async fn test_list_orders_newest_visit_first() {
        let h = harness();
        let ctx = RequestContext::background();
        let now = Utc::now();

        for hours_ago in [5, 1, 3] {
            let d = RecordDraft {
                visit_started_at: Some(now - chrono::Duration::hours(hours_ago)),
                ..draft("{}")
            };
            h.engine.create(&ctx, &h.patient, d, &h.actor).await.unwrap();
        }

        let listed = h.engine.list(&ctx, &h.patient, &h.actor).await.unwrap();
        let starts: Vec<_> = listed.iter().map(|r| r.visit_started_at).collect();
        assert_eq!(
            starts,
            vec![
                now - chrono::Duration::hours(1),
                now - chrono::Duration::hours(3),
                now - chrono::Duration::hours(5),
            ]
        );
    }

    #[tokio::test]
    async fn test_from_template_without_overrides_copies_skeleton() {
        let h = harness();
        let skeleton = r#"{"subjective":{},"objective":{"vitals":{}},"plan":{"items":[]}}"#;
        let template_id = h.add_template(skeleton);

        let outcome = h
            .engine
            .create_from_template(
                &RequestContext::background(),
                FromTemplateRequest {
                    template_id,
                    patient_id: h.patient,
                    overrides: None,
                    details: VisitDetails::default(),
                },
                &h.actor,
            )
            .await
            .expect("instantiation should succeed");

        let record = outcome.record;
        assert_eq!(content_of(&record), &doc(skeleton));
        assert_eq!(record.template_id, Some(template_id));
        assert_eq!(record.source_type, SourceType::Template);
        assert_eq!(record.status, RecordStatus::Draft);
        assert_eq!(record.performed_by, h.actor);

        h.engine.shutdown().await;
        let template = h.templates.get(&template_id).await.unwrap().unwrap();
        assert_eq!(template.usage_count, 1);
        assert_eq!(h.engine.usage_stats().succeeded, 1);
    }

    #[tokio::test]
    async fn test_from_template_after_shutdown_still_creates_record() {
        let h = harness();
        let template_id = h.add_template(r#"{"plan":{}}"#);
        h.engine.shutdown().await;
        let (logs, _guard) = capture_logs();

        let outcome = h
            .engine
            .create_from_template(
                &RequestContext::background(),
                FromTemplateRequest {
                    template_id,
                    patient_id: h.patient,
                    overrides: None,
                    details: VisitDetails::default(),
                },
                &h.actor,
            )
            .await
            .expect("record is stored even without usage counting");

        assert_eq!(outcome.record.template_id, Some(template_id));
        let template = h.templates.get(&template_id).await.unwrap().unwrap();
        assert_eq!(template.usage_count, 0);
        assert_eq!(h.engine.usage_stats().accepted, 0);
        assert!(logs.contents().contains("usage recorder shut down"));
    }

    #[tokio::test]
    async fn test_from_missing_template_is_not_found() {
        let h = harness();
        let err = h
            .engine
            .create_from_template(
                &RequestContext::background(),
                FromTemplateRequest {
                    template_id: TemplateId::generate(),
                    patient_id: h.patient,
                    overrides: None,
                    details: VisitDetails::default(),
                },
                &h.actor,
            )
            .await
            .expect_err("template does not exist");
        assert_eq!(err, MutationError::NotFound);
    }

    #[tokio::test]
    async fn test_copy_within_patient_merges_modifications() {
        let h = harness();
        let ctx = RequestContext::background();
        let source = h
            .create(r#"{"objective":{"bp":"120/80"},"plan":{"next":"2w"}}"#)
            .await;
        h.update(
            &source.record_id,
            RecordPatch {
                visit_type: Some("follow_up".into()),
                status: Some("completed".into()),
                ..Default::default()
            },
            VersionExpectation::Exact(1),
        )
        .await
        .unwrap();

        let outcome = h
            .engine
            .copy(
                &ctx,
                CopyRequest {
                    source_patient_id: h.patient,
                    source_record_id: source.record_id,
                    target_patient_id: h.patient,
                    modifications: Some(doc(r#"{"plan":{"next":"4w"}}"#)),
                    details: VisitDetails::default(),
                },
                &h.actor,
            )
            .await
            .expect("copy should succeed");

        let copy = outcome.record;
        assert_ne!(copy.record_id, source.record_id);
        assert_eq!(copy.source_record_id, Some(source.record_id));
        assert_eq!(copy.status, RecordStatus::Draft);
        assert_eq!(copy.source_type, SourceType::Template);
        assert_eq!(copy.visit_type, VisitType::FollowUp);
        assert_eq!(copy.version, 1);
        assert_eq!(
            content_of(&copy),
            &doc(r#"{"objective":{"bp":"120/80"},"plan":{"next":"4w"}}"#)
        );
    }

    #[tokio::test]
    async fn test_cross_patient_copy_requires_target_access() {
        let h = harness();
        let ctx = RequestContext::background();
        let source = h.create(r#"{"subjective":{"a":1}}"#).await;
        let target = PatientId::generate();
        let request = CopyRequest {
            source_patient_id: h.patient,
            source_record_id: source.record_id,
            target_patient_id: target,
            modifications: None,
            details: VisitDetails::default(),
        };

        let err = h
            .engine
            .copy(&ctx, request.clone(), &h.actor)
            .await
            .expect_err("no access to the target patient");
        assert_eq!(err, MutationError::AccessDenied);
        assert!(h.records.list(&target).await.unwrap().is_empty());
        assert_eq!(h.records.records().unwrap().len(), 1);

        h.gate.grant(h.actor.clone(), target).unwrap();
        let copied = h
            .engine
            .copy(&ctx, request, &h.actor)
            .await
            .expect("copy succeeds once access is granted");
        assert_eq!(copied.record.patient_id, target);
    }

    #[tokio::test]
    async fn test_copy_of_deleted_or_unreadable_source() {
        let h = harness();
        let ctx = RequestContext::background();
        let request = |record_id| CopyRequest {
            source_patient_id: h.patient,
            source_record_id: record_id,
            target_patient_id: h.patient,
            modifications: None,
            details: VisitDetails::default(),
        };

        let corrupt = h.create("{}").await;
        h.records.overwrite_raw_content(&corrupt.record_id, "not json");
        let err = h
            .engine
            .copy(&ctx, request(corrupt.record_id), &h.actor)
            .await
            .expect_err("unreadable source");
        assert!(matches!(err, MutationError::Validation { field: "content", .. }));

        let gone = h.create("{}").await;
        h.engine
            .delete(&ctx, &h.patient, &gone.record_id, &h.actor)
            .await
            .unwrap();
        let err = h
            .engine
            .copy(&ctx, request(gone.record_id), &h.actor)
            .await
            .expect_err("deleted source");
        assert_eq!(err, MutationError::NotFound);
    }

    struct FailingInsertStore {
        inner: MemoryRecordStore,
    }

    #[async_trait]
    impl RecordStore for FailingInsertStore {
        async fn get(
            &self,
            patient_id: &PatientId,
            record_id: &RecordId,
        ) -> StoreResult<Option<ClinicalRecord>> {
            self.inner.get(patient_id, record_id).await
        }

        async fn list(&self, patient_id: &PatientId) -> StoreResult<Vec<ClinicalRecord>> {
            self.inner.list(patient_id).await
        }

        async fn conditional_update(
            &self,
            patient_id: &PatientId,
            record_id: &RecordId,
            expected_version: i64,
            changes: RecordChanges,
        ) -> StoreResult<ConditionalUpdate> {
            self.inner
                .conditional_update(patient_id, record_id, expected_version, changes)
                .await
        }

        async fn insert(&self, _record: NewClinicalRecord) -> StoreResult<ClinicalRecord> {
            Err(StoreError::Backend(
                "spanner: row too large for patient note 'chest pain'".into(),
            ))
        }

        async fn soft_delete(
            &self,
            patient_id: &PatientId,
            record_id: &RecordId,
            actor: &ActorId,
            at: DateTime<Utc>,
        ) -> StoreResult<SoftDelete> {
            self.inner.soft_delete(patient_id, record_id, actor, at).await
        }
    }

    #[tokio::test]
    async fn test_store_failure_is_internal_with_generic_cause() {
        let actor = ActorId::new("dr-tanaka").unwrap();
        let patient = PatientId::generate();
        let gate = Arc::new(StaticAccessGate::with_grants([(actor.clone(), patient)]));
        let engine = RecordMutationEngine::new(
            Arc::new(FailingInsertStore {
                inner: MemoryRecordStore::new(),
            }),
            Arc::new(MemoryTemplateStore::new()),
            gate,
            Arc::new(CoreConfig::default()),
        );

        let err = engine
            .create(&RequestContext::background(), &patient, draft("{}"), &actor)
            .await
            .expect_err("insert fails");
        assert_eq!(
            err,
            MutationError::Internal {
                cause: "record store insert failed".into()
            }
        );
        assert!(!err.to_string().contains("chest pain"));
    }

    #[tokio::test]
    async fn test_store_failure_log_omits_store_message() {
        let actor = ActorId::new("dr-tanaka").unwrap();
        let patient = PatientId::generate();
        let gate = Arc::new(StaticAccessGate::with_grants([(actor.clone(), patient)]));
        let engine = RecordMutationEngine::new(
            Arc::new(FailingInsertStore {
                inner: MemoryRecordStore::new(),
            }),
            Arc::new(MemoryTemplateStore::new()),
            gate,
            Arc::new(CoreConfig::default()),
        );
        let (logs, _guard) = capture_logs();

        engine
            .create(&RequestContext::background(), &patient, draft("{}"), &actor)
            .await
            .expect_err("insert fails");

        let logs = logs.contents();
        assert!(logs.contains("record store insert"));
        assert!(logs.contains("backend"));
        assert!(!logs.contains("chest pain"));
    }

    /// A write that another request slips in between the engine's read and its own write.
    enum Interleaved {
        Update(Document),
        Delete,
    }

    /// Wraps the memory store and commits one competing write just before the next conditional
    /// update, after the engine has already read and version-checked the record.
    struct InterleavingStore {
        inner: MemoryRecordStore,
        competitor: ActorId,
        pending: Mutex<Option<Interleaved>>,
    }

    impl InterleavingStore {
        fn new() -> Self {
            Self {
                inner: MemoryRecordStore::new(),
                competitor: ActorId::new("dr-sato").unwrap(),
                pending: Mutex::new(None),
            }
        }

        fn interleave(&self, write: Interleaved) {
            *self.pending.lock().unwrap() = Some(write);
        }
    }

    #[async_trait]
    impl RecordStore for InterleavingStore {
        async fn get(
            &self,
            patient_id: &PatientId,
            record_id: &RecordId,
        ) -> StoreResult<Option<ClinicalRecord>> {
            self.inner.get(patient_id, record_id).await
        }

        async fn list(&self, patient_id: &PatientId) -> StoreResult<Vec<ClinicalRecord>> {
            self.inner.list(patient_id).await
        }

        async fn conditional_update(
            &self,
            patient_id: &PatientId,
            record_id: &RecordId,
            expected_version: i64,
            changes: RecordChanges,
        ) -> StoreResult<ConditionalUpdate> {
            let pending = self.pending.lock().unwrap().take();
            match pending {
                Some(Interleaved::Update(content)) => {
                    let competing = RecordChanges {
                        visit_started_at: None,
                        visit_ended_at: None,
                        visit_type: None,
                        performed_by: None,
                        status: None,
                        source_type: None,
                        schedule_id: None,
                        content: Some(content),
                        updated_by: self.competitor.clone(),
                        updated_at: Utc::now(),
                    };
                    let applied = self
                        .inner
                        .conditional_update(patient_id, record_id, expected_version, competing)
                        .await?;
                    assert!(matches!(applied, ConditionalUpdate::Applied(_)));
                }
                Some(Interleaved::Delete) => {
                    self.inner
                        .soft_delete(patient_id, record_id, &self.competitor, Utc::now())
                        .await?;
                }
                None => {}
            }
            self.inner
                .conditional_update(patient_id, record_id, expected_version, changes)
                .await
        }

        async fn insert(&self, record: NewClinicalRecord) -> StoreResult<ClinicalRecord> {
            self.inner.insert(record).await
        }

        async fn soft_delete(
            &self,
            patient_id: &PatientId,
            record_id: &RecordId,
            actor: &ActorId,
            at: DateTime<Utc>,
        ) -> StoreResult<SoftDelete> {
            self.inner.soft_delete(patient_id, record_id, actor, at).await
        }
    }

    fn interleaving_engine() -> (RecordMutationEngine, Arc<InterleavingStore>, ActorId, PatientId) {
        let actor = ActorId::new("dr-tanaka").unwrap();
        let patient = PatientId::generate();
        let store = Arc::new(InterleavingStore::new());
        let engine = RecordMutationEngine::new(
            store.clone(),
            Arc::new(MemoryTemplateStore::new()),
            Arc::new(StaticAccessGate::with_grants([(actor.clone(), patient)])),
            Arc::new(CoreConfig::default()),
        );
        (engine, store, actor, patient)
    }

    #[tokio::test]
    async fn test_write_that_loses_after_version_check_is_conflict() {
        let (engine, store, actor, patient) = interleaving_engine();
        let ctx = RequestContext::background();
        let record = engine
            .create(&ctx, &patient, draft(r#"{"plan":{"next":"2w"}}"#), &actor)
            .await
            .unwrap()
            .record;

        store.interleave(Interleaved::Update(doc(r#"{"plan":{"next":"1w"}}"#)));
        let err = engine
            .update(
                &ctx,
                &patient,
                &record.record_id,
                content_patch(r#"{"plan":{"next":"4w"}}"#),
                VersionExpectation::Exact(1),
                &actor,
            )
            .await
            .expect_err("the competing write committed first");

        assert_eq!(
            err,
            MutationError::Conflict {
                expected: 1,
                actual: 2
            }
        );
        assert!(err.is_retryable());
        let stored = store.inner.records().unwrap();
        assert_eq!(stored[0].version, 2);
        assert_eq!(stored[0].updated_by, store.competitor);
        assert_eq!(content_of(&stored[0]), &doc(r#"{"plan":{"next":"1w"}}"#));
    }

    #[tokio::test]
    async fn test_blind_overwrite_that_loses_the_write_is_conflict() {
        let (engine, store, actor, patient) = interleaving_engine();
        let ctx = RequestContext::background();
        let record = engine
            .create(&ctx, &patient, draft(r#"{"a":1}"#), &actor)
            .await
            .unwrap()
            .record;

        store.interleave(Interleaved::Update(doc(r#"{"a":"other"}"#)));
        let err = engine
            .update(
                &ctx,
                &patient,
                &record.record_id,
                content_patch(r#"{"a":2}"#),
                VersionExpectation::Overwrite,
                &actor,
            )
            .await
            .expect_err("the compare-and-swap still guards a blind overwrite");

        assert_eq!(
            err,
            MutationError::Conflict {
                expected: 1,
                actual: 2
            }
        );
        assert_eq!(
            content_of(&store.inner.records().unwrap()[0]),
            &doc(r#"{"a":"other"}"#)
        );
    }

    #[tokio::test]
    async fn test_record_deleted_between_read_and_write_is_not_found() {
        let (engine, store, actor, patient) = interleaving_engine();
        let ctx = RequestContext::background();
        let record = engine
            .create(&ctx, &patient, draft(r#"{"a":1}"#), &actor)
            .await
            .unwrap()
            .record;

        store.interleave(Interleaved::Delete);
        let err = engine
            .update(
                &ctx,
                &patient,
                &record.record_id,
                content_patch(r#"{"a":2}"#),
                VersionExpectation::Exact(1),
                &actor,
            )
            .await
            .expect_err("record was deleted before the write");

        assert_eq!(err, MutationError::NotFound);
        let stored = store.inner.records().unwrap();
        assert!(stored[0].deleted);
        assert_eq!(stored[0].deleted_by, Some(store.competitor.clone()));
        assert_eq!(content_of(&stored[0]), &doc(r#"{"a":1}"#));
    }

    #[tokio::test]
    async fn test_cancelled_request_writes_nothing() {
        let h = harness();
        let record = h.create(r#"{"a":1}"#).await;
        let token = CancellationToken::new();
        token.cancel();

        let err = h
            .engine
            .update(
                &RequestContext::with_cancellation(token),
                &h.patient,
                &record.record_id,
                content_patch(r#"{"a":2}"#),
                VersionExpectation::Exact(1),
                &h.actor,
            )
            .await
            .expect_err("request was cancelled");
        assert_eq!(err, MutationError::Cancelled);

        let stored = h.records.records().unwrap();
        assert_eq!(stored[0].version, 1);
        assert_eq!(content_of(&stored[0]), &doc(r#"{"a":1}"#));
    }
}
