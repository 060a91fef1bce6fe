//! Seeding new records from templates and existing records.
//!
//! Both paths produce a draft with `source_type = template`. The initial content is either a
//! template skeleton or a source record's content, with caller-supplied changes deep-merged on
//! top. Persisting the result goes through the engine's ordinary insert path.

use crate::document::Document;
use crate::error::{MutationError, MutationResult};
use crate::ids::{PatientId, RecordId, TemplateId};
use crate::merge::merge;
use crate::record::{ClinicalRecord, ContentTemplate, RecordContent};
use chrono::{DateTime, Utc};
use serde::Deserialize;

/// Optional visit details for a record created from a template or a copy.
///
/// Unset fields fall back to: `visit_started_at` now, `performed_by` the acting user,
/// `visit_type` the source record's (copy) or `regular` (template).
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct VisitDetails {
    pub visit_started_at: Option<DateTime<Utc>>,
    pub visit_ended_at: Option<DateTime<Utc>>,
    pub performed_by: Option<String>,
    pub visit_type: Option<String>,
    pub schedule_id: Option<String>,
}

#[derive(Clone, Debug)]
pub struct FromTemplateRequest {
    pub template_id: TemplateId,
    pub patient_id: PatientId,
    /// Deep-merged over the skeleton.
    pub overrides: Option<Document>,
    pub details: VisitDetails,
}

#[derive(Clone, Debug)]
pub struct CopyRequest {
    pub source_patient_id: PatientId,
    pub source_record_id: RecordId,
    pub target_patient_id: PatientId,
    /// Deep-merged over the source record's content.
    pub modifications: Option<Document>,
    pub details: VisitDetails,
}

impl CopyRequest {
    pub fn is_cross_patient(&self) -> bool {
        self.source_patient_id != self.target_patient_id
    }
}

/// Builds initial content for new records.
#[derive(Clone, Copy, Debug, Default)]
pub struct TemplateInstantiator;

impl TemplateInstantiator {
    /// The template skeleton with `overrides` merged in.
    pub fn from_template(template: &ContentTemplate, overrides: Option<&Document>) -> Document {
        match overrides {
            Some(update) => merge(&template.skeleton, update),
            None => template.skeleton.clone(),
        }
    }

    /// The source record's content with `modifications` merged in.
    ///
    /// # Errors
    ///
    /// Returns [`MutationError::Validation`] on `content` if the source content is unreadable.
    pub fn from_record(
        source: &ClinicalRecord,
        modifications: Option<&Document>,
    ) -> MutationResult<Document> {
        let RecordContent::Document(base) = &source.content else {
            return Err(MutationError::validation(
                "content",
                "source record content is unreadable",
            ));
        };

        Ok(match modifications {
            Some(update) => merge(base, update),
            None => base.clone(),
        })
    }
}
