//! Typed identifiers.
//!
//! Patients, records, templates and schedules are all canonical UUIDs underneath, but mixing
//! them up is a real bug (writing a copy against the source patient instead of the target, for
//! example), so each gets its own newtype. Actors are free-form non-empty identifiers supplied by
//! the authentication layer.

use crate::error::{MutationError, MutationResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use visit_types::NonEmptyText;
use visit_uuid::CanonicalUuid;

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident, $field:literal) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(CanonicalUuid);

        impl $name {
            /// Generates a fresh identifier.
            pub fn generate() -> Self {
                Self(CanonicalUuid::new())
            }

            /// Parses a caller-supplied identifier, which must be in canonical form.
            pub fn parse(input: &str) -> MutationResult<Self> {
                CanonicalUuid::parse(input)
                    .map(Self)
                    .map_err(|e| MutationError::validation($field, e.to_string()))
            }
        }

        impl From<CanonicalUuid> for $name {
            fn from(id: CanonicalUuid) -> Self {
                Self(id)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::Display::fmt(&self.0, f)
            }
        }
    };
}

uuid_id!(
    /// Identifier of the patient a record belongs to.
    PatientId,
    "patient_id"
);
uuid_id!(
    /// Identifier of a clinical visit record, assigned by the store on insert.
    RecordId,
    "record_id"
);
uuid_id!(
    /// Identifier of a content template.
    TemplateId,
    "template_id"
);
uuid_id!(
    /// Identifier of the visit schedule entry a record documents.
    ScheduleId,
    "schedule_id"
);

/// Identifier of the clinician or system acting on a record.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ActorId(NonEmptyText);

impl ActorId {
    pub fn new(input: impl AsRef<str>) -> MutationResult<Self> {
        Self::parse_field("actor", input)
    }

    pub(crate) fn parse_field(field: &'static str, input: impl AsRef<str>) -> MutationResult<Self> {
        NonEmptyText::new(input)
            .map(Self)
            .map_err(|e| MutationError::validation(field, e.to_string()))
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl fmt::Display for ActorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
