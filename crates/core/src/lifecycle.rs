//! Record lifecycle enumerations and validation.
//!
//! Visit type, status and source type arrive from callers as strings. They are checked against
//! fixed `const` tables before any write is attempted; unknown values are a validation error
//! naming the field.
//!
//! Status changes are checked against a [`TransitionPolicy`]. The default policy only requires
//! membership in the status set, so any status may follow any other (including
//! `completed -> draft`). The ordered policy restricts movement to the forward clinical flow.

use crate::error::{MutationError, MutationResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A closed enumeration with a fixed snake_case wire name per variant.
pub trait WireEnum: Sized + Copy + 'static {
    /// Every valid member, in declaration order.
    const ALL: &'static [Self];

    fn as_str(self) -> &'static str;

    /// Finds the member whose wire name is exactly `value`.
    fn from_wire(value: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|m| m.as_str() == value)
    }
}

/// Parses `value` as a member of `T`, reporting `field` on failure.
pub fn parse_member<T: WireEnum>(field: &'static str, value: &str) -> MutationResult<T> {
    T::from_wire(value).ok_or_else(|| {
        let allowed: Vec<&str> = T::ALL.iter().map(|m| m.as_str()).collect();
        MutationError::validation(
            field,
            format!("unknown value '{}' (expected one of: {})", value, allowed.join(", ")),
        )
    })
}

/// Kind of visit the record documents.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VisitType {
    Regular,
    Emergency,
    Initial,
    FollowUp,
    TerminalCare,
}

impl WireEnum for VisitType {
    const ALL: &'static [Self] = &[
        Self::Regular,
        Self::Emergency,
        Self::Initial,
        Self::FollowUp,
        Self::TerminalCare,
    ];

    fn as_str(self) -> &'static str {
        match self {
            Self::Regular => "regular",
            Self::Emergency => "emergency",
            Self::Initial => "initial",
            Self::FollowUp => "follow_up",
            Self::TerminalCare => "terminal_care",
        }
    }
}

/// Documentation status of a record.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordStatus {
    Draft,
    InProgress,
    Completed,
    Cancelled,
}

impl WireEnum for RecordStatus {
    const ALL: &'static [Self] = &[
        Self::Draft,
        Self::InProgress,
        Self::Completed,
        Self::Cancelled,
    ];

    fn as_str(self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
        }
    }
}

/// How the record content was produced.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
    Manual,
    VoiceToText,
    AiGenerated,
    Template,
}

impl WireEnum for SourceType {
    const ALL: &'static [Self] = &[
        Self::Manual,
        Self::VoiceToText,
        Self::AiGenerated,
        Self::Template,
    ];

    fn as_str(self) -> &'static str {
        match self {
            Self::Manual => "manual",
            Self::VoiceToText => "voice_to_text",
            Self::AiGenerated => "ai_generated",
            Self::Template => "template",
        }
    }
}

/// Clinical specialty a content template is written for.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Specialty {
    General,
    InternalMedicine,
    Surgery,
    Pediatrics,
    Psychiatry,
    Dermatology,
    Orthopedics,
    PalliativeCare,
    Rehabilitation,
    Other,
}

impl WireEnum for Specialty {
    const ALL: &'static [Self] = &[
        Self::General,
        Self::InternalMedicine,
        Self::Surgery,
        Self::Pediatrics,
        Self::Psychiatry,
        Self::Dermatology,
        Self::Orthopedics,
        Self::PalliativeCare,
        Self::Rehabilitation,
        Self::Other,
    ];

    fn as_str(self) -> &'static str {
        match self {
            Self::General => "general",
            Self::InternalMedicine => "internal_medicine",
            Self::Surgery => "surgery",
            Self::Pediatrics => "pediatrics",
            Self::Psychiatry => "psychiatry",
            Self::Dermatology => "dermatology",
            Self::Orthopedics => "orthopedics",
            Self::PalliativeCare => "palliative_care",
            Self::Rehabilitation => "rehabilitation",
            Self::Other => "other",
        }
    }
}

macro_rules! wire_display_and_from_str {
    ($($ty:ty => $field:literal),+ $(,)?) => {
        $(
            impl fmt::Display for $ty {
                fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                    f.write_str(self.as_str())
                }
            }

            impl FromStr for $ty {
                type Err = MutationError;

                fn from_str(s: &str) -> Result<Self, Self::Err> {
                    parse_member($field, s)
                }
            }
        )+
    };
}

wire_display_and_from_str! {
    VisitType => "visit_type",
    RecordStatus => "status",
    SourceType => "source_type",
    Specialty => "specialty",
}

/// Rule set applied when a status change is requested.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionPolicy {
    /// Any valid status may follow any other.
    #[default]
    Unrestricted,
    /// draft -> in_progress | completed | cancelled; in_progress -> completed | cancelled.
    /// Completed and cancelled are terminal. Re-asserting the current status is always allowed.
    Ordered,
}

impl TransitionPolicy {
    /// Checks a requested move from `from` to `to`.
    ///
    /// # Errors
    ///
    /// Returns [`MutationError::Validation`] on the `status` field if the policy forbids it.
    pub fn check(self, from: RecordStatus, to: RecordStatus) -> MutationResult<()> {
        if self == Self::Unrestricted || from == to {
            return Ok(());
        }

        use RecordStatus::*;
        let allowed = matches!(
            (from, to),
            (Draft, InProgress | Completed | Cancelled) | (InProgress, Completed | Cancelled)
        );

        if allowed {
            Ok(())
        } else {
            Err(MutationError::validation(
                "status",
                format!("transition from {} to {} is not allowed", from, to),
            ))
        }
    }
}
