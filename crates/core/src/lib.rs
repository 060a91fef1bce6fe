//! # Visit Core
//!
//! Core business logic for clinical visit records.
//!
//! This crate contains the record mutation pipeline and its supporting pieces:
//! - Schema-less SOAP content documents and their deep merge
//! - Optimistic concurrency through record versions and conditional writes
//! - Record creation from templates and by copying existing records
//! - A bounded background pool for template usage counting
//!
//! **No transport or persistence concerns**: HTTP routing, authentication, encryption and the
//! database live behind the collaborator traits in [`store`]. The [`memory`] module provides
//! in-process implementations of those traits.

pub mod catalog;
pub mod config;
pub mod constants;
pub mod context;
pub mod document;
pub mod engine;
pub mod error;
pub mod ids;
pub mod instantiate;
pub mod lifecycle;
pub mod memory;
pub mod merge;
pub mod record;
pub mod store;
pub mod usage;
pub mod version;

pub use config::CoreConfig;
pub use context::RequestContext;
pub use document::Document;
pub use engine::RecordMutationEngine;
pub use error::{
    CatalogError, CatalogResult, ConfigError, ConfigResult, MutationError, MutationResult,
    StoreError, StoreResult,
};
pub use ids::{ActorId, PatientId, RecordId, ScheduleId, TemplateId};
pub use instantiate::{CopyRequest, FromTemplateRequest, TemplateInstantiator, VisitDetails};
pub use lifecycle::{RecordStatus, SourceType, Specialty, TransitionPolicy, VisitType, WireEnum};
pub use merge::{merge, merge_stored, MergeOutcome};
pub use record::{
    ClinicalRecord, ContentTemplate, MutationOutcome, MutationWarning, RecordContent,
    RecordDraft, RecordPatch,
};
pub use version::{VersionExpectation, VersionGuard};
