//! Deep merge of clinical content documents.
//!
//! Partial updates carry only the branches the caller wants to change. The merge keeps every
//! branch the update does not mention, so stored content is always a fully merged document.
//!
//! Rules, applied at every path:
//! - object + object: merge key by key; keys missing from the update are kept as they were
//! - anything else: the update value replaces the existing one wholesale (arrays, scalars and
//!   explicit nulls included)
//!
//! Both inputs are borrowed and never modified.

use crate::document::Document;
use crate::record::RecordContent;
use std::collections::BTreeMap;

/// Result of merging an update into stored content.
#[derive(Clone, Debug, PartialEq)]
pub enum MergeOutcome {
    /// Existing content was readable and the update was deep-merged into it.
    Merged(Document),
    /// Existing content could not be read; the update was applied as-is.
    ReplacedUnreadable(Document),
}

impl MergeOutcome {
    pub fn document(&self) -> &Document {
        match self {
            Self::Merged(doc) | Self::ReplacedUnreadable(doc) => doc,
        }
    }

    pub fn into_document(self) -> Document {
        match self {
            Self::Merged(doc) | Self::ReplacedUnreadable(doc) => doc,
        }
    }

    pub fn replaced_unreadable(&self) -> bool {
        matches!(self, Self::ReplacedUnreadable(_))
    }
}

/// Deep-merges `update` into `existing` and returns the new document.
pub fn merge(existing: &Document, update: &Document) -> Document {
    match (existing, update) {
        (Document::Object(base), Document::Object(patch)) => {
            Document::Object(merge_objects(base, patch))
        }
        _ => update.clone(),
    }
}

fn merge_objects(
    base: &BTreeMap<String, Document>,
    patch: &BTreeMap<String, Document>,
) -> BTreeMap<String, Document> {
    let mut merged = base.clone();
    for (key, value) in patch {
        let next = match base.get(key) {
            Some(current) => merge(current, value),
            None => value.clone(),
        };
        merged.insert(key.clone(), next);
    }
    merged
}

/// Merges `update` into content as handed back by a store.
///
/// Unreadable stored content cannot be merged into; the update is returned unchanged and the
/// outcome says so, so the caller can surface a warning instead of losing the signal.
pub fn merge_stored(existing: &RecordContent, update: &Document) -> MergeOutcome {
    match existing {
        RecordContent::Document(doc) => MergeOutcome::Merged(merge(doc, update)),
        RecordContent::Unreadable => MergeOutcome::ReplacedUnreadable(update.clone()),
    }
}
