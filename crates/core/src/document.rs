//! Schema-less structured documents.
//!
//! Clinical note content is arbitrary nested JSON-like data. [`Document`] models it as a closed
//! tagged union so that merge and equality are plain structural recursion. Objects use a
//! `BTreeMap`, which keeps key order deterministic for comparison and rendering.
//!
//! Conversion to and from `serde_json::Value` is lossless, and a `Document` serializes as the
//! equivalent plain JSON.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Number, Value};
use std::collections::BTreeMap;

/// A recursive structured value: null, boolean, number, string, array or object.
#[derive(Clone, Debug, Default, PartialEq)]
pub enum Document {
    #[default]
    Null,
    Bool(bool),
    Number(Number),
    String(String),
    Array(Vec<Document>),
    Object(BTreeMap<String, Document>),
}

impl Document {
    /// Parses JSON text into a document.
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str::<Value>(text).map(Self::from)
    }

    /// An object with no keys.
    pub fn empty_object() -> Self {
        Self::Object(BTreeMap::new())
    }

    /// Renders the document as compact JSON text.
    pub fn to_json_string(&self) -> String {
        Value::from(self.clone()).to_string()
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    pub fn as_object(&self) -> Option<&BTreeMap<String, Document>> {
        match self {
            Self::Object(map) => Some(map),
            _ => None,
        }
    }

    /// Looks up a top-level key when this document is an object.
    pub fn get(&self, key: &str) -> Option<&Document> {
        self.as_object().and_then(|map| map.get(key))
    }
}

impl From<Value> for Document {
    fn from(value: Value) -> Self {
        match value {
            Value::Null => Self::Null,
            Value::Bool(b) => Self::Bool(b),
            Value::Number(n) => Self::Number(n),
            Value::String(s) => Self::String(s),
            Value::Array(items) => Self::Array(items.into_iter().map(Self::from).collect()),
            Value::Object(map) => {
                Self::Object(map.into_iter().map(|(k, v)| (k, Self::from(v))).collect())
            }
        }
    }
}

impl From<Document> for Value {
    fn from(doc: Document) -> Self {
        match doc {
            Document::Null => Value::Null,
            Document::Bool(b) => Value::Bool(b),
            Document::Number(n) => Value::Number(n),
            Document::String(s) => Value::String(s),
            Document::Array(items) => Value::Array(items.into_iter().map(Value::from).collect()),
            Document::Object(map) => Value::Object(
                map.into_iter()
                    .map(|(k, v)| (k, Value::from(v)))
                    .collect::<Map<String, Value>>(),
            ),
        }
    }
}

impl Serialize for Document {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match self {
            Self::Null => serializer.serialize_unit(),
            Self::Bool(b) => serializer.serialize_bool(*b),
            Self::Number(n) => n.serialize(serializer),
            Self::String(s) => serializer.serialize_str(s),
            Self::Array(items) => serializer.collect_seq(items),
            Self::Object(map) => serializer.collect_map(map),
        }
    }
}

impl<'de> Deserialize<'de> for Document {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        Value::deserialize(deserializer).map(Self::from)
    }
}
