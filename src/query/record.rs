//! Stored records and delivered result rows.

use std::collections::BTreeMap;

use crate::query::value::Value;
use crate::types::Rid;

/// Attribute name resolving to the record's own RID.
pub const RID_ATTR: &str = "@rid";
/// Attribute name resolving to the record's class name.
pub const CLASS_ATTR: &str = "@class";

/// A live record as returned by the storage layer.
#[derive(Clone, Debug, PartialEq)]
pub struct Record {
    /// Identity of the record.
    pub rid: Rid,
    /// Name of the record's class.
    pub class: String,
    /// Field values.
    pub fields: BTreeMap<String, Value>,
}

impl Record {
    /// Creates an empty record.
    pub fn new(rid: Rid, class: impl Into<String>) -> Self {
        Self {
            rid,
            class: class.into(),
            fields: BTreeMap::new(),
        }
    }

    /// Builder-style field setter.
    pub fn with(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    /// Reads a field or one of the `@rid` / `@class` attributes. Missing fields read as null.
    pub fn get(&self, name: &str) -> Value {
        match name {
            RID_ATTR => Value::Link(self.rid),
            CLASS_ATTR => Value::String(self.class.clone()),
            _ => self.fields.get(name).cloned().unwrap_or(Value::Null),
        }
    }
}

/// Row handed to a [`ResultSink`](crate::query::storage::ResultSink).
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Row {
    /// Source record identity, absent for computed rows (aggregates, index entries).
    pub rid: Option<Rid>,
    /// Projected values keyed by alias.
    pub fields: BTreeMap<String, Value>,
}

impl Row {
    /// Row holding every field of a record.
    pub fn from_record(record: &Record) -> Self {
        Self {
            rid: Some(record.rid),
            fields: record.fields.clone(),
        }
    }

    /// Computed row without identity.
    pub fn computed(fields: BTreeMap<String, Value>) -> Self {
        Self { rid: None, fields }
    }

    /// Reads a projected value, resolving `@rid` to the source identity.
    pub fn get(&self, name: &str) -> Value {
        if name == RID_ATTR {
            if let Some(rid) = self.rid {
                return Value::Link(rid);
            }
        }
        self.fields.get(name).cloned().unwrap_or(Value::Null)
    }
}
