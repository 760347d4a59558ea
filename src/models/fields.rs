//! Typed process data fields.
//!
//! A process instance carries a set of named fields whose types are fixed by
//! the process definition. Values are a tagged variant so a mismatched read or
//! write surfaces as [`Error::TypeMismatch`] instead of a failed cast.

use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// The declared type of a data field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldKind {
    String,
    Integer,
    Date,
    Xml,
}

impl FieldKind {
    /// Parse a field kind from a string.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "string" | "text" => Some(Self::String),
            "integer" | "int" => Some(Self::Integer),
            "date" | "datetime" => Some(Self::Date),
            "xml" => Some(Self::Xml),
            _ => None,
        }
    }

    /// Get the string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Integer => "integer",
            Self::Date => "date",
            Self::Xml => "xml",
        }
    }

    /// The value a freshly created process gets for a field of this kind.
    pub fn default_value(&self) -> FieldValue {
        match self {
            Self::String => FieldValue::String(String::new()),
            Self::Integer => FieldValue::Integer(0),
            Self::Date => FieldValue::Date(DateTime::<Utc>::default()),
            Self::Xml => FieldValue::Xml(String::new()),
        }
    }
}

impl fmt::Display for FieldKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A single data field value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum FieldValue {
    String(String),
    Integer(i64),
    Date(DateTime<Utc>),
    /// XML document kept as its serialized text
    Xml(String),
}

impl FieldValue {
    pub fn kind(&self) -> FieldKind {
        match self {
            FieldValue::String(_) => FieldKind::String,
            FieldValue::Integer(_) => FieldKind::Integer,
            FieldValue::Date(_) => FieldKind::Date,
            FieldValue::Xml(_) => FieldKind::Xml,
        }
    }

    /// Convert `self` to the given kind where the conversion is lossless.
    ///
    /// Only text flows between `String` and `Xml`; everything else must match.
    fn coerce(self, kind: FieldKind) -> std::result::Result<FieldValue, FieldValue> {
        match (self, kind) {
            (v, k) if v.kind() == k => Ok(v),
            (FieldValue::String(s), FieldKind::Xml) => Ok(FieldValue::Xml(s)),
            (v, _) => Err(v),
        }
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        FieldValue::String(value.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        FieldValue::String(value)
    }
}

impl From<i64> for FieldValue {
    fn from(value: i64) -> Self {
        FieldValue::Integer(value)
    }
}

impl From<i32> for FieldValue {
    fn from(value: i32) -> Self {
        FieldValue::Integer(i64::from(value))
    }
}

impl From<DateTime<Utc>> for FieldValue {
    fn from(value: DateTime<Utc>) -> Self {
        FieldValue::Date(value)
    }
}

/// Named data fields of a process instance, ordered by name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DataFields(BTreeMap<String, FieldValue>);

impl DataFields {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a field with its initial value, replacing any earlier declaration.
    ///
    /// This defines the field's type; use [`DataFields::set`] to change values
    /// of declared fields.
    pub fn declare(&mut self, name: impl Into<String>, value: impl Into<FieldValue>) {
        self.0.insert(name.into(), value.into());
    }

    /// Get a field by name.
    pub fn get(&self, name: &str) -> Result<&FieldValue> {
        self.0
            .get(name)
            .ok_or_else(|| Error::NotFound(format!("Data field not found: {}", name)))
    }

    pub fn get_string(&self, name: &str) -> Result<&str> {
        match self.get(name)? {
            FieldValue::String(s) => Ok(s),
            other => Err(mismatch(name, FieldKind::String, other.kind())),
        }
    }

    pub fn get_integer(&self, name: &str) -> Result<i64> {
        match self.get(name)? {
            FieldValue::Integer(i) => Ok(*i),
            other => Err(mismatch(name, FieldKind::Integer, other.kind())),
        }
    }

    pub fn get_date(&self, name: &str) -> Result<DateTime<Utc>> {
        match self.get(name)? {
            FieldValue::Date(d) => Ok(*d),
            other => Err(mismatch(name, FieldKind::Date, other.kind())),
        }
    }

    pub fn get_xml(&self, name: &str) -> Result<&str> {
        match self.get(name)? {
            FieldValue::Xml(s) => Ok(s),
            other => Err(mismatch(name, FieldKind::Xml, other.kind())),
        }
    }

    /// Set the value of a declared field.
    ///
    /// Fails with `NotFound` for undeclared names and `TypeMismatch` when the
    /// value does not fit the declared type. The fields are untouched on error.
    pub fn set(&mut self, name: &str, value: impl Into<FieldValue>) -> Result<()> {
        let slot = self
            .0
            .get_mut(name)
            .ok_or_else(|| Error::NotFound(format!("Data field not found: {}", name)))?;
        let expected = slot.kind();
        let value = value
            .into()
            .coerce(expected)
            .map_err(|v| mismatch(name, expected, v.kind()))?;
        *slot = value;
        Ok(())
    }

    /// Set an XML field from its serialized text.
    pub fn set_xml(&mut self, name: &str, xml: impl Into<String>) -> Result<()> {
        self.set(name, FieldValue::Xml(xml.into()))
    }

    /// Apply every field of `changes`, all or nothing.
    pub fn apply(&mut self, changes: &DataFields) -> Result<()> {
        let mut staged = self.clone();
        for (name, value) in changes.iter() {
            staged.set(name, value.clone())?;
        }
        *self = staged;
        Ok(())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &FieldValue)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<(String, FieldValue)> for DataFields {
    fn from_iter<T: IntoIterator<Item = (String, FieldValue)>>(iter: T) -> Self {
        DataFields(iter.into_iter().collect())
    }
}

fn mismatch(field: &str, expected: FieldKind, found: FieldKind) -> Error {
    Error::TypeMismatch {
        field: field.to_string(),
        expected,
        found,
    }
}
