//! Data models shared by the client and its backends.
//!
//! This module defines the core data structures:
//! - `Identity` - Fully-qualified user names (`label:name`)
//! - `SerialNumber` - Worklist item identifiers (`<process>_<destination>`)
//! - `ProcessRecord` - A process instance as reported by the backend
//! - `ItemRecord` - A worklist item as reported by the backend
//! - `Comment` / `AttachmentRecord` - Side-channel entries on a process instance
//! - `Scope` - Where a comment or attachment lives

pub mod criteria;
pub mod fields;

use crate::{Error, Result};
use chrono::{DateTime, Utc};
use fields::DataFields;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Security label used when an identity does not name one.
pub const DEFAULT_SECURITY_LABEL: &str = "K2";

/// A user known to the backend, qualified by its security provider label.
///
/// The textual form is `label:name`, for example `K2:DENALLIX\bob`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Identity {
    pub label: String,
    pub name: String,
}

impl Identity {
    pub fn new(label: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            name: name.into(),
        }
    }

    /// Parse `label:name` or a bare `name`, which gets `default_label`.
    pub fn parse(s: &str, default_label: &str) -> Result<Self> {
        let s = s.trim();
        let (label, name) = match s.split_once(':') {
            Some((label, name)) => (label.trim(), name.trim()),
            None => (default_label, s),
        };
        if label.is_empty() {
            return Err(Error::InvalidInput(format!(
                "Identity has an empty security label: {}",
                s
            )));
        }
        if name.is_empty() {
            return Err(Error::InvalidInput(format!(
                "Identity has an empty user name: {}",
                s
            )));
        }
        Ok(Self::new(label, name))
    }

    /// The fully-qualified name, `label:name`.
    pub fn fqn(&self) -> String {
        format!("{}:{}", self.label, self.name)
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.label, self.name)
    }
}

/// Identifier of a worklist item: `<process instance id>_<destination id>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SerialNumber {
    process_instance_id: i64,
    destination_id: i64,
}

impl SerialNumber {
    pub fn new(process_instance_id: i64, destination_id: i64) -> Self {
        Self {
            process_instance_id,
            destination_id,
        }
    }

    /// Parse a serial number such as `42_117`.
    pub fn parse(s: &str) -> Result<Self> {
        let invalid = || Error::InvalidInput(format!("Invalid serial number: {}", s));
        let (process, destination) = s.trim().split_once('_').ok_or_else(invalid)?;
        let process_instance_id: i64 = process.parse().map_err(|_| invalid())?;
        let destination_id: i64 = destination.parse().map_err(|_| invalid())?;
        if process_instance_id <= 0 || destination_id <= 0 {
            return Err(invalid());
        }
        Ok(Self::new(process_instance_id, destination_id))
    }

    pub fn process_instance_id(&self) -> i64 {
        self.process_instance_id
    }

    pub fn destination_id(&self) -> i64 {
        self.destination_id
    }
}

impl fmt::Display for SerialNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.process_instance_id, self.destination_id)
    }
}

impl FromStr for SerialNumber {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        SerialNumber::parse(s)
    }
}

impl TryFrom<String> for SerialNumber {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        SerialNumber::parse(&value)
    }
}

impl From<SerialNumber> for String {
    fn from(value: SerialNumber) -> Self {
        value.to_string()
    }
}

/// Lifecycle of a process instance.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessStatus {
    /// Created in memory, not started yet
    #[default]
    New,
    Active,
    Completed,
}

impl ProcessStatus {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "new" => Some(Self::New),
            "active" => Some(Self::Active),
            "completed" => Some(Self::Completed),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Active => "active",
            Self::Completed => "completed",
        }
    }
}

impl fmt::Display for ProcessStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Lifecycle of a worklist item.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    #[default]
    Unopened,
    Opened,
    Completed,
}

impl ItemStatus {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "unopened" => Some(Self::Unopened),
            "opened" => Some(Self::Opened),
            "completed" => Some(Self::Completed),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unopened => "unopened",
            Self::Opened => "opened",
            Self::Completed => "completed",
        }
    }
}

impl fmt::Display for ItemStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A process instance as reported by the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessRecord {
    /// Backend id, 0 until the instance is started
    pub id: i64,

    /// Definition name including its folder, e.g. `Finance\Expense Claim`
    pub full_name: String,

    /// Human-readable instance label
    pub folio: String,

    pub priority: i32,

    pub status: ProcessStatus,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub originator: Option<Identity>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_date: Option<DateTime<Utc>>,

    /// Empty in worklist summaries; filled once the item is opened
    #[serde(default)]
    pub data_fields: DataFields,
}

impl ProcessRecord {
    /// The folder part of `full_name`.
    pub fn folder(&self) -> &str {
        split_full_name(&self.full_name).0
    }

    /// The definition name without its folder.
    pub fn name(&self) -> &str {
        split_full_name(&self.full_name).1
    }
}

/// Split `Folder\Name` into its parts. A name without folder has an empty folder.
pub fn split_full_name(full_name: &str) -> (&str, &str) {
    match full_name.rsplit_once('\\') {
        Some((folder, name)) => (folder, name),
        None => ("", full_name),
    }
}

/// A worklist item as reported by the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemRecord {
    pub serial_number: SerialNumber,

    pub status: ItemStatus,

    pub activity_name: String,

    pub activity_start_date: DateTime<Utc>,

    /// The user the item was routed to
    pub destination: Identity,

    pub platform: String,

    pub process: ProcessRecord,

    /// Action names available while the item is open
    #[serde(default)]
    pub actions: Vec<String>,
}

/// A comment on a process instance or one of its activity destinations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Comment {
    pub id: i64,
    pub process_instance_id: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub destination_id: Option<i64>,
    pub author: Identity,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

/// Where a comment or attachment is read from or written to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
    /// The whole process instance
    Process(i64),
    /// One activity-instance destination within a process instance
    Destination {
        process_instance_id: i64,
        destination_id: i64,
    },
    /// The process instance owning a worklist item
    SerialNumber(SerialNumber),
}

impl Scope {
    pub fn destination(process_instance_id: i64, destination_id: i64) -> Self {
        Scope::Destination {
            process_instance_id,
            destination_id,
        }
    }

    /// Resolve to `(process instance id, destination id)`.
    ///
    /// A serial number resolves to its owning process instance.
    pub fn resolve(&self) -> (i64, Option<i64>) {
        match self {
            Scope::Process(id) => (*id, None),
            Scope::Destination {
                process_instance_id,
                destination_id,
            } => (*process_instance_id, Some(*destination_id)),
            Scope::SerialNumber(sn) => (sn.process_instance_id(), None),
        }
    }
}

impl From<i64> for Scope {
    fn from(value: i64) -> Self {
        Scope::Process(value)
    }
}

impl From<SerialNumber> for Scope {
    fn from(value: SerialNumber) -> Self {
        Scope::SerialNumber(value)
    }
}

impl From<&SerialNumber> for Scope {
    fn from(value: &SerialNumber) -> Self {
        Scope::SerialNumber(value.clone())
    }
}

/// Content state of an attachment.
///
/// An attachment starts either `Pending` (metadata only) or `Uploaded`; the
/// move from `Pending` to `Uploaded` happens at most once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum AttachmentContent {
    Pending,
    Uploaded {
        size: u64,
        /// Present only when the file was requested with the metadata
        #[serde(default, skip_serializing_if = "Option::is_none", with = "base64_bytes")]
        bytes: Option<Vec<u8>>,
    },
}

impl AttachmentContent {
    pub fn is_uploaded(&self) -> bool {
        matches!(self, AttachmentContent::Uploaded { .. })
    }
}

/// An attachment as reported by the backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentRecord {
    pub id: i64,
    pub process_instance_id: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub destination_id: Option<i64>,
    pub file_name: String,
    pub owner: Identity,
    pub created_at: DateTime<Utc>,
    pub content: AttachmentContent,
}

/// Serde helper carrying optional binary content as base64 text.
pub mod base64_bytes {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        value: &Option<Vec<u8>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(bytes) => serializer.serialize_some(&STANDARD.encode(bytes)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Vec<u8>>, D::Error> {
        let encoded: Option<String> = Option::deserialize(deserializer)?;
        encoded
            .map(|s| STANDARD.decode(s.as_bytes()).map_err(serde::de::Error::custom))
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_parse_with_label() {
        let id = Identity::parse("K2:DENALLIX\\bob", "Other").unwrap();
        assert_eq!(id.label, "K2");
        assert_eq!(id.name, "DENALLIX\\bob");
        assert_eq!(id.fqn(), "K2:DENALLIX\\bob");
    }

    #[test]
    fn test_identity_parse_default_label() {
        let id = Identity::parse("DENALLIX\\bob", "K2").unwrap();
        assert_eq!(id.to_string(), "K2:DENALLIX\\bob");
    }

    #[test]
    fn test_identity_parse_rejects_empty_parts() {
        assert!(Identity::parse("", "K2").is_err());
        assert!(Identity::parse(":bob", "K2").is_err());
        assert!(Identity::parse("K2:", "K2").is_err());
    }

    #[test]
    fn test_serial_number_roundtrip() {
        let sn = SerialNumber::parse("42_117").unwrap();
        assert_eq!(sn.process_instance_id(), 42);
        assert_eq!(sn.destination_id(), 117);
        assert_eq!(sn.to_string(), "42_117");
        assert_eq!(serde_json::to_string(&sn).unwrap(), "\"42_117\"");
    }

    #[test]
    fn test_serial_number_invalid() {
        for bad in ["", "42", "42_", "_7", "a_b", "0_1", "-1_3"] {
            assert!(SerialNumber::parse(bad).is_err(), "accepted {bad:?}");
        }
        assert!(serde_json::from_str::<SerialNumber>("\"nope\"").is_err());
    }

    #[test]
    fn test_split_full_name() {
        assert_eq!(split_full_name("Finance\\Expense Claim"), ("Finance", "Expense Claim"));
        assert_eq!(split_full_name("A\\B\\C"), ("A\\B", "C"));
        assert_eq!(split_full_name("Standalone"), ("", "Standalone"));
    }

    #[test]
    fn test_scope_resolution() {
        assert_eq!(Scope::Process(1).resolve(), (1, None));
        assert_eq!(Scope::destination(1, 10).resolve(), (1, Some(10)));
        let sn = SerialNumber::new(3, 30);
        assert_eq!(Scope::from(&sn).resolve(), (3, None));
    }

    #[test]
    fn test_attachment_content_base64() {
        let content = AttachmentContent::Uploaded {
            size: 3,
            bytes: Some(vec![1, 2, 3]),
        };
        let json = serde_json::to_string(&content).unwrap();
        assert_eq!(json, r#"{"state":"uploaded","size":3,"bytes":"AQID"}"#);
        let back: AttachmentContent = serde_json::from_str(&json).unwrap();
        assert_eq!(back, content);

        let bare: AttachmentContent =
            serde_json::from_str(r#"{"state":"uploaded","size":3}"#).unwrap();
        assert_eq!(bare, AttachmentContent::Uploaded { size: 3, bytes: None });
    }
}
