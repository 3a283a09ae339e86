//! Records, record types and the room schema.
//!
//! A record is an immutable value snapshot: `(id, type, content)` plus the
//! room clock at which it last changed. Content is opaque JSON; the only
//! structure the room enforces is what the record's [`RecordType`] declares.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

/// Type name reserved for session-scoped presence records.
pub const PRESENCE_TYPE: &str = "presence";

/// Stable record identifier.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(pub String);

impl RecordId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RecordId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for RecordId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Opaque JSON record payload.
///
/// Carried as JSON text on the wire: bincode cannot decode self-describing
/// values, so the content is serialized as a string and re-parsed.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordContent(pub Value);

impl RecordContent {
    pub fn new(value: Value) -> Self {
        Self(value)
    }

    pub fn value(&self) -> &Value {
        &self.0
    }

    /// Look up a top-level field.
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.0.get(field)
    }
}

impl From<Value> for RecordContent {
    fn from(value: Value) -> Self {
        Self(value)
    }
}

impl Serialize for RecordContent {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0.to_string())
    }
}

impl<'de> Deserialize<'de> for RecordContent {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        serde_json::from_str(&raw)
            .map(RecordContent)
            .map_err(serde::de::Error::custom)
    }
}

/// A versioned record snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub id: RecordId,
    pub type_name: String,
    pub content: RecordContent,
    /// Room clock at which this version was accepted.
    pub last_changed_clock: u64,
}

impl Record {
    pub fn new(
        id: impl Into<RecordId>,
        type_name: impl Into<String>,
        content: impl Into<RecordContent>,
        clock: u64,
    ) -> Self {
        Self {
            id: id.into(),
            type_name: type_name.into(),
            content: content.into(),
            last_changed_clock: clock,
        }
    }

    /// Same type and content, ignoring the version stamp.
    pub fn same_value(&self, type_name: &str, content: &RecordContent) -> bool {
        self.type_name == type_name && &self.content == content
    }
}

/// Whether a record type belongs to the durable document or to one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecordScope {
    Document,
    Presence,
}

/// JSON kind a declared field must have.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FieldKind {
    String,
    Number,
    Bool,
    Object,
    Array,
    Any,
}

impl FieldKind {
    pub fn matches(&self, value: &Value) -> bool {
        match self {
            FieldKind::String => value.is_string(),
            FieldKind::Number => value.is_number(),
            FieldKind::Bool => value.is_boolean(),
            FieldKind::Object => value.is_object(),
            FieldKind::Array => value.is_array(),
            FieldKind::Any => true,
        }
    }
}

impl fmt::Display for FieldKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FieldKind::String => "string",
            FieldKind::Number => "number",
            FieldKind::Bool => "bool",
            FieldKind::Object => "object",
            FieldKind::Array => "array",
            FieldKind::Any => "any",
        };
        f.write_str(name)
    }
}

impl std::str::FromStr for FieldKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "string" => Ok(FieldKind::String),
            "number" => Ok(FieldKind::Number),
            "bool" => Ok(FieldKind::Bool),
            "object" => Ok(FieldKind::Object),
            "array" => Ok(FieldKind::Array),
            "any" => Ok(FieldKind::Any),
            other => Err(format!(
                "unknown field kind '{other}' (expected string, number, bool, object, array or any)"
            )),
        }
    }
}

/// Why a single record was refused.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum ValidationError {
    #[error("unknown record type: {0}")]
    UnknownType(String),
    #[error("record type '{0}' cannot be written through a document push")]
    WrongScope(String),
    #[error("record content must be a JSON object")]
    NotAnObject,
    #[error("missing required field '{0}'")]
    MissingField(String),
    #[error("field '{field}' must be of kind {expected}")]
    WrongFieldKind { field: String, expected: FieldKind },
    #[error("record id must not be empty")]
    EmptyId,
    #[error("record id '{0}' is a session's presence id")]
    ReservedId(String),
}

/// A declared field of a record type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldSpec {
    pub name: String,
    pub kind: FieldKind,
}

/// Shape declaration for one record type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordType {
    pub name: String,
    pub scope: RecordScope,
    pub fields: Vec<FieldSpec>,
}

impl RecordType {
    /// A durable document record type.
    pub fn document(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            scope: RecordScope::Document,
            fields: Vec::new(),
        }
    }

    /// The session-scoped presence record type.
    pub fn presence() -> Self {
        Self {
            name: PRESENCE_TYPE.to_string(),
            scope: RecordScope::Presence,
            fields: Vec::new(),
        }
    }

    /// Declare a required field.
    pub fn field(mut self, name: impl Into<String>, kind: FieldKind) -> Self {
        self.fields.push(FieldSpec {
            name: name.into(),
            kind,
        });
        self
    }

    pub fn validate(&self, content: &RecordContent) -> Result<(), ValidationError> {
        let object = content.value().as_object().ok_or(ValidationError::NotAnObject)?;
        for spec in &self.fields {
            match object.get(&spec.name) {
                None => return Err(ValidationError::MissingField(spec.name.clone())),
                Some(value) if !spec.kind.matches(value) => {
                    return Err(ValidationError::WrongFieldKind {
                        field: spec.name.clone(),
                        expected: spec.kind,
                    });
                }
                Some(_) => {}
            }
        }
        Ok(())
    }
}

/// Which side of a handshake is out of date.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SchemaMismatch {
    /// Client schema is older than the oldest the room accepts.
    ClientTooOld,
    /// Client schema is newer than the room's.
    ServerTooOld,
}

impl fmt::Display for SchemaMismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchemaMismatch::ClientTooOld => f.write_str("client schema too old"),
            SchemaMismatch::ServerTooOld => f.write_str("server schema too old"),
        }
    }
}

/// Schema summary a client reports in its handshake.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaDescriptor {
    pub version: u32,
    pub record_types: Vec<String>,
}

/// The set of record types a room accepts, with its version window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Schema {
    pub version: u32,
    /// Oldest client schema version still accepted.
    pub min_supported_version: u32,
    record_types: BTreeMap<String, RecordType>,
}

impl Default for Schema {
    fn default() -> Self {
        Self::new(1)
    }
}

impl Schema {
    /// Schema with only the built-in presence type.
    pub fn new(version: u32) -> Self {
        let mut record_types = BTreeMap::new();
        record_types.insert(PRESENCE_TYPE.to_string(), RecordType::presence());
        Self {
            version,
            min_supported_version: version,
            record_types,
        }
    }

    pub fn with_min_supported(mut self, version: u32) -> Self {
        self.min_supported_version = version;
        self
    }

    /// Register (or replace) a record type.
    pub fn with_type(mut self, record_type: RecordType) -> Self {
        self.record_types.insert(record_type.name.clone(), record_type);
        self
    }

    pub fn record_type(&self, name: &str) -> Option<&RecordType> {
        self.record_types.get(name)
    }

    pub fn descriptor(&self) -> SchemaDescriptor {
        SchemaDescriptor {
            version: self.version,
            record_types: self.record_types.keys().cloned().collect(),
        }
    }

    /// Check a client's reported schema against the supported window.
    pub fn check_client(&self, client: &SchemaDescriptor) -> Result<(), SchemaMismatch> {
        if client.version > self.version {
            Err(SchemaMismatch::ServerTooOld)
        } else if client.version < self.min_supported_version {
            Err(SchemaMismatch::ClientTooOld)
        } else {
            Ok(())
        }
    }

    /// Validate a record written through a document push.
    pub fn validate_document(
        &self,
        id: &RecordId,
        type_name: &str,
        content: &RecordContent,
    ) -> Result<(), ValidationError> {
        if id.as_str().is_empty() {
            return Err(ValidationError::EmptyId);
        }
        let record_type = self
            .record_type(type_name)
            .ok_or_else(|| ValidationError::UnknownType(type_name.to_string()))?;
        if record_type.scope != RecordScope::Document {
            return Err(ValidationError::WrongScope(type_name.to_string()));
        }
        record_type.validate(content)
    }

    /// Validate a session's presence content.
    pub fn validate_presence(&self, content: &RecordContent) -> Result<(), ValidationError> {
        match self.record_type(PRESENCE_TYPE) {
            Some(record_type) => record_type.validate(content),
            None => Err(ValidationError::UnknownType(PRESENCE_TYPE.to_string())),
        }
    }
}
