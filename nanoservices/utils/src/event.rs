use std::fmt;

use serde::{Deserialize, Serialize};

/// Position of a change event in its source stream. Offsets grow strictly
/// within one stream; resuming "after" an offset skips everything up to and
/// including it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SourceOffset(pub u64);

impl fmt::Display for SourceOffset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Insert,
    Update,
    Delete,
}

/// Generic field type carried by change events. Anything the capture side
/// reports that is not one of the fixed primitives lands in `Other`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum FieldType {
    Int8,
    Int16,
    Int32,
    Int64,
    Float32,
    Float64,
    String,
    Boolean,
    Bytes,
    Other(std::string::String),
}

impl From<std::string::String> for FieldType {
    fn from(value: std::string::String) -> Self {
        match value.to_ascii_lowercase().as_str() {
            "int8" => FieldType::Int8,
            "int16" => FieldType::Int16,
            "int32" => FieldType::Int32,
            "int64" => FieldType::Int64,
            "float32" => FieldType::Float32,
            "float64" => FieldType::Float64,
            "string" => FieldType::String,
            "boolean" => FieldType::Boolean,
            "bytes" => FieldType::Bytes,
            _ => FieldType::Other(value),
        }
    }
}

impl From<FieldType> for std::string::String {
    fn from(value: FieldType) -> Self {
        value.to_string()
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldType::Int8 => write!(f, "int8"),
            FieldType::Int16 => write!(f, "int16"),
            FieldType::Int32 => write!(f, "int32"),
            FieldType::Int64 => write!(f, "int64"),
            FieldType::Float32 => write!(f, "float32"),
            FieldType::Float64 => write!(f, "float64"),
            FieldType::String => write!(f, "string"),
            FieldType::Boolean => write!(f, "boolean"),
            FieldType::Bytes => write!(f, "bytes"),
            FieldType::Other(name) => write!(f, "{name}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
}

impl FieldValue {
    pub fn is_null(&self) -> bool {
        matches!(self, FieldValue::Null)
    }

    /// Textual rendering used when a value lands in a fallback text column.
    pub fn to_text(&self) -> Option<String> {
        match self {
            FieldValue::Null => None,
            FieldValue::Bool(b) => Some(b.to_string()),
            FieldValue::Int(i) => Some(i.to_string()),
            FieldValue::Float(v) => Some(v.to_string()),
            FieldValue::Text(s) => Some(s.clone()),
            FieldValue::Bytes(bytes) => Some(bytes.iter().map(|b| format!("{b:02x}")).collect()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Field {
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: FieldType,
    pub value: FieldValue,
}

impl Field {
    pub fn new(name: impl Into<String>, field_type: FieldType, value: FieldValue) -> Self {
        Self { name: name.into(), field_type, value }
    }
}

/// One captured row change.
///
/// `key` names the fields that identify the row; for `Delete` only the key
/// fields need to be present.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub op: Operation,
    pub table: String,
    pub key: Vec<String>,
    pub fields: Vec<Field>,
    pub offset: SourceOffset,
}

impl ChangeEvent {
    pub fn field(&self, name: &str) -> Option<&Field> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn key_fields(&self) -> impl Iterator<Item = &Field> {
        self.key.iter().filter_map(move |k| self.field(k))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn field_type_parses_known_names_case_insensitively() {
        assert_eq!(FieldType::from("INT64".to_string()), FieldType::Int64);
        assert_eq!(FieldType::from("float32".to_string()), FieldType::Float32);
        assert_eq!(
            FieldType::from("struct".to_string()),
            FieldType::Other("struct".to_string())
        );
    }

    #[test]
    fn change_event_reads_from_json() {
        let json = r#"{
            "op": "update",
            "table": "customers",
            "key": ["id"],
            "fields": [
                {"name": "id", "type": "int32", "value": 7},
                {"name": "email", "type": "string", "value": "a@b.c"},
                {"name": "meta", "type": "map", "value": null}
            ],
            "offset": 12
        }"#;
        let event: ChangeEvent = serde_json::from_str(json).unwrap();
        assert_eq!(event.op, Operation::Update);
        assert_eq!(event.offset, SourceOffset(12));
        assert_eq!(event.field("id").unwrap().value, FieldValue::Int(7));
        assert_eq!(event.field("meta").unwrap().field_type, FieldType::Other("map".into()));
        assert_eq!(event.key_fields().count(), 1);
    }

    #[test]
    fn bytes_render_as_hex_text() {
        assert_eq!(FieldValue::Bytes(vec![0xde, 0xad]).to_text().as_deref(), Some("dead"));
        assert_eq!(FieldValue::Null.to_text(), None);
    }
}
