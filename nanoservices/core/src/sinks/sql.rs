//! SQL text helpers shared by the dialects.

use parrot_utils::error::Error;
use parrot_utils::{ChangeEvent, Field, FieldValue, ParrotResult};

/// Accepts `[A-Za-z_][A-Za-z0-9_]*`; everything else is refused before it can
/// reach a statement.
pub fn validate_identifier(name: &str) -> ParrotResult<&str> {
    let mut chars = name.chars();
    let valid = match chars.next() {
        Some(first) => {
            (first.is_ascii_alphabetic() || first == '_')
                && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        None => false,
    };
    if valid {
        Ok(name)
    } else {
        Err(Error::sink(format!("invalid identifier '{name}'")))
    }
}

/// Target table for an event: the last segment of a dotted source name.
pub fn table_name(event: &ChangeEvent) -> ParrotResult<&str> {
    let table = event.table.rsplit('.').next().unwrap_or(&event.table);
    validate_identifier(table)
}

/// The event's key fields, all of which must be present and non-null.
pub fn key_fields(event: &ChangeEvent) -> ParrotResult<Vec<&Field>> {
    if event.key.is_empty() {
        return Err(Error::sink(format!(
            "event at offset {} for '{}' declares no key fields",
            event.offset, event.table
        )));
    }
    event
        .key
        .iter()
        .map(|name| match event.field(name) {
            Some(field) if !field.value.is_null() => Ok(field),
            _ => Err(Error::sink(format!(
                "event at offset {} for '{}' has no value for key '{name}'",
                event.offset, event.table
            ))),
        })
        .collect()
}

/// Standard SQL string literal.
fn quote_text(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// Render a value as a SQL literal. Non-finite floats have no literal form
/// and become NULL.
pub fn literal(value: &FieldValue) -> String {
    match value {
        FieldValue::Null => "NULL".to_string(),
        FieldValue::Bool(true) => "TRUE".to_string(),
        FieldValue::Bool(false) => "FALSE".to_string(),
        FieldValue::Int(i) => i.to_string(),
        FieldValue::Float(f) if f.is_finite() => format!("{f:?}"),
        FieldValue::Float(_) => "NULL".to_string(),
        FieldValue::Text(_) | FieldValue::Bytes(_) => match value.to_text() {
            Some(text) => quote_text(&text),
            None => "NULL".to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parrot_utils::{FieldType, Operation, SourceOffset};

    fn event(table: &str, key: &[&str], fields: Vec<Field>) -> ChangeEvent {
        ChangeEvent {
            op: Operation::Insert,
            table: table.into(),
            key: key.iter().map(|k| k.to_string()).collect(),
            fields,
            offset: SourceOffset(1),
        }
    }

    #[test]
    fn identifiers() {
        assert!(validate_identifier("orders_2024").is_ok());
        assert!(validate_identifier("_tmp").is_ok());
        assert!(validate_identifier("").is_err());
        assert!(validate_identifier("1orders").is_err());
        assert!(validate_identifier("orders; DROP TABLE x").is_err());
        assert!(validate_identifier("naïve").is_err());
    }

    #[test]
    fn table_name_takes_last_segment() {
        let e = event("dbserver1.inventory.customers", &["id"], vec![]);
        assert_eq!(table_name(&e).unwrap(), "customers");
    }

    #[test]
    fn missing_or_null_key_is_a_sink_error() {
        let id = Field::new("id", FieldType::Int32, FieldValue::Null);
        let err = key_fields(&event("t", &["id"], vec![id])).unwrap_err();
        assert!(matches!(err, Error::Sink(_)));
        assert!(key_fields(&event("t", &[], vec![])).is_err());
    }

    #[test]
    fn literals() {
        assert_eq!(literal(&FieldValue::Text("O'Brien".into())), "'O''Brien'");
        assert_eq!(literal(&FieldValue::Int(-3)), "-3");
        assert_eq!(literal(&FieldValue::Float(1.0)), "1.0");
        assert_eq!(literal(&FieldValue::Float(f64::NAN)), "NULL");
        assert_eq!(literal(&FieldValue::Bool(true)), "TRUE");
        assert_eq!(literal(&FieldValue::Bytes(vec![0x0f])), "'0f'");
        assert_eq!(literal(&FieldValue::Null), "NULL");
    }
}
