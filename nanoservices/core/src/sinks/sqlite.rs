use std::collections::HashSet;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use parrot_utils::error::Error;
use parrot_utils::{ChangeEvent, FieldType, FieldValue, Operation, ParrotResult};
use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection, Transaction};

use crate::sinks::into_sink_error;
use crate::sinks::sql::{key_fields, table_name, validate_identifier};
use crate::sinks::traits::{Credentials, SinkDialect};

const DRIVER: &str = "org.sqlite.JDBC";
const TEXT_FALLBACK: &str = "TEXT";

/// Embedded SQLite target. Every database is a file `<root>/<name>.db`.
#[derive(Debug, Clone)]
pub struct SqliteDialect {
    root: PathBuf,
}

impl SqliteDialect {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Existing file for `name`, matched case-insensitively.
    fn find_database(root: &Path, name: &str) -> ParrotResult<Option<PathBuf>> {
        let entries = match std::fs::read_dir(root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        for entry in entries {
            let path = entry?.path();
            let is_db = path.extension().and_then(|e| e.to_str()) == Some("db");
            let stem = path.file_stem().and_then(|s| s.to_str());
            if is_db && stem.is_some_and(|s| s.eq_ignore_ascii_case(name)) {
                return Ok(Some(path));
            }
        }
        Ok(None)
    }

    async fn blocking<T, F>(&self, context: String, work: F) -> ParrotResult<T>
    where
        T: Send + 'static,
        F: FnOnce(PathBuf) -> ParrotResult<T> + Send + 'static,
    {
        let root = self.root.clone();
        match tokio::task::spawn_blocking(move || work(root)).await {
            Ok(result) => result.map_err(|e| into_sink_error(&context, e)),
            Err(e) => Err(Error::sink(format!("{context}: worker failed: {e}"))),
        }
    }
}

fn map_type(field_type: &FieldType) -> &'static str {
    match field_type {
        FieldType::Int8
        | FieldType::Int16
        | FieldType::Int32
        | FieldType::Int64
        | FieldType::Boolean => "INTEGER",
        FieldType::Float32 | FieldType::Float64 => "REAL",
        FieldType::Bytes => "BLOB",
        _ => TEXT_FALLBACK,
    }
}

fn to_value(field_type: &FieldType, value: &FieldValue) -> Value {
    if map_type(field_type) == TEXT_FALLBACK {
        return value.to_text().map(Value::Text).unwrap_or(Value::Null);
    }
    match value {
        FieldValue::Null => Value::Null,
        FieldValue::Bool(b) => Value::Integer(i64::from(*b)),
        FieldValue::Int(i) => Value::Integer(*i),
        FieldValue::Float(f) => Value::Real(*f),
        FieldValue::Text(s) => Value::Text(s.clone()),
        FieldValue::Bytes(b) => Value::Blob(b.clone()),
    }
}

fn columns_of(tx: &Transaction<'_>, table: &str) -> ParrotResult<HashSet<String>> {
    let mut stmt = tx.prepare(&format!("PRAGMA table_info(\"{table}\")"))?;
    let names = stmt.query_map([], |row| row.get::<_, String>(1))?;
    let mut columns = HashSet::new();
    for name in names {
        columns.insert(name?);
    }
    Ok(columns)
}

/// Create the table for `event` or widen it with the columns it lacks.
fn ensure_table(tx: &Transaction<'_>, table: &str, event: &ChangeEvent) -> ParrotResult<()> {
    let existing = columns_of(tx, table)?;
    if existing.is_empty() {
        let mut columns = Vec::with_capacity(event.fields.len());
        for field in &event.fields {
            columns.push(format!(
                "\"{}\" {}",
                validate_identifier(&field.name)?,
                map_type(&field.field_type)
            ));
        }
        let keys = event
            .key
            .iter()
            .map(|k| validate_identifier(k).map(|k| format!("\"{k}\"")))
            .collect::<ParrotResult<Vec<_>>>()?;
        tx.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS \"{table}\" ({}, PRIMARY KEY ({}))",
            columns.join(", "),
            keys.join(", ")
        ))?;
        return Ok(());
    }
    for field in event.fields.iter().filter(|f| !existing.contains(&f.name)) {
        tracing::info!(table, column = %field.name, "widening sink table");
        tx.execute_batch(&format!(
            "ALTER TABLE \"{table}\" ADD COLUMN \"{}\" {}",
            validate_identifier(&field.name)?,
            map_type(&field.field_type)
        ))?;
    }
    Ok(())
}

fn upsert(tx: &Transaction<'_>, table: &str, event: &ChangeEvent) -> ParrotResult<()> {
    let mut names = Vec::with_capacity(event.fields.len());
    let mut updates = Vec::new();
    for field in &event.fields {
        let name = validate_identifier(&field.name)?;
        names.push(format!("\"{name}\""));
        if !event.key.contains(&field.name) {
            updates.push(format!("\"{name}\" = excluded.\"{name}\""));
        }
    }
    let placeholders = vec!["?"; names.len()].join(", ");
    let conflict_keys = event
        .key
        .iter()
        .map(|k| format!("\"{k}\""))
        .collect::<Vec<_>>()
        .join(", ");
    let on_conflict = if updates.is_empty() {
        "DO NOTHING".to_string()
    } else {
        format!("DO UPDATE SET {}", updates.join(", "))
    };
    let sql = format!(
        "INSERT INTO \"{table}\" ({}) VALUES ({placeholders}) ON CONFLICT ({conflict_keys}) {on_conflict}",
        names.join(", ")
    );
    let values = event.fields.iter().map(|f| to_value(&f.field_type, &f.value));
    tx.execute(&sql, params_from_iter(values))?;
    Ok(())
}

fn delete(tx: &Transaction<'_>, table: &str, event: &ChangeEvent) -> ParrotResult<()> {
    if columns_of(tx, table)?.is_empty() {
        return Ok(());
    }
    let keys = key_fields(event)?;
    let predicates = keys
        .iter()
        .map(|k| validate_identifier(&k.name).map(|n| format!("\"{n}\" = ?")))
        .collect::<ParrotResult<Vec<_>>>()?;
    let sql = format!("DELETE FROM \"{table}\" WHERE {}", predicates.join(" AND "));
    let values = keys.iter().map(|k| to_value(&k.field_type, &k.value));
    tx.execute(&sql, params_from_iter(values))?;
    Ok(())
}

fn apply_batch(path: &Path, events: &[ChangeEvent]) -> ParrotResult<usize> {
    let mut conn = Connection::open(path)?;
    let tx = conn.transaction()?;
    for event in events {
        let table = table_name(event)?;
        key_fields(event)?;
        match event.op {
            Operation::Insert | Operation::Update => {
                ensure_table(&tx, table, event)?;
                upsert(&tx, table, event)?;
            }
            Operation::Delete => delete(&tx, table, event)?,
        }
    }
    tx.commit()?;
    Ok(events.len())
}

#[async_trait]
impl SinkDialect for SqliteDialect {
    fn name(&self) -> &str {
        "sqlite"
    }

    fn map_type(&self, field_type: &FieldType) -> String {
        map_type(field_type).to_string()
    }

    fn driver_identifier(&self) -> &str {
        DRIVER
    }

    fn connection_uri(&self) -> String {
        format!("jdbc:sqlite:{}", self.root.display())
    }

    fn credentials(&self) -> Credentials {
        Credentials { user: String::new(), password: String::new() }
    }

    async fn database_exists(&self, name: &str) -> ParrotResult<bool> {
        let name = name.to_string();
        self.blocking(format!("look up sqlite database {name}"), move |root| {
            Ok(Self::find_database(&root, &name)?.is_some())
        })
        .await
    }

    async fn create_database(&self, name: &str) -> ParrotResult<()> {
        let name = validate_identifier(name)?.to_string();
        self.blocking(format!("create sqlite database {name}"), move |root| {
            std::fs::create_dir_all(&root)?;
            Connection::open(root.join(format!("{name}.db")))?;
            Ok(())
        })
        .await
    }

    async fn apply(&self, database: &str, events: &[ChangeEvent]) -> ParrotResult<usize> {
        let database = validate_identifier(database)?.to_string();
        if events.is_empty() {
            return Ok(0);
        }
        let events = events.to_vec();
        self.blocking(format!("apply batch to sqlite database {database}"), move |root| {
            let path = Self::find_database(&root, &database)?
                .ok_or_else(|| Error::sink(format!("database {database} does not exist")))?;
            apply_batch(&path, &events)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parrot_utils::{Field, SourceOffset};

    fn event(op: Operation, id: i64, fields: Vec<Field>, offset: u64) -> ChangeEvent {
        let mut all = vec![Field::new("id", FieldType::Int64, FieldValue::Int(id))];
        all.extend(fields);
        ChangeEvent {
            op,
            table: "inventory.customers".into(),
            key: vec!["id".into()],
            fields: all,
            offset: SourceOffset(offset),
        }
    }

    fn name(value: &str) -> Field {
        Field::new("name", FieldType::String, FieldValue::Text(value.into()))
    }

    fn rows(dialect: &SqliteDialect, db: &str) -> Vec<(i64, Option<String>)> {
        let conn = Connection::open(dialect.root().join(format!("{db}.db"))).unwrap();
        let mut stmt = conn.prepare("SELECT id, name FROM customers ORDER BY id").unwrap();
        stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))
            .unwrap()
            .map(|r| r.unwrap())
            .collect()
    }

    #[test]
    fn type_mapping_is_total() {
        let dialect = SqliteDialect::new("/unused");
        assert_eq!(dialect.map_type(&FieldType::Int8), "INTEGER");
        assert_eq!(dialect.map_type(&FieldType::Float32), "REAL");
        assert_eq!(dialect.map_type(&FieldType::String), "TEXT");
        assert_eq!(dialect.map_type(&FieldType::Other("decimal".into())), "TEXT");
    }

    #[tokio::test]
    async fn create_then_exists_case_insensitively() {
        let dir = tempfile::tempdir().unwrap();
        let dialect = SqliteDialect::new(dir.path().join("sinks"));
        assert!(!dialect.database_exists("Inventory").await.unwrap());
        dialect.create_database("inventory").await.unwrap();
        assert!(dialect.database_exists("INVENTORY").await.unwrap());
    }

    #[tokio::test]
    async fn upsert_update_and_delete_by_key() {
        let dir = tempfile::tempdir().unwrap();
        let dialect = SqliteDialect::new(dir.path());
        dialect.create_database("inventory").await.unwrap();

        let batch = vec![
            event(Operation::Insert, 1, vec![name("ada")], 1),
            event(Operation::Insert, 2, vec![name("bob")], 2),
            event(Operation::Update, 1, vec![name("ada l.")], 3),
            event(Operation::Delete, 2, vec![], 4),
        ];
        assert_eq!(dialect.apply("inventory", &batch).await.unwrap(), 4);
        assert_eq!(rows(&dialect, "inventory"), vec![(1, Some("ada l.".to_string()))]);

        // replaying the same batch is harmless
        dialect.apply("inventory", &batch).await.unwrap();
        assert_eq!(rows(&dialect, "inventory"), vec![(1, Some("ada l.".to_string()))]);
    }

    #[tokio::test]
    async fn schema_drift_widens_the_table() {
        let dir = tempfile::tempdir().unwrap();
        let dialect = SqliteDialect::new(dir.path());
        dialect.create_database("inventory").await.unwrap();
        dialect.apply("inventory", &[event(Operation::Insert, 1, vec![name("ada")], 1)]).await.unwrap();

        let tags = Field::new("tags", FieldType::Other("array".into()), FieldValue::Int(3));
        dialect
            .apply("inventory", &[event(Operation::Insert, 2, vec![name("bob"), tags], 2)])
            .await
            .unwrap();

        let conn = Connection::open(dir.path().join("inventory.db")).unwrap();
        let tags: String = conn
            .query_row("SELECT tags FROM customers WHERE id = 2", [], |row| row.get(0))
            .unwrap();
        assert_eq!(tags, "3");
    }

    #[tokio::test]
    async fn failures_are_sink_errors_and_roll_back() {
        let dir = tempfile::tempdir().unwrap();
        let dialect = SqliteDialect::new(dir.path());

        let err = dialect
            .apply("missing", &[event(Operation::Insert, 1, vec![], 1)])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Sink(_)));

        dialect.create_database("inventory").await.unwrap();
        let mut keyless = event(Operation::Insert, 2, vec![name("bob")], 2);
        keyless.key.clear();
        let batch = vec![event(Operation::Insert, 1, vec![name("ada")], 1), keyless];
        let err = dialect.apply("inventory", &batch).await.unwrap_err();
        assert!(matches!(err, Error::Sink(_)));

        // the first event of the failed batch was not committed
        let conn = Connection::open(dir.path().join("inventory.db")).unwrap();
        let tables: i64 = conn
            .query_row("SELECT COUNT(*) FROM sqlite_master WHERE name = 'customers'", [], |row| row.get(0))
            .unwrap();
        assert_eq!(tables, 0);
    }
}
