use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use parrot_utils::{ChangeEvent, Field, FieldType, FieldValue, Operation, ParrotResult};

use crate::sinks::connector::{SqlConnection, SqlConnector};
use crate::sinks::sql::{key_fields, literal, table_name, validate_identifier};
use crate::sinks::traits::{Credentials, SinkDialect};
use crate::sinks::into_sink_error;

pub const HIVE_DRIVER: &str = "org.apache.hive.jdbc.HiveDriver";
pub const VARCHAR_FALLBACK: &str = "VARCHAR(65355)";

/// Impala string literal. Backslash is an escape character inside Impala
/// quotes, so it is doubled before the quote is.
pub fn quote_impala(value: &str) -> String {
    format!("'{}'", value.replace('\\', "\\\\").replace('\'', "''"))
}

/// Impala over HiveServer2, writing into Kudu-backed tables.
pub struct ImpalaDialect {
    hostname: String,
    port: u16,
    credentials: Credentials,
    connector: Arc<dyn SqlConnector>,
    /// Lower-cased column names per `database.table` seen by this dialect.
    known_tables: Mutex<HashMap<String, HashSet<String>>>,
}

impl ImpalaDialect {
    pub fn new(
        hostname: impl Into<String>,
        port: u16,
        credentials: Credentials,
        connector: Arc<dyn SqlConnector>,
    ) -> Self {
        Self {
            hostname: hostname.into(),
            port,
            credentials,
            connector,
            known_tables: Mutex::new(HashMap::new()),
        }
    }

    async fn connect(&self) -> ParrotResult<Box<dyn SqlConnection>> {
        self.connector
            .connect(&self.connection_uri(), &self.credentials)
            .await
            .map_err(|e| into_sink_error("connect to impala", e))
    }

    fn render(&self, field_type: &FieldType, value: &FieldValue) -> String {
        let fallback = self.map_type(field_type) == VARCHAR_FALLBACK;
        if !fallback && !matches!(value, FieldValue::Text(_) | FieldValue::Bytes(_)) {
            return literal(value);
        }
        match value.to_text() {
            Some(text) if fallback => format!("CAST({} AS {VARCHAR_FALLBACK})", quote_impala(&text)),
            Some(text) => quote_impala(&text),
            None => "NULL".to_string(),
        }
    }

    fn known_columns(&self, qualified: &str) -> Option<HashSet<String>> {
        self.known_tables.lock().ok().and_then(|t| t.get(qualified).cloned())
    }

    fn remember<'a>(&self, qualified: &str, columns: impl IntoIterator<Item = &'a str>) {
        if let Ok(mut tables) = self.known_tables.lock() {
            tables
                .entry(qualified.to_string())
                .or_default()
                .extend(columns.into_iter().map(str::to_ascii_lowercase));
        }
    }

    fn column_def(&self, field: &Field) -> ParrotResult<String> {
        Ok(format!("`{}` {}", validate_identifier(&field.name)?, self.map_type(&field.field_type)))
    }

    async fn scan_catalog(
        conn: &mut dyn SqlConnection,
        sql: &str,
        name: &str,
    ) -> ParrotResult<bool> {
        let mut cursor = conn.query(sql).await?;
        let mut found = false;
        let scanned = loop {
            match cursor.next_row().await {
                Ok(Some(row)) => {
                    let matches = row
                        .first()
                        .and_then(|c| c.as_deref())
                        .is_some_and(|c| c.eq_ignore_ascii_case(name));
                    found |= matches;
                }
                Ok(None) => break Ok(found),
                Err(e) => break Err(e),
            }
        };
        let closed = cursor.close().await;
        let found = scanned?;
        closed?;
        Ok(found)
    }

    /// Create the table for `event`, or add the columns it lacks to an
    /// existing one.
    async fn ensure_table(
        &self,
        conn: &mut dyn SqlConnection,
        database: &str,
        table: &str,
        event: &ChangeEvent,
    ) -> ParrotResult<()> {
        let qualified = format!("{database}.{table}");
        let existing = match self.known_columns(&qualified) {
            Some(columns) => columns,
            None => {
                if !self.table_exists(conn, database, table).await? {
                    self.create_table(conn, database, table, event).await?;
                    self.remember(&qualified, event.fields.iter().map(|f| f.name.as_str()));
                    return Ok(());
                }
                let columns = self.describe(conn, database, table).await?;
                self.remember(&qualified, columns.iter().map(String::as_str));
                columns
            }
        };

        let missing: Vec<&Field> = event
            .fields
            .iter()
            .filter(|f| !existing.contains(&f.name.to_ascii_lowercase()))
            .collect();
        if missing.is_empty() {
            return Ok(());
        }
        let columns = missing
            .iter()
            .map(|f| self.column_def(f))
            .collect::<ParrotResult<Vec<_>>>()?;
        tracing::info!(table = %qualified, columns = %columns.join(", "), "widening sink table");
        conn.execute(&format!(
            "ALTER TABLE `{database}`.`{table}` ADD COLUMNS ({})",
            columns.join(", ")
        ))
        .await?;
        self.remember(&qualified, missing.iter().map(|f| f.name.as_str()));
        Ok(())
    }

    async fn create_table(
        &self,
        conn: &mut dyn SqlConnection,
        database: &str,
        table: &str,
        event: &ChangeEvent,
    ) -> ParrotResult<()> {
        let mut columns = Vec::with_capacity(event.fields.len());
        for key in &event.key {
            if let Some(field) = event.field(key) {
                columns.push(format!("{} NOT NULL", self.column_def(field)?));
            }
        }
        for field in event.fields.iter().filter(|f| !event.key.contains(&f.name)) {
            columns.push(self.column_def(field)?);
        }
        let keys = event
            .key
            .iter()
            .map(|k| validate_identifier(k).map(|k| format!("`{k}`")))
            .collect::<ParrotResult<Vec<_>>>()?;
        conn.execute(&format!(
            "CREATE TABLE IF NOT EXISTS `{database}`.`{table}` ({}, PRIMARY KEY ({})) STORED AS KUDU",
            columns.join(", "),
            keys.join(", ")
        ))
        .await?;
        Ok(())
    }

    /// Column names of an existing table, lower-cased.
    async fn describe(
        &self,
        conn: &mut dyn SqlConnection,
        database: &str,
        table: &str,
    ) -> ParrotResult<HashSet<String>> {
        let mut cursor = conn.query(&format!("DESCRIBE `{database}`.`{table}`")).await?;
        let mut columns = HashSet::new();
        let scanned = loop {
            match cursor.next_row().await {
                Ok(Some(row)) => {
                    if let Some(name) = row.first().and_then(|c| c.as_deref()) {
                        columns.insert(name.to_ascii_lowercase());
                    }
                }
                Ok(None) => break Ok(()),
                Err(e) => break Err(e),
            }
        };
        let closed = cursor.close().await;
        scanned?;
        closed?;
        Ok(columns)
    }

    async fn table_exists(
        &self,
        conn: &mut dyn SqlConnection,
        database: &str,
        table: &str,
    ) -> ParrotResult<bool> {
        if self.known_columns(&format!("{database}.{table}")).is_some() {
            return Ok(true);
        }
        let sql = format!("SHOW TABLES IN `{database}` LIKE {}", quote_impala(table));
        Self::scan_catalog(conn, &sql, table).await
    }

    async fn apply_on(
        &self,
        conn: &mut dyn SqlConnection,
        database: &str,
        events: &[ChangeEvent],
    ) -> ParrotResult<usize> {
        for event in events {
            let table = table_name(event)?;
            let keys = key_fields(event)?;
            match event.op {
                Operation::Insert | Operation::Update => {
                    self.ensure_table(conn, database, table, event).await?;
                    let mut names = Vec::with_capacity(event.fields.len());
                    let mut values = Vec::with_capacity(event.fields.len());
                    for field in &event.fields {
                        names.push(format!("`{}`", validate_identifier(&field.name)?));
                        values.push(self.render(&field.field_type, &field.value));
                    }
                    conn.execute(&format!(
                        "UPSERT INTO `{database}`.`{table}` ({}) VALUES ({})",
                        names.join(", "),
                        values.join(", ")
                    ))
                    .await?;
                }
                Operation::Delete => {
                    // nothing to delete from a table that was never created
                    if !self.table_exists(conn, database, table).await? {
                        continue;
                    }
                    let mut predicates = Vec::with_capacity(keys.len());
                    for key in &keys {
                        predicates.push(format!(
                            "`{}` = {}",
                            validate_identifier(&key.name)?,
                            self.render(&key.field_type, &key.value)
                        ));
                    }
                    conn.execute(&format!(
                        "DELETE FROM `{database}`.`{table}` WHERE {}",
                        predicates.join(" AND ")
                    ))
                    .await?;
                }
            }
        }
        Ok(events.len())
    }
}

#[async_trait]
impl SinkDialect for ImpalaDialect {
    fn name(&self) -> &str {
        "impala"
    }

    fn map_type(&self, field_type: &FieldType) -> String {
        match field_type {
            FieldType::Int8 | FieldType::Int16 => "SMALLINT",
            FieldType::Int32 => "INT",
            FieldType::Int64 => "BIGINT",
            FieldType::Float32 => "FLOAT",
            FieldType::Float64 => "DOUBLE",
            _ => VARCHAR_FALLBACK,
        }
        .to_string()
    }

    fn driver_identifier(&self) -> &str {
        HIVE_DRIVER
    }

    fn connection_uri(&self) -> String {
        format!("jdbc:hive2://{}:{}/;auth=noSasl", self.hostname, self.port)
    }

    fn credentials(&self) -> Credentials {
        self.credentials.clone()
    }

    async fn database_exists(&self, name: &str) -> ParrotResult<bool> {
        let mut conn = self.connect().await?;
        let result = Self::scan_catalog(conn.as_mut(), "SHOW DATABASES", name).await;
        let closed = conn.close().await;
        let exists = result.map_err(|e| into_sink_error("list impala databases", e))?;
        closed.map_err(|e| into_sink_error("close impala connection", e))?;
        Ok(exists)
    }

    async fn create_database(&self, name: &str) -> ParrotResult<()> {
        let name = validate_identifier(name)?;
        let mut conn = self.connect().await?;
        let result = conn.execute(&format!("CREATE DATABASE {name}")).await;
        let closed = conn.close().await;
        result.map_err(|e| into_sink_error(format!("create impala database {name}"), e))?;
        closed.map_err(|e| into_sink_error("close impala connection", e))?;
        Ok(())
    }

    async fn apply(&self, database: &str, events: &[ChangeEvent]) -> ParrotResult<usize> {
        let database = validate_identifier(database)?;
        if events.is_empty() {
            return Ok(0);
        }
        let mut conn = self.connect().await?;
        let result = self.apply_on(conn.as_mut(), database, events).await;
        let closed = conn.close().await;
        let applied = result.map_err(|e| into_sink_error("apply batch to impala", e))?;
        closed.map_err(|e| into_sink_error("close impala connection", e))?;
        Ok(applied)
    }
}
