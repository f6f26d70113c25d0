use std::path::Path;

use parrot_utils::{ParrotResult, SourceOffset};
use rusqlite::{params, Connection, OptionalExtension};

use crate::model::{LifecycleState, NodeId, ProcessorDefinition, ProcessorRuntimeStatus};

/// SQLite-backed store for processor definitions, runtime status and
/// committed source offsets.
pub struct Store {
    conn: Connection,
}

impl Store {
    /// Open or create a SQLite database at the given path.
    pub fn open(path: impl AsRef<Path>) -> ParrotResult<Self> {
        let conn = Connection::open(path)?;
        let store = Self { conn };
        store.migrate()?;
        Ok(store)
    }

    /// Create an in-memory database (for testing and single-process clusters).
    pub fn in_memory() -> ParrotResult<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self { conn };
        store.migrate()?;
        Ok(store)
    }

    fn migrate(&self) -> ParrotResult<()> {
        self.conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS processors (
                id TEXT PRIMARY KEY,
                definition TEXT NOT NULL,
                desired_state TEXT NOT NULL,
                restart_generation INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS processor_status (
                processor_id TEXT NOT NULL,
                node_id TEXT NOT NULL,
                state TEXT NOT NULL,
                last_error TEXT,
                generation INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                PRIMARY KEY (processor_id, node_id)
            );
            CREATE TABLE IF NOT EXISTS processor_offsets (
                processor_id TEXT PRIMARY KEY,
                source_offset INTEGER NOT NULL,
                committed_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_processors_desired ON processors(desired_state);",
        )?;
        Ok(())
    }

    /// Insert a definition or overwrite an existing one with the same id.
    pub fn upsert_processor(&self, def: &ProcessorDefinition, now_ms: i64) -> ParrotResult<()> {
        let json = serde_json::to_string(def)?;
        self.conn.execute(
            "INSERT INTO processors (id, definition, desired_state, restart_generation, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?5)
             ON CONFLICT(id) DO UPDATE SET
                definition = excluded.definition,
                desired_state = excluded.desired_state,
                restart_generation = excluded.restart_generation,
                updated_at = excluded.updated_at",
            params![def.id, json, def.desired_state.as_str(), def.restart_generation as i64, now_ms],
        )?;
        Ok(())
    }

    pub fn processor(&self, id: &str) -> ParrotResult<Option<ProcessorDefinition>> {
        let json: Option<String> = self
            .conn
            .query_row(
                "SELECT definition FROM processors WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()?;
        match json {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    pub fn processors(&self) -> ParrotResult<Vec<ProcessorDefinition>> {
        let mut stmt = self.conn.prepare("SELECT definition FROM processors ORDER BY id")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut defs = Vec::new();
        for json in rows {
            defs.push(serde_json::from_str(&json?)?);
        }
        Ok(defs)
    }

    /// Remove a definition together with its status rows and offset.
    pub fn delete_processor(&self, id: &str) -> ParrotResult<usize> {
        let removed = self.conn.execute("DELETE FROM processors WHERE id = ?1", params![id])?;
        self.conn.execute("DELETE FROM processor_status WHERE processor_id = ?1", params![id])?;
        self.conn.execute("DELETE FROM processor_offsets WHERE processor_id = ?1", params![id])?;
        Ok(removed)
    }

    /// Writes nothing once the processor itself is gone.
    pub fn upsert_status(&self, status: &ProcessorRuntimeStatus) -> ParrotResult<()> {
        self.conn.execute(
            "INSERT INTO processor_status (processor_id, node_id, state, last_error, generation, updated_at)
             SELECT ?1, ?2, ?3, ?4, ?5, ?6
             WHERE EXISTS (SELECT 1 FROM processors WHERE id = ?1)
             ON CONFLICT(processor_id, node_id) DO UPDATE SET
                state = excluded.state,
                last_error = excluded.last_error,
                generation = excluded.generation,
                updated_at = excluded.updated_at",
            params![
                status.processor_id,
                status.node_id.as_str(),
                status.state.as_str(),
                status.last_error,
                status.generation as i64,
                status.updated_at_ms,
            ],
        )?;
        Ok(())
    }

    pub fn statuses_for(&self, processor_id: &str) -> ParrotResult<Vec<ProcessorRuntimeStatus>> {
        self.query_statuses(
            "SELECT processor_id, node_id, state, last_error, generation, updated_at
             FROM processor_status WHERE processor_id = ?1 ORDER BY updated_at DESC, node_id",
            params![processor_id],
        )
    }

    pub fn all_statuses(&self) -> ParrotResult<Vec<ProcessorRuntimeStatus>> {
        self.query_statuses(
            "SELECT processor_id, node_id, state, last_error, generation, updated_at
             FROM processor_status ORDER BY processor_id, updated_at DESC, node_id",
            [],
        )
    }

    fn query_statuses<P: rusqlite::Params>(
        &self,
        sql: &str,
        params: P,
    ) -> ParrotResult<Vec<ProcessorRuntimeStatus>> {
        let mut stmt = self.conn.prepare(sql)?;
        let rows = stmt.query_map(params, |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, Option<String>>(3)?,
                row.get::<_, i64>(4)?,
                row.get::<_, i64>(5)?,
            ))
        })?;
        let mut statuses = Vec::new();
        for row in rows {
            let (processor_id, node_id, state, last_error, generation, updated_at_ms) = row?;
            statuses.push(ProcessorRuntimeStatus {
                processor_id,
                node_id: NodeId(node_id),
                state: LifecycleState::parse(&state)?,
                last_error,
                generation: generation as u64,
                updated_at_ms,
            });
        }
        Ok(statuses)
    }

    /// Never moves an offset backwards; writes nothing for a deleted processor.
    pub fn commit_offset(&self, processor_id: &str, offset: SourceOffset, now_ms: i64) -> ParrotResult<()> {
        self.conn.execute(
            "INSERT INTO processor_offsets (processor_id, source_offset, committed_at)
             SELECT ?1, ?2, ?3
             WHERE EXISTS (SELECT 1 FROM processors WHERE id = ?1)
             ON CONFLICT(processor_id) DO UPDATE SET
                source_offset = MAX(source_offset, excluded.source_offset),
                committed_at = excluded.committed_at",
            params![processor_id, offset.0 as i64, now_ms],
        )?;
        Ok(())
    }

    pub fn last_offset(&self, processor_id: &str) -> ParrotResult<Option<SourceOffset>> {
        let offset: Option<i64> = self
            .conn
            .query_row(
                "SELECT source_offset FROM processor_offsets WHERE processor_id = ?1",
                params![processor_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(offset.map(|o| SourceOffset(o as u64)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{DesiredState, DialectConfig, SinkConfig, SourceConfig};

    fn definition(id: &str) -> ProcessorDefinition {
        ProcessorDefinition {
            id: id.to_string(),
            description: None,
            source: SourceConfig { topic: format!("cdc.{id}"), properties: Default::default() },
            sink: SinkConfig {
                database: "warehouse".into(),
                dialect: DialectConfig::Sqlite { root: "/tmp/parrot".into() },
            },
            desired_state: DesiredState::Running,
            restart_generation: 0,
        }
    }

    fn status(id: &str, node: &str, state: LifecycleState, at: i64) -> ProcessorRuntimeStatus {
        ProcessorRuntimeStatus {
            processor_id: id.into(),
            node_id: NodeId::from(node),
            state,
            last_error: None,
            generation: 0,
            updated_at_ms: at,
        }
    }

    #[test]
    fn upsert_and_read_back_definitions() {
        let store = Store::in_memory().unwrap();
        store.upsert_processor(&definition("orders"), 1).unwrap();
        store.upsert_processor(&definition("customers"), 2).unwrap();

        let mut changed = definition("orders");
        changed.desired_state = DesiredState::Stopped;
        store.upsert_processor(&changed, 3).unwrap();

        let all = store.processors().unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].id, "customers");
        assert_eq!(store.processor("orders").unwrap().unwrap().desired_state, DesiredState::Stopped);
        assert!(store.processor("missing").unwrap().is_none());
    }

    #[test]
    fn status_rows_are_per_node_and_newest_first() {
        let store = Store::in_memory().unwrap();
        store.upsert_processor(&definition("orders"), 1).unwrap();
        store.upsert_status(&status("orders", "node-a", LifecycleState::Running, 10)).unwrap();
        store.upsert_status(&status("orders", "node-b", LifecycleState::Starting, 20)).unwrap();
        store.upsert_status(&status("orders", "node-a", LifecycleState::Stopped, 30)).unwrap();

        let rows = store.statuses_for("orders").unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].node_id, NodeId::from("node-a"));
        assert_eq!(rows[0].state, LifecycleState::Stopped);
    }

    #[test]
    fn offsets_never_move_backwards() {
        let store = Store::in_memory().unwrap();
        store.upsert_processor(&definition("orders"), 1).unwrap();
        assert_eq!(store.last_offset("orders").unwrap(), None);
        store.commit_offset("orders", SourceOffset(5), 1).unwrap();
        store.commit_offset("orders", SourceOffset(3), 2).unwrap();
        assert_eq!(store.last_offset("orders").unwrap(), Some(SourceOffset(5)));
    }

    #[test]
    fn delete_removes_status_and_offsets() {
        let store = Store::in_memory().unwrap();
        store.upsert_processor(&definition("orders"), 1).unwrap();
        store.upsert_status(&status("orders", "node-a", LifecycleState::Stopped, 2)).unwrap();
        store.commit_offset("orders", SourceOffset(9), 3).unwrap();

        assert_eq!(store.delete_processor("orders").unwrap(), 1);
        assert!(store.statuses_for("orders").unwrap().is_empty());
        assert_eq!(store.last_offset("orders").unwrap(), None);
        assert_eq!(store.delete_processor("orders").unwrap(), 0);
    }

    #[test]
    fn late_writes_for_deleted_processor_are_dropped() {
        let store = Store::in_memory().unwrap();
        store.upsert_processor(&definition("orders"), 1).unwrap();
        store.commit_offset("orders", SourceOffset(9), 2).unwrap();
        store.delete_processor("orders").unwrap();

        store.upsert_status(&status("orders", "node-a", LifecycleState::Stopped, 3)).unwrap();
        store.commit_offset("orders", SourceOffset(12), 4).unwrap();
        assert!(store.statuses_for("orders").unwrap().is_empty());
        assert_eq!(store.last_offset("orders").unwrap(), None);

        store.upsert_processor(&definition("orders"), 5).unwrap();
        assert_eq!(store.last_offset("orders").unwrap(), None);
    }
}
