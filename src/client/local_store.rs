//! Client-side embedded store: mirrors the registry tables with camelCase
//! field names, one global pull cursor, and per-row sync status used by
//! the runner to find pending work.

use rusqlite::{params, Connection, OptionalExtension};
use serde_json::{Map, Value};
use std::path::Path;
use std::sync::Mutex;
use tracing::debug;

use crate::error::{AppError, Result};
use crate::registry::TableRegistry;
use crate::types::{ChangeEntry, ChecksumUnit, SyncStatus, UnitKind};

/// Embedded mirror of the sync tables on a client device.
pub struct ClientStore {
    conn: Mutex<Connection>,
}

impl ClientStore {
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    pub fn new_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        for entry in TableRegistry::global().entries() {
            conn.execute(
                &format!(
                    "CREATE TABLE IF NOT EXISTS {} (
                        id TEXT PRIMARY KEY,
                        createdAt INTEGER NOT NULL,
                        updatedAt INTEGER NOT NULL,
                        deletedAt INTEGER,
                        lastServerSeq INTEGER,
                        syncStatus TEXT NOT NULL DEFAULT 'synced',
                        payload_json TEXT NOT NULL DEFAULT '{{}}'
                    )",
                    entry.name
                ),
                [],
            )?;
            conn.execute(
                &format!(
                    "CREATE INDEX IF NOT EXISTS idx_{0}_status ON {0}(syncStatus)",
                    entry.name
                ),
                [],
            )?;
        }
        conn.execute(
            "CREATE TABLE IF NOT EXISTS sync_state (k TEXT PRIMARY KEY, v TEXT NOT NULL)",
            [],
        )?;
        Ok(())
    }

    fn require_table(&self, table: &str) -> Result<()> {
        if TableRegistry::global().is_sync_table(table) {
            Ok(())
        } else {
            Err(AppError::Validation(format!("unknown sync table {table}")))
        }
    }

    // ========== Cursor ==========

    /// The global pull cursor (server_seq high-water mark).
    pub fn cursor(&self) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        let value: Option<String> = conn
            .query_row(
                "SELECT v FROM sync_state WHERE k = 'cursor'",
                [],
                |r| r.get(0),
            )
            .optional()?;
        Ok(value.and_then(|v| v.parse().ok()).unwrap_or(0))
    }

    pub fn set_cursor(&self, seq: i64) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO sync_state (k, v) VALUES ('cursor', ?1)
             ON CONFLICT(k) DO UPDATE SET v = excluded.v",
            params![seq.to_string()],
        )?;
        Ok(())
    }

    // ========== Local writes ==========

    /// Record a local edit (camelCase row) as pending for the next push.
    pub fn stage_local_row(&self, table: &str, db_row: &Map<String, Value>) -> Result<()> {
        self.require_table(table)?;
        let id = db_row
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| AppError::Validation("local row requires an id".into()))?;
        let (envelope, payload) = split_db_row(db_row);
        let conn = self.conn.lock().unwrap();
        conn.execute(
            &format!(
                "INSERT INTO {table}
                    (id, createdAt, updatedAt, deletedAt, lastServerSeq, syncStatus, payload_json)
                 VALUES (?1, ?2, ?3, ?4, ?5, 'pending', ?6)
                 ON CONFLICT(id) DO UPDATE SET
                    createdAt = excluded.createdAt,
                    updatedAt = excluded.updatedAt,
                    deletedAt = excluded.deletedAt,
                    syncStatus = 'pending',
                    payload_json = excluded.payload_json"
            ),
            params![
                id,
                envelope.created_at,
                envelope.updated_at,
                envelope.deleted_at,
                envelope.last_server_seq,
                Value::Object(payload).to_string()
            ],
        )?;
        Ok(())
    }

    /// Rows awaiting push for one table, as full camelCase maps.
    pub fn pending_rows(&self, table: &str) -> Result<Vec<Map<String, Value>>> {
        self.require_table(table)?;
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "SELECT id, createdAt, updatedAt, deletedAt, lastServerSeq, syncStatus, payload_json
             FROM {table} WHERE syncStatus = 'pending' ORDER BY updatedAt ASC, id ASC"
        ))?;
        let rows = stmt
            .query_map([], map_db_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn mark_status(
        &self,
        table: &str,
        id: &str,
        status: SyncStatus,
        server_seq: Option<i64>,
    ) -> Result<()> {
        self.require_table(table)?;
        let conn = self.conn.lock().unwrap();
        conn.execute(
            &format!(
                "UPDATE {table}
                 SET syncStatus = ?2, lastServerSeq = COALESCE(?3, lastServerSeq)
                 WHERE id = ?1"
            ),
            params![id, status.as_str(), server_seq],
        )?;
        Ok(())
    }

    // ========== Remote applies ==========

    /// Apply one pulled change entry using the registry field map and the
    /// id conflict target. Tombstones are stored, never physically deleted.
    pub fn apply_change(&self, entry: &ChangeEntry) -> Result<()> {
        self.require_table(&entry.table)?;
        let registry = TableRegistry::global();
        let wire = entry
            .payload_json
            .as_object()
            .ok_or_else(|| AppError::Validation("change payload is not an object".into()))?;
        let db_row = registry.to_db_row(&entry.table, wire);
        let (envelope, payload) = split_db_row(&db_row);
        let conflict_target = registry
            .get(&entry.table)
            .map(|e| e.conflict_target.join(", "))
            .unwrap_or_else(|| "id".to_string());
        let conn = self.conn.lock().unwrap();
        conn.execute(
            &format!(
                "INSERT INTO {}
                    (id, createdAt, updatedAt, deletedAt, lastServerSeq, syncStatus, payload_json)
                 VALUES (?1, ?2, ?3, ?4, ?5, 'synced', ?6)
                 ON CONFLICT({conflict_target}) DO UPDATE SET
                    createdAt = excluded.createdAt,
                    updatedAt = excluded.updatedAt,
                    deletedAt = excluded.deletedAt,
                    lastServerSeq = excluded.lastServerSeq,
                    syncStatus = 'synced',
                    payload_json = excluded.payload_json",
                entry.table
            ),
            params![
                entry.row_id,
                envelope.created_at,
                envelope.updated_at,
                envelope.deleted_at,
                entry.server_seq,
                Value::Object(payload).to_string()
            ],
        )?;
        Ok(())
    }

    /// Fetch one row as a full camelCase map.
    pub fn get_row(&self, table: &str, id: &str) -> Result<Option<Map<String, Value>>> {
        self.require_table(table)?;
        let conn = self.conn.lock().unwrap();
        let row = conn
            .query_row(
                &format!(
                    "SELECT id, createdAt, updatedAt, deletedAt, lastServerSeq, syncStatus,
                            payload_json
                     FROM {table} WHERE id = ?1"
                ),
                params![id],
                map_db_row,
            )
            .optional()?;
        Ok(row)
    }

    /// Remove one row locally (delete_local_entity repair action).
    pub fn delete_row(&self, table: &str, id: &str) -> Result<()> {
        self.require_table(table)?;
        let conn = self.conn.lock().unwrap();
        conn.execute(&format!("DELETE FROM {table} WHERE id = ?1"), params![id])?;
        Ok(())
    }

    /// Drop every mirrored row and the cursor (reset / deep repair).
    pub fn wipe(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        for entry in TableRegistry::global().entries() {
            conn.execute(&format!("DELETE FROM {}", entry.name), [])?;
        }
        conn.execute("DELETE FROM sync_state WHERE k = 'cursor'", [])?;
        debug!("Client store wiped");
        Ok(())
    }

    pub fn count_rows(&self, table: &str) -> Result<u64> {
        self.require_table(table)?;
        let conn = self.conn.lock().unwrap();
        let count: i64 =
            conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |r| r.get(0))?;
        Ok(count as u64)
    }

    // ========== Snapshot ==========

    /// Per-unit checksums matching the server's computation, for upload.
    pub fn snapshot_units(&self) -> Result<Vec<ChecksumUnit>> {
        use sha2::{Digest, Sha256};
        let conn = self.conn.lock().unwrap();
        let mut units = Vec::new();
        for entry in TableRegistry::global().entries() {
            let mut stmt = conn.prepare(&format!(
                "SELECT id, updatedAt, deletedAt, payload_json
                 FROM {} ORDER BY id ASC",
                entry.name
            ))?;
            let rows: Vec<(String, i64, Option<i64>, String)> = stmt
                .query_map([], |r| {
                    Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?))
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            let mut hasher = Sha256::new();
            for (id, updated_at, deleted_at, _) in &rows {
                let deleted = deleted_at
                    .map(|n| n.to_string())
                    .unwrap_or_else(|| "-".into());
                hasher.update(format!("{id}:{updated_at}:{deleted}\n").as_bytes());
            }
            units.push(ChecksumUnit {
                kind: UnitKind::Table,
                name: entry.name.to_string(),
                checksum: hex::encode(hasher.finalize()),
                row_count: rows.len() as u64,
            });

            if entry.name == "entities" {
                let mut by_type: std::collections::BTreeMap<String, Vec<&(String, i64, Option<i64>, String)>> =
                    std::collections::BTreeMap::new();
                for row in &rows {
                    let type_id = serde_json::from_str::<Value>(&row.3)
                        .ok()
                        .and_then(|p| p.get("typeId").and_then(Value::as_str).map(str::to_string))
                        .unwrap_or_default();
                    by_type.entry(type_id).or_default().push(row);
                }
                for (type_id, grouped) in by_type {
                    let mut hasher = Sha256::new();
                    for (id, updated_at, deleted_at, _) in grouped.iter() {
                        let deleted = deleted_at
                            .map(|n| n.to_string())
                            .unwrap_or_else(|| "-".into());
                        hasher.update(format!("{id}:{updated_at}:{deleted}\n").as_bytes());
                    }
                    units.push(ChecksumUnit {
                        kind: UnitKind::EntityType,
                        name: type_id,
                        checksum: hex::encode(hasher.finalize()),
                        row_count: grouped.len() as u64,
                    });
                }
            }
        }
        Ok(units)
    }
}

struct Envelope {
    created_at: i64,
    updated_at: i64,
    deleted_at: Option<i64>,
    last_server_seq: Option<i64>,
}

fn split_db_row(db_row: &Map<String, Value>) -> (Envelope, Map<String, Value>) {
    let mut payload = Map::new();
    for (k, v) in db_row {
        match k.as_str() {
            "id" | "createdAt" | "updatedAt" | "deletedAt" | "lastServerSeq" | "syncStatus" => {}
            _ => {
                payload.insert(k.clone(), v.clone());
            }
        }
    }
    (
        Envelope {
            created_at: db_row.get("createdAt").and_then(Value::as_i64).unwrap_or(0),
            updated_at: db_row.get("updatedAt").and_then(Value::as_i64).unwrap_or(0),
            deleted_at: db_row.get("deletedAt").and_then(Value::as_i64),
            last_server_seq: db_row.get("lastServerSeq").and_then(Value::as_i64),
        },
        payload,
    )
}

fn map_db_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<Map<String, Value>> {
    let id: String = r.get(0)?;
    let created_at: i64 = r.get(1)?;
    let updated_at: i64 = r.get(2)?;
    let deleted_at: Option<i64> = r.get(3)?;
    let last_server_seq: Option<i64> = r.get(4)?;
    let sync_status: String = r.get(5)?;
    let payload_json: String = r.get(6)?;

    let mut row = serde_json::from_str::<Value>(&payload_json)
        .ok()
        .and_then(|v| v.as_object().cloned())
        .unwrap_or_default();
    row.insert("id".into(), Value::String(id));
    row.insert("createdAt".into(), Value::from(created_at));
    row.insert("updatedAt".into(), Value::from(updated_at));
    row.insert(
        "deletedAt".into(),
        deleted_at.map(Value::from).unwrap_or(Value::Null),
    );
    row.insert(
        "lastServerSeq".into(),
        last_server_seq.map(Value::from).unwrap_or(Value::Null),
    );
    row.insert("syncStatus".into(), Value::String(sync_status));
    Ok(row)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ChangeOp;
    use serde_json::json;

    fn local_row(id: &str, updated_at: i64) -> Map<String, Value> {
        json!({
            "id": id,
            "createdAt": 100,
            "updatedAt": updated_at,
            "name": "Machines",
        })
        .as_object()
        .cloned()
        .unwrap()
    }

    #[test]
    fn test_stage_and_pending() {
        let store = ClientStore::new_in_memory().unwrap();
        store
            .stage_local_row("entity_types", &local_row("a", 200))
            .unwrap();
        let pending = store.pending_rows("entity_types").unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0]["syncStatus"], "pending");
        assert_eq!(pending[0]["name"], "Machines");

        store
            .mark_status("entity_types", "a", SyncStatus::Synced, Some(7))
            .unwrap();
        assert!(store.pending_rows("entity_types").unwrap().is_empty());
        let row = store.get_row("entity_types", "a").unwrap().unwrap();
        assert_eq!(row["lastServerSeq"], 7);
    }

    #[test]
    fn test_apply_change_converts_to_camel() {
        let store = ClientStore::new_in_memory().unwrap();
        let entry = ChangeEntry {
            server_seq: 42,
            table: "entities".into(),
            row_id: "e1".into(),
            op: ChangeOp::Upsert,
            payload_json: json!({
                "id": "e1",
                "created_at": 100,
                "updated_at": 200,
                "deleted_at": null,
                "type_id": "t1",
                "name": "press",
            }),
            created_at: 1000,
        };
        store.apply_change(&entry).unwrap();
        let row = store.get_row("entities", "e1").unwrap().unwrap();
        assert_eq!(row["typeId"], "t1");
        assert_eq!(row["lastServerSeq"], 42);
        assert_eq!(row["syncStatus"], "synced");
        assert!(row.get("type_id").is_none());
    }

    #[test]
    fn test_tombstone_apply_retains_row() {
        let store = ClientStore::new_in_memory().unwrap();
        let entry = ChangeEntry {
            server_seq: 5,
            table: "notes".into(),
            row_id: "n1".into(),
            op: ChangeOp::Delete,
            payload_json: json!({
                "id": "n1",
                "created_at": 100,
                "updated_at": 300,
                "deleted_at": 300,
                "owner_user_id": "u1",
            }),
            created_at: 1000,
        };
        store.apply_change(&entry).unwrap();
        let row = store.get_row("notes", "n1").unwrap().unwrap();
        assert_eq!(row["deletedAt"], 300);
        assert_eq!(store.count_rows("notes").unwrap(), 1);
    }

    #[test]
    fn test_cursor_round_trip() {
        let store = ClientStore::new_in_memory().unwrap();
        assert_eq!(store.cursor().unwrap(), 0);
        store.set_cursor(99).unwrap();
        assert_eq!(store.cursor().unwrap(), 99);
        store.wipe().unwrap();
        assert_eq!(store.cursor().unwrap(), 0);
    }

    #[test]
    fn test_snapshot_units_cover_tables_and_types() {
        let store = ClientStore::new_in_memory().unwrap();
        let entry = ChangeEntry {
            server_seq: 1,
            table: "entities".into(),
            row_id: "e1".into(),
            op: ChangeOp::Upsert,
            payload_json: json!({
                "id": "e1",
                "created_at": 100,
                "updated_at": 200,
                "type_id": "t1",
                "name": "press",
            }),
            created_at: 1000,
        };
        store.apply_change(&entry).unwrap();

        let units = store.snapshot_units().unwrap();
        let table_count = TableRegistry::global().entries().len();
        assert_eq!(units.len(), table_count + 1);
        let entity_unit = units
            .iter()
            .find(|u| u.kind == UnitKind::EntityType && u.name == "t1")
            .unwrap();
        assert_eq!(entity_unit.row_count, 1);
    }
}
