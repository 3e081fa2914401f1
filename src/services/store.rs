//! SQLite persistence layer: one table per registry entry, the append-only
//! change log, signed block headers, per-client sync state, sync requests
//! and diagnostics.
//!
//! All access serializes through a single connection mutex; the change-log
//! append and block commit happen inside one SQLite transaction so a
//! `server_seq` is never observable without its row mutation.

use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use std::path::Path;
use std::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{AppError, Result};
use crate::registry::TableRegistry;
use crate::types::{
    AppliedRow, BlockMeta, ChangeEntry, ChangeOp, ClientSyncState, StoredRow, SyncRequest,
    SyncRequestType, SyncStatus,
};

/// A staged row mutation handed to `commit_block`.
#[derive(Debug, Clone)]
pub struct RowWrite {
    pub table: String,
    pub op: ChangeOp,
    pub row: StoredRow,
}

/// Block header computed by the ledger engine before commit.
#[derive(Debug, Clone)]
pub struct BlockHeader {
    pub height: i64,
    pub prev_hash: String,
    pub hash: String,
    pub signature: String,
    pub signer_id: String,
    pub ts: i64,
}

/// Outcome of a committed block.
#[derive(Debug, Clone)]
pub struct CommitResult {
    pub first_seq: i64,
    pub last_seq: i64,
    pub applied: Vec<AppliedRow>,
    /// Rows exactly as persisted (with assigned `last_server_seq`).
    pub rows: Vec<(String, StoredRow)>,
}

/// One diagnostics entry (autoheal signals/actions, client snapshots).
#[derive(Debug, Clone)]
pub struct DiagnosticEntry {
    pub id: String,
    pub client_id: String,
    pub kind: String,
    pub payload: Value,
    pub created_at: i64,
}

/// SQLite store for all server-side persistent state.
pub struct SqliteStore {
    conn: Mutex<Connection>,
    pub db_path: String,
}

impl SqliteStore {
    /// Create a new store at the given path.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let db_path = path.as_ref().to_string_lossy().to_string();
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Mutex::new(conn),
            db_path,
        };
        store.init_schema()?;
        info!("SQLite store initialized");
        Ok(store)
    }

    /// Create an in-memory store (for testing).
    pub fn new_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Mutex::new(conn),
            db_path: ":memory:".to_string(),
        };
        store.init_schema()?;
        debug!("In-memory SQLite store initialized");
        Ok(store)
    }

    /// Initialize database schema.
    fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=OFF;")?;

        // One table per registry entry: envelope columns plus the
        // table-specific payload in wire form.
        for entry in TableRegistry::global().entries() {
            conn.execute(
                &format!(
                    "CREATE TABLE IF NOT EXISTS {} (
                        id TEXT PRIMARY KEY,
                        created_at INTEGER NOT NULL,
                        updated_at INTEGER NOT NULL,
                        deleted_at INTEGER,
                        last_server_seq INTEGER,
                        sync_status TEXT NOT NULL DEFAULT 'synced',
                        payload_json TEXT NOT NULL DEFAULT '{{}}'
                    )",
                    entry.name
                ),
                [],
            )?;
            conn.execute(
                &format!(
                    "CREATE INDEX IF NOT EXISTS idx_{0}_updated_at ON {0}(updated_at)",
                    entry.name
                ),
                [],
            )?;
        }

        conn.execute(
            "CREATE TABLE IF NOT EXISTS change_log (
                server_seq INTEGER PRIMARY KEY AUTOINCREMENT,
                table_name TEXT NOT NULL,
                row_id TEXT NOT NULL,
                op TEXT NOT NULL CHECK(op IN ('upsert','delete')),
                payload_json TEXT NOT NULL,
                created_at INTEGER NOT NULL
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_change_log_row ON change_log(table_name, row_id)",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS blocks (
                height INTEGER PRIMARY KEY,
                prev_hash TEXT NOT NULL,
                hash TEXT NOT NULL,
                signature TEXT NOT NULL,
                signer_id TEXT NOT NULL,
                ts INTEGER NOT NULL,
                first_seq INTEGER NOT NULL,
                last_seq INTEGER NOT NULL
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS client_sync_state (
                client_id TEXT PRIMARY KEY,
                last_pulled_server_seq INTEGER NOT NULL DEFAULT 0,
                last_pulled_at INTEGER,
                last_pushed_at INTEGER
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS sync_requests (
                request_id TEXT PRIMARY KEY,
                client_id TEXT NOT NULL,
                request_type TEXT NOT NULL,
                payload_json TEXT NOT NULL DEFAULT '{}',
                created_at INTEGER NOT NULL,
                acked_at INTEGER,
                ack_status TEXT,
                ack_error TEXT
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_sync_requests_client
             ON sync_requests(client_id, created_at DESC)",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS diagnostics (
                id TEXT PRIMARY KEY,
                client_id TEXT NOT NULL,
                kind TEXT NOT NULL,
                payload_json TEXT NOT NULL,
                created_at INTEGER NOT NULL
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_diagnostics_client
             ON diagnostics(client_id, kind)",
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

    // ========== Row tables ==========

    /// Fetch a row (live or tombstoned).
    pub fn get_row(&self, table: &str, id: &str) -> Result<Option<StoredRow>> {
        self.require_table(table)?;
        let conn = self.conn.lock().unwrap();
        let row = conn
            .query_row(
                &format!(
                    "SELECT id, created_at, updated_at, deleted_at, last_server_seq,
                            sync_status, payload_json
                     FROM {table} WHERE id = ?1"
                ),
                params![id],
                map_stored_row,
            )
            .optional()?;
        Ok(row)
    }

    /// All rows of a table ordered by id (used for state load and checksums).
    pub fn all_rows(&self, table: &str) -> Result<Vec<StoredRow>> {
        self.require_table(table)?;
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "SELECT id, created_at, updated_at, deleted_at, last_server_seq,
                    sync_status, payload_json
             FROM {table} ORDER BY id ASC"
        ))?;
        let rows = stmt
            .query_map([], map_stored_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    // ========== Change log + blocks (single-writer commit) ==========

    /// Commit one block: append a change-log entry per write, persist each
    /// row with its assigned `server_seq`, then the block header. Atomic.
    pub fn commit_block(&self, writes: &[RowWrite], header: &BlockHeader) -> Result<CommitResult> {
        for w in writes {
            self.require_table(&w.table)?;
        }
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;

        let mut applied = Vec::with_capacity(writes.len());
        let mut rows = Vec::with_capacity(writes.len());
        let mut first_seq = 0i64;
        let mut last_seq = 0i64;

        for w in writes {
            let mut row = w.row.clone();
            let conflict_target = TableRegistry::global()
                .get(&w.table)
                .map(|e| e.conflict_target.join(", "))
                .unwrap_or_else(|| "id".to_string());
            // The change entry carries the full wire row so clients can
            // apply it without a second fetch. The assigned seq is set
            // below, after we know it.
            tx.execute(
                "INSERT INTO change_log (table_name, row_id, op, payload_json, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    w.table,
                    row.id,
                    w.op.as_str(),
                    Value::Object(row.to_wire()).to_string(),
                    header.ts
                ],
            )?;
            let seq = tx.last_insert_rowid();
            if first_seq == 0 {
                first_seq = seq;
            }
            last_seq = seq;

            row.last_server_seq = Some(seq);
            row.sync_status = SyncStatus::Synced;
            tx.execute(
                &format!(
                    "INSERT INTO {} (id, created_at, updated_at, deleted_at, last_server_seq,
                                     sync_status, payload_json)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                     ON CONFLICT({conflict_target}) DO UPDATE SET
                        created_at = excluded.created_at,
                        updated_at = excluded.updated_at,
                        deleted_at = excluded.deleted_at,
                        last_server_seq = excluded.last_server_seq,
                        sync_status = excluded.sync_status,
                        payload_json = excluded.payload_json",
                    w.table
                ),
                params![
                    row.id,
                    row.created_at,
                    row.updated_at,
                    row.deleted_at,
                    row.last_server_seq,
                    row.sync_status.as_str(),
                    Value::Object(row.payload.clone()).to_string()
                ],
            )?;

            applied.push(AppliedRow {
                table: w.table.clone(),
                row_id: row.id.clone(),
                server_seq: seq,
            });
            rows.push((w.table.clone(), row));
        }

        tx.execute(
            "INSERT INTO blocks (height, prev_hash, hash, signature, signer_id, ts,
                                 first_seq, last_seq)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                header.height,
                header.prev_hash,
                header.hash,
                header.signature,
                header.signer_id,
                header.ts,
                first_seq,
                last_seq
            ],
        )?;

        tx.commit()?;
        Ok(CommitResult {
            first_seq,
            last_seq,
            applied,
            rows,
        })
    }

    /// Change-log entries with `server_seq > since`, ascending, up to `limit`.
    pub fn changes_since(&self, since: i64, limit: i64) -> Result<Vec<ChangeEntry>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT server_seq, table_name, row_id, op, payload_json, created_at
             FROM change_log WHERE server_seq > ?1
             ORDER BY server_seq ASC LIMIT ?2",
        )?;
        let entries = stmt
            .query_map(params![since, limit], map_change_entry)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    /// Entries within an inclusive seq span (block reconstruction).
    pub fn changes_in_span(&self, first_seq: i64, last_seq: i64) -> Result<Vec<ChangeEntry>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT server_seq, table_name, row_id, op, payload_json, created_at
             FROM change_log WHERE server_seq >= ?1 AND server_seq <= ?2
             ORDER BY server_seq ASC",
        )?;
        let entries = stmt
            .query_map(params![first_seq, last_seq], map_change_entry)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    /// Global change-log high-water mark.
    pub fn max_seq(&self) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        let max: i64 = conn.query_row(
            "SELECT COALESCE(MAX(server_seq), 0) FROM change_log",
            [],
            |r| r.get(0),
        )?;
        Ok(max)
    }

    /// Seq of the newest change-log entry naming a row.
    pub fn latest_seq_for(&self, table: &str, row_id: &str) -> Result<Option<i64>> {
        let conn = self.conn.lock().unwrap();
        let seq = conn
            .query_row(
                "SELECT MAX(server_seq) FROM change_log
                 WHERE table_name = ?1 AND row_id = ?2",
                params![table, row_id],
                |r| r.get::<_, Option<i64>>(0),
            )
            .optional()?
            .flatten();
        Ok(seq)
    }

    /// Newest committed block header.
    pub fn tip_block(&self) -> Result<Option<BlockMeta>> {
        let conn = self.conn.lock().unwrap();
        let block = conn
            .query_row(
                "SELECT height, prev_hash, hash, signature, signer_id, ts, first_seq, last_seq
                 FROM blocks ORDER BY height DESC LIMIT 1",
                [],
                map_block_meta,
            )
            .optional()?;
        Ok(block)
    }

    /// Block headers with `height > since`, ascending.
    pub fn blocks_since(&self, since: i64, limit: i64) -> Result<Vec<BlockMeta>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT height, prev_hash, hash, signature, signer_id, ts, first_seq, last_seq
             FROM blocks WHERE height > ?1 ORDER BY height ASC LIMIT ?2",
        )?;
        let blocks = stmt
            .query_map(params![since, limit], map_block_meta)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(blocks)
    }

    // ========== Client sync state ==========

    pub fn get_client_state(&self, client_id: &str) -> Result<Option<ClientSyncState>> {
        let conn = self.conn.lock().unwrap();
        let state = conn
            .query_row(
                "SELECT client_id, last_pulled_server_seq, last_pulled_at, last_pushed_at
                 FROM client_sync_state WHERE client_id = ?1",
                params![client_id],
                |r| {
                    Ok(ClientSyncState {
                        client_id: r.get(0)?,
                        last_pulled_server_seq: r.get(1)?,
                        last_pulled_at: r.get(2)?,
                        last_pushed_at: r.get(3)?,
                    })
                },
            )
            .optional()?;
        Ok(state)
    }

    pub fn record_pull(&self, client_id: &str, cursor: i64, at: i64) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO client_sync_state (client_id, last_pulled_server_seq, last_pulled_at)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(client_id) DO UPDATE SET
                last_pulled_server_seq = excluded.last_pulled_server_seq,
                last_pulled_at = excluded.last_pulled_at",
            params![client_id, cursor, at],
        )?;
        Ok(())
    }

    pub fn record_push(&self, client_id: &str, at: i64) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO client_sync_state (client_id, last_pushed_at)
             VALUES (?1, ?2)
             ON CONFLICT(client_id) DO UPDATE SET last_pushed_at = excluded.last_pushed_at",
            params![client_id, at],
        )?;
        Ok(())
    }

    pub fn list_client_ids(&self) -> Result<Vec<String>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt =
            conn.prepare("SELECT client_id FROM client_sync_state ORDER BY client_id")?;
        let ids = stmt
            .query_map([], |r| r.get(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(ids)
    }

    // ========== Sync requests ==========

    pub fn insert_sync_request(&self, request: &SyncRequest) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO sync_requests
                (request_id, client_id, request_type, payload_json, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                request.request_id,
                request.client_id,
                request.request_type.as_str(),
                request.payload.to_string(),
                request.created_at
            ],
        )?;
        Ok(())
    }

    /// Newest unacknowledged request for a client, if any.
    pub fn pending_sync_request(&self, client_id: &str) -> Result<Option<SyncRequest>> {
        let conn = self.conn.lock().unwrap();
        let request = conn
            .query_row(
                "SELECT request_id, client_id, request_type, payload_json, created_at,
                        acked_at, ack_status, ack_error
                 FROM sync_requests
                 WHERE client_id = ?1 AND acked_at IS NULL
                 ORDER BY created_at DESC, rowid DESC LIMIT 1",
                params![client_id],
                map_sync_request,
            )
            .optional()?;
        Ok(request)
    }

    /// Newest request regardless of ack state (cooldown gate).
    pub fn newest_sync_request(&self, client_id: &str) -> Result<Option<SyncRequest>> {
        let conn = self.conn.lock().unwrap();
        let request = conn
            .query_row(
                "SELECT request_id, client_id, request_type, payload_json, created_at,
                        acked_at, ack_status, ack_error
                 FROM sync_requests WHERE client_id = ?1
                 ORDER BY created_at DESC, rowid DESC LIMIT 1",
                params![client_id],
                map_sync_request,
            )
            .optional()?;
        Ok(request)
    }

    /// Acknowledge a request. Returns false when the id is unknown.
    pub fn ack_sync_request(
        &self,
        request_id: &str,
        status: &str,
        error: Option<&str>,
        at: i64,
    ) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let updated = conn.execute(
            "UPDATE sync_requests SET acked_at = ?2, ack_status = ?3, ack_error = ?4
             WHERE request_id = ?1",
            params![request_id, at, status, error],
        )?;
        Ok(updated > 0)
    }

    /// Autoheal-typed requests created at or after the cutoff, newest first.
    pub fn autoheal_requests_since(
        &self,
        client_id: &str,
        since: i64,
    ) -> Result<Vec<SyncRequest>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT request_id, client_id, request_type, payload_json, created_at,
                    acked_at, ack_status, ack_error
             FROM sync_requests
             WHERE client_id = ?1 AND created_at >= ?2
               AND request_type IN ('force_full_pull_v2','reset_sync_state_and_pull','deep_repair')
             ORDER BY created_at DESC, rowid DESC",
        )?;
        let requests = stmt
            .query_map(params![client_id, since], map_sync_request)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(requests)
    }

    // ========== Diagnostics ==========

    pub fn insert_diagnostic(
        &self,
        client_id: &str,
        kind: &str,
        payload: &Value,
        created_at: i64,
    ) -> Result<String> {
        let id = Uuid::new_v4().to_string();
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO diagnostics (id, client_id, kind, payload_json, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![id, client_id, kind, payload.to_string(), created_at],
        )?;
        Ok(id)
    }

    /// Recent diagnostics for a client, newest first. `kind` narrows when set.
    pub fn recent_diagnostics(
        &self,
        client_id: &str,
        kind: Option<&str>,
        limit: usize,
    ) -> Result<Vec<DiagnosticEntry>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, client_id, kind, payload_json, created_at
             FROM diagnostics
             WHERE client_id = ?1 AND (?2 IS NULL OR kind = ?2)
             ORDER BY created_at DESC, rowid DESC LIMIT ?3",
        )?;
        let entries = stmt
            .query_map(params![client_id, kind, limit as i64], map_diagnostic)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    /// Newest client snapshot diagnostic.
    pub fn latest_snapshot(&self, client_id: &str) -> Result<Option<DiagnosticEntry>> {
        Ok(self
            .recent_diagnostics(client_id, Some("client_snapshot"), 1)?
            .into_iter()
            .next())
    }
}

fn map_stored_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<StoredRow> {
    let status: String = r.get(5)?;
    let payload_json: String = r.get(6)?;
    let payload = serde_json::from_str::<Value>(&payload_json)
        .ok()
        .and_then(|v| v.as_object().cloned())
        .unwrap_or_default();
    Ok(StoredRow {
        id: r.get(0)?,
        created_at: r.get(1)?,
        updated_at: r.get(2)?,
        deleted_at: r.get(3)?,
        last_server_seq: r.get(4)?,
        sync_status: SyncStatus::parse(&status).unwrap_or(SyncStatus::Synced),
        payload,
    })
}

fn map_change_entry(r: &rusqlite::Row<'_>) -> rusqlite::Result<ChangeEntry> {
    let op: String = r.get(3)?;
    let payload_json: String = r.get(4)?;
    Ok(ChangeEntry {
        server_seq: r.get(0)?,
        table: r.get(1)?,
        row_id: r.get(2)?,
        op: ChangeOp::parse(&op).unwrap_or(ChangeOp::Upsert),
        payload_json: serde_json::from_str(&payload_json).unwrap_or(Value::Null),
        created_at: r.get(5)?,
    })
}

fn map_block_meta(r: &rusqlite::Row<'_>) -> rusqlite::Result<BlockMeta> {
    Ok(BlockMeta {
        height: r.get(0)?,
        prev_hash: r.get(1)?,
        hash: r.get(2)?,
        signature: r.get(3)?,
        signer_id: r.get(4)?,
        ts: r.get(5)?,
        first_seq: r.get(6)?,
        last_seq: r.get(7)?,
    })
}

fn map_sync_request(r: &rusqlite::Row<'_>) -> rusqlite::Result<SyncRequest> {
    let request_type: String = r.get(2)?;
    let payload_json: String = r.get(3)?;
    Ok(SyncRequest {
        request_id: r.get(0)?,
        client_id: r.get(1)?,
        request_type: SyncRequestType::parse(&request_type)
            .unwrap_or(SyncRequestType::SyncNow),
        payload: serde_json::from_str(&payload_json).unwrap_or(Value::Null),
        created_at: r.get(4)?,
        acked_at: r.get(5)?,
        ack_status: r.get(6)?,
        ack_error: r.get(7)?,
    })
}

fn map_diagnostic(r: &rusqlite::Row<'_>) -> rusqlite::Result<DiagnosticEntry> {
    let payload_json: String = r.get(3)?;
    Ok(DiagnosticEntry {
        id: r.get(0)?,
        client_id: r.get(1)?,
        kind: r.get(2)?,
        payload: serde_json::from_str(&payload_json).unwrap_or(Value::Null),
        created_at: r.get(4)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_row(id: &str, updated_at: i64) -> StoredRow {
        let mut payload = serde_json::Map::new();
        payload.insert("name".into(), json!("Machines"));
        StoredRow {
            id: id.to_string(),
            created_at: 100,
            updated_at,
            deleted_at: None,
            last_server_seq: None,
            sync_status: SyncStatus::Pending,
            payload,
        }
    }

    fn header(height: i64, ts: i64) -> BlockHeader {
        BlockHeader {
            height,
            prev_hash: "0".repeat(64),
            hash: format!("{height:064}"),
            signature: "sig".into(),
            signer_id: "signer".into(),
            ts,
        }
    }

    #[test]
    fn test_commit_block_assigns_dense_seqs() {
        let store = SqliteStore::new_in_memory().unwrap();
        let writes = vec![
            RowWrite {
                table: "entity_types".into(),
                op: ChangeOp::Upsert,
                row: sample_row("a", 200),
            },
            RowWrite {
                table: "entity_types".into(),
                op: ChangeOp::Upsert,
                row: sample_row("b", 201),
            },
        ];
        let result = store.commit_block(&writes, &header(1, 1000)).unwrap();
        assert_eq!(result.first_seq, 1);
        assert_eq!(result.last_seq, 2);
        assert_eq!(store.max_seq().unwrap(), 2);

        let stored = store.get_row("entity_types", "a").unwrap().unwrap();
        assert_eq!(stored.last_server_seq, Some(1));
        assert_eq!(stored.sync_status, SyncStatus::Synced);
        assert_eq!(store.latest_seq_for("entity_types", "b").unwrap(), Some(2));
    }

    #[test]
    fn test_changes_since_pagination() {
        let store = SqliteStore::new_in_memory().unwrap();
        let writes: Vec<RowWrite> = (0..5)
            .map(|i| RowWrite {
                table: "entity_types".into(),
                op: ChangeOp::Upsert,
                row: sample_row(&format!("row{i}"), 200 + i),
            })
            .collect();
        store.commit_block(&writes, &header(1, 1000)).unwrap();

        let page = store.changes_since(2, 2).unwrap();
        assert_eq!(page.len(), 2);
        assert_eq!(page[0].server_seq, 3);
        assert_eq!(page[1].server_seq, 4);
        assert_eq!(page[0].payload_json["name"], "Machines");
    }

    #[test]
    fn test_block_tip_and_span() {
        let store = SqliteStore::new_in_memory().unwrap();
        store
            .commit_block(
                &[RowWrite {
                    table: "notes".into(),
                    op: ChangeOp::Upsert,
                    row: sample_row("n1", 300),
                }],
                &header(1, 1000),
            )
            .unwrap();
        let tip = store.tip_block().unwrap().unwrap();
        assert_eq!(tip.height, 1);
        assert_eq!(tip.first_seq, 1);
        let entries = store.changes_in_span(tip.first_seq, tip.last_seq).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].row_id, "n1");
    }

    #[test]
    fn test_client_sync_state_round_trip() {
        let store = SqliteStore::new_in_memory().unwrap();
        assert!(store.get_client_state("c1").unwrap().is_none());
        store.record_pull("c1", 42, 1000).unwrap();
        store.record_push("c1", 1100).unwrap();
        let state = store.get_client_state("c1").unwrap().unwrap();
        assert_eq!(state.last_pulled_server_seq, 42);
        assert_eq!(state.last_pulled_at, Some(1000));
        assert_eq!(state.last_pushed_at, Some(1100));
        assert_eq!(store.list_client_ids().unwrap(), vec!["c1".to_string()]);
    }

    #[test]
    fn test_sync_request_lifecycle() {
        let store = SqliteStore::new_in_memory().unwrap();
        let request = SyncRequest {
            request_id: "req1".into(),
            client_id: "c1".into(),
            request_type: SyncRequestType::DeepRepair,
            payload: json!({"fingerprint": "abc"}),
            created_at: 1000,
            acked_at: None,
            ack_status: None,
            ack_error: None,
        };
        store.insert_sync_request(&request).unwrap();

        let pending = store.pending_sync_request("c1").unwrap().unwrap();
        assert_eq!(pending.request_id, "req1");
        assert_eq!(pending.request_type, SyncRequestType::DeepRepair);

        assert!(store.ack_sync_request("req1", "ok", None, 2000).unwrap());
        assert!(store.pending_sync_request("c1").unwrap().is_none());
        // Still visible as the newest request for cooldown accounting.
        assert!(store.newest_sync_request("c1").unwrap().is_some());
        assert!(!store.ack_sync_request("nope", "ok", None, 2000).unwrap());
    }

    #[test]
    fn test_diagnostics_ordering() {
        let store = SqliteStore::new_in_memory().unwrap();
        for i in 0..3 {
            store
                .insert_diagnostic("c1", "autoheal_signal", &json!({"i": i}), 1000 + i)
                .unwrap();
        }
        store
            .insert_diagnostic("c1", "client_snapshot", &json!({"units": []}), 1500)
            .unwrap();

        let signals = store
            .recent_diagnostics("c1", Some("autoheal_signal"), 10)
            .unwrap();
        assert_eq!(signals.len(), 3);
        assert_eq!(signals[0].payload["i"], 2);

        let snapshot = store.latest_snapshot("c1").unwrap().unwrap();
        assert_eq!(snapshot.kind, "client_snapshot");
    }
}
