use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A dynamic row in wire (snake_case) form.
pub type WireRow = Map<String, Value>;

/// Client-side sync state of a row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    Synced,
    Pending,
    Error,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Synced => "synced",
            SyncStatus::Pending => "pending",
            SyncStatus::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "synced" => Some(SyncStatus::Synced),
            "pending" => Some(SyncStatus::Pending),
            "error" => Some(SyncStatus::Error),
            _ => None,
        }
    }
}

/// A row as persisted in a server-side sync table: the mandatory envelope
/// plus the table-specific columns bundled as a JSON payload (wire names).
#[derive(Debug, Clone, PartialEq)]
pub struct StoredRow {
    pub id: String,
    pub created_at: i64,
    pub updated_at: i64,
    pub deleted_at: Option<i64>,
    pub last_server_seq: Option<i64>,
    pub sync_status: SyncStatus,
    pub payload: Map<String, Value>,
}

impl StoredRow {
    /// Whether this row is a tombstone.
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    /// Build a stored row from a validated wire row. Envelope fields are
    /// lifted out; everything else stays in the payload.
    pub fn from_wire(row: &WireRow) -> Self {
        let mut payload = Map::new();
        for (k, v) in row {
            match k.as_str() {
                "id" | "created_at" | "updated_at" | "deleted_at" | "last_server_seq"
                | "sync_status" => {}
                _ => {
                    payload.insert(k.clone(), v.clone());
                }
            }
        }
        Self {
            id: row.get("id").and_then(Value::as_str).unwrap_or_default().to_string(),
            created_at: row.get("created_at").and_then(Value::as_i64).unwrap_or(0),
            updated_at: row.get("updated_at").and_then(Value::as_i64).unwrap_or(0),
            deleted_at: row.get("deleted_at").and_then(Value::as_i64),
            last_server_seq: row
                .get("last_server_seq")
                .and_then(Value::as_i64),
            sync_status: row
                .get("sync_status")
                .and_then(Value::as_str)
                .and_then(SyncStatus::parse)
                .unwrap_or(SyncStatus::Synced),
            payload,
        }
    }

    /// Serialize back to a full wire row (envelope + payload).
    pub fn to_wire(&self) -> WireRow {
        let mut row = self.payload.clone();
        row.insert("id".into(), Value::String(self.id.clone()));
        row.insert("created_at".into(), Value::from(self.created_at));
        row.insert("updated_at".into(), Value::from(self.updated_at));
        row.insert(
            "deleted_at".into(),
            self.deleted_at.map(Value::from).unwrap_or(Value::Null),
        );
        row.insert(
            "last_server_seq".into(),
            self.last_server_seq.map(Value::from).unwrap_or(Value::Null),
        );
        row.insert(
            "sync_status".into(),
            Value::String(self.sync_status.as_str().to_string()),
        );
        row
    }

    /// Fetch a payload field as string (wire name).
    pub fn payload_str(&self, field: &str) -> Option<&str> {
        self.payload.get(field).and_then(Value::as_str)
    }
}
