use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::WireRow;

/// Operation recorded in the change log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeOp {
    Upsert,
    Delete,
}

impl ChangeOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeOp::Upsert => "upsert",
            ChangeOp::Delete => "delete",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "upsert" => Some(ChangeOp::Upsert),
            "delete" => Some(ChangeOp::Delete),
            _ => None,
        }
    }
}

/// One immutable change-log entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeEntry {
    pub server_seq: i64,
    pub table: String,
    pub row_id: String,
    pub op: ChangeOp,
    pub payload_json: Value,
    pub created_at: i64,
}

/// Ledger transaction types accepted on submit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TxType {
    Upsert,
    Delete,
    Grant,
    Revoke,
    Presence,
    Chat,
}

/// One transaction submitted to the ledger engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerTx {
    #[serde(rename = "type")]
    pub tx_type: TxType,
    #[serde(default)]
    pub table: Option<String>,
    #[serde(default)]
    pub row_id: Option<String>,
    #[serde(default)]
    pub row: Option<WireRow>,
    #[serde(default)]
    pub ts: Option<i64>,
}

/// A signed block: a contiguous group of change-log entries committed
/// together, chained by hash.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Block {
    pub height: i64,
    pub prev_hash: String,
    pub hash: String,
    pub signature: String,
    pub signer_id: String,
    pub ts: i64,
    pub entries: Vec<ChangeEntry>,
}

/// Block header row as persisted; entries are reconstructed from the
/// change log via the seq span.
#[derive(Debug, Clone)]
pub struct BlockMeta {
    pub height: i64,
    pub prev_hash: String,
    pub hash: String,
    pub signature: String,
    pub signer_id: String,
    pub ts: i64,
    pub first_seq: i64,
    pub last_seq: i64,
}

/// One applied row reference returned from an append.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppliedRow {
    pub table: String,
    pub row_id: String,
    pub server_seq: i64,
}

/// Result of a signed append.
#[derive(Debug, Clone, Serialize)]
pub struct AppliedBatch {
    pub applied: usize,
    #[serde(rename = "lastSeq")]
    pub last_seq: i64,
    pub height: i64,
    #[serde(rename = "appliedRows")]
    pub applied_rows: Vec<AppliedRow>,
}

/// Sort direction for state queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortDir {
    #[default]
    Asc,
    Desc,
}

/// Options accepted by the ledger state query.
#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
    pub id: Option<String>,
    /// Equality filter; an explicitly empty map is rejected.
    pub filter: Option<serde_json::Map<String, Value>>,
    /// Disjunctive clauses, each an equality map. At most 50.
    pub or_filter: Option<Vec<serde_json::Map<String, Value>>>,
    pub sort_by: Option<String>,
    pub sort_dir: SortDir,
    pub include_deleted: bool,
    pub date_field: Option<String>,
    pub date_from: Option<i64>,
    pub date_to: Option<i64>,
    pub like_field: Option<String>,
    pub like: Option<String>,
    pub regex_field: Option<String>,
    pub regex: Option<String>,
    pub regex_flags: Option<String>,
    pub cursor_value: Option<Value>,
    pub cursor_id: Option<String>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}
