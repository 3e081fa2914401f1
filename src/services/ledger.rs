//! Ledger engine: validates, signs and appends transactions, maintains the
//! in-memory materialized state per table, and answers state queries
//! without scanning the log.
//!
//! Appends serialize through the chain mutex so `server_seq` and block
//! heights are assigned without gaps; queries read a snapshot of the
//! materialized state and run in parallel with each other.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use regex::RegexBuilder;
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard, RwLock};
use tracing::{debug, info};

use crate::error::{AppError, Result};
use crate::registry::TableRegistry;
use crate::services::store::{BlockHeader, RowWrite, SqliteStore};
use crate::types::{
    AppliedBatch, Block, ChangeOp, LedgerTx, QueryOptions, SortDir, StoredRow, TxType, WireRow,
};

const GENESIS_HASH: &str =
    "0000000000000000000000000000000000000000000000000000000000000000";
const MAX_QUERY_LIMIT: usize = 20_000;
const DEFAULT_QUERY_LIMIT: usize = 1_000;
const MAX_OR_CLAUSES: usize = 50;
const MAX_REGEX_LEN: usize = 512;

/// Chain tip guarded by the append mutex.
#[derive(Debug, Clone)]
pub struct ChainTip {
    pub height: i64,
    pub hash: String,
}

type TableState = BTreeMap<String, StoredRow>;

pub struct LedgerEngine {
    store: Arc<SqliteStore>,
    signing_key: SigningKey,
    signer_id: String,
    /// table -> row_id -> row.
    state: RwLock<HashMap<String, TableState>>,
    /// Single logical writer; the protected value is the chain tip.
    chain: Mutex<ChainTip>,
}

impl LedgerEngine {
    /// Create the engine, loading the materialized state and chain tip
    /// from the store. `seed_hex` pins the signing key; a fresh key is
    /// generated when absent.
    pub fn new(store: Arc<SqliteStore>, seed_hex: Option<&str>) -> Result<Self> {
        let signing_key = match seed_hex {
            Some(seed) => {
                let bytes = hex::decode(seed)
                    .map_err(|e| AppError::Internal(format!("bad signer seed: {e}")))?;
                let seed: [u8; 32] = bytes
                    .try_into()
                    .map_err(|_| AppError::Internal("signer seed must be 32 bytes".into()))?;
                SigningKey::from_bytes(&seed)
            }
            None => SigningKey::generate(&mut OsRng),
        };
        let signer_id = hex::encode(signing_key.verifying_key().as_bytes());

        let mut state = HashMap::new();
        for entry in TableRegistry::global().entries() {
            let mut table_state = TableState::new();
            for row in store.all_rows(entry.name)? {
                table_state.insert(row.id.clone(), row);
            }
            state.insert(entry.name.to_string(), table_state);
        }

        let tip = match store.tip_block()? {
            Some(block) => ChainTip {
                height: block.height,
                hash: block.hash,
            },
            None => ChainTip {
                height: 0,
                hash: GENESIS_HASH.to_string(),
            },
        };
        info!(
            "Ledger engine ready: height={}, signer={}",
            tip.height,
            &signer_id[..12.min(signer_id.len())]
        );

        Ok(Self {
            store,
            signing_key,
            signer_id,
            state: RwLock::new(state),
            chain: Mutex::new(tip),
        })
    }

    pub fn signer_id(&self) -> &str {
        &self.signer_id
    }

    /// Take the append lock. Used by the push applier so conflict
    /// resolution and the append observe the same committed state.
    pub async fn chain_lock(&self) -> MutexGuard<'_, ChainTip> {
        self.chain.lock().await
    }

    /// Validate, sign and append a batch of transactions as one block.
    /// All-or-nothing: any failing transaction aborts the batch.
    pub async fn sign_and_append(&self, txs: Vec<LedgerTx>) -> Result<AppliedBatch> {
        let mut tip = self.chain.lock().await;
        self.sign_and_append_locked(&mut tip, txs).await
    }

    /// Append while already holding the chain lock.
    pub async fn sign_and_append_locked(
        &self,
        tip: &mut ChainTip,
        txs: Vec<LedgerTx>,
    ) -> Result<AppliedBatch> {
        if txs.is_empty() {
            return Ok(AppliedBatch {
                applied: 0,
                last_seq: self.store.max_seq()?,
                height: tip.height,
                applied_rows: Vec::new(),
            });
        }

        let ts = chrono::Utc::now().timestamp_millis();
        let writes = {
            let state = self.state.read().await;
            self.resolve_txs(&state, txs, ts)?
        };

        let height = tip.height + 1;
        let canonical = canonical_entries(&writes);
        let hash = block_hash(&tip.hash, &canonical, &self.signer_id, ts);
        let signature = hex::encode(self.signing_key.sign(hash.as_bytes()).to_bytes());

        let header = BlockHeader {
            height,
            prev_hash: tip.hash.clone(),
            hash: hash.clone(),
            signature,
            signer_id: self.signer_id.clone(),
            ts,
        };
        let result = self.store.commit_block(&writes, &header)?;

        {
            let mut state = self.state.write().await;
            for (table, row) in &result.rows {
                state
                    .entry(table.clone())
                    .or_default()
                    .insert(row.id.clone(), row.clone());
            }
        }
        tip.height = height;
        tip.hash = hash;

        debug!(
            "Committed block {} ({} entries, seqs {}..={})",
            height,
            result.applied.len(),
            result.first_seq,
            result.last_seq
        );
        Ok(AppliedBatch {
            applied: result.applied.len(),
            last_seq: result.last_seq,
            height,
            applied_rows: result.applied,
        })
    }

    /// Resolve submitted transactions into row writes, enforcing schema
    /// validation and dependency order against the materialized state.
    fn resolve_txs(
        &self,
        state: &HashMap<String, TableState>,
        txs: Vec<LedgerTx>,
        ts: i64,
    ) -> Result<Vec<RowWrite>> {
        let registry = TableRegistry::global();
        let mut writes = Vec::with_capacity(txs.len());
        // Rows staged earlier in this batch satisfy dependency checks.
        let mut staged: HashSet<(String, String)> = HashSet::new();

        for tx in txs {
            let (table, mut op) = resolve_target(&tx)?;
            let entry = registry
                .get(&table)
                .ok_or_else(|| AppError::Validation(format!("unknown sync table {table}")))?;

            let row = match op {
                ChangeOp::Upsert => {
                    let wire = tx.row.ok_or_else(|| {
                        AppError::Validation(format!("{table}: upsert requires a row"))
                    })?;
                    if let Err(issue) = registry.check(&table, &wire) {
                        let row_id = wire
                            .get("id")
                            .and_then(Value::as_str)
                            .unwrap_or("")
                            .to_string();
                        return Err(AppError::SyncValidation {
                            table: table.clone(),
                            row_id,
                            field: issue.field,
                            message: issue.message,
                        });
                    }
                    let row = StoredRow::from_wire(&wire);
                    // A tombstone arriving through an upsert is logged as a
                    // delete so replay preserves deletion semantics.
                    if row.is_deleted() {
                        op = ChangeOp::Delete;
                    }
                    row
                }
                ChangeOp::Delete => {
                    let row_id = tx
                        .row_id
                        .or_else(|| {
                            tx.row
                                .as_ref()
                                .and_then(|r| r.get("id"))
                                .and_then(Value::as_str)
                                .map(str::to_string)
                        })
                        .ok_or_else(|| {
                            AppError::Validation(format!("{table}: delete requires row_id"))
                        })?;
                    let existing = state
                        .get(&table)
                        .and_then(|t| t.get(&row_id))
                        .cloned()
                        .ok_or_else(|| {
                            AppError::NotFound(format!("{table}/{row_id} does not exist"))
                        })?;
                    let at = tx.ts.unwrap_or(ts).max(existing.updated_at);
                    StoredRow {
                        updated_at: at,
                        deleted_at: Some(at),
                        ..existing
                    }
                }
            };

            for fk in entry.fk_refs {
                let Some(referent) = row.payload_str(fk.field).map(str::to_string) else {
                    continue;
                };
                let exists = staged.contains(&(fk.table.to_string(), referent.clone()))
                    || state
                        .get(fk.table)
                        .map_or(false, |t| t.contains_key(&referent));
                if !exists {
                    return Err(AppError::DependencyMissing {
                        table: table.clone(),
                        row_id: row.id.clone(),
                        field: fk.field.to_string(),
                        referenced_table: fk.table.to_string(),
                    });
                }
            }

            staged.insert((table.clone(), row.id.clone()));
            writes.push(RowWrite { table, op, row });
        }
        Ok(writes)
    }

    /// Look up one row from the materialized state.
    pub async fn get_state_row(&self, table: &str, id: &str) -> Option<StoredRow> {
        self.state.read().await.get(table)?.get(id).cloned()
    }

    /// Query the materialized state of one table.
    pub async fn query_state(&self, table: &str, opts: &QueryOptions) -> Result<Vec<WireRow>> {
        let registry = TableRegistry::global();
        if !registry.is_sync_table(table) {
            return Err(AppError::NotFound(format!("unknown sync table {table}")));
        }
        validate_query_options(opts)?;

        let regex = match (&opts.regex, &opts.regex_field) {
            (Some(pattern), Some(_)) => Some(compile_regex(pattern, opts.regex_flags.as_deref())?),
            _ => None,
        };

        let mut rows: Vec<StoredRow> = {
            let state = self.state.read().await;
            let table_state = match state.get(table) {
                Some(t) => t,
                None => return Ok(Vec::new()),
            };
            table_state
                .values()
                .filter(|row| {
                    if let Some(id) = &opts.id {
                        if &row.id != id {
                            return false;
                        }
                    }
                    if !opts.include_deleted && row.is_deleted() {
                        return false;
                    }
                    if let Some(filter) = &opts.filter {
                        if !matches_clause(row, filter) {
                            return false;
                        }
                    }
                    if let Some(clauses) = &opts.or_filter {
                        if !clauses.iter().any(|c| matches_clause(row, c)) {
                            return false;
                        }
                    }
                    if let (Some(field), Some(from), Some(to)) =
                        (&opts.date_field, opts.date_from, opts.date_to)
                    {
                        match row_value(row, field).and_then(|v| v.as_i64()) {
                            Some(n) if n >= from && n <= to => {}
                            _ => return false,
                        }
                    }
                    if let (Some(field), Some(needle)) = (&opts.like_field, &opts.like) {
                        let matched = row_value(row, field)
                            .and_then(|v| v.as_str().map(str::to_string))
                            .map_or(false, |s| {
                                s.to_lowercase().contains(&needle.to_lowercase())
                            });
                        if !matched {
                            return false;
                        }
                    }
                    if let (Some(field), Some(re)) = (&opts.regex_field, &regex) {
                        let matched = row_value(row, field)
                            .and_then(|v| v.as_str().map(str::to_string))
                            .map_or(false, |s| re.is_match(&s));
                        if !matched {
                            return false;
                        }
                    }
                    true
                })
                .cloned()
                .collect()
        };

        // Deterministic order: sort key, then id ascending on ties.
        if let Some(sort_by) = &opts.sort_by {
            rows.sort_by(|a, b| {
                let av = row_value(a, sort_by).unwrap_or(Value::Null);
                let bv = row_value(b, sort_by).unwrap_or(Value::Null);
                let ord = cmp_values(&av, &bv);
                let ord = match opts.sort_dir {
                    SortDir::Asc => ord,
                    SortDir::Desc => ord.reverse(),
                };
                ord.then_with(|| a.id.cmp(&b.id))
            });
        } else {
            rows.sort_by(|a, b| a.id.cmp(&b.id));
        }

        if let (Some(cursor_value), Some(cursor_id), Some(sort_by)) =
            (&opts.cursor_value, &opts.cursor_id, &opts.sort_by)
        {
            rows.retain(|row| {
                let v = row_value(row, sort_by).unwrap_or(Value::Null);
                let key_ord = match opts.sort_dir {
                    SortDir::Asc => cmp_values(&v, cursor_value),
                    SortDir::Desc => cmp_values(&v, cursor_value).reverse(),
                };
                key_ord.then_with(|| row.id.cmp(cursor_id)) == Ordering::Greater
            });
        }

        let offset = opts.offset.unwrap_or(0);
        let limit = opts
            .limit
            .unwrap_or(DEFAULT_QUERY_LIMIT)
            .min(MAX_QUERY_LIMIT);
        Ok(rows
            .into_iter()
            .skip(offset)
            .take(limit)
            .map(|r| r.to_wire())
            .collect())
    }

    /// Blocks in height order with their change-log entries attached.
    pub fn list_blocks_since(&self, since: i64, limit: i64) -> Result<Vec<Block>> {
        let metas = self.store.blocks_since(since, limit.clamp(1, 1000))?;
        let mut blocks = Vec::with_capacity(metas.len());
        for meta in metas {
            let entries = self.store.changes_in_span(meta.first_seq, meta.last_seq)?;
            blocks.push(Block {
                height: meta.height,
                prev_hash: meta.prev_hash,
                hash: meta.hash,
                signature: meta.signature,
                signer_id: meta.signer_id,
                ts: meta.ts,
                entries,
            });
        }
        Ok(blocks)
    }

    /// Current chain height.
    pub async fn height(&self) -> i64 {
        self.chain.lock().await.height
    }
}

fn resolve_target(tx: &LedgerTx) -> Result<(String, ChangeOp)> {
    let named = |t: &Option<String>| {
        t.clone()
            .ok_or_else(|| AppError::Validation("transaction requires a table".into()))
    };
    match tx.tx_type {
        TxType::Upsert => Ok((named(&tx.table)?, ChangeOp::Upsert)),
        TxType::Delete => Ok((named(&tx.table)?, ChangeOp::Delete)),
        TxType::Grant => Ok(("note_shares".to_string(), ChangeOp::Upsert)),
        TxType::Revoke => Ok(("note_shares".to_string(), ChangeOp::Delete)),
        TxType::Presence => Ok(("user_presence".to_string(), ChangeOp::Upsert)),
        TxType::Chat => Ok(("chat_messages".to_string(), ChangeOp::Upsert)),
    }
}

fn canonical_entries(writes: &[RowWrite]) -> String {
    let entries: Vec<Value> = writes
        .iter()
        .map(|w| {
            json!({
                "table": w.table,
                "row_id": w.row.id,
                "op": w.op.as_str(),
                "payload": Value::Object(w.row.to_wire()),
            })
        })
        .collect();
    Value::Array(entries).to_string()
}

fn block_hash(prev_hash: &str, canonical: &str, signer_id: &str, ts: i64) -> String {
    let mut hasher = Sha256::new();
    hasher.update(prev_hash.as_bytes());
    hasher.update(canonical.as_bytes());
    hasher.update(signer_id.as_bytes());
    hasher.update(ts.to_le_bytes());
    hex::encode(hasher.finalize())
}

/// Verify a block's signature against its signer id.
pub fn verify_block_signature(block: &Block) -> bool {
    let Ok(key_bytes) = hex::decode(&block.signer_id) else {
        return false;
    };
    let key_array: [u8; 32] = match key_bytes.try_into() {
        Ok(a) => a,
        Err(_) => return false,
    };
    let Ok(key) = VerifyingKey::from_bytes(&key_array) else {
        return false;
    };
    let Ok(sig_bytes) = hex::decode(&block.signature) else {
        return false;
    };
    let sig_array: [u8; 64] = match sig_bytes.try_into() {
        Ok(a) => a,
        Err(_) => return false,
    };
    let signature = Signature::from_bytes(&sig_array);
    key.verify(block.hash.as_bytes(), &signature).is_ok()
}

fn validate_query_options(opts: &QueryOptions) -> Result<()> {
    if let Some(filter) = &opts.filter {
        if filter.is_empty() {
            return Err(AppError::Validation("empty filter rejected".into()));
        }
    }
    if let Some(clauses) = &opts.or_filter {
        if clauses.len() > MAX_OR_CLAUSES {
            return Err(AppError::Validation(format!(
                "or_filter exceeds {MAX_OR_CLAUSES} clauses"
            )));
        }
        if clauses.iter().any(|c| c.is_empty()) {
            return Err(AppError::Validation("empty or_filter clause rejected".into()));
        }
    }
    if opts.like.is_some() != opts.like_field.is_some() {
        return Err(AppError::Validation(
            "like and like_field must be provided together".into(),
        ));
    }
    if opts.regex.is_some() != opts.regex_field.is_some() {
        return Err(AppError::Validation(
            "regex and regex_field must be provided together".into(),
        ));
    }
    if opts.regex_flags.is_some() && opts.regex.is_none() {
        return Err(AppError::Validation("regex_flags requires regex".into()));
    }
    if (opts.cursor_value.is_some() || opts.cursor_id.is_some()) && opts.sort_by.is_none() {
        return Err(AppError::Validation("cursor pagination requires sort_by".into()));
    }
    if let (Some(from), Some(to)) = (opts.date_from, opts.date_to) {
        if from > to {
            return Err(AppError::Validation("date_from must be <= date_to".into()));
        }
    }
    if opts.date_field.is_some() && (opts.date_from.is_none() || opts.date_to.is_none()) {
        return Err(AppError::Validation(
            "date_field requires date_from and date_to".into(),
        ));
    }
    Ok(())
}

fn compile_regex(pattern: &str, flags: Option<&str>) -> Result<regex::Regex> {
    if pattern.len() > MAX_REGEX_LEN {
        return Err(AppError::Validation(format!(
            "regex exceeds {MAX_REGEX_LEN} characters"
        )));
    }
    let mut builder = RegexBuilder::new(pattern);
    builder.size_limit(1 << 20);
    if let Some(flags) = flags {
        for flag in flags.chars() {
            match flag {
                'i' => {
                    builder.case_insensitive(true);
                }
                'm' => {
                    builder.multi_line(true);
                }
                's' => {
                    builder.dot_matches_new_line(true);
                }
                'u' => {
                    builder.unicode(true);
                }
                // Match-iteration flags; no pattern semantics here.
                'g' | 'y' => {}
                other => {
                    return Err(AppError::Validation(format!(
                        "unsupported regex flag '{other}'"
                    )));
                }
            }
        }
    }
    builder
        .build()
        .map_err(|e| AppError::Validation(format!("invalid regex: {e}")))
}

fn row_value(row: &StoredRow, field: &str) -> Option<Value> {
    match field {
        "id" => Some(Value::String(row.id.clone())),
        "created_at" => Some(Value::from(row.created_at)),
        "updated_at" => Some(Value::from(row.updated_at)),
        "deleted_at" => Some(row.deleted_at.map(Value::from).unwrap_or(Value::Null)),
        "last_server_seq" => Some(row.last_server_seq.map(Value::from).unwrap_or(Value::Null)),
        "sync_status" => Some(Value::String(row.sync_status.as_str().to_string())),
        _ => row.payload.get(field).cloned(),
    }
}

fn matches_clause(row: &StoredRow, clause: &Map<String, Value>) -> bool {
    clause.iter().all(|(field, expected)| {
        row_value(row, field).map_or(expected.is_null(), |actual| value_eq(&actual, expected))
    })
}

fn value_eq(a: &Value, b: &Value) -> bool {
    if let (Some(x), Some(y)) = (a.as_f64(), b.as_f64()) {
        return x == y;
    }
    a == b
}

fn cmp_values(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Null, Value::Null) => Ordering::Equal,
        (Value::Null, _) => Ordering::Less,
        (_, Value::Null) => Ordering::Greater,
        (Value::Number(_), Value::Number(_)) => a
            .as_f64()
            .partial_cmp(&b.as_f64())
            .unwrap_or(Ordering::Equal),
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        _ => a.to_string().cmp(&b.to_string()),
    }
}
