//! Push applier: ingests client upsert batches, validates them against the
//! registry, enforces dependency order and chat policy, resolves conflicts,
//! and appends the accepted rows through the ledger as one block.

use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

use crate::error::{AppError, Result};
use crate::registry::{TableEntry, TableRegistry};
use crate::services::ledger::LedgerEngine;
use crate::services::store::SqliteStore;
use crate::types::{
    Actor, LedgerTx, PushResponse, StoredRow, TableUpserts, TxType, WireRow,
};

/// Decision for one incoming row after conflict resolution.
#[derive(Debug)]
enum RowDecision {
    Apply,
    /// Identical resubmission or losing writer; no change-log entry.
    Skip,
}

pub struct PushApplier {
    store: Arc<SqliteStore>,
    ledger: Arc<LedgerEngine>,
}

impl PushApplier {
    pub fn new(store: Arc<SqliteStore>, ledger: Arc<LedgerEngine>) -> Self {
        Self { store, ledger }
    }

    /// Apply a push batch. All groups commit in one transaction; the first
    /// failing row aborts the whole batch.
    pub async fn push(
        &self,
        client_id: &str,
        actor: &Actor,
        upserts: &[TableUpserts],
    ) -> Result<PushResponse> {
        let registry = TableRegistry::global();

        // 1. Validate every row envelope before touching state.
        for group in upserts {
            if registry.get(&group.table).is_none() {
                return Err(AppError::SyncValidation {
                    table: group.table.clone(),
                    row_id: String::new(),
                    field: "table".into(),
                    message: "unknown sync table".into(),
                });
            }
            for row in &group.rows {
                if let Err(issue) = registry.check(&group.table, row) {
                    return Err(AppError::SyncValidation {
                        table: group.table.clone(),
                        row_id: row
                            .get("id")
                            .and_then(Value::as_str)
                            .unwrap_or("")
                            .to_string(),
                        field: issue.field,
                        message: issue.message,
                    });
                }
            }
        }

        // 2. Order upsert groups by registry topological order.
        let mut ordered: Vec<(&TableEntry, &WireRow)> = Vec::new();
        for entry in registry.entries() {
            for group in upserts.iter().filter(|g| g.table == entry.name) {
                for row in &group.rows {
                    ordered.push((entry, row));
                }
            }
        }

        // 3. Resolve conflicts against the latest committed state; the
        // chain lock is held so concurrent pushes serialize here.
        let mut tip = self.ledger.chain_lock().await;
        // Rows accepted earlier in this batch shadow committed state.
        let mut staged: HashMap<(String, String), StoredRow> = HashMap::new();
        let mut txs = Vec::new();

        for (entry, wire) in ordered {
            let table = entry.name;
            let incoming = StoredRow::from_wire(wire);
            let existing = match staged.get(&(table.to_string(), incoming.id.clone())) {
                Some(row) => Some(row.clone()),
                None => self.ledger.get_state_row(table, &incoming.id).await,
            };

            // Dependency check: every referent must exist (live or
            // tombstoned) either committed or staged earlier in the batch.
            for fk in entry.fk_refs {
                let Some(referent) = incoming.payload_str(fk.field).map(str::to_string) else {
                    continue;
                };
                let satisfied = staged.contains_key(&(fk.table.to_string(), referent.clone()))
                    || self.ledger.get_state_row(fk.table, &referent).await.is_some();
                if !satisfied {
                    return Err(AppError::DependencyMissing {
                        table: table.to_string(),
                        row_id: incoming.id.clone(),
                        field: fk.field.to_string(),
                        referenced_table: fk.table.to_string(),
                    });
                }
            }

            // Chat policy: only the sender (or an admin) may update an
            // existing message.
            if table == "chat_messages" && !actor.role.is_admin() {
                if let Some(existing) = &existing {
                    if existing.payload_str("sender_user_id") != Some(actor.id.as_str()) {
                        return Err(AppError::PolicyDenied(format!(
                            "chat message {} belongs to another sender",
                            incoming.id
                        )));
                    }
                }
            }

            match resolve_conflict(table, &incoming, existing.as_ref())? {
                RowDecision::Skip => {
                    debug!("Push skipped {}/{} (not a newer write)", table, incoming.id);
                }
                RowDecision::Apply => {
                    staged.insert((table.to_string(), incoming.id.clone()), incoming.clone());
                    txs.push(LedgerTx {
                        tx_type: TxType::Upsert,
                        table: Some(table.to_string()),
                        row_id: Some(incoming.id.clone()),
                        row: Some(strip_client_seq(wire)),
                        ts: None,
                    });
                }
            }
        }

        let batch = self.ledger.sign_and_append_locked(&mut tip, txs).await?;
        drop(tip);

        let now = chrono::Utc::now().timestamp_millis();
        self.store.record_push(client_id, now)?;

        info!(
            "Push from {}: {} applied, lastSeq={}",
            client_id, batch.applied, batch.last_seq
        );
        Ok(PushResponse {
            ok: true,
            applied: batch.applied,
            last_seq: batch.last_seq,
            db_applied: batch.applied,
            applied_rows: batch.applied_rows,
        })
    }
}

/// The stored row gets the server-assigned seq on commit; the one the
/// client echoed back must not survive into storage.
fn strip_client_seq(wire: &WireRow) -> WireRow {
    let mut row = wire.clone();
    row.remove("last_server_seq");
    row
}

fn resolve_conflict(
    table: &str,
    incoming: &StoredRow,
    existing: Option<&StoredRow>,
) -> Result<RowDecision> {
    let Some(existing) = existing else {
        return Ok(RowDecision::Apply);
    };

    match (incoming.last_server_seq, existing.last_server_seq) {
        // Client is behind the row it is trying to overwrite.
        (Some(inc), Some(cur)) if inc < cur => Err(AppError::Conflict {
            table: table.to_string(),
            row_id: incoming.id.clone(),
            reason: format!("incoming last_server_seq {inc} is behind {cur}"),
        }),
        (Some(inc), Some(cur)) if inc == cur => {
            if incoming.updated_at == existing.updated_at
                && incoming.deleted_at == existing.deleted_at
            {
                // Identical resubmission: idempotent no-op.
                Ok(RowDecision::Skip)
            } else {
                Ok(RowDecision::Apply)
            }
        }
        // Client observed a newer acceptance than our projection; take it.
        (Some(_), Some(_)) => Ok(RowDecision::Apply),
        _ => {
            // Undelete over a known tombstone without having pulled it.
            if existing.is_deleted()
                && existing.last_server_seq.is_some()
                && incoming.last_server_seq.is_none()
                && !incoming.is_deleted()
            {
                return Err(AppError::Conflict {
                    table: table.to_string(),
                    row_id: incoming.id.clone(),
                    reason: "undelete over tombstone requires a pull first".into(),
                });
            }
            // Last-writer-wins; ties keep the existing row except that
            // deletes beat concurrent non-delete updates.
            if incoming.updated_at > existing.updated_at {
                Ok(RowDecision::Apply)
            } else if incoming.updated_at == existing.updated_at
                && incoming.is_deleted()
                && !existing.is_deleted()
            {
                Ok(RowDecision::Apply)
            } else {
                Ok(RowDecision::Skip)
            }
        }
    }
}
