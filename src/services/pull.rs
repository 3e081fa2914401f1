//! Pull producer: streams change-log entries past a client cursor, scoped
//! by chat privacy rules and re-validated against the registry schemas.

use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::config::Config;
use crate::error::{AppError, Result};
use crate::registry::TableRegistry;
use crate::services::store::SqliteStore;
use crate::types::{Actor, ChangeEntry, PullDiagnostics, PullResponse};

/// Protocol version this server speaks.
pub const SYNC_PROTOCOL_VERSION: u32 = 2;

pub struct PullProducer {
    store: Arc<SqliteStore>,
    config: Arc<Config>,
}

impl PullProducer {
    pub fn new(store: Arc<SqliteStore>, config: Arc<Config>) -> Self {
        Self { store, config }
    }

    /// Produce one page of changes strictly after `since`.
    pub fn pull(
        &self,
        actor: &Actor,
        since: i64,
        limit: Option<i64>,
        client_id: Option<&str>,
        protocol_version: u32,
    ) -> Result<PullResponse> {
        if self.config.sync_v2_enforce && protocol_version < SYNC_PROTOCOL_VERSION {
            return Err(AppError::ProtocolUpgradeRequired {
                required: SYNC_PROTOCOL_VERSION,
            });
        }

        let limit = limit
            .unwrap_or(self.config.sync_pull_page_default)
            .clamp(1, self.config.sync_pull_page_max);
        let entries = self.store.changes_since(since, limit)?;
        let server_last_seq = self.store.max_seq()?;

        // The cursor advances over filtered entries too; a privacy-dropped
        // entry must not wedge the client on the same page forever.
        let server_cursor = entries.last().map_or(since, |e| e.server_seq);

        let registry = TableRegistry::global();
        let mut diagnostics = PullDiagnostics::default();
        let mut changes = Vec::with_capacity(entries.len());
        for entry in entries {
            if !visible_to(actor, &entry) {
                debug!(
                    "Privacy-filtered {}/{} from pull for {}",
                    entry.table, entry.row_id, actor.id
                );
                continue;
            }
            let valid = entry
                .payload_json
                .as_object()
                .map_or(false, |row| registry.validate(&entry.table, row));
            if !valid {
                warn!(
                    "Dropping invalid change-log payload {}/{} (seq {})",
                    entry.table, entry.row_id, entry.server_seq
                );
                *diagnostics
                    .invalid_counts
                    .entry(entry.table.clone())
                    .or_insert(0) += 1;
                continue;
            }
            changes.push(entry);
        }

        if let Some(client_id) = client_id {
            let now = chrono::Utc::now().timestamp_millis();
            self.store.record_pull(client_id, server_cursor, now)?;
        }

        Ok(PullResponse {
            sync_protocol_version: SYNC_PROTOCOL_VERSION,
            server_cursor,
            server_last_seq,
            has_more: server_cursor < server_last_seq,
            changes,
            diagnostics,
        })
    }
}

/// Chat rows are readable only by their participants or an admin role.
/// A message without a recipient is broadcast and visible to everyone.
fn visible_to(actor: &Actor, entry: &ChangeEntry) -> bool {
    let scoped = TableRegistry::global()
        .get(&entry.table)
        .map_or(false, |e| e.privacy_scoped);
    if !scoped || actor.role.is_admin() {
        return true;
    }
    let Some(row) = entry.payload_json.as_object() else {
        return false;
    };
    let field = |name: &str| row.get(name).and_then(Value::as_str);
    match entry.table.as_str() {
        "chat_messages" => {
            let sender = field("sender_user_id");
            let recipient = field("recipient_user_id");
            recipient.is_none()
                || sender == Some(actor.id.as_str())
                || recipient == Some(actor.id.as_str())
        }
        "chat_reads" => field("user_id") == Some(actor.id.as_str()),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ChangeOp, Role};
    use serde_json::json;

    fn entry(table: &str, payload: Value) -> ChangeEntry {
        ChangeEntry {
            server_seq: 1,
            table: table.to_string(),
            row_id: "m1".into(),
            op: ChangeOp::Upsert,
            payload_json: payload,
            created_at: 1000,
        }
    }

    #[test]
    fn test_direct_message_visibility() {
        let direct = entry(
            "chat_messages",
            json!({"sender_user_id": "u1", "recipient_user_id": "u2", "body": "hi"}),
        );
        assert!(visible_to(&Actor::new("u1", Role::User), &direct));
        assert!(visible_to(&Actor::new("u2", Role::User), &direct));
        assert!(!visible_to(&Actor::new("u3", Role::User), &direct));
        assert!(visible_to(&Actor::new("root", Role::Admin), &direct));
        assert!(visible_to(&Actor::new("root", Role::Superadmin), &direct));
    }

    #[test]
    fn test_broadcast_message_visible_to_all() {
        let broadcast = entry(
            "chat_messages",
            json!({"sender_user_id": "u1", "body": "hello all"}),
        );
        assert!(visible_to(&Actor::new("u3", Role::User), &broadcast));
    }

    #[test]
    fn test_chat_read_visibility() {
        let read = entry(
            "chat_reads",
            json!({"message_id": "m1", "user_id": "u2"}),
        );
        assert!(visible_to(&Actor::new("u2", Role::User), &read));
        assert!(!visible_to(&Actor::new("u1", Role::User), &read));
        assert!(visible_to(&Actor::new("root", Role::Admin), &read));
    }

    #[test]
    fn test_non_privacy_tables_unfiltered() {
        let note = entry("notes", json!({"owner_user_id": "u1", "title": "t"}));
        assert!(visible_to(&Actor::new("u9", Role::User), &note));
    }
}
