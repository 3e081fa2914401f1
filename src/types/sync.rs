use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::{AppliedRow, ChangeEntry, WireRow};

/// Role attached to an authenticated actor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Admin,
    Superadmin,
}

impl Role {
    pub fn is_admin(&self) -> bool {
        matches!(self, Role::Admin | Role::Superadmin)
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "user" => Some(Role::User),
            "admin" => Some(Role::Admin),
            "superadmin" => Some(Role::Superadmin),
            _ => None,
        }
    }
}

/// The authenticated actor behind a request. Identity issuance is
/// external; requests carry the resolved id and role.
#[derive(Debug, Clone)]
pub struct Actor {
    pub id: String,
    pub role: Role,
}

impl Actor {
    pub fn new(id: impl Into<String>, role: Role) -> Self {
        Self {
            id: id.into(),
            role,
        }
    }
}

/// One table's batch of rows inside a push.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableUpserts {
    pub table: String,
    pub rows: Vec<WireRow>,
}

/// Body of `POST /sync/push`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushRequest {
    pub client_id: String,
    pub upserts: Vec<TableUpserts>,
}

/// Response of `POST /sync/push`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushResponse {
    pub ok: bool,
    pub applied: usize,
    #[serde(rename = "lastSeq")]
    pub last_seq: i64,
    #[serde(rename = "dbApplied")]
    pub db_applied: usize,
    #[serde(rename = "appliedRows")]
    pub applied_rows: Vec<AppliedRow>,
}

/// Query of `GET /sync/changes`.
#[derive(Debug, Clone, Deserialize)]
pub struct PullQuery {
    #[serde(default)]
    pub since: i64,
    pub limit: Option<i64>,
    pub client_id: Option<String>,
    #[serde(default = "default_protocol_version")]
    pub sync_protocol_version: u32,
}

fn default_protocol_version() -> u32 {
    1
}

/// Per-table counts of entries dropped during pull re-validation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PullDiagnostics {
    pub invalid_counts: std::collections::BTreeMap<String, u64>,
}

/// Response of `GET /sync/changes`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PullResponse {
    pub sync_protocol_version: u32,
    pub server_cursor: i64,
    pub server_last_seq: i64,
    pub has_more: bool,
    pub changes: Vec<ChangeEntry>,
    #[serde(default)]
    pub diagnostics: PullDiagnostics,
}

/// Actions a server can queue for a client. The legacy `force_full_pull`
/// spelling is accepted on the wire but never produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncRequestType {
    SyncNow,
    #[serde(alias = "force_full_pull")]
    ForceFullPullV2,
    ResetSyncStateAndPull,
    DeepRepair,
    EntityDiff,
    DeleteLocalEntity,
}

impl SyncRequestType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncRequestType::SyncNow => "sync_now",
            SyncRequestType::ForceFullPullV2 => "force_full_pull_v2",
            SyncRequestType::ResetSyncStateAndPull => "reset_sync_state_and_pull",
            SyncRequestType::DeepRepair => "deep_repair",
            SyncRequestType::EntityDiff => "entity_diff",
            SyncRequestType::DeleteLocalEntity => "delete_local_entity",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "sync_now" => Some(SyncRequestType::SyncNow),
            "force_full_pull_v2" | "force_full_pull" => Some(SyncRequestType::ForceFullPullV2),
            "reset_sync_state_and_pull" => Some(SyncRequestType::ResetSyncStateAndPull),
            "deep_repair" => Some(SyncRequestType::DeepRepair),
            "entity_diff" => Some(SyncRequestType::EntityDiff),
            "delete_local_entity" => Some(SyncRequestType::DeleteLocalEntity),
            _ => None,
        }
    }

    /// Whether this request type counts against the autoheal budgets.
    pub fn is_autoheal_action(&self) -> bool {
        matches!(
            self,
            SyncRequestType::ForceFullPullV2
                | SyncRequestType::ResetSyncStateAndPull
                | SyncRequestType::DeepRepair
        )
    }
}

/// A pending corrective action for one client; cleared on acknowledgement.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncRequest {
    pub request_id: String,
    pub client_id: String,
    pub request_type: SyncRequestType,
    #[serde(default)]
    pub payload: Value,
    pub created_at: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub acked_at: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ack_status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ack_error: Option<String>,
}

/// Server-side per-client sync bookkeeping.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientSyncState {
    pub client_id: String,
    pub last_pulled_server_seq: i64,
    pub last_pulled_at: Option<i64>,
    pub last_pushed_at: Option<i64>,
}

/// Query of `GET /client/settings`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientSettingsQuery {
    pub client_id: String,
    pub version: Option<String>,
    pub hostname: Option<String>,
    pub platform: Option<String>,
    pub arch: Option<String>,
    pub username: Option<String>,
}

/// In-memory record of a client observed on the settings poll.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientInfo {
    pub client_id: String,
    pub version: Option<String>,
    pub hostname: Option<String>,
    pub platform: Option<String>,
    pub arch: Option<String>,
    pub username: Option<String>,
    pub last_seen_at: i64,
}

/// Settings handed to clients on the poll cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientSettings {
    pub sync_interval_ms: u64,
    pub settings_poll_interval_ms: u64,
    pub sync_protocol_version: u32,
}

/// Response of `GET /client/settings`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientSettingsResponse {
    pub ok: bool,
    pub settings: ClientSettings,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sync_request: Option<SyncRequest>,
}

/// Body of `POST /client/settings/sync-request/ack`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncRequestAck {
    pub client_id: String,
    pub request_id: String,
    /// "ok" or "error".
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub at: i64,
}
