//! Client sync runner: a cooperative single-flight scheduler driving
//! push/pull cycles against the server, with error backoff and pending
//! sync-request execution.

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock};
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::client::local_store::ClientStore;
use crate::error::{AppError, Result};
use crate::registry::TableRegistry;
use crate::types::{
    Actor, ClientSettingsResponse, ClientSnapshot, PullResponse, PushRequest, PushResponse,
    Role, SyncRequest, SyncRequestType, SyncStatus, TableUpserts,
};

const MIN_BACKOFF_SECS: u64 = 60;
const MAX_BACKOFF_SECS: u64 = 600;
const HTTP_TIMEOUT_SECS: u64 = 15;

/// User-visible runner state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunnerState {
    Idle,
    Syncing,
    Error,
}

/// Status surface returned by `get_status` and `run_once`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunnerStatus {
    pub state: RunnerState,
    pub cursor: i64,
    pub last_run_at: Option<i64>,
    pub last_result: Option<String>,
    pub last_error: Option<String>,
}

pub struct SyncRunner {
    client_id: String,
    actor: Actor,
    api_base: StdRwLock<String>,
    http: reqwest::Client,
    store: Arc<ClientStore>,
    status: StdMutex<RunnerStatus>,
    /// At most one cycle in flight per process.
    inflight: Mutex<()>,
    stopped: AtomicBool,
    wake: Notify,
    error_streak: AtomicU32,
    auto_task: StdMutex<Option<JoinHandle<()>>>,
}

impl SyncRunner {
    pub fn new(
        client_id: impl Into<String>,
        actor_id: impl Into<String>,
        role: Role,
        api_base_url: impl Into<String>,
        store: Arc<ClientStore>,
    ) -> Arc<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(HTTP_TIMEOUT_SECS))
            .build()
            .expect("reqwest client");
        Arc::new(Self {
            client_id: client_id.into(),
            actor: Actor::new(actor_id, role),
            api_base: StdRwLock::new(api_base_url.into()),
            http,
            store,
            status: StdMutex::new(RunnerStatus {
                state: RunnerState::Idle,
                cursor: 0,
                last_run_at: None,
                last_result: None,
                last_error: None,
            }),
            inflight: Mutex::new(()),
            stopped: AtomicBool::new(false),
            wake: Notify::new(),
            error_streak: AtomicU32::new(0),
            auto_task: StdMutex::new(None),
        })
    }

    pub fn set_api_base_url(&self, url: impl Into<String>) {
        *self.api_base.write().unwrap() = url.into();
    }

    pub fn get_status(&self) -> RunnerStatus {
        self.status.lock().unwrap().clone()
    }

    /// Run one sync cycle. A call arriving while a cycle is in flight
    /// returns the current status instead of queuing a second pass.
    pub async fn run_once(&self) -> RunnerStatus {
        let Ok(_guard) = self.inflight.try_lock() else {
            debug!("Sync already in flight; returning current status");
            return self.get_status();
        };

        {
            let mut status = self.status.lock().unwrap();
            status.state = RunnerState::Syncing;
        }

        let outcome = self.cycle().await;
        let now = chrono::Utc::now().timestamp_millis();
        let cursor = self.store.cursor().unwrap_or(0);

        let mut status = self.status.lock().unwrap();
        status.cursor = cursor;
        status.last_run_at = Some(now);
        match outcome {
            Ok(summary) => {
                self.error_streak.store(0, Ordering::Relaxed);
                status.state = RunnerState::Idle;
                status.last_result = Some(summary);
                status.last_error = None;
            }
            Err(e) => {
                self.error_streak.fetch_add(1, Ordering::Relaxed);
                status.state = RunnerState::Error;
                status.last_error = Some(e.to_string());
            }
        }
        status.clone()
    }

    /// One full cycle: settings fetch (executing any pending sync
    /// request), push pending rows in registry order, pull to the tip,
    /// snapshot upload, request acknowledgement.
    async fn cycle(&self) -> Result<String> {
        let settings: ClientSettingsResponse = self
            .get_json(
                "/client/settings",
                &[("clientId", self.client_id.clone())],
            )
            .await?;

        let pending_request = settings.sync_request;
        if let Some(request) = &pending_request {
            info!(
                "Executing sync request {} ({})",
                request.request_id,
                request.request_type.as_str()
            );
            if let Err(e) = self.execute_request(request).await {
                warn!("Sync request {} failed: {e}", request.request_id);
                self.ack_request(request, "error", Some(e.to_string()))
                    .await?;
                return Err(e);
            }
        }

        let push_error = match self.push_pending().await {
            Ok(pushed) => {
                debug!("Pushed {pushed} rows");
                None
            }
            Err(e) => {
                warn!("Push failed: {e}");
                Some(e)
            }
        };

        let pulled = self.pull_to_tip().await?;
        self.upload_snapshot().await?;

        if let Some(request) = &pending_request {
            let (status, error) = match &push_error {
                None => ("ok", None),
                Some(e) => ("error", Some(e.to_string())),
            };
            self.ack_request(request, status, error).await?;
        }

        match push_error {
            Some(e) => Err(e),
            None => Ok(format!("pulled {pulled} changes")),
        }
    }

    /// Apply a server-issued corrective action before syncing.
    async fn execute_request(&self, request: &SyncRequest) -> Result<()> {
        match request.request_type {
            SyncRequestType::SyncNow => {}
            SyncRequestType::ForceFullPullV2 => {
                self.store.set_cursor(0)?;
            }
            SyncRequestType::ResetSyncStateAndPull | SyncRequestType::DeepRepair => {
                self.store.wipe()?;
            }
            SyncRequestType::EntityDiff => {
                self.upload_snapshot().await?;
            }
            SyncRequestType::DeleteLocalEntity => {
                let table = request
                    .payload
                    .get("table")
                    .and_then(Value::as_str)
                    .ok_or_else(|| {
                        AppError::Validation("delete_local_entity requires a table".into())
                    })?;
                let row_id = request
                    .payload
                    .get("rowId")
                    .or_else(|| request.payload.get("row_id"))
                    .and_then(Value::as_str)
                    .ok_or_else(|| {
                        AppError::Validation("delete_local_entity requires a row id".into())
                    })?;
                self.store.delete_row(table, row_id)?;
            }
        }
        Ok(())
    }

    /// Push pending rows table by table in registry topological order.
    async fn push_pending(&self) -> Result<usize> {
        let registry = TableRegistry::global();
        let mut pushed = 0usize;
        for entry in registry.entries() {
            let pending = self.store.pending_rows(entry.name)?;
            if pending.is_empty() {
                continue;
            }
            let rows: Vec<_> = pending
                .iter()
                .map(|db_row| registry.to_sync_row(entry.name, db_row))
                .collect();
            let request = PushRequest {
                client_id: self.client_id.clone(),
                upserts: vec![TableUpserts {
                    table: entry.name.to_string(),
                    rows,
                }],
            };
            match self.post_json::<PushResponse, _>("/sync/push", &request).await {
                Ok(response) => {
                    for applied in &response.applied_rows {
                        self.store.mark_status(
                            &applied.table,
                            &applied.row_id,
                            SyncStatus::Synced,
                            Some(applied.server_seq),
                        )?;
                    }
                    // Rows skipped as idempotent or losing writers are
                    // settled too; the next pull carries the winner.
                    for db_row in &pending {
                        if let Some(id) = db_row.get("id").and_then(Value::as_str) {
                            let applied = response
                                .applied_rows
                                .iter()
                                .any(|a| a.row_id == id);
                            if !applied {
                                self.store.mark_status(
                                    entry.name,
                                    id,
                                    SyncStatus::Synced,
                                    None,
                                )?;
                            }
                        }
                    }
                    pushed += response.applied;
                }
                Err(e) => {
                    for db_row in &pending {
                        if let Some(id) = db_row.get("id").and_then(Value::as_str) {
                            self.store
                                .mark_status(entry.name, id, SyncStatus::Error, None)?;
                        }
                    }
                    return Err(e);
                }
            }
        }
        Ok(pushed)
    }

    /// Pull pages until the server reports no more changes, advancing the
    /// cursor atomically per page.
    async fn pull_to_tip(&self) -> Result<usize> {
        let mut total = 0usize;
        loop {
            let cursor = self.store.cursor()?;
            let response: PullResponse = self
                .get_json(
                    "/sync/changes",
                    &[
                        ("since", cursor.to_string()),
                        ("client_id", self.client_id.clone()),
                        ("sync_protocol_version", "2".to_string()),
                    ],
                )
                .await?;
            for entry in &response.changes {
                self.store.apply_change(entry)?;
            }
            total += response.changes.len();
            self.store.set_cursor(response.server_cursor)?;
            if !response.has_more {
                break;
            }
        }
        Ok(total)
    }

    async fn upload_snapshot(&self) -> Result<()> {
        let snapshot = ClientSnapshot {
            client_id: self.client_id.clone(),
            snapshot_at: chrono::Utc::now().timestamp_millis(),
            units: self.store.snapshot_units()?,
        };
        let _: Value = self
            .post_json("/client/diagnostics/snapshot", &snapshot)
            .await?;
        Ok(())
    }

    async fn ack_request(
        &self,
        request: &SyncRequest,
        status: &str,
        error: Option<String>,
    ) -> Result<()> {
        let body = serde_json::json!({
            "clientId": self.client_id,
            "requestId": request.request_id,
            "status": status,
            "error": error,
            "at": chrono::Utc::now().timestamp_millis(),
        });
        let _: Value = self
            .post_json("/client/settings/sync-request/ack", &body)
            .await?;
        Ok(())
    }

    // ========== Auto mode ==========

    /// Arm the periodic sync loop. Errors bump the delay into the
    /// [60s, 600s] backoff window until a cycle succeeds.
    pub fn start_auto(self: &Arc<Self>, base_interval: Duration) {
        self.stopped.store(false, Ordering::Relaxed);
        let runner = self.clone();
        let handle = tokio::spawn(async move {
            loop {
                let streak = runner.error_streak.load(Ordering::Relaxed);
                let delay = backoff_delay(base_interval, streak);
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = runner.wake.notified() => {}
                }
                if runner.stopped.load(Ordering::Relaxed) {
                    break;
                }
                runner.run_once().await;
            }
            debug!("Auto sync loop stopped");
        });
        *self.auto_task.lock().unwrap() = Some(handle);
    }

    /// Stop scheduling future cycles; an in-flight cycle finishes.
    pub fn stop_auto(&self) {
        self.stopped.store(true, Ordering::Relaxed);
        self.wake.notify_waiters();
    }

    // ========== HTTP plumbing ==========

    fn base(&self) -> String {
        self.api_base.read().unwrap().clone()
    }

    fn role_str(&self) -> &'static str {
        match self.actor.role {
            Role::User => "user",
            Role::Admin => "admin",
            Role::Superadmin => "superadmin",
        }
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T> {
        let response = self
            .http
            .get(format!("{}{}", self.base(), path))
            .header("x-actor-id", &self.actor.id)
            .header("x-actor-role", self.role_str())
            .query(query)
            .send()
            .await?;
        decode_response(response).await
    }

    async fn post_json<T: DeserializeOwned, B: Serialize>(&self, path: &str, body: &B) -> Result<T> {
        let response = self
            .http
            .post(format!("{}{}", self.base(), path))
            .header("x-actor-id", &self.actor.id)
            .header("x-actor-role", self.role_str())
            .json(body)
            .send()
            .await?;
        decode_response(response).await
    }
}

/// Delay before the next auto cycle: the base interval while healthy, an
/// exponential bump clamped to [60s, 600s] after errors.
fn backoff_delay(base: Duration, error_streak: u32) -> Duration {
    if error_streak == 0 {
        return base;
    }
    let shift = error_streak.min(16);
    let bumped = base.as_secs().max(1).saturating_mul(1u64 << shift);
    Duration::from_secs(bumped.clamp(MIN_BACKOFF_SECS, MAX_BACKOFF_SECS))
}

async fn decode_response<T: DeserializeOwned>(response: reqwest::Response) -> Result<T> {
    let status = response.status();
    if status.is_success() {
        return Ok(response.json().await?);
    }
    let body: Value = response.json().await.unwrap_or(Value::Null);
    let kind = body["error"]["kind"].as_str().unwrap_or("internal");
    let message = body["error"]["message"]
        .as_str()
        .unwrap_or("request failed")
        .to_string();
    Err(match kind {
        "sync_conflict" => AppError::Conflict {
            table: body["error"]["table"].as_str().unwrap_or("").to_string(),
            row_id: body["error"]["row_id"].as_str().unwrap_or("").to_string(),
            reason: message,
        },
        "protocol_upgrade_required" => AppError::ProtocolUpgradeRequired {
            required: body["error"]["required_version"].as_u64().unwrap_or(2) as u32,
        },
        "sync_policy_denied" => AppError::PolicyDenied(message),
        "auth_required" => AppError::AuthRequired,
        "permission_denied" => AppError::PermissionDenied(message),
        "not_found" => AppError::NotFound(message),
        "validation" | "sync_validation_error" => AppError::Validation(message),
        _ => AppError::Internal(format!("{status}: {message}")),
    })
}
