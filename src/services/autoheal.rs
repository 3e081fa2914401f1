//! Autoheal controller: watches consistency signals per client over time
//! and enqueues escalating corrective sync requests under cooldowns,
//! daily budgets and symptom fingerprints.

use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::Config;
use crate::error::Result;
use crate::services::consistency::ConsistencyReporter;
use crate::services::store::SqliteStore;
use crate::types::{
    AutohealOutcome, AutohealSignal, SignalLevel, SyncRequest, SyncRequestType,
};

const HISTORY_LIMIT: usize = 200;
const DAY_MS: i64 = 24 * 60 * 60 * 1000;
/// Minimum cursor lag before a force-full-pull is worth the bandwidth.
const FORCE_PULL_MIN_LAG: i64 = 8_000;

pub struct AutohealController {
    store: Arc<SqliteStore>,
    consistency: Arc<ConsistencyReporter>,
    config: Arc<Config>,
}

impl AutohealController {
    pub fn new(
        store: Arc<SqliteStore>,
        consistency: Arc<ConsistencyReporter>,
        config: Arc<Config>,
    ) -> Self {
        Self {
            store,
            consistency,
            config,
        }
    }

    /// Compute the newest signal for a client and evaluate the state
    /// machine against its recent history.
    pub fn evaluate_autoheal_for_client(&self, client_id: &str) -> Result<AutohealOutcome> {
        let computation = self.consistency.evaluate_signal(client_id)?;
        self.evaluate_with_signal(client_id, computation.signal, computation.snapshot_known)
    }

    /// Evaluate with an externally computed signal (the reporter normally
    /// provides it; tests inject their own).
    pub fn evaluate_with_signal(
        &self,
        client_id: &str,
        signal: AutohealSignal,
        snapshot_known: bool,
    ) -> Result<AutohealOutcome> {
        let ah = &self.config.autoheal;
        if !ah.enabled {
            return Ok(AutohealOutcome::skipped("disabled"));
        }

        // Record the newest signal before consulting history so the streak
        // includes it.
        let now = chrono::Utc::now().timestamp_millis();
        self.store.insert_diagnostic(
            client_id,
            "autoheal_signal",
            &serde_json::to_value(&signal)?,
            now,
        )?;

        if !snapshot_known {
            return Ok(AutohealOutcome::skipped("server_snapshot_unknown"));
        }

        let history = self.signal_history(client_id)?;
        let Some(action) = choose_action(&history, &signal, ah) else {
            debug!(
                "Autoheal for {}: level {} below action threshold",
                client_id,
                signal.level.as_str()
            );
            return Ok(AutohealOutcome::skipped("below_action_threshold"));
        };

        // Gates, in order; the first failing one names the skip reason.
        if self.store.pending_sync_request(client_id)?.is_some() {
            return Ok(AutohealOutcome::skipped("pending_request"));
        }
        if let Some(newest) = self.store.newest_sync_request(client_id)? {
            if now - newest.created_at < ah.cooldown_ms {
                return Ok(AutohealOutcome::skipped("cooldown"));
            }
        }
        let recent = self.store.autoheal_requests_since(client_id, now - DAY_MS)?;
        if recent.len() as u32 >= ah.max_actions_per_24h {
            return Ok(AutohealOutcome::skipped("daily_budget_exceeded"));
        }
        if action == SyncRequestType::DeepRepair {
            let deep_repairs = recent
                .iter()
                .filter(|r| r.request_type == SyncRequestType::DeepRepair)
                .count() as u32;
            if deep_repairs >= ah.max_deep_repair_per_24h {
                return Ok(AutohealOutcome::skipped("deep_repair_budget_exceeded"));
            }
        }
        let fingerprint_cutoff = now - ah.same_fingerprint_cooldown_ms;
        let repeat = self
            .store
            .autoheal_requests_since(client_id, fingerprint_cutoff)?
            .iter()
            .any(|r| r.payload.get("fingerprint").and_then(Value::as_str)
                == Some(signal.fingerprint.as_str()));
        if repeat {
            return Ok(AutohealOutcome::skipped("same_fingerprint_cooldown"));
        }

        // All gates passed: persist the request and the audit entry.
        let request_id = Uuid::new_v4().to_string();
        let request = SyncRequest {
            request_id: request_id.clone(),
            client_id: client_id.to_string(),
            request_type: action,
            payload: json!({
                "level": signal.level.as_str(),
                "fingerprint": signal.fingerprint,
                "lag": signal.lag,
                "lagRatio": signal.lag_ratio,
                "driftCount": signal.drift_count,
                "warningCount": signal.warning_count,
                "comparableCount": signal.comparable_count,
            }),
            created_at: now,
            acked_at: None,
            ack_status: None,
            ack_error: None,
        };
        self.store.insert_sync_request(&request)?;
        self.store.insert_diagnostic(
            client_id,
            "autoheal",
            &json!({
                "requestId": request_id,
                "requestType": action.as_str(),
                "fingerprint": signal.fingerprint,
                "level": signal.level.as_str(),
            }),
            now,
        )?;
        info!(
            "Autoheal queued {} for {} (level {}, lag {})",
            action.as_str(),
            client_id,
            signal.level.as_str(),
            signal.lag
        );
        Ok(AutohealOutcome {
            queued: true,
            reason: None,
            request_id: Some(request_id),
            request_type: Some(action.as_str().to_string()),
        })
    }

    /// Evaluate every known client; the periodic server task drives this.
    pub fn evaluate_all(&self) -> Result<Vec<(String, AutohealOutcome)>> {
        let mut outcomes = Vec::new();
        for client_id in self.store.list_client_ids()? {
            let outcome = self.evaluate_autoheal_for_client(&client_id)?;
            outcomes.push((client_id, outcome));
        }
        Ok(outcomes)
    }

    /// Recorded signal levels, newest first.
    fn signal_history(&self, client_id: &str) -> Result<Vec<SignalLevel>> {
        let entries =
            self.store
                .recent_diagnostics(client_id, Some("autoheal_signal"), HISTORY_LIMIT)?;
        Ok(entries
            .iter()
            .filter_map(|e| {
                e.payload
                    .get("level")
                    .and_then(Value::as_str)
                    .and_then(SignalLevel::parse)
            })
            .collect())
    }
}

/// Length of the consecutive run of levels >= `floor` at the head.
fn streak_at_or_above(history: &[SignalLevel], floor: SignalLevel) -> u32 {
    history.iter().take_while(|l| **l >= floor).count() as u32
}

fn choose_action(
    history: &[SignalLevel],
    signal: &AutohealSignal,
    ah: &crate::config::AutohealConfig,
) -> Option<SyncRequestType> {
    if streak_at_or_above(history, SignalLevel::Critical) >= ah.critical_consecutive {
        Some(SyncRequestType::DeepRepair)
    } else if streak_at_or_above(history, SignalLevel::Degraded) >= ah.reset_consecutive {
        Some(SyncRequestType::ResetSyncStateAndPull)
    } else if streak_at_or_above(history, SignalLevel::Observe) >= ah.force_pull_consecutive
        && signal.lag > FORCE_PULL_MIN_LAG
    {
        Some(SyncRequestType::ForceFullPullV2)
    } else {
        None
    }
}
