//! Consistency reporter: per-table and per-entity-type checksums on the
//! server side, compared against client-uploaded snapshots to produce
//! drift/warning/ok diffs, lag metrics and the aggregated signal level
//! consumed by the autoheal controller.

use sha1::{Digest as Sha1Digest, Sha1};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

use crate::config::Config;
use crate::error::Result;
use crate::registry::TableRegistry;
use crate::services::store::SqliteStore;
use crate::types::{
    AutohealSignal, ChecksumUnit, ClientReport, ClientSnapshot, ClientStatus, ConsistencyReport,
    DiffEntry, ServerReport, SignalLevel, StoredRow, UnitKind, UnitStatus,
};

/// Signal computation for one client, with snapshot availability.
#[derive(Debug, Clone)]
pub struct SignalComputation {
    pub signal: AutohealSignal,
    pub snapshot_known: bool,
}

pub struct ConsistencyReporter {
    store: Arc<SqliteStore>,
    config: Arc<Config>,
}

impl ConsistencyReporter {
    pub fn new(store: Arc<SqliteStore>, config: Arc<Config>) -> Self {
        Self { store, config }
    }

    /// Record a client's checksum snapshot.
    pub fn record_snapshot(&self, snapshot: &ClientSnapshot) -> Result<()> {
        let payload = serde_json::to_value(snapshot)?;
        self.store.insert_diagnostic(
            &snapshot.client_id,
            "client_snapshot",
            &payload,
            snapshot.snapshot_at,
        )?;
        Ok(())
    }

    /// Server-side checksum units: every registry table, plus one unit per
    /// entity type covering its slice of `entities`.
    pub fn server_units(&self) -> Result<Vec<ChecksumUnit>> {
        let mut units = Vec::new();
        for entry in TableRegistry::global().entries() {
            let rows = self.store.all_rows(entry.name)?;
            units.push(ChecksumUnit {
                kind: UnitKind::Table,
                name: entry.name.to_string(),
                checksum: checksum_rows(rows.iter()),
                row_count: rows.len() as u64,
            });
            if entry.name == "entities" {
                let mut by_type: BTreeMap<String, Vec<&StoredRow>> = BTreeMap::new();
                for row in &rows {
                    let type_id = row.payload_str("type_id").unwrap_or("").to_string();
                    by_type.entry(type_id).or_default().push(row);
                }
                for (type_id, grouped) in by_type {
                    units.push(ChecksumUnit {
                        kind: UnitKind::EntityType,
                        name: type_id,
                        checksum: checksum_rows(grouped.iter().copied()),
                        row_count: grouped.len() as u64,
                    });
                }
            }
        }
        Ok(units)
    }

    /// Full consistency report across all known clients.
    pub fn report(&self) -> Result<ConsistencyReport> {
        let server_units = self.server_units()?;
        let server_seq = self.store.max_seq()?;
        let mut clients = Vec::new();
        for client_id in self.store.list_client_ids()? {
            clients.push(self.client_report(&client_id, &server_units)?);
        }
        Ok(ConsistencyReport {
            server: ServerReport {
                source: "ledger".into(),
                server_seq,
            },
            clients,
        })
    }

    fn client_report(
        &self,
        client_id: &str,
        server_units: &[ChecksumUnit],
    ) -> Result<ClientReport> {
        let snapshot = self.load_snapshot(client_id)?;
        let diffs = compare_units(server_units, snapshot.as_ref());
        let status = diffs
            .iter()
            .fold(ClientStatus::Ok, |acc, d| match (acc, d.status) {
                (_, UnitStatus::Drift) | (ClientStatus::Drift, _) => ClientStatus::Drift,
                (_, UnitStatus::Warning) | (ClientStatus::Warning, _) => ClientStatus::Warning,
                (acc, _) => acc,
            });
        let last_pulled = self
            .store
            .get_client_state(client_id)?
            .map_or(0, |s| s.last_pulled_server_seq);
        Ok(ClientReport {
            client_id: client_id.to_string(),
            status,
            snapshot_at: snapshot.map(|s| s.snapshot_at),
            last_pulled_server_seq: last_pulled,
            diffs,
        })
    }

    fn load_snapshot(&self, client_id: &str) -> Result<Option<ClientSnapshot>> {
        Ok(self
            .store
            .latest_snapshot(client_id)?
            .and_then(|d| serde_json::from_value(d.payload).ok()))
    }

    /// Compute the aggregated autoheal signal for one client.
    pub fn evaluate_signal(&self, client_id: &str) -> Result<SignalComputation> {
        let server_units = self.server_units()?;
        let server_seq = self.store.max_seq()?;
        let snapshot = self.load_snapshot(client_id)?;
        let snapshot_known = snapshot.is_some();
        let diffs = compare_units(&server_units, snapshot.as_ref());

        let last_pulled = self
            .store
            .get_client_state(client_id)?
            .map_or(0, |s| s.last_pulled_server_seq);
        let signal = compute_signal(
            &diffs,
            server_seq,
            last_pulled,
            self.config.drift_threshold,
            self.config.autoheal.observe_ratio,
            self.config.autoheal.degraded_ratio,
            self.config.autoheal.critical_ratio,
        );
        debug!(
            "Signal for {}: level={} d={} w={} lag={}",
            client_id,
            signal.level.as_str(),
            signal.drift_count,
            signal.warning_count,
            signal.lag
        );
        Ok(SignalComputation {
            signal,
            snapshot_known,
        })
    }
}

/// SHA-256 over `id:updated_at:deleted_at` lines in id order.
fn checksum_rows<'a>(rows: impl Iterator<Item = &'a StoredRow>) -> String {
    let mut hasher = Sha256::new();
    for row in rows {
        let deleted = row
            .deleted_at
            .map(|n| n.to_string())
            .unwrap_or_else(|| "-".into());
        hasher.update(format!("{}:{}:{}\n", row.id, row.updated_at, deleted).as_bytes());
    }
    hex::encode(hasher.finalize())
}

/// Compare server units against a client snapshot.
fn compare_units(
    server_units: &[ChecksumUnit],
    snapshot: Option<&ClientSnapshot>,
) -> Vec<DiffEntry> {
    let client: BTreeMap<(UnitKind, &str), &ChecksumUnit> = snapshot
        .map(|s| {
            s.units
                .iter()
                .map(|u| ((u.kind, u.name.as_str()), u))
                .collect()
        })
        .unwrap_or_default();

    server_units
        .iter()
        .map(|unit| {
            let status = match client.get(&(unit.kind, unit.name.as_str())) {
                None => UnitStatus::Unknown,
                Some(theirs) if theirs.checksum == unit.checksum => UnitStatus::Ok,
                Some(theirs) if theirs.row_count == unit.row_count => UnitStatus::Warning,
                Some(_) => UnitStatus::Drift,
            };
            DiffEntry {
                kind: unit.kind,
                name: unit.name.clone(),
                status,
            }
        })
        .collect()
}

/// Aggregate diffs and cursor lag into a signal level.
fn compute_signal(
    diffs: &[DiffEntry],
    server_seq: i64,
    last_pulled: i64,
    drift_threshold: u32,
    observe_ratio: f64,
    degraded_ratio: f64,
    critical_ratio: f64,
) -> AutohealSignal {
    let d = diffs.iter().filter(|e| e.status == UnitStatus::Drift).count() as u32;
    let w = diffs
        .iter()
        .filter(|e| e.status == UnitStatus::Warning)
        .count() as u32;
    let u = diffs
        .iter()
        .filter(|e| e.status == UnitStatus::Unknown)
        .count() as u32;
    let c = diffs.len() as u32 - u;

    let lag = (server_seq - last_pulled).max(0);
    let lag_ratio = lag as f64 / server_seq.max(1) as f64;
    let ratio = |n: u32| {
        if c == 0 {
            0.0
        } else {
            n as f64 / c as f64
        }
    };
    let dw_ratio = ratio(d + w);

    let level = if ratio(d) >= critical_ratio
        || d >= (3 * drift_threshold).max(8)
        || (lag > 25_000 && lag_ratio >= 0.25 && dw_ratio >= observe_ratio.max(0.08))
    {
        SignalLevel::Critical
    } else if ratio(d) >= degraded_ratio
        || d >= (2 * drift_threshold).max(4)
        || (lag > 12_000 && dw_ratio >= observe_ratio)
    {
        SignalLevel::Degraded
    } else if ratio(d) >= observe_ratio
        || ratio(w) >= 0.3
        || w >= (3 * drift_threshold).max(6)
        || (lag > 5_000 && d + w > 0)
    {
        SignalLevel::Observe
    } else {
        SignalLevel::Normal
    };

    AutohealSignal {
        level,
        drift_count: d,
        warning_count: w,
        unknown_count: u,
        comparable_count: c,
        lag,
        lag_ratio,
        fingerprint: fingerprint(diffs),
        computed_at: chrono::Utc::now().timestamp_millis(),
    }
}

/// SHA-1 over the lexically sorted non-ok diff triples; identical symptom
/// sets map to identical fingerprints regardless of diff order.
pub fn fingerprint(diffs: &[DiffEntry]) -> String {
    let mut triples: Vec<String> = diffs
        .iter()
        .filter(|e| e.status != UnitStatus::Ok)
        .map(|e| format!("{}:{}:{}", e.kind.as_str(), e.name, e.status.as_str()))
        .collect();
    triples.sort();
    let joined = if triples.is_empty() {
        "empty".to_string()
    } else {
        triples.join("|")
    };
    let mut hasher = Sha1::new();
    Sha1Digest::update(&mut hasher, joined.as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn diff(kind: UnitKind, name: &str, status: UnitStatus) -> DiffEntry {
        DiffEntry {
            kind,
            name: name.to_string(),
            status,
        }
    }

    fn unit(kind: UnitKind, name: &str, checksum: &str, row_count: u64) -> ChecksumUnit {
        ChecksumUnit {
            kind,
            name: name.to_string(),
            checksum: checksum.to_string(),
            row_count,
        }
    }

    #[test]
    fn test_compare_units_verdicts() {
        let server = vec![
            unit(UnitKind::Table, "notes", "aaa", 3),
            unit(UnitKind::Table, "entities", "bbb", 5),
            unit(UnitKind::Table, "operations", "ccc", 2),
            unit(UnitKind::Table, "audit_log", "ddd", 1),
        ];
        let snapshot = ClientSnapshot {
            client_id: "c1".into(),
            snapshot_at: 1000,
            units: vec![
                unit(UnitKind::Table, "notes", "aaa", 3),
                unit(UnitKind::Table, "entities", "zzz", 5),
                unit(UnitKind::Table, "operations", "yyy", 9),
            ],
        };
        let diffs = compare_units(&server, Some(&snapshot));
        assert_eq!(diffs[0].status, UnitStatus::Ok);
        assert_eq!(diffs[1].status, UnitStatus::Warning);
        assert_eq!(diffs[2].status, UnitStatus::Drift);
        assert_eq!(diffs[3].status, UnitStatus::Unknown);
    }

    #[test]
    fn test_signal_levels_from_ratios() {
        let mut diffs: Vec<DiffEntry> = (0..10)
            .map(|i| diff(UnitKind::Table, &format!("t{i}"), UnitStatus::Ok))
            .collect();
        let base = compute_signal(&diffs, 100, 100, 2, 0.08, 0.15, 0.35);
        assert_eq!(base.level, SignalLevel::Normal);

        diffs[0].status = UnitStatus::Drift;
        // 1/10 drift: above observe (0.08), below degraded (0.15).
        let observed = compute_signal(&diffs, 100, 100, 2, 0.08, 0.15, 0.35);
        assert_eq!(observed.level, SignalLevel::Observe);

        diffs[1].status = UnitStatus::Drift;
        let degraded = compute_signal(&diffs, 100, 100, 2, 0.08, 0.15, 0.35);
        assert_eq!(degraded.level, SignalLevel::Degraded);

        diffs[2].status = UnitStatus::Drift;
        diffs[3].status = UnitStatus::Drift;
        // 4/10 drift: above critical (0.35).
        let critical = compute_signal(&diffs, 100, 100, 2, 0.08, 0.15, 0.35);
        assert_eq!(critical.level, SignalLevel::Critical);
    }

    #[test]
    fn test_lag_rules() {
        let diffs = vec![
            diff(UnitKind::Table, "a", UnitStatus::Warning),
            diff(UnitKind::Table, "b", UnitStatus::Ok),
        ];
        // Lag above 5000 with a non-ok diff observes.
        let signal = compute_signal(&diffs, 10_000, 1_000, 2, 0.08, 0.15, 0.35);
        assert_eq!(signal.lag, 9_000);
        assert!(signal.level >= SignalLevel::Observe);

        // Huge lag and ratio with warnings escalates to critical.
        let signal = compute_signal(&diffs, 100_000, 1_000, 2, 0.08, 0.15, 0.35);
        assert_eq!(signal.level, SignalLevel::Critical);

        // No diffs at all: lag alone stays normal.
        let ok = vec![diff(UnitKind::Table, "a", UnitStatus::Ok)];
        let signal = compute_signal(&ok, 100_000, 1_000, 2, 0.08, 0.15, 0.35);
        assert_eq!(signal.level, SignalLevel::Normal);
    }

    #[test]
    fn test_absolute_drift_counts() {
        // 8 drifting units out of many comparables trip critical even at a
        // low ratio.
        let mut diffs: Vec<DiffEntry> = (0..100)
            .map(|i| diff(UnitKind::Table, &format!("t{i}"), UnitStatus::Ok))
            .collect();
        for item in diffs.iter_mut().take(8) {
            item.status = UnitStatus::Drift;
        }
        let signal = compute_signal(&diffs, 100, 100, 2, 0.08, 0.15, 0.35);
        assert_eq!(signal.level, SignalLevel::Critical);
    }

    #[test]
    fn test_fingerprint_stable_under_order() {
        let a = vec![
            diff(UnitKind::Table, "notes", UnitStatus::Drift),
            diff(UnitKind::EntityType, "t1", UnitStatus::Warning),
        ];
        let b = vec![
            diff(UnitKind::EntityType, "t1", UnitStatus::Warning),
            diff(UnitKind::Table, "notes", UnitStatus::Drift),
        ];
        assert_eq!(fingerprint(&a), fingerprint(&b));
        assert_ne!(fingerprint(&a), fingerprint(&[]));

        // Ok diffs do not contribute.
        let with_ok = vec![
            diff(UnitKind::Table, "notes", UnitStatus::Drift),
            diff(UnitKind::EntityType, "t1", UnitStatus::Warning),
            diff(UnitKind::Table, "audit_log", UnitStatus::Ok),
        ];
        assert_eq!(fingerprint(&a), fingerprint(&with_ok));
    }

    #[test]
    fn test_empty_fingerprint_is_stable() {
        assert_eq!(fingerprint(&[]), fingerprint(&[]));
        let ok_only = vec![diff(UnitKind::Table, "notes", UnitStatus::Ok)];
        assert_eq!(fingerprint(&[]), fingerprint(&ok_only));
    }
}
